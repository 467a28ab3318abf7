// 📥 Source Layout Adapters - bronze CSV extracts → SourceRecord
//
// Each source system exports customers in its own column layout. Adapters
// only rename and split columns; cleaning is the normalizer's job. Columns an
// adapter doesn't know are carried through as extra fields.

use crate::model::{fields, SourceRecord};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

// ============================================================================
// LAYOUTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceLayout {
    CoreBanking,
    Salesforce,
    Fiserv,
    /// record_id, source_system, then one column per canonical field
    Canonical,
}

impl SourceLayout {
    pub const ALL: [SourceLayout; 4] = [
        SourceLayout::CoreBanking,
        SourceLayout::Salesforce,
        SourceLayout::Fiserv,
        SourceLayout::Canonical,
    ];

    /// Source system name written on every record
    pub fn system(&self) -> &'static str {
        match self {
            SourceLayout::CoreBanking => "core_banking",
            SourceLayout::Salesforce => "salesforce",
            SourceLayout::Fiserv => "fiserv",
            SourceLayout::Canonical => "canonical",
        }
    }

    pub fn parse(s: &str) -> Option<SourceLayout> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "core_banking" | "core" => Some(SourceLayout::CoreBanking),
            "salesforce" | "sfdc" => Some(SourceLayout::Salesforce),
            "fiserv" => Some(SourceLayout::Fiserv),
            "canonical" => Some(SourceLayout::Canonical),
            _ => None,
        }
    }

    /// Column that identifies the layout
    fn id_column(&self) -> &'static str {
        match self {
            SourceLayout::CoreBanking => "CIF_NUM",
            SourceLayout::Salesforce => "AccountId",
            SourceLayout::Fiserv => "PARTY_ID",
            SourceLayout::Canonical => "record_id",
        }
    }

    /// Pick the layout from a header row
    pub fn detect(headers: &StringRecord) -> Option<SourceLayout> {
        Self::ALL
            .into_iter()
            .find(|layout| headers.iter().any(|h| h.trim() == layout.id_column()))
    }

    pub fn adapter(&self) -> Box<dyn SourceAdapter> {
        match self {
            SourceLayout::CoreBanking => Box::new(CoreBankingAdapter),
            SourceLayout::Salesforce => Box::new(SalesforceAdapter),
            SourceLayout::Fiserv => Box::new(FiservAdapter),
            SourceLayout::Canonical => Box::new(CanonicalAdapter),
        }
    }
}

// ============================================================================
// ROW
// ============================================================================

/// One CSV row keyed by header; values are trimmed and empty cells dropped
#[derive(Debug, Default)]
pub struct Row {
    columns: BTreeMap<String, String>,
}

impl Row {
    pub fn new(headers: &StringRecord, record: &StringRecord) -> Self {
        let columns = headers
            .iter()
            .zip(record.iter())
            .filter_map(|(h, v)| {
                let v = v.trim();
                (!v.is_empty()).then(|| (h.trim().to_string(), v.to_string()))
            })
            .collect();
        Row { columns }
    }

    /// Remove and return a column's value
    pub fn take(&mut self, column: &str) -> Option<String> {
        self.columns.remove(column)
    }

    /// Whatever no adapter mapping claimed
    pub fn into_remaining(self) -> BTreeMap<String, String> {
        self.columns
    }
}

/// `Lead_Source__c` → `lead_source`
fn extra_field_name(column: &str) -> String {
    column.trim_end_matches("__c").to_ascii_lowercase()
}

/// Build a record from mapped columns plus any extras left on the row
fn build_record(
    system: &str,
    local_id: &str,
    mapped: Vec<(&str, Option<String>)>,
    row: Row,
    ingested_at: DateTime<Utc>,
) -> SourceRecord {
    let mut record = SourceRecord::new(format!("{}:{}", system, local_id), system, ingested_at);
    for (field, value) in mapped {
        if let Some(value) = value {
            record = record.with_field(field, value);
        }
    }
    for (column, value) in row.into_remaining() {
        record = record.with_field(extra_field_name(&column), value);
    }
    record
}

// ============================================================================
// ADAPTERS
// ============================================================================

pub trait SourceAdapter: Send + Sync {
    fn layout(&self) -> SourceLayout;

    /// Map one row onto canonical fields
    fn map_row(&self, row: Row, ingested_at: DateTime<Utc>) -> Result<SourceRecord>;
}

/// Core banking: `CUST_NAME` is "LAST, FIRST"
pub struct CoreBankingAdapter;

impl SourceAdapter for CoreBankingAdapter {
    fn layout(&self) -> SourceLayout {
        SourceLayout::CoreBanking
    }

    fn map_row(&self, mut row: Row, ingested_at: DateTime<Utc>) -> Result<SourceRecord> {
        let id = row.take("CIF_NUM").ok_or_else(|| anyhow!("missing CIF_NUM"))?;
        let (first, last) = match row.take("CUST_NAME") {
            Some(name) => match name.split_once(',') {
                Some((last, first)) => (Some(first.trim().to_string()), Some(last.trim().to_string())),
                None => (None, Some(name)),
            },
            None => (None, None),
        };

        let mapped = vec![
            (fields::FIRST_NAME, first),
            (fields::LAST_NAME, last),
            (fields::SSN_HASH, row.take("SSN_HASH")),
            (fields::DATE_OF_BIRTH, row.take("DOB")),
            (fields::ADDRESS_LINE1, row.take("ADDR1")),
            (fields::CITY, row.take("CITY")),
            (fields::STATE, row.take("STATE")),
            (fields::ZIP_CODE, row.take("ZIP")),
            (fields::PHONE, row.take("PHONE")),
            (fields::EMAIL, row.take("EMAIL")),
            ("account_open_date", row.take("ACCT_OPEN_DT")),
            ("status", row.take("STATUS_CD")),
            ("credit_score", row.take("FICO")),
        ];
        Ok(build_record(self.layout().system(), &id, mapped, row, ingested_at))
    }
}

pub struct SalesforceAdapter;

impl SourceAdapter for SalesforceAdapter {
    fn layout(&self) -> SourceLayout {
        SourceLayout::Salesforce
    }

    fn map_row(&self, mut row: Row, ingested_at: DateTime<Utc>) -> Result<SourceRecord> {
        let id = row.take("AccountId").ok_or_else(|| anyhow!("missing AccountId"))?;
        let mapped = vec![
            (fields::FIRST_NAME, row.take("FirstName")),
            (fields::LAST_NAME, row.take("LastName")),
            (fields::EMAIL, row.take("PersonEmail")),
            (fields::PHONE, row.take("Phone")),
            (fields::ADDRESS_LINE1, row.take("MailingStreet")),
            (fields::CITY, row.take("MailingCity")),
            (fields::STATE, row.take("MailingState")),
            (fields::ZIP_CODE, row.take("MailingPostalCode")),
            ("created_date", row.take("CreatedDate")),
        ];
        Ok(build_record(self.layout().system(), &id, mapped, row, ingested_at))
    }
}

/// Fiserv: `FULL_NAME` is "First Last" or "F. Last"
pub struct FiservAdapter;

impl SourceAdapter for FiservAdapter {
    fn layout(&self) -> SourceLayout {
        SourceLayout::Fiserv
    }

    fn map_row(&self, mut row: Row, ingested_at: DateTime<Utc>) -> Result<SourceRecord> {
        let id = row.take("PARTY_ID").ok_or_else(|| anyhow!("missing PARTY_ID"))?;
        let (first, last) = match row.take("FULL_NAME") {
            Some(name) => match name.trim().rsplit_once(char::is_whitespace) {
                Some((first, last)) => (Some(first.trim().to_string()), Some(last.to_string())),
                None => (None, Some(name)),
            },
            None => (None, None),
        };

        let mapped = vec![
            (fields::FIRST_NAME, first),
            (fields::LAST_NAME, last),
            (fields::EMAIL, row.take("EMAIL_ADDR")),
            (fields::PHONE, row.take("PHONE_NUM")),
            (fields::ADDRESS_LINE1, row.take("STREET_ADDR")),
            (fields::CITY, row.take("CITY_NAME")),
            (fields::STATE, row.take("STATE_CODE")),
            (fields::ZIP_CODE, row.take("POSTAL_CODE")),
            ("onboard_date", row.take("ONBOARD_DATE")),
        ];
        Ok(build_record(self.layout().system(), &id, mapped, row, ingested_at))
    }
}

/// Already canonical; ids are taken as-is
pub struct CanonicalAdapter;

impl SourceAdapter for CanonicalAdapter {
    fn layout(&self) -> SourceLayout {
        SourceLayout::Canonical
    }

    fn map_row(&self, mut row: Row, ingested_at: DateTime<Utc>) -> Result<SourceRecord> {
        let id = row.take("record_id").ok_or_else(|| anyhow!("missing record_id"))?;
        let system = row
            .take("source_system")
            .ok_or_else(|| anyhow!("missing source_system for {}", id))?;
        let ingested_at = match row.take("ingested_at") {
            Some(ts) => DateTime::parse_from_rfc3339(&ts)
                .with_context(|| format!("bad ingested_at '{}' for {}", ts, id))?
                .with_timezone(&Utc),
            None => ingested_at,
        };

        let mut record = SourceRecord::new(id, system, ingested_at);
        for (column, value) in row.into_remaining() {
            record = record.with_field(column, value);
        }
        Ok(record)
    }
}

// ============================================================================
// READING & WRITING
// ============================================================================

/// Parse a CSV stream; the layout is detected from the header unless given
pub fn read_records<R: Read>(
    reader: R,
    layout: Option<SourceLayout>,
    ingested_at: DateTime<Utc>,
) -> Result<(SourceLayout, Vec<SourceRecord>)> {
    let mut reader = ReaderBuilder::new().has_headers(true).flexible(true).from_reader(reader);
    let headers = reader.headers().context("Failed to read CSV header")?.clone();

    let layout = match layout {
        Some(layout) => layout,
        None => SourceLayout::detect(&headers)
            .ok_or_else(|| anyhow!("Could not detect source layout from header: {:?}", headers))?,
    };
    let adapter = layout.adapter();

    let mut records = Vec::new();
    for (line_num, result) in reader.records().enumerate() {
        // +2: 1-indexed plus the header row
        let line = line_num + 2;
        let row = result.with_context(|| format!("Failed to parse CSV line {}", line))?;
        let record = adapter
            .map_row(Row::new(&headers, &row), ingested_at)
            .with_context(|| format!("Line {} ({})", line, layout.system()))?;
        records.push(record);
    }
    Ok((layout, records))
}

pub fn read_file(path: &Path, layout: Option<SourceLayout>) -> Result<(SourceLayout, Vec<SourceRecord>)> {
    let file = File::open(path).with_context(|| format!("Failed to open file: {}", path.display()))?;
    read_records(file, layout, Utc::now()).with_context(|| format!("Failed to import {}", path.display()))
}

/// Write records in the canonical layout; one column per field seen
pub fn write_canonical<W: Write>(writer: W, records: &[SourceRecord]) -> Result<()> {
    let columns: BTreeSet<&str> = records
        .iter()
        .flat_map(|r| r.fields.keys().map(String::as_str))
        .collect();

    let mut writer = WriterBuilder::new().from_writer(writer);
    let mut header = vec!["record_id", "source_system", "ingested_at"];
    header.extend(columns.iter().copied());
    writer.write_record(&header)?;

    for record in records {
        let ingested_at = record.ingested_at.to_rfc3339();
        let mut row = vec![record.record_id.as_str(), record.source_system.as_str(), ingested_at.as_str()];
        row.extend(columns.iter().map(|c| record.field(c).unwrap_or("")));
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(csv: &str) -> (SourceLayout, Vec<SourceRecord>) {
        read_records(csv.as_bytes(), None, Utc::now()).unwrap()
    }

    #[test]
    fn test_core_banking_layout() {
        let (layout, records) = parse(
            "CIF_NUM,CUST_NAME,SSN_HASH,DOB,ADDR1,CITY,STATE,ZIP,PHONE,EMAIL,ACCT_OPEN_DT,STATUS_CD,FICO\n\
             CIF-00001,\"SMITH, JOHN\",ab12,1980-01-01,1 Main St,Austin,TX,78701,512-555-0000,js@x.com,2019-04-01,A,720\n",
        );
        assert_eq!(layout, SourceLayout::CoreBanking);
        let r = &records[0];
        assert_eq!(r.record_id, "core_banking:CIF-00001");
        assert_eq!(r.field("first_name"), Some("JOHN"));
        assert_eq!(r.field("last_name"), Some("SMITH"));
        assert_eq!(r.field("zip_code"), Some("78701"));
        assert_eq!(r.field("credit_score"), Some("720"));
    }

    #[test]
    fn test_salesforce_layout_keeps_extras() {
        let (layout, records) = parse(
            "AccountId,FirstName,LastName,PersonEmail,Phone,Segment__c\n\
             001A,John,Smith,jsmith@x.com,5125550000,Retail\n",
        );
        assert_eq!(layout, SourceLayout::Salesforce);
        assert_eq!(records[0].record_id, "salesforce:001A");
        assert_eq!(records[0].field("email"), Some("jsmith@x.com"));
        assert_eq!(records[0].field("segment"), Some("Retail"));
    }

    #[test]
    fn test_fiserv_splits_full_name() {
        let (_, records) = parse(
            "PARTY_ID,FULL_NAME,EMAIL_ADDR,PHONE_NUM\n\
             P-1,J. Smith,JS@X.COM,5125550000\n\
             P-2,Maria Garcia,,\n",
        );
        assert_eq!(records[0].field("first_name"), Some("J."));
        assert_eq!(records[0].field("last_name"), Some("Smith"));
        assert_eq!(records[1].field("first_name"), Some("Maria"));
        // empty cells are absent, not empty strings
        assert_eq!(records[1].field("email"), None);
    }

    #[test]
    fn test_canonical_round_trip() {
        let at = DateTime::parse_from_rfc3339("2024-05-01T09:00:00+00:00").unwrap().with_timezone(&Utc);
        let records = vec![
            SourceRecord::new("a", "core_banking", at).with_field("last_name", "Smith"),
            SourceRecord::new("b", "fiserv", at).with_field("email", "x@y.com"),
        ];

        let mut buf = Vec::new();
        write_canonical(&mut buf, &records).unwrap();
        let (layout, back) = read_records(buf.as_slice(), None, Utc::now()).unwrap();

        assert_eq!(layout, SourceLayout::Canonical);
        assert_eq!(back, records);
    }

    #[test]
    fn test_missing_id_reports_line() {
        let err = read_records("CIF_NUM,CUST_NAME\n,\"DOE, JANE\"\n".as_bytes(), None, Utc::now()).unwrap_err();
        assert!(format!("{:#}", err).contains("Line 2"));
    }

    #[test]
    fn test_unknown_header_is_rejected() {
        assert!(read_records("foo,bar\n1,2\n".as_bytes(), None, Utc::now()).is_err());
        assert_eq!(SourceLayout::parse("Core-Banking"), Some(SourceLayout::CoreBanking));
    }
}
