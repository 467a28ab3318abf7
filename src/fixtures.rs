// 🧪 Synthetic Fixtures - seeded customers and their bronze source extracts
//
// Customers overlap across systems the way real estates do: core banking
// holds the first 40%, Salesforce the first 60%, Fiserv the 25%–75% band.
// Salesforce and Fiserv copies carry small mutations so that resolution has
// something to do. Every record keeps its ground-truth customer index.

use crate::ingest::{read_records, SourceLayout};
use crate::model::SourceRecord;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use csv::WriterBuilder;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

const FIRST_NAMES: &[&str] = &[
    "James", "Mary", "Robert", "Patricia", "John", "Jennifer", "Michael", "Linda", "David", "Elizabeth",
    "William", "Barbara", "Richard", "Susan", "Joseph", "Jessica", "Thomas", "Sarah", "Carlos", "Maria",
    "Wei", "Priya", "Ahmed", "Yuki", "Olga",
];

const LAST_NAMES: &[&str] = &[
    "Smith", "Johnson", "Williams", "Brown", "Jones", "Garcia", "Miller", "Davis", "Rodriguez", "Martinez",
    "Hernandez", "Lopez", "Gonzalez", "Wilson", "Anderson", "Thomas", "Taylor", "Moore", "Jackson", "Martin",
    "Lee", "Chen", "Patel", "Kim", "Nguyen",
];

const PLACES: &[(&str, &str)] = &[
    ("TX", "Austin"),
    ("TX", "Dallas"),
    ("CA", "San Francisco"),
    ("CA", "Los Angeles"),
    ("NY", "New York"),
    ("NY", "Buffalo"),
    ("FL", "Miami"),
    ("IL", "Chicago"),
    ("WA", "Seattle"),
    ("GA", "Atlanta"),
];

const STREETS: &[&str] = &["Main", "Oak", "Elm", "Maple", "Pine", "Cedar", "Walnut", "Park", "Lake", "River"];
const STREET_TYPES: &[&str] = &["St", "Ave", "Blvd", "Dr", "Ln", "Way", "Ct"];
const EMAIL_DOMAINS: &[&str] = &["gmail.com", "yahoo.com", "outlook.com", "icloud.com", "proton.me"];
const SEGMENTS: &[&str] = &["mass_market", "mass_affluent", "affluent", "high_net_worth"];
const RISK_TIERS: &[&str] = &["prime", "near_prime", "subprime"];
const CHANNELS: &[&str] = &["branch", "online", "referral", "partner"];

// Mutation rates
const SFDC_EMAIL_MUTATION: f64 = 0.15;
const SFDC_PHONE_MUTATION: f64 = 0.10;
const FISERV_ABBREVIATED_NAME: f64 = 0.08;
const FISERV_UPPERCASE_EMAIL: f64 = 0.20;

/// The real-world person behind a set of source records
#[derive(Debug, Clone)]
pub struct Customer {
    pub customer_id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub date_of_birth: String,
    pub ssn_hash: String,
    pub address_line1: String,
    pub city: String,
    pub state: String,
    pub zip_code: String,
    pub segment: String,
    pub risk_tier: String,
    pub fico: u32,
    pub channel: String,
    pub acquired_on: String,
}

/// One source system's export: header, rows and the customer behind each row
#[derive(Debug, Clone)]
pub struct SourceExtract {
    pub layout: SourceLayout,
    pub header: Vec<&'static str>,
    pub rows: Vec<Vec<String>>,
    pub truth: Vec<usize>,
}

impl SourceExtract {
    fn new(layout: SourceLayout, header: Vec<&'static str>) -> Self {
        SourceExtract {
            layout,
            header,
            rows: Vec::new(),
            truth: Vec::new(),
        }
    }

    pub fn write_csv<W: std::io::Write>(&self, writer: W) -> Result<()> {
        let mut writer = WriterBuilder::new().from_writer(writer);
        writer.write_record(&self.header)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Run the extract through its adapter, as an import would
    pub fn source_records(&self, ingested_at: DateTime<Utc>) -> Result<Vec<SourceRecord>> {
        let mut buf = Vec::new();
        self.write_csv(&mut buf)?;
        let (_, records) = read_records(buf.as_slice(), Some(self.layout), ingested_at)?;
        Ok(records)
    }
}

#[derive(Debug, Clone)]
pub struct FixtureSet {
    pub customers: Vec<Customer>,
    pub extracts: Vec<SourceExtract>,
}

impl FixtureSet {
    /// Same seed, same data
    pub fn generate(customers: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let customers: Vec<Customer> = (1..=customers).map(|i| generate_customer(&mut rng, i)).collect();

        let n = customers.len();
        let core = core_extract(&customers[..n * 40 / 100]);
        let sfdc = salesforce_extract(&mut rng, &customers[..n * 60 / 100]);
        let fiserv = fiserv_extract(&mut rng, &customers, n * 25 / 100, n * 75 / 100);

        FixtureSet {
            customers,
            extracts: vec![core, sfdc, fiserv],
        }
    }

    /// All records plus record_id → customer index
    pub fn source_records(&self, ingested_at: DateTime<Utc>) -> Result<(Vec<SourceRecord>, HashMap<String, usize>)> {
        let mut all = Vec::new();
        let mut truth = HashMap::new();
        for extract in &self.extracts {
            let records = extract.source_records(ingested_at)?;
            for (record, &customer) in records.iter().zip(&extract.truth) {
                truth.insert(record.record_id.clone(), customer);
            }
            all.extend(records);
        }
        Ok((all, truth))
    }

    /// Write one CSV per source system into `dir`
    pub fn write_dir(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        let mut paths = Vec::new();
        for extract in &self.extracts {
            let path = dir.join(format!("{}.csv", extract.layout.system()));
            let file = fs::File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?;
            extract.write_csv(file)?;
            paths.push(path);
        }
        Ok(paths)
    }
}

fn short_hash(input: &str, len: usize) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect::<String>()[..len].to_string()
}

fn pick<'a>(rng: &mut StdRng, items: &[&'a str]) -> &'a str {
    items[rng.gen_range(0..items.len())]
}

fn generate_customer(rng: &mut StdRng, i: usize) -> Customer {
    let first = pick(rng, FIRST_NAMES);
    let last = pick(rng, LAST_NAMES);
    let (state, city) = PLACES[rng.gen_range(0..PLACES.len())];

    let dob = NaiveDate::from_ymd_opt(1955, 1, 1).unwrap_or(NaiveDate::MIN) + Duration::days(rng.gen_range(0..17_500));
    let acquired = NaiveDate::from_ymd_opt(2018, 1, 1).unwrap_or(NaiveDate::MIN) + Duration::days(rng.gen_range(0..2_400));

    Customer {
        customer_id: format!("CUST-{:05}", i),
        first_name: first.to_string(),
        last_name: last.to_string(),
        email: format!(
            "{}.{}{}@{}",
            first.to_lowercase(),
            last.to_lowercase(),
            rng.gen_range(1..100),
            pick(rng, EMAIL_DOMAINS)
        ),
        phone: format!("+1{}{}", rng.gen_range(200..1000), rng.gen_range(1_000_000..10_000_000)),
        date_of_birth: dob.format("%Y-%m-%d").to_string(),
        ssn_hash: short_hash(&format!("SSN-{:09}", i), 16),
        address_line1: format!(
            "{} {} {}",
            rng.gen_range(100..10_000),
            pick(rng, STREETS),
            pick(rng, STREET_TYPES)
        ),
        city: city.to_string(),
        state: state.to_string(),
        zip_code: format!("{}", rng.gen_range(10_000..100_000)),
        segment: pick(rng, SEGMENTS).to_string(),
        risk_tier: pick(rng, RISK_TIERS).to_string(),
        fico: rng.gen_range(580..850),
        channel: pick(rng, CHANNELS).to_string(),
        acquired_on: acquired.format("%Y-%m-%d").to_string(),
    }
}

fn customer_index(c: &Customer) -> usize {
    c.customer_id
        .trim_start_matches("CUST-")
        .parse::<usize>()
        .map(|n| n - 1)
        .unwrap_or_default()
}

fn core_extract(customers: &[Customer]) -> SourceExtract {
    let mut extract = SourceExtract::new(
        SourceLayout::CoreBanking,
        vec![
            "CIF_NUM", "CUST_NAME", "SSN_HASH", "DOB", "ADDR1", "CITY", "STATE", "ZIP", "PHONE", "EMAIL",
            "ACCT_OPEN_DT", "STATUS_CD", "FICO",
        ],
    );
    for c in customers {
        extract.rows.push(vec![
            c.customer_id.replace("CUST", "CIF"),
            format!("{}, {}", c.last_name, c.first_name).to_uppercase(),
            c.ssn_hash.clone(),
            c.date_of_birth.clone(),
            c.address_line1.to_uppercase(),
            c.city.to_uppercase(),
            c.state.clone(),
            c.zip_code.clone(),
            c.phone.replace("+1", ""),
            c.email.clone(),
            c.acquired_on.clone(),
            "A".to_string(),
            c.fico.to_string(),
        ]);
        extract.truth.push(customer_index(c));
    }
    extract
}

fn salesforce_extract(rng: &mut StdRng, customers: &[Customer]) -> SourceExtract {
    let mut extract = SourceExtract::new(
        SourceLayout::Salesforce,
        vec![
            "AccountId", "FirstName", "LastName", "PersonEmail", "Phone", "MailingStreet", "MailingCity",
            "MailingState", "MailingPostalCode", "Segment__c", "Lead_Source__c", "CreatedDate",
        ],
    );
    for c in customers {
        let mut email = c.email.clone();
        if rng.gen_bool(SFDC_EMAIL_MUTATION) {
            email = email.replacen('@', &format!("{}@", rng.gen_range(1..10)), 1);
        }
        let mut phone = c.phone.clone();
        if rng.gen_bool(SFDC_PHONE_MUTATION) {
            phone.pop();
            phone.push_str(&rng.gen_range(0..10).to_string());
        }

        extract.rows.push(vec![
            format!("001{}", short_hash(&c.customer_id, 12)),
            c.first_name.clone(),
            c.last_name.clone(),
            email,
            phone,
            c.address_line1.clone(),
            c.city.clone(),
            c.state.clone(),
            c.zip_code.clone(),
            c.segment.clone(),
            c.channel.clone(),
            c.acquired_on.clone(),
        ]);
        extract.truth.push(customer_index(c));
    }
    extract
}

fn fiserv_extract(rng: &mut StdRng, customers: &[Customer], from: usize, to: usize) -> SourceExtract {
    let mut extract = SourceExtract::new(
        SourceLayout::Fiserv,
        vec![
            "PARTY_ID", "FULL_NAME", "EMAIL_ADDR", "PHONE_NUM", "STREET_ADDR", "CITY_NAME", "STATE_CODE",
            "POSTAL_CODE", "RISK_RATING", "CREDIT_SCORE", "ONBOARD_DATE",
        ],
    );
    for (offset, c) in customers[from..to].iter().enumerate() {
        let name = if rng.gen_bool(FISERV_ABBREVIATED_NAME) {
            format!("{}. {}", &c.first_name[..1], c.last_name)
        } else {
            format!("{} {}", c.first_name, c.last_name)
        };
        let email = if rng.gen_bool(FISERV_UPPERCASE_EMAIL) {
            c.email.to_uppercase()
        } else {
            c.email.clone()
        };

        extract.rows.push(vec![
            format!("FSV{}", 100_000 + from + offset),
            name,
            email,
            c.phone.clone(),
            c.address_line1.clone(),
            c.city.clone(),
            c.state.clone(),
            c.zip_code.clone(),
            c.risk_tier.to_uppercase(),
            c.fico.to_string(),
            c.acquired_on.clone(),
        ]);
        extract.truth.push(customer_index(c));
    }
    extract
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_is_seeded() {
        let a = FixtureSet::generate(40, 7);
        let b = FixtureSet::generate(40, 7);
        assert_eq!(a.extracts[1].rows, b.extracts[1].rows);
        assert_eq!(a.extracts[2].rows, b.extracts[2].rows);
    }

    #[test]
    fn test_overlapping_coverage() {
        let set = FixtureSet::generate(100, 1);
        assert_eq!(set.extracts[0].rows.len(), 40);
        assert_eq!(set.extracts[1].rows.len(), 60);
        assert_eq!(set.extracts[2].rows.len(), 50);
        assert_eq!(set.extracts[2].truth[0], 25);
    }

    #[test]
    fn test_records_carry_truth() {
        let set = FixtureSet::generate(20, 3);
        let (records, truth) = set.source_records(Utc::now()).unwrap();
        assert_eq!(records.len(), 8 + 12 + 10);
        assert_eq!(truth["core_banking:CIF-00001"], 0);

        let first = &set.customers[0];
        let core = records.iter().find(|r| r.record_id == "core_banking:CIF-00001").unwrap();
        assert_eq!(core.field("last_name"), Some(first.last_name.to_uppercase().as_str()));
        println!("✅ {} fixture records with ground truth", records.len());
    }
}
