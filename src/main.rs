// Only compile UI module when TUI feature is enabled
#[cfg(feature = "tui")]
mod ui;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use mdm_resolution::{
    read_file, PairKey, ResolutionConfig, ResolutionEngine, RunControl, SourceLayout, SqliteAuditLog, SqliteStore,
    StewardVerdict,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

type Engine = ResolutionEngine<SqliteStore, SqliteAuditLog>;

#[derive(Parser)]
#[command(name = "mdm-resolve", version, about = "Customer entity resolution and golden records")]
struct Cli {
    /// SQLite database (records, clusters, golden records, audit log)
    #[arg(long, env = "MDM_DB", default_value = "mdm.db", global = true)]
    db: PathBuf,

    /// Resolution config (JSON); defaults when omitted
    #[arg(long, env = "MDM_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load source CSV extracts (layout detected from the header)
    Import {
        files: Vec<PathBuf>,

        /// core_banking | salesforce | fiserv | canonical
        #[arg(long)]
        layout: Option<String>,
    },

    /// Resolve every record changed since the last run
    Resolve,

    /// Steward verdict on a pending review
    Decide {
        /// Pair as `a|b`
        #[arg(long)]
        pair: String,
        /// merge | reject
        #[arg(long)]
        verdict: String,
        #[arg(long)]
        steward: String,
    },

    /// Force a held merge through
    ConfirmConflict {
        conflict_id: String,
        #[arg(long)]
        steward: String,
    },

    /// Keep a held merge apart
    RejectConflict {
        conflict_id: String,
        #[arg(long)]
        steward: String,
    },

    /// Reverse one merge inside a cluster
    Unmerge {
        cluster_id: String,
        #[arg(long)]
        pair: String,
        #[arg(long)]
        steward: String,
    },

    /// Show golden records
    Golden {
        golden_id: Option<String>,

        /// Golden record holding this source record
        #[arg(long, conflicts_with = "golden_id")]
        record: Option<String>,

        /// Every version instead of the current one
        #[arg(long, requires = "golden_id")]
        history: bool,
    },

    /// Print audit entries after a sequence number
    Audit {
        #[arg(long, default_value_t = 0)]
        since: u64,
    },

    /// List pending reviews and open conflicts
    Reviews,

    /// Write seeded synthetic source extracts
    #[cfg(feature = "fixtures")]
    Generate {
        #[arg(long, default_value_t = 1000)]
        customers: usize,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        #[arg(long, default_value = "fixtures")]
        out: PathBuf,
        /// Import the generated files right away
        #[arg(long)]
        import: bool,
    },

    /// Steward review console
    Review {
        #[arg(long, env = "MDM_STEWARD")]
        steward: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Import { ref files, ref layout } => {
            let layout = layout
                .as_deref()
                .map(|l| SourceLayout::parse(l).ok_or_else(|| anyhow!("Unknown layout: {}", l)))
                .transpose()?;
            let mut engine = open_engine(&cli.db, cli.config.as_deref())?;
            run_import(&mut engine, files, layout)?;
        }
        Command::Resolve => {
            let mut engine = open_engine(&cli.db, cli.config.as_deref())?;
            run_resolve(&mut engine)?;
        }
        Command::Decide { ref pair, ref verdict, ref steward } => {
            let pair = parse_pair(pair)?;
            let verdict = StewardVerdict::parse(verdict).ok_or_else(|| anyhow!("Verdict must be merge or reject"))?;
            let mut engine = open_engine(&cli.db, cli.config.as_deref())?;
            let decision = engine.decide(&pair, verdict, steward)?;
            println!("✓ {} → {} by {}", pair, decision.outcome, steward);
        }
        Command::ConfirmConflict { ref conflict_id, ref steward } => {
            let mut engine = open_engine(&cli.db, cli.config.as_deref())?;
            engine.confirm_conflict(conflict_id, steward)?;
            println!("✓ Conflict {} confirmed; merge applied", conflict_id);
        }
        Command::RejectConflict { ref conflict_id, ref steward } => {
            let mut engine = open_engine(&cli.db, cli.config.as_deref())?;
            engine.reject_conflict(conflict_id, steward)?;
            println!("✓ Conflict {} rejected; records stay apart", conflict_id);
        }
        Command::Unmerge { ref cluster_id, ref pair, ref steward } => {
            let pair = parse_pair(pair)?;
            let mut engine = open_engine(&cli.db, cli.config.as_deref())?;
            let clusters = engine.unmerge(cluster_id, &pair, steward)?;
            println!("✓ Reversed {} in {}", pair, cluster_id);
            for id in clusters {
                println!("   → cluster {}", id);
            }
        }
        Command::Golden { ref golden_id, ref record, history } => {
            let engine = open_engine(&cli.db, cli.config.as_deref())?;
            match (golden_id, record) {
                (Some(id), _) if history => print_json(&engine.golden_history(id)?)?,
                (Some(id), _) => print_json(&engine.golden(id)?.ok_or_else(|| anyhow!("No golden record {}", id))?)?,
                (None, Some(record_id)) => print_json(
                    &engine
                        .golden_for_record(record_id)?
                        .ok_or_else(|| anyhow!("Record {} is not in any cluster", record_id))?,
                )?,
                (None, None) => print_json(&engine.current_goldens()?)?,
            }
        }
        Command::Audit { since } => {
            let engine = open_engine(&cli.db, cli.config.as_deref())?;
            for entry in engine.audit_since(since)? {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
        Command::Reviews => {
            let engine = open_engine(&cli.db, cli.config.as_deref())?;
            let reviews = engine.pending_reviews()?;
            println!("📋 {} pending reviews", reviews.len());
            for review in &reviews {
                println!("   {}  {:.3}  {}", review.pair(), review.score.composite, review.score.tier);
            }
            let conflicts = engine.open_conflicts()?;
            println!("⚠️  {} open conflicts", conflicts.len());
            for conflict in &conflicts {
                println!("   {}  ({} contradictions)", conflict.conflict_id, conflict.contradictions.len());
            }
        }
        #[cfg(feature = "fixtures")]
        Command::Generate { customers, seed, ref out, import } => {
            let set = mdm_resolution::fixtures::FixtureSet::generate(customers, seed);
            let paths = set.write_dir(out)?;
            println!("🧪 Generated {} customers (seed {})", customers, seed);
            for path in &paths {
                println!("   {}", path.display());
            }
            if import {
                let mut engine = open_engine(&cli.db, cli.config.as_deref())?;
                run_import(&mut engine, &paths, None)?;
            }
        }
        Command::Review { ref steward } => {
            run_review(&cli.db, cli.config.as_deref(), steward)?;
        }
    }

    Ok(())
}

fn open_engine(db: &Path, config: Option<&Path>) -> Result<Engine> {
    let config = match config {
        Some(path) => {
            ResolutionConfig::from_file(path).with_context(|| format!("Failed to load config {}", path.display()))?
        }
        None => ResolutionConfig::default(),
    };
    let store = SqliteStore::open(db).with_context(|| format!("Failed to open database {}", db.display()))?;
    let audit = SqliteAuditLog::open(db).with_context(|| format!("Failed to open audit log {}", db.display()))?;
    Ok(ResolutionEngine::new(config, store, audit)?)
}

fn parse_pair(s: &str) -> Result<PairKey> {
    PairKey::parse(s).ok_or_else(|| anyhow!("Pair must look like a|b, got '{}'", s))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run_import(engine: &mut Engine, files: &[PathBuf], layout: Option<SourceLayout>) -> Result<()> {
    println!("📂 Importing {} file(s)", files.len());
    for path in files {
        let (detected, records) = read_file(path, layout)?;
        let report = engine.ingest(&records)?;
        println!(
            "✓ {} ({}): {} new, {} updated, {} unchanged",
            path.display(),
            detected.system(),
            report.inserted,
            report.updated,
            report.unchanged
        );
    }
    Ok(())
}

fn run_resolve(engine: &mut Engine) -> Result<()> {
    let report = engine.resolve(&RunControl::new())?;
    if report.run_id.is_empty() {
        println!("✓ Nothing changed since the last run");
        return Ok(());
    }

    info!("Run {} finished", report.run_id);
    println!("🔁 Run {}", report.run_id);
    println!("   changed records:   {}", report.changed_records);
    println!("   candidate pairs:   {}", report.candidate_pairs);
    println!("   discarded:         {}", report.discarded_pairs);
    println!("   auto-merged:       {}", report.auto_merged);
    println!("   queued for review: {}", report.queued_for_review);
    println!("   conflicts held:    {}", report.conflicts_held);
    println!("   golden versions:   {}", report.golden_versions);
    if !report.blocking.skipped.is_empty() {
        println!("⚠️  {} oversized buckets skipped", report.blocking.skipped.len());
    }
    Ok(())
}

#[cfg(feature = "tui")]
fn run_review(db: &Path, config: Option<&Path>, steward: &str) -> Result<()> {
    let mut engine = open_engine(db, config)?;
    let mut app = ui::App::new(steward);
    ui::run_ui(&mut app, &mut engine)?;
    println!("\n✅ Review console closed");
    Ok(())
}

#[cfg(not(feature = "tui"))]
fn run_review(_db: &Path, _config: Option<&Path>, _steward: &str) -> Result<()> {
    eprintln!("❌ Review console not available!");
    eprintln!("   Rebuild with: cargo build --features tui");
    eprintln!("   Or use the API: cargo run --bin mdm-server --features server");
    std::process::exit(1);
}
