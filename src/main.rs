//! Bitemporal Cache CLI
//!
//! Loads a snapshot file into a full cache and reports on it.
//!
//! ```text
//!  snapshots.json ──► VecSource ──► DatedCache::load_full ──► overlaps | stats | find
//! ```

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use bitemporal_cache::cache::{CacheConfig, DatedCache, VecSource};
use bitemporal_cache::model::{EntityDescriptor, OverlapRecord, Row};
use bitemporal_cache::temporal::Timestamp;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Bitemporal cache inspection tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Cache configuration file (YAML)
    #[arg(long, env = "CACHE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every overlapping (original, duplicate) pair as JSON
    Overlaps {
        #[command(flatten)]
        input: InputArgs,

        /// Pretty-print the report
        #[arg(long)]
        pretty: bool,
    },
    /// Print counts and the Prometheus exposition of the loaded cache
    Stats {
        #[command(flatten)]
        input: InputArgs,
    },
    /// Look up one identity as of a business and processing date
    Find {
        #[command(flatten)]
        input: InputArgs,

        /// Primary key as a JSON object, e.g. '{"id": 1}'
        #[arg(long)]
        key: String,

        /// Business date (defaults to now)
        #[arg(long)]
        business: Option<String>,

        /// Processing date (defaults to the latest state)
        #[arg(long)]
        processing: Option<String>,
    },
}

#[derive(clap::Args, Debug)]
struct InputArgs {
    /// Snapshot rows: a JSON array, or {"entity": ..., "rows": [...]}
    #[arg(long, short)]
    input: PathBuf,

    /// Entity descriptor (YAML or JSON); required when the input is a bare array
    #[arg(long, short)]
    entity: Option<PathBuf>,
}

/// Input file carrying its own descriptor
#[derive(Deserialize)]
struct Bundle {
    entity: EntityDescriptor,
    rows: Vec<Row>,
}

// =============================================================================
// Main
// =============================================================================

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => CacheConfig::default(),
    };

    match &args.command {
        Command::Overlaps { input, pretty } => {
            let cache = load_cache(input, config)?;
            let records: Vec<OverlapRecord> = cache
                .overlap_pairs()?
                .iter()
                .map(OverlapRecord::from)
                .collect();
            info!(pairs = records.len(), "Overlap scan complete");
            let text = if *pretty {
                serde_json::to_string_pretty(&records)?
            } else {
                serde_json::to_string(&records)?
            };
            println!("{}", text);
        }
        Command::Stats { input } => {
            let cache = load_cache(input, config)?;
            let overlaps = cache.overlap_pairs()?.len();
            println!("entity:     {}", cache.descriptor().name);
            println!("snapshots:  {}", cache.len());
            println!("identities: {}", cache.identity_count());
            println!("overlaps:   {}", overlaps);
            println!();
            print!("{}", cache.metrics().render()?);
        }
        Command::Find {
            input,
            key,
            business,
            processing,
        } => {
            let cache = load_cache(input, config)?;
            let row: Row = serde_json::from_str(key).context("--key must be a JSON object")?;
            let identity = cache.descriptor().identity_from_row(&row)?;
            let business = business.as_deref().map(Timestamp::parse).transpose()?;
            let processing = processing.as_deref().map(Timestamp::parse).transpose()?;
            match cache.find(&identity, business, processing)? {
                Some(snapshot) => {
                    let row = cache.descriptor().snapshot_to_row(&snapshot);
                    println!("{}", serde_json::to_string_pretty(&row)?);
                }
                None => bail!("no snapshot of {} at that point", identity),
            }
        }
    }
    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<CacheConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading cache config {}", path.display()))?;
    let config: CacheConfig = serde_yaml::from_str(&text)
        .with_context(|| format!("parsing cache config {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn load_cache(input: &InputArgs, config: CacheConfig) -> anyhow::Result<DatedCache> {
    let text = std::fs::read_to_string(&input.input)
        .with_context(|| format!("reading {}", input.input.display()))?;

    let source = match &input.entity {
        Some(path) => {
            let descriptor = EntityDescriptor::load(path)
                .with_context(|| format!("loading entity descriptor {}", path.display()))?;
            VecSource::from_json(descriptor, &text)?
        }
        None => {
            let bundle: Bundle = serde_json::from_str(&text).with_context(|| {
                format!(
                    "{} is not an {{\"entity\", \"rows\"}} bundle; pass --entity",
                    input.input.display()
                )
            })?;
            bundle.entity.validate()?;
            VecSource::new(bundle.entity, bundle.rows)
        }
    };

    let descriptor = bitemporal_cache::cache::DataSource::descriptor(&source).clone();
    let cache = DatedCache::new(descriptor, config)?;
    let loaded = cache.load_full(&source)?;
    info!(
        entity = %cache.descriptor().name,
        loaded,
        identities = cache.identity_count(),
        "Cache loaded"
    );
    Ok(cache)
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // Logs go to stderr so reports on stdout stay machine readable
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
