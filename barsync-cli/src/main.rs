//! Barsync CLI — keep local daily and hourly bar stores in sync with a listing.
//!
//! Commands:
//! - `init` — full backfill of the eligible universe (or of `--tickers`)
//! - `update` — incremental fetch for symbols already in the stores
//! - `reconcile` — backfill listed additions, delete dropped symbols
//! - `all` — reconcile then update; initializes when the stores are empty
//! - `status` — read-only summary of the stores and staleness file

use anyhow::{bail, Context, Result};
use barsync_core::data::YahooProvider;
use barsync_core::SyncConfig;
use barsync_runner::{inspect, run, RunMode, RunOptions, RunReport, ThreadSleeper};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "barsync.toml";

#[derive(Parser)]
#[command(
    name = "barsync",
    about = "Barsync — market-data bar synchronization for a listed universe"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a TOML config file. Defaults to ./barsync.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter (e.g. info, debug, barsync_runner=trace). RUST_LOG wins when set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Compute what would change without fetching or writing anything.
    #[arg(long, global = true, default_value_t = false)]
    dry_run: bool,

    /// Restrict the run to these symbols (comma separated, repeatable).
    #[arg(long, global = true, value_delimiter = ',')]
    tickers: Vec<String>,

    /// Write the run report as JSON to this path.
    #[arg(long, global = true)]
    report: Option<PathBuf>,

    /// Override the listing CSV path.
    #[arg(long, global = true)]
    listing: Option<PathBuf>,

    /// Override the minimum eligible price.
    #[arg(long, global = true)]
    min_price: Option<f64>,

    /// Override the maximum eligible price.
    #[arg(long, global = true)]
    max_price: Option<f64>,

    /// Override the daily store path.
    #[arg(long, global = true)]
    daily: Option<PathBuf>,

    /// Override the hourly store path.
    #[arg(long, global = true)]
    hourly: Option<PathBuf>,

    /// History start date (YYYY-MM-DD).
    #[arg(long, global = true)]
    start: Option<String>,

    /// Pin "now" to this date (YYYY-MM-DD) instead of the wall clock.
    #[arg(long, global = true)]
    end: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Backfill full history for the eligible universe.
    Init,
    /// Fetch new bars for symbols already in the stores.
    Update,
    /// Sync store membership with the listing.
    Reconcile,
    /// Reconcile, then update.
    All,
    /// Print a summary of the stores without touching the network.
    Status,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let config = load_config(&cli)?;

    let mode = match cli.command {
        Commands::Init => RunMode::Initialize,
        Commands::Update => RunMode::Update,
        Commands::Reconcile => RunMode::Reconcile,
        Commands::All => RunMode::Combined,
        Commands::Status => return run_status(&config),
    };

    let options = RunOptions::new(mode)
        .dry_run(cli.dry_run)
        .symbols(cli.tickers.iter().flat_map(|t| t.split_whitespace()));

    let provider = YahooProvider::new(config.fetch.request_timeout())
        .context("failed to build HTTP client")?;
    let report = run(&config, &provider, &ThreadSleeper, &options, Utc::now())
        .with_context(|| format!("{mode} run aborted"))?;

    print!("{report}");

    if let Some(path) = &cli.report {
        save_report(&report, path)?;
        println!("Report saved to: {}", path.display());
    }

    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<SyncConfig> {
    let mut config = match &cli.config {
        Some(path) => SyncConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => {
            let default = Path::new(DEFAULT_CONFIG);
            if default.exists() {
                SyncConfig::from_file(default)
                    .with_context(|| format!("failed to load config {DEFAULT_CONFIG}"))?
            } else {
                tracing::debug!("no {DEFAULT_CONFIG} found, using built-in defaults");
                SyncConfig::default()
            }
        }
    };

    if let Some(listing) = &cli.listing {
        config.universe.listing_path = listing.clone();
    }
    if let Some(min) = cli.min_price {
        config.universe.min_price = min;
    }
    if let Some(max) = cli.max_price {
        config.universe.max_price = max;
    }
    if let Some(daily) = &cli.daily {
        config.storage.daily_path = daily.clone();
    }
    if let Some(hourly) = &cli.hourly {
        config.storage.hourly_path = hourly.clone();
    }
    if let Some(start) = &cli.start {
        config.history.start_date = parse_date(start, "--start")?;
    }
    if let Some(end) = &cli.end {
        config.history.end_date = Some(parse_date(end, "--end")?);
    }

    Ok(config)
}

fn parse_date(value: &str, flag: &str) -> Result<NaiveDate> {
    match NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        Ok(date) => Ok(date),
        Err(e) => bail!("{flag} expects YYYY-MM-DD, got '{value}': {e}"),
    }
}

fn run_status(config: &SyncConfig) -> Result<()> {
    let status = inspect(config, Utc::now()).context("status inspection failed")?;
    print!("{status}");
    Ok(())
}

fn save_report(report: &RunReport, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn tickers_do_not_swallow_the_subcommand() {
        let cli = Cli::try_parse_from(["barsync", "--tickers", "AAA", "update"]).unwrap();
        assert!(matches!(cli.command, Commands::Update));
        assert_eq!(cli.tickers, vec!["AAA".to_string()]);
    }

    #[test]
    fn tickers_split_on_commas_and_repeat() {
        let cli = Cli::try_parse_from([
            "barsync", "all", "--tickers", "aaa,BBB", "--tickers", "CCC", "--dry-run",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::All));
        assert_eq!(cli.tickers, vec!["aaa", "BBB", "CCC"]);
        assert!(cli.dry_run);
    }
}
