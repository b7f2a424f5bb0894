//! Read-only inspection of the persisted dataset.
//!
//! Per granularity: file location and digest, coverage, thin histories, and
//! (daily only) calendar gaps wider than the configured threshold.

use crate::dataset::Dataset;
use crate::sync::SyncError;
use barsync_core::data::BarStore;
use barsync_core::domain::Granularity;
use barsync_core::SyncConfig;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

/// A stretch of missing daily history for one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryGap {
    pub symbol: String,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GranularityStatus {
    pub granularity: Granularity,
    pub path: PathBuf,
    pub exists: bool,
    pub symbols: usize,
    pub rows: usize,
    pub first: Option<DateTime<Utc>>,
    pub last: Option<DateTime<Utc>>,
    /// BLAKE3 of the file bytes.
    pub digest: Option<String>,
    /// Symbols with fewer rows than `min_observations`.
    pub thin: Vec<(String, usize)>,
    pub gaps: Vec<HistoryGap>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub today: NaiveDate,
    pub daily: GranularityStatus,
    pub hourly: GranularityStatus,
    pub tracked: usize,
    pub stale: BTreeSet<String>,
}

fn inspect_store(store: &BarStore, config: &SyncConfig) -> Result<GranularityStatus, SyncError> {
    let granularity = store.granularity();
    let min_obs = config.report.min_observations;
    let gap_threshold = config.report.gap_threshold_days;

    let mut status = GranularityStatus {
        granularity,
        path: store.path().to_path_buf(),
        exists: store.exists_on_disk(),
        symbols: 0,
        rows: store.len(),
        first: None,
        last: None,
        digest: store.file_digest()?,
        thin: Vec::new(),
        gaps: Vec::new(),
    };

    for symbol in store.known_symbols() {
        status.symbols += 1;
        let mut count = 0usize;
        let mut previous: Option<DateTime<Utc>> = None;
        for bar in store.symbol_rows(&symbol) {
            count += 1;
            status.first = Some(status.first.map_or(bar.timestamp, |f| f.min(bar.timestamp)));
            status.last = Some(status.last.map_or(bar.timestamp, |l| l.max(bar.timestamp)));
            if granularity == Granularity::Daily {
                if let Some(prev) = previous {
                    let days = (bar.timestamp - prev).num_days();
                    if days > gap_threshold {
                        status.gaps.push(HistoryGap {
                            symbol: symbol.clone(),
                            from: prev.date_naive(),
                            to: bar.timestamp.date_naive(),
                            days,
                        });
                    }
                }
            }
            previous = Some(bar.timestamp);
        }
        if count < min_obs {
            status.thin.push((symbol, count));
        }
    }

    Ok(status)
}

/// Inspect both stores and the staleness file as of `now`.
pub fn inspect(config: &SyncConfig, now: DateTime<Utc>) -> Result<StatusReport, SyncError> {
    config.validate()?;
    let today = config.effective_now(now).date_naive();
    let dataset = Dataset::open(config)?;

    Ok(StatusReport {
        today,
        daily: inspect_store(&dataset.daily, config)?,
        hourly: inspect_store(&dataset.hourly, config)?,
        tracked: dataset.staleness.len(),
        stale: dataset.staleness.stale_symbols(today),
    })
}

impl fmt::Display for GranularityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} store: {}", self.granularity, self.path.display())?;
        if !self.exists {
            return writeln!(f, "  (not created yet)");
        }
        writeln!(f, "  symbols: {}  rows: {}", self.symbols, self.rows)?;
        if let (Some(first), Some(last)) = (self.first, self.last) {
            writeln!(
                f,
                "  range: {} .. {}",
                self.granularity.format_timestamp(first),
                self.granularity.format_timestamp(last)
            )?;
        }
        if let Some(digest) = &self.digest {
            writeln!(f, "  blake3: {digest}")?;
        }
        if !self.thin.is_empty() {
            writeln!(f, "  thin histories: {}", self.thin.len())?;
            for (symbol, count) in self.thin.iter().take(10) {
                writeln!(f, "    {symbol}: {count} rows")?;
            }
        }
        if !self.gaps.is_empty() {
            writeln!(f, "  gaps: {}", self.gaps.len())?;
            for gap in self.gaps.iter().take(10) {
                writeln!(f, "    {}: {} -> {} ({} days)", gap.symbol, gap.from, gap.to, gap.days)?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "barsync status as of {}", self.today)?;
        write!(f, "{}", self.daily)?;
        write!(f, "{}", self.hourly)?;
        write!(f, "staleness: {} tracked, {} stale", self.tracked, self.stale.len())?;
        if !self.stale.is_empty() {
            let shown: Vec<&str> = self.stale.iter().take(20).map(String::as_str).collect();
            write!(f, " ({})", shown.join(", "))?;
        }
        writeln!(f)
    }
}
