//! End-of-run report.
//!
//! Accumulates everything an operator needs to decide whether to re-run:
//! failed symbols with their reason class, stale-skipped symbols, and row
//! counts per granularity.

use crate::fetcher::{FetchFailure, FetchStats};
use crate::reconciler::UniverseDiff;
use crate::sync::RunMode;
use barsync_core::data::{MergeDelta, RemoveDelta};
use barsync_core::domain::Granularity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Symbols listed in full before the summary truncates.
const LIST_LIMIT: usize = 20;

/// Row counts for one granularity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowCounts {
    pub inserted: usize,
    pub replaced: usize,
    pub removed: usize,
}

/// A fetch window computed but not executed (dry run).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedFetch {
    pub symbol: String,
    pub granularity: Granularity,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub full_history: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub mode: RunMode,
    pub dry_run: bool,
    pub as_of: DateTime<Utc>,
    /// Eligible symbols in the resolved universe, when one was loaded.
    pub universe_size: Option<usize>,
    /// Why reconciliation did not run in a combined run.
    pub reconcile_skipped: Option<String>,
    pub diff: Option<UniverseDiff>,
    /// Added symbols that now have rows in at least one store.
    pub backfilled: BTreeSet<String>,
    pub removed_symbols: BTreeSet<String>,
    /// Symbols with at least one successful incremental or fallback fetch.
    pub updated: BTreeSet<String>,
    /// (symbol, granularity) pairs whose window was empty.
    pub up_to_date: usize,
    pub daily: RowCounts,
    pub hourly: RowCounts,
    pub failures: Vec<FetchFailure>,
    pub stale_skipped: BTreeSet<String>,
    /// Stale symbols granted a single probe attempt.
    pub probed: BTreeSet<String>,
    pub planned: Vec<PlannedFetch>,
    pub fetch: FetchStats,
}

impl RunReport {
    pub fn new(mode: RunMode, dry_run: bool, as_of: DateTime<Utc>) -> Self {
        Self {
            mode,
            dry_run,
            as_of,
            universe_size: None,
            reconcile_skipped: None,
            diff: None,
            backfilled: BTreeSet::new(),
            removed_symbols: BTreeSet::new(),
            updated: BTreeSet::new(),
            up_to_date: 0,
            daily: RowCounts::default(),
            hourly: RowCounts::default(),
            failures: Vec::new(),
            stale_skipped: BTreeSet::new(),
            probed: BTreeSet::new(),
            planned: Vec::new(),
            fetch: FetchStats::default(),
        }
    }

    pub fn rows(&self, granularity: Granularity) -> &RowCounts {
        match granularity {
            Granularity::Daily => &self.daily,
            Granularity::Hourly => &self.hourly,
        }
    }

    fn rows_mut(&mut self, granularity: Granularity) -> &mut RowCounts {
        match granularity {
            Granularity::Daily => &mut self.daily,
            Granularity::Hourly => &mut self.hourly,
        }
    }

    pub fn record_merge(&mut self, granularity: Granularity, delta: MergeDelta) {
        let rows = self.rows_mut(granularity);
        rows.inserted += delta.inserted;
        rows.replaced += delta.replaced;
    }

    pub fn record_removal(&mut self, granularity: Granularity, delta: RemoveDelta) {
        self.rows_mut(granularity).removed += delta.rows;
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn rows_added(&self) -> usize {
        self.daily.inserted + self.hourly.inserted
    }

    pub fn rows_removed(&self) -> usize {
        self.daily.removed + self.hourly.removed
    }

    /// Emit the summary as one structured event.
    pub fn log_summary(&self) {
        tracing::info!(
            mode = %self.mode,
            dry_run = self.dry_run,
            universe = self.universe_size,
            backfilled = self.backfilled.len(),
            removed = self.removed_symbols.len(),
            updated = self.updated.len(),
            up_to_date = self.up_to_date,
            rows_added = self.rows_added(),
            rows_replaced = self.daily.replaced + self.hourly.replaced,
            rows_removed = self.rows_removed(),
            failed = self.failures.len(),
            stale_skipped = self.stale_skipped.len(),
            provider_calls = self.fetch.provider_calls,
            retries = self.fetch.retries,
            pauses = self.fetch.pauses,
            "run complete"
        );
    }
}

fn write_symbols(f: &mut fmt::Formatter<'_>, label: &str, symbols: &BTreeSet<String>) -> fmt::Result {
    if symbols.is_empty() {
        return Ok(());
    }
    let shown: Vec<&str> = symbols.iter().take(LIST_LIMIT).map(String::as_str).collect();
    write!(f, "  {label} ({}): {}", symbols.len(), shown.join(", "))?;
    if symbols.len() > LIST_LIMIT {
        write!(f, ", ... and {} more", symbols.len() - LIST_LIMIT)?;
    }
    writeln!(f)
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "barsync {} as of {}", self.mode, self.as_of.format("%Y-%m-%d %H:%M UTC"))?;
        if self.dry_run {
            write!(f, " (dry run: nothing fetched or written)")?;
        }
        writeln!(f)?;

        if let Some(n) = self.universe_size {
            writeln!(f, "  universe: {n} eligible symbols")?;
        }
        if let Some(reason) = &self.reconcile_skipped {
            writeln!(f, "  reconcile skipped: {reason}")?;
        }
        if let Some(diff) = &self.diff {
            writeln!(
                f,
                "  diff: {} to add, {} to remove, {} unchanged",
                diff.to_add.len(),
                diff.to_remove.len(),
                diff.unchanged.len()
            )?;
            if self.dry_run {
                write_symbols(f, "would add", &diff.to_add)?;
                write_symbols(f, "would remove", &diff.to_remove)?;
            }
        }
        write_symbols(f, "backfilled", &self.backfilled)?;
        write_symbols(f, "removed", &self.removed_symbols)?;

        if !self.planned.is_empty() {
            let full = self.planned.iter().filter(|p| p.full_history).count();
            writeln!(
                f,
                "  planned fetches: {} ({} full history, {} incremental)",
                self.planned.len(),
                full,
                self.planned.len() - full
            )?;
        }
        if !self.updated.is_empty() || self.up_to_date > 0 {
            writeln!(
                f,
                "  updated: {} symbols, {} windows already up to date",
                self.updated.len(),
                self.up_to_date
            )?;
        }

        for granularity in Granularity::ALL {
            let rows = self.rows(granularity);
            writeln!(
                f,
                "  rows {granularity}: +{} inserted, {} replaced, -{} removed",
                rows.inserted, rows.replaced, rows.removed
            )?;
        }
        writeln!(
            f,
            "  provider: {} calls, {} retries, {} pauses",
            self.fetch.provider_calls, self.fetch.retries, self.fetch.pauses
        )?;

        write_symbols(f, "stale, skipped", &self.stale_skipped)?;
        write_symbols(f, "stale, probed", &self.probed)?;

        if self.failures.is_empty() {
            writeln!(f, "  failed: none")?;
        } else {
            writeln!(f, "  failed ({}):", self.failures.len())?;
            for failure in &self.failures {
                writeln!(
                    f,
                    "    {} [{}] {} after {} attempts: {}",
                    failure.symbol,
                    failure.granularity,
                    failure.class,
                    failure.attempts,
                    failure.message
                )?;
            }
        }
        Ok(())
    }
}
