//! Run modes and the top-level entry point.

use crate::dataset::Dataset;
use crate::fetcher::{RateLimitedFetcher, Sleeper};
use crate::reconciler::{ReconcileOptions, Reconciler};
use crate::report::RunReport;
use crate::session::Session;
use crate::updater::{probe_stale, update, UpdateSelection};
use barsync_core::data::{BarProvider, StoreError, UniverseError, WriteMode};
use barsync_core::domain::{date_to_utc, normalize_symbol};
use barsync_core::{ConfigError, SyncConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Run-fatal errors. Per-symbol fetch failures are never among them.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Universe(#[from] UniverseError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Full backfill of the universe (or of explicit symbols) without removals.
    Initialize,
    /// Incremental fetches for known symbols only.
    Update,
    /// Universe sync only: backfill additions, delete dropped symbols.
    Reconcile,
    /// Reconcile then update; initialize when both stores are empty.
    Combined,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunMode::Initialize => "init",
            RunMode::Update => "update",
            RunMode::Reconcile => "reconcile",
            RunMode::Combined => "all",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub mode: RunMode,
    /// Compute deltas only: no provider calls, no writes.
    pub dry_run: bool,
    /// Operate only on these symbols and bypass staleness filtering.
    pub symbols: Option<BTreeSet<String>>,
}

impl RunOptions {
    pub fn new(mode: RunMode) -> Self {
        Self {
            mode,
            dry_run: false,
            symbols: None,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn symbols<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let set: BTreeSet<String> = symbols
            .into_iter()
            .map(|s| normalize_symbol(s.as_ref()))
            .filter(|s| !s.is_empty())
            .collect();
        self.symbols = if set.is_empty() { None } else { Some(set) };
        self
    }
}

/// Execute one synchronization run.
///
/// `wall_clock` is the current time; a fixed `end_date` in the config pins it.
/// Configuration is validated before any file or network access.
pub fn run(
    config: &SyncConfig,
    provider: &dyn BarProvider,
    sleeper: &dyn Sleeper,
    options: &RunOptions,
    wall_clock: DateTime<Utc>,
) -> Result<RunReport, SyncError> {
    config.validate()?;

    let now = config.effective_now(wall_clock);
    let earliest_intraday = config.intraday_earliest(now);
    if date_to_utc(config.history.start_date) < earliest_intraday {
        tracing::warn!(
            start_date = %config.history.start_date,
            effective = %earliest_intraday.date_naive(),
            "start date predates the provider's intraday window; hourly history begins later"
        );
    }

    let dataset = Dataset::open(config)?;
    let mode = match options.mode {
        RunMode::Combined if dataset.is_empty() => {
            tracing::info!("both stores are empty, running initialization");
            RunMode::Initialize
        }
        other => other,
    };

    let write_mode = if options.dry_run {
        WriteMode::DryRun
    } else {
        WriteMode::Commit
    };

    tracing::info!(
        %mode,
        provider = provider.name(),
        dry_run = options.dry_run,
        explicit = options.symbols.as_ref().map(|s| s.len()),
        now = %now,
        "run started"
    );

    let fetcher = RateLimitedFetcher::new(provider, sleeper, &config.fetch);
    let report = RunReport::new(mode, options.dry_run, now);
    let mut session = Session::new(config, dataset, fetcher, report, write_mode, now);

    match mode {
        RunMode::Initialize => match &options.symbols {
            Some(symbols) => {
                let selection = UpdateSelection {
                    explicit: Some(symbols.clone()),
                    ..UpdateSelection::default()
                };
                update(&mut session, &selection)?;
            }
            None => {
                if !session.dataset.is_empty() {
                    tracing::warn!("stores are not empty; only missing symbols will be backfilled");
                }
                Reconciler::new(ReconcileOptions {
                    remove_dropped: false,
                    restrict_to: None,
                })
                .run(&mut session)?;
            }
        },
        RunMode::Update => {
            let selection = UpdateSelection {
                explicit: options.symbols.clone(),
                ..UpdateSelection::default()
            };
            update(&mut session, &selection)?;
        }
        RunMode::Reconcile => {
            let outcome = Reconciler::new(ReconcileOptions {
                remove_dropped: true,
                restrict_to: options.symbols.clone(),
            })
            .run(&mut session)?;
            // Stale symbols still listed get one attempt.
            if !session.is_dry_run() {
                probe_stale(&mut session, &outcome.universe)?;
            }
        }
        RunMode::Combined => {
            let reconciled = Reconciler::new(ReconcileOptions {
                remove_dropped: true,
                restrict_to: options.symbols.clone(),
            })
            .run(&mut session);

            // An unreadable listing blocks reconciliation, not the update.
            let (universe, removed) = match reconciled {
                Ok(outcome) => (outcome.universe, outcome.diff.to_remove),
                Err(SyncError::Universe(e)) => {
                    tracing::error!(error = %e, "reconciliation skipped, continuing with update");
                    session.report.reconcile_skipped = Some(e.to_string());
                    (BTreeSet::new(), BTreeSet::new())
                }
                Err(e) => return Err(e),
            };

            // Stale symbols the universe still lists get one probe.
            let stale = session.dataset.staleness.stale_symbols(session.today());
            let selection = UpdateSelection {
                explicit: options.symbols.clone(),
                probe: stale.intersection(&universe).cloned().collect(),
                excluded: removed,
            };
            update(&mut session, &selection)?;
        }
    }

    let report = session.finish();
    report.log_summary();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_options_are_normalized() {
        let opts = RunOptions::new(RunMode::Update).symbols([" aaa", "BbB", ""]);
        let symbols = opts.symbols.unwrap();
        assert!(symbols.contains("AAA"));
        assert!(symbols.contains("BBB"));
        assert_eq!(symbols.len(), 2);
    }

    #[test]
    fn empty_symbol_list_means_no_override() {
        let opts = RunOptions::new(RunMode::Update).symbols(Vec::<String>::new());
        assert!(opts.symbols.is_none());
    }

    #[test]
    fn run_mode_labels_match_commands() {
        assert_eq!(RunMode::Combined.to_string(), "all");
        assert_eq!(RunMode::Initialize.to_string(), "init");
    }
}
