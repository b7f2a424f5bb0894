//! Reconciler — aligns the dataset's symbol set with the eligible universe.
//!
//! Phases run in a fixed order:
//! `LoadUniverse → Diff → BackfillAdditions → RemoveDropped → Done`.
//! The diff is taken against the persisted stores, not a previous universe
//! snapshot, so an interrupted run is repaired by the next one.

use crate::session::Session;
use crate::sync::SyncError;
use crate::updater::plan_window;
use barsync_core::data::{resolve_universe, ListingSnapshot, UniverseError, UniverseResolution};
use barsync_core::domain::Granularity;
use barsync_core::SyncConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilePhase {
    LoadUniverse,
    Diff,
    BackfillAdditions,
    RemoveDropped,
    Done,
}

impl ReconcilePhase {
    pub fn next(self) -> Self {
        match self {
            ReconcilePhase::LoadUniverse => ReconcilePhase::Diff,
            ReconcilePhase::Diff => ReconcilePhase::BackfillAdditions,
            ReconcilePhase::BackfillAdditions => ReconcilePhase::RemoveDropped,
            ReconcilePhase::RemoveDropped | ReconcilePhase::Done => ReconcilePhase::Done,
        }
    }
}

impl fmt::Display for ReconcilePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReconcilePhase::LoadUniverse => "load-universe",
            ReconcilePhase::Diff => "diff",
            ReconcilePhase::BackfillAdditions => "backfill-additions",
            ReconcilePhase::RemoveDropped => "remove-dropped",
            ReconcilePhase::Done => "done",
        };
        f.write_str(s)
    }
}

/// Partition of `target ∪ known` into disjoint sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniverseDiff {
    /// In the universe, absent from the dataset.
    pub to_add: BTreeSet<String>,
    /// In the dataset, no longer in the universe.
    pub to_remove: BTreeSet<String>,
    /// In both.
    pub unchanged: BTreeSet<String>,
}

pub fn diff_universe(target: &BTreeSet<String>, known: &BTreeSet<String>) -> UniverseDiff {
    UniverseDiff {
        to_add: target.difference(known).cloned().collect(),
        to_remove: known.difference(target).cloned().collect(),
        unchanged: target.intersection(known).cloned().collect(),
    }
}

/// Read the listing snapshot and resolve it with the configured filter.
pub fn load_universe(config: &SyncConfig) -> Result<UniverseResolution, SyncError> {
    let u = &config.universe;
    let snapshot = ListingSnapshot::from_path(&u.listing_path, &u.symbol_column, &u.price_column)?;
    let rule = config.exclusion_rule()?;
    let resolution = resolve_universe(&snapshot, u.min_price, u.max_price, &rule);
    if resolution.symbols.is_empty() {
        return Err(UniverseError::SourceUnavailable {
            path: u.listing_path.clone(),
            reason: "no eligible symbols in listing".into(),
        }
        .into());
    }
    Ok(resolution)
}

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// Apply the remove-set. Initialization only adds.
    pub remove_dropped: bool,
    /// Limit the diff to these symbols.
    pub restrict_to: Option<BTreeSet<String>>,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            remove_dropped: true,
            restrict_to: None,
        }
    }
}

/// What reconciliation decided, for the phases that follow it.
#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    /// Eligible universe (after any restriction).
    pub universe: BTreeSet<String>,
    pub diff: UniverseDiff,
}

pub struct Reconciler {
    phase: ReconcilePhase,
    options: ReconcileOptions,
}

impl Reconciler {
    pub fn new(options: ReconcileOptions) -> Self {
        Self {
            phase: ReconcilePhase::LoadUniverse,
            options,
        }
    }

    pub fn phase(&self) -> ReconcilePhase {
        self.phase
    }

    fn advance(&mut self, to: ReconcilePhase) {
        tracing::debug!(from = %self.phase, to = %to, "reconcile phase");
        self.phase = to;
    }

    fn restrict(&self, symbols: BTreeSet<String>) -> BTreeSet<String> {
        match &self.options.restrict_to {
            Some(only) => symbols.intersection(only).cloned().collect(),
            None => symbols,
        }
    }

    /// Drive every phase to `Done`.
    ///
    /// A dry run stops after `Diff`: nothing is fetched or written.
    pub fn run(&mut self, session: &mut Session<'_>) -> Result<ReconcileOutcome, SyncError> {
        let mut outcome = ReconcileOutcome::default();

        while self.phase != ReconcilePhase::Done {
            match self.phase {
                ReconcilePhase::LoadUniverse => {
                    let resolution = load_universe(session.config)?;
                    session.report.universe_size = Some(resolution.symbols.len());
                    outcome.universe = self.restrict(resolution.symbols);
                    self.advance(self.phase.next());
                }
                ReconcilePhase::Diff => {
                    let known = self.restrict(session.dataset.known_symbols());
                    let mut diff = diff_universe(&outcome.universe, &known);
                    if !self.options.remove_dropped {
                        diff.to_remove.clear();
                    }
                    tracing::info!(
                        to_add = diff.to_add.len(),
                        to_remove = diff.to_remove.len(),
                        unchanged = diff.unchanged.len(),
                        "universe diff"
                    );
                    session.report.diff = Some(diff.clone());
                    outcome.diff = diff;

                    if session.is_dry_run() {
                        self.advance(ReconcilePhase::Done);
                    } else {
                        self.advance(self.phase.next());
                    }
                }
                ReconcilePhase::BackfillAdditions => {
                    backfill(session, &outcome.diff.to_add)?;
                    self.advance(self.phase.next());
                }
                ReconcilePhase::RemoveDropped => {
                    if self.options.remove_dropped {
                        remove(session, &outcome.diff.to_remove)?;
                    }
                    self.advance(self.phase.next());
                }
                ReconcilePhase::Done => {}
            }
        }

        Ok(outcome)
    }
}

/// Full-history fetch for newly added symbols, batched.
///
/// Each batch is fetched for both granularities; every granularity's batch
/// ends in one store write. Symbols that fail stay absent and are picked up
/// again by the next reconciliation.
pub fn backfill(session: &mut Session<'_>, symbols: &BTreeSet<String>) -> Result<(), SyncError> {
    if symbols.is_empty() {
        return Ok(());
    }
    tracing::info!(symbols = symbols.len(), "backfilling additions");

    let symbols: Vec<&String> = symbols.iter().collect();
    let batch_size = session.fetcher.batch_size();

    for (n, batch) in symbols.chunks(batch_size).enumerate() {
        tracing::debug!(batch = n + 1, size = batch.len(), "backfill batch");
        for granularity in Granularity::ALL {
            let requests: Vec<_> = batch
                .iter()
                .filter_map(|symbol| {
                    plan_window(session.config, granularity, None, session.now)
                        .request(symbol, granularity)
                })
                .collect();
            session.sync_batch(granularity, &requests)?;
        }
        for symbol in batch {
            let stored = Granularity::ALL
                .iter()
                .any(|g| session.dataset.store(*g).watermark(symbol).is_some());
            if stored {
                session.report.backfilled.insert((*symbol).clone());
            }
        }
    }
    Ok(())
}

/// Delete every row of dropped symbols from both stores.
fn remove(session: &mut Session<'_>, symbols: &BTreeSet<String>) -> Result<(), SyncError> {
    if symbols.is_empty() {
        return Ok(());
    }
    for granularity in Granularity::ALL {
        let delta = session
            .dataset
            .store_mut(granularity)
            .remove_symbols(symbols, session.write_mode)?;
        session.report.record_removal(granularity, delta);
    }
    session.dataset.staleness.forget(symbols);
    session.dataset.staleness.flush(session.write_mode)?;
    session.report.removed_symbols.extend(symbols.iter().cloned());

    tracing::info!(
        symbols = symbols.len(),
        daily_rows = session.report.daily.removed,
        hourly_rows = session.report.hourly.removed,
        "dropped symbols removed"
    );
    Ok(())
}
