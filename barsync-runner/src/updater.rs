//! Updater — incremental fetches from each symbol's watermark to "now".
//!
//! Staleness gates which symbols are attempted; an explicit symbol list
//! bypasses the gate. A symbol without a watermark takes the full-history
//! path. A failed fetch leaves the watermark where it was, so the next run
//! asks for the same gap again.

use crate::fetcher::FetchRequest;
use crate::report::PlannedFetch;
use crate::session::Session;
use barsync_core::data::StoreError;
use barsync_core::domain::{date_to_utc, Granularity};
use barsync_core::SyncConfig;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

/// Fetch window for one (symbol, granularity).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateWindow {
    /// No watermark yet: everything from the configured start date.
    FullHistory {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    /// From one step past the watermark.
    Incremental {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    /// Watermark already at or past "now".
    UpToDate,
}

impl UpdateWindow {
    pub fn request(&self, symbol: &str, granularity: Granularity) -> Option<FetchRequest> {
        match *self {
            UpdateWindow::FullHistory { start, end } | UpdateWindow::Incremental { start, end } => {
                Some(FetchRequest {
                    symbol: symbol.to_string(),
                    granularity,
                    start,
                    end,
                })
            }
            UpdateWindow::UpToDate => None,
        }
    }

    pub fn is_full_history(&self) -> bool {
        matches!(self, UpdateWindow::FullHistory { .. })
    }
}

/// Compute the window for a symbol given its watermark.
///
/// Intraday starts are clamped to the provider's retrievable range.
pub fn plan_window(
    config: &SyncConfig,
    granularity: Granularity,
    watermark: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> UpdateWindow {
    let clamp = |start: DateTime<Utc>| {
        if granularity.is_intraday() {
            start.max(config.intraday_earliest(now))
        } else {
            start
        }
    };

    match watermark {
        None => {
            let start = clamp(date_to_utc(config.history.start_date));
            if start > now {
                UpdateWindow::UpToDate
            } else {
                UpdateWindow::FullHistory { start, end: now }
            }
        }
        Some(mark) => {
            let start = clamp(mark + granularity.step());
            if start > now {
                UpdateWindow::UpToDate
            } else {
                UpdateWindow::Incremental { start, end: now }
            }
        }
    }
}

/// Which symbols an update run covers.
#[derive(Debug, Clone, Default)]
pub struct UpdateSelection {
    /// Operate only on these symbols, bypassing staleness. Symbols absent
    /// from the store get a full-history fetch.
    pub explicit: Option<BTreeSet<String>>,
    /// Stale symbols granted one attempt anyway.
    pub probe: BTreeSet<String>,
    /// Never fetched, even when named: symbols this run removed.
    pub excluded: BTreeSet<String>,
}

/// Run the update phase over `selection`.
pub fn update(session: &mut Session<'_>, selection: &UpdateSelection) -> Result<(), StoreError> {
    let today = session.today();

    let candidates = match &selection.explicit {
        Some(symbols) => symbols.clone(),
        None => session.dataset.known_symbols(),
    };

    let mut attempt: Vec<String> = Vec::with_capacity(candidates.len());
    for symbol in candidates {
        if selection.excluded.contains(&symbol) {
            continue;
        }
        let stale = session.dataset.staleness.is_stale(&symbol, today);
        if selection.explicit.is_none() && stale {
            if selection.probe.contains(&symbol) {
                session.report.probed.insert(symbol.clone());
            } else {
                session.report.stale_skipped.insert(symbol);
                continue;
            }
        }
        attempt.push(symbol);
    }

    tracing::info!(
        symbols = attempt.len(),
        stale_skipped = session.report.stale_skipped.len(),
        probed = session.report.probed.len(),
        explicit = selection.explicit.is_some(),
        "update started"
    );

    for granularity in Granularity::ALL {
        let mut requests = Vec::new();
        for symbol in &attempt {
            if session.was_attempted(symbol, granularity) {
                continue;
            }
            let watermark = session.dataset.store(granularity).watermark(symbol);
            let window = plan_window(session.config, granularity, watermark, session.now);
            match window.request(symbol, granularity) {
                Some(request) => {
                    if session.is_dry_run() {
                        session.report.planned.push(PlannedFetch {
                            symbol: request.symbol,
                            granularity,
                            start: request.start,
                            end: request.end,
                            full_history: window.is_full_history(),
                        });
                    } else {
                        requests.push(request);
                    }
                }
                None => session.report.up_to_date += 1,
            }
        }

        let batch_size = session.fetcher.batch_size();
        for batch in requests.chunks(batch_size) {
            let succeeded = session.sync_batch(granularity, batch)?;
            session.report.updated.extend(succeeded);
        }
    }

    Ok(())
}

/// Give stale symbols that are still eligible one attempt each.
///
/// A success clears their staleness; a failure leaves it as it was.
pub fn probe_stale(session: &mut Session<'_>, eligible: &BTreeSet<String>) -> Result<(), StoreError> {
    let stale: BTreeSet<String> = session
        .dataset
        .staleness
        .stale_symbols(session.today())
        .intersection(eligible)
        .cloned()
        .collect();
    if stale.is_empty() {
        return Ok(());
    }
    tracing::info!(symbols = stale.len(), "re-evaluating stale symbols");
    session.report.probed.extend(stale.iter().cloned());
    let selection = UpdateSelection {
        explicit: Some(stale),
        ..UpdateSelection::default()
    };
    update(session, &selection)
}
