//! Barsync Runner — synchronization runs over the core data layer.
//!
//! This crate builds on `barsync-core` to provide:
//! - The rate-limited fetcher (pacing, retry with doubling backoff)
//! - The reconciler (universe diff, backfill of additions, removal of drops)
//! - The updater (watermark-driven incremental windows, staleness gating)
//! - Run modes and the end-of-run report
//! - Read-only status inspection of the stores

pub mod dataset;
pub mod fetcher;
pub mod reconciler;
pub mod report;
pub mod session;
pub mod status;
pub mod sync;
pub mod updater;

pub use dataset::Dataset;
pub use fetcher::{
    FetchFailure, FetchRequest, FetchStats, RateLimitedFetcher, RecordingSleeper, RetryPolicy,
    SleepReason, Sleeper, ThreadSleeper,
};
pub use reconciler::{diff_universe, ReconcilePhase, Reconciler, UniverseDiff};
pub use report::{RowCounts, RunReport};
pub use status::{inspect, StatusReport};
pub use sync::{run, RunMode, RunOptions, SyncError};
pub use updater::{plan_window, UpdateSelection, UpdateWindow};

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn run_report_is_send_sync() {
        assert_send::<RunReport>();
        assert_sync::<RunReport>();
    }

    #[test]
    fn sleepers_are_send_sync() {
        assert_send::<ThreadSleeper>();
        assert_sync::<RecordingSleeper>();
    }

    #[test]
    fn errors_are_send_sync() {
        assert_send::<SyncError>();
        assert_sync::<SyncError>();
    }
}
