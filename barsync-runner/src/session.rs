//! State of one synchronization run.
//!
//! A session owns the loaded dataset, the fetcher, and the report being
//! built. Reconciliation and update both push their work through
//! [`Session::sync_batch`], the single place where fetched rows reach disk.

use crate::dataset::Dataset;
use crate::fetcher::{FetchRequest, RateLimitedFetcher};
use crate::report::RunReport;
use barsync_core::data::{StoreError, WriteMode};
use barsync_core::domain::{Bar, Granularity};
use barsync_core::SyncConfig;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeSet;

pub struct Session<'a> {
    pub config: &'a SyncConfig,
    pub dataset: Dataset,
    pub fetcher: RateLimitedFetcher<'a>,
    pub report: RunReport,
    pub write_mode: WriteMode,
    /// Effective "now" of the run; every window ends here.
    pub now: DateTime<Utc>,
    /// (symbol, granularity) pairs already fetched this run, successful or not.
    attempted: BTreeSet<(String, Granularity)>,
}

impl<'a> Session<'a> {
    pub fn new(
        config: &'a SyncConfig,
        dataset: Dataset,
        fetcher: RateLimitedFetcher<'a>,
        report: RunReport,
        write_mode: WriteMode,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            config,
            dataset,
            fetcher,
            report,
            write_mode,
            now,
            attempted: BTreeSet::new(),
        }
    }

    pub fn today(&self) -> NaiveDate {
        self.now.date_naive()
    }

    pub fn is_dry_run(&self) -> bool {
        self.write_mode == WriteMode::DryRun
    }

    /// True once the pair went through a fetch in this run.
    ///
    /// A failed symbol is never retried again within the same run.
    pub fn was_attempted(&self, symbol: &str, granularity: Granularity) -> bool {
        self.attempted.contains(&(symbol.to_string(), granularity))
    }

    /// Fetch one batch, merge every successful result into the store in a
    /// single write, then flush staleness. This is the run's checkpoint.
    ///
    /// Returns the symbols whose fetch succeeded (zero rows included).
    pub fn sync_batch(
        &mut self,
        granularity: Granularity,
        requests: &[FetchRequest],
    ) -> Result<BTreeSet<String>, StoreError> {
        if requests.is_empty() {
            return Ok(BTreeSet::new());
        }

        for request in requests {
            self.attempted
                .insert((request.symbol.clone(), request.granularity));
        }
        let outcome = self.fetcher.fetch_batch(requests);
        let today = self.today();

        let mut succeeded = BTreeSet::new();
        let mut rows: Vec<Bar> = Vec::new();
        for (request, bars) in outcome.fetched {
            self.dataset.staleness.record_success(&request.symbol, today);
            succeeded.insert(request.symbol);
            rows.extend(bars);
        }
        let failed = outcome.failures.len();
        self.report.failures.extend(outcome.failures);

        let fetched_rows = rows.len();
        let delta = self
            .dataset
            .store_mut(granularity)
            .merge_append(rows, self.write_mode)?;
        self.report.record_merge(granularity, delta);
        self.dataset.staleness.flush(self.write_mode)?;

        tracing::info!(
            %granularity,
            symbols = requests.len(),
            succeeded = succeeded.len(),
            failed,
            fetched_rows,
            inserted = delta.inserted,
            replaced = delta.replaced,
            "batch committed"
        );

        Ok(succeeded)
    }

    /// Close the session and hand back the finished report.
    pub fn finish(mut self) -> RunReport {
        self.report.fetch = self.fetcher.stats();
        self.report
    }
}
