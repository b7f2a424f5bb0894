//! The persisted dataset of one run: both bar stores and the staleness file.
//!
//! Loaded once at the start of a run; a corrupt file fails the run before
//! any network activity.

use barsync_core::data::{BarStore, StalenessTracker, StoreError};
use barsync_core::domain::Granularity;
use barsync_core::SyncConfig;
use std::collections::BTreeSet;

#[derive(Debug)]
pub struct Dataset {
    pub daily: BarStore,
    pub hourly: BarStore,
    pub staleness: StalenessTracker,
}

impl Dataset {
    pub fn open(config: &SyncConfig) -> Result<Self, StoreError> {
        let daily = BarStore::open(config.store_path(Granularity::Daily), Granularity::Daily)?;
        let hourly = BarStore::open(config.store_path(Granularity::Hourly), Granularity::Hourly)?;
        let staleness =
            StalenessTracker::load(&config.storage.staleness_path, config.staleness.threshold_days)?;

        tracing::info!(
            daily_symbols = daily.known_symbols().len(),
            daily_rows = daily.len(),
            hourly_symbols = hourly.known_symbols().len(),
            hourly_rows = hourly.len(),
            tracked = staleness.len(),
            "dataset loaded"
        );

        Ok(Self {
            daily,
            hourly,
            staleness,
        })
    }

    pub fn store(&self, granularity: Granularity) -> &BarStore {
        match granularity {
            Granularity::Daily => &self.daily,
            Granularity::Hourly => &self.hourly,
        }
    }

    pub fn store_mut(&mut self, granularity: Granularity) -> &mut BarStore {
        match granularity {
            Granularity::Daily => &mut self.daily,
            Granularity::Hourly => &mut self.hourly,
        }
    }

    /// Symbols present in either store.
    pub fn known_symbols(&self) -> BTreeSet<String> {
        let mut symbols = self.daily.known_symbols();
        symbols.extend(self.hourly.known_symbols());
        symbols
    }

    /// True when neither store holds a single row.
    pub fn is_empty(&self) -> bool {
        self.daily.is_empty() && self.hourly.is_empty()
    }
}
