//! Staleness tracker — per-symbol date of the last successful fetch.
//!
//! Persisted as a small JSON document next to the store files and flushed at
//! the same checkpoints as the stores.

use super::atomic::write_atomic;
use super::store::{StoreError, WriteMode};
use crate::domain::normalize_symbol;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Serialize, Deserialize)]
struct StalenessFile {
    last_success: BTreeMap<String, NaiveDate>,
}

#[derive(Debug)]
pub struct StalenessTracker {
    path: PathBuf,
    threshold_days: i64,
    last_success: BTreeMap<String, NaiveDate>,
    dirty: bool,
}

impl StalenessTracker {
    /// Load records from `path`. A missing file means no history yet.
    pub fn load(path: impl Into<PathBuf>, threshold_days: i64) -> Result<Self, StoreError> {
        let path = path.into();
        let last_success = if path.exists() {
            let text = std::fs::read_to_string(&path).map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
            let file: StalenessFile =
                serde_json::from_str(&text).map_err(|e| StoreError::Corrupt {
                    path: path.clone(),
                    line: e.line() as u64,
                    reason: e.to_string(),
                })?;
            file.last_success
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path,
            threshold_days,
            last_success,
            dirty: false,
        })
    }

    /// Tracker with no backing history, for runs that never flush.
    pub fn in_memory(threshold_days: i64) -> Self {
        Self {
            path: PathBuf::new(),
            threshold_days,
            last_success: BTreeMap::new(),
            dirty: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn threshold_days(&self) -> i64 {
        self.threshold_days
    }

    /// The provider answered for `symbol` on `today` (zero rows included).
    pub fn record_success(&mut self, symbol: &str, today: NaiveDate) {
        let symbol = normalize_symbol(symbol);
        let entry = self.last_success.entry(symbol).or_insert(today);
        if *entry < today {
            *entry = today;
        }
        self.dirty = true;
    }

    pub fn last_success(&self, symbol: &str) -> Option<NaiveDate> {
        self.last_success.get(&normalize_symbol(symbol)).copied()
    }

    /// `today - last_success > threshold`. Symbols never seen are not stale.
    pub fn is_stale(&self, symbol: &str, today: NaiveDate) -> bool {
        match self.last_success(symbol) {
            Some(last) => (today - last).num_days() > self.threshold_days,
            None => false,
        }
    }

    pub fn stale_symbols(&self, today: NaiveDate) -> BTreeSet<String> {
        self.last_success
            .iter()
            .filter(|(_, last)| (today - **last).num_days() > self.threshold_days)
            .map(|(symbol, _)| symbol.clone())
            .collect()
    }

    /// Drop records for symbols that left the dataset.
    pub fn forget(&mut self, symbols: &BTreeSet<String>) {
        let before = self.last_success.len();
        self.last_success.retain(|s, _| !symbols.contains(s));
        if self.last_success.len() != before {
            self.dirty = true;
        }
    }

    pub fn len(&self) -> usize {
        self.last_success.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_success.is_empty()
    }

    /// Write pending changes through an atomic replace.
    pub fn flush(&mut self, mode: WriteMode) -> Result<(), StoreError> {
        if !self.dirty || mode == WriteMode::DryRun || self.path.as_os_str().is_empty() {
            return Ok(());
        }
        let doc = StalenessFile {
            last_success: self.last_success.clone(),
        };
        write_atomic(&self.path, |out| {
            serde_json::to_writer_pretty(&mut *out, &doc)?;
            out.write_all(b"\n")
        })
        .map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })?;
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn unseen_symbol_is_not_stale() {
        let tracker = StalenessTracker::in_memory(5);
        assert!(!tracker.is_stale("AAA", day(2024, 1, 10)));
    }

    #[test]
    fn threshold_is_strictly_greater() {
        let mut tracker = StalenessTracker::in_memory(5);
        tracker.record_success("AAA", day(2024, 1, 5));
        assert!(!tracker.is_stale("AAA", day(2024, 1, 10)));
        assert!(tracker.is_stale("AAA", day(2024, 1, 11)));
        assert_eq!(tracker.stale_symbols(day(2024, 1, 11)).len(), 1);
    }

    #[test]
    fn success_never_moves_backwards() {
        let mut tracker = StalenessTracker::in_memory(5);
        tracker.record_success("aaa", day(2024, 1, 10));
        tracker.record_success("AAA", day(2024, 1, 3));
        assert_eq!(tracker.last_success("AAA"), Some(day(2024, 1, 10)));
    }

    #[test]
    fn flush_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("staleness.json");

        let mut tracker = StalenessTracker::load(&path, 5).unwrap();
        tracker.record_success("AAA", day(2024, 1, 5));
        tracker.flush(WriteMode::Commit).unwrap();

        let reloaded = StalenessTracker::load(&path, 5).unwrap();
        assert_eq!(reloaded.last_success("AAA"), Some(day(2024, 1, 5)));
    }

    #[test]
    fn dry_run_flush_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("staleness.json");
        let mut tracker = StalenessTracker::load(&path, 5).unwrap();
        tracker.record_success("AAA", day(2024, 1, 5));
        tracker.flush(WriteMode::DryRun).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("staleness.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            StalenessTracker::load(&path, 5),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn forget_drops_records() {
        let mut tracker = StalenessTracker::in_memory(5);
        tracker.record_success("AAA", day(2024, 1, 5));
        tracker.record_success("BBB", day(2024, 1, 5));
        tracker.forget(&["AAA".to_string()].into());
        assert_eq!(tracker.len(), 1);
        assert!(tracker.last_success("AAA").is_none());
    }
}
