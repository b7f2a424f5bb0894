//! Bar store — one flat CSV table per granularity.
//!
//! Layout (daily): `ticker,interval,Date,Adj Close,Close,High,Low,Open,Volume`
//! Layout (hourly): same columns with `Datetime` in place of `Date`.
//! Rows are sorted by `(ticker, timestamp)`; this schema is consumed by the
//! downstream feature pipeline and must not change.
//!
//! The table is loaded once into an ordered map keyed by `(symbol, timestamp)`,
//! mutated with the union-with-override rule, and written back whole through
//! an atomic replace. A failed write rolls the in-memory table back, so memory
//! and disk never disagree.

use super::atomic::write_atomic;
use crate::domain::{normalize_symbol, Bar, Granularity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

type RowKey = (String, DateTime<Utc>);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store file {} is corrupt at line {line}: {reason}", path.display())]
    Corrupt {
        path: PathBuf,
        line: u64,
        reason: String,
    },

    #[error("I/O error on store file {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("row for {symbol} is {found}, but this store holds {expected} bars")]
    GranularityMismatch {
        symbol: String,
        expected: Granularity,
        found: Granularity,
    },
}

/// Whether a mutation is persisted or only measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Commit,
    DryRun,
}

/// Row delta of a merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeDelta {
    /// Keys that did not exist before.
    pub inserted: usize,
    /// Existing keys whose values changed (provider corrections).
    pub replaced: usize,
    /// Existing keys re-fetched with identical values.
    pub unchanged: usize,
}

impl MergeDelta {
    pub fn is_noop(&self) -> bool {
        self.inserted == 0 && self.replaced == 0
    }
}

/// Row delta of a symbol removal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveDelta {
    pub symbols: usize,
    pub rows: usize,
}

/// Persisted table of bars for one granularity.
#[derive(Debug)]
pub struct BarStore {
    path: PathBuf,
    granularity: Granularity,
    rows: BTreeMap<RowKey, Bar>,
    on_disk: bool,
}

/// Positions of the required columns in the header row.
struct Columns {
    ticker: usize,
    interval: usize,
    time: usize,
    adj_close: usize,
    close: usize,
    high: usize,
    low: usize,
    open: usize,
    volume: usize,
}

impl Columns {
    fn resolve(headers: &csv::StringRecord, granularity: Granularity) -> Result<Self, String> {
        let find = |name: &str| {
            headers
                .iter()
                .position(|h| h.trim() == name)
                .ok_or_else(|| format!("missing column '{name}'"))
        };
        Ok(Self {
            ticker: find("ticker")?,
            interval: find("interval")?,
            time: find(granularity.time_column())?,
            adj_close: find("Adj Close")?,
            close: find("Close")?,
            high: find("High")?,
            low: find("Low")?,
            open: find("Open")?,
            volume: find("Volume")?,
        })
    }
}

fn header(granularity: Granularity) -> [&'static str; 9] {
    [
        "ticker",
        "interval",
        granularity.time_column(),
        "Adj Close",
        "Close",
        "High",
        "Low",
        "Open",
        "Volume",
    ]
}

fn parse_price(raw: &str) -> Result<f64, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(f64::NAN);
    }
    raw.parse::<f64>()
        .map_err(|_| format!("invalid price '{raw}'"))
}

fn parse_volume(raw: &str) -> Result<u64, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(0);
    }
    if let Ok(v) = raw.parse::<u64>() {
        return Ok(v);
    }
    // Tolerate float-formatted volumes ("1200.0") from older writers.
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() && v >= 0.0 && v.fract() == 0.0 => Ok(v as u64),
        _ => Err(format!("invalid volume '{raw}'")),
    }
}

fn format_price(v: f64) -> String {
    if v.is_nan() {
        String::new()
    } else {
        v.to_string()
    }
}

impl BarStore {
    /// Load the table at `path`. A missing file is an empty store.
    ///
    /// An unreadable or malformed file is an error: the caller must not
    /// proceed and later overwrite data it could not read.
    pub fn open(path: impl Into<PathBuf>, granularity: Granularity) -> Result<Self, StoreError> {
        let path = path.into();
        if !path.exists() {
            return Ok(Self {
                path,
                granularity,
                rows: BTreeMap::new(),
                on_disk: false,
            });
        }

        let rows = Self::read_rows(&path, granularity)?;
        tracing::debug!(
            path = %path.display(),
            %granularity,
            rows = rows.len(),
            "store loaded"
        );

        Ok(Self {
            path,
            granularity,
            rows,
            on_disk: true,
        })
    }

    fn read_rows(path: &Path, granularity: Granularity) -> Result<BTreeMap<RowKey, Bar>, StoreError> {
        let corrupt = |line: u64, reason: String| StoreError::Corrupt {
            path: path.to_path_buf(),
            line,
            reason,
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(path)
            .map_err(|e| match e.into_kind() {
                csv::ErrorKind::Io(source) => StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                },
                other => corrupt(1, format!("{other:?}")),
            })?;

        let headers = reader
            .headers()
            .map_err(|e| corrupt(1, e.to_string()))?
            .clone();
        let cols = Columns::resolve(&headers, granularity).map_err(|reason| corrupt(1, reason))?;

        let mut rows = BTreeMap::new();
        let mut duplicates = 0usize;

        for record in reader.records() {
            let record = record.map_err(|e| {
                let line = e.position().map(|p| p.line()).unwrap_or(0);
                corrupt(line, e.to_string())
            })?;
            let line = record.position().map(|p| p.line()).unwrap_or(0);
            let field = |idx: usize| record.get(idx).unwrap_or("");

            let symbol = normalize_symbol(field(cols.ticker));
            if symbol.is_empty() {
                return Err(corrupt(line, "empty ticker".into()));
            }
            let interval = field(cols.interval).trim();
            if interval != granularity.label() {
                return Err(corrupt(
                    line,
                    format!("interval '{interval}' in a {granularity} store"),
                ));
            }
            let raw_ts = field(cols.time);
            let timestamp = granularity
                .parse_timestamp(raw_ts)
                .ok_or_else(|| corrupt(line, format!("invalid timestamp '{raw_ts}'")))?;

            let bar = Bar {
                symbol,
                granularity,
                timestamp,
                open: parse_price(field(cols.open)).map_err(|r| corrupt(line, r))?,
                high: parse_price(field(cols.high)).map_err(|r| corrupt(line, r))?,
                low: parse_price(field(cols.low)).map_err(|r| corrupt(line, r))?,
                close: parse_price(field(cols.close)).map_err(|r| corrupt(line, r))?,
                adj_close: parse_price(field(cols.adj_close)).map_err(|r| corrupt(line, r))?,
                volume: parse_volume(field(cols.volume)).map_err(|r| corrupt(line, r))?,
            };

            if rows.insert(bar.key(), bar).is_some() {
                duplicates += 1;
            }
        }

        if duplicates > 0 {
            tracing::warn!(
                path = %path.display(),
                duplicates,
                "store file contained duplicate keys; later rows kept"
            );
        }

        Ok(rows)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// True once the table has been written at least once.
    pub fn exists_on_disk(&self) -> bool {
        self.on_disk
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Distinct symbols present in the table.
    pub fn known_symbols(&self) -> BTreeSet<String> {
        let mut symbols = BTreeSet::new();
        for (symbol, _) in self.rows.keys() {
            if symbols.last() != Some(symbol) {
                symbols.insert(symbol.clone());
            }
        }
        symbols
    }

    /// Latest timestamp stored for a symbol, or `None` if it was never stored.
    pub fn watermark(&self, symbol: &str) -> Option<DateTime<Utc>> {
        self.symbol_range(symbol).next_back().map(|(k, _)| k.1)
    }

    /// Watermark of every symbol in one pass.
    pub fn watermarks(&self) -> BTreeMap<String, DateTime<Utc>> {
        let mut out = BTreeMap::new();
        for (symbol, ts) in self.rows.keys() {
            out.insert(symbol.clone(), *ts);
        }
        out
    }

    /// Rows of one symbol in ascending timestamp order.
    pub fn symbol_rows<'a>(&'a self, symbol: &str) -> impl DoubleEndedIterator<Item = &'a Bar> + 'a {
        self.symbol_range(symbol).map(|(_, bar)| bar)
    }

    /// All rows in `(symbol, timestamp)` order.
    pub fn rows(&self) -> impl Iterator<Item = &Bar> {
        self.rows.values()
    }

    fn symbol_range<'a>(
        &'a self,
        symbol: &str,
    ) -> std::collections::btree_map::Range<'a, RowKey, Bar> {
        let lo = (symbol.to_string(), DateTime::<Utc>::MIN_UTC);
        let hi = (symbol.to_string(), DateTime::<Utc>::MAX_UTC);
        self.rows.range(lo..=hi)
    }

    /// Normalize incoming rows and collapse duplicates (last one wins).
    fn prepare(&self, rows: Vec<Bar>) -> Result<BTreeMap<RowKey, Bar>, StoreError> {
        let mut incoming = BTreeMap::new();
        for mut bar in rows {
            if bar.granularity != self.granularity {
                return Err(StoreError::GranularityMismatch {
                    symbol: bar.symbol,
                    expected: self.granularity,
                    found: bar.granularity,
                });
            }
            bar.symbol = normalize_symbol(&bar.symbol);
            bar.timestamp = self.granularity.normalize(bar.timestamp);
            incoming.insert(bar.key(), bar);
        }
        Ok(incoming)
    }

    /// Delta that `merge_append` would produce, without touching anything.
    pub fn plan_merge(&self, rows: Vec<Bar>) -> Result<MergeDelta, StoreError> {
        let incoming = self.prepare(rows)?;
        Ok(self.measure(&incoming))
    }

    fn measure(&self, incoming: &BTreeMap<RowKey, Bar>) -> MergeDelta {
        let mut delta = MergeDelta::default();
        for (key, bar) in incoming {
            match self.rows.get(key) {
                None => delta.inserted += 1,
                Some(existing) if existing.same_values(bar) => delta.unchanged += 1,
                Some(_) => delta.replaced += 1,
            }
        }
        delta
    }

    /// Union new rows into the table, new rows winning on key conflicts, and
    /// rewrite the file.
    ///
    /// On a write failure the in-memory table is restored and the file on
    /// disk is left exactly as it was.
    pub fn merge_append(&mut self, rows: Vec<Bar>, mode: WriteMode) -> Result<MergeDelta, StoreError> {
        let incoming = self.prepare(rows)?;
        let delta = self.measure(&incoming);

        if mode == WriteMode::DryRun || delta.is_noop() {
            return Ok(delta);
        }

        let mut undo: Vec<(RowKey, Option<Bar>)> = Vec::with_capacity(incoming.len());
        for (key, bar) in incoming {
            let previous = self.rows.insert(key.clone(), bar);
            undo.push((key, previous));
        }

        if let Err(e) = self.persist() {
            for (key, previous) in undo.into_iter().rev() {
                match previous {
                    Some(bar) => {
                        self.rows.insert(key, bar);
                    }
                    None => {
                        self.rows.remove(&key);
                    }
                }
            }
            return Err(e);
        }

        tracing::debug!(
            granularity = %self.granularity,
            inserted = delta.inserted,
            replaced = delta.replaced,
            "merge committed"
        );
        Ok(delta)
    }

    /// Delete every row of the given symbols and rewrite the file.
    pub fn remove_symbols(
        &mut self,
        symbols: &BTreeSet<String>,
        mode: WriteMode,
    ) -> Result<RemoveDelta, StoreError> {
        let mut doomed: Vec<RowKey> = Vec::new();
        let mut delta = RemoveDelta::default();
        for symbol in symbols {
            let symbol = normalize_symbol(symbol);
            let before = doomed.len();
            doomed.extend(self.symbol_range(&symbol).map(|(k, _)| k.clone()));
            if doomed.len() > before {
                delta.symbols += 1;
            }
        }
        delta.rows = doomed.len();

        if mode == WriteMode::DryRun || doomed.is_empty() {
            return Ok(delta);
        }

        let mut removed = Vec::with_capacity(doomed.len());
        for key in doomed {
            if let Some(bar) = self.rows.remove(&key) {
                removed.push((key, bar));
            }
        }

        if let Err(e) = self.persist() {
            self.rows.extend(removed);
            return Err(e);
        }

        tracing::debug!(
            granularity = %self.granularity,
            symbols = delta.symbols,
            rows = delta.rows,
            "removal committed"
        );
        Ok(delta)
    }

    /// Serialize the whole table through an atomic replace.
    fn persist(&mut self) -> Result<(), StoreError> {
        let granularity = self.granularity;
        let rows = &self.rows;
        write_atomic(&self.path, |out| {
            let mut writer = csv::Writer::from_writer(out);
            writer.write_record(header(granularity))?;
            for bar in rows.values() {
                let record: [String; 9] = [
                    bar.symbol.clone(),
                    granularity.label().to_string(),
                    granularity.format_timestamp(bar.timestamp),
                    format_price(bar.adj_close),
                    format_price(bar.close),
                    format_price(bar.high),
                    format_price(bar.low),
                    format_price(bar.open),
                    bar.volume.to_string(),
                ];
                writer.write_record(&record)?;
            }
            writer.flush()?;
            Ok(())
        })
        .map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })?;
        self.on_disk = true;
        Ok(())
    }

    /// BLAKE3 digest of the file on disk, or `None` if it does not exist yet.
    pub fn file_digest(&self) -> Result<Option<String>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&self.path).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(Some(blake3::hash(&bytes).to_hex().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn daily(symbol: &str, y: i32, m: u32, d: u32, close: f64) -> Bar {
        Bar {
            symbol: symbol.into(),
            granularity: Granularity::Daily,
            timestamp: Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap(),
            open: close - 1.0,
            high: close + 1.0,
            low: close - 2.0,
            close,
            adj_close: close,
            volume: 1000,
        }
    }

    fn temp_store(granularity: Granularity) -> (tempfile::TempDir, BarStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BarStore::open(dir.path().join("prices.csv"), granularity).unwrap();
        (dir, store)
    }

    #[test]
    fn missing_file_is_empty_store() {
        let (_dir, store) = temp_store(Granularity::Daily);
        assert!(store.known_symbols().is_empty());
        assert!(store.watermark("AAA").is_none());
        assert!(!store.exists_on_disk());
    }

    #[test]
    fn merge_writes_sorted_file_with_contract_header() {
        let (_dir, mut store) = temp_store(Granularity::Daily);
        let delta = store
            .merge_append(
                vec![
                    daily("BBB", 2024, 1, 3, 20.0),
                    daily("AAA", 2024, 1, 3, 11.0),
                    daily("AAA", 2024, 1, 2, 10.5),
                ],
                WriteMode::Commit,
            )
            .unwrap();
        assert_eq!(delta.inserted, 3);

        let text = std::fs::read_to_string(store.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "ticker,interval,Date,Adj Close,Close,High,Low,Open,Volume");
        assert_eq!(lines[1], "AAA,daily,2024-01-02,10.5,10.5,11.5,8.5,9.5,1000");
        assert!(lines[2].starts_with("AAA,daily,2024-01-03"));
        assert!(lines[3].starts_with("BBB,daily,2024-01-03"));
    }

    #[test]
    fn reload_sees_same_rows() {
        let (dir, mut store) = temp_store(Granularity::Daily);
        store
            .merge_append(vec![daily("AAA", 2024, 1, 2, 10.0)], WriteMode::Commit)
            .unwrap();

        let reopened = BarStore::open(dir.path().join("prices.csv"), Granularity::Daily).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.rows().next(), store.rows().next());
    }

    #[test]
    fn new_rows_override_existing_values() {
        let (_dir, mut store) = temp_store(Granularity::Daily);
        store
            .merge_append(vec![daily("AAA", 2024, 1, 2, 10.0)], WriteMode::Commit)
            .unwrap();
        let delta = store
            .merge_append(
                vec![daily("AAA", 2024, 1, 2, 10.25), daily("AAA", 2024, 1, 3, 11.0)],
                WriteMode::Commit,
            )
            .unwrap();

        assert_eq!(delta.inserted, 1);
        assert_eq!(delta.replaced, 1);
        assert_eq!(store.len(), 2);
        assert_eq!(store.symbol_rows("AAA").next().unwrap().close, 10.25);
    }

    #[test]
    fn watermark_is_latest_timestamp() {
        let (_dir, mut store) = temp_store(Granularity::Daily);
        store
            .merge_append(
                vec![
                    daily("AAA", 2024, 1, 5, 10.0),
                    daily("AAA", 2024, 1, 2, 10.0),
                    daily("AB", 2024, 2, 1, 10.0),
                ],
                WriteMode::Commit,
            )
            .unwrap();
        assert_eq!(
            store.watermark("AAA"),
            Some(Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap())
        );
        assert_eq!(store.watermarks().len(), 2);
        assert!(store.watermark("AA").is_none());
    }

    #[test]
    fn dry_run_reports_delta_without_writing() {
        let (_dir, mut store) = temp_store(Granularity::Daily);
        let delta = store
            .merge_append(vec![daily("AAA", 2024, 1, 2, 10.0)], WriteMode::DryRun)
            .unwrap();
        assert_eq!(delta.inserted, 1);
        assert!(store.is_empty());
        assert!(!store.path().exists());
    }

    #[test]
    fn remove_symbols_deletes_only_named_rows() {
        let (_dir, mut store) = temp_store(Granularity::Daily);
        store
            .merge_append(
                vec![
                    daily("AAA", 2024, 1, 2, 10.0),
                    daily("AAA", 2024, 1, 3, 10.0),
                    daily("BBB", 2024, 1, 2, 10.0),
                ],
                WriteMode::Commit,
            )
            .unwrap();

        let doomed: BTreeSet<String> = ["AAA".to_string(), "ZZZ".to_string()].into();
        let delta = store.remove_symbols(&doomed, WriteMode::Commit).unwrap();

        assert_eq!(delta, RemoveDelta { symbols: 1, rows: 2 });
        assert_eq!(store.known_symbols(), ["BBB".to_string()].into());
        let text = std::fs::read_to_string(store.path()).unwrap();
        assert!(!text.contains("AAA"));
    }

    #[test]
    fn failed_write_rolls_back_memory_and_keeps_file() {
        let (_dir, mut store) = temp_store(Granularity::Daily);
        store
            .merge_append(vec![daily("AAA", 2024, 1, 2, 10.0)], WriteMode::Commit)
            .unwrap();
        let before = std::fs::read(store.path()).unwrap();

        // A directory squatting on the temp path makes the write fail.
        std::fs::create_dir(super::super::atomic::temp_path_for(store.path())).unwrap();

        let result = store.merge_append(vec![daily("AAA", 2024, 1, 3, 11.0)], WriteMode::Commit);
        assert!(matches!(result, Err(StoreError::Io { .. })));
        assert_eq!(store.len(), 1);
        assert_eq!(std::fs::read(store.path()).unwrap(), before);

        let result = store.remove_symbols(&["AAA".to_string()].into(), WriteMode::Commit);
        assert!(result.is_err());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prices.csv");
        std::fs::write(
            &path,
            "ticker,interval,Date,Adj Close,Close,High,Low,Open,Volume\n\
             AAA,daily,not-a-date,1,1,1,1,1,1\n",
        )
        .unwrap();
        let err = BarStore::open(&path, Granularity::Daily).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { line: 2, .. }), "{err}");
    }

    #[test]
    fn missing_column_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prices.csv");
        std::fs::write(&path, "ticker,interval,Date,Close\nAAA,daily,2024-01-02,1\n").unwrap();
        assert!(matches!(
            BarStore::open(&path, Granularity::Daily),
            Err(StoreError::Corrupt { line: 1, .. })
        ));
    }

    #[test]
    fn wrong_granularity_rows_are_rejected() {
        let (_dir, mut store) = temp_store(Granularity::Hourly);
        let result = store.merge_append(vec![daily("AAA", 2024, 1, 2, 10.0)], WriteMode::Commit);
        assert!(matches!(result, Err(StoreError::GranularityMismatch { .. })));
    }

    #[test]
    fn hourly_store_writes_tz_qualified_datetimes() {
        let (_dir, mut store) = temp_store(Granularity::Hourly);
        let mut bar = daily("AAA", 2024, 1, 2, 10.0);
        bar.granularity = Granularity::Hourly;
        bar.timestamp = Utc.with_ymd_and_hms(2024, 1, 2, 14, 30, 0).unwrap();
        store.merge_append(vec![bar], WriteMode::Commit).unwrap();

        let text = std::fs::read_to_string(store.path()).unwrap();
        assert!(text.starts_with("ticker,interval,Datetime,"));
        assert!(text.contains("AAA,hourly,2024-01-02 14:30:00+00:00,"));
    }

    #[test]
    fn nan_prices_round_trip_as_empty_cells() {
        let (dir, mut store) = temp_store(Granularity::Daily);
        let mut bar = daily("AAA", 2024, 1, 2, 10.0);
        bar.adj_close = f64::NAN;
        store.merge_append(vec![bar.clone()], WriteMode::Commit).unwrap();

        let text = std::fs::read_to_string(store.path()).unwrap();
        assert!(text.contains("AAA,daily,2024-01-02,,10,"));

        let reopened = BarStore::open(dir.path().join("prices.csv"), Granularity::Daily).unwrap();
        assert!(reopened.rows().next().unwrap().same_values(&bar));
    }

    #[test]
    fn lowercase_symbols_are_normalized_on_merge() {
        let (_dir, mut store) = temp_store(Granularity::Daily);
        store
            .merge_append(vec![daily("aaa", 2024, 1, 2, 10.0)], WriteMode::Commit)
            .unwrap();
        assert!(store.known_symbols().contains("AAA"));
    }
}
