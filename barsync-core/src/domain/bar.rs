//! Bar — one OHLCV record for one symbol at one timestamp.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bar resolution. Each granularity lives in its own store file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Daily,
    /// Intraday bars at the provider's hourly resolution.
    Hourly,
}

impl Granularity {
    pub const ALL: [Granularity; 2] = [Granularity::Daily, Granularity::Hourly];

    /// Value written to the `interval` column.
    pub fn label(self) -> &'static str {
        match self {
            Granularity::Daily => "daily",
            Granularity::Hourly => "hourly",
        }
    }

    /// Name of the timestamp column in the store file.
    pub fn time_column(self) -> &'static str {
        match self {
            Granularity::Daily => "Date",
            Granularity::Hourly => "Datetime",
        }
    }

    /// Smallest distance between two consecutive bars.
    pub fn step(self) -> Duration {
        match self {
            Granularity::Daily => Duration::days(1),
            Granularity::Hourly => Duration::hours(1),
        }
    }

    pub fn is_intraday(self) -> bool {
        matches!(self, Granularity::Hourly)
    }

    /// Snap a timestamp to this granularity's key space.
    ///
    /// Daily bars are keyed by calendar date, stored as midnight UTC.
    pub fn normalize(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Granularity::Daily => date_to_utc(ts.date_naive()),
            Granularity::Hourly => ts,
        }
    }

    /// Render a timestamp the way the store file expects it.
    ///
    /// Daily: `YYYY-MM-DD`. Hourly: `YYYY-MM-DD HH:MM:SS+00:00`.
    pub fn format_timestamp(self, ts: DateTime<Utc>) -> String {
        match self {
            Granularity::Daily => ts.format("%Y-%m-%d").to_string(),
            Granularity::Hourly => ts.format("%Y-%m-%d %H:%M:%S%:z").to_string(),
        }
    }

    /// Parse a timestamp cell from the store file.
    pub fn parse_timestamp(self, raw: &str) -> Option<DateTime<Utc>> {
        let raw = raw.trim();
        match self {
            Granularity::Daily => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .map(date_to_utc),
            Granularity::Hourly => DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%:z")
                .or_else(|_| DateTime::parse_from_rfc3339(raw))
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" | "1d" => Ok(Granularity::Daily),
            "hourly" | "intraday" | "1h" => Ok(Granularity::Hourly),
            other => Err(format!("unknown granularity '{other}'")),
        }
    }
}

/// Midnight UTC of a calendar date.
pub fn date_to_utc(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(chrono::NaiveTime::MIN).and_utc()
}

/// OHLCV bar for a single symbol at a single timestamp.
///
/// Missing prices from the provider are carried as NaN and written as empty
/// cells. Volume defaults to zero when the provider omits it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub granularity: Granularity,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub adj_close: f64,
    pub volume: u64,
}

impl Bar {
    /// Store key. Unique within one granularity's table.
    pub fn key(&self) -> (String, DateTime<Utc>) {
        (self.symbol.clone(), self.timestamp)
    }

    /// Field-wise equality that treats two NaNs as equal.
    ///
    /// Used by the store to tell an unchanged re-fetch from a correction.
    pub fn same_values(&self, other: &Bar) -> bool {
        fn eq(a: f64, b: f64) -> bool {
            (a.is_nan() && b.is_nan()) || a == b
        }
        self.symbol == other.symbol
            && self.granularity == other.granularity
            && self.timestamp == other.timestamp
            && eq(self.open, other.open)
            && eq(self.high, other.high)
            && eq(self.low, other.low)
            && eq(self.close, other.close)
            && eq(self.adj_close, other.adj_close)
            && self.volume == other.volume
    }
}
