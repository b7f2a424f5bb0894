//! Serializable synchronization configuration.
//!
//! One immutable `SyncConfig` value is loaded at startup (TOML file plus CLI
//! overrides), validated, and then passed by reference into every component.
//! Nothing reads process-wide settings after that point.

use crate::domain::ExclusionRule;
use crate::domain::DEFAULT_EXCLUSION_PATTERN;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Upper bound on `intraday_max_days`; the provider serves far less.
pub const MAX_INTRADAY_DAYS: i64 = 3_650;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid price range: {0}")]
    PriceRange(String),

    #[error("invalid dates: {0}")]
    Dates(String),

    #[error("invalid fetch settings: {0}")]
    Fetch(String),

    #[error("invalid exclusion pattern '{pattern}': {reason}")]
    ExclusionPattern { pattern: String, reason: String },
}

/// Complete configuration for a synchronization run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub universe: UniverseConfig,
    pub history: HistoryConfig,
    pub storage: StorageConfig,
    pub fetch: FetchConfig,
    pub staleness: StalenessConfig,
    pub report: ReportConfig,
}

/// Listing snapshot location and eligibility filter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UniverseConfig {
    pub listing_path: PathBuf,
    pub symbol_column: String,
    pub price_column: String,
    /// Inclusive lower bound of the reference price.
    pub min_price: f64,
    /// Inclusive upper bound of the reference price.
    pub max_price: f64,
    pub exclusion_pattern: String,
}

impl Default for UniverseConfig {
    fn default() -> Self {
        Self {
            listing_path: PathBuf::from("nasdaq_screener.csv"),
            symbol_column: "Symbol".into(),
            price_column: "Last Sale".into(),
            min_price: 2.0,
            max_price: 200.0,
            exclusion_pattern: DEFAULT_EXCLUSION_PATTERN.into(),
        }
    }
}

/// Backfill range.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HistoryConfig {
    /// First date requested by a full-history backfill.
    pub start_date: NaiveDate,
    /// Fixed end of every fetch window. `None` means "now".
    pub end_date: Option<NaiveDate>,
    /// How far back the provider serves intraday bars.
    pub intraday_max_days: i64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            start_date: NaiveDate::from_ymd_opt(2018, 1, 2).unwrap_or_default(),
            end_date: None,
            intraday_max_days: 729,
        }
    }
}

/// Persisted file locations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub daily_path: PathBuf,
    pub hourly_path: PathBuf,
    pub staleness_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            daily_path: PathBuf::from("prices_daily.csv"),
            hourly_path: PathBuf::from("prices_hourly.csv"),
            staleness_path: PathBuf::from("staleness.json"),
        }
    }
}

/// Rate limiting and retry discipline for provider calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FetchConfig {
    /// Symbols per batch. Each batch ends in one store flush.
    pub batch_size: usize,
    /// Provider calls between two pauses.
    pub pause_after_calls: usize,
    pub pause_duration_secs: u64,
    /// Additional attempts after the first failure.
    pub max_retries: u32,
    /// Wait before the first retry; doubles on every further retry.
    pub retry_backoff_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            pause_after_calls: 500,
            pause_duration_secs: 60,
            max_retries: 3,
            retry_backoff_secs: 5,
            request_timeout_secs: 30,
        }
    }
}

impl FetchConfig {
    pub fn pause_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.pause_duration_secs)
    }

    pub fn retry_backoff(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.retry_backoff_secs)
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StalenessConfig {
    pub threshold_days: i64,
}

impl Default for StalenessConfig {
    fn default() -> Self {
        Self { threshold_days: 5 }
    }
}

/// Thresholds used by the status report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReportConfig {
    pub gap_threshold_days: i64,
    pub min_observations: usize,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            gap_threshold_days: 7,
            min_observations: 100,
        }
    }
}

impl SyncConfig {
    /// Load a config from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string. Missing keys take defaults.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Reject settings that would make a run meaningless.
    ///
    /// Runs before any network or file activity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let u = &self.universe;
        if !u.min_price.is_finite() || !u.max_price.is_finite() {
            return Err(ConfigError::PriceRange("bounds must be finite".into()));
        }
        if u.min_price < 0.0 {
            return Err(ConfigError::PriceRange(format!(
                "min_price {} is negative",
                u.min_price
            )));
        }
        if u.min_price > u.max_price {
            return Err(ConfigError::PriceRange(format!(
                "min_price {} exceeds max_price {}",
                u.min_price, u.max_price
            )));
        }
        self.exclusion_rule()?;

        if let Some(end) = self.history.end_date {
            if end < self.history.start_date {
                return Err(ConfigError::Dates(format!(
                    "end_date {end} precedes start_date {}",
                    self.history.start_date
                )));
            }
        }
        if self.history.intraday_max_days <= 0 {
            return Err(ConfigError::Dates(
                "intraday_max_days must be positive".into(),
            ));
        }
        if self.history.intraday_max_days > MAX_INTRADAY_DAYS {
            return Err(ConfigError::Dates(format!(
                "intraday_max_days {} exceeds {MAX_INTRADAY_DAYS}",
                self.history.intraday_max_days
            )));
        }
        if self.staleness.threshold_days < 0 {
            return Err(ConfigError::Dates(
                "staleness threshold_days must not be negative".into(),
            ));
        }

        if self.fetch.batch_size == 0 {
            return Err(ConfigError::Fetch("batch_size must be at least 1".into()));
        }
        if self.fetch.pause_after_calls == 0 {
            return Err(ConfigError::Fetch(
                "pause_after_calls must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn exclusion_rule(&self) -> Result<ExclusionRule, ConfigError> {
        ExclusionRule::new(&self.universe.exclusion_pattern).map_err(|e| {
            ConfigError::ExclusionPattern {
                pattern: self.universe.exclusion_pattern.clone(),
                reason: e.to_string(),
            }
        })
    }

    /// Path of the store file for a granularity.
    pub fn store_path(&self, granularity: crate::domain::Granularity) -> &Path {
        match granularity {
            crate::domain::Granularity::Daily => &self.storage.daily_path,
            crate::domain::Granularity::Hourly => &self.storage.hourly_path,
        }
    }

    /// Effective end of every fetch window.
    ///
    /// A configured `end_date` pins the run to the end of that day.
    pub fn effective_now(&self, wall_clock: DateTime<Utc>) -> DateTime<Utc> {
        match self.history.end_date {
            Some(end) => {
                let end_of_day = crate::domain::date_to_utc(end)
                    .checked_add_signed(Duration::seconds(86_399))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                end_of_day.min(wall_clock)
            }
            None => wall_clock,
        }
    }

    /// Earliest timestamp the provider will serve intraday bars for.
    ///
    /// Saturates at the earliest representable instant.
    pub fn intraday_earliest(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        Duration::try_days(self.history.intraday_max_days)
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn defaults_match_downloader_settings() {
        let cfg = SyncConfig::default();
        assert_eq!(cfg.universe.min_price, 2.0);
        assert_eq!(cfg.universe.max_price, 200.0);
        assert_eq!(cfg.fetch.batch_size, 50);
        assert_eq!(cfg.fetch.max_retries, 3);
        assert_eq!(cfg.fetch.retry_backoff_secs, 5);
        assert_eq!(cfg.staleness.threshold_days, 5);
        assert_eq!(cfg.history.intraday_max_days, 729);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = SyncConfig::from_toml(
            r#"
            [universe]
            min_price = 5.0

            [fetch]
            batch_size = 10
            "#,
        )
        .unwrap();
        assert_eq!(cfg.universe.min_price, 5.0);
        assert_eq!(cfg.universe.max_price, 200.0);
        assert_eq!(cfg.fetch.batch_size, 10);
        assert_eq!(cfg.fetch.pause_after_calls, 500);
    }

    #[test]
    fn toml_roundtrip() {
        let cfg = SyncConfig::default();
        let text = cfg.to_toml().unwrap();
        assert_eq!(SyncConfig::from_toml(&text).unwrap(), cfg);
    }

    #[test]
    fn inverted_price_range_is_rejected() {
        let mut cfg = SyncConfig::default();
        cfg.universe.min_price = 300.0;
        assert!(matches!(cfg.validate(), Err(ConfigError::PriceRange(_))));
    }

    #[test]
    fn end_before_start_is_rejected() {
        let mut cfg = SyncConfig::default();
        cfg.history.end_date = NaiveDate::from_ymd_opt(2017, 1, 1);
        assert!(matches!(cfg.validate(), Err(ConfigError::Dates(_))));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let mut cfg = SyncConfig::default();
        cfg.fetch.batch_size = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Fetch(_))));
    }

    #[test]
    fn broken_exclusion_pattern_is_rejected() {
        let mut cfg = SyncConfig::default();
        cfg.universe.exclusion_pattern = "[unclosed".into();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ExclusionPattern { .. })
        ));
    }

    #[test]
    fn oversized_intraday_window_is_rejected() {
        let mut cfg = SyncConfig::default();
        cfg.history.intraday_max_days = 200_000_000;
        assert!(matches!(cfg.validate(), Err(ConfigError::Dates(_))));

        cfg.history.intraday_max_days = MAX_INTRADAY_DAYS;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn intraday_earliest_saturates_instead_of_overflowing() {
        let mut cfg = SyncConfig::default();
        let now = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
        assert_eq!(cfg.intraday_earliest(now), now - Duration::days(729));

        cfg.history.intraday_max_days = 200_000_000;
        assert_eq!(cfg.intraday_earliest(now), DateTime::<Utc>::MIN_UTC);
        cfg.history.intraday_max_days = i64::MAX;
        assert_eq!(cfg.intraday_earliest(now), DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn end_date_at_calendar_limit_does_not_overflow() {
        let mut cfg = SyncConfig::default();
        let wall = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        cfg.history.end_date = Some(NaiveDate::MAX);
        assert_eq!(cfg.effective_now(wall), wall);
    }

    #[test]
    fn fixed_end_date_pins_now() {
        let mut cfg = SyncConfig::default();
        let wall = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        assert_eq!(cfg.effective_now(wall), wall);

        cfg.history.end_date = NaiveDate::from_ymd_opt(2024, 1, 10);
        assert_eq!(
            cfg.effective_now(wall),
            Utc.with_ymd_and_hms(2024, 1, 10, 23, 59, 59).unwrap()
        );
    }
}
