//! Listing instruments and the exclusion rule for non-standard classes.
//!
//! Eligibility is derived from the symbol at resolution time; nothing about
//! it is persisted.

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Default pattern for symbols that are not plain common stock.
///
/// - special characters used for preferred shares, share classes, and
///   when-issued lines (`^ . / - =`, whitespace)
/// - NASDAQ fifth-letter suffixes: W warrant, U unit, R right, V when-issued
/// - NASDAQ test issuers (`ZAZZT`, `ZBZZT`, ...)
pub const DEFAULT_EXCLUSION_PATTERN: &str = r"[\^./\-=\s]|^[A-Z]{4}[WURV]$|^Z[A-Z]ZZT$";

/// Listing candidate: a symbol and the reference price used for range filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    pub price: Option<f64>,
}

impl Instrument {
    pub fn new(symbol: impl AsRef<str>, price: Option<f64>) -> Self {
        Self {
            symbol: normalize_symbol(symbol.as_ref()),
            price,
        }
    }

    /// Eligibility is derived, never stored: standard equity per the rule.
    pub fn is_standard_equity(&self, rule: &ExclusionRule) -> bool {
        !rule.excludes(&self.symbol)
    }
}

/// Canonical symbol form: trimmed, upper-case.
pub fn normalize_symbol(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// Compiled exclusion pattern for non-standard instrument classes.
#[derive(Debug, Clone)]
pub struct ExclusionRule {
    pattern: Regex,
}

impl ExclusionRule {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }

    /// True when the symbol is empty or matches the exclusion pattern.
    pub fn excludes(&self, symbol: &str) -> bool {
        symbol.is_empty() || self.pattern.is_match(symbol)
    }

    pub fn as_str(&self) -> &str {
        self.pattern.as_str()
    }
}
