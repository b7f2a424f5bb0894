//! Data provider trait and structured error types.
//!
//! The BarProvider trait abstracts over data sources (Yahoo Finance, a scripted
//! in-memory source) so the synchronization engine can be driven and tested
//! without the network.

use crate::domain::{Bar, Granularity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors from a single provider call.
///
/// Every variant is a per-symbol, per-attempt failure. The fetcher decides
/// whether to retry; the provider never sleeps or retries on its own.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("symbol not found or delisted: {symbol}")]
    SymbolNotFound { symbol: String },

    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
}

impl ProviderError {
    pub fn class(&self) -> FailureClass {
        match self {
            ProviderError::NetworkUnreachable(_) => FailureClass::Network,
            ProviderError::RateLimited { .. } => FailureClass::RateLimited,
            ProviderError::ResponseFormatChanged(_) => FailureClass::MalformedResponse,
            ProviderError::SymbolNotFound { .. } => FailureClass::Delisted,
            ProviderError::AuthenticationRequired(_) | ProviderError::Http { .. } => {
                FailureClass::Provider
            }
        }
    }
}

/// Reason class reported for a failed symbol at the end of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Network,
    RateLimited,
    MalformedResponse,
    Delisted,
    Provider,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureClass::Network => "network",
            FailureClass::RateLimited => "rate-limited",
            FailureClass::MalformedResponse => "malformed-response",
            FailureClass::Delisted => "delisted",
            FailureClass::Provider => "provider",
        };
        f.write_str(s)
    }
}

/// Remote source of bars.
///
/// `Ok(vec![])` means the provider answered and has no bars in the window;
/// that is a success, not a failure.
pub trait BarProvider: Send + Sync {
    /// Human-readable name of this provider.
    fn name(&self) -> &str;

    /// Fetch bars for one symbol in `[start, end]`.
    fn fetch_bars(
        &self,
        symbol: &str,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>, ProviderError>;
}
