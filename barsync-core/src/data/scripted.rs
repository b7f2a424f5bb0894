//! Scripted in-memory provider.
//!
//! Serves bars from a per-symbol history filtered to the requested window,
//! or replays queued responses (failures included) ahead of that history.
//! Every call is logged so callers can assert on windows and attempt counts.

use super::provider::{BarProvider, ProviderError};
use crate::domain::{normalize_symbol, Bar, Granularity};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

type ScriptKey = (String, Granularity);

/// One recorded `fetch_bars` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCall {
    pub symbol: String,
    pub granularity: Granularity,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Default)]
pub struct ScriptedProvider {
    history: Mutex<HashMap<ScriptKey, Vec<Bar>>>,
    queued: Mutex<HashMap<ScriptKey, VecDeque<Result<Vec<Bar>, ProviderError>>>>,
    always_fail: Mutex<HashMap<ScriptKey, ProviderError>>,
    calls: Mutex<Vec<ProviderCall>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the full history the provider knows for a symbol.
    pub fn with_history(self, symbol: &str, granularity: Granularity, bars: Vec<Bar>) -> Self {
        lock(&self.history).insert((normalize_symbol(symbol), granularity), bars);
        self
    }

    /// Queue one response, returned verbatim before history is consulted.
    pub fn push_response(
        &self,
        symbol: &str,
        granularity: Granularity,
        response: Result<Vec<Bar>, ProviderError>,
    ) {
        lock(&self.queued)
            .entry((normalize_symbol(symbol), granularity))
            .or_default()
            .push_back(response);
    }

    /// Make every call for a symbol fail with `error`.
    pub fn fail_always(&self, symbol: &str, granularity: Granularity, error: ProviderError) {
        lock(&self.always_fail).insert((normalize_symbol(symbol), granularity), error);
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        lock(&self.calls).clone()
    }

    pub fn calls_for(&self, symbol: &str, granularity: Granularity) -> Vec<ProviderCall> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.symbol == symbol && c.granularity == granularity)
            .cloned()
            .collect()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }
}

impl BarProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn fetch_bars(
        &self,
        symbol: &str,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>, ProviderError> {
        let key = (normalize_symbol(symbol), granularity);
        lock(&self.calls).push(ProviderCall {
            symbol: key.0.clone(),
            granularity,
            start,
            end,
        });

        if let Some(response) = lock(&self.queued).get_mut(&key).and_then(|q| q.pop_front()) {
            return response;
        }
        if let Some(error) = lock(&self.always_fail).get(&key) {
            return Err(error.clone());
        }

        match lock(&self.history).get(&key) {
            Some(bars) => Ok(bars
                .iter()
                .filter(|b| b.timestamp >= start && b.timestamp <= end)
                .cloned()
                .collect()),
            None => Err(ProviderError::SymbolNotFound { symbol: key.0 }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bar(d: u32) -> Bar {
        Bar {
            symbol: "AAA".into(),
            granularity: Granularity::Daily,
            timestamp: Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap(),
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            adj_close: 1.0,
            volume: 1,
        }
    }

    fn ts(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn history_is_filtered_to_window() {
        let p = ScriptedProvider::new().with_history("AAA", Granularity::Daily, (1..=9).map(bar).collect());
        let bars = p.fetch_bars("AAA", Granularity::Daily, ts(3), ts(5)).unwrap();
        assert_eq!(bars.len(), 3);
        assert_eq!(p.call_count(), 1);
    }

    #[test]
    fn queued_responses_come_first() {
        let p = ScriptedProvider::new().with_history("AAA", Granularity::Daily, vec![bar(2)]);
        p.push_response(
            "AAA",
            Granularity::Daily,
            Err(ProviderError::NetworkUnreachable("down".into())),
        );
        assert!(p.fetch_bars("AAA", Granularity::Daily, ts(1), ts(5)).is_err());
        assert_eq!(p.fetch_bars("AAA", Granularity::Daily, ts(1), ts(5)).unwrap().len(), 1);
    }

    #[test]
    fn unknown_symbol_is_not_found() {
        let p = ScriptedProvider::new();
        assert!(matches!(
            p.fetch_bars("ZZZ", Granularity::Daily, ts(1), ts(5)),
            Err(ProviderError::SymbolNotFound { .. })
        ));
    }
}
