//! Rate-limited fetcher — sequential provider access with pacing and retries.
//!
//! Every provider call goes through here. Calls are strictly sequential; after
//! `pause_after_calls` calls the whole run sleeps for `pause_duration`. A
//! failing call is retried up to `max_retries` times with a doubling backoff.
//! Exhausted retries produce a [`FetchFailure`] value, never an error that
//! aborts the run.

use barsync_core::config::FetchConfig;
use barsync_core::data::{BarProvider, FailureClass, ProviderError};
use barsync_core::domain::{Bar, Granularity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;

/// Why the fetcher is about to block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepReason {
    /// Wait between two attempts for the same symbol.
    Backoff,
    /// Periodic pause after `pause_after_calls` provider calls.
    RatePause,
}

/// Blocking wait. The only suspension point of a run.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration, reason: SleepReason);
}

/// Real sleeper backed by `std::thread::sleep`.
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration, _reason: SleepReason) {
        std::thread::sleep(duration);
    }
}

/// Sleeper that only records the waits it was asked for.
#[derive(Default)]
pub struct RecordingSleeper {
    waits: Mutex<Vec<(Duration, SleepReason)>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn waits(&self) -> Vec<(Duration, SleepReason)> {
        self.waits
            .lock()
            .map(|w| w.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn waits_for(&self, reason: SleepReason) -> Vec<Duration> {
        self.waits()
            .into_iter()
            .filter(|(_, r)| *r == reason)
            .map(|(d, _)| d)
            .collect()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration, reason: SleepReason) {
        match self.waits.lock() {
            Ok(mut w) => w.push((duration, reason)),
            Err(poisoned) => poisoned.into_inner().push((duration, reason)),
        }
    }
}

/// Attempt budget and backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &FetchConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: config.retry_backoff(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        1 + self.max_retries
    }

    /// Wait before retry number `retry` (1-based): initial, 2x, 4x, ...
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff.saturating_mul(factor)
    }
}

/// Next step after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Per-symbol retry state: attempts made so far.
#[derive(Debug, Clone, Copy)]
pub struct RetryState {
    policy: RetryPolicy,
    attempts: u32,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Register that an attempt is being made.
    pub fn begin_attempt(&mut self) {
        self.attempts += 1;
    }

    /// Register a failure of the current attempt.
    pub fn on_failure(&self) -> RetryDecision {
        if self.attempts >= self.policy.max_attempts() {
            RetryDecision::GiveUp
        } else {
            RetryDecision::RetryAfter(self.policy.backoff(self.attempts))
        }
    }
}

/// One symbol's fetch window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub symbol: String,
    pub granularity: Granularity,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// A symbol that exhausted its retries in this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchFailure {
    pub symbol: String,
    pub granularity: Granularity,
    pub class: FailureClass,
    pub message: String,
    pub attempts: u32,
}

/// Counters reported at the end of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchStats {
    pub provider_calls: usize,
    pub retries: usize,
    pub pauses: usize,
}

/// Result of fetching one batch of requests.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Requests that succeeded, with their rows (possibly none).
    pub fetched: Vec<(FetchRequest, Vec<Bar>)>,
    pub failures: Vec<FetchFailure>,
}

pub struct RateLimitedFetcher<'a> {
    provider: &'a dyn BarProvider,
    sleeper: &'a dyn Sleeper,
    policy: RetryPolicy,
    batch_size: usize,
    pause_after_calls: usize,
    pause_duration: Duration,
    calls_since_pause: usize,
    stats: FetchStats,
}

impl<'a> RateLimitedFetcher<'a> {
    pub fn new(provider: &'a dyn BarProvider, sleeper: &'a dyn Sleeper, config: &FetchConfig) -> Self {
        Self {
            provider,
            sleeper,
            policy: RetryPolicy::from_config(config),
            batch_size: config.batch_size.max(1),
            pause_after_calls: config.pause_after_calls.max(1),
            pause_duration: config.pause_duration(),
            calls_since_pause: 0,
            stats: FetchStats::default(),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn stats(&self) -> FetchStats {
        self.stats
    }

    /// One provider call, preceded by the periodic pause when it is due.
    fn call(&mut self, req: &FetchRequest) -> Result<Vec<Bar>, ProviderError> {
        if self.calls_since_pause >= self.pause_after_calls {
            tracing::info!(
                calls = self.stats.provider_calls,
                wait_secs = self.pause_duration.as_secs(),
                "pausing to respect provider rate limits"
            );
            self.sleeper.sleep(self.pause_duration, SleepReason::RatePause);
            self.stats.pauses += 1;
            self.calls_since_pause = 0;
        }
        self.calls_since_pause += 1;
        self.stats.provider_calls += 1;
        self.provider
            .fetch_bars(&req.symbol, req.granularity, req.start, req.end)
    }

    /// Fetch one symbol's window, retrying per the policy.
    ///
    /// `Ok(vec![])` is a successful empty answer.
    pub fn fetch(&mut self, req: &FetchRequest) -> Result<Vec<Bar>, FetchFailure> {
        let mut state = RetryState::new(self.policy);
        loop {
            state.begin_attempt();
            let err = match self.call(req) {
                Ok(bars) => {
                    tracing::debug!(
                        symbol = %req.symbol,
                        granularity = %req.granularity,
                        rows = bars.len(),
                        attempt = state.attempts(),
                        "fetched"
                    );
                    return Ok(bars);
                }
                Err(e) => e,
            };

            match state.on_failure() {
                RetryDecision::RetryAfter(wait) => {
                    tracing::warn!(
                        symbol = %req.symbol,
                        granularity = %req.granularity,
                        attempt = state.attempts(),
                        wait_secs = wait.as_secs(),
                        error = %err,
                        "fetch failed, retrying"
                    );
                    self.sleeper.sleep(wait, SleepReason::Backoff);
                    self.stats.retries += 1;
                }
                RetryDecision::GiveUp => {
                    tracing::warn!(
                        symbol = %req.symbol,
                        granularity = %req.granularity,
                        attempts = state.attempts(),
                        class = %err.class(),
                        error = %err,
                        "fetch failed, giving up for this run"
                    );
                    return Err(FetchFailure {
                        symbol: req.symbol.clone(),
                        granularity: req.granularity,
                        class: err.class(),
                        message: err.to_string(),
                        attempts: state.attempts(),
                    });
                }
            }
        }
    }

    /// Fetch every request of one batch in order.
    pub fn fetch_batch(&mut self, requests: &[FetchRequest]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for req in requests {
            match self.fetch(req) {
                Ok(bars) => outcome.fetched.push((req.clone(), bars)),
                Err(failure) => outcome.failures.push(failure),
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use barsync_core::data::ScriptedProvider;
    use barsync_core::domain::Bar;
    use chrono::TimeZone;

    fn config() -> FetchConfig {
        FetchConfig {
            batch_size: 2,
            pause_after_calls: 3,
            pause_duration_secs: 60,
            max_retries: 3,
            retry_backoff_secs: 5,
            request_timeout_secs: 30,
        }
    }

    fn request(symbol: &str) -> FetchRequest {
        FetchRequest {
            symbol: symbol.into(),
            granularity: Granularity::Daily,
            start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap(),
        }
    }

    fn bar(symbol: &str, day: u32) -> Bar {
        Bar {
            symbol: symbol.into(),
            granularity: Granularity::Daily,
            timestamp: Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap(),
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            adj_close: 1.0,
            volume: 1,
        }
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy::from_config(&config());
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.backoff(1), Duration::from_secs(5));
        assert_eq!(policy.backoff(2), Duration::from_secs(10));
        assert_eq!(policy.backoff(3), Duration::from_secs(20));
    }

    #[test]
    fn retry_state_gives_up_after_budget() {
        let mut state = RetryState::new(RetryPolicy::from_config(&config()));
        let mut decisions = Vec::new();
        for _ in 0..4 {
            state.begin_attempt();
            decisions.push(state.on_failure());
        }
        assert_eq!(
            decisions,
            vec![
                RetryDecision::RetryAfter(Duration::from_secs(5)),
                RetryDecision::RetryAfter(Duration::from_secs(10)),
                RetryDecision::RetryAfter(Duration::from_secs(20)),
                RetryDecision::GiveUp,
            ]
        );
    }

    #[test]
    fn immediate_success_makes_one_call() {
        let provider = ScriptedProvider::new().with_history("AAA", Granularity::Daily, vec![bar("AAA", 2)]);
        let sleeper = RecordingSleeper::new();
        let mut fetcher = RateLimitedFetcher::new(&provider, &sleeper, &config());

        let bars = fetcher.fetch(&request("AAA")).unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(provider.call_count(), 1);
        assert!(sleeper.waits().is_empty());
    }

    #[test]
    fn permanent_failure_is_attempted_exactly_one_plus_max_retries() {
        let provider = ScriptedProvider::new();
        provider.fail_always(
            "AAA",
            Granularity::Daily,
            ProviderError::NetworkUnreachable("down".into()),
        );
        let sleeper = RecordingSleeper::new();
        let mut cfg = config();
        cfg.pause_after_calls = 100;
        let mut fetcher = RateLimitedFetcher::new(&provider, &sleeper, &cfg);

        let failure = fetcher.fetch(&request("AAA")).unwrap_err();
        assert_eq!(failure.attempts, 4);
        assert_eq!(failure.class, FailureClass::Network);
        assert_eq!(provider.call_count(), 4);
        assert_eq!(
            sleeper.waits_for(SleepReason::Backoff),
            vec![
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(20)
            ]
        );
        assert_eq!(fetcher.stats().retries, 3);
    }

    #[test]
    fn flapping_failure_recovers() {
        let provider = ScriptedProvider::new().with_history("AAA", Granularity::Daily, vec![bar("AAA", 2)]);
        provider.push_response(
            "AAA",
            Granularity::Daily,
            Err(ProviderError::ResponseFormatChanged("garbled".into())),
        );
        let sleeper = RecordingSleeper::new();
        let mut fetcher = RateLimitedFetcher::new(&provider, &sleeper, &config());

        assert_eq!(fetcher.fetch(&request("AAA")).unwrap().len(), 1);
        assert_eq!(provider.call_count(), 2);
        assert_eq!(sleeper.waits_for(SleepReason::Backoff), vec![Duration::from_secs(5)]);
    }

    #[test]
    fn empty_answer_is_success() {
        let provider = ScriptedProvider::new().with_history("AAA", Granularity::Daily, vec![]);
        let sleeper = RecordingSleeper::new();
        let mut fetcher = RateLimitedFetcher::new(&provider, &sleeper, &config());
        assert!(fetcher.fetch(&request("AAA")).unwrap().is_empty());
        assert_eq!(fetcher.stats().retries, 0);
    }

    #[test]
    fn pauses_after_every_n_calls() {
        let mut provider = ScriptedProvider::new();
        for s in ["A", "B", "C", "D", "E", "F", "G"] {
            provider = provider.with_history(s, Granularity::Daily, vec![]);
        }
        let sleeper = RecordingSleeper::new();
        let mut fetcher = RateLimitedFetcher::new(&provider, &sleeper, &config());

        let requests: Vec<_> = ["A", "B", "C", "D", "E", "F", "G"].iter().map(|s| request(s)).collect();
        let outcome = fetcher.fetch_batch(&requests);

        assert_eq!(outcome.fetched.len(), 7);
        // 7 calls with a pause every 3: before call 4 and before call 7
        assert_eq!(
            sleeper.waits_for(SleepReason::RatePause),
            vec![Duration::from_secs(60), Duration::from_secs(60)]
        );
        assert_eq!(fetcher.stats().pauses, 2);
    }

    #[test]
    fn retries_count_toward_pause_budget() {
        let provider = ScriptedProvider::new();
        provider.fail_always("AAA", Granularity::Daily, ProviderError::RateLimited { retry_after_secs: 1 });
        let sleeper = RecordingSleeper::new();
        let mut fetcher = RateLimitedFetcher::new(&provider, &sleeper, &config());

        fetcher.fetch(&request("AAA")).unwrap_err();
        // 4 calls with a pause every 3
        assert_eq!(fetcher.stats().provider_calls, 4);
        assert_eq!(fetcher.stats().pauses, 1);
    }

    #[test]
    fn batch_collects_failures_without_stopping() {
        let provider = ScriptedProvider::new().with_history("BBB", Granularity::Daily, vec![bar("BBB", 3)]);
        let sleeper = RecordingSleeper::new();
        let mut cfg = config();
        cfg.max_retries = 0;
        let mut fetcher = RateLimitedFetcher::new(&provider, &sleeper, &cfg);

        let outcome = fetcher.fetch_batch(&[request("GONE"), request("BBB")]);
        assert_eq!(outcome.fetched.len(), 1);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].class, FailureClass::Delisted);
    }
}
