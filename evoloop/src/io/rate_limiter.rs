//! Minimum spacing between generation calls.
//!
//! The loop is the only caller, so one read-modify-write of `rate_limit.json`
//! per turn needs no further synchronization.

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info};

use super::documents::RateLimitState;
use super::store::StateStore;

pub struct RateLimiter<'a> {
    store: &'a StateStore,
    min_delay: Duration,
}

impl<'a> RateLimiter<'a> {
    pub fn new(store: &'a StateStore, min_delay: Duration) -> Self {
        Self { store, min_delay }
    }

    /// How long `wait_turn` would sleep if called at `now_ms`. Never more than
    /// `min_delay`, even when the recorded call lies in the future.
    pub fn remaining(&self, state: &RateLimitState, now_ms: i64) -> Duration {
        let Some(last) = state.last_call_at_ms else {
            return Duration::ZERO;
        };
        let min_delay_ms = i64::try_from(self.min_delay.as_millis()).unwrap_or(i64::MAX);
        let ready_at = last.saturating_add(min_delay_ms);
        let wait_ms = ready_at.saturating_sub(now_ms).max(0);
        Duration::from_millis(u64::try_from(wait_ms).unwrap_or(0)).min(self.min_delay)
    }

    /// Block until `min_delay` has elapsed since the last recorded call, then
    /// record this call. Returns the new state.
    pub async fn wait_turn(&self) -> Result<RateLimitState> {
        let state = self.store.read::<RateLimitState>();
        let wait = self.remaining(&state, Utc::now().timestamp_millis());
        if !wait.is_zero() {
            info!(wait_ms = wait.as_millis() as u64, "rate limit: waiting for turn");
            tokio::time::sleep(wait).await;
        }
        let next = RateLimitState {
            last_call_at_ms: Some(Utc::now().timestamp_millis()),
            calls: state.calls + 1,
        };
        self.store.write(&next)?;
        debug!(calls = next.calls, "rate limit: turn recorded");
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_counts_down_from_last_call() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = StateStore::new(temp.path());
        let limiter = RateLimiter::new(&store, Duration::from_secs(10));
        let state = RateLimitState {
            last_call_at_ms: Some(1_000_000),
            calls: 3,
        };
        assert_eq!(limiter.remaining(&state, 1_004_000), Duration::from_secs(6));
        assert_eq!(limiter.remaining(&state, 1_020_000), Duration::ZERO);
        assert_eq!(
            limiter.remaining(&RateLimitState::default(), 0),
            Duration::ZERO
        );
    }

    /// Verifies a clock stepped backwards cannot stall the loop beyond `min_delay`.
    #[test]
    fn future_last_call_waits_at_most_min_delay() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = StateStore::new(temp.path());
        let limiter = RateLimiter::new(&store, Duration::from_secs(10));
        let now = 1_000_000;
        let state = RateLimitState {
            last_call_at_ms: Some(now + 3_600_000),
            calls: 1,
        };
        assert_eq!(limiter.remaining(&state, now), Duration::from_secs(10));

        let unlimited = RateLimiter::new(&store, Duration::ZERO);
        assert_eq!(unlimited.remaining(&state, now), Duration::ZERO);
    }

    #[tokio::test]
    async fn wait_turn_records_timestamp_and_count() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = StateStore::new(temp.path());
        let limiter = RateLimiter::new(&store, Duration::ZERO);
        limiter.wait_turn().await.expect("first");
        let second = limiter.wait_turn().await.expect("second");
        assert_eq!(second.calls, 2);
        assert_eq!(store.read::<RateLimitState>(), second);
    }

    /// Verifies a recent call forces the next turn to sleep out the remainder.
    #[tokio::test]
    async fn wait_turn_sleeps_until_spacing_elapsed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = StateStore::new(temp.path());
        let limiter = RateLimiter::new(&store, Duration::from_millis(200));
        let started = std::time::Instant::now();
        limiter.wait_turn().await.expect("first");
        limiter.wait_turn().await.expect("second");
        assert!(started.elapsed() >= Duration::from_millis(190));
    }
}
