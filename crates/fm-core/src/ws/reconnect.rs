//! Bounded exponential backoff for connection refreshes.
//!
//! Delays double from `base_delay` up to `max_delay`. Attempts are counted per
//! window: once `window` has passed since the first attempt of the current
//! window, the counter starts over. Running past `max_attempts` inside one
//! window is fatal for the connection.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::error::FeedError;

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub window: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(8_000),
            window: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the `attempt`-th reconnect (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << shift).min(self.max_delay)
    }
}

/// Per-connection backoff state.
#[derive(Debug)]
pub struct ReconnectionManager {
    url: String,
    policy: ReconnectPolicy,
    attempts: u32,
    window_start: Option<Instant>,
}

impl ReconnectionManager {
    pub fn new(url: impl Into<String>, policy: ReconnectPolicy) -> Self {
        Self {
            url: url.into(),
            policy,
            attempts: 0,
            window_start: None,
        }
    }

    /// Register a reconnect attempt at `now` and return how long to wait
    /// before making it.
    ///
    /// Returns [`FeedError::ReconnectExhausted`] once the attempts in the
    /// current window exceed the policy maximum.
    pub fn next_delay(&mut self, now: Instant) -> Result<Duration, FeedError> {
        let window_expired = match self.window_start {
            Some(start) => now.saturating_duration_since(start) > self.policy.window,
            None => true,
        };
        if window_expired {
            if self.attempts > 0 {
                debug!(
                    "[reconnect {}] window elapsed, resetting {} attempts",
                    self.url, self.attempts
                );
            }
            self.window_start = Some(now);
            self.attempts = 0;
        }

        self.attempts += 1;
        if self.attempts > self.policy.max_attempts {
            return Err(FeedError::ReconnectExhausted {
                url: self.url.clone(),
                attempts: self.attempts - 1,
            });
        }
        Ok(self.policy.delay_for(self.attempts))
    }

    /// Attempts made in the current window.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn delays_double_then_cap() {
        let p = ReconnectPolicy::default();
        let delays: Vec<_> = (1..=7).map(|a| p.delay_for(a)).collect();
        let expected = [1_000, 2_000, 4_000, 8_000, 8_000, 8_000, 8_000].map(ms);
        assert_eq!(delays, expected.to_vec());
        assert_eq!(p.delay_for(200), ms(8_000));
    }

    #[test]
    fn exhaustion_after_max_attempts() {
        let mut m = ReconnectionManager::new("wss://x", ReconnectPolicy::default());
        let t0 = Instant::now();
        let mut seen = Vec::new();
        for i in 0..5 {
            seen.push(m.next_delay(t0 + Duration::from_secs(i)).unwrap());
        }
        assert_eq!(seen, vec![ms(1_000), ms(2_000), ms(4_000), ms(8_000), ms(8_000)]);

        match m.next_delay(t0 + Duration::from_secs(6)) {
            Err(FeedError::ReconnectExhausted { url, attempts }) => {
                assert_eq!(url, "wss://x");
                assert_eq!(attempts, 5);
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[test]
    fn counter_resets_after_window() {
        let mut m = ReconnectionManager::new("wss://x", ReconnectPolicy::default());
        let t0 = Instant::now();
        assert_eq!(m.next_delay(t0).unwrap(), ms(1_000));
        assert_eq!(m.next_delay(t0 + Duration::from_secs(10)).unwrap(), ms(2_000));
        assert_eq!(m.next_delay(t0 + Duration::from_secs(60)).unwrap(), ms(4_000));

        // 60s after the window opened is still inside it; one past is not
        assert_eq!(m.next_delay(t0 + Duration::from_secs(61)).unwrap(), ms(1_000));
        assert_eq!(m.attempts(), 1);
    }
}
