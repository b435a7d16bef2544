//! Per-stream monotonic acceptance filter.
//!
//! Upstream updates are stamped with a sequence number (a slot) that never
//! decreases within one feed. [`SequenceGuard`] drops any update older than the
//! last one applied for the same stream key.
//!
//! # Resume mode
//!
//! When the consuming process was suspended (backgrounded, stopped, machine
//! asleep) the socket buffers a backlog that arrives as a burst on resume.
//! [`SequenceGuard::notify_resume`] opens a short window during which:
//!
//! 1. messages received before the resume instant are rejected as stale, and
//! 2. a forward jump larger than `jump_threshold` fast-forwards tracking so the
//!    stream catches up to the live point instead of rejecting the burst.
//!
//! Sequence numbers are not comparable across feed instances, so callers must
//! [`reset`](SequenceGuard::reset) a key whenever its upstream subscription is
//! recreated (e.g. after a reconnect).
//!
//! # Thread safety
//!
//! Not thread-safe. Each consumer owns its own instance.

use std::time::Duration;

use ahash::AHashMap;
use serde::Deserialize;
use tracing::{debug, trace};

use crate::time_util;

/// Tuning knobs for [`SequenceGuard`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SequenceConfig {
    /// Forward jump (in sequence units) treated as a backlog burst while
    /// resuming.
    pub jump_threshold: u64,
    /// How long resume mode stays active after [`SequenceGuard::notify_resume`].
    #[serde(rename = "resume_debounce_ms", with = "duration_ms")]
    pub resume_debounce: Duration,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            jump_threshold: 100,
            resume_debounce: Duration::from_millis(2_000),
        }
    }
}

/// Monotonic filter keyed by stream.
pub struct SequenceGuard {
    config: SequenceConfig,
    last_accepted: AHashMap<String, u64>,
    /// Epoch ms of the last resume notification.
    resumed_at_ms: Option<u64>,
}

impl SequenceGuard {
    pub fn new(config: SequenceConfig) -> Self {
        Self {
            config,
            last_accepted: AHashMap::new(),
            resumed_at_ms: None,
        }
    }

    /// Decide whether an update for `key` should be applied, using the wall
    /// clock to evaluate resume mode.
    #[inline]
    pub fn accept(
        &mut self,
        key: &str,
        sequence: Option<u64>,
        received_at_ms: Option<u64>,
    ) -> bool {
        self.accept_at(key, sequence, received_at_ms, time_util::now_ms())
    }

    /// Decide whether an update for `key` should be applied.
    ///
    /// Returns `true` if the update is new enough; the stored sequence for the
    /// key is advanced in that case. A `false` return is not an error.
    pub fn accept_at(
        &mut self,
        key: &str,
        sequence: Option<u64>,
        received_at_ms: Option<u64>,
        now_ms: u64,
    ) -> bool {
        let Some(seq) = sequence else {
            debug!("[seq] {key}: update without sequence, accepting");
            return true;
        };

        let resuming = self.resume_started(now_ms);

        if let (Some(resumed_at), Some(received_at)) = (resuming, received_at_ms) {
            if received_at < resumed_at {
                trace!("[seq] {key}: dropping seq={seq} queued before resume");
                return false;
            }
        }

        let last = match self.last_accepted.get_mut(key) {
            Some(last) => last,
            None => {
                self.last_accepted.insert(key.to_string(), seq);
                return true;
            }
        };

        if resuming.is_some() && seq.saturating_sub(*last) > self.config.jump_threshold {
            debug!("[seq] {key}: resume burst, fast-forwarding {} -> {}", *last, seq - 1);
            *last = seq - 1;
        }

        if seq >= *last {
            *last = seq;
            true
        } else {
            trace!("[seq] {key}: rejecting seq={seq} < last={}", *last);
            false
        }
    }

    /// Enter resume mode now.
    pub fn notify_resume(&mut self) {
        self.notify_resume_at(time_util::now_ms());
    }

    /// Enter resume mode as of `now_ms`.
    pub fn notify_resume_at(&mut self, now_ms: u64) {
        debug!("[seq] resume mode for {:?}", self.config.resume_debounce);
        self.resumed_at_ms = Some(now_ms);
    }

    /// Whether resume mode is active at `now_ms`.
    pub fn is_resuming_at(&self, now_ms: u64) -> bool {
        self.resume_started(now_ms).is_some()
    }

    /// Resume timestamp if the debounce window has not yet elapsed.
    fn resume_started(&self, now_ms: u64) -> Option<u64> {
        let resumed_at = self.resumed_at_ms?;
        let window = self.config.resume_debounce.as_millis() as u64;
        (now_ms < resumed_at.saturating_add(window)).then_some(resumed_at)
    }

    /// Forget the tracked sequence for one stream.
    pub fn reset(&mut self, key: &str) {
        self.last_accepted.remove(key);
    }

    /// Returns the last accepted sequence for a stream, or `None`.
    pub fn last_accepted(&self, key: &str) -> Option<u64> {
        self.last_accepted.get(key).copied()
    }
}

impl Default for SequenceGuard {
    fn default() -> Self {
        Self::new(SequenceConfig::default())
    }
}

/// Serde helper for `Duration` fields stored as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_700_000_000_000;

    #[test]
    fn non_decreasing_sequences_are_accepted() {
        let mut g = SequenceGuard::default();
        for seq in [1, 2, 2, 5, 5, 9] {
            assert!(g.accept_at("SOL", Some(seq), None, T0));
        }
        assert_eq!(g.last_accepted("SOL"), Some(9));
    }

    #[test]
    fn regression_is_rejected() {
        let mut g = SequenceGuard::default();
        assert!(g.accept_at("SOL", Some(10), None, T0));
        assert!(!g.accept_at("SOL", Some(9), None, T0));
        assert_eq!(g.last_accepted("SOL"), Some(10));
    }

    #[test]
    fn streams_are_independent() {
        let mut g = SequenceGuard::default();
        assert!(g.accept_at("SOL:1", Some(100), None, T0));
        assert!(g.accept_at("BTC:1", Some(5), None, T0));
        assert!(!g.accept_at("SOL:1", Some(5), None, T0));
    }

    #[test]
    fn missing_sequence_fails_open() {
        let mut g = SequenceGuard::default();
        assert!(g.accept_at("SOL", Some(10), None, T0));
        assert!(g.accept_at("SOL", None, None, T0));
        assert_eq!(g.last_accepted("SOL"), Some(10));
    }

    #[test]
    fn resume_burst_fast_forwards() {
        let mut g = SequenceGuard::default();
        assert!(g.accept_at("SOL", Some(100), None, T0));
        g.notify_resume_at(T0 + 1_000);

        assert!(g.accept_at("SOL", Some(500), Some(T0 + 1_100), T0 + 1_100));
        assert!(g.accept_at("SOL", Some(501), Some(T0 + 1_200), T0 + 1_200));
        assert_eq!(g.last_accepted("SOL"), Some(501));
    }

    #[test]
    fn resume_rejects_messages_queued_before_resume() {
        let mut g = SequenceGuard::default();
        assert!(g.accept_at("SOL", Some(100), None, T0));
        g.notify_resume_at(T0 + 1_000);

        assert!(!g.accept_at("SOL", Some(150), Some(T0 + 999), T0 + 1_050));
        // no received-at stamp → only the sequence rule applies
        assert!(g.accept_at("SOL", Some(150), None, T0 + 1_050));
    }

    #[test]
    fn resume_mode_expires_after_debounce() {
        let mut g = SequenceGuard::default();
        assert!(g.accept_at("SOL", Some(100), None, T0));
        g.notify_resume_at(T0);
        assert!(g.is_resuming_at(T0 + 1_999));
        assert!(!g.is_resuming_at(T0 + 2_000));

        // outside resume mode, stale stamps are not judged
        assert!(g.accept_at("SOL", Some(101), Some(T0 - 10), T0 + 2_500));
    }

    #[test]
    fn small_jump_during_resume_is_plain_monotonic() {
        let mut g = SequenceGuard::default();
        assert!(g.accept_at("SOL", Some(100), None, T0));
        g.notify_resume_at(T0);
        assert!(g.accept_at("SOL", Some(150), Some(T0 + 10), T0 + 10));
        assert!(!g.accept_at("SOL", Some(149), Some(T0 + 20), T0 + 20));
    }

    #[test]
    fn reset_forgets_stream() {
        let mut g = SequenceGuard::default();
        assert!(g.accept_at("SOL", Some(1_000), None, T0));
        g.reset("SOL");
        assert_eq!(g.last_accepted("SOL"), None);
        assert!(g.accept_at("SOL", Some(3), None, T0));
    }

    #[test]
    fn config_from_json() {
        let json = r#"{"jump_threshold": 50, "resume_debounce_ms": 500}"#;
        let cfg: SequenceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.jump_threshold, 50);
        assert_eq!(cfg.resume_debounce, Duration::from_millis(500));

        let cfg: SequenceConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, SequenceConfig::default());
    }
}
