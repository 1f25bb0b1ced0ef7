//! Reconnect delays for the websocket transport.
//!
//! Delays grow exponentially from `initial_backoff` up to `max_backoff` with a
//! small amount of jitter so that many clients dropped together do not redial
//! in lockstep.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Policy controlling whether and how a dropped session is redialed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Whether the transport redials after a session ends.
    pub enabled: bool,
    /// Maximum consecutive failed redials before giving up. `None` retries
    /// forever.
    pub max_attempts: Option<usize>,
    /// Delay used before the first redial.
    pub initial_backoff: Duration,
    /// Upper bound for exponential backoff delay growth.
    pub max_backoff: Duration,
    /// Maximum random jitter added to each redial delay.
    pub jitter: Duration,
}

impl ReconnectPolicy {
    /// Never redial; the first dropped session is final.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Returns whether another redial is allowed after `failed` consecutive
    /// failures.
    pub fn allows_attempt(&self, failed: usize) -> bool {
        self.enabled && self.max_attempts.map_or(true, |max| failed < max)
    }

    /// Computes the delay before the given redial.
    ///
    /// `attempt` is 1-based.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let mut delay = self.initial_backoff;
        for _ in 1..attempt {
            delay = std::cmp::min(delay.saturating_mul(2), self.max_backoff);
        }
        delay + jitter_duration(self.jitter, attempt)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: None,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            jitter: Duration::from_millis(50),
        }
    }
}

fn jitter_duration(max_jitter: Duration, attempt: usize) -> Duration {
    if max_jitter.is_zero() {
        return Duration::ZERO;
    }

    let limit_nanos = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = now_nanos ^ ((attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    Duration::from_nanos(mixed % (limit_nanos + 1))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::ReconnectPolicy;

    fn no_jitter() -> ReconnectPolicy {
        ReconnectPolicy::default()
            .with_backoff(Duration::from_millis(10), Duration::from_millis(35))
            .with_jitter(Duration::ZERO)
    }

    #[test]
    fn delay_doubles_until_capped() {
        let policy = no_jitter();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(35));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_millis(35));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = no_jitter().with_jitter(Duration::from_millis(5));
        for attempt in 1..20 {
            let delay = policy.delay_for_attempt(attempt);
            assert!(delay >= Duration::from_millis(10));
            assert!(delay <= Duration::from_millis(40));
        }
    }

    #[test]
    fn max_attempts_bounds_redials() {
        let policy = no_jitter().with_max_attempts(2);
        assert!(policy.allows_attempt(0));
        assert!(policy.allows_attempt(1));
        assert!(!policy.allows_attempt(2));
    }

    #[test]
    fn disabled_policy_never_redials() {
        assert!(!ReconnectPolicy::disabled().allows_attempt(0));
    }
}
