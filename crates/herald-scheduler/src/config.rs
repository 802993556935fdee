//! Retry policy and scheduler timing configuration.

use std::collections::BTreeSet;
use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::Platform;

/// Retry policy for transient publish failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts per target before a transient failure becomes permanent.
    pub max_attempts: u32,
    /// Delay after the first failed attempt, doubled on each further failure.
    pub base_delay_secs: u64,
    /// Upper bound for the computed backoff.
    pub max_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_secs: 60,
            max_delay_secs: 3600,
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `attempt_count` attempts.
    pub fn has_attempts_left(&self, attempt_count: u32) -> bool {
        attempt_count < self.max_attempts
    }

    /// Exponential backoff after the given (1-based) failed attempt.
    ///
    /// 1min, 2min, 4min, 8min, ... capped at `max_delay_secs`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let secs = self
            .base_delay_secs
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_secs);
        Duration::seconds(secs.min(i64::MAX as u64) as i64)
    }

    /// Backoff that also honours a platform-provided retry-after hint.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<StdDuration>) -> Duration {
        let backoff = self.retry_delay(attempt);
        match retry_after.and_then(|hint| Duration::from_std(hint).ok()) {
            Some(hint) if hint > backoff => hint,
            _ => backoff,
        }
    }
}

/// Process-wide scheduler configuration, loaded once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between scheduler ticks; bounds scheduling precision.
    pub tick_interval_secs: u64,
    /// Per-call adapter timeout in seconds.
    pub adapter_timeout_secs: u64,
    /// A processing job with no activity for this many adapter timeouts is reclaimed.
    pub stale_multiplier: u32,
    /// Jobs dispatched concurrently per tick.
    pub max_concurrent_jobs: usize,
    /// Immediate re-read/re-apply attempts on an optimistic-concurrency clash.
    pub store_conflict_retries: u32,
    /// Platforms users may target.
    pub enabled_platforms: BTreeSet<Platform>,
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 30,
            adapter_timeout_secs: 30,
            stale_multiplier: 10,
            max_concurrent_jobs: 8,
            store_conflict_retries: 5,
            enabled_platforms: Platform::ALL.into_iter().collect(),
            retry: RetryPolicy::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn adapter_timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.adapter_timeout_secs.max(1))
    }

    /// How long a processing job may go without activity before the sweep reclaims it.
    pub fn staleness_window(&self) -> Duration {
        let secs = self
            .adapter_timeout_secs
            .max(1)
            .saturating_mul(u64::from(self.stale_multiplier.max(1)));
        Duration::seconds(secs.min(i64::MAX as u64) as i64)
    }

    pub fn is_enabled(&self, platform: Platform) -> bool {
        self.enabled_platforms.contains(&platform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_retry_delay_doubles_until_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.retry_delay(1).num_seconds(), 60);
        assert_eq!(policy.retry_delay(2).num_seconds(), 120);
        assert_eq!(policy.retry_delay(3).num_seconds(), 240);
        assert_eq!(policy.retry_delay(7).num_seconds(), 3600);
        assert_eq!(policy.retry_delay(1000).num_seconds(), 3600);
    }

    #[test]
    fn test_retry_delay_zeroth_attempt_uses_base() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.retry_delay(0).num_seconds(), 60);
    }

    #[test]
    fn test_retry_after_hint_extends_delay() {
        let policy = RetryPolicy::default();
        let delay = policy.delay_for(1, Some(StdDuration::from_secs(900)));
        assert_eq!(delay.num_seconds(), 900);

        // A hint shorter than the backoff never shortens it.
        let delay = policy.delay_for(3, Some(StdDuration::from_secs(5)));
        assert_eq!(delay.num_seconds(), 240);
    }

    #[test]
    fn test_attempt_budget() {
        let policy = RetryPolicy::default();
        assert!(policy.has_attempts_left(4));
        assert!(!policy.has_attempts_left(5));
    }

    #[test]
    fn test_staleness_window_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.staleness_window().num_seconds(), 300);
        assert_eq!(config.tick_interval(), StdDuration::from_secs(30));
        assert!(Platform::ALL.iter().all(|p| config.is_enabled(*p)));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: SchedulerConfig =
            serde_json::from_str(r#"{"tick_interval_secs": 60, "retry": {"max_attempts": 3}}"#)
                .unwrap();
        assert_eq!(config.tick_interval_secs, 60);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay_secs, 60);
        assert_eq!(config.adapter_timeout_secs, 30);
    }

    proptest! {
        #[test]
        fn retry_delay_is_bounded(attempt in 0u32..200) {
            let policy = RetryPolicy::default();
            let secs = policy.retry_delay(attempt).num_seconds();
            prop_assert!(secs >= 60);
            prop_assert!(secs <= 3600);
        }

        #[test]
        fn retry_delay_non_decreasing(a in 0u32..40, b in 0u32..40) {
            let policy = RetryPolicy::default();
            if a <= b {
                prop_assert!(policy.retry_delay(a) <= policy.retry_delay(b));
            }
        }
    }
}
