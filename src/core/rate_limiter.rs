use crate::error::FetchError;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff tuning shared by every task in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Upper bound applied to server-provided `Retry-After` hints.
    pub max_retry_after_ms: u64,
    /// Random extra delay in `[0, jitter_ms]` added to every wait.
    pub jitter_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 250,
            max_delay_ms: 10_000,
            max_retry_after_ms: 60_000,
            jitter_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts allowed per task, including the first one.
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: BackoffConfig) -> Self {
        Self { max_attempts: max_attempts.max(1), backoff }
    }

    /// Deterministic part of the wait after attempt `attempt` (0-based) failed:
    /// `base * 2^attempt`, capped at `max_delay`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let delay = self.backoff.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.backoff.max_delay_ms))
    }

    /// Wait before the next attempt. A rate-limit hint wins over the schedule.
    pub fn delay_for(&self, attempt: u32, error: &FetchError) -> Duration {
        let base = match error {
            FetchError::RateLimited { retry_after: Some(hint) } => {
                (*hint).min(Duration::from_millis(self.backoff.max_retry_after_ms))
            }
            _ => self.backoff_delay(attempt),
        };
        base + self.jitter()
    }

    pub fn should_retry(&self, attempts_made: u32, error: &FetchError) -> bool {
        error.is_transient() && attempts_made < self.max_attempts
    }

    fn jitter(&self) -> Duration {
        if self.backoff.jitter_ms == 0 {
            return Duration::ZERO;
        }
        let ms = {
            let mut rng = rand::thread_rng();
            rng.gen_range(0..=self.backoff.jitter_ms)
        };
        Duration::from_millis(ms)
    }
}

/// Parse a `Retry-After` header: either delta-seconds or an HTTP-date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let when = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    // A date in the past means "retry now"
    Some((when - now).to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(
            3,
            BackoffConfig { base_delay_ms: 100, max_delay_ms: 1_000, max_retry_after_ms: 5_000, jitter_ms: 0 },
        )
    }

    #[test]
    fn test_exponential_schedule_is_capped() {
        let p = policy();
        assert_eq!(p.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(p.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(p.backoff_delay(3), Duration::from_millis(800));
        assert_eq!(p.backoff_delay(4), Duration::from_millis(1_000));
        assert_eq!(p.backoff_delay(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_retry_after_hint_is_honoured_and_clamped() {
        let p = policy();
        let hinted = FetchError::RateLimited { retry_after: Some(Duration::from_secs(2)) };
        assert_eq!(p.delay_for(0, &hinted), Duration::from_secs(2));

        let huge = FetchError::RateLimited { retry_after: Some(Duration::from_secs(600)) };
        assert_eq!(p.delay_for(0, &huge), Duration::from_secs(5));

        let bare = FetchError::RateLimited { retry_after: None };
        assert_eq!(p.delay_for(1, &bare), Duration::from_millis(200));
    }

    #[test]
    fn test_should_retry_respects_budget() {
        let p = policy();
        let err = FetchError::Server { status: 500, body: String::new() };
        assert!(p.should_retry(1, &err));
        assert!(p.should_retry(2, &err));
        assert!(!p.should_retry(3, &err));

        let client = FetchError::Client { status: 404, body: String::new() };
        assert!(!p.should_retry(1, &client));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let mut p = policy();
        p.backoff.jitter_ms = 50;
        for _ in 0..20 {
            let d = p.delay_for(0, &FetchError::Timeout(Duration::from_secs(1)));
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_parse_retry_after() {
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 28, 0).unwrap();
        assert_eq!(parse_retry_after("120", now), Some(Duration::from_secs(120)));
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:30 GMT", now),
            Some(Duration::from_secs(30))
        );
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:00:00 GMT", now), Some(Duration::ZERO));
        assert_eq!(parse_retry_after("soon", now), None);
    }
}
