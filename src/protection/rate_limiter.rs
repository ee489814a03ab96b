use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::debug;

/// Windows expired longer than this are swept by `cleanup`.
const STALE_AFTER_HOURS: i64 = 24;

const MAX_WINDOW_SECS: i64 = 365 * 24 * 3600;

#[derive(Debug, Clone)]
pub struct RateLimitState {
    pub requests: u64,
    pub window_reset_time: DateTime<Utc>,
    pub blocked: bool,
    pub last_request_time: DateTime<Utc>,
}

impl RateLimitState {
    fn fresh(now: DateTime<Utc>, window: Duration) -> Self {
        Self {
            requests: 0,
            window_reset_time: now + window,
            blocked: false,
            last_request_time: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub blocked: bool,
    pub requests: u64,
    pub limit: u64,
    pub remaining: u64,
    pub reset_time: DateTime<Utc>,
}

/// Per-IP fixed-window request counter.
///
/// A window starts on the first request from an IP and is replaced wholesale
/// once it has elapsed; counters are never decremented.
pub struct RateLimiter {
    states: DashMap<String, RateLimitState>,
    limit: u64,
    window: Duration,
}

impl RateLimiter {
    pub fn new(limit: u64, window_secs: u64) -> Self {
        Self {
            states: DashMap::new(),
            limit,
            window: Duration::seconds(i64::try_from(window_secs).unwrap_or(i64::MAX).min(MAX_WINDOW_SECS)),
        }
    }

    pub fn check(&self, ip: &str) -> RateLimitDecision {
        self.check_at(ip, Utc::now())
    }

    /// Count one request from `ip` at `now` and report whether it is over the limit.
    pub fn check_at(&self, ip: &str, now: DateTime<Utc>) -> RateLimitDecision {
        // The entry guard holds the shard lock for the whole read-modify-write.
        let mut state = self
            .states
            .entry(ip.to_string())
            .or_insert_with(|| RateLimitState::fresh(now, self.window));

        if now > state.window_reset_time {
            *state = RateLimitState::fresh(now, self.window);
        }

        state.requests += 1;
        state.last_request_time = now;
        state.blocked = state.requests > self.limit;

        let decision = RateLimitDecision {
            blocked: state.blocked,
            requests: state.requests,
            limit: self.limit,
            remaining: self.limit.saturating_sub(state.requests),
            reset_time: state.window_reset_time,
        };

        if decision.blocked {
            debug!(
                ip = %ip,
                requests = state.requests,
                limit = self.limit,
                "Rate limit exceeded"
            );
        }
        decision
    }

    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Utc::now())
    }

    /// Drop states whose window ended more than a day before `now`.
    pub fn cleanup_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::hours(STALE_AFTER_HOURS);
        let stale: Vec<String> = self
            .states
            .iter()
            .filter(|entry| entry.window_reset_time < cutoff)
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for key in stale {
            if self
                .states
                .remove_if(&key, |_, state| state.window_reset_time < cutoff)
                .is_some()
            {
                removed += 1;
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_plus_one_is_blocked() {
        let limiter = RateLimiter::new(3, 60);
        let now = Utc::now();
        for expected_remaining in [2, 1, 0] {
            let decision = limiter.check_at("10.0.0.1", now);
            assert!(!decision.blocked);
            assert_eq!(decision.remaining, expected_remaining);
        }
        let decision = limiter.check_at("10.0.0.1", now);
        assert!(decision.blocked);
        assert_eq!(decision.requests, 4);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.limit, 3);

        // Other keys are independent.
        assert!(!limiter.check_at("10.0.0.2", now).blocked);
    }

    #[test]
    fn test_window_is_replaced_after_reset() {
        let limiter = RateLimiter::new(1, 60);
        let start = Utc::now();
        assert!(!limiter.check_at("1.1.1.1", start).blocked);
        assert!(limiter.check_at("1.1.1.1", start + Duration::seconds(59)).blocked);

        let later = start + Duration::seconds(61);
        let decision = limiter.check_at("1.1.1.1", later);
        assert!(!decision.blocked);
        assert_eq!(decision.reset_time, later + Duration::seconds(60));
    }

    #[test]
    fn test_cleanup_removes_only_long_expired_windows() {
        let limiter = RateLimiter::new(10, 60);
        let now = Utc::now();
        limiter.check_at("old", now - Duration::hours(25));
        limiter.check_at("recent", now - Duration::hours(1));
        assert_eq!(limiter.len(), 2);

        assert_eq!(limiter.cleanup_at(now), 1);
        assert_eq!(limiter.len(), 1);
    }
}
