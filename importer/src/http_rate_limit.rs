//! Per-caller sliding window limiter for the job API. Callers that go quiet for
//! a full window are evicted from the cache.

use moka::sync::Cache;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

const MAX_CALLERS: u64 = 10_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Time until the oldest request in the window expires.
    pub reset_after: Duration,
}

pub struct SlidingWindowLimiter {
    limit: u32,
    window: Duration,
    callers: Cache<String, Arc<Mutex<VecDeque<Instant>>>>,
}

impl SlidingWindowLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        let callers = Cache::builder()
            .max_capacity(MAX_CALLERS)
            .time_to_idle(window)
            .build();

        SlidingWindowLimiter {
            limit,
            window,
            callers,
        }
    }

    pub fn check(&self, caller: &str) -> RateDecision {
        self.check_at(caller, Instant::now())
    }

    fn check_at(&self, caller: &str, now: Instant) -> RateDecision {
        let entry = self
            .callers
            .get_with_by_ref(caller, || Arc::new(Mutex::new(VecDeque::new())));
        let mut requests = entry.lock();

        while let Some(oldest) = requests.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                requests.pop_front();
            } else {
                break;
            }
        }

        let allowed = (requests.len() as u32) < self.limit;
        if allowed {
            requests.push_back(now);
        }

        let reset_after = requests
            .front()
            .map(|oldest| self.window.saturating_sub(now.saturating_duration_since(*oldest)))
            .unwrap_or(self.window);

        RateDecision {
            allowed,
            limit: self.limit,
            remaining: self.limit.saturating_sub(requests.len() as u32),
            reset_after,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_within_window() {
        let limiter = SlidingWindowLimiter::new(3, Duration::from_secs(1));
        let start = Instant::now();

        for expected_remaining in [2, 1, 0] {
            let decision = limiter.check_at("10.0.0.1", start);
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }

        let rejected = limiter.check_at("10.0.0.1", start + Duration::from_millis(400));
        assert!(!rejected.allowed);
        assert_eq!(rejected.remaining, 0);
        assert_eq!(rejected.limit, 3);
        assert_eq!(rejected.reset_after, Duration::from_millis(600));

        // Other callers have their own window.
        assert!(limiter.check_at("10.0.0.2", start).allowed);
    }

    #[test]
    fn test_window_slides() {
        let limiter = SlidingWindowLimiter::new(2, Duration::from_secs(1));
        let start = Instant::now();

        assert!(limiter.check_at("anonymous", start).allowed);
        assert!(limiter.check_at("anonymous", start + Duration::from_millis(500)).allowed);
        assert!(!limiter.check_at("anonymous", start + Duration::from_millis(900)).allowed);

        // The first request has left the window, the second has not.
        let decision = limiter.check_at("anonymous", start + Duration::from_millis(1000));
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert!(!limiter.check_at("anonymous", start + Duration::from_millis(1200)).allowed);
    }

    #[test]
    fn test_rejections_do_not_extend_the_window() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(1));
        let start = Instant::now();

        assert!(limiter.check_at("caller", start).allowed);
        for ms in [100, 300, 900] {
            assert!(!limiter.check_at("caller", start + Duration::from_millis(ms)).allowed);
        }
        assert!(limiter.check_at("caller", start + Duration::from_secs(1)).allowed);
    }
}
