//! Token bucket limiter guarding every call to the telematics provider.
//!
//! Refill is lazy: tokens are recomputed from elapsed time whenever the bucket
//! is touched, so there is no background timer. In adaptive mode the refill
//! rate follows the observed call latency, slowing down when the provider is
//! slow and bursting when it is fast.
//!
//! One limiter is built per job via [`RateLimiterConfig::for_workload`] so that
//! concurrent jobs never share token state.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::{Instant, sleep};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RateLimitError {
    #[error("requested {requested} tokens but bucket capacity is {capacity}")]
    ExceedsCapacity { requested: u32, capacity: u32 },
}

#[derive(Clone, Debug, PartialEq)]
pub struct AdaptiveConfig {
    /// How often the effective rate may change.
    pub adjust_interval: Duration,
    /// Average latency above which the rate is reduced.
    pub slow_threshold: Duration,
    /// Average latency below which the rate may burst.
    pub fast_threshold: Duration,
    pub backoff_factor: f64,
    pub burst_multiplier: f64,
    /// Lower bound of the effective rate, as a fraction of the base rate.
    pub min_rate_factor: f64,
    /// Upper bound of the effective rate, as a multiple of the base rate.
    pub max_rate_factor: f64,
    /// Number of latency samples kept.
    pub window_size: usize,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        AdaptiveConfig {
            adjust_interval: Duration::from_secs(10),
            slow_threshold: Duration::from_secs(2),
            fast_threshold: Duration::from_millis(500),
            backoff_factor: 0.5,
            burst_multiplier: 1.5,
            min_rate_factor: 0.25,
            max_rate_factor: 2.0,
            window_size: 50,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkloadTier {
    Small,
    Medium,
    Large,
}

impl WorkloadTier {
    pub fn for_users(total_users: usize) -> Self {
        match total_users {
            0..=10 => WorkloadTier::Small,
            11..=100 => WorkloadTier::Medium,
            _ => WorkloadTier::Large,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RateLimiterConfig {
    pub max_tokens: u32,
    /// Tokens added per second when the provider behaves normally.
    pub base_rate: f64,
    pub adaptive: Option<AdaptiveConfig>,
}

impl RateLimiterConfig {
    /// Sizes the bucket from the expected number of users. Larger jobs get a
    /// smaller burst and a lower sustained rate.
    pub fn for_workload(total_users: usize) -> Self {
        match WorkloadTier::for_users(total_users) {
            WorkloadTier::Small => RateLimiterConfig {
                max_tokens: 10,
                base_rate: 5.0,
                adaptive: None,
            },
            WorkloadTier::Medium => RateLimiterConfig {
                max_tokens: 8,
                base_rate: 3.0,
                adaptive: Some(AdaptiveConfig::default()),
            },
            WorkloadTier::Large => RateLimiterConfig {
                max_tokens: 5,
                base_rate: 2.0,
                adaptive: Some(AdaptiveConfig::default()),
            },
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    current_rate: f64,
    latencies: VecDeque<Duration>,
    last_adjustment: Instant,
}

impl BucketState {
    fn refill(&mut self, now: Instant, capacity: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.current_rate).min(capacity);
        self.last_refill = now;
    }

    fn average_latency(&self) -> Option<Duration> {
        if self.latencies.is_empty() {
            return None;
        }
        let total: Duration = self.latencies.iter().sum();
        Some(total / self.latencies.len() as u32)
    }

    fn adjust(&mut self, now: Instant, base_rate: f64, adaptive: &AdaptiveConfig) {
        if now.saturating_duration_since(self.last_adjustment) < adaptive.adjust_interval {
            return;
        }
        self.last_adjustment = now;

        let Some(average) = self.average_latency() else {
            return;
        };

        let previous = self.current_rate;
        self.current_rate = if average > adaptive.slow_threshold {
            (self.current_rate * adaptive.backoff_factor).max(base_rate * adaptive.min_rate_factor)
        } else if average < adaptive.fast_threshold {
            (self.current_rate * adaptive.burst_multiplier)
                .min(base_rate * adaptive.max_rate_factor)
        } else {
            base_rate
        };

        if previous != self.current_rate {
            tracing::debug!(
                average_latency_ms = average.as_millis() as u64,
                previous_rate = previous,
                rate = self.current_rate,
                "adjusted provider rate"
            );
        }
    }
}

pub struct RateLimiter {
    config: RateLimiterConfig,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        let now = Instant::now();
        let state = BucketState {
            tokens: f64::from(config.max_tokens),
            last_refill: now,
            current_rate: config.base_rate,
            latencies: VecDeque::new(),
            last_adjustment: now,
        };
        RateLimiter {
            config,
            state: Mutex::new(state),
        }
    }

    pub fn for_workload(total_users: usize) -> Self {
        Self::new(RateLimiterConfig::for_workload(total_users))
    }

    /// Waits until `n` tokens are available and takes them. Returns how long
    /// the caller was held back.
    pub async fn acquire(&self, n: u32) -> Result<Duration, RateLimitError> {
        if n > self.config.max_tokens {
            return Err(RateLimitError::ExceedsCapacity {
                requested: n,
                capacity: self.config.max_tokens,
            });
        }

        let started = Instant::now();
        let requested = f64::from(n);

        loop {
            // The lock is released before sleeping.
            let wait = {
                let now = Instant::now();
                let mut state = self.state.lock();
                state.refill(now, f64::from(self.config.max_tokens));
                if let Some(adaptive) = &self.config.adaptive {
                    state.adjust(now, self.config.base_rate, adaptive);
                }

                if state.tokens >= requested {
                    state.tokens -= requested;
                    None
                } else {
                    let missing = requested - state.tokens;
                    Some(Duration::from_secs_f64(missing / state.current_rate))
                }
            };

            match wait {
                None => break,
                Some(wait) => sleep(wait).await,
            }
        }

        let waited = started.elapsed();
        if !waited.is_zero() {
            tracing::trace!(waited_ms = waited.as_millis() as u64, "rate limited");
            self.record_latency(waited);
        }
        Ok(waited)
    }

    /// Adds a latency sample to the window used for adaptation.
    pub fn record_latency(&self, latency: Duration) {
        let window_size = self
            .config
            .adaptive
            .as_ref()
            .map_or(AdaptiveConfig::default().window_size, |a| a.window_size);

        let mut state = self.state.lock();
        state.latencies.push_back(latency);
        while state.latencies.len() > window_size {
            state.latencies.pop_front();
        }
    }

    pub fn available_tokens(&self) -> f64 {
        let mut state = self.state.lock();
        state.refill(Instant::now(), f64::from(self.config.max_tokens));
        state.tokens
    }

    pub fn current_rate(&self) -> f64 {
        self.state.lock().current_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(max_tokens: u32, base_rate: f64) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig {
            max_tokens,
            base_rate,
            adaptive: None,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_up_to_capacity_does_not_wait() {
        let limiter = fixed(5, 5.0);
        let start = Instant::now();
        for _ in 0..5 {
            assert_eq!(limiter.acquire(1).await.unwrap(), Duration::ZERO);
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(limiter.available_tokens() < 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_bucket_waits() {
        let limiter = fixed(5, 5.0);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire(1).await.unwrap();
        }
        let burst = start.elapsed();

        for _ in 0..5 {
            limiter.acquire(1).await.unwrap();
        }
        let total = start.elapsed();

        // Five extra tokens at five per second.
        assert!(total > burst);
        assert!(total >= Duration::from_millis(990), "{total:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_is_lazy_and_capped() {
        let limiter = fixed(4, 2.0);
        for _ in 0..4 {
            limiter.acquire(1).await.unwrap();
        }
        tokio::time::advance(Duration::from_secs(1)).await;
        let available = limiter.available_tokens();
        assert!((available - 2.0).abs() < 0.01, "{available}");

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(limiter.available_tokens(), 4.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_more_than_capacity_fails() {
        let limiter = fixed(3, 1.0);
        assert_eq!(
            limiter.acquire(4).await,
            Err(RateLimitError::ExceedsCapacity {
                requested: 4,
                capacity: 3
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptive_rate_backs_off_and_recovers() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            max_tokens: 10,
            base_rate: 4.0,
            adaptive: Some(AdaptiveConfig::default()),
        });

        // Slow provider: halve the rate.
        for _ in 0..5 {
            limiter.record_latency(Duration::from_secs(3));
        }
        tokio::time::advance(Duration::from_secs(10)).await;
        limiter.acquire(1).await.unwrap();
        assert_eq!(limiter.current_rate(), 2.0);

        // Still slow: floor is a quarter of the base rate.
        tokio::time::advance(Duration::from_secs(10)).await;
        limiter.acquire(1).await.unwrap();
        assert_eq!(limiter.current_rate(), 1.0);
        tokio::time::advance(Duration::from_secs(10)).await;
        limiter.acquire(1).await.unwrap();
        assert_eq!(limiter.current_rate(), 1.0);

        // Window now dominated by fast samples: burst, capped at twice the base.
        for _ in 0..50 {
            limiter.record_latency(Duration::from_millis(100));
        }
        for expected in [1.5, 2.25, 3.375, 5.0625, 7.59375, 8.0] {
            tokio::time::advance(Duration::from_secs(10)).await;
            limiter.acquire(1).await.unwrap();
            assert_eq!(limiter.current_rate(), expected);
        }

        // Normal latency returns to the base rate.
        for _ in 0..50 {
            limiter.record_latency(Duration::from_secs(1));
        }
        tokio::time::advance(Duration::from_secs(10)).await;
        limiter.acquire(1).await.unwrap();
        assert_eq!(limiter.current_rate(), 4.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_is_not_adjusted_within_interval() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            max_tokens: 10,
            base_rate: 4.0,
            adaptive: Some(AdaptiveConfig::default()),
        });
        limiter.record_latency(Duration::from_secs(5));
        tokio::time::advance(Duration::from_secs(5)).await;
        limiter.acquire(1).await.unwrap();
        assert_eq!(limiter.current_rate(), 4.0);
    }

    #[test]
    fn test_workload_tiers() {
        let small = RateLimiterConfig::for_workload(5);
        let medium = RateLimiterConfig::for_workload(50);
        let large = RateLimiterConfig::for_workload(5000);

        assert!(small.adaptive.is_none());
        assert!(medium.adaptive.is_some());
        assert!(large.adaptive.is_some());
        assert!(small.max_tokens > medium.max_tokens);
        assert!(medium.max_tokens > large.max_tokens);
        assert!(medium.base_rate > large.base_rate);
        assert_eq!(WorkloadTier::for_users(100), WorkloadTier::Medium);
        assert_eq!(WorkloadTier::for_users(101), WorkloadTier::Large);
    }
}
