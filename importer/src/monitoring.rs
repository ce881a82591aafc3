//! Live job metrics, threshold alerts and a health score.
//!
//! One monitor is created per job and shared by every batch worker. Rates are
//! derived from wall time since the monitor was created.

use crate::metrics_defs::{ALERTS, USER_DURATION, USER_RETRIES, USERS_PROCESSED, VEHICLES_IMPORTED};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use shared::{counter, histogram};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone, Debug, PartialEq)]
pub struct AlertThresholds {
    /// Failed over processed users.
    pub max_error_rate: f64,
    pub min_users_per_minute: f64,
    /// Retries over total users.
    pub max_retry_ratio: f64,
    /// Throughput is not judged before this much time has passed.
    pub throughput_grace: Duration,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        AlertThresholds {
            max_error_rate: 0.10,
            min_users_per_minute: 1.0,
            max_retry_ratio: 0.5,
            throughput_grace: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Warning,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    HighErrorRate,
    LowThroughput,
    HighRetryRate,
}

impl AlertKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            AlertKind::HighErrorRate => "high_error_rate",
            AlertKind::LowThroughput => "low_throughput",
            AlertKind::HighRetryRate => "high_retry_rate",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub kind: AlertKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total_users: usize,
    pub processed_users: usize,
    pub successful_users: usize,
    pub failed_users: usize,
    pub total_vehicles: usize,
    pub total_retries: u64,
    pub error_rate: f64,
    pub users_per_minute: f64,
    pub vehicles_per_minute: f64,
    pub average_processing_ms: f64,
    pub elapsed_ms: u64,
}

#[derive(Default)]
struct Counters {
    processed: usize,
    successful: usize,
    failed: usize,
    vehicles: usize,
    retries: u64,
    total_processing: Duration,
    alerts: Vec<Alert>,
}

pub struct ImportMonitor {
    total_users: usize,
    thresholds: AlertThresholds,
    started: Instant,
    counters: Mutex<Counters>,
}

impl ImportMonitor {
    pub fn new(total_users: usize) -> Self {
        Self::with_thresholds(total_users, AlertThresholds::default())
    }

    pub fn with_thresholds(total_users: usize, thresholds: AlertThresholds) -> Self {
        ImportMonitor {
            total_users,
            thresholds,
            started: Instant::now(),
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Records the outcome of one username and evaluates alert thresholds.
    pub fn update_user_progress(&self, success: bool, vehicle_count: usize, duration: Duration) {
        let outcome = if success { "success" } else { "failure" };
        counter!(USERS_PROCESSED, "outcome" => outcome).increment(1);
        counter!(VEHICLES_IMPORTED).increment(vehicle_count as u64);
        histogram!(USER_DURATION).record(duration.as_secs_f64());

        let mut counters = self.counters.lock();
        counters.processed += 1;
        if success {
            counters.successful += 1;
        } else {
            counters.failed += 1;
        }
        counters.vehicles += vehicle_count;
        counters.total_processing += duration;

        let snapshot = self.derive(&counters);
        let elapsed = self.started.elapsed();
        let retry_ratio = self.retry_ratio(counters.retries);

        let mut raised = Vec::new();
        if snapshot.error_rate > self.thresholds.max_error_rate {
            raised.push((
                AlertLevel::Error,
                AlertKind::HighErrorRate,
                format!("error rate is {:.1}%", snapshot.error_rate * 100.0),
            ));
        }
        if elapsed >= self.thresholds.throughput_grace
            && snapshot.users_per_minute < self.thresholds.min_users_per_minute
        {
            raised.push((
                AlertLevel::Warning,
                AlertKind::LowThroughput,
                format!("throughput is {:.2} users/min", snapshot.users_per_minute),
            ));
        }
        if retry_ratio > self.thresholds.max_retry_ratio {
            raised.push((
                AlertLevel::Warning,
                AlertKind::HighRetryRate,
                format!(
                    "{} retries for {} users",
                    counters.retries, self.total_users
                ),
            ));
        }

        for (level, kind, message) in raised {
            tracing::warn!(kind = kind.as_str(), level = ?level, detail = %message, "import alert");
            counter!(ALERTS, "kind" => kind.as_str()).increment(1);
            counters.alerts.push(Alert {
                level,
                kind,
                message,
                timestamp: Utc::now(),
            });
        }
    }

    pub fn record_retries(&self, retries: u32) {
        if retries == 0 {
            return;
        }
        counter!(USER_RETRIES).increment(u64::from(retries));
        self.counters.lock().retries += u64::from(retries);
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.counters.lock().alerts.clone()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self.counters.lock();
        self.derive(&counters)
    }

    /// 100 minus capped penalties for errors, low throughput and retries.
    pub fn health_score(&self) -> f64 {
        let counters = self.counters.lock();
        let snapshot = self.derive(&counters);

        let error_penalty = (snapshot.error_rate * 100.0).min(50.0);
        let min_rate = self.thresholds.min_users_per_minute;
        let throughput_penalty = if self.started.elapsed() >= self.thresholds.throughput_grace
            && snapshot.users_per_minute < min_rate
        {
            // Shortfall relative to the configured minimum.
            ((min_rate - snapshot.users_per_minute) / min_rate * 20.0).min(20.0)
        } else {
            0.0
        };
        let retry_penalty = (self.retry_ratio(counters.retries) * 30.0).min(30.0);

        (100.0 - error_penalty - throughput_penalty - retry_penalty).max(0.0)
    }

    fn retry_ratio(&self, retries: u64) -> f64 {
        if self.total_users == 0 {
            0.0
        } else {
            retries as f64 / self.total_users as f64
        }
    }

    fn derive(&self, counters: &Counters) -> MetricsSnapshot {
        let elapsed = self.started.elapsed();
        let minutes = elapsed.as_secs_f64() / 60.0;
        let per_minute = |count: usize| {
            if minutes > 0.0 {
                count as f64 / minutes
            } else {
                0.0
            }
        };

        MetricsSnapshot {
            total_users: self.total_users,
            processed_users: counters.processed,
            successful_users: counters.successful,
            failed_users: counters.failed,
            total_vehicles: counters.vehicles,
            total_retries: counters.retries,
            error_rate: if counters.processed == 0 {
                0.0
            } else {
                counters.failed as f64 / counters.processed as f64
            },
            users_per_minute: per_minute(counters.processed),
            vehicles_per_minute: per_minute(counters.vehicles),
            average_processing_ms: if counters.processed == 0 {
                0.0
            } else {
                counters.total_processing.as_secs_f64() * 1000.0 / counters.processed as f64
            },
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: Duration = Duration::from_secs(1);

    #[tokio::test(start_paused = true)]
    async fn test_healthy_job() {
        let monitor = ImportMonitor::new(4);
        tokio::time::advance(Duration::from_secs(30)).await;
        for _ in 0..4 {
            monitor.update_user_progress(true, 3, SECOND);
        }

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.processed_users, 4);
        assert_eq!(snapshot.total_vehicles, 12);
        assert_eq!(snapshot.users_per_minute, 8.0);
        assert_eq!(snapshot.vehicles_per_minute, 24.0);
        assert_eq!(snapshot.average_processing_ms, 1000.0);
        assert!(monitor.alerts().is_empty());
        assert_eq!(monitor.health_score(), 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_rate_alerts_accumulate() {
        let monitor = ImportMonitor::new(3);
        monitor.update_user_progress(true, 1, SECOND);
        monitor.update_user_progress(false, 0, SECOND);
        monitor.update_user_progress(false, 0, SECOND);

        let alerts = monitor.alerts();
        assert_eq!(alerts.len(), 2);
        assert!(alerts.iter().all(|a| a.kind == AlertKind::HighErrorRate));
        assert_eq!(alerts[0].level, AlertLevel::Error);

        // Error penalty is capped at 50.
        assert_eq!(monitor.health_score(), 50.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throughput_only_judged_after_grace_period() {
        let monitor = ImportMonitor::new(10);
        tokio::time::advance(Duration::from_secs(30)).await;
        monitor.update_user_progress(true, 1, SECOND);
        assert!(monitor.alerts().is_empty());

        tokio::time::advance(Duration::from_secs(210)).await;
        // 2 users in 4 minutes.
        monitor.update_user_progress(true, 1, SECOND);
        let alerts = monitor.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::LowThroughput);
        assert_eq!(alerts[0].level, AlertLevel::Warning);
        assert_eq!(monitor.health_score(), 90.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throughput_penalty_follows_configured_minimum() {
        let thresholds = AlertThresholds {
            min_users_per_minute: 4.0,
            ..AlertThresholds::default()
        };
        let monitor = ImportMonitor::with_thresholds(10, thresholds);
        tokio::time::advance(Duration::from_secs(120)).await;
        monitor.update_user_progress(true, 1, SECOND);
        monitor.update_user_progress(true, 1, SECOND);

        // 1 user/min against a minimum of 4 is a 75% shortfall.
        assert_eq!(monitor.snapshot().users_per_minute, 1.0);
        assert_eq!(monitor.health_score(), 85.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_ratio_alert_and_penalty() {
        let monitor = ImportMonitor::new(2);
        monitor.record_retries(3);
        monitor.update_user_progress(true, 0, SECOND);

        let alerts = monitor.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::HighRetryRate);
        assert_eq!(monitor.snapshot().total_retries, 3);
        assert_eq!(monitor.health_score(), 70.0);
    }
}
