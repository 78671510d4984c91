//! Operational counters for the polling cycle

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct NotifierMetrics {
    ticks: AtomicU64,
    fetch_attempts: AtomicU64,
    fetch_failures: AtomicU64,
    group_failures: AtomicU64,
    transitions: AtomicU64,
    warnings: AtomicU64,
    expirations: AtomicU64,
    notifications: AtomicU64,
}

impl NotifierMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch(&self, ok: bool) {
        self.fetch_attempts.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.fetch_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_group_failure(&self) {
        self.group_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transition(&self) {
        self.transitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_warning(&self) {
        self.warnings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expiration(&self) {
        self.expirations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_notification(&self) {
        self.notifications.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> NotifierMetricsSnapshot {
        let fetch_attempts = self.fetch_attempts.load(Ordering::Relaxed);
        let fetch_failures = self.fetch_failures.load(Ordering::Relaxed);

        let fetch_success_rate = if fetch_attempts > 0 {
            ((fetch_attempts - fetch_failures) as f64 / fetch_attempts as f64) * 100.0
        } else {
            0.0
        };

        NotifierMetricsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            fetch_attempts,
            fetch_failures,
            fetch_success_rate,
            group_failures: self.group_failures.load(Ordering::Relaxed),
            transitions: self.transitions.load(Ordering::Relaxed),
            warnings: self.warnings.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            notifications: self.notifications.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, PartialEq)]
pub struct NotifierMetricsSnapshot {
    pub ticks: u64,
    pub fetch_attempts: u64,
    pub fetch_failures: u64,
    pub fetch_success_rate: f64,
    pub group_failures: u64,
    pub transitions: u64,
    pub warnings: u64,
    pub expirations: u64,
    pub notifications: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        let metrics = NotifierMetrics::new().snapshot();
        assert_eq!(metrics.ticks, 0);
        assert_eq!(metrics.fetch_attempts, 0);
        assert_eq!(metrics.fetch_success_rate, 0.0);
    }

    #[test]
    fn test_success_rate() {
        let metrics = NotifierMetrics::new();
        metrics.record_fetch(true);
        metrics.record_fetch(true);
        metrics.record_fetch(true);
        metrics.record_fetch(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.fetch_attempts, 4);
        assert_eq!(snapshot.fetch_failures, 1);
        assert_eq!(snapshot.fetch_success_rate, 75.0);
    }
}
