//! Rolling success/latency metrics for the detector. Purely observational: nothing here
//! feeds back into classification.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Good,
    Warning,
    Critical,
}

impl HealthLevel {
    /// `good` above 90% success, `warning` above 70%, `critical` otherwise.
    pub fn from_success_rate(percent: f64) -> Self {
        if percent > 90.0 {
            Self::Good
        } else if percent > 70.0 {
            Self::Warning
        } else {
            Self::Critical
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub overall_health: HealthLevel,
    /// Percentage of successful analyses (0 before the first analysis).
    pub success_rate: f64,
    pub total_analyses: u64,
    pub successful_analyses: u64,
    pub failed_analyses: u64,
    /// Mean analysis latency in seconds.
    pub average_processing_time: f64,
    /// Model name → whether it is loaded and serving.
    pub model_status: BTreeMap<String, bool>,
    pub uptime_seconds: f64,
}

#[derive(Debug, Default)]
struct Counters {
    total: u64,
    successful: u64,
    failed: u64,
    average_processing_time: f64,
}

#[derive(Debug)]
pub struct HealthMonitor {
    started: Instant,
    counters: Mutex<Counters>,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn record_outcome(&self, success: bool, latency: Duration) {
        let mut c = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        c.total += 1;
        if success {
            c.successful += 1;
        } else {
            c.failed += 1;
        }
        let previous = c.average_processing_time * (c.total - 1) as f64;
        c.average_processing_time = (previous + latency.as_secs_f64()) / c.total as f64;
    }

    /// Snapshot of the counters. With no analyses recorded yet the system reports `good`.
    pub fn report(&self, model_status: BTreeMap<String, bool>) -> HealthReport {
        let (total, successful, failed, average_processing_time) = {
            let c = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
            (c.total, c.successful, c.failed, c.average_processing_time)
        };

        let success_rate = if total > 0 {
            successful as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        let overall_health = if total == 0 {
            HealthLevel::Good
        } else {
            HealthLevel::from_success_rate(success_rate)
        };

        HealthReport {
            overall_health,
            success_rate,
            total_analyses: total,
            successful_analyses: successful,
            failed_analyses: failed,
            average_processing_time,
            model_status,
            uptime_seconds: self.started.elapsed().as_secs_f64(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds() {
        assert_eq!(HealthLevel::from_success_rate(95.0), HealthLevel::Good);
        assert_eq!(HealthLevel::from_success_rate(90.0), HealthLevel::Warning);
        assert_eq!(HealthLevel::from_success_rate(70.5), HealthLevel::Warning);
        assert_eq!(HealthLevel::from_success_rate(70.0), HealthLevel::Critical);
    }

    #[test]
    fn rolling_average_and_rate() {
        let m = HealthMonitor::new();
        m.record_outcome(true, Duration::from_secs(1));
        m.record_outcome(true, Duration::from_secs(3));
        m.record_outcome(false, Duration::from_secs(2));
        m.record_outcome(true, Duration::from_secs(2));

        let r = m.report(BTreeMap::new());
        assert_eq!(r.total_analyses, 4);
        assert_eq!(r.failed_analyses, 1);
        assert!((r.average_processing_time - 2.0).abs() < 1e-9);
        assert!((r.success_rate - 75.0).abs() < 1e-9);
        assert_eq!(r.overall_health, HealthLevel::Warning);
    }

    #[test]
    fn fresh_monitor_is_good() {
        let r = HealthMonitor::new().report(BTreeMap::from([("m".to_owned(), true)]));
        assert_eq!(r.overall_health, HealthLevel::Good);
        assert_eq!(r.total_analyses, 0);
        assert!(r.model_status["m"]);
    }

    #[test]
    fn counting_survives_a_poisoned_lock() {
        let m = std::sync::Arc::new(HealthMonitor::new());
        m.record_outcome(true, Duration::from_secs(1));

        let held = std::sync::Arc::clone(&m);
        let joined = std::thread::spawn(move || {
            let _guard = held.counters.lock();
            panic!("poison the counters");
        })
        .join();
        assert!(joined.is_err());

        m.record_outcome(false, Duration::from_secs(3));
        let r = m.report(BTreeMap::new());
        assert_eq!(r.total_analyses, 2);
        assert_eq!(r.failed_analyses, 1);
        assert!((r.average_processing_time - 2.0).abs() < 1e-9);
    }
}
