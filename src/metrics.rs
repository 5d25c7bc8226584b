//! Performance metrics: request/error counters plus on-demand CPU, memory
//! and uptime sampling for the reliability layer's metrics and
//! performance-threshold monitor loops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use sysinfo::System;

/// Alert thresholds the performance-threshold loop checks a snapshot
/// against.
pub const MEMORY_THRESHOLD_MB: f64 = 1000.0;
pub const CPU_THRESHOLD_PERCENT: f64 = 80.0;
pub const ERROR_RATE_THRESHOLD: f64 = 0.1;
pub const AVG_RESPONSE_THRESHOLD_MS: f64 = 5000.0;

/// A point-in-time read of the counters accumulated by
/// [`PerformanceMetrics::record_request`] plus freshly sampled system
/// resource usage.
#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    pub memory_mb: f64,
    pub cpu_percent: f64,
    pub uptime: Duration,
    pub request_count: u64,
    pub error_count: u64,
    pub avg_response_time_ms: f64,
}

impl MetricsSnapshot {
    /// Names of every alert threshold this snapshot breaches.
    pub fn breached_thresholds(&self) -> Vec<&'static str> {
        let mut warnings = Vec::new();
        if self.memory_mb >= MEMORY_THRESHOLD_MB {
            warnings.push("high memory usage");
        }
        if self.cpu_percent >= CPU_THRESHOLD_PERCENT {
            warnings.push("high cpu usage");
        }
        if self.request_count > 0 {
            let error_rate = self.error_count as f64 / self.request_count as f64;
            if error_rate >= ERROR_RATE_THRESHOLD {
                warnings.push("high error rate");
            }
        }
        if self.avg_response_time_ms >= AVG_RESPONSE_THRESHOLD_MS {
            warnings.push("high average response time");
        }
        warnings
    }
}

/// Request/error counters fed by every retried external call (automation
/// client, memory store), plus process CPU and memory sampled from the OS
/// on request.
pub struct PerformanceMetrics {
    request_count: AtomicU64,
    error_count: AtomicU64,
    total_response_micros: AtomicU64,
    start_time: Instant,
    system: parking_lot::Mutex<System>,
}

impl PerformanceMetrics {
    pub fn new() -> Self {
        Self {
            request_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            total_response_micros: AtomicU64::new(0),
            start_time: Instant::now(),
            system: parking_lot::Mutex::new(System::new_all()),
        }
    }

    /// Records one external call's timing and outcome. Called at the same
    /// boundary a retried automation/memory call crosses, regardless of
    /// which retry attempt finally succeeded or exhausted.
    pub fn record_request(&self, elapsed: Duration, success: bool) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.error_count.fetch_add(1, Ordering::Relaxed);
        }
        self.total_response_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut system = self.system.lock();
        system.refresh_memory();
        system.refresh_cpu_usage();

        let (memory_mb, cpu_percent) = match sysinfo::get_current_pid() {
            Ok(pid) => {
                system.refresh_process(pid);
                match system.process(pid) {
                    Some(process) => (
                        process.memory() as f64 / 1024.0 / 1024.0,
                        process.cpu_usage() as f64,
                    ),
                    None => (
                        system.used_memory() as f64 / 1024.0 / 1024.0,
                        system.global_cpu_info().cpu_usage() as f64,
                    ),
                }
            }
            Err(_) => (
                system.used_memory() as f64 / 1024.0 / 1024.0,
                system.global_cpu_info().cpu_usage() as f64,
            ),
        };

        let request_count = self.request_count.load(Ordering::Relaxed);
        let error_count = self.error_count.load(Ordering::Relaxed);
        let total_micros = self.total_response_micros.load(Ordering::Relaxed);
        let avg_response_time_ms = if request_count > 0 {
            total_micros as f64 / request_count as f64 / 1000.0
        } else {
            0.0
        };

        MetricsSnapshot {
            memory_mb,
            cpu_percent,
            uptime: self.start_time.elapsed(),
            request_count,
            error_count,
            avg_response_time_ms,
        }
    }
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_trip_at_documented_boundaries() {
        let snapshot = MetricsSnapshot {
            memory_mb: 1200.0,
            cpu_percent: 10.0,
            uptime: Duration::from_secs(1),
            request_count: 10,
            error_count: 2,
            avg_response_time_ms: 100.0,
        };
        let warnings = snapshot.breached_thresholds();
        assert!(warnings.contains(&"high memory usage"));
        assert!(warnings.contains(&"high error rate"));
        assert!(!warnings.contains(&"high cpu usage"));
    }

    #[test]
    fn record_request_updates_counts_and_average() {
        let metrics = PerformanceMetrics::new();
        metrics.record_request(Duration::from_millis(100), true);
        metrics.record_request(Duration::from_millis(300), false);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.request_count, 2);
        assert_eq!(snapshot.error_count, 1);
        assert!((snapshot.avg_response_time_ms - 200.0).abs() < 1.0);
    }
}
