//! Bus throughput counters and liveness reporting.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Number of recent publish latencies kept for the rolling average.
const LATENCY_WINDOW: usize = 100;

/// Monotonic counters plus a rolling publish latency.
#[derive(Debug, Default)]
pub struct BusMetrics {
    published: AtomicU64,
    consumed: AtomicU64,
    failed: AtomicU64,
    latencies_ms: Mutex<VecDeque<f64>>,
}

impl BusMetrics {
    pub fn record_published(&self, latency: Duration) {
        self.published.fetch_add(1, Ordering::Relaxed);
        let mut window = self
            .latencies_ms
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if window.len() == LATENCY_WINDOW {
            window.pop_front();
        }
        window.push_back(latency.as_secs_f64() * 1000.0);
    }

    pub fn record_consumed(&self, count: u64) {
        self.consumed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let window = self
            .latencies_ms
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let average_latency_ms = if window.is_empty() {
            0.0
        } else {
            window.iter().sum::<f64>() / window.len() as f64
        };
        MetricsSnapshot {
            events_published: self.published.load(Ordering::Relaxed),
            events_consumed: self.consumed.load(Ordering::Relaxed),
            events_failed: self.failed.load(Ordering::Relaxed),
            average_latency_ms,
        }
    }
}

/// Point-in-time view of [`BusMetrics`], for dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub events_published: u64,
    pub events_consumed: u64,
    pub events_failed: u64,
    pub average_latency_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

/// Cheap liveness probe result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub consumer_tasks: usize,
    pub running: bool,
}
