use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Execution samples kept per handler
const SAMPLE_WINDOW: usize = 1000;

/// Distinct handler names tracked before new names are pooled
pub const MAX_TRACKED_HANDLERS: usize = 256;

/// Bucket for handler names seen after the limit is reached
pub const OTHER_HANDLERS: &str = "(other)";

/// Live metrics collector for queue operations
#[derive(Debug, Default)]
pub struct LiveMetrics {
    jobs_enqueued: AtomicU64,
    jobs_finished: AtomicU64,
    jobs_retried: AtomicU64,
    jobs_dead_lettered: AtomicU64,
    jobs_cancelled: AtomicU64,
    leases_reclaimed: AtomicU64,

    // Per-handler metrics, at most MAX_TRACKED_HANDLERS names plus OTHER_HANDLERS.
    // Producers can name any handler, registered or not.
    handlers: Mutex<HashMap<String, HandlerMetrics>>,
}

impl LiveMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_handler(&self, handler: &str, update: impl FnOnce(&mut HandlerMetrics)) {
        let mut handlers = self.handlers.lock();
        if let Some(metrics) = handlers.get_mut(handler) {
            update(metrics);
            return;
        }
        let key = if handlers.len() < MAX_TRACKED_HANDLERS {
            handler
        } else {
            OTHER_HANDLERS
        };
        update(handlers.entry(key.to_string()).or_default());
    }

    pub fn increment_jobs_enqueued(&self, handler: &str) {
        self.jobs_enqueued.fetch_add(1, Ordering::Relaxed);
        self.with_handler(handler, |m| m.enqueued += 1);
    }

    pub fn increment_jobs_finished(&self, handler: &str) {
        self.jobs_finished.fetch_add(1, Ordering::Relaxed);
        self.with_handler(handler, |m| m.finished += 1);
    }

    pub fn increment_jobs_retried(&self, handler: &str) {
        self.jobs_retried.fetch_add(1, Ordering::Relaxed);
        self.with_handler(handler, |m| m.retried += 1);
    }

    pub fn increment_jobs_dead_lettered(&self, handler: &str) {
        self.jobs_dead_lettered.fetch_add(1, Ordering::Relaxed);
        self.with_handler(handler, |m| m.dead_lettered += 1);
    }

    pub fn increment_jobs_cancelled(&self) {
        self.jobs_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_leases_reclaimed(&self, count: usize) {
        self.leases_reclaimed.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Record how long one handler invocation took
    pub fn record_execution_time(&self, handler: &str, duration: Duration) {
        self.with_handler(handler, |m| {
            m.execution_times.push_back(duration);
            if m.execution_times.len() > SAMPLE_WINDOW {
                m.execution_times.pop_front();
            }
        });
    }

    // Getters for global metrics
    pub fn jobs_enqueued(&self) -> u64 {
        self.jobs_enqueued.load(Ordering::Relaxed)
    }

    pub fn jobs_finished(&self) -> u64 {
        self.jobs_finished.load(Ordering::Relaxed)
    }

    pub fn jobs_retried(&self) -> u64 {
        self.jobs_retried.load(Ordering::Relaxed)
    }

    pub fn jobs_dead_lettered(&self) -> u64 {
        self.jobs_dead_lettered.load(Ordering::Relaxed)
    }

    pub fn jobs_cancelled(&self) -> u64 {
        self.jobs_cancelled.load(Ordering::Relaxed)
    }

    pub fn leases_reclaimed(&self) -> u64 {
        self.leases_reclaimed.load(Ordering::Relaxed)
    }

    /// Get metrics for a specific handler
    pub fn handler_metrics(&self, handler: &str) -> Option<HandlerMetrics> {
        self.handlers.lock().get(handler).cloned()
    }

    /// Collect current snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let handlers = self
            .handlers
            .lock()
            .iter()
            .map(|(name, metrics)| (name.clone(), metrics.summary()))
            .collect();

        MetricsSnapshot {
            timestamp: Utc::now(),
            global: GlobalMetrics {
                jobs_enqueued: self.jobs_enqueued(),
                jobs_finished: self.jobs_finished(),
                jobs_retried: self.jobs_retried(),
                jobs_dead_lettered: self.jobs_dead_lettered(),
                jobs_cancelled: self.jobs_cancelled(),
                leases_reclaimed: self.leases_reclaimed(),
            },
            handlers,
        }
    }
}

/// Metrics for a specific handler
#[derive(Debug, Clone, Default)]
pub struct HandlerMetrics {
    pub enqueued: u64,
    pub finished: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    execution_times: VecDeque<Duration>,
}

impl HandlerMetrics {
    /// Calculate success rate as percentage
    pub fn success_rate(&self) -> f64 {
        let total_processed = self.finished + self.dead_lettered;
        if total_processed == 0 {
            100.0
        } else {
            (self.finished as f64 / total_processed as f64) * 100.0
        }
    }

    /// Get average execution time
    pub fn average_execution_time(&self) -> Option<Duration> {
        if self.execution_times.is_empty() {
            return None;
        }
        let total: Duration = self.execution_times.iter().sum();
        Some(total / self.execution_times.len() as u32)
    }

    /// Get percentile execution time
    pub fn percentile_execution_time(&self, percentile: f64) -> Option<Duration> {
        if self.execution_times.is_empty() {
            return None;
        }

        let mut sorted: Vec<Duration> = self.execution_times.iter().copied().collect();
        sorted.sort();

        let index = ((percentile / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        sorted.get(index).copied()
    }

    fn summary(&self) -> HandlerSummary {
        HandlerSummary {
            enqueued: self.enqueued,
            finished: self.finished,
            retried: self.retried,
            dead_lettered: self.dead_lettered,
            success_rate: self.success_rate(),
            average_execution_ms: self.average_execution_time().map(|d| d.as_millis() as u64),
            p95_execution_ms: self.percentile_execution_time(95.0).map(|d| d.as_millis() as u64),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub global: GlobalMetrics,
    pub handlers: HashMap<String, HandlerSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HandlerSummary {
    pub enqueued: u64,
    pub finished: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub success_rate: f64,
    pub average_execution_ms: Option<u64>,
    pub p95_execution_ms: Option<u64>,
}

/// Global queue metrics
#[derive(Debug, Clone, Serialize)]
pub struct GlobalMetrics {
    pub jobs_enqueued: u64,
    pub jobs_finished: u64,
    pub jobs_retried: u64,
    pub jobs_dead_lettered: u64,
    pub jobs_cancelled: u64,
    pub leases_reclaimed: u64,
}

impl GlobalMetrics {
    /// Calculate overall success rate
    pub fn success_rate(&self) -> f64 {
        let total_processed = self.jobs_finished + self.jobs_dead_lettered;
        if total_processed == 0 {
            100.0
        } else {
            (self.jobs_finished as f64 / total_processed as f64) * 100.0
        }
    }

    /// Calculate overall retry rate
    pub fn retry_rate(&self) -> f64 {
        if self.jobs_enqueued == 0 {
            0.0
        } else {
            (self.jobs_retried as f64 / self.jobs_enqueued as f64) * 100.0
        }
    }

    /// Jobs enqueued here that have not reached a terminal state yet
    pub fn jobs_in_progress(&self) -> u64 {
        self.jobs_enqueued
            .saturating_sub(self.jobs_finished + self.jobs_dead_lettered + self.jobs_cancelled)
    }
}
