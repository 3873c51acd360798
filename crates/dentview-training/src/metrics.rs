//! Service-level counters reported alongside model status

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Atomic counters for classification and retraining activity
///
/// Every `record_*` call also forwards to the `metrics` facade so an exporter
/// installed by the embedding application sees the same numbers.
#[derive(Clone)]
pub struct ServiceMetrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    classifications: AtomicU64,
    fallbacks: AtomicU64,
    refinements: AtomicU64,
    total_latency_us: AtomicU64,
    retrains: AtomicU64,
    failed_retrains: AtomicU64,
    samples_added: AtomicU64,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                classifications: AtomicU64::new(0),
                fallbacks: AtomicU64::new(0),
                refinements: AtomicU64::new(0),
                total_latency_us: AtomicU64::new(0),
                retrains: AtomicU64::new(0),
                failed_retrains: AtomicU64::new(0),
                samples_added: AtomicU64::new(0),
            }),
        }
    }

    /// Record one classification and its outcome
    pub fn record_classification(&self, latency_us: u64, fallback: bool, refined: bool) {
        self.inner.classifications.fetch_add(1, Ordering::Relaxed);
        self.inner
            .total_latency_us
            .fetch_add(latency_us, Ordering::Relaxed);
        metrics::counter!("dentview_classifications_total").increment(1);
        metrics::histogram!("dentview_classification_latency_us").record(latency_us as f64);

        if fallback {
            self.inner.fallbacks.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("dentview_fallbacks_total").increment(1);
        }
        if refined {
            self.inner.refinements.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a finished retrain
    pub fn record_retrain(&self, success: bool) {
        if success {
            self.inner.retrains.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("dentview_retrains_total", "outcome" => "success").increment(1);
        } else {
            self.inner.failed_retrains.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("dentview_retrains_total", "outcome" => "failure").increment(1);
        }
    }

    /// Record a sample stored for training
    pub fn record_sample_added(&self) {
        self.inner.samples_added.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            classifications: self.inner.classifications.load(Ordering::Relaxed),
            fallbacks: self.inner.fallbacks.load(Ordering::Relaxed),
            refinements: self.inner.refinements.load(Ordering::Relaxed),
            total_latency_us: self.inner.total_latency_us.load(Ordering::Relaxed),
            retrains: self.inner.retrains.load(Ordering::Relaxed),
            failed_retrains: self.inner.failed_retrains.load(Ordering::Relaxed),
            samples_added: self.inner.samples_added.load(Ordering::Relaxed),
        }
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub classifications: u64,
    pub fallbacks: u64,
    pub refinements: u64,
    pub total_latency_us: u64,
    pub retrains: u64,
    pub failed_retrains: u64,
    pub samples_added: u64,
}

impl MetricsSnapshot {
    /// Average classification latency
    pub fn avg_latency_us(&self) -> u64 {
        if self.classifications == 0 {
            0
        } else {
            self.total_latency_us / self.classifications
        }
    }

    /// Share of classifications answered with the fallback
    pub fn fallback_rate(&self) -> f64 {
        if self.classifications == 0 {
            0.0
        } else {
            self.fallbacks as f64 / self.classifications as f64
        }
    }
}
