//! Engine metrics: lock-free counters for observability.
//!
//! Every pipeline stage records into one shared [`EngineMetrics`]; callers read
//! a consistent-enough [`MetricsSnapshot`] at any time.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Countable engine events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    SamplesAccepted,
    SamplesRejected,
    SamplesDuplicate,
    SamplesProcessed,
    SamplesDegraded,
    SamplesDropped,
    SamplesBackpressured,
    AlertsOpened,
    AlertsEscalated,
    AlertsSuppressed,
    AlertsResolved,
    ExplanationsComputed,
    ExplanationsFailed,
    RecommendationsDelivered,
    RecommendationsFallback,
    SinkWritesOk,
    SinkWritesFailed,
    SinkWritesDropped,
    SyncSkipped,
}

const COUNTERS: usize = 19;

impl Counter {
    fn index(self) -> usize {
        self as usize
    }
}

/// Shared engine counters.
#[derive(Debug)]
pub struct EngineMetrics {
    counters: [AtomicU64; COUNTERS],
    start_time: Instant,
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
            start_time: Instant::now(),
        }
    }

    /// Record one event.
    pub fn record(&self, counter: Counter) {
        self.record_n(counter, 1);
    }

    pub fn record_n(&self, counter: Counter, n: u64) {
        self.counters[counter.index()].fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        use Counter::*;
        MetricsSnapshot {
            samples_accepted: self.get(SamplesAccepted),
            samples_rejected: self.get(SamplesRejected),
            samples_duplicate: self.get(SamplesDuplicate),
            samples_processed: self.get(SamplesProcessed),
            samples_degraded: self.get(SamplesDegraded),
            samples_dropped: self.get(SamplesDropped),
            samples_backpressured: self.get(SamplesBackpressured),
            alerts_opened: self.get(AlertsOpened),
            alerts_escalated: self.get(AlertsEscalated),
            alerts_suppressed: self.get(AlertsSuppressed),
            alerts_resolved: self.get(AlertsResolved),
            explanations_computed: self.get(ExplanationsComputed),
            explanations_failed: self.get(ExplanationsFailed),
            recommendations_delivered: self.get(RecommendationsDelivered),
            recommendations_fallback: self.get(RecommendationsFallback),
            sink_writes_ok: self.get(SinkWritesOk),
            sink_writes_failed: self.get(SinkWritesFailed),
            sink_writes_dropped: self.get(SinkWritesDropped),
            sync_skipped: self.get(SyncSkipped),
            uptime_secs: self.uptime_secs(),
        }
    }
}

/// Point-in-time copy of the engine counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub samples_accepted: u64,
    pub samples_rejected: u64,
    pub samples_duplicate: u64,
    pub samples_processed: u64,
    pub samples_degraded: u64,
    /// Accepted samples abandoned at shutdown.
    pub samples_dropped: u64,
    /// Readings refused because their worker queue was full. These are not
    /// rejections: the caller may offer the same reading again.
    pub samples_backpressured: u64,
    pub alerts_opened: u64,
    pub alerts_escalated: u64,
    pub alerts_suppressed: u64,
    pub alerts_resolved: u64,
    pub explanations_computed: u64,
    pub explanations_failed: u64,
    pub recommendations_delivered: u64,
    pub recommendations_fallback: u64,
    pub sink_writes_ok: u64,
    pub sink_writes_failed: u64,
    pub sink_writes_dropped: u64,
    pub sync_skipped: u64,
    pub uptime_secs: u64,
}
