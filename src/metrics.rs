//! Metrics and observability for order-delta-sync.
//!
//! Counters are kept in atomics so a snapshot can be embedded in the run
//! summary, and are mirrored to the `metrics` facade for any installed
//! recorder.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Remote call kind, used as a metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Group lookup/creation
    Group,
    /// Item create/update
    Item,
    /// Sub-item create/update
    Subitem,
}

impl CallKind {
    fn label(&self) -> &'static str {
        match self {
            CallKind::Group => "group",
            CallKind::Item => "item",
            CallKind::Subitem => "subitem",
        }
    }
}

/// Metrics collector for remote calls.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Group calls issued
    pub group_calls: AtomicU64,
    /// Item calls issued
    pub item_calls: AtomicU64,
    /// Sub-item calls issued
    pub subitem_calls: AtomicU64,
    /// Records sent across all item/sub-item calls
    pub records_sent: AtomicU64,
    /// Batches split by the fallback ladder
    pub fallback_splits: AtomicU64,
    /// Calls that timed out
    pub timeouts: AtomicU64,
    /// Records that ended failed
    pub records_failed: AtomicU64,
    /// Group resolution retries
    pub retries: AtomicU64,
}

impl Metrics {
    /// Create new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one remote call carrying `records` records.
    pub fn record_call(&self, kind: CallKind, records: usize) {
        let counter = match kind {
            CallKind::Group => &self.group_calls,
            CallKind::Item => &self.item_calls,
            CallKind::Subitem => &self.subitem_calls,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if kind != CallKind::Group {
            self.records_sent.fetch_add(records as u64, Ordering::Relaxed);
        }
        ::metrics::counter!("order_sync_remote_calls_total", "kind" => kind.label()).increment(1);
        ::metrics::counter!("order_sync_records_sent_total", "kind" => kind.label())
            .increment(records as u64);
    }

    /// Record a fallback split.
    pub fn record_split(&self) {
        self.fallback_splits.fetch_add(1, Ordering::Relaxed);
        ::metrics::counter!("order_sync_fallback_splits_total").increment(1);
    }

    /// Record a call timeout.
    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        ::metrics::counter!("order_sync_timeouts_total").increment(1);
    }

    /// Record records that ended failed.
    pub fn record_failures(&self, count: usize) {
        if count == 0 {
            return;
        }
        self.records_failed.fetch_add(count as u64, Ordering::Relaxed);
        ::metrics::counter!("order_sync_records_failed_total").increment(count as u64);
    }

    /// Record a retry.
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        ::metrics::counter!("order_sync_retries_total").increment(1);
    }

    /// Get snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            group_calls: self.group_calls.load(Ordering::Relaxed),
            item_calls: self.item_calls.load(Ordering::Relaxed),
            subitem_calls: self.subitem_calls.load(Ordering::Relaxed),
            records_sent: self.records_sent.load(Ordering::Relaxed),
            fallback_splits: self.fallback_splits.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            records_failed: self.records_failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Group calls issued
    pub group_calls: u64,
    /// Item calls issued
    pub item_calls: u64,
    /// Sub-item calls issued
    pub subitem_calls: u64,
    /// Records sent
    pub records_sent: u64,
    /// Fallback splits
    pub fallback_splits: u64,
    /// Timeouts
    pub timeouts: u64,
    /// Records failed
    pub records_failed: u64,
    /// Retries
    pub retries: u64,
}

impl MetricsSnapshot {
    /// Total remote calls.
    pub fn total_calls(&self) -> u64 {
        self.group_calls + self.item_calls + self.subitem_calls
    }

    /// Average records per item/sub-item call.
    pub fn avg_batch_size(&self) -> f64 {
        let calls = self.item_calls + self.subitem_calls;
        if calls == 0 {
            0.0
        } else {
            self.records_sent as f64 / calls as f64
        }
    }
}

/// Timer for measuring operation duration.
pub struct Timer {
    start: Instant,
    label: String,
}

impl Timer {
    /// Start a new timer.
    pub fn start(label: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            label: label.into(),
        }
    }

    /// Get elapsed time in milliseconds.
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Stop timer and log duration.
    pub fn stop(self) -> u64 {
        let elapsed = self.elapsed_ms();
        tracing::debug!("{} completed in {}ms", self.label, elapsed);
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = Metrics::new();

        metrics.record_call(CallKind::Group, 1);
        metrics.record_call(CallKind::Item, 15);
        metrics.record_call(CallKind::Item, 5);
        metrics.record_call(CallKind::Subitem, 29);
        metrics.record_split();
        metrics.record_timeout();
        metrics.record_failures(2);
        metrics.record_failures(0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.group_calls, 1);
        assert_eq!(snapshot.item_calls, 2);
        assert_eq!(snapshot.subitem_calls, 1);
        assert_eq!(snapshot.records_sent, 49);
        assert_eq!(snapshot.fallback_splits, 1);
        assert_eq!(snapshot.timeouts, 1);
        assert_eq!(snapshot.records_failed, 2);
        assert_eq!(snapshot.total_calls(), 4);
    }

    #[test]
    fn test_avg_batch_size() {
        let snapshot = MetricsSnapshot {
            item_calls: 2,
            subitem_calls: 2,
            records_sent: 49,
            ..Default::default()
        };
        assert!((snapshot.avg_batch_size() - 12.25).abs() < 0.001);
        assert_eq!(MetricsSnapshot::default().avg_batch_size(), 0.0);
    }

    #[test]
    fn test_timer() {
        let timer = Timer::start("unit");
        assert!(timer.stop() < 10_000);
    }
}
