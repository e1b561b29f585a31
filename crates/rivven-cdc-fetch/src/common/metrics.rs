//! # Fetch metrics
//!
//! Counters for one connector's fetch tasks. Every update is kept in an
//! atomic (readable through [`FetchMetrics::snapshot`]) and emitted to the
//! `metrics` crate facade, so any installed exporter (Prometheus, StatsD)
//! picks it up.
//!
//! ```ignore
//! let metrics = Arc::new(FetchMetrics::new("orders-cdc"));
//! metrics.record_event(ChangeKind::Insert, 512);
//! assert_eq!(metrics.snapshot().events_total, 1);
//! ```

use crate::common::event::ChangeKind;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Fetch metrics collector with lock-free counters.
#[derive(Debug)]
pub struct FetchMetrics {
    connector: String,

    events_total: AtomicU64,
    bytes_total: AtomicU64,
    inserts: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    batches_total: AtomicU64,
    heartbeats_total: AtomicU64,
    schema_changes_total: AtomicU64,

    queue_depth: AtomicU64,
    queue_bytes: AtomicU64,
    producer_blocked_total: AtomicU64,

    splits_started: AtomicU64,
    splits_completed: AtomicU64,
    splits_failed: AtomicU64,
    unresumable_offsets: AtomicU64,
    retries_total: AtomicU64,
    checkpoints_total: AtomicU64,
}

/// Point-in-time copy of [`FetchMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FetchMetricsSnapshot {
    pub events_total: u64,
    pub bytes_total: u64,
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub batches_total: u64,
    pub heartbeats_total: u64,
    pub schema_changes_total: u64,
    pub queue_depth: u64,
    pub queue_bytes: u64,
    pub producer_blocked_total: u64,
    pub splits_started: u64,
    pub splits_completed: u64,
    pub splits_failed: u64,
    pub unresumable_offsets: u64,
    pub retries_total: u64,
    pub checkpoints_total: u64,
}

impl FetchMetrics {
    pub fn new(connector: impl Into<String>) -> Self {
        Self {
            connector: connector.into(),
            events_total: AtomicU64::new(0),
            bytes_total: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
            updates: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            batches_total: AtomicU64::new(0),
            heartbeats_total: AtomicU64::new(0),
            schema_changes_total: AtomicU64::new(0),
            queue_depth: AtomicU64::new(0),
            queue_bytes: AtomicU64::new(0),
            producer_blocked_total: AtomicU64::new(0),
            splits_started: AtomicU64::new(0),
            splits_completed: AtomicU64::new(0),
            splits_failed: AtomicU64::new(0),
            unresumable_offsets: AtomicU64::new(0),
            retries_total: AtomicU64::new(0),
            checkpoints_total: AtomicU64::new(0),
        }
    }

    pub fn connector(&self) -> &str {
        &self.connector
    }

    /// Record one emitted change event.
    #[inline]
    pub fn record_event(&self, kind: ChangeKind, bytes: u64) {
        self.events_total.fetch_add(1, Ordering::Relaxed);
        self.bytes_total.fetch_add(bytes, Ordering::Relaxed);
        let op = match kind {
            ChangeKind::Insert => {
                self.inserts.fetch_add(1, Ordering::Relaxed);
                "insert"
            }
            ChangeKind::Update => {
                self.updates.fetch_add(1, Ordering::Relaxed);
                "update"
            }
            ChangeKind::Delete => {
                self.deletes.fetch_add(1, Ordering::Relaxed);
                "delete"
            }
        };

        metrics::counter!(
            "rivven_cdc_fetch_events_total",
            "connector" => self.connector.clone(),
            "op" => op
        )
        .increment(1);
        metrics::counter!(
            "rivven_cdc_fetch_bytes_total",
            "connector" => self.connector.clone()
        )
        .increment(bytes);
    }

    /// Record one batch handed to the consumer.
    pub fn record_batch(&self, size: usize) {
        self.batches_total.fetch_add(1, Ordering::Relaxed);
        metrics::histogram!(
            "rivven_cdc_fetch_batch_size",
            "connector" => self.connector.clone()
        )
        .record(size as f64);
    }

    pub fn record_heartbeat(&self) {
        self.heartbeats_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_schema_change(&self, table: &str) {
        self.schema_changes_total.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "rivven_cdc_fetch_schema_changes_total",
            "connector" => self.connector.clone(),
            "table" => table.to_string()
        )
        .increment(1);
    }

    /// Update the queue depth gauges.
    pub fn set_queue_depth(&self, records: usize, bytes: usize) {
        self.queue_depth.store(records as u64, Ordering::Relaxed);
        self.queue_bytes.store(bytes as u64, Ordering::Relaxed);
        metrics::gauge!(
            "rivven_cdc_fetch_queue_depth",
            "connector" => self.connector.clone()
        )
        .set(records as f64);
        metrics::gauge!(
            "rivven_cdc_fetch_queue_bytes",
            "connector" => self.connector.clone()
        )
        .set(bytes as f64);
    }

    /// A producer had to wait for queue space.
    pub fn record_producer_blocked(&self) {
        self.producer_blocked_total.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "rivven_cdc_fetch_producer_blocked_total",
            "connector" => self.connector.clone()
        )
        .increment(1);
    }

    pub fn record_split_started(&self, kind: &'static str) {
        self.splits_started.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "rivven_cdc_fetch_splits_started_total",
            "connector" => self.connector.clone(),
            "kind" => kind
        )
        .increment(1);
    }

    pub fn record_split_completed(&self, kind: &'static str) {
        self.splits_completed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "rivven_cdc_fetch_splits_completed_total",
            "connector" => self.connector.clone(),
            "kind" => kind
        )
        .increment(1);
    }

    /// Record a failed split, labelled by error code.
    pub fn record_split_failed(&self, error_code: &'static str) {
        self.splits_failed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "rivven_cdc_fetch_splits_failed_total",
            "connector" => self.connector.clone(),
            "error" => error_code
        )
        .increment(1);
    }

    pub fn record_unresumable_offset(&self) {
        self.unresumable_offsets.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "rivven_cdc_fetch_unresumable_offsets_total",
            "connector" => self.connector.clone()
        )
        .increment(1);
    }

    pub fn record_retry(&self) {
        self.retries_total.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "rivven_cdc_fetch_retries_total",
            "connector" => self.connector.clone()
        )
        .increment(1);
    }

    pub fn record_checkpoint(&self) {
        self.checkpoints_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FetchMetricsSnapshot {
        FetchMetricsSnapshot {
            events_total: self.events_total.load(Ordering::Relaxed),
            bytes_total: self.bytes_total.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            batches_total: self.batches_total.load(Ordering::Relaxed),
            heartbeats_total: self.heartbeats_total.load(Ordering::Relaxed),
            schema_changes_total: self.schema_changes_total.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            queue_bytes: self.queue_bytes.load(Ordering::Relaxed),
            producer_blocked_total: self.producer_blocked_total.load(Ordering::Relaxed),
            splits_started: self.splits_started.load(Ordering::Relaxed),
            splits_completed: self.splits_completed.load(Ordering::Relaxed),
            splits_failed: self.splits_failed.load(Ordering::Relaxed),
            unresumable_offsets: self.unresumable_offsets.load(Ordering::Relaxed),
            retries_total: self.retries_total.load(Ordering::Relaxed),
            checkpoints_total: self.checkpoints_total.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_events_by_kind() {
        let metrics = FetchMetrics::new("test");
        metrics.record_event(ChangeKind::Insert, 100);
        metrics.record_event(ChangeKind::Update, 50);
        metrics.record_event(ChangeKind::Delete, 10);

        let snap = metrics.snapshot();
        assert_eq!(snap.events_total, 3);
        assert_eq!(snap.bytes_total, 160);
        assert_eq!((snap.inserts, snap.updates, snap.deletes), (1, 1, 1));
    }

    #[test]
    fn test_queue_gauges_overwrite() {
        let metrics = FetchMetrics::new("test");
        metrics.set_queue_depth(10, 1000);
        metrics.set_queue_depth(3, 300);
        let snap = metrics.snapshot();
        assert_eq!(snap.queue_depth, 3);
        assert_eq!(snap.queue_bytes, 300);
    }

    #[test]
    fn test_split_counters() {
        let metrics = FetchMetrics::new("test");
        metrics.record_split_started("snapshot");
        metrics.record_split_completed("snapshot");
        metrics.record_split_failed("offset_not_available");
        metrics.record_unresumable_offset();
        metrics.record_retry();

        let snap = metrics.snapshot();
        assert_eq!(snap.splits_started, 1);
        assert_eq!(snap.splits_completed, 1);
        assert_eq!(snap.splits_failed, 1);
        assert_eq!(snap.unresumable_offsets, 1);
        assert_eq!(snap.retries_total, 1);
        assert_eq!(metrics.connector(), "test");
    }
}
