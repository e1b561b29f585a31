//! Incremental split producer
//!
//! Streams the log from the split's starting offset. Records strictly after
//! the ending offset are never pushed; the record that reaches the ending
//! offset is the last one.
//!
//! A change to a key covered by a finished snapshot split is only emitted
//! once the stream is past that split's watermark. Earlier changes are
//! already part of the snapshot output and advance the offset as
//! heartbeats.

use crate::common::{
    CdcError, ChangeEvent, Dispatched, EventDispatcher, FetchMetrics, FinishedSnapshotSplit,
    LogStream, Offset, QueueProducer, QueueRecord, Result, SplitId,
};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info, trace};

pub(crate) struct IncrementalProducer {
    pub split_id: SplitId,
    pub stream: Box<dyn LogStream>,
    pub ending_offset: Option<Offset>,
    pub finished_snapshot_splits: Vec<FinishedSnapshotSplit>,
    pub dispatcher: EventDispatcher,
    pub metrics: Arc<FetchMetrics>,
}

impl IncrementalProducer {
    pub async fn run(mut self, queue: &QueueProducer) -> Result<()> {
        let mut records = 0u64;
        let mut skipped = 0u64;
        loop {
            let Some(record) = self.stream.next_record().await? else {
                return Err(CdcError::ConnectionClosed);
            };
            let position = record.position().clone();

            if let Some(end) = &self.ending_offset {
                if matches!(position.partial_cmp(end), Some(Ordering::Greater)) {
                    debug!(
                        "Incremental split {} passed ending offset {} at {}",
                        self.split_id, end, position
                    );
                    break;
                }
            }

            match self.dispatcher.dispatch(record)? {
                Dispatched::Event(event) if self.should_emit(&event) => {
                    queue.push(QueueRecord::Change(event)).await?;
                    records += 1;
                }
                Dispatched::Event(event) => {
                    trace!(
                        "Change to {} at {} is already in the snapshot",
                        event.table_id,
                        position
                    );
                    skipped += 1;
                    queue.push(QueueRecord::Heartbeat(position.clone())).await?;
                }
                Dispatched::SchemaChanged(table) => {
                    self.metrics.record_schema_change(&table.to_string());
                    queue.push(QueueRecord::Heartbeat(position.clone())).await?;
                }
                Dispatched::Heartbeat(_) | Dispatched::Skipped => {
                    queue.push(QueueRecord::Heartbeat(position.clone())).await?;
                }
            }

            if let Some(end) = &self.ending_offset {
                if position.reached(end) {
                    break;
                }
            }
        }
        info!(
            "Incremental split {} reached its ending offset after {} changes, {} skipped",
            self.split_id, records, skipped
        );
        Ok(())
    }

    fn should_emit(&self, event: &ChangeEvent) -> bool {
        let covering = self.finished_snapshot_splits.iter().find(|finished| {
            event
                .key_value(&finished.key_column)
                .is_some_and(|key| finished.covers(&event.table_id, key))
        });
        match covering {
            Some(finished) => finished.is_past_watermark(&event.source_position),
            None => true,
        }
    }
}
