//! Snapshot split producer and exactly-once normalisation
//!
//! ```text
//!  low  = current_position()
//!  scan rows of the key range          ── rows stamped with `low`
//!  high = current_position()
//!  [exactly-once] replay log (low, high] for the table and key range
//!  Watermark(high)        with exactly-once
//!  Watermark(low)         otherwise
//! ```
//!
//! With exactly-once delivery the consumer holds everything until the
//! watermark and then emits the upserted final image of each row, so a row
//! changed during the scan is delivered once, as of `high`. Without it the
//! rows are a fuzzy read and the split hands off at `low`, so the stream
//! re-reads whatever changed while the scan ran.

use crate::common::{
    ChangeEvent, ChangeKind, CdcError, Dispatched, EventDispatcher, FetchMetrics, LogConnection,
    LogRecord, Offset, QueueProducer, QueueRecord, Result, SchemaChangeRecord, SnapshotSplit,
};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

pub(crate) struct SnapshotProducer {
    pub split: SnapshotSplit,
    pub schema: SchemaChangeRecord,
    pub connection: Arc<dyn LogConnection>,
    pub dispatcher: EventDispatcher,
    pub exactly_once: bool,
    pub metrics: Arc<FetchMetrics>,
}

impl SnapshotProducer {
    pub async fn run(self, queue: &QueueProducer) -> Result<()> {
        let split_id = self.split.split_id();
        let low = self.connection.current_position().await?;
        debug!("Snapshot split {} low watermark {}", split_id, low);

        let mut scan = self.connection.scan_snapshot(&self.split).await?;
        let mut rows = 0u64;
        while let Some(record) = scan.next_record().await? {
            let LogRecord::Change(raw) = record else {
                continue;
            };
            if raw.kind != ChangeKind::Insert {
                return Err(CdcError::malformed(format!(
                    "snapshot scan of {} returned a {:?} record",
                    split_id, raw.kind
                )));
            }
            let mut event = self.dispatcher.decode_with(&self.schema, raw)?;
            event.source_position = low.clone();
            queue.push(QueueRecord::Change(event)).await?;
            rows += 1;
        }

        let high = self.connection.current_position().await?;
        info!(
            "Snapshot split {} scanned {} rows between {} and {}",
            split_id, rows, low, high
        );

        if !self.exactly_once {
            return queue.push(QueueRecord::Watermark(low)).await;
        }
        if high != low {
            self.backfill(&low, &high, queue).await?;
        }
        queue.push(QueueRecord::Watermark(high)).await
    }

    /// Replay changes to this split's rows made while the scan ran.
    async fn backfill(&self, low: &Offset, high: &Offset, queue: &QueueProducer) -> Result<()> {
        let mut stream = self.connection.open_stream(low).await?;
        let mut replayed = 0u64;
        while let Some(record) = stream.next_record().await? {
            let position = record.position().clone();
            if matches!(position.partial_cmp(high), Some(Ordering::Greater)) {
                break;
            }
            match self.dispatcher.dispatch(record)? {
                Dispatched::Event(event) if self.in_split(&event) => {
                    queue.push(QueueRecord::Change(event)).await?;
                    replayed += 1;
                }
                Dispatched::SchemaChanged(table) => {
                    self.metrics.record_schema_change(&table.to_string());
                }
                _ => {}
            }
            if position.reached(high) {
                break;
            }
        }
        debug!(
            "Snapshot split {} replayed {} changes up to {}",
            self.split.split_id(),
            replayed,
            high
        );
        Ok(())
    }

    fn in_split(&self, event: &ChangeEvent) -> bool {
        event.table_id == self.split.table_id
            && event
                .key_value(&self.split.key_column)
                .is_some_and(|key| self.split.key_range.contains(key))
    }
}

/// Upserts snapshot rows and replayed changes by chunk key.
#[derive(Debug)]
pub(crate) struct SnapshotNormalizer {
    key_column: String,
    rows: Vec<Option<ChangeEvent>>,
    index: HashMap<String, usize>,
}

impl SnapshotNormalizer {
    pub fn new(key_column: impl Into<String>) -> Self {
        Self {
            key_column: key_column.into(),
            rows: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn apply(&mut self, event: ChangeEvent) -> Result<()> {
        let key = match event.key_value(&self.key_column) {
            Some(Value::Null) | None => {
                return Err(CdcError::malformed(format!(
                    "row of {} at {} has no value for key column {}",
                    event.table_id, event.source_position, self.key_column
                )))
            }
            Some(value) => value.to_string(),
        };
        let slot = match self.index.get(&key) {
            Some(&i) => i,
            None => {
                self.rows.push(None);
                self.index.insert(key, self.rows.len() - 1);
                self.rows.len() - 1
            }
        };
        self.rows[slot] = match event.kind {
            ChangeKind::Delete => None,
            ChangeKind::Insert | ChangeKind::Update => Some(ChangeEvent {
                kind: ChangeKind::Insert,
                before: None,
                ..event
            }),
        };
        Ok(())
    }

    /// Final row images, stamped with the high watermark.
    pub fn finish(self, high: &Offset) -> Vec<ChangeEvent> {
        self.rows
            .into_iter()
            .flatten()
            .map(|mut event| {
                event.source_position = high.clone();
                event
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::TableId;
    use serde_json::{json, Map};

    fn row(id: i64, amount: i64) -> Map<String, Value> {
        json!({ "id": id, "amount": amount }).as_object().cloned().unwrap()
    }

    fn orders() -> TableId {
        TableId::new("shop", "orders")
    }

    #[test]
    fn test_normalizer_upserts_and_deletes() {
        let low = Offset::binlog("mysql-bin.000001", 100);
        let high = Offset::binlog("mysql-bin.000001", 300);
        let mut normalizer = SnapshotNormalizer::new("id");

        normalizer
            .apply(ChangeEvent::insert(low.clone(), orders(), row(1, 10), 0))
            .unwrap();
        normalizer
            .apply(ChangeEvent::insert(low.clone(), orders(), row(2, 20), 0))
            .unwrap();
        normalizer
            .apply(ChangeEvent::insert(low.clone(), orders(), row(3, 30), 0))
            .unwrap();
        normalizer
            .apply(ChangeEvent::update(
                Offset::binlog("mysql-bin.000001", 150),
                orders(),
                row(2, 20),
                row(2, 25),
                0,
            ))
            .unwrap();
        normalizer
            .apply(ChangeEvent::delete(
                Offset::binlog("mysql-bin.000001", 200),
                orders(),
                row(3, 30),
                0,
            ))
            .unwrap();
        normalizer
            .apply(ChangeEvent::insert(
                Offset::binlog("mysql-bin.000001", 250),
                orders(),
                row(4, 40),
                0,
            ))
            .unwrap();

        let rows = normalizer.finish(&high);
        let images: Vec<(i64, i64)> = rows
            .iter()
            .map(|e| {
                let after = e.after.as_ref().unwrap();
                (after["id"].as_i64().unwrap(), after["amount"].as_i64().unwrap())
            })
            .collect();
        assert_eq!(images, vec![(1, 10), (2, 25), (4, 40)]);
        assert!(rows.iter().all(|e| e.kind == ChangeKind::Insert && e.before.is_none()));
        assert!(rows.iter().all(|e| e.source_position == high));
    }

    #[test]
    fn test_normalizer_rejects_missing_key() {
        let mut normalizer = SnapshotNormalizer::new("id");
        let keyless = json!({ "amount": 1 }).as_object().cloned().unwrap();
        let err = normalizer
            .apply(ChangeEvent::insert(Offset::initial(), orders(), keyless, 0))
            .unwrap_err();
        assert!(matches!(err, CdcError::MalformedRecord(_)));
    }
}
