//! Testing utilities for fetch tasks
//!
//! In-memory doubles for the capabilities a fetch context consumes, so the
//! [`FetchTask`](crate::fetch::FetchTask) surface can be exercised without a
//! database.
//!
//! # Example
//!
//! ```rust,ignore
//! use rivven_cdc_fetch::testing::*;
//!
//! let connection = MemoryLogConnection::new()
//!     .with_log_files(["mysql-bin.000001"])
//!     .with_schema(orders_schema)
//!     .with_records(vec![LogRecord::Change(insert)])
//!     .close_stream_when_drained(true);
//!
//! let mut context = FetchTaskContext::new(config, Arc::new(connection), history);
//! context.configure(split).await?;
//! let events: Vec<_> = context.read()?.into_stream().try_collect().await?;
//! ```

use crate::common::{
    CdcError, ChangeEvent, GtidSet, LogConnection, LogRecord, LogStream, Offset, RawChangeRecord,
    Result, RowSink, SchemaChangeRecord, SnapshotSplit, TableId,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

// ============================================================================
// Memory Log Connection
// ============================================================================

#[derive(Debug, Default)]
struct ConnectionState {
    log_files: Vec<String>,
    known: GtidSet,
    purged: GtidSet,
    positions: VecDeque<Offset>,
    last_position: Option<Offset>,
    records: Vec<LogRecord>,
    schemas: HashMap<TableId, SchemaChangeRecord>,
    snapshot_rows: HashMap<TableId, Vec<Vec<Value>>>,
    close_stream_when_drained: bool,
    /// (streams left to fail, records delivered before failing)
    stream_failures: (usize, usize),
    fail_close: bool,
    opened_offsets: Vec<Offset>,
    schema_queries: usize,
    resets: usize,
    closes: usize,
}

/// A scriptable log connection.
///
/// Streams opened at an offset deliver the scripted records strictly after
/// that offset. Once drained they wait forever, like a live log, unless
/// [`close_stream_when_drained`](Self::close_stream_when_drained) is set.
#[derive(Debug, Clone, Default)]
pub struct MemoryLogConnection {
    state: Arc<Mutex<ConnectionState>>,
}

impl MemoryLogConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retained log files, oldest first
    pub fn with_log_files<I, S>(self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state.lock().log_files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_known_gtid_set(self, set: GtidSet) -> Self {
        self.state.lock().known = set;
        self
    }

    pub fn with_purged_gtid_set(self, set: GtidSet) -> Self {
        self.state.lock().purged = set;
        self
    }

    /// Answers for successive `current_position` calls. The last one repeats.
    pub fn with_positions(self, positions: impl IntoIterator<Item = Offset>) -> Self {
        self.state.lock().positions = positions.into_iter().collect();
        self
    }

    /// Current structure reported for a table.
    pub fn with_schema(self, schema: SchemaChangeRecord) -> Self {
        self.state
            .lock()
            .schemas
            .insert(schema.table_id.clone(), schema);
        self
    }

    /// The change log, in position order.
    pub fn with_records(self, records: Vec<LogRecord>) -> Self {
        self.state.lock().records = records;
        self
    }

    /// Table rows returned by snapshot scans, as positional values.
    pub fn with_snapshot_rows(self, table_id: TableId, rows: Vec<Vec<Value>>) -> Self {
        self.state.lock().snapshot_rows.insert(table_id, rows);
        self
    }

    pub fn close_stream_when_drained(self, close: bool) -> Self {
        self.state.lock().close_stream_when_drained = close;
        self
    }

    /// The next `streams` streams fail with a dropped connection after
    /// delivering `after_records` records.
    pub fn fail_streams(self, streams: usize, after_records: usize) -> Self {
        self.state.lock().stream_failures = (streams, after_records);
        self
    }

    /// Make `close` report an error.
    pub fn fail_close(self) -> Self {
        self.state.lock().fail_close = true;
        self
    }

    /// Offsets streams were opened at, in order.
    pub fn opened_offsets(&self) -> Vec<Offset> {
        self.state.lock().opened_offsets.clone()
    }

    pub fn schema_queries(&self) -> usize {
        self.state.lock().schema_queries
    }

    pub fn reset_count(&self) -> usize {
        self.state.lock().resets
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().closes
    }
}

#[async_trait]
impl LogConnection for MemoryLogConnection {
    async fn available_log_files(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().log_files.clone())
    }

    async fn known_gtid_set(&self) -> Result<GtidSet> {
        Ok(self.state.lock().known.clone())
    }

    async fn purged_gtid_set(&self) -> Result<GtidSet> {
        Ok(self.state.lock().purged.clone())
    }

    async fn current_position(&self) -> Result<Offset> {
        let mut state = self.state.lock();
        if let Some(next) = state.positions.pop_front() {
            state.last_position = Some(next);
        }
        Ok(state.last_position.clone().unwrap_or_else(Offset::initial))
    }

    async fn open_stream(&self, offset: &Offset) -> Result<Box<dyn LogStream>> {
        let mut state = self.state.lock();
        state.opened_offsets.push(offset.clone());
        let records: VecDeque<LogRecord> = state
            .records
            .iter()
            .filter(|r| matches!(r.position().partial_cmp(offset), Some(Ordering::Greater)))
            .cloned()
            .collect();
        let fail_after = match state.stream_failures {
            (0, _) => None,
            (n, after) => {
                state.stream_failures = (n - 1, after);
                Some(after)
            }
        };
        Ok(Box::new(MemoryLogStream {
            records,
            end_when_drained: state.close_stream_when_drained,
            fail_after,
            delivered: 0,
        }))
    }

    async fn scan_snapshot(&self, split: &SnapshotSplit) -> Result<Box<dyn LogStream>> {
        let state = self.state.lock();
        let schema = state
            .schemas
            .get(&split.table_id)
            .ok_or_else(|| CdcError::schema(format!("no such table {}", split.table_id)))?;
        let key_index = schema
            .columns
            .iter()
            .position(|c| c.name == split.key_column)
            .ok_or_else(|| {
                CdcError::schema(format!(
                    "no column {} in {}",
                    split.key_column, split.table_id
                ))
            })?;
        let records = state
            .snapshot_rows
            .get(&split.table_id)
            .into_iter()
            .flatten()
            .filter(|row| row.get(key_index).is_some_and(|k| split.key_range.contains(k)))
            .map(|row| {
                LogRecord::Change(RawChangeRecord::insert(
                    Offset::initial(),
                    split.table_id.clone(),
                    row.clone(),
                ))
            })
            .collect();
        Ok(Box::new(MemoryLogStream {
            records,
            end_when_drained: true,
            fail_after: None,
            delivered: 0,
        }))
    }

    async fn query_table_schema(&self, table_id: &TableId) -> Result<SchemaChangeRecord> {
        let mut state = self.state.lock();
        state.schema_queries += 1;
        state
            .schemas
            .get(table_id)
            .cloned()
            .ok_or_else(|| CdcError::schema(format!("no such table {}", table_id)))
    }

    async fn reset_listeners(&self) -> Result<()> {
        self.state.lock().resets += 1;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.closes += 1;
        if state.fail_close {
            return Err(CdcError::connection("socket already closed"));
        }
        Ok(())
    }
}

struct MemoryLogStream {
    records: VecDeque<LogRecord>,
    end_when_drained: bool,
    fail_after: Option<usize>,
    delivered: usize,
}

#[async_trait]
impl LogStream for MemoryLogStream {
    async fn next_record(&mut self) -> Result<Option<LogRecord>> {
        if self.fail_after == Some(self.delivered) {
            return Err(CdcError::ConnectionClosed);
        }
        match self.records.pop_front() {
            Some(record) => {
                self.delivered += 1;
                Ok(Some(record))
            }
            None if self.end_when_drained => Ok(None),
            None => futures::future::pending().await,
        }
    }
}

// ============================================================================
// Collecting Sink
// ============================================================================

/// A sink that keeps everything written to it.
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    events: Arc<Mutex<Vec<ChangeEvent>>>,
    writes: Arc<Mutex<usize>>,
    flushes: Arc<Mutex<usize>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `write` calls
    pub fn writes(&self) -> usize {
        *self.writes.lock()
    }

    pub fn flushes(&self) -> usize {
        *self.flushes.lock()
    }
}

#[async_trait]
impl RowSink for CollectingSink {
    async fn write(&mut self, events: Vec<ChangeEvent>) -> Result<()> {
        self.events.lock().extend(events);
        *self.writes.lock() += 1;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        *self.flushes.lock() += 1;
        Ok(())
    }
}
