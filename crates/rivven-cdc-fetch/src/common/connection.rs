//! Capabilities provided by collaborators
//!
//! The fetch core never speaks the replication protocol or SQL itself. It
//! calls into these traits, which a concrete connector (MySQL binlog client,
//! JDBC-style query layer) implements. One connection is built per fetch
//! context and never shared across splits.

use crate::common::error::Result;
use crate::common::event::{ChangeEvent, LogRecord};
use crate::common::gtid::GtidSet;
use crate::common::offset::Offset;
use crate::common::schema_history::SchemaChangeRecord;
use crate::common::split::{SnapshotSplit, TableId};
use async_trait::async_trait;

/// A lazily read sequence of raw log records.
#[async_trait]
pub trait LogStream: Send {
    /// Next record, or `None` when the stream is exhausted.
    ///
    /// Streaming reads from the live log normally never return `None`.
    async fn next_record(&mut self) -> Result<Option<LogRecord>>;
}

/// Access to the source server's replication log and structural metadata.
#[async_trait]
pub trait LogConnection: Send + Sync {
    /// Log files the server currently retains, oldest first.
    async fn available_log_files(&self) -> Result<Vec<String>>;

    /// GTIDs the server has executed.
    async fn known_gtid_set(&self) -> Result<GtidSet>;

    /// GTIDs the server has purged from its logs.
    async fn purged_gtid_set(&self) -> Result<GtidSet>;

    /// The server's current log position, used for snapshot watermarks.
    async fn current_position(&self) -> Result<Offset>;

    /// Open a streaming read starting at `offset`.
    async fn open_stream(&self, offset: &Offset) -> Result<Box<dyn LogStream>>;

    /// Read the rows of one snapshot split's key range.
    async fn scan_snapshot(&self, split: &SnapshotSplit) -> Result<Box<dyn LogStream>>;

    /// Current structure of a table.
    async fn query_table_schema(&self, table_id: &TableId) -> Result<SchemaChangeRecord>;

    /// Drop every event listener bound by a previous user of this client.
    async fn reset_listeners(&self) -> Result<()>;

    /// Release the connection.
    async fn close(&self) -> Result<()>;
}

/// Downstream delivery of produced events.
#[async_trait]
pub trait RowSink: Send {
    async fn write(&mut self, events: Vec<ChangeEvent>) -> Result<()>;

    /// Flush anything buffered. Default is a no-op.
    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
