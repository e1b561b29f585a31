//! Change events
//!
//! [`LogRecord`] is what a [`LogStream`](crate::common::LogStream) yields:
//! positional row images, DDL changes and heartbeats. The dispatcher turns
//! row records into typed [`ChangeEvent`]s with named columns.

use crate::common::offset::Offset;
use crate::common::schema_history::SchemaChangeRecord;
use crate::common::split::TableId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Row change kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Row inserted (also used for rows read by a snapshot scan)
    Insert,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
}

impl ChangeKind {
    /// Whether this kind carries a before image.
    pub fn has_before(&self) -> bool {
        matches!(self, Self::Update | Self::Delete)
    }

    /// Whether this kind carries an after image.
    pub fn has_after(&self) -> bool {
        matches!(self, Self::Insert | Self::Update)
    }
}

/// A decoded row change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Log position of the change
    pub source_position: Offset,
    pub table_id: TableId,
    pub kind: ChangeKind,
    /// Row image before the change (Update/Delete)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Map<String, Value>>,
    /// Row image after the change (Insert/Update)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Map<String, Value>>,
    /// Event timestamp (Unix epoch millis)
    pub timestamp_ms: i64,
}

impl ChangeEvent {
    pub fn insert(
        source_position: Offset,
        table_id: TableId,
        after: Map<String, Value>,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            source_position,
            table_id,
            kind: ChangeKind::Insert,
            before: None,
            after: Some(after),
            timestamp_ms,
        }
    }

    pub fn update(
        source_position: Offset,
        table_id: TableId,
        before: Map<String, Value>,
        after: Map<String, Value>,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            source_position,
            table_id,
            kind: ChangeKind::Update,
            before: Some(before),
            after: Some(after),
            timestamp_ms,
        }
    }

    pub fn delete(
        source_position: Offset,
        table_id: TableId,
        before: Map<String, Value>,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            source_position,
            table_id,
            kind: ChangeKind::Delete,
            before: Some(before),
            after: None,
            timestamp_ms,
        }
    }

    /// The image that identifies the row: after for inserts/updates, before
    /// for deletes.
    pub fn row(&self) -> Option<&Map<String, Value>> {
        match self.kind {
            ChangeKind::Delete => self.before.as_ref(),
            _ => self.after.as_ref().or(self.before.as_ref()),
        }
    }

    /// Value of `column` in the identifying row image.
    pub fn key_value(&self, column: &str) -> Option<&Value> {
        self.row().and_then(|row| row.get(column))
    }

    /// Rough in-memory size, used for the queue's byte limit.
    pub fn estimated_size(&self) -> usize {
        fn image_size(image: &Option<Map<String, Value>>) -> usize {
            image.as_ref().map_or(0, |row| {
                row.iter()
                    .map(|(k, v)| k.len() + value_size(v))
                    .sum::<usize>()
            })
        }
        std::mem::size_of::<Self>()
            + self.table_id.database.len()
            + self.table_id.table.len()
            + image_size(&self.before)
            + image_size(&self.after)
    }
}

fn value_size(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(_) => 1,
        Value::Number(_) => 8,
        Value::String(s) => s.len(),
        Value::Array(items) => items.iter().map(value_size).sum(),
        Value::Object(map) => map.iter().map(|(k, v)| k.len() + value_size(v)).sum(),
    }
}

/// A row change as read from the log: column values in ordinal order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChangeRecord {
    pub position: Offset,
    pub table_id: TableId,
    pub kind: ChangeKind,
    #[serde(default)]
    pub before: Option<Vec<Value>>,
    #[serde(default)]
    pub after: Option<Vec<Value>>,
    /// Unix epoch millis
    #[serde(default)]
    pub timestamp_ms: i64,
}

impl RawChangeRecord {
    pub fn insert(position: Offset, table_id: TableId, after: Vec<Value>) -> Self {
        Self {
            position,
            table_id,
            kind: ChangeKind::Insert,
            before: None,
            after: Some(after),
            timestamp_ms: 0,
        }
    }

    pub fn update(
        position: Offset,
        table_id: TableId,
        before: Vec<Value>,
        after: Vec<Value>,
    ) -> Self {
        Self {
            position,
            table_id,
            kind: ChangeKind::Update,
            before: Some(before),
            after: Some(after),
            timestamp_ms: 0,
        }
    }

    pub fn delete(position: Offset, table_id: TableId, before: Vec<Value>) -> Self {
        Self {
            position,
            table_id,
            kind: ChangeKind::Delete,
            before: Some(before),
            after: None,
            timestamp_ms: 0,
        }
    }

    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }
}

/// One entry of a log stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogRecord {
    /// Row change
    Change(RawChangeRecord),
    /// Table structure change
    SchemaChange(SchemaChangeRecord),
    /// Position advance without data
    Heartbeat { position: Offset },
}

impl LogRecord {
    pub fn position(&self) -> &Offset {
        match self {
            Self::Change(record) => &record.position,
            Self::SchemaChange(record) => &record.position,
            Self::Heartbeat { position } => position,
        }
    }
}
