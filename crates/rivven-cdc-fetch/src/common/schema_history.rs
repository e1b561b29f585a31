//! Schema history
//!
//! Rows in the change log are positional; decoding them needs the column
//! layout that was valid when they were written. The [`SchemaHistoryStore`]
//! keeps, per table, an ordered list of [`SchemaChangeRecord`]s and answers
//! "which layout applied at this log position".
//!
//! Records are exchanged with the persistence layer as serialized blobs: a
//! JSON array ("table changes") holding exactly one record.
//!
//! A store is owned by whoever builds fetch contexts and handed to each
//! context as a [`SchemaHistoryHandle`]; there is no process-wide registry.

use crate::common::error::{CdcError, Result};
use crate::common::offset::Offset;
use crate::common::split::TableId;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Column definition within a table layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    /// Column name
    pub name: String,
    /// Database-native type (e.g., "varchar(255)", "int")
    pub type_name: String,
    /// Native type ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_id: Option<i32>,
    /// Column position (1-indexed)
    pub position: u32,
    pub nullable: bool,
    pub primary_key: bool,
    /// Default value expression (if any)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

impl ColumnDefinition {
    /// Create a new column definition.
    pub fn new(name: impl Into<String>, type_name: impl Into<String>, position: u32) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            type_id: None,
            position,
            nullable: true,
            primary_key: false,
            default_value: None,
        }
    }

    /// Set type ID.
    pub fn with_type_id(mut self, type_id: i32) -> Self {
        self.type_id = Some(type_id);
        self
    }

    /// Set nullable.
    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    /// Set primary key. Primary key columns are never nullable.
    pub fn with_primary_key(mut self, pk: bool) -> Self {
        self.primary_key = pk;
        if pk {
            self.nullable = false;
        }
        self
    }

    /// Set default value.
    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default_value = Some(default.into());
        self
    }
}

/// Structure of one table, valid from `position` onwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaChangeRecord {
    pub table_id: TableId,
    /// Columns in ordinal order
    pub columns: Vec<ColumnDefinition>,
    pub position: Offset,
    /// DDL statement that produced this layout, when it came from the log
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ddl: Option<String>,
    /// Unix epoch millis
    #[serde(default)]
    pub timestamp_ms: i64,
}

impl SchemaChangeRecord {
    pub fn new(table_id: TableId, mut columns: Vec<ColumnDefinition>, position: Offset) -> Self {
        columns.sort_by_key(|c| c.position);
        Self {
            table_id,
            columns,
            position,
            ddl: None,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_ddl(mut self, ddl: impl Into<String>) -> Self {
        self.ddl = Some(ddl.into());
        self
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_key_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Serialize as a single-element "table changes" blob.
    pub fn to_blob(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(std::slice::from_ref(self))?)
    }

    /// Decode a "table changes" blob; it must hold exactly one record.
    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        let mut changes: Vec<SchemaChangeRecord> = serde_json::from_slice(blob)?;
        if changes.len() != 1 {
            return Err(CdcError::malformed(format!(
                "table changes should only have one element, found {}",
                changes.len()
            )));
        }
        Ok(changes.remove(0))
    }

    fn same_layout_at(&self, other: &SchemaChangeRecord) -> bool {
        self.position == other.position && self.columns == other.columns && self.ddl == other.ddl
    }
}

/// Shared handle to a store, passed explicitly into each fetch context.
pub type SchemaHistoryHandle = Arc<SchemaHistoryStore>;

/// Ordered schema records per table.
#[derive(Debug, Default)]
pub struct SchemaHistoryStore {
    tables: RwLock<HashMap<TableId, Vec<SchemaChangeRecord>>>,
}

impl SchemaHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// New store wrapped in a handle.
    pub fn handle() -> SchemaHistoryHandle {
        Arc::new(Self::new())
    }

    /// Start a registration batch for one configure call.
    pub fn begin_registration(&self) -> HistoryRegistration<'_> {
        HistoryRegistration {
            store: self,
            pending: Vec::new(),
        }
    }

    /// Seed history for one table. Records already present are skipped.
    pub fn register(&self, table_id: &TableId, records: Vec<SchemaChangeRecord>) -> Result<()> {
        if let Some(foreign) = records.iter().find(|r| &r.table_id != table_id) {
            return Err(CdcError::schema(format!(
                "record for {} registered under {}",
                foreign.table_id, table_id
            )));
        }
        let mut tables = self.tables.write();
        let history = tables.entry(table_id.clone()).or_default();
        for record in records {
            insert_ordered(history, record);
        }
        Ok(())
    }

    /// Append a record observed in the log stream (a DDL change).
    pub fn append(&self, record: SchemaChangeRecord) {
        let mut tables = self.tables.write();
        let history = tables.entry(record.table_id.clone()).or_default();
        insert_ordered(history, record);
    }

    /// Latest record for `table_id` whose position is not after `position`.
    pub fn schema_at(&self, table_id: &TableId, position: &Offset) -> Result<SchemaChangeRecord> {
        let tables = self.tables.read();
        tables
            .get(table_id)
            .and_then(|history| history.iter().rev().find(|r| position.reached(&r.position)))
            .cloned()
            .ok_or_else(|| CdcError::schema_unknown(table_id, position))
    }

    /// Oldest record regardless of position.
    pub fn earliest(&self, table_id: &TableId) -> Option<SchemaChangeRecord> {
        self.tables
            .read()
            .get(table_id)
            .and_then(|history| history.first().cloned())
    }

    /// Most recent record regardless of position.
    pub fn latest(&self, table_id: &TableId) -> Option<SchemaChangeRecord> {
        self.tables
            .read()
            .get(table_id)
            .and_then(|history| history.last().cloned())
    }

    pub fn contains_table(&self, table_id: &TableId) -> bool {
        self.tables
            .read()
            .get(table_id)
            .is_some_and(|h| !h.is_empty())
    }

    pub fn record_count(&self, table_id: &TableId) -> usize {
        self.tables.read().get(table_id).map_or(0, Vec::len)
    }

    pub fn tables(&self) -> Vec<TableId> {
        let mut tables: Vec<TableId> = self.tables.read().keys().cloned().collect();
        tables.sort();
        tables
    }
}

fn insert_ordered(history: &mut Vec<SchemaChangeRecord>, record: SchemaChangeRecord) {
    if history.iter().any(|r| r.same_layout_at(&record)) {
        return;
    }
    // before the first record strictly after the new position
    let index = history
        .iter()
        .position(|r| matches!(r.position.partial_cmp(&record.position), Some(Ordering::Greater)))
        .unwrap_or(history.len());
    history.insert(index, record);
}

/// One configure call's worth of schema registrations.
///
/// Nothing reaches the store until [`commit`](Self::commit); a duplicate
/// table within the batch is rejected.
#[derive(Debug)]
pub struct HistoryRegistration<'a> {
    store: &'a SchemaHistoryStore,
    pending: Vec<SchemaChangeRecord>,
}

impl HistoryRegistration<'_> {
    pub fn register(&mut self, record: SchemaChangeRecord) -> Result<()> {
        if self.pending.iter().any(|r| r.table_id == record.table_id) {
            return Err(CdcError::DuplicateSchemaRegistration(
                record.table_id.to_string(),
            ));
        }
        self.pending.push(record);
        Ok(())
    }

    /// Decode and register a serialized record for `table_id`.
    pub fn register_blob(&mut self, table_id: &TableId, blob: &[u8]) -> Result<()> {
        let record = SchemaChangeRecord::from_blob(blob)?;
        if &record.table_id != table_id {
            return Err(CdcError::schema(format!(
                "schema blob for {} holds a record for {}",
                table_id, record.table_id
            )));
        }
        self.register(record)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Merge the batch into the store.
    pub fn commit(self) -> usize {
        let count = self.pending.len();
        for record in self.pending {
            debug!("Registering schema for {} at {}", record.table_id, record.position);
            self.store.append(record);
        }
        count
    }
}

/// Persistence for serialized schema records, addressed by table.
#[async_trait]
pub trait SchemaHistoryBackend: Send + Sync {
    async fn load(&self, table_id: &TableId) -> Result<Option<Vec<u8>>>;

    async fn save(&self, table_id: &TableId, blob: Vec<u8>) -> Result<()>;
}

/// In-memory [`SchemaHistoryBackend`].
#[derive(Debug, Default)]
pub struct MemorySchemaHistoryBackend {
    blobs: RwLock<HashMap<TableId, Vec<u8>>>,
}

impl MemorySchemaHistoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

#[async_trait]
impl SchemaHistoryBackend for MemorySchemaHistoryBackend {
    async fn load(&self, table_id: &TableId) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().get(table_id).cloned())
    }

    async fn save(&self, table_id: &TableId, blob: Vec<u8>) -> Result<()> {
        self.blobs.write().insert(table_id.clone(), blob);
        Ok(())
    }
}
