//! Raw log record dispatch
//!
//! Converts positional row images into named-column [`ChangeEvent`]s using
//! the column layout the schema history holds for the record's position.
//! DDL records extend the history so later rows decode with the new layout.

use crate::common::error::{CdcError, Result};
use crate::common::event::{ChangeEvent, LogRecord, RawChangeRecord};
use crate::common::offset::Offset;
use crate::common::schema_history::{SchemaChangeRecord, SchemaHistoryHandle};
use crate::common::split::TableId;
use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::{debug, trace};

/// What a log record turned into.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    Event(ChangeEvent),
    /// History was extended for this table
    SchemaChanged(TableId),
    /// Position advanced without data
    Heartbeat(Offset),
    /// Record belongs to a table outside the split
    Skipped,
}

/// Decodes log records for the tables of one split.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    history: SchemaHistoryHandle,
    tables: HashSet<TableId>,
}

impl EventDispatcher {
    pub fn new(history: SchemaHistoryHandle, tables: impl IntoIterator<Item = TableId>) -> Self {
        Self {
            history,
            tables: tables.into_iter().collect(),
        }
    }

    pub fn captures(&self, table_id: &TableId) -> bool {
        self.tables.contains(table_id)
    }

    pub fn dispatch(&self, record: LogRecord) -> Result<Dispatched> {
        match record {
            LogRecord::Change(raw) => {
                if !self.captures(&raw.table_id) {
                    trace!("Skipping change for uncaptured table {}", raw.table_id);
                    return Ok(Dispatched::Skipped);
                }
                self.decode(raw).map(Dispatched::Event)
            }
            LogRecord::SchemaChange(change) => {
                if !self.captures(&change.table_id) {
                    return Ok(Dispatched::Skipped);
                }
                let table_id = change.table_id.clone();
                debug!(
                    "Schema change for {} at {}: {}",
                    table_id,
                    change.position,
                    change.ddl.as_deref().unwrap_or("<no ddl>")
                );
                self.history.append(change);
                Ok(Dispatched::SchemaChanged(table_id))
            }
            LogRecord::Heartbeat { position } => Ok(Dispatched::Heartbeat(position)),
        }
    }

    /// Decode one row change against the schema valid at its position.
    pub fn decode(&self, raw: RawChangeRecord) -> Result<ChangeEvent> {
        let schema = self.history.schema_at(&raw.table_id, &raw.position)?;
        self.decode_with(&schema, raw)
    }

    /// Decode one row change against a known layout.
    pub fn decode_with(
        &self,
        schema: &SchemaChangeRecord,
        raw: RawChangeRecord,
    ) -> Result<ChangeEvent> {
        if schema.table_id != raw.table_id {
            return Err(CdcError::malformed(format!(
                "row for {} decoded with the layout of {}",
                raw.table_id, schema.table_id
            )));
        }
        if raw.kind.has_before() != raw.before.is_some() {
            return Err(CdcError::malformed(format!(
                "{:?} record for {} at {} {} a before image",
                raw.kind,
                raw.table_id,
                raw.position,
                if raw.before.is_some() { "has" } else { "lacks" }
            )));
        }
        if raw.kind.has_after() != raw.after.is_some() {
            return Err(CdcError::malformed(format!(
                "{:?} record for {} at {} {} an after image",
                raw.kind,
                raw.table_id,
                raw.position,
                if raw.after.is_some() { "has" } else { "lacks" }
            )));
        }

        let before = raw
            .before
            .map(|values| columns_to_map(schema, values, &raw.position))
            .transpose()?;
        let after = raw
            .after
            .map(|values| columns_to_map(schema, values, &raw.position))
            .transpose()?;

        Ok(ChangeEvent {
            source_position: raw.position,
            table_id: raw.table_id,
            kind: raw.kind,
            before,
            after,
            timestamp_ms: raw.timestamp_ms,
        })
    }
}

fn columns_to_map(
    schema: &SchemaChangeRecord,
    values: Vec<Value>,
    position: &Offset,
) -> Result<Map<String, Value>> {
    if values.len() != schema.columns.len() {
        return Err(CdcError::malformed(format!(
            "row for {} at {} has {} values, schema has {} columns",
            schema.table_id,
            position,
            values.len(),
            schema.columns.len()
        )));
    }
    Ok(schema
        .columns
        .iter()
        .zip(values)
        .map(|(column, value)| (column.name.clone(), value))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::event::ChangeKind;
    use crate::common::schema_history::{ColumnDefinition, SchemaHistoryStore};
    use serde_json::json;

    fn orders() -> TableId {
        TableId::new("shop", "orders")
    }

    fn setup() -> EventDispatcher {
        let history = SchemaHistoryStore::handle();
        history.append(SchemaChangeRecord::new(
            orders(),
            vec![
                ColumnDefinition::new("id", "int", 1).with_primary_key(true),
                ColumnDefinition::new("amount", "int", 2),
            ],
            Offset::binlog("mysql-bin.000001", 4),
        ));
        EventDispatcher::new(history, [orders()])
    }

    #[test]
    fn test_decode_insert_names_columns() {
        let dispatcher = setup();
        let raw = RawChangeRecord::insert(
            Offset::binlog("mysql-bin.000001", 100),
            orders(),
            vec![json!(1), json!(250)],
        );
        let event = dispatcher.decode(raw).unwrap();
        assert_eq!(event.kind, ChangeKind::Insert);
        let after = event.after.unwrap();
        assert_eq!(after["id"], json!(1));
        assert_eq!(after["amount"], json!(250));
    }

    #[test]
    fn test_decode_rejects_wrong_column_count() {
        let dispatcher = setup();
        let raw = RawChangeRecord::insert(
            Offset::binlog("mysql-bin.000001", 100),
            orders(),
            vec![json!(1)],
        );
        let err = dispatcher.decode(raw).unwrap_err();
        assert!(matches!(err, CdcError::MalformedRecord(_)));
    }

    #[test]
    fn test_decode_rejects_missing_image() {
        let dispatcher = setup();
        let mut raw = RawChangeRecord::delete(
            Offset::binlog("mysql-bin.000001", 100),
            orders(),
            vec![json!(1), json!(2)],
        );
        raw.before = None;
        assert!(matches!(
            dispatcher.decode(raw).unwrap_err(),
            CdcError::MalformedRecord(_)
        ));
    }

    #[test]
    fn test_decode_before_history_is_schema_unknown() {
        let dispatcher = setup();
        let raw = RawChangeRecord::insert(
            Offset::binlog("mysql-bin.000000", 100),
            orders(),
            vec![json!(1), json!(2)],
        );
        assert!(matches!(
            dispatcher.decode(raw).unwrap_err(),
            CdcError::SchemaUnknown { .. }
        ));
    }

    #[test]
    fn test_schema_change_applies_to_later_rows() {
        let dispatcher = setup();
        let ddl = SchemaChangeRecord::new(
            orders(),
            vec![
                ColumnDefinition::new("id", "int", 1),
                ColumnDefinition::new("amount", "int", 2),
                ColumnDefinition::new("note", "text", 3),
            ],
            Offset::binlog("mysql-bin.000001", 500),
        )
        .with_ddl("ALTER TABLE orders ADD COLUMN note TEXT");
        assert_eq!(
            dispatcher.dispatch(LogRecord::SchemaChange(ddl)).unwrap(),
            Dispatched::SchemaChanged(orders())
        );

        let before_ddl = RawChangeRecord::insert(
            Offset::binlog("mysql-bin.000001", 400),
            orders(),
            vec![json!(1), json!(2)],
        );
        assert!(dispatcher.decode(before_ddl).is_ok());

        let after_ddl = RawChangeRecord::insert(
            Offset::binlog("mysql-bin.000001", 600),
            orders(),
            vec![json!(1), json!(2), json!("hi")],
        );
        let event = dispatcher.decode(after_ddl).unwrap();
        assert_eq!(event.after.unwrap()["note"], json!("hi"));
    }

    #[test]
    fn test_uncaptured_tables_are_skipped() {
        let dispatcher = setup();
        let raw = RawChangeRecord::insert(
            Offset::binlog("mysql-bin.000001", 100),
            TableId::new("shop", "customers"),
            vec![json!(1)],
        );
        assert_eq!(
            dispatcher.dispatch(LogRecord::Change(raw)).unwrap(),
            Dispatched::Skipped
        );
        let hb = Offset::binlog("mysql-bin.000001", 200);
        assert_eq!(
            dispatcher
                .dispatch(LogRecord::Heartbeat { position: hb.clone() })
                .unwrap(),
            Dispatched::Heartbeat(hb)
        );
    }
}
