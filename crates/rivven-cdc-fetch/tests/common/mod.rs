//! Shared fixtures for the fetch integration tests.

#![allow(dead_code)]

use rivven_cdc_fetch::common::{ColumnDefinition, RawChangeRecord};
use rivven_cdc_fetch::{FetchConfig, LogRecord, Offset, SchemaChangeRecord, TableId};
use serde_json::{json, Value};
use std::sync::Once;
use std::time::Duration;

static INIT: Once = Once::new();

/// Initialize test logging (idempotent)
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("rivven_cdc_fetch=debug".parse().unwrap()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub const BINLOG: &str = "mysql-bin.000001";

pub fn pos(position: u64) -> Offset {
    Offset::binlog(BINLOG, position)
}

pub fn orders() -> TableId {
    TableId::new("shop", "orders")
}

pub fn customers() -> TableId {
    TableId::new("shop", "customers")
}

/// `orders(id, amount)` as of the start of the log.
pub fn orders_schema() -> SchemaChangeRecord {
    SchemaChangeRecord::new(
        orders(),
        vec![
            ColumnDefinition::new("id", "bigint", 1).with_primary_key(true),
            ColumnDefinition::new("amount", "bigint", 2),
        ],
        pos(4),
    )
}

pub fn customers_schema() -> SchemaChangeRecord {
    SchemaChangeRecord::new(
        customers(),
        vec![
            ColumnDefinition::new("id", "bigint", 1).with_primary_key(true),
            ColumnDefinition::new("name", "varchar", 2),
        ],
        pos(4),
    )
}

pub fn order_row(id: i64, amount: i64) -> Vec<Value> {
    vec![json!(id), json!(amount)]
}

pub fn insert(position: u64, id: i64, amount: i64) -> LogRecord {
    LogRecord::Change(RawChangeRecord::insert(pos(position), orders(), order_row(id, amount)))
}

pub fn update(position: u64, id: i64, old: i64, new: i64) -> LogRecord {
    LogRecord::Change(RawChangeRecord::update(
        pos(position),
        orders(),
        order_row(id, old),
        order_row(id, new),
    ))
}

pub fn delete(position: u64, id: i64, amount: i64) -> LogRecord {
    LogRecord::Change(RawChangeRecord::delete(pos(position), orders(), order_row(id, amount)))
}

pub fn heartbeat(position: u64) -> LogRecord {
    LogRecord::Heartbeat {
        position: pos(position),
    }
}

/// Config with a short poll interval so idle reads return quickly.
pub fn fast_config(exactly_once: bool) -> FetchConfig {
    FetchConfig::builder()
        .connector_name("orders-cdc")
        .exactly_once(exactly_once)
        .poll_interval(Duration::from_millis(20))
        .build()
        .unwrap()
}

/// `(id, amount)` of an event's row image.
pub fn id_amount(event: &rivven_cdc_fetch::ChangeEvent) -> (i64, i64) {
    let row = event.row().unwrap();
    (row["id"].as_i64().unwrap(), row["amount"].as_i64().unwrap())
}
