//! Fetch task lifecycle: configure, read and close against an in-memory log.

mod common;

use common::*;
use futures::TryStreamExt;
use rivven_cdc_fetch::common::{ColumnDefinition, RawChangeRecord};
use rivven_cdc_fetch::testing::MemoryLogConnection;
use rivven_cdc_fetch::{
    CdcError, ChangeEvent, ChangeKind, ErrorClass, EventReader, FetchTask, FetchTaskContext,
    GtidSet, IncrementalSplit, KeyRange, LogRecord, MemorySchemaHistoryBackend, Offset,
    SchemaChangeRecord, SchemaHistoryStore, SnapshotSplit, SplitState,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const DEADLINE: Duration = Duration::from_secs(5);

async fn drain(reader: &mut EventReader) -> rivven_cdc_fetch::Result<Vec<ChangeEvent>> {
    let mut events = Vec::new();
    while let Some(batch) = reader.next_batch().await? {
        events.extend(batch);
    }
    Ok(events)
}

fn orders_connection() -> MemoryLogConnection {
    MemoryLogConnection::new()
        .with_log_files([BINLOG])
        .with_schema(orders_schema())
        .with_schema(customers_schema())
}

fn context(connection: &MemoryLogConnection, exactly_once: bool) -> FetchTaskContext {
    FetchTaskContext::new(
        fast_config(exactly_once),
        Arc::new(connection.clone()),
        SchemaHistoryStore::handle(),
    )
}

fn first_chunk() -> SnapshotSplit {
    SnapshotSplit::new(orders(), "id", KeyRange::new(None, Some(json!(50))), 0)
}

// ============================================================================
// Snapshot splits
// ============================================================================

#[tokio::test]
async fn test_snapshot_split_reads_key_range() {
    init_test_logging();
    let connection = orders_connection()
        .with_snapshot_rows(
            orders(),
            vec![order_row(1, 10), order_row(2, 20), order_row(3, 30), order_row(60, 600)],
        )
        .with_positions([pos(100), pos(300)]);
    let mut ctx = context(&connection, false);

    ctx.configure(first_chunk().into()).await.unwrap();
    assert_eq!(ctx.state(), Some(SplitState::Opened));
    assert_eq!(ctx.current_offset(), Offset::initial());

    let mut reader = ctx.read().unwrap();
    let events = tokio::time::timeout(DEADLINE, drain(&mut reader))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        events.iter().map(id_amount).collect::<Vec<_>>(),
        vec![(1, 10), (2, 20), (3, 30)]
    );
    assert!(events.iter().all(|e| e.kind == ChangeKind::Insert));
    assert!(events.iter().all(|e| e.source_position == pos(100)));

    let completion = reader.completion().cloned().unwrap();
    assert_eq!(completion.split_id, first_chunk().split_id());
    // without exactly-once the stream takes over from the low watermark
    assert_eq!(completion.final_offset, Some(pos(100)));
    assert_eq!(ctx.current_offset(), pos(100));
    assert_eq!(ctx.state(), Some(SplitState::Completed));
    assert_eq!(connection.reset_count(), 1);

    ctx.close().await;
    ctx.close().await;
    assert_eq!(connection.close_count(), 1);
}

#[tokio::test]
async fn test_exactly_once_snapshot_normalises_concurrent_changes() {
    init_test_logging();
    let connection = orders_connection()
        .with_snapshot_rows(
            orders(),
            vec![order_row(1, 10), order_row(2, 20), order_row(3, 30)],
        )
        .with_positions([pos(100), pos(300)])
        .with_records(vec![
            update(150, 2, 20, 25),
            delete(200, 3, 30),
            insert(250, 4, 40),
            // outside the chunk
            insert(260, 99, 990),
            LogRecord::Change(RawChangeRecord::insert(
                pos(270),
                customers(),
                vec![json!(7), json!("ada")],
            )),
            // after the high watermark
            insert(400, 5, 50),
        ])
        .close_stream_when_drained(true);
    let mut ctx = context(&connection, true);

    ctx.configure(first_chunk().into()).await.unwrap();
    let mut reader = ctx.read().unwrap();
    let events = tokio::time::timeout(DEADLINE, drain(&mut reader))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        events.iter().map(id_amount).collect::<Vec<_>>(),
        vec![(1, 10), (2, 25), (4, 40)]
    );
    assert!(events
        .iter()
        .all(|e| e.kind == ChangeKind::Insert && e.before.is_none()));
    assert!(events.iter().all(|e| e.source_position == pos(300)));
    assert_eq!(connection.opened_offsets(), vec![pos(100)]);
    assert_eq!(
        reader.completion().and_then(|c| c.final_offset.clone()),
        Some(pos(300))
    );
    ctx.close().await;
}

#[tokio::test]
async fn test_exactly_once_snapshot_emits_in_batches() {
    let rows: Vec<_> = (1..=5).map(|id| order_row(id, id * 10)).collect();
    let connection = orders_connection()
        .with_snapshot_rows(orders(), rows)
        .with_positions([pos(100)]);
    let config = rivven_cdc_fetch::FetchConfig::builder()
        .exactly_once(true)
        .max_batch_size(2)
        .max_queue_size(16)
        .poll_interval(Duration::from_millis(20))
        .build()
        .unwrap();
    let mut ctx = FetchTaskContext::new(
        config,
        Arc::new(connection.clone()),
        SchemaHistoryStore::handle(),
    );

    ctx.configure(first_chunk().into()).await.unwrap();
    let mut reader = ctx.read().unwrap();
    let mut sizes = Vec::new();
    while let Some(batch) = tokio::time::timeout(DEADLINE, reader.next_batch())
        .await
        .unwrap()
        .unwrap()
    {
        if !batch.is_empty() {
            sizes.push(batch.len());
        }
    }
    assert_eq!(sizes, vec![2, 2, 1]);
    // no log activity during the scan, so no backfill stream
    assert!(connection.opened_offsets().is_empty());
    ctx.close().await;
}

#[tokio::test]
async fn test_snapshot_with_unknown_chunk_key_fails() {
    let connection = orders_connection();
    let mut ctx = context(&connection, false);
    let split = SnapshotSplit::new(orders(), "order_no", KeyRange::full(), 0);
    let err = ctx.configure(split.into()).await.unwrap_err();
    assert!(matches!(err, CdcError::Schema(_)));
    assert_eq!(ctx.state(), Some(SplitState::Failed));
}

// ============================================================================
// Incremental splits
// ============================================================================

#[tokio::test]
async fn test_bounded_incremental_split_stops_at_ending_offset() {
    init_test_logging();
    let connection = orders_connection().with_records(vec![
        insert(100, 1, 10),
        heartbeat(200),
        update(300, 1, 10, 15),
        insert(400, 2, 20),
    ]);
    let mut ctx = context(&connection, false);
    let split = IncrementalSplit::new(0, vec![orders()], pos(4)).with_ending_offset(pos(300));

    ctx.configure(split.clone().into()).await.unwrap();
    assert_eq!(ctx.current_offset(), pos(4));
    let mut reader = ctx.read().unwrap();
    let events = tokio::time::timeout(DEADLINE, drain(&mut reader))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, ChangeKind::Insert);
    assert_eq!(events[0].source_position, pos(100));
    assert_eq!(events[1].kind, ChangeKind::Update);
    assert_eq!(id_amount(&events[1]), (1, 15));
    assert_eq!(events[1].before.as_ref().unwrap()["amount"], json!(10));

    let completion = reader.completion().cloned().unwrap();
    assert_eq!(completion.split_id, split.split_id());
    assert_eq!(completion.final_offset, Some(pos(300)));
    assert_eq!(connection.opened_offsets(), vec![pos(4)]);
    assert_eq!(ctx.metrics().snapshot().heartbeats_total, 1);
    ctx.close().await;
}

#[tokio::test]
async fn test_unbounded_incremental_split_ends_on_close() {
    let connection = orders_connection().with_records(vec![insert(100, 1, 10), insert(200, 2, 20)]);
    let mut ctx = context(&connection, false);
    ctx.configure(IncrementalSplit::new(0, vec![orders()], pos(4)).into())
        .await
        .unwrap();
    let mut reader = ctx.read().unwrap();

    let mut events = Vec::new();
    while events.len() < 2 {
        let batch = tokio::time::timeout(DEADLINE, reader.next_batch())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        events.extend(batch);
    }
    assert_eq!(ctx.current_offset(), pos(200));

    // the log is idle: polls come back empty
    let idle = reader.next_batch().await.unwrap().unwrap();
    assert!(idle.is_empty());

    ctx.close().await;
    let after_close = tokio::time::timeout(DEADLINE, reader.next_batch())
        .await
        .unwrap()
        .unwrap();
    assert!(after_close.is_none());
    assert!(reader.completion().is_none());
    assert_eq!(ctx.state(), Some(SplitState::Reading));
    assert_eq!(connection.close_count(), 1);
}

#[tokio::test]
async fn test_schema_change_mid_stream() {
    let widened = SchemaChangeRecord::new(
        orders(),
        vec![
            ColumnDefinition::new("id", "bigint", 1).with_primary_key(true),
            ColumnDefinition::new("amount", "bigint", 2),
            ColumnDefinition::new("note", "text", 3).with_nullable(true),
        ],
        pos(200),
    )
    .with_ddl("ALTER TABLE orders ADD COLUMN note TEXT");
    let connection = orders_connection().with_records(vec![
        insert(100, 1, 10),
        LogRecord::SchemaChange(widened),
        LogRecord::Change(RawChangeRecord::insert(
            pos(300),
            orders(),
            vec![json!(2), json!(20), json!("gift")],
        )),
    ]);
    let mut ctx = context(&connection, false);
    ctx.configure(
        IncrementalSplit::new(0, vec![orders()], pos(4))
            .with_ending_offset(pos(300))
            .into(),
    )
    .await
    .unwrap();

    let mut reader = ctx.read().unwrap();
    let events = tokio::time::timeout(DEADLINE, drain(&mut reader))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(events.len(), 2);
    assert!(events[0].after.as_ref().unwrap().get("note").is_none());
    assert_eq!(events[1].after.as_ref().unwrap()["note"], json!("gift"));
    assert_eq!(ctx.history().record_count(&orders()), 2);
    assert_eq!(ctx.metrics().snapshot().schema_changes_total, 1);
    ctx.close().await;
}

#[tokio::test]
async fn test_stream_as_futures_stream() {
    let connection = orders_connection().with_records(vec![
        insert(100, 1, 10),
        insert(200, 2, 20),
        delete(300, 1, 10),
    ]);
    let mut ctx = context(&connection, false);
    ctx.configure(
        IncrementalSplit::new(0, vec![orders()], pos(4))
            .with_ending_offset(pos(300))
            .into(),
    )
    .await
    .unwrap();

    let events: Vec<ChangeEvent> = tokio::time::timeout(
        DEADLINE,
        ctx.read().unwrap().into_stream().try_collect(),
    )
    .await
    .unwrap()
    .unwrap();
    let kinds: Vec<ChangeKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![ChangeKind::Insert, ChangeKind::Insert, ChangeKind::Delete]
    );
    ctx.close().await;
}

// ============================================================================
// Schema history resolution
// ============================================================================

#[tokio::test]
async fn test_history_refs_skip_live_query() {
    let connection = orders_connection().with_records(vec![insert(100, 1, 10)]);
    let mut ctx = context(&connection, false);
    let split = IncrementalSplit::new(0, vec![orders()], pos(4))
        .with_ending_offset(pos(100))
        .with_history_ref(orders(), orders_schema().to_blob().unwrap());

    ctx.configure(split.into()).await.unwrap();
    assert_eq!(connection.schema_queries(), 0);
    assert!(ctx.history().contains_table(&orders()));
    ctx.close().await;
}

#[tokio::test]
async fn test_live_schema_is_persisted_to_backend() {
    let connection = orders_connection();
    let backend = Arc::new(MemorySchemaHistoryBackend::new());
    let split = IncrementalSplit::new(0, vec![orders()], pos(4));

    let mut first = context(&connection, false).with_history_backend(backend.clone());
    first.configure(split.clone().into()).await.unwrap();
    first.close().await;
    assert_eq!(connection.schema_queries(), 1);
    assert_eq!(backend.len(), 1);

    let mut second = context(&connection, false).with_history_backend(backend.clone());
    second.configure(split.into()).await.unwrap();
    second.close().await;
    assert_eq!(connection.schema_queries(), 1);
    let restored = second.history().latest(&orders()).unwrap();
    assert_eq!(restored.columns, orders_schema().columns);
    assert_eq!(restored.position, pos(4));
}

#[tokio::test]
async fn test_duplicate_table_registration_is_fatal() {
    let connection = orders_connection();
    let mut ctx = context(&connection, false);
    let err = ctx
        .configure(IncrementalSplit::new(0, vec![orders(), orders()], pos(4)).into())
        .await
        .unwrap_err();
    assert!(matches!(err, CdcError::DuplicateSchemaRegistration(_)));
    assert_eq!(err.class(), ErrorClass::Configuration);
    assert!(connection.opened_offsets().is_empty());
}

#[tokio::test]
async fn test_missing_schema_for_position_is_internal_error() {
    let late_schema = SchemaChangeRecord::new(
        orders(),
        orders_schema().columns.clone(),
        pos(500),
    );
    let connection = orders_connection().with_records(vec![insert(100, 1, 10)]);
    let mut ctx = context(&connection, false);
    ctx.configure(
        IncrementalSplit::new(0, vec![orders()], pos(4))
            .with_history_ref(orders(), late_schema.to_blob().unwrap())
            .into(),
    )
    .await
    .unwrap();

    let mut reader = ctx.read().unwrap();
    let err = tokio::time::timeout(DEADLINE, drain(&mut reader))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, CdcError::SchemaUnknown { .. }));
    assert_eq!(err.class(), ErrorClass::InternalConsistency);
    assert!(!err.is_retriable());
    assert_eq!(ctx.state(), Some(SplitState::Failed));
    ctx.close().await;
}

// ============================================================================
// Failures and misuse
// ============================================================================

#[tokio::test]
async fn test_unresumable_offset_fails_configure() {
    let connection = MemoryLogConnection::new()
        .with_log_files(["mysql-bin.000007"])
        .with_schema(orders_schema());
    let mut ctx = context(&connection, false);
    let split = IncrementalSplit::new(0, vec![orders()], Offset::binlog("mysql-bin.000003", 4));

    let err = ctx.configure(split.into()).await.unwrap_err();
    assert!(matches!(err, CdcError::OffsetNotAvailable { .. }));
    assert_eq!(err.class(), ErrorClass::Configuration);
    assert!(!err.is_retriable());
    assert_eq!(ctx.state(), Some(SplitState::Failed));
    assert_eq!(ctx.metrics().snapshot().unresumable_offsets, 1);
    // never falls back to another offset
    assert!(connection.opened_offsets().is_empty());
    assert!(ctx.read().is_err());
}

#[tokio::test]
async fn test_ending_offset_must_match_starting_encoding() {
    let connection = orders_connection();
    let mut ctx = context(&connection, false);
    let gtid_end = Offset::gtid(
        GtidSet::new()
            .with_interval("3e11fa47-71ca-11e1-9e33-c80aa9429562", 1, 10)
            .unwrap(),
    );
    let split = IncrementalSplit::new(0, vec![orders()], pos(4)).with_ending_offset(gtid_end);
    let err = ctx.configure(split.into()).await.unwrap_err();
    assert!(matches!(err, CdcError::Config(_)));
}

#[tokio::test]
async fn test_stream_end_is_transient() {
    let connection = orders_connection()
        .with_records(vec![insert(100, 1, 10)])
        .close_stream_when_drained(true);
    let mut ctx = context(&connection, false);
    ctx.configure(IncrementalSplit::new(0, vec![orders()], pos(4)).into())
        .await
        .unwrap();

    let mut reader = ctx.read().unwrap();
    let mut delivered = 0;
    let err = loop {
        match tokio::time::timeout(DEADLINE, reader.next_batch()).await.unwrap() {
            Ok(Some(batch)) => delivered += batch.len(),
            Ok(None) => panic!("stream ended without an error"),
            Err(e) => break e,
        }
    };
    assert_eq!(delivered, 1);
    assert!(matches!(err, CdcError::ConnectionClosed));
    assert!(err.is_retriable());
    assert_eq!(ctx.state(), Some(SplitState::Failed));
    ctx.close().await;
}

#[tokio::test]
async fn test_read_misuse() {
    let connection = orders_connection();
    let mut ctx = context(&connection, false);
    assert!(matches!(ctx.read().unwrap_err(), CdcError::InvalidState(_)));

    ctx.configure(IncrementalSplit::new(0, vec![orders()], pos(4)).into())
        .await
        .unwrap();
    let _reader = ctx.read().unwrap();
    assert!(matches!(ctx.read().unwrap_err(), CdcError::InvalidState(_)));

    let again = ctx
        .configure(IncrementalSplit::new(1, vec![orders()], pos(4)).into())
        .await
        .unwrap_err();
    assert!(matches!(again, CdcError::InvalidState(_)));
    ctx.close().await;
}

#[tokio::test]
async fn test_close_error_is_swallowed() {
    let connection = orders_connection().fail_close();
    let mut ctx = context(&connection, false);
    ctx.configure(IncrementalSplit::new(0, vec![orders()], pos(4)).into())
        .await
        .unwrap();
    ctx.close().await;
    ctx.close().await;
    assert_eq!(connection.close_count(), 1);
}
