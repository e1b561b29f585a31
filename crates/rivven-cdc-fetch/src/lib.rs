//! # rivven-cdc-fetch - Split-based CDC fetch core
//!
//! Reads a MySQL-style change log as a set of independent splits: snapshot
//! splits scan one key range of one table, incremental splits stream the
//! binlog from a stored offset. Each split runs in its own fetch context
//! with its own connection and event queue.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    ┌──────────────────────────────────────────────┐
//! │ SplitAssigner│───►│              FetchTaskContext                │
//! └──────────────┘    │  configure: history → offset → reconcile →   │
//!                     │             queue → dispatcher               │
//!                     │  read:  producer task ─► EventQueue ─►       │
//!                     │         EventReader                          │
//!                     └───────────────────────┬──────────────────────┘
//!                                             ▼
//!                     ┌──────────────────────────────────────────────┐
//!                     │ FetchRunner: RowSink, checkpoints, retries   │
//!                     └──────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn example(connection: std::sync::Arc<dyn rivven_cdc_fetch::LogConnection>) -> anyhow::Result<()> {
//! use rivven_cdc_fetch::{
//!     FetchConfig, FetchTask, FetchTaskContext, IncrementalSplit, Offset, SchemaHistoryStore,
//!     TableId,
//! };
//!
//! let config = FetchConfig::builder().connector_name("orders-cdc").build()?;
//! let split = IncrementalSplit::new(
//!     0,
//!     vec![TableId::new("shop", "orders")],
//!     Offset::binlog("mysql-bin.000042", 4),
//! );
//!
//! let mut context = FetchTaskContext::new(config, connection, SchemaHistoryStore::handle());
//! context.configure(split.into()).await?;
//! let mut reader = context.read()?;
//! while let Some(batch) = reader.next_batch().await? {
//!     for event in batch {
//!         println!("{:?} {} at {}", event.kind, event.table_id, event.source_position);
//!     }
//! }
//! context.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Public API Organization
//!
//! ### Tier 1: Core Types (crate root)
//! Offsets, splits, events, errors and the fetch task surface.
//!
//! ### Tier 2: Production Features (crate root)
//! Assignment, checkpointing, retries, metrics and configuration.
//!
//! ### Tier 3: Advanced Types (`common` module)
//! Queue halves, GTID algebra, dispatcher, schema registration batches.

pub mod common;
pub mod fetch;
pub mod testing;

// =============================================================================
// TIER 1: Core Types
// =============================================================================

pub use common::{
    // Error handling
    CdcError,
    ErrorCategory,
    ErrorClass,
    Result,
    // Positions
    GtidSet,
    Offset,
    PositionReconciler,
    // Splits
    FinishedSnapshotSplit,
    IncrementalSplit,
    KeyRange,
    SnapshotSplit,
    Split,
    SplitCompletion,
    SplitId,
    SplitState,
    TableId,
    // Events
    ChangeEvent,
    ChangeKind,
    LogRecord,
    RawChangeRecord,
    // Capabilities
    LogConnection,
    LogStream,
    RowSink,
    // Schema history
    ColumnDefinition,
    SchemaChangeRecord,
    SchemaHistoryHandle,
    SchemaHistoryStore,
};
pub use fetch::{EventReader, FetchTask, FetchTaskContext};

// =============================================================================
// TIER 2: Production Features
// =============================================================================

// Assignment
pub use common::{HybridSplitAssigner, SnapshotSplitPlanner, SplitAssigner};

// Checkpointing and retries
pub use common::{
    CheckpointBackend, CheckpointStore, MemoryCheckpointStore, RetryConfig, SplitCheckpoint,
};
pub use fetch::{FetchRunner, FetchTaskFactory};

// Observability and configuration
pub use common::{FetchConfig, FetchConfigBuilder, FetchMetrics, FetchMetricsSnapshot};

// Schema persistence
pub use common::{MemorySchemaHistoryBackend, SchemaHistoryBackend};

// =============================================================================
// TIER 3: Advanced Types - Available via `common::` module
// =============================================================================
// EventQueue, QueueProducer, QueueConsumer, QueueSettings, GtidInterval,
// EventDispatcher, HistoryRegistration, ...
