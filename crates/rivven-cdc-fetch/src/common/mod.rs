//! # Common split-fetch types
//!
//! Connector-agnostic building blocks of the fetch core:
//!
//! - [`Offset`] / [`GtidSet`] - log positions, positional or transactional
//! - [`PositionReconciler`] - can the server still serve an offset?
//! - [`Split`] / [`SplitLifecycle`] - units of work and their state machine
//! - [`HybridSplitAssigner`] - snapshot splits first, then one incremental split
//! - [`SchemaHistoryStore`] - column layouts per table over log position
//! - [`EventDispatcher`] - raw log records to typed [`ChangeEvent`]s
//! - [`EventQueue`] - producer/consumer buffer with the exactly-once sizing rule
//! - [`LogConnection`] / [`RowSink`] - capabilities provided by collaborators
//! - [`CheckpointStore`] - persisted incremental split progress
//! - [`FetchMetrics`] / [`RetryConfig`] - observability and retry policy
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     Common Module                        │
//! ├──────────────────────────────────────────────────────────┤
//! │  Offset        ←─── binlog file:pos or GTID set          │
//! │  Reconciler    ←─── retained files, known/purged GTIDs   │
//! │  Split         ←─── Snapshot | Incremental               │
//! │  Assigner      ←─── planning, watermarks, hand-off       │
//! │  SchemaHistory ←─── registration batches, DDL replay     │
//! │  Dispatcher    ←─── positional rows to named columns     │
//! │  EventQueue    ←─── bounded / unbounded, no loss         │
//! │  Checkpoint    ←─── resumable incremental splits         │
//! │  FetchMetrics  ←─── counters, gauges, histograms         │
//! └──────────────────────────────────────────────────────────┘
//! ```

mod assigner;
mod checkpoint;
mod config;
mod connection;
mod dispatcher;
mod error;
mod event;
mod gtid;
mod metrics;
mod offset;
mod queue;
mod reconciler;
mod resilience;
mod schema_history;
mod split;

pub use assigner::*;
pub use checkpoint::*;
pub use config::*;
pub use connection::*;
pub use dispatcher::*;
pub use error::*;
pub use event::*;
pub use gtid::*;
pub use metrics::*;
pub use offset::*;
pub use queue::*;
pub use reconciler::*;
pub use resilience::*;
pub use schema_history::*;
pub use split::*;
