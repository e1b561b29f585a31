//! # Split fetching
//!
//! [`FetchTaskContext`] reads one split: a producer task pulls from the log
//! connection into the event queue, and the [`EventReader`] handed out by
//! [`FetchTask::read`] drains it. [`FetchRunner`] drives a split into a
//! [`RowSink`](crate::common::RowSink) with checkpointing and retries.
//!
//! ```text
//!   LogConnection ──► producer task ──► EventQueue ──► EventReader ──► RowSink
//!   (scan / stream)   (snapshot.rs,                   (reader.rs)     (runner.rs)
//!                      incremental.rs)
//! ```

mod context;
mod incremental;
mod reader;
mod runner;
mod snapshot;

pub use context::{FetchTask, FetchTaskContext};
pub use reader::EventReader;
pub use runner::{FetchRunner, FetchTaskFactory};
