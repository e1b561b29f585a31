//! Event queue between the log reader and the row emitter
//!
//! Single producer, single consumer, FIFO. A bounded queue makes the
//! producer wait for space; it never drops a record. An unbounded queue is
//! used for snapshot splits read with exactly-once delivery, where every
//! event up to the high watermark has to be held until the cut-over.
//!
//! ```text
//!  producer task                    consumer (read loop)
//!  ─────────────                    ───────────────────
//!  push(record) ──► [ VecDeque ] ──► poll() -> batch
//!       ▲   waits while full             waits up to poll_interval
//!       └──────── not_full ◄──────────── drain
//! ```
//!
//! Closing either half wakes both sides. A producer error passed to
//! [`QueueProducer::fail`] reaches the consumer after the records that were
//! already buffered.

use crate::common::config::FetchConfig;
use crate::common::error::{CdcError, Result};
use crate::common::event::ChangeEvent;
use crate::common::metrics::FetchMetrics;
use crate::common::offset::Offset;
use crate::common::split::Split;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

/// Capacity policy of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueCapacity {
    Bounded(usize),
    /// Limited only by memory
    Unbounded,
}

impl QueueCapacity {
    /// Snapshot splits with exactly-once delivery get an unbounded queue;
    /// everything else is bounded by `max_queue_size`.
    pub fn for_split(split: &Split, exactly_once: bool, max_queue_size: usize) -> Self {
        match split {
            Split::Snapshot(_) if exactly_once => Self::Unbounded,
            _ => Self::Bounded(max_queue_size),
        }
    }

    pub fn limit(&self) -> Option<usize> {
        match self {
            Self::Bounded(n) => Some(*n),
            Self::Unbounded => None,
        }
    }
}

/// Sizing and latency limits of one queue.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub capacity: QueueCapacity,
    pub max_batch_size: usize,
    /// Byte limit for bounded queues (0 = none). Ignored when unbounded.
    pub max_bytes: usize,
    pub poll_interval: Duration,
}

impl QueueSettings {
    pub fn new(capacity: QueueCapacity) -> Self {
        Self {
            capacity,
            max_batch_size: 2048,
            max_bytes: 0,
            poll_interval: Duration::from_millis(500),
        }
    }

    /// Settings for `split` under `config`.
    pub fn for_split(config: &FetchConfig, split: &Split) -> Self {
        Self {
            capacity: QueueCapacity::for_split(split, config.exactly_once, config.max_queue_size),
            max_batch_size: config.max_batch_size.max(1),
            max_bytes: config.max_queue_size_in_bytes,
            poll_interval: config.poll_interval(),
        }
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size.max(1);
        self
    }

    pub fn with_max_bytes(mut self, bytes: usize) -> Self {
        self.max_bytes = bytes;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// An entry of the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueRecord {
    Change(ChangeEvent),
    /// Position advance without data (heartbeats, skipped or DDL records)
    Heartbeat(Offset),
    /// Consistent cut-over point of a snapshot split
    Watermark(Offset),
}

impl QueueRecord {
    fn estimated_size(&self) -> usize {
        match self {
            Self::Change(event) => event.estimated_size(),
            Self::Heartbeat(_) | Self::Watermark(_) => std::mem::size_of::<Offset>(),
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    buffer: VecDeque<(QueueRecord, usize)>,
    bytes: usize,
    /// Producer finished; drain then end
    finished: bool,
    /// Closed by either side; nothing more is delivered
    closed: bool,
    error: Option<CdcError>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<QueueState>,
    not_empty: Notify,
    not_full: Notify,
    settings: QueueSettings,
    metrics: Option<Arc<FetchMetrics>>,
}

impl Shared {
    fn has_room(&self, state: &QueueState, size: usize) -> bool {
        match self.settings.capacity {
            QueueCapacity::Unbounded => true,
            QueueCapacity::Bounded(limit) => {
                if state.buffer.len() >= limit {
                    return false;
                }
                // a single oversized record is still admitted into an empty queue
                self.settings.max_bytes == 0
                    || state.buffer.is_empty()
                    || state.bytes + size <= self.settings.max_bytes
            }
        }
    }

    fn report_depth(&self, state: &QueueState) {
        if let Some(metrics) = &self.metrics {
            metrics.set_queue_depth(state.buffer.len(), state.bytes);
        }
    }

    fn close(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.buffer.clear();
            state.bytes = 0;
            self.report_depth(&state);
        }
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }
}

/// Constructor for queue halves.
pub struct EventQueue;

impl EventQueue {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(settings: QueueSettings) -> (QueueProducer, QueueConsumer) {
        Self::build(settings, None)
    }

    pub fn with_metrics(
        settings: QueueSettings,
        metrics: Arc<FetchMetrics>,
    ) -> (QueueProducer, QueueConsumer) {
        Self::build(settings, Some(metrics))
    }

    fn build(
        settings: QueueSettings,
        metrics: Option<Arc<FetchMetrics>>,
    ) -> (QueueProducer, QueueConsumer) {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            settings,
            metrics,
        });
        (
            QueueProducer {
                shared: shared.clone(),
            },
            QueueConsumer { shared },
        )
    }
}

/// Writing half, owned by the log reader.
#[derive(Debug)]
pub struct QueueProducer {
    shared: Arc<Shared>,
}

impl QueueProducer {
    /// Append a record, waiting while the queue is full.
    pub async fn push(&self, record: QueueRecord) -> Result<()> {
        let size = record.estimated_size();
        let mut waited = false;
        loop {
            let notified = self.shared.not_full.notified();
            {
                let mut state = self.shared.state.lock();
                if state.closed || state.finished {
                    return Err(CdcError::QueueClosed);
                }
                if self.shared.has_room(&state, size) {
                    state.buffer.push_back((record, size));
                    state.bytes += size;
                    self.shared.report_depth(&state);
                    drop(state);
                    self.shared.not_empty.notify_waiters();
                    return Ok(());
                }
            }
            if !waited {
                waited = true;
                trace!("Event queue full, producer waiting");
                if let Some(metrics) = &self.shared.metrics {
                    metrics.record_producer_blocked();
                }
            }
            notified.await;
        }
    }

    /// Append a record if there is room right now.
    pub fn try_push(&self, record: QueueRecord) -> Result<std::result::Result<(), QueueRecord>> {
        let size = record.estimated_size();
        let mut state = self.shared.state.lock();
        if state.closed || state.finished {
            return Err(CdcError::QueueClosed);
        }
        if !self.shared.has_room(&state, size) {
            return Ok(Err(record));
        }
        state.buffer.push_back((record, size));
        state.bytes += size;
        self.shared.report_depth(&state);
        drop(state);
        self.shared.not_empty.notify_waiters();
        Ok(Ok(()))
    }

    /// No more records will be pushed; the consumer drains and then ends.
    pub fn finish(&self) {
        self.shared.state.lock().finished = true;
        self.shared.not_empty.notify_waiters();
    }

    /// End the stream with an error, delivered after buffered records.
    pub fn fail(&self, error: CdcError) {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.error = Some(error);
            state.finished = true;
        }
        self.shared.not_empty.notify_waiters();
    }

    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Handle that can close the queue from outside both halves.
    pub fn closer(&self) -> QueueCloser {
        QueueCloser {
            shared: self.shared.clone(),
        }
    }
}

/// Reading half, owned by the row emitter.
#[derive(Debug)]
pub struct QueueConsumer {
    shared: Arc<Shared>,
}

impl QueueConsumer {
    /// Wait up to the poll interval for records.
    ///
    /// Returns `Ok(Some(batch))` with up to `max_batch_size` records (empty
    /// when the interval elapsed without data), `Ok(None)` once the queue is
    /// closed or finished and drained, and `Err` for a producer failure.
    pub async fn poll(&self) -> Result<Option<Vec<QueueRecord>>> {
        let deadline = Instant::now() + self.shared.settings.poll_interval;
        loop {
            let notified = self.shared.not_empty.notified();
            if let Some(result) = self.try_take()? {
                return Ok(result);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Some(Vec::new()));
            }
        }
    }

    /// Wait until at least one record is available or the stream ends.
    pub async fn poll_non_empty(&self) -> Result<Option<Vec<QueueRecord>>> {
        loop {
            match self.poll().await? {
                Some(batch) if batch.is_empty() => continue,
                other => return Ok(other),
            }
        }
    }

    /// `Ok(None)` means nothing to take yet.
    fn try_take(&self) -> Result<Option<Option<Vec<QueueRecord>>>> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Ok(Some(None));
        }
        if !state.buffer.is_empty() {
            let n = state.buffer.len().min(self.shared.settings.max_batch_size);
            let taken: Vec<(QueueRecord, usize)> = state.buffer.drain(..n).collect();
            state.bytes -= taken.iter().map(|(_, size)| size).sum::<usize>();
            let batch = taken.into_iter().map(|(record, _)| record).collect();
            self.shared.report_depth(&state);
            drop(state);
            self.shared.not_full.notify_waiters();
            return Ok(Some(Some(batch)));
        }
        if let Some(error) = state.error.take() {
            return Err(error);
        }
        if state.finished {
            return Ok(Some(None));
        }
        Ok(None)
    }

    pub fn close(&self) {
        self.shared.close();
    }

    /// Closed rather than finished by the producer.
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn buffered_bytes(&self) -> usize {
        self.shared.state.lock().bytes
    }

    pub fn capacity(&self) -> QueueCapacity {
        self.shared.settings.capacity
    }

    pub fn closer(&self) -> QueueCloser {
        QueueCloser {
            shared: self.shared.clone(),
        }
    }
}

/// Closes a queue without owning either half.
#[derive(Debug, Clone)]
pub struct QueueCloser {
    shared: Arc<Shared>,
}

impl QueueCloser {
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }
}
