//! The consuming side of a fetch task.
//!
//! An [`EventReader`] is handed out once per context by
//! [`FetchTask::read`](crate::fetch::FetchTask::read). It drains the event
//! queue, tracks the current offset and drives the split lifecycle to its
//! terminal state.

use crate::common::{
    CdcError, ChangeEvent, FetchMetrics, Offset, QueueConsumer, QueueRecord, Result,
    SplitCompletion, SplitId, SplitLifecycle, SplitState,
};
use crate::fetch::snapshot::SnapshotNormalizer;
use futures::{Stream, TryStreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What the reader does with change records before emitting them.
#[derive(Debug)]
pub(crate) enum ReadMode {
    /// Emit as they arrive
    Passthrough,
    /// Hold until the watermark, then emit final row images
    Normalize(SnapshotNormalizer),
}

/// Lazy, non-restartable sequence of change events for one split.
pub struct EventReader {
    split_id: SplitId,
    split_kind: &'static str,
    consumer: QueueConsumer,
    mode: ReadMode,
    pending: VecDeque<ChangeEvent>,
    max_batch_size: usize,
    current_offset: Arc<Mutex<Offset>>,
    lifecycle: Arc<Mutex<SplitLifecycle>>,
    metrics: Arc<FetchMetrics>,
    completion: Option<SplitCompletion>,
    watermark: Option<Offset>,
    done: bool,
}

impl std::fmt::Debug for EventReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventReader")
            .field("split_id", &self.split_id)
            .field("pending", &self.pending.len())
            .field("done", &self.done)
            .finish()
    }
}

pub(crate) struct ReaderParts {
    pub split_id: SplitId,
    pub split_kind: &'static str,
    pub consumer: QueueConsumer,
    pub mode: ReadMode,
    pub max_batch_size: usize,
    pub current_offset: Arc<Mutex<Offset>>,
    pub lifecycle: Arc<Mutex<SplitLifecycle>>,
    pub metrics: Arc<FetchMetrics>,
}

impl EventReader {
    pub(crate) fn new(parts: ReaderParts) -> Self {
        Self {
            split_id: parts.split_id,
            split_kind: parts.split_kind,
            consumer: parts.consumer,
            mode: parts.mode,
            pending: VecDeque::new(),
            max_batch_size: parts.max_batch_size.max(1),
            current_offset: parts.current_offset,
            lifecycle: parts.lifecycle,
            metrics: parts.metrics,
            completion: None,
            watermark: None,
            done: false,
        }
    }

    /// Next batch of events.
    ///
    /// An empty batch means the poll interval elapsed without data (the
    /// current offset may still have advanced). `None` ends the sequence,
    /// either because the split completed or the task was closed.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<ChangeEvent>>> {
        loop {
            if !self.pending.is_empty() {
                let n = self.pending.len().min(self.max_batch_size);
                let batch: Vec<ChangeEvent> = self.pending.drain(..n).collect();
                return Ok(Some(self.emit(batch)));
            }
            if self.done {
                return Ok(None);
            }

            let records = match self.consumer.poll().await {
                Ok(Some(records)) => records,
                Ok(None) => {
                    self.done = true;
                    if self.consumer.is_closed() {
                        debug!("Split {} read stopped by close", self.split_id);
                    } else {
                        self.complete()?;
                    }
                    continue;
                }
                Err(e) => {
                    self.done = true;
                    return Err(self.fail(e));
                }
            };

            if records.is_empty() {
                return Ok(Some(Vec::new()));
            }

            let mut out = Vec::new();
            for record in records {
                if let Err(e) = self.absorb(record, &mut out) {
                    self.done = true;
                    self.consumer.close();
                    return Err(self.fail(e));
                }
            }
            if !out.is_empty() {
                return Ok(Some(self.emit(out)));
            }
            if self.pending.is_empty() && matches!(self.mode, ReadMode::Passthrough) {
                // only position advances in this batch
                return Ok(Some(Vec::new()));
            }
        }
    }

    fn absorb(&mut self, record: QueueRecord, out: &mut Vec<ChangeEvent>) -> Result<()> {
        match record {
            QueueRecord::Change(event) => match &mut self.mode {
                ReadMode::Passthrough => {
                    *self.current_offset.lock() = event.source_position.clone();
                    out.push(event);
                }
                ReadMode::Normalize(normalizer) => normalizer.apply(event)?,
            },
            QueueRecord::Heartbeat(position) => {
                self.metrics.record_heartbeat();
                *self.current_offset.lock() = position;
            }
            QueueRecord::Watermark(high) => {
                if let ReadMode::Normalize(normalizer) =
                    std::mem::replace(&mut self.mode, ReadMode::Passthrough)
                {
                    let rows = normalizer.finish(&high);
                    debug!(
                        "Split {} normalised {} rows at watermark {}",
                        self.split_id,
                        rows.len(),
                        high
                    );
                    self.pending.extend(rows);
                }
                *self.current_offset.lock() = high.clone();
                self.watermark = Some(high);
            }
        }
        Ok(())
    }

    fn emit(&self, batch: Vec<ChangeEvent>) -> Vec<ChangeEvent> {
        for event in &batch {
            self.metrics
                .record_event(event.kind, event.estimated_size() as u64);
        }
        self.metrics.record_batch(batch.len());
        batch
    }

    fn complete(&mut self) -> Result<()> {
        if matches!(self.mode, ReadMode::Normalize(_)) {
            // a snapshot producer always ends with a watermark
            let err = CdcError::invalid_state(format!(
                "snapshot split {} ended without a watermark",
                self.split_id
            ));
            return Err(self.fail(err));
        }
        let final_offset = self
            .watermark
            .clone()
            .unwrap_or_else(|| self.current_offset.lock().clone());
        self.lifecycle.lock().transition(SplitState::Completed)?;
        self.metrics.record_split_completed(self.split_kind);
        info!("Split {} completed at {}", self.split_id, final_offset);
        self.completion = Some(SplitCompletion {
            split_id: self.split_id.clone(),
            final_offset: Some(final_offset),
        });
        Ok(())
    }

    fn fail(&self, error: CdcError) -> CdcError {
        if let Err(e) = self.lifecycle.lock().transition(SplitState::Failed) {
            debug!("Split {} lifecycle: {}", self.split_id, e);
        }
        self.metrics.record_split_failed(error.error_code());
        warn!(
            "Split {} failed ({:?}): {}",
            self.split_id,
            error.class(),
            error
        );
        error
    }

    /// Completion record, available once the sequence ended normally.
    pub fn completion(&self) -> Option<&SplitCompletion> {
        self.completion.as_ref()
    }

    pub fn current_offset(&self) -> Offset {
        self.current_offset.lock().clone()
    }

    pub fn split_id(&self) -> &SplitId {
        &self.split_id
    }

    /// Flatten into a stream of events, skipping idle polls.
    pub fn into_stream(self) -> impl Stream<Item = Result<ChangeEvent>> + Send {
        futures::stream::try_unfold(self, |mut reader| async move {
            loop {
                match reader.next_batch().await? {
                    Some(batch) if batch.is_empty() => continue,
                    Some(batch) => return Ok::<_, CdcError>(Some((batch, reader))),
                    None => return Ok(None),
                }
            }
        })
        .map_ok(|batch| futures::stream::iter(batch.into_iter().map(Ok::<_, CdcError>)))
        .try_flatten()
    }
}
