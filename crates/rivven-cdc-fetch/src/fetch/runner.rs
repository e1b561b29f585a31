//! Drives one split end-to-end into a row sink.
//!
//! Every attempt runs on a fresh [`FetchTask`]. Incremental progress is
//! checkpointed after each delivered batch, and a transient failure restarts
//! the split from the last checkpoint. Configuration and consistency errors
//! are returned as they are.

use crate::common::{
    FetchMetrics, Result, RetryConfig, RowSink, SharedCheckpointBackend, Split, SplitCheckpoint,
    SplitCompletion,
};
use crate::fetch::context::FetchTask;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Builds a fresh task (with its own connection) for each attempt.
#[async_trait]
pub trait FetchTaskFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn FetchTask>>;
}

pub struct FetchRunner {
    factory: Arc<dyn FetchTaskFactory>,
    checkpoints: SharedCheckpointBackend,
    retry: RetryConfig,
    metrics: Arc<FetchMetrics>,
}

impl FetchRunner {
    pub fn new(
        factory: Arc<dyn FetchTaskFactory>,
        checkpoints: SharedCheckpointBackend,
        metrics: Arc<FetchMetrics>,
    ) -> Self {
        Self {
            factory,
            checkpoints,
            retry: RetryConfig::default(),
            metrics,
        }
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Read `split` into `sink` until it completes.
    ///
    /// Returns the completion record of a finite split, or `None` if the
    /// task was closed before the split finished.
    pub async fn run(
        &self,
        split: Split,
        sink: &mut dyn RowSink,
    ) -> Result<Option<SplitCompletion>> {
        let mut split = self.resume(split).await?;
        let mut attempt = 0u32;
        loop {
            let error = match self.attempt(&split, sink).await {
                Ok(completion) => return Ok(completion),
                Err(e) => e,
            };

            let retriable = error.is_retriable()
                && error
                    .retriable_error_type()
                    .is_some_and(|t| self.retry.is_retriable(&t));
            if !retriable || !self.retry.should_retry(attempt) {
                warn!(
                    "Split {} failed after {} retries: {}",
                    split.split_id(),
                    attempt,
                    error
                );
                return Err(error);
            }

            let delay = self.retry.delay_for_attempt(attempt);
            attempt += 1;
            self.metrics.record_retry();
            warn!(
                "Split {} hit a transient error, retry {} in {:?}: {}",
                split.split_id(),
                attempt,
                delay,
                error
            );
            tokio::time::sleep(delay).await;
            split = self.resume(split).await?;
        }
    }

    /// Restart an incremental split from its checkpoint, if one exists.
    async fn resume(&self, split: Split) -> Result<Split> {
        let Split::Incremental(incremental) = &split else {
            return Ok(split);
        };
        match self.checkpoints.load(&incremental.split_id()).await? {
            Some(checkpoint) => {
                info!(
                    "Resuming split {} from checkpoint {}",
                    incremental.split_id(),
                    checkpoint.offset
                );
                Ok(Split::Incremental(checkpoint.apply_to(incremental)))
            }
            None => Ok(split),
        }
    }

    async fn attempt(
        &self,
        split: &Split,
        sink: &mut dyn RowSink,
    ) -> Result<Option<SplitCompletion>> {
        let mut task = self.factory.create().await?;
        let result = self.drive(task.as_mut(), split, sink).await;
        task.close().await;
        result
    }

    async fn drive(
        &self,
        task: &mut dyn FetchTask,
        split: &Split,
        sink: &mut dyn RowSink,
    ) -> Result<Option<SplitCompletion>> {
        task.configure(split.clone()).await?;
        let mut reader = task.read()?;
        let mut checkpointed = task.current_offset();

        while let Some(batch) = reader.next_batch().await? {
            if !batch.is_empty() {
                debug!("Delivering {} events for split {}", batch.len(), split.split_id());
                sink.write(batch).await?;
            }
            let Split::Incremental(incremental) = split else {
                continue;
            };
            let offset = reader.current_offset();
            if offset == checkpointed {
                continue;
            }
            sink.flush().await?;
            self.checkpoints
                .save(&SplitCheckpoint::new(
                    incremental.split_id(),
                    incremental.table_ids.clone(),
                    offset.clone(),
                ))
                .await?;
            self.metrics.record_checkpoint();
            checkpointed = offset;
        }

        sink.flush().await?;
        Ok(reader.completion().cloned())
    }
}
