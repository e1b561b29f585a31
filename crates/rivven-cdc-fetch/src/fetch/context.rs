//! Fetch task context
//!
//! One context reads one split. It owns its log connection, its queue and
//! the producer task feeding the queue; only the schema history handle is
//! passed in from outside.
//!
//! ```text
//!  configure(split)
//!    1. register schema history for the split's tables
//!    2. starting offset: initial (snapshot) | split.starting_offset
//!    3. reconcile against the server (fatal when not resumable)
//!    4. size and build the event queue
//!    5. reset listeners, bind the dispatcher, open the stream
//!  read()  -> EventReader        (once)
//!  close()                       (idempotent)
//! ```

use crate::common::{
    CdcError, EventDispatcher, EventQueue, FetchConfig, FetchMetrics, LogConnection, Offset,
    PositionReconciler, QueueCloser, QueueConsumer, QueueProducer, QueueSettings, Result,
    SchemaChangeRecord, SchemaHistoryBackend, SchemaHistoryHandle, Split, SplitLifecycle,
    SplitState,
};
use crate::fetch::incremental::IncrementalProducer;
use crate::fetch::reader::{EventReader, ReadMode, ReaderParts};
use crate::fetch::snapshot::{SnapshotNormalizer, SnapshotProducer};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The surface the orchestration layer drives.
#[async_trait]
pub trait FetchTask: Send {
    /// Prepare to read `split`. Errors of class `Configuration` are final.
    async fn configure(&mut self, split: Split) -> Result<()>;

    /// Start reading. May be called once per context.
    fn read(&mut self) -> Result<EventReader>;

    /// Position of the last event handed out (or the starting offset).
    fn current_offset(&self) -> Offset;

    /// Release the connection and stop the producer. Never fails.
    async fn close(&mut self);
}

enum ProducerPlan {
    Snapshot(SnapshotProducer),
    Incremental(IncrementalProducer),
}

struct Prepared {
    plan: ProducerPlan,
    start: Offset,
    mode: ReadMode,
}

/// Context for reading one split.
pub struct FetchTaskContext {
    config: FetchConfig,
    connection: Arc<dyn LogConnection>,
    history: SchemaHistoryHandle,
    history_backend: Option<Arc<dyn SchemaHistoryBackend>>,
    metrics: Arc<FetchMetrics>,

    split: Option<Split>,
    lifecycle: Option<Arc<Mutex<SplitLifecycle>>>,
    current_offset: Arc<Mutex<Offset>>,

    plan: Option<ProducerPlan>,
    mode: Option<ReadMode>,
    producer: Option<QueueProducer>,
    consumer: Option<QueueConsumer>,
    closer: Option<QueueCloser>,
    producer_task: Option<JoinHandle<()>>,
    read_started: bool,
    connection_closed: bool,
}

impl FetchTaskContext {
    pub fn new(
        config: FetchConfig,
        connection: Arc<dyn LogConnection>,
        history: SchemaHistoryHandle,
    ) -> Self {
        let metrics = Arc::new(FetchMetrics::new(config.connector_name.clone()));
        Self {
            config,
            connection,
            history,
            history_backend: None,
            metrics,
            split: None,
            lifecycle: None,
            current_offset: Arc::new(Mutex::new(Offset::initial())),
            plan: None,
            mode: None,
            producer: None,
            consumer: None,
            closer: None,
            producer_task: None,
            read_started: false,
            connection_closed: false,
        }
    }

    /// Persisted schema records, consulted for incremental splits.
    pub fn with_history_backend(mut self, backend: Arc<dyn SchemaHistoryBackend>) -> Self {
        self.history_backend = Some(backend);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<FetchMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    pub fn split(&self) -> Option<&Split> {
        self.split.as_ref()
    }

    /// Lifecycle state of the configured split.
    pub fn state(&self) -> Option<SplitState> {
        self.lifecycle.as_ref().map(|l| l.lock().state())
    }

    pub fn history(&self) -> &SchemaHistoryHandle {
        &self.history
    }

    pub fn metrics(&self) -> &Arc<FetchMetrics> {
        &self.metrics
    }
}

/// The parts of a context needed to bind a split.
struct Binder<'a> {
    config: &'a FetchConfig,
    connection: &'a Arc<dyn LogConnection>,
    history: &'a SchemaHistoryHandle,
    history_backend: Option<&'a Arc<dyn SchemaHistoryBackend>>,
    metrics: &'a Arc<FetchMetrics>,
}

impl Binder<'_> {
    async fn prepare(&self, split: &Split) -> Result<Prepared> {
        let dispatcher = EventDispatcher::new(self.history.clone(), split.table_ids());
        match split {
            Split::Snapshot(s) => {
                let schema = self.connection.query_table_schema(&s.table_id).await?;
                if schema.column(&s.key_column).is_none() {
                    return Err(CdcError::schema(format!(
                        "chunk key {} is not a column of {}",
                        s.key_column, s.table_id
                    )));
                }
                let mut registration = self.history.begin_registration();
                registration.register(schema.clone())?;
                registration.commit();

                let start = Offset::initial();
                PositionReconciler::ensure_resumable(&start, self.connection.as_ref()).await?;
                self.connection.reset_listeners().await?;

                let mode = if self.config.exactly_once {
                    ReadMode::Normalize(SnapshotNormalizer::new(s.key_column.clone()))
                } else {
                    ReadMode::Passthrough
                };
                let producer = SnapshotProducer {
                    split: s.clone(),
                    schema,
                    connection: self.connection.clone(),
                    dispatcher,
                    exactly_once: self.config.exactly_once,
                    metrics: self.metrics.clone(),
                };
                Ok(Prepared {
                    plan: ProducerPlan::Snapshot(producer),
                    start,
                    mode,
                })
            }
            Split::Incremental(s) => {
                let start = s.starting_offset.clone();
                let mut registration = self.history.begin_registration();
                for table_id in &s.table_ids {
                    if let Some(blob) = s.history_refs.get(table_id) {
                        registration.register_blob(table_id, blob)?;
                        continue;
                    }
                    if let Some(backend) = &self.history_backend {
                        if let Some(blob) = backend.load(table_id).await? {
                            registration.register_blob(table_id, &blob)?;
                            continue;
                        }
                    }
                    let schema = self.live_schema(table_id, &start).await?;
                    if let Some(backend) = &self.history_backend {
                        backend.save(table_id, schema.to_blob()?).await?;
                    }
                    registration.register(schema)?;
                }
                let registered = registration.commit();
                debug!("Registered {} schema records for split {}", registered, s.split_id());

                PositionReconciler::ensure_resumable(&start, self.connection.as_ref()).await?;
                if let Some(end) = &s.ending_offset {
                    if !start.is_initial() && !end.same_encoding(&start) {
                        return Err(CdcError::config(format!(
                            "ending offset {} is a {} offset, starting offset {} is {}",
                            end,
                            end.encoding(),
                            start,
                            start.encoding()
                        )));
                    }
                }

                self.connection.reset_listeners().await?;
                let stream = self.connection.open_stream(&start).await?;
                let producer = IncrementalProducer {
                    split_id: s.split_id(),
                    stream,
                    ending_offset: s.ending_offset.clone(),
                    finished_snapshot_splits: s.finished_snapshot_splits.clone(),
                    dispatcher,
                    metrics: self.metrics.clone(),
                };
                Ok(Prepared {
                    plan: ProducerPlan::Incremental(producer),
                    start,
                    mode: ReadMode::Passthrough,
                })
            }
        }
    }

    /// Current table layout, taken to apply from `start` onward.
    async fn live_schema(
        &self,
        table_id: &crate::common::TableId,
        start: &Offset,
    ) -> Result<SchemaChangeRecord> {
        let mut schema = self.connection.query_table_schema(table_id).await?;
        if !start.reached(&schema.position) {
            schema.position = start.clone();
        }
        Ok(schema)
    }
}

#[async_trait]
impl FetchTask for FetchTaskContext {
    async fn configure(&mut self, split: Split) -> Result<()> {
        if self.split.is_some() {
            return Err(CdcError::invalid_state(
                "fetch context is already configured; build a new one per split",
            ));
        }
        if self.connection_closed {
            return Err(CdcError::invalid_state("fetch context is closed"));
        }

        let split_id = split.split_id();
        let lifecycle = Arc::new(Mutex::new(SplitLifecycle::new(split_id.clone())));
        self.lifecycle = Some(lifecycle.clone());
        self.split = Some(split.clone());
        self.metrics.record_split_started(split.kind());

        let binder = Binder {
            config: &self.config,
            connection: &self.connection,
            history: &self.history,
            history_backend: self.history_backend.as_ref(),
            metrics: &self.metrics,
        };
        let prepared = match binder.prepare(&split).await {
            Ok(prepared) => prepared,
            Err(e) => {
                if let Err(t) = lifecycle.lock().transition(SplitState::Failed) {
                    debug!("Split {} lifecycle: {}", split_id, t);
                }
                if matches!(e, CdcError::OffsetNotAvailable { .. }) {
                    self.metrics.record_unresumable_offset();
                }
                self.metrics.record_split_failed(e.error_code());
                warn!("Failed to configure split {}: {}", split_id, e);
                return Err(e);
            }
        };

        let settings = QueueSettings::for_split(&self.config, &split);
        let (producer, consumer) = EventQueue::with_metrics(settings, self.metrics.clone());
        self.closer = Some(producer.closer());
        self.producer = Some(producer);
        self.consumer = Some(consumer);

        *self.current_offset.lock() = prepared.start.clone();
        self.plan = Some(prepared.plan);
        self.mode = Some(prepared.mode);
        lifecycle.lock().transition(SplitState::Opened)?;

        info!(
            "Configured {} split {} for connector {} from {}",
            split.kind(),
            split_id,
            self.config.connector_name,
            prepared.start
        );
        Ok(())
    }

    fn read(&mut self) -> Result<EventReader> {
        if self.read_started {
            return Err(CdcError::invalid_state(
                "read already started; build a new context to retry",
            ));
        }
        if self.connection_closed {
            return Err(CdcError::invalid_state("fetch context is closed"));
        }
        let (Some(split), Some(lifecycle)) = (self.split.as_ref(), self.lifecycle.clone()) else {
            return Err(CdcError::invalid_state("fetch context is not configured"));
        };
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| CdcError::invalid_state("reading a split requires a tokio runtime"))?;
        let (Some(plan), Some(mode), Some(producer), Some(consumer)) = (
            self.plan.take(),
            self.mode.take(),
            self.producer.take(),
            self.consumer.take(),
        ) else {
            return Err(CdcError::invalid_state(format!(
                "split {} was not configured successfully",
                split.split_id()
            )));
        };

        lifecycle.lock().transition(SplitState::Reading)?;
        self.read_started = true;

        let split_id = split.split_id();
        let task_split_id = split_id.clone();
        self.producer_task = Some(handle.spawn(async move {
            let result = match plan {
                ProducerPlan::Snapshot(p) => p.run(&producer).await,
                ProducerPlan::Incremental(p) => p.run(&producer).await,
            };
            match result {
                Ok(()) => producer.finish(),
                Err(CdcError::QueueClosed) => {
                    debug!("Producer for split {} stopped by close", task_split_id)
                }
                Err(e) => producer.fail(e),
            }
        }));

        Ok(EventReader::new(ReaderParts {
            split_id,
            split_kind: split.kind(),
            consumer,
            mode,
            max_batch_size: self.config.max_batch_size,
            current_offset: self.current_offset.clone(),
            lifecycle,
            metrics: self.metrics.clone(),
        }))
    }

    fn current_offset(&self) -> Offset {
        self.current_offset.lock().clone()
    }

    async fn close(&mut self) {
        if let Some(closer) = &self.closer {
            closer.close();
        }
        if let Some(task) = self.producer_task.take() {
            task.abort();
        }
        if self.connection_closed {
            return;
        }
        self.connection_closed = true;
        let split = self
            .split
            .as_ref()
            .map(|s| s.split_id().to_string())
            .unwrap_or_else(|| "<unconfigured>".to_string());
        match self.connection.close().await {
            Ok(()) => debug!("Closed log connection for split {}", split),
            Err(e) => warn!("Error closing log connection for split {}: {}", split, e),
        }
    }
}

impl Drop for FetchTaskContext {
    fn drop(&mut self) {
        if let Some(task) = self.producer_task.take() {
            task.abort();
        }
        if let Some(closer) = &self.closer {
            closer.close();
        }
        if !self.connection_closed && self.split.is_some() {
            debug!("Fetch context dropped without close()");
        }
    }
}
