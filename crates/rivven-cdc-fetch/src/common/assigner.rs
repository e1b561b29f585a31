//! Split planning and assignment
//!
//! Tables are first read as snapshot splits (chunked on an integer key), then
//! streamed by one incremental split that starts at the earliest watermark
//! any snapshot split reported. Each finished snapshot split travels with the
//! incremental split so changes its output already holds are not streamed
//! again. The schema record in effect at the starting offset travels as a
//! `history_refs` entry; later DDL is re-read from the stream.

use crate::common::error::{CdcError, Result};
use crate::common::offset::Offset;
use crate::common::schema_history::{SchemaChangeRecord, SchemaHistoryHandle};
use crate::common::split::{
    FinishedSnapshotSplit, IncrementalSplit, KeyRange, SnapshotSplit, Split, SplitCompletion,
    SplitId, TableId,
};
use async_trait::async_trait;
use serde_json::json;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, VecDeque};
use tracing::{debug, info, warn};

/// Chunks an integer key space into snapshot splits.
#[derive(Debug, Clone)]
pub struct SnapshotSplitPlanner {
    chunk_size: i64,
}

impl SnapshotSplitPlanner {
    pub fn new(chunk_size: i64) -> Result<Self> {
        if chunk_size <= 0 {
            return Err(CdcError::config("snapshot chunk size must be positive"));
        }
        Ok(Self { chunk_size })
    }

    /// Plan splits for keys in `[min, max]`.
    ///
    /// The first split is unbounded below and the last unbounded above, so
    /// rows inserted outside the observed range are still covered.
    pub fn plan(
        &self,
        table_id: &TableId,
        key_column: &str,
        min: i64,
        max: i64,
    ) -> Vec<SnapshotSplit> {
        if min > max {
            return vec![SnapshotSplit::new(
                table_id.clone(),
                key_column,
                KeyRange::full(),
                0,
            )];
        }

        let mut bounds = Vec::new();
        let mut next = min.saturating_add(self.chunk_size);
        while next <= max {
            bounds.push(next);
            match next.checked_add(self.chunk_size) {
                Some(n) => next = n,
                None => break,
            }
        }

        let mut splits = Vec::with_capacity(bounds.len() + 1);
        let mut low = None;
        for (index, bound) in bounds.iter().enumerate() {
            splits.push(SnapshotSplit::new(
                table_id.clone(),
                key_column,
                KeyRange::new(low.take(), Some(json!(bound))),
                index as u32,
            ));
            low = Some(json!(bound));
        }
        splits.push(SnapshotSplit::new(
            table_id.clone(),
            key_column,
            KeyRange::new(low, None),
            bounds.len() as u32,
        ));
        debug!("Planned {} snapshot splits for {}", splits.len(), table_id);
        splits
    }
}

/// Enumeration and assignment of splits to fetch tasks.
#[async_trait]
pub trait SplitAssigner: Send {
    /// Next split to hand out, or `None` when nothing is assignable now.
    async fn next_split(&mut self) -> Result<Option<Split>>;

    /// A split finished.
    fn on_split_completed(&mut self, completion: SplitCompletion) -> Result<()>;

    /// A split failed and should be handed out again.
    fn on_split_failed(&mut self, split: Split);

    /// Every split has been assigned and no more will be produced.
    fn is_finished(&self) -> bool;
}

/// Snapshot splits first, then one incremental split.
pub struct HybridSplitAssigner {
    pending: VecDeque<SnapshotSplit>,
    in_flight: HashMap<SplitId, SnapshotSplit>,
    finished: Vec<FinishedSnapshotSplit>,
    tables: BTreeSet<TableId>,
    history: SchemaHistoryHandle,
    incremental_index: u32,
    /// Start used when there is no snapshot phase
    fallback_offset: Offset,
    incremental_assigned: bool,
}

impl HybridSplitAssigner {
    pub fn new(snapshot_splits: Vec<SnapshotSplit>, history: SchemaHistoryHandle) -> Self {
        let tables = snapshot_splits.iter().map(|s| s.table_id.clone()).collect();
        Self {
            pending: snapshot_splits.into(),
            in_flight: HashMap::new(),
            finished: Vec::new(),
            tables,
            history,
            incremental_index: 0,
            fallback_offset: Offset::initial(),
            incremental_assigned: false,
        }
    }

    /// Stream-only assignment for `tables` from `offset`.
    pub fn stream_only(
        tables: Vec<TableId>,
        offset: Offset,
        history: SchemaHistoryHandle,
    ) -> Self {
        let mut assigner = Self::new(Vec::new(), history);
        assigner.tables = tables.into_iter().collect();
        assigner.fallback_offset = offset;
        assigner
    }

    pub fn with_incremental_index(mut self, index: u32) -> Self {
        self.incremental_index = index;
        self
    }

    fn snapshot_phase_done(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }

    /// Earliest reported watermark, or the fallback when none exist.
    fn incremental_start(&self) -> Offset {
        let mut earliest: Option<&Offset> = None;
        for watermark in self.finished.iter().map(|f| &f.watermark) {
            earliest = match earliest {
                None => Some(watermark),
                Some(current) => match watermark.partial_cmp(current) {
                    Some(Ordering::Less) => Some(watermark),
                    Some(_) => Some(current),
                    None => {
                        warn!(
                            "Incomparable snapshot watermarks {} and {}, keeping {}",
                            current, watermark, current
                        );
                        Some(current)
                    }
                },
            };
        }
        earliest.cloned().unwrap_or_else(|| self.fallback_offset.clone())
    }

    /// Schema record in effect at `start`.
    ///
    /// When history only holds records after `start` the earliest one is
    /// taken as the layout at `start`.
    fn schema_at_start(&self, table: &TableId, start: &Offset) -> Option<SchemaChangeRecord> {
        if let Ok(record) = self.history.schema_at(table, start) {
            return Some(record);
        }
        let mut record = self.history.earliest(table)?;
        debug!(
            "No schema for {} at {}, using the one recorded at {}",
            table, start, record.position
        );
        record.position = start.clone();
        Some(record)
    }

    fn build_incremental(&self) -> Result<IncrementalSplit> {
        let tables: Vec<TableId> = self.tables.iter().cloned().collect();
        let start = self.incremental_start();
        let mut split =
            IncrementalSplit::new(self.incremental_index, tables.clone(), start.clone());
        for table in &tables {
            if let Some(record) = self.schema_at_start(table, &start) {
                split = split.with_history_ref(table.clone(), record.to_blob()?);
            }
        }
        for finished in &self.finished {
            split = split.with_finished_snapshot_split(finished.clone());
        }
        Ok(split)
    }
}

#[async_trait]
impl SplitAssigner for HybridSplitAssigner {
    async fn next_split(&mut self) -> Result<Option<Split>> {
        if let Some(split) = self.pending.pop_front() {
            self.in_flight.insert(split.split_id(), split.clone());
            return Ok(Some(Split::Snapshot(split)));
        }
        if self.incremental_assigned || !self.snapshot_phase_done() {
            return Ok(None);
        }
        let split = self.build_incremental()?;
        info!(
            "Snapshot phase finished, streaming {} tables from {}",
            split.table_ids.len(),
            split.starting_offset
        );
        self.incremental_assigned = true;
        Ok(Some(Split::Incremental(split)))
    }

    fn on_split_completed(&mut self, completion: SplitCompletion) -> Result<()> {
        if completion.split_id.scope == crate::common::split::INCREMENTAL_SCOPE {
            return Ok(());
        }
        let Some(split) = self.in_flight.remove(&completion.split_id) else {
            return Err(CdcError::invalid_state(format!(
                "completion for unassigned split {}",
                completion.split_id
            )));
        };
        match completion.final_offset {
            Some(watermark) => self.finished.push(FinishedSnapshotSplit::new(split, watermark)),
            None => warn!(
                "Snapshot split {} completed without a watermark",
                completion.split_id
            ),
        }
        Ok(())
    }

    fn on_split_failed(&mut self, split: Split) {
        match split {
            Split::Snapshot(s) => {
                self.in_flight.remove(&s.split_id());
                self.pending.push_back(s);
            }
            Split::Incremental(_) => {
                self.incremental_assigned = false;
            }
        }
    }

    fn is_finished(&self) -> bool {
        self.incremental_assigned && self.snapshot_phase_done()
    }
}
