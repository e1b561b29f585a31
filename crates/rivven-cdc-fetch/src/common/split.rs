//! Split model
//!
//! A table is read as a set of bounded [`SnapshotSplit`]s followed by
//! [`IncrementalSplit`]s that stream the change log. Splits are values:
//! recovery creates a new split carrying an updated starting offset instead
//! of mutating the old one.

use crate::common::error::{CdcError, Result};
use crate::common::offset::Offset;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Fully qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableId {
    pub database: String,
    pub table: String,
}

impl TableId {
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

impl FromStr for TableId {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('.') {
            Some((db, table)) if !db.is_empty() && !table.is_empty() => Ok(Self::new(db, table)),
            _ => Err(CdcError::config(format!(
                "invalid table id '{}': expected database.table",
                s
            ))),
        }
    }
}

// String form so table ids can key JSON maps.
impl Serialize for TableId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TableId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Compare two chunk-key values.
///
/// Numbers compare numerically, strings lexicographically; anything else is
/// incomparable.
pub fn compare_keys(a: &serde_json::Value, b: &serde_json::Value) -> Option<Ordering> {
    use serde_json::Value;
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Chunk-key bounds of a snapshot split: low inclusive, high exclusive.
/// `None` means unbounded on that side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyRange {
    pub low: Option<serde_json::Value>,
    pub high: Option<serde_json::Value>,
}

impl KeyRange {
    pub fn new(low: Option<serde_json::Value>, high: Option<serde_json::Value>) -> Self {
        Self { low, high }
    }

    /// Range covering the whole table.
    pub fn full() -> Self {
        Self::default()
    }

    /// Whether `key` falls inside the range. Incomparable keys are outside.
    pub fn contains(&self, key: &serde_json::Value) -> bool {
        let above_low = match &self.low {
            None => true,
            Some(low) => matches!(
                compare_keys(key, low),
                Some(Ordering::Greater) | Some(Ordering::Equal)
            ),
        };
        let below_high = match &self.high {
            None => true,
            Some(high) => matches!(compare_keys(key, high), Some(Ordering::Less)),
        };
        above_low && below_high
    }
}

/// Split identity: `(table scope, split index)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SplitId {
    pub scope: String,
    pub index: u32,
}

impl SplitId {
    pub fn new(scope: impl Into<String>, index: u32) -> Self {
        Self {
            scope: scope.into(),
            index,
        }
    }
}

impl fmt::Display for SplitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope, self.index)
    }
}

/// A bounded read of one table's rows within a key range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSplit {
    pub table_id: TableId,
    /// Column the table is chunked on
    pub key_column: String,
    pub key_range: KeyRange,
    pub split_index: u32,
}

impl SnapshotSplit {
    pub fn new(
        table_id: TableId,
        key_column: impl Into<String>,
        key_range: KeyRange,
        split_index: u32,
    ) -> Self {
        Self {
            table_id,
            key_column: key_column.into(),
            key_range,
            split_index,
        }
    }

    pub fn split_id(&self) -> SplitId {
        SplitId::new(self.table_id.to_string(), self.split_index)
    }
}

/// A snapshot split that has handed off, with the offset its rows are
/// current as of.
///
/// Changes to keys in `key_range` at or before `watermark` are already in
/// the snapshot output and are not streamed again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishedSnapshotSplit {
    pub table_id: TableId,
    pub key_column: String,
    pub key_range: KeyRange,
    pub watermark: Offset,
}

impl FinishedSnapshotSplit {
    pub fn new(split: SnapshotSplit, watermark: Offset) -> Self {
        Self {
            table_id: split.table_id,
            key_column: split.key_column,
            key_range: split.key_range,
            watermark,
        }
    }

    /// Whether a change to `key` of `table_id` falls in this split.
    pub fn covers(&self, table_id: &TableId, key: &serde_json::Value) -> bool {
        &self.table_id == table_id && self.key_range.contains(key)
    }

    /// Whether a change at `position` is newer than the snapshot output.
    /// Incomparable positions count as newer.
    pub fn is_past_watermark(&self, position: &Offset) -> bool {
        !matches!(
            position.partial_cmp(&self.watermark),
            Some(Ordering::Less | Ordering::Equal)
        )
    }
}

/// Scope name shared by all incremental splits.
pub const INCREMENTAL_SCOPE: &str = "incremental";

/// A streaming read of the change log for a set of tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncrementalSplit {
    pub split_index: u32,
    pub table_ids: Vec<TableId>,
    pub starting_offset: Offset,
    /// `None` streams until cancelled.
    #[serde(default)]
    pub ending_offset: Option<Offset>,
    /// Serialized schema records to replay before reading, per table
    #[serde(default)]
    pub history_refs: HashMap<TableId, Vec<u8>>,
    /// Snapshot splits whose changes up to their watermark are not re-sent
    #[serde(default)]
    pub finished_snapshot_splits: Vec<FinishedSnapshotSplit>,
}

impl IncrementalSplit {
    /// Unbounded split with no recorded schema history.
    pub fn new(split_index: u32, table_ids: Vec<TableId>, starting_offset: Offset) -> Self {
        Self {
            split_index,
            table_ids,
            starting_offset,
            ending_offset: None,
            history_refs: HashMap::new(),
            finished_snapshot_splits: Vec::new(),
        }
    }

    pub fn with_ending_offset(mut self, ending_offset: Offset) -> Self {
        self.ending_offset = Some(ending_offset);
        self
    }

    pub fn with_history_ref(mut self, table_id: TableId, record: Vec<u8>) -> Self {
        self.history_refs.insert(table_id, record);
        self
    }

    pub fn with_finished_snapshot_split(mut self, finished: FinishedSnapshotSplit) -> Self {
        self.finished_snapshot_splits.push(finished);
        self
    }

    pub fn split_id(&self) -> SplitId {
        SplitId::new(INCREMENTAL_SCOPE, self.split_index)
    }

    pub fn is_bounded(&self) -> bool {
        self.ending_offset.is_some()
    }

    /// Same split resumed from `offset`.
    pub fn with_starting_offset(&self, offset: Offset) -> Self {
        Self {
            starting_offset: offset,
            ..self.clone()
        }
    }

    /// Unbounded split recovered from a stored checkpoint.
    pub fn from_checkpoint(checkpoint: &crate::common::checkpoint::SplitCheckpoint) -> Self {
        Self::new(
            checkpoint.split_id.index,
            checkpoint.table_ids.clone(),
            checkpoint.offset.clone(),
        )
    }
}

/// A unit of work assigned to a fetch task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Split {
    Snapshot(SnapshotSplit),
    Incremental(IncrementalSplit),
}

impl Split {
    pub fn split_id(&self) -> SplitId {
        match self {
            Self::Snapshot(s) => s.split_id(),
            Self::Incremental(s) => s.split_id(),
        }
    }

    pub fn table_ids(&self) -> Vec<TableId> {
        match self {
            Self::Snapshot(s) => vec![s.table_id.clone()],
            Self::Incremental(s) => s.table_ids.clone(),
        }
    }

    pub fn is_snapshot(&self) -> bool {
        matches!(self, Self::Snapshot(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Snapshot(_) => "snapshot",
            Self::Incremental(_) => "incremental",
        }
    }
}

impl From<SnapshotSplit> for Split {
    fn from(split: SnapshotSplit) -> Self {
        Self::Snapshot(split)
    }
}

impl From<IncrementalSplit> for Split {
    fn from(split: IncrementalSplit) -> Self {
        Self::Incremental(split)
    }
}

/// Reported when a split finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitCompletion {
    pub split_id: SplitId,
    /// Where streaming takes over from a snapshot split (high watermark with
    /// exactly-once, low otherwise), or the final offset of a bounded
    /// incremental split.
    pub final_offset: Option<Offset>,
}

/// Per-split lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitState {
    Assigned,
    Opened,
    Reading,
    Completed,
    Failed,
}

impl SplitState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `self -> next` is a legal move.
    pub fn can_transition_to(&self, next: SplitState) -> bool {
        use SplitState::*;
        matches!(
            (self, next),
            (Assigned, Opened)
                | (Opened, Reading)
                | (Reading, Completed)
                | (Reading, Failed)
                | (Assigned, Failed)
                | (Opened, Failed)
        )
    }
}

impl fmt::Display for SplitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Assigned => "assigned",
            Self::Opened => "opened",
            Self::Reading => "reading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Tracks the state of one split and when it last changed.
#[derive(Debug, Clone)]
pub struct SplitLifecycle {
    split_id: SplitId,
    state: SplitState,
    updated_at: DateTime<Utc>,
}

impl SplitLifecycle {
    pub fn new(split_id: SplitId) -> Self {
        Self {
            split_id,
            state: SplitState::Assigned,
            updated_at: Utc::now(),
        }
    }

    pub fn split_id(&self) -> &SplitId {
        &self.split_id
    }

    pub fn state(&self) -> SplitState {
        self.state
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn transition(&mut self, next: SplitState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(CdcError::invalid_state(format!(
                "split {} cannot move from {} to {}",
                self.split_id, self.state, next
            )));
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}
