//! Position reconciliation
//!
//! Before a split starts streaming, its recorded [`Offset`] is checked against
//! what the server still retains. A failure here is never retried: the
//! operator has to reconfigure (typically by forcing a new snapshot).
//!
//! | Offset | Resumable when |
//! |--------|----------------|
//! | `Binlog` with empty file name | always ("start now") |
//! | `Binlog` | the file is still in the server's retained log list |
//! | `Gtid` empty | always ("start from the beginning") |
//! | `Gtid` | the fixed-up set is contained in the server's known set and none of the outstanding transactions were purged |

use crate::common::connection::LogConnection;
use crate::common::error::{CdcError, Result};
use crate::common::gtid::GtidSet;
use crate::common::offset::Offset;
use tracing::{debug, info, warn};

/// Outcome of a resumability check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeCheck {
    Resumable,
    NotResumable(String),
}

impl ResumeCheck {
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Resumable)
    }

    /// Turn a negative result into `CdcError::OffsetNotAvailable`.
    pub fn into_result(self, offset: &Offset) -> Result<()> {
        match self {
            Self::Resumable => Ok(()),
            Self::NotResumable(reason) => Err(CdcError::offset_not_available(offset, reason)),
        }
    }
}

/// The parts of the server's log state a check needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerLogState {
    pub available_log_files: Vec<String>,
    pub known_gtid_set: GtidSet,
    pub purged_gtid_set: GtidSet,
}

/// Decides whether a recorded offset can still be served.
#[derive(Debug, Clone, Copy, Default)]
pub struct PositionReconciler;

impl PositionReconciler {
    /// Check a positional offset against the retained log files.
    pub fn check_binlog_file(filename: &str, available_log_files: &[String]) -> ResumeCheck {
        if filename.is_empty() {
            return ResumeCheck::Resumable;
        }
        info!(
            "Server has the binlog files {:?}, connector requires {}",
            available_log_files, filename
        );
        if available_log_files.iter().any(|f| f == filename) {
            info!("Server has the binlog file {} required by the connector", filename);
            ResumeCheck::Resumable
        } else {
            warn!(
                "Connector requires binlog file {}, but the server only has {:?}",
                filename, available_log_files
            );
            ResumeCheck::NotResumable(format!(
                "binlog file '{}' is no longer retained by the server",
                filename
            ))
        }
    }

    /// Check a GTID offset against the server's known and purged sets.
    pub fn check_gtid_set(requested: &GtidSet, known: &GtidSet, purged: &GtidSet) -> ResumeCheck {
        if requested.is_empty() {
            return ResumeCheck::Resumable;
        }
        if known.is_empty() {
            warn!("Connector used GTIDs previously, but the server has none or they are disabled");
            return ResumeCheck::NotResumable(
                "connector used GTIDs previously, but the server does not know of any GTIDs"
                    .to_string(),
            );
        }

        info!("Merging server GTID set {} with restored GTID set {}", known, requested);
        let fixed = GtidSet::fix_restored(known, requested);
        info!("Merged GTID set is {}", fixed);

        if !fixed.is_contained_within(known) {
            warn!(
                "Connector last known GTIDs are {}, but the server has {}",
                fixed, known
            );
            return ResumeCheck::NotResumable(format!(
                "connector GTID set {} is not contained in the server GTID set {}",
                fixed, known
            ));
        }

        info!(
            "Server GTID set {} contains the GTID set {} required by the connector",
            known, fixed
        );
        let to_replicate = known.subtract(&fixed);
        info!("Server has already purged {} GTIDs", purged);
        let non_purged = to_replicate.subtract(purged);
        debug!(
            "GTID set {} known by the server but not processed yet, available for replication: {}",
            to_replicate, non_purged
        );
        if to_replicate != non_purged {
            warn!("Some of the GTIDs needed to replicate have been already purged");
            return ResumeCheck::NotResumable(format!(
                "GTIDs {} needed to replicate have been purged by the server",
                to_replicate.subtract(&non_purged)
            ));
        }
        ResumeCheck::Resumable
    }

    /// Check an offset against a captured server state.
    pub fn check(offset: &Offset, server: &ServerLogState) -> ResumeCheck {
        match offset {
            Offset::Binlog { filename, .. } => {
                Self::check_binlog_file(filename, &server.available_log_files)
            }
            Offset::Gtid { gtid_set } => {
                Self::check_gtid_set(gtid_set, &server.known_gtid_set, &server.purged_gtid_set)
            }
        }
    }

    /// Fetch the server state needed for `offset` and check it.
    ///
    /// Only connection failures produce `Err`; a negative answer is `Ok(false)`.
    pub async fn is_resumable(offset: &Offset, connection: &dyn LogConnection) -> Result<bool> {
        Ok(Self::check_with(offset, connection).await?.is_resumable())
    }

    /// Like [`is_resumable`](Self::is_resumable) but raises
    /// `CdcError::OffsetNotAvailable` when the offset cannot be served.
    pub async fn ensure_resumable(offset: &Offset, connection: &dyn LogConnection) -> Result<()> {
        Self::check_with(offset, connection).await?.into_result(offset)
    }

    async fn check_with(offset: &Offset, connection: &dyn LogConnection) -> Result<ResumeCheck> {
        match offset {
            Offset::Binlog { filename, .. } => {
                if filename.is_empty() {
                    return Ok(ResumeCheck::Resumable);
                }
                let files = connection.available_log_files().await?;
                Ok(Self::check_binlog_file(filename, &files))
            }
            Offset::Gtid { gtid_set } => {
                if gtid_set.is_empty() {
                    return Ok(ResumeCheck::Resumable);
                }
                let known = connection.known_gtid_set().await?;
                let purged = if known.is_empty() {
                    GtidSet::new()
                } else {
                    connection.purged_gtid_set().await?
                };
                Ok(Self::check_gtid_set(gtid_set, &known, &purged))
            }
        }
    }
}
