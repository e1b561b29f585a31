//! Change log positions
//!
//! An [`Offset`] is either a positional coordinate into the server's rotated
//! log files or a GTID set. Offsets are immutable values; advancing a reader
//! produces a new offset.

use crate::common::error::{CdcError, Result};
use crate::common::gtid::GtidSet;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

const GTID_PREFIX: &str = "gtid:";

/// A comparable position in the source's change log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Offset {
    /// Log file name plus byte position within it.
    Binlog { filename: String, position: u64 },
    /// Set of executed transaction intervals.
    Gtid { gtid_set: GtidSet },
}

impl Offset {
    /// The "start now" offset: empty file name, position zero.
    pub fn initial() -> Self {
        Self::Binlog {
            filename: String::new(),
            position: 0,
        }
    }

    /// Positional offset.
    pub fn binlog(filename: impl Into<String>, position: u64) -> Self {
        Self::Binlog {
            filename: filename.into(),
            position,
        }
    }

    /// Transactional offset.
    pub fn gtid(gtid_set: GtidSet) -> Self {
        Self::Gtid { gtid_set }
    }

    /// True for [`Offset::initial`].
    pub fn is_initial(&self) -> bool {
        matches!(self, Self::Binlog { filename, position } if filename.is_empty() && *position == 0)
    }

    /// Whether both offsets use the same encoding.
    pub fn same_encoding(&self, other: &Offset) -> bool {
        matches!(
            (self, other),
            (Self::Binlog { .. }, Self::Binlog { .. }) | (Self::Gtid { .. }, Self::Gtid { .. })
        )
    }

    /// Encoding name, for logs and error messages.
    pub fn encoding(&self) -> &'static str {
        match self {
            Self::Binlog { .. } => "binlog",
            Self::Gtid { .. } => "gtid",
        }
    }

    /// Whether this offset is at or past `bound`.
    ///
    /// Incomparable offsets are never considered past the bound.
    pub fn reached(&self, bound: &Offset) -> bool {
        matches!(
            self.partial_cmp(bound),
            Some(Ordering::Greater) | Some(Ordering::Equal)
        )
    }
}

impl Default for Offset {
    fn default() -> Self {
        Self::initial()
    }
}

impl PartialOrd for Offset {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self == other {
            return Some(Ordering::Equal);
        }
        if self.is_initial() {
            return Some(Ordering::Less);
        }
        if other.is_initial() {
            return Some(Ordering::Greater);
        }
        match (self, other) {
            (
                Self::Binlog {
                    filename: f1,
                    position: p1,
                },
                Self::Binlog {
                    filename: f2,
                    position: p2,
                },
            ) => Some(f1.cmp(f2).then(p1.cmp(p2))),
            (Self::Gtid { gtid_set: a }, Self::Gtid { gtid_set: b }) => {
                if a.is_contained_within(b) {
                    Some(Ordering::Less)
                } else if b.is_contained_within(a) {
                    Some(Ordering::Greater)
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Binlog { filename, position } => write!(f, "{}:{}", filename, position),
            Self::Gtid { gtid_set } => write!(f, "{}{}", GTID_PREFIX, gtid_set),
        }
    }
}

impl FromStr for Offset {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(gtids) = s.strip_prefix(GTID_PREFIX) {
            return Ok(Self::gtid(GtidSet::parse(gtids)?));
        }
        let (filename, position) = s.rsplit_once(':').ok_or_else(|| {
            CdcError::config(format!("invalid offset '{}': expected file:position", s))
        })?;
        let position = position.parse::<u64>().map_err(|_| {
            CdcError::config(format!("invalid offset '{}': bad position '{}'", s, position))
        })?;
        Ok(Self::binlog(filename, position))
    }
}
