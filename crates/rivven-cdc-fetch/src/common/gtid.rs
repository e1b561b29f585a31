//! GTID set algebra
//!
//! A GTID set maps each source server UUID to an ordered list of inclusive
//! transaction-id intervals. Sets are kept normalised: intervals per source
//! are sorted, and overlapping or adjacent intervals are merged, so two sets
//! describing the same transactions compare equal.
//!
//! The text form is the one MySQL prints for `@@GLOBAL.GTID_EXECUTED`:
//!
//! ```text
//! 3e11fa47-71ca-11e1-9e33-c80aa9429562:1-5:7,4f22...:1-9
//! ```

use crate::common::error::{CdcError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// An inclusive range of transaction ids from one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GtidInterval {
    start: u64,
    end: u64,
}

impl GtidInterval {
    /// Create an interval; `start` must not exceed `end`.
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start > end {
            return Err(CdcError::config(format!(
                "invalid GTID interval {}-{}: start after end",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// First transaction id (inclusive).
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Last transaction id (inclusive).
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Whether `other` lies entirely inside this interval.
    pub fn covers(&self, other: &GtidInterval) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    fn touches(&self, other: &GtidInterval) -> bool {
        // adjacent intervals merge as well
        self.start <= other.end.saturating_add(1) && other.start <= self.end.saturating_add(1)
    }
}

impl fmt::Display for GtidInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// A normalised set of GTID intervals keyed by source UUID.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct GtidSet {
    sources: BTreeMap<String, Vec<GtidInterval>>,
}

impl GtidSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse MySQL's text representation. Empty input yields an empty set.
    pub fn parse(text: &str) -> Result<Self> {
        let mut set = Self::new();
        for segment in text.split(',') {
            let segment: String = segment.chars().filter(|c| !c.is_whitespace()).collect();
            if segment.is_empty() {
                continue;
            }
            let mut parts = segment.split(':');
            let uuid = parts.next().unwrap_or_default();
            if uuid.is_empty() {
                return Err(CdcError::config(format!(
                    "invalid GTID set segment '{}': missing source id",
                    segment
                )));
            }
            let mut saw_interval = false;
            for part in parts {
                let (start, end) = match part.split_once('-') {
                    Some((s, e)) => (parse_txn(s, &segment)?, parse_txn(e, &segment)?),
                    None => {
                        let n = parse_txn(part, &segment)?;
                        (n, n)
                    }
                };
                set.add(uuid, GtidInterval::new(start, end)?);
                saw_interval = true;
            }
            if !saw_interval {
                return Err(CdcError::config(format!(
                    "invalid GTID set segment '{}': no transaction intervals",
                    segment
                )));
            }
        }
        Ok(set)
    }

    /// Add an interval for `source`, merging with existing intervals.
    pub fn add(&mut self, source: &str, interval: GtidInterval) {
        let intervals = self.sources.entry(source.to_ascii_lowercase()).or_default();
        intervals.push(interval);
        normalize(intervals);
    }

    /// Builder-style [`add`](Self::add) for literals in tests and fixtures.
    pub fn with_interval(mut self, source: &str, start: u64, end: u64) -> Result<Self> {
        self.add(source, GtidInterval::new(start, end)?);
        Ok(self)
    }

    /// True when no transaction is in the set.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Source UUIDs in the set, in sorted order.
    pub fn source_ids(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    /// Normalised intervals for one source (empty when unknown).
    pub fn intervals(&self, source: &str) -> &[GtidInterval] {
        self.sources
            .get(&source.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether a single transaction is in the set.
    pub fn contains(&self, source: &str, txn: u64) -> bool {
        self.intervals(source)
            .iter()
            .any(|i| i.start <= txn && txn <= i.end)
    }

    /// Whether every interval of `self` is covered by an interval of `other`.
    pub fn is_contained_within(&self, other: &GtidSet) -> bool {
        self.sources.iter().all(|(source, intervals)| {
            let theirs = other.intervals(source);
            intervals
                .iter()
                .all(|mine| theirs.iter().any(|t| t.covers(mine)))
        })
    }

    /// Set union.
    pub fn union(&self, other: &GtidSet) -> GtidSet {
        let mut result = self.clone();
        for (source, intervals) in &other.sources {
            let entry = result.sources.entry(source.clone()).or_default();
            entry.extend(intervals.iter().copied());
            normalize(entry);
        }
        result
    }

    /// Set difference: transactions in `self` that are not in `other`.
    pub fn subtract(&self, other: &GtidSet) -> GtidSet {
        let mut result = GtidSet::new();
        for (source, intervals) in &self.sources {
            let removed = other.intervals(source);
            let mut remaining = Vec::new();
            for interval in intervals {
                remaining.extend(subtract_interval(*interval, removed));
            }
            if !remaining.is_empty() {
                result.sources.insert(source.clone(), remaining);
            }
        }
        result
    }

    /// Adjust a restored (checkpointed) set against what the server knows.
    ///
    /// For every source the restored set mentions, the server's intervals for
    /// that source are taken up to the restored set's highest transaction id:
    /// intervals ending at or below it are taken whole, an interval straddling
    /// it is clipped to end there. Sources only the server knows are left out,
    /// and sources only the restored set knows are kept unchanged.
    pub fn fix_restored(server: &GtidSet, restored: &GtidSet) -> GtidSet {
        let mut fixed = GtidSet::new();
        for (source, restored_intervals) in &restored.sources {
            let server_intervals = server.intervals(source);
            let max_end = match restored_intervals.last() {
                Some(last) => last.end,
                None => continue,
            };
            if server_intervals.is_empty() {
                fixed
                    .sources
                    .insert(source.clone(), restored_intervals.clone());
                continue;
            }
            let mut absorbed: Vec<GtidInterval> = Vec::new();
            for interval in server_intervals {
                if interval.end <= max_end {
                    absorbed.push(*interval);
                } else if interval.start <= max_end {
                    absorbed.push(GtidInterval {
                        start: interval.start,
                        end: max_end,
                    });
                    break;
                } else {
                    break;
                }
            }
            // Keep anything the client claims that the server never knew,
            // so the containment check still sees it.
            absorbed.extend(restored_intervals.iter().copied());
            normalize(&mut absorbed);
            fixed.sources.insert(source.clone(), absorbed);
        }
        fixed
    }

    /// Total number of transactions in the set, saturating at `u64::MAX`.
    pub fn transaction_count(&self) -> u64 {
        self.sources
            .values()
            .flatten()
            .map(|i| (i.end - i.start).saturating_add(1))
            .fold(0u64, u64::saturating_add)
    }
}

fn parse_txn(value: &str, segment: &str) -> Result<u64> {
    value.parse::<u64>().map_err(|_| {
        CdcError::config(format!(
            "invalid GTID set segment '{}': '{}' is not a transaction id",
            segment, value
        ))
    })
}

fn normalize(intervals: &mut Vec<GtidInterval>) {
    intervals.sort();
    let mut merged: Vec<GtidInterval> = Vec::with_capacity(intervals.len());
    for interval in intervals.drain(..) {
        match merged.last_mut() {
            Some(last) if last.touches(&interval) => {
                last.end = last.end.max(interval.end);
            }
            _ => merged.push(interval),
        }
    }
    *intervals = merged;
}

fn subtract_interval(interval: GtidInterval, removed: &[GtidInterval]) -> Vec<GtidInterval> {
    let mut pieces = vec![interval];
    for r in removed {
        let mut next = Vec::with_capacity(pieces.len() + 1);
        for piece in pieces {
            if r.end < piece.start || r.start > piece.end {
                next.push(piece);
                continue;
            }
            if r.start > piece.start {
                next.push(GtidInterval {
                    start: piece.start,
                    end: r.start - 1,
                });
            }
            if r.end < piece.end {
                next.push(GtidInterval {
                    start: r.end + 1,
                    end: piece.end,
                });
            }
        }
        pieces = next;
    }
    pieces
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (source, intervals) in &self.sources {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            f.write_str(source)?;
            for interval in intervals {
                write!(f, ":{}", interval)?;
            }
        }
        Ok(())
    }
}

impl FromStr for GtidSet {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for GtidSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GtidSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        GtidSet::parse(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const S1: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";
    const S2: &str = "4f22ab58-82db-22f2-af44-d91bb0530673";

    fn set(text: &str) -> GtidSet {
        GtidSet::parse(text).unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        let gtids = set(&format!("{S1}:1-5:7,{S2}:1-9"));
        assert_eq!(gtids.to_string(), format!("{S1}:1-5:7,{S2}:1-9"));
        assert_eq!(gtids.transaction_count(), 15);
        assert!(gtids.contains(S1, 7));
        assert!(!gtids.contains(S1, 6));
    }

    #[test]
    fn test_transaction_count_saturates() {
        let full = set(&format!("{S1}:0-18446744073709551615"));
        assert_eq!(full.transaction_count(), u64::MAX);

        let two_sources = set(&format!("{S1}:1-18446744073709551615,{S2}:1-10"));
        assert_eq!(two_sources.transaction_count(), u64::MAX);
    }

    #[test]
    fn test_parse_tolerates_whitespace_and_case() {
        let gtids = set(&format!(" {}:1-3,\n {S2}:4 ", S1.to_uppercase()));
        assert_eq!(gtids.intervals(S1), &[GtidInterval::new(1, 3).unwrap()]);
        assert!(gtids.contains(S2, 4));
    }

    #[test]
    fn test_parse_empty() {
        assert!(set("").is_empty());
        assert!(set("  \n").is_empty());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(GtidSet::parse(&format!("{S1}:5-1")).is_err());
        assert!(GtidSet::parse(&format!("{S1}:abc")).is_err());
        assert!(GtidSet::parse(S1).is_err());
        assert!(GtidSet::parse(":1-5").is_err());
    }

    #[test]
    fn test_normalization_merges_adjacent_and_overlapping() {
        let gtids = set(&format!("{S1}:1-3:4-6:10-12:11-20"));
        assert_eq!(gtids.to_string(), format!("{S1}:1-6:10-20"));
    }

    #[test]
    fn test_containment() {
        let server = set(&format!("{S1}:1-100,{S2}:1-50"));
        assert!(set(&format!("{S1}:1-100")).is_contained_within(&server));
        assert!(set(&format!("{S1}:5-10,{S2}:50")).is_contained_within(&server));
        assert!(!set(&format!("{S1}:1-101")).is_contained_within(&server));
        assert!(!set("aaaaaaaa-0000-0000-0000-000000000000:1").is_contained_within(&server));
        assert!(GtidSet::new().is_contained_within(&server));
    }

    #[test]
    fn test_subtract() {
        let a = set(&format!("{S1}:1-100"));
        let b = set(&format!("{S1}:1-10:50-60"));
        assert_eq!(a.subtract(&b).to_string(), format!("{S1}:11-49:61-100"));
        assert!(a.subtract(&a).is_empty());
        assert_eq!(a.subtract(&GtidSet::new()), a);
    }

    #[test]
    fn test_union() {
        let a = set(&format!("{S1}:1-5"));
        let b = set(&format!("{S1}:6-9,{S2}:3"));
        assert_eq!(a.union(&b).to_string(), format!("{S1}:1-9,{S2}:3"));
    }

    #[test]
    fn test_fix_restored_clips_straddling_interval() {
        let server = set(&format!("{S1}:1-100"));
        let fixed = GtidSet::fix_restored(&server, &set(&format!("{S1}:1-5")));
        assert_eq!(fixed.to_string(), format!("{S1}:1-5"));
    }

    #[test]
    fn test_fix_restored_absorbs_server_gaps_below_client_max() {
        // the client lost track of 20-29 across a server log rotation
        let server = set(&format!("{S1}:1-10:20-100"));
        let restored = set(&format!("{S1}:1-10:30-40"));
        let fixed = GtidSet::fix_restored(&server, &restored);
        assert_eq!(fixed.to_string(), format!("{S1}:1-10:20-40"));
    }

    #[test]
    fn test_fix_restored_ignores_server_only_sources() {
        let server = set(&format!("{S1}:1-100,{S2}:1-50"));
        let fixed = GtidSet::fix_restored(&server, &set(&format!("{S1}:1-60")));
        assert_eq!(fixed.to_string(), format!("{S1}:1-60"));
    }

    #[test]
    fn test_fix_restored_keeps_client_only_sources() {
        let server = set(&format!("{S1}:1-100"));
        let restored = set(&format!("{S1}:1-60,{S2}:1-5"));
        let fixed = GtidSet::fix_restored(&server, &restored);
        assert!(!fixed.is_contained_within(&server));
    }

    #[test]
    fn test_serde_as_string() {
        let gtids = set(&format!("{S1}:1-5"));
        let json = serde_json::to_string(&gtids).unwrap();
        assert_eq!(json, format!("\"{S1}:1-5\""));
        let back: GtidSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, gtids);
    }

    fn arb_set() -> impl Strategy<Value = GtidSet> {
        prop::collection::vec((0usize..2, 1u64..200, 0u64..20), 0..8).prop_map(|entries| {
            let mut set = GtidSet::new();
            for (source, start, len) in entries {
                let uuid = if source == 0 { S1 } else { S2 };
                set.add(uuid, GtidInterval::new(start, start + len).unwrap());
            }
            set
        })
    }

    proptest! {
        #[test]
        fn prop_display_parse_roundtrip(a in arb_set()) {
            prop_assert_eq!(set(&a.to_string()), a);
        }

        #[test]
        fn prop_subtract_is_disjoint_and_contained(a in arb_set(), b in arb_set()) {
            let diff = a.subtract(&b);
            prop_assert!(diff.is_contained_within(&a));
            prop_assert!(diff.subtract(&b) == diff);
        }

        #[test]
        fn prop_union_contains_both(a in arb_set(), b in arb_set()) {
            let u = a.union(&b);
            prop_assert!(a.is_contained_within(&u));
            prop_assert!(b.is_contained_within(&u));
        }

        #[test]
        fn prop_subtract_then_union_restores(a in arb_set(), b in arb_set()) {
            let restored = a.subtract(&b).union(&a.intersection_for_test(&b));
            prop_assert_eq!(restored, a);
        }
    }

    impl GtidSet {
        fn intersection_for_test(&self, other: &GtidSet) -> GtidSet {
            self.subtract(&self.subtract(other))
        }
    }
}
