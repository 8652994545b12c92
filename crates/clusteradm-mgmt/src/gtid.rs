//! GTID set arithmetic used for consistency checks.
//!
//! A set maps a source identifier to sorted, non-overlapping inclusive
//! transaction ranges, rendered as `uuid:1-5:7,uuid2:1-3`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::AdminError;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GtidSet {
    sources: BTreeMap<String, Vec<(u64, u64)>>,
}

impl GtidSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Total number of transactions in the set.
    pub fn count(&self) -> u64 {
        self.sources
            .values()
            .flat_map(|r| r.iter())
            .map(|(s, e)| e - s + 1)
            .sum()
    }

    /// Highest transaction number recorded for `source`.
    pub fn last(&self, source: &str) -> u64 {
        self.sources
            .get(source)
            .and_then(|r| r.last())
            .map(|(_, e)| *e)
            .unwrap_or(0)
    }

    /// Adds the inclusive range `start..=end` for `source`.
    pub fn add_range(&mut self, source: &str, start: u64, end: u64) {
        if start == 0 || end < start {
            return;
        }
        let ranges = self.sources.entry(source.to_string()).or_default();
        ranges.push((start, end));
        ranges.sort_unstable();
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
        for (s, e) in ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if s <= last.1.saturating_add(1) => last.1 = last.1.max(e),
                _ => merged.push((s, e)),
            }
        }
        *ranges = merged;
    }

    /// Appends `count` new transactions after the highest one for `source`.
    pub fn append(&mut self, source: &str, count: u64) {
        if count == 0 {
            return;
        }
        let start = self.last(source) + 1;
        self.add_range(source, start, start + count - 1);
    }

    pub fn contains(&self, source: &str, txn: u64) -> bool {
        self.sources
            .get(source)
            .map(|r| r.iter().any(|(s, e)| *s <= txn && txn <= *e))
            .unwrap_or(false)
    }

    pub fn union(&self, other: &GtidSet) -> GtidSet {
        let mut out = self.clone();
        for (source, ranges) in &other.sources {
            for (s, e) in ranges {
                out.add_range(source, *s, *e);
            }
        }
        out
    }

    /// Transactions in `self` that are not in `other`.
    pub fn difference(&self, other: &GtidSet) -> GtidSet {
        let mut out = GtidSet::new();
        for (source, ranges) in &self.sources {
            let theirs = other.sources.get(source).map(Vec::as_slice).unwrap_or(&[]);
            for &(s, e) in ranges {
                let mut cursor = s;
                for &(os, oe) in theirs {
                    if oe < cursor || os > e {
                        continue;
                    }
                    if os > cursor {
                        out.add_range(source, cursor, os - 1);
                    }
                    cursor = oe.saturating_add(1);
                    if cursor > e {
                        break;
                    }
                }
                if cursor <= e {
                    out.add_range(source, cursor, e);
                }
            }
        }
        out
    }

    pub fn is_subset_of(&self, other: &GtidSet) -> bool {
        self.difference(other).is_empty()
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (source, ranges) in &self.sources {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            write!(f, "{}", source)?;
            for (s, e) in ranges {
                if s == e {
                    write!(f, ":{}", s)?;
                } else {
                    write!(f, ":{}-{}", s, e)?;
                }
            }
        }
        Ok(())
    }
}

impl FromStr for GtidSet {
    type Err = AdminError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut set = GtidSet::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let mut fields = part.split(':');
            let source = fields
                .next()
                .filter(|src| !src.is_empty())
                .ok_or_else(|| AdminError::InvalidOption(format!("bad gtid set '{}'", s)))?;
            for interval in fields {
                let bad = || AdminError::InvalidOption(format!("bad gtid interval '{}'", interval));
                let (start, end): (u64, u64) = match interval.split_once('-') {
                    Some((a, b)) => (
                        a.parse().map_err(|_| bad())?,
                        b.parse().map_err(|_| bad())?,
                    ),
                    None => {
                        let n = interval.parse().map_err(|_| bad())?;
                        (n, n)
                    }
                };
                if start == 0 || end < start {
                    return Err(bad());
                }
                set.add_range(source, start, end);
            }
        }
        Ok(set)
    }
}

impl TryFrom<String> for GtidSet {
    type Error = AdminError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<GtidSet> for String {
    fn from(set: GtidSet) -> Self {
        set.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const A: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";
    const B: &str = "8a94f357-aab4-11df-86ab-c80aa9429562";

    #[test]
    fn test_parse_and_render() {
        let set: GtidSet = format!("{}:1-5:7,{}:1-3", A, B).parse().unwrap();
        assert_eq!(set.count(), 9);
        assert_eq!(set.to_string(), format!("{}:1-5:7,{}:1-3", A, B));
    }

    #[test]
    fn test_adjacent_ranges_merge() {
        let mut set = GtidSet::new();
        set.add_range(A, 1, 3);
        set.add_range(A, 4, 6);
        assert_eq!(set.to_string(), format!("{}:1-6", A));
    }

    #[test]
    fn test_append_continues_sequence() {
        let mut set = GtidSet::new();
        set.append(A, 3);
        set.append(A, 2);
        assert_eq!(set.last(A), 5);
        assert!(set.contains(A, 4));
    }

    #[test]
    fn test_errant_transactions_via_difference() {
        let primary: GtidSet = format!("{}:1-10", A).parse().unwrap();
        let replica: GtidSet = format!("{}:1-8,{}:1", A, B).parse().unwrap();
        let errant = replica.difference(&primary);
        assert_eq!(errant.to_string(), format!("{}:1", B));
        assert!(!replica.is_subset_of(&primary));
        let behind: GtidSet = format!("{}:1-8", A).parse().unwrap();
        assert!(behind.is_subset_of(&primary));
    }

    #[test]
    fn test_difference_splits_ranges() {
        let a: GtidSet = format!("{}:1-10", A).parse().unwrap();
        let b: GtidSet = format!("{}:3-4:8", A).parse().unwrap();
        assert_eq!(a.difference(&b).to_string(), format!("{}:1-2:5-7:9-10", A));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("uuid:0".parse::<GtidSet>().is_err());
        assert!("uuid:5-2".parse::<GtidSet>().is_err());
        assert!("uuid:x".parse::<GtidSet>().is_err());
        assert!(":1-2".parse::<GtidSet>().is_err());
        assert!("".parse::<GtidSet>().unwrap().is_empty());
    }

    fn arb_set() -> impl Strategy<Value = GtidSet> {
        prop::collection::vec((0usize..2, 1u64..50, 0u64..10), 0..8).prop_map(|ranges| {
            let mut set = GtidSet::new();
            for (src, start, len) in ranges {
                set.add_range([A, B][src], start, start + len);
            }
            set
        })
    }

    proptest! {
        #[test]
        fn union_contains_both(a in arb_set(), b in arb_set()) {
            let u = a.union(&b);
            prop_assert!(a.is_subset_of(&u));
            prop_assert!(b.is_subset_of(&u));
        }

        #[test]
        fn difference_is_disjoint_from_subtrahend(a in arb_set(), b in arb_set()) {
            let d = a.difference(&b);
            prop_assert!(d.is_subset_of(&a));
            prop_assert_eq!(d.difference(&b), d.clone());
            prop_assert_eq!(d.union(&b).union(&a), a.union(&b));
        }
    }
}
