//! Sorted interval maps keyed by memory-file offset
//!
//! [`RangeSet`] tracks membership with coalescing; [`RangeMap`] tracks a
//! value per range, splitting on partial removal and merging adjacent
//! ranges holding equal values. All ranges are half-open `[start, end)`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct FileRange {
    pub start: u64,
    pub end: u64,
}

impl FileRange {
    pub fn new(start: u64, end: u64) -> FileRange {
        debug_assert!(start <= end, "malformed range [{:#x}, {:#x})", start, end);
        FileRange { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset < self.end
    }

    pub fn contains_range(&self, other: FileRange) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    pub fn intersect(&self, other: FileRange) -> FileRange {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if start >= end {
            FileRange { start: 0, end: 0 }
        } else {
            FileRange { start, end }
        }
    }

    pub fn overlaps(&self, other: FileRange) -> bool {
        !self.intersect(other).is_empty()
    }
}

impl std::fmt::Display for FileRange {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end)
    }
}

/// Coalescing set of ranges.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct RangeSet {
    ranges: BTreeMap<u64, u64>,
}

impl RangeSet {
    pub fn new() -> RangeSet {
        RangeSet::default()
    }

    /// Inserts `range`, merging with any overlapping or adjacent ranges.
    pub fn insert(&mut self, range: FileRange) {
        if range.is_empty() {
            return;
        }
        let mut start = range.start;
        let mut end = range.end;
        let mut stale = Vec::new();
        for (&s, &e) in self.ranges.range(..=end).rev() {
            if e < start {
                break;
            }
            stale.push(s);
            start = start.min(s);
            end = end.max(e);
        }
        for s in stale {
            self.ranges.remove(&s);
        }
        self.ranges.insert(start, end);
    }

    /// Removes `range`, splitting any partially covered ranges.
    pub fn remove(&mut self, range: FileRange) {
        if range.is_empty() {
            return;
        }
        let mut affected = Vec::new();
        for (&s, &e) in self.ranges.range(..range.end).rev() {
            if e <= range.start {
                break;
            }
            affected.push((s, e));
        }
        for (s, e) in affected {
            self.ranges.remove(&s);
            if s < range.start {
                self.ranges.insert(s, range.start);
            }
            if e > range.end {
                self.ranges.insert(range.end, e);
            }
        }
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.ranges
            .range(..=offset)
            .next_back()
            .map(|(_, &e)| offset < e)
            .unwrap_or(false)
    }

    /// True if every offset of `range` is in the set.
    pub fn contains_range(&self, range: FileRange) -> bool {
        if range.is_empty() {
            return true;
        }
        self.ranges
            .range(..=range.start)
            .next_back()
            .map(|(_, &e)| range.end <= e)
            .unwrap_or(false)
    }

    pub fn intersects(&self, range: FileRange) -> bool {
        !self.intersection(range).is_empty()
    }

    /// Ranges of the set clipped to `range`.
    pub fn intersection(&self, range: FileRange) -> Vec<FileRange> {
        let mut out = Vec::new();
        if range.is_empty() {
            return out;
        }
        for (&s, &e) in self.ranges.range(..range.end) {
            if e <= range.start {
                continue;
            }
            out.push(FileRange::new(s, e).intersect(range));
        }
        out.retain(|r| !r.is_empty());
        out
    }

    /// Lowest-offset sub-range of length `len`, if any range can hold it.
    pub fn first_fit(&self, len: u64) -> Option<FileRange> {
        for (&s, &e) in &self.ranges {
            if e - s >= len {
                return Some(FileRange::new(s, s + len));
            }
        }
        None
    }

    pub fn iter(&self) -> impl Iterator<Item = FileRange> + '_ {
        self.ranges.iter().map(|(&s, &e)| FileRange::new(s, e))
    }

    pub fn total(&self) -> u64 {
        self.ranges.iter().map(|(&s, &e)| e - s).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }
}

/// Interval map with per-range values. Adjacent ranges holding equal values
/// are merged; partial removals split.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct RangeMap<T: Clone + Eq> {
    ranges: BTreeMap<u64, (u64, T)>,
}

impl<T: Clone + Eq> RangeMap<T> {
    pub fn new() -> RangeMap<T> {
        RangeMap {
            ranges: BTreeMap::new(),
        }
    }

    /// Maps `range` to `value`, replacing anything it overlapped.
    pub fn insert(&mut self, range: FileRange, value: T) {
        if range.is_empty() {
            return;
        }
        self.remove(range);
        let mut start = range.start;
        let mut end = range.end;
        let left = self
            .ranges
            .range(..range.start)
            .next_back()
            .and_then(|(&s, (e, v))| (*e == range.start && *v == value).then_some(s));
        if let Some(s) = left {
            start = s;
            self.ranges.remove(&s);
        }
        let right = self
            .ranges
            .get(&range.end)
            .and_then(|(e, v)| (*v == value).then_some(*e));
        if let Some(e) = right {
            end = e;
            self.ranges.remove(&range.end);
        }
        self.ranges.insert(start, (end, value));
    }

    /// Unmaps `range`, splitting partially covered ranges.
    pub fn remove(&mut self, range: FileRange) {
        if range.is_empty() {
            return;
        }
        let mut affected = Vec::new();
        for (&s, (e, _)) in self.ranges.range(..range.end).rev() {
            if *e <= range.start {
                break;
            }
            affected.push(s);
        }
        for s in affected {
            let (e, v) = self.ranges.remove(&s).unwrap();
            if s < range.start {
                self.ranges.insert(s, (range.start, v.clone()));
            }
            if e > range.end {
                self.ranges.insert(range.end, (e, v));
            }
        }
    }

    /// The range and value covering `offset`.
    pub fn get(&self, offset: u64) -> Option<(FileRange, &T)> {
        self.ranges
            .range(..=offset)
            .next_back()
            .and_then(|(&s, (e, v))| {
                if offset < *e {
                    Some((FileRange::new(s, *e), v))
                } else {
                    None
                }
            })
    }

    /// Mapped sub-ranges clipped to `range`, with their values.
    pub fn intersection(&self, range: FileRange) -> Vec<(FileRange, T)> {
        let mut out = Vec::new();
        if range.is_empty() {
            return out;
        }
        for (&s, (e, v)) in self.ranges.range(..range.end) {
            if *e <= range.start {
                continue;
            }
            let clipped = FileRange::new(s, *e).intersect(range);
            if !clipped.is_empty() {
                out.push((clipped, v.clone()));
            }
        }
        out
    }

    pub fn contains_range(&self, range: FileRange) -> bool {
        self.intersection(range).iter().map(|(r, _)| r.len()).sum::<u64>() == range.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (FileRange, &T)> + '_ {
        self.ranges
            .iter()
            .map(|(&s, (e, v))| (FileRange::new(s, *e), v))
    }

    pub fn total(&self) -> u64 {
        self.ranges.iter().map(|(&s, (e, _))| e - s).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(start: u64, end: u64) -> FileRange {
        FileRange::new(start, end)
    }

    fn collect(set: &RangeSet) -> Vec<(u64, u64)> {
        set.iter().map(|fr| (fr.start, fr.end)).collect()
    }

    #[test]
    fn insert_merges_overlap_and_adjacency() {
        let mut set = RangeSet::new();
        set.insert(r(0, 10));
        set.insert(r(20, 30));
        assert_eq!(collect(&set), vec![(0, 10), (20, 30)]);

        set.insert(r(10, 20));
        assert_eq!(collect(&set), vec![(0, 30)]);

        set.insert(r(25, 40));
        assert_eq!(collect(&set), vec![(0, 40)]);
    }

    #[test]
    fn remove_splits() {
        let mut set = RangeSet::new();
        set.insert(r(0, 100));
        set.remove(r(40, 60));
        assert_eq!(collect(&set), vec![(0, 40), (60, 100)]);

        set.remove(r(0, 10));
        set.remove(r(90, 100));
        assert_eq!(collect(&set), vec![(10, 40), (60, 90)]);

        set.remove(r(0, 200));
        assert!(set.is_empty());
    }

    #[test]
    fn contains_and_membership() {
        let mut set = RangeSet::new();
        set.insert(r(10, 20));
        assert!(set.contains(10));
        assert!(set.contains(19));
        assert!(!set.contains(20));
        assert!(!set.contains(9));
        assert!(set.contains_range(r(12, 18)));
        assert!(!set.contains_range(r(12, 21)));
        assert!(set.intersects(r(19, 25)));
        assert!(!set.intersects(r(20, 25)));
    }

    #[test]
    fn first_fit_finds_lowest() {
        let mut set = RangeSet::new();
        set.insert(r(0, 4));
        set.insert(r(8, 24));
        set.insert(r(32, 64));
        assert_eq!(set.first_fit(4), Some(r(0, 4)));
        assert_eq!(set.first_fit(8), Some(r(8, 16)));
        assert_eq!(set.first_fit(32), Some(r(32, 64)));
        assert_eq!(set.first_fit(33), None);
    }

    #[test]
    fn intersection_clips() {
        let mut set = RangeSet::new();
        set.insert(r(0, 10));
        set.insert(r(20, 30));
        assert_eq!(set.intersection(r(5, 25)), vec![r(5, 10), r(20, 25)]);
        assert_eq!(set.intersection(r(10, 20)), Vec::<FileRange>::new());
    }

    #[test]
    fn map_insert_merges_equal_values() {
        let mut map = RangeMap::new();
        map.insert(r(0, 10), 'a');
        map.insert(r(10, 20), 'a');
        assert_eq!(map.iter().count(), 1);
        assert_eq!(map.get(15), Some((r(0, 20), &'a')));

        map.insert(r(20, 30), 'b');
        assert_eq!(map.iter().count(), 2);
    }

    #[test]
    fn map_insert_replaces_overlap() {
        let mut map = RangeMap::new();
        map.insert(r(0, 30), 'a');
        map.insert(r(10, 20), 'b');
        let entries: Vec<_> = map.iter().map(|(fr, v)| (fr, *v)).collect();
        assert_eq!(
            entries,
            vec![(r(0, 10), 'a'), (r(10, 20), 'b'), (r(20, 30), 'a')]
        );
    }

    #[test]
    fn map_remove_splits() {
        let mut map = RangeMap::new();
        map.insert(r(0, 100), 'a');
        map.remove(r(40, 60));
        let entries: Vec<_> = map.iter().map(|(fr, v)| (fr, *v)).collect();
        assert_eq!(entries, vec![(r(0, 40), 'a'), (r(60, 100), 'a')]);
        assert_eq!(map.total(), 80);
    }

    #[test]
    fn map_intersection_carries_values() {
        let mut map = RangeMap::new();
        map.insert(r(0, 10), 'a');
        map.insert(r(10, 20), 'b');
        assert_eq!(
            map.intersection(r(5, 15)),
            vec![(r(5, 10), 'a'), (r(10, 15), 'b')]
        );
        assert!(map.contains_range(r(0, 20)));
        assert!(!map.contains_range(r(0, 21)));
    }

    #[test]
    fn randomized_set_matches_reference() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut set = RangeSet::new();
        let mut reference = vec![false; 256];
        for _ in 0..2000 {
            let a = rng.gen_range(0..256u64);
            let b = rng.gen_range(0..256u64);
            let (start, end) = if a <= b { (a, b) } else { (b, a) };
            let range = r(start, end);
            if rng.gen_bool(0.5) {
                set.insert(range);
                for slot in reference.iter_mut().take(end as usize).skip(start as usize) {
                    *slot = true;
                }
            } else {
                set.remove(range);
                for slot in reference.iter_mut().take(end as usize).skip(start as usize) {
                    *slot = false;
                }
            }
        }
        for (offset, &expected) in reference.iter().enumerate() {
            assert_eq!(set.contains(offset as u64), expected, "offset {}", offset);
        }
        // coalesced: no two stored ranges touch
        let ranges: Vec<_> = collect(&set);
        for pair in ranges.windows(2) {
            assert!(pair[0].1 < pair[1].0);
        }
    }
}
