//! RVA interval bookkeeping.

use std::fmt;

/// Half-open `[start, end)` range of RVAs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct RvaRange {
    pub start: u32,
    pub end: u32,
}

impl RvaRange {
    pub const fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// Range covering `size` bytes at `start`. Saturates at `u32::MAX`.
    pub const fn from_rva_and_size(start: u32, size: u32) -> Self {
        Self {
            start,
            end: start.saturating_add(size),
        }
    }

    pub const fn size(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    pub const fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub const fn contains(&self, rva: u32) -> bool {
        rva >= self.start && rva < self.end
    }

    /// True when `other` lies entirely within this range.
    pub const fn contains_range(&self, other: &RvaRange) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    pub const fn overlaps(&self, other: &RvaRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Bytes between the end of `self` and the start of `next`, zero when
    /// they touch or overlap.
    fn gap_to(&self, next: &RvaRange) -> u32 {
        next.start.saturating_sub(self.end)
    }
}

impl fmt::Debug for RvaRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end)
    }
}

/// Sorted collection of non-overlapping ranges.
///
/// Ranges are coalesced on construction: two ranges merge when they overlap
/// or when the gap between them is at most the padding given by the caller.
/// The result does not depend on the order ranges are supplied in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RvaRangeSet {
    ranges: Vec<RvaRange>,
}

impl RvaRangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from arbitrary (possibly overlapping) ranges.
    pub fn from_ranges<I>(ranges: I, max_padding_to_merge: u32) -> Self
    where
        I: IntoIterator<Item = RvaRange>,
    {
        let mut ranges: Vec<RvaRange> = ranges.into_iter().filter(|r| !r.is_empty()).collect();
        Self {
            ranges: coalesce(&mut ranges, max_padding_to_merge),
        }
    }

    /// Merge another set into this one using the same coalescing rule.
    pub fn union_with(&mut self, other: &RvaRangeSet, max_padding_to_merge: u32) {
        let mut all: Vec<RvaRange> = self.ranges.iter().chain(other.ranges.iter()).copied().collect();
        self.ranges = coalesce(&mut all, max_padding_to_merge);
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RvaRange> {
        self.ranges.iter()
    }

    /// Index of the last range starting at or before `rva`.
    fn candidate(&self, rva: u32) -> Option<&RvaRange> {
        let idx = self.ranges.partition_point(|r| r.start <= rva);
        idx.checked_sub(1).map(|i| &self.ranges[i])
    }

    pub fn contains(&self, rva: u32) -> bool {
        self.candidate(rva).is_some_and(|r| r.contains(rva))
    }

    /// True when a single range of the set covers all of `range`.
    pub fn fully_contains(&self, range: &RvaRange) -> bool {
        if range.is_empty() {
            return self.contains(range.start);
        }
        self.candidate(range.start)
            .is_some_and(|r| r.contains_range(range))
    }

    pub fn at_least_partially_overlaps(&self, range: &RvaRange) -> bool {
        let idx = self.ranges.partition_point(|r| r.end <= range.start);
        self.ranges
            .get(idx)
            .is_some_and(|r| r.overlaps(range))
    }
}

impl<'a> IntoIterator for &'a RvaRangeSet {
    type Item = &'a RvaRange;
    type IntoIter = std::slice::Iter<'a, RvaRange>;

    fn into_iter(self) -> Self::IntoIter {
        self.ranges.iter()
    }
}

fn coalesce(ranges: &mut [RvaRange], max_padding_to_merge: u32) -> Vec<RvaRange> {
    ranges.sort_unstable();

    let mut merged: Vec<RvaRange> = Vec::with_capacity(ranges.len());
    for range in ranges.iter().filter(|r| !r.is_empty()) {
        match merged.last_mut() {
            Some(last) if last.gap_to(range) <= max_padding_to_merge => {
                last.end = last.end.max(range.end);
            }
            _ => merged.push(*range),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ranges: &[(u32, u32)], padding: u32) -> RvaRangeSet {
        RvaRangeSet::from_ranges(ranges.iter().map(|&(s, e)| RvaRange::new(s, e)), padding)
    }

    #[test]
    fn insertion_order_does_not_matter() {
        let a = set(&[(100, 200), (400, 500), (202, 300)], 2);
        let b = set(&[(202, 300), (100, 200), (400, 500)], 2);
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn duplicate_ranges_collapse() {
        let s = set(&[(0x10, 0x20), (0x10, 0x20)], 0);
        assert_eq!(s.iter().copied().collect::<Vec<_>>(), vec![RvaRange::new(0x10, 0x20)]);
    }

    #[test]
    fn gap_equal_to_padding_merges() {
        let s = set(&[(0, 10), (18, 20)], 8);
        assert_eq!(s.len(), 1);
        let s = set(&[(0, 10), (19, 20)], 8);
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn contains_is_half_open() {
        let s = set(&[(100, 200), (400, 500)], 0);
        assert!(s.contains(100));
        assert!(s.contains(199));
        assert!(!s.contains(200));
        assert!(!s.contains(99));
        assert!(s.contains(450));
        assert!(!s.contains(500));
    }

    #[test]
    fn partial_overlap_queries() {
        let s = set(&[(100, 201), (202, 301), (400, 501)], 0);
        assert!(s.at_least_partially_overlaps(&RvaRange::new(100, 151)));
        assert!(s.at_least_partially_overlaps(&RvaRange::new(350, 401)));
        assert!(s.at_least_partially_overlaps(&RvaRange::new(250, 451)));
        assert!(s.at_least_partially_overlaps(&RvaRange::new(350, 551)));
        assert!(!s.at_least_partially_overlaps(&RvaRange::new(301, 400)));
    }

    #[test]
    fn full_containment_needs_one_range() {
        let s = set(&[(100, 200), (300, 400)], 0);
        assert!(s.fully_contains(&RvaRange::new(120, 200)));
        assert!(!s.fully_contains(&RvaRange::new(150, 350)));
    }

    #[test]
    fn union_coalesces() {
        let mut a = set(&[(100, 201), (400, 501)], 0);
        let b = set(&[(202, 301), (0, 50)], 0);
        a.union_with(&b, 0);
        assert!(a.contains(0));
        assert!(a.contains(49));
        assert!(!a.contains(201));
        assert!(a.contains(202));
        assert!(!a.contains(399));
        a.union_with(&b, 1);
        assert!(a.contains(201));
    }

    #[test]
    fn empty_ranges_are_ignored() {
        let s = set(&[(10, 10), (20, 30)], 0);
        assert_eq!(s.len(), 1);
    }
}
