//! Incremental range-keyed aggregates.
//!
//! A [`RangeValueAccumulator`] keeps a sorted, non-overlapping sequence of
//! `(range, value)` entries and folds deltas into the overlapping
//! sub-ranges using the same split algebra as the partition reconciler.
//! Gaps mean "no accumulated value". The result only depends on the net
//! delta per sub-range, never on the order of `add`/`remove` calls.

use chrono::Duration;

use crate::range::TimeRange;

/// Values that can be accumulated per range.
///
/// Kept abstract so integer counts and durations share the same machinery.
pub trait AccumulatorValue: Clone + PartialEq {
    /// The additive identity.
    fn zero() -> Self;

    /// `self + other`.
    #[must_use]
    fn combine(&self, other: &Self) -> Self;

    /// `-self`.
    #[must_use]
    fn negate(&self) -> Self;

    /// Whether this is the identity element.
    fn is_zero(&self) -> bool;
}

impl AccumulatorValue for i64 {
    fn zero() -> Self {
        0
    }

    fn combine(&self, other: &Self) -> Self {
        self + other
    }

    fn negate(&self) -> Self {
        -self
    }

    fn is_zero(&self) -> bool {
        *self == 0
    }
}

impl AccumulatorValue for Duration {
    fn zero() -> Self {
        Self::seconds(0)
    }

    fn combine(&self, other: &Self) -> Self {
        *self + *other
    }

    fn negate(&self) -> Self {
        -*self
    }

    fn is_zero(&self) -> bool {
        *self == Self::seconds(0)
    }
}

/// A mergeable map from time range to accumulated value.
#[derive(Debug, Clone, Default)]
pub struct RangeValueAccumulator<V> {
    entries: Vec<(TimeRange, V)>,
}

impl<V: AccumulatorValue> RangeValueAccumulator<V> {
    /// An empty accumulator.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// The current entries, sorted and non-overlapping.
    ///
    /// May contain zero-valued or adjacent equal-valued entries until
    /// [`RangeValueAccumulator::purge`] runs.
    #[must_use]
    pub fn entries(&self) -> &[(TimeRange, V)] {
        &self.entries
    }

    /// Adds `delta` over `range`, splitting entries at the range bounds.
    pub fn add(&mut self, range: TimeRange, delta: &V) {
        if range.is_empty() {
            return;
        }

        let old = std::mem::take(&mut self.entries);
        let mut rest = Some(range);

        for (entry_range, value) in old {
            let Some(r) = rest else {
                self.entries.push((entry_range, value));
                continue;
            };

            if strictly_before(&entry_range, &r) {
                self.entries.push((entry_range, value));
                rest = Some(r);
                continue;
            }

            // Part of the delta range before this entry gets a fresh entry.
            if let Some(lo) = entry_range.lower() {
                if let Some(gap) = r.intersection(&TimeRange::until(lo)) {
                    self.entries.push((gap, delta.clone()));
                }
            }

            if let Some(overlap) = entry_range.intersection(&r) {
                if let Some(lo) = overlap.lower() {
                    if let Some(left) = entry_range.intersection(&TimeRange::until(lo)) {
                        self.entries.push((left, value.clone()));
                    }
                }
                self.entries.push((overlap, value.combine(delta)));
                if let Some(up) = overlap.upper() {
                    if let Some(right) = entry_range.intersection(&TimeRange::since(up)) {
                        self.entries.push((right, value));
                    }
                    rest = r.intersection(&TimeRange::since(up));
                } else {
                    rest = None;
                }
            } else {
                // Entry entirely after the delta range; the gap flush above
                // already emitted the whole remainder.
                self.entries.push((entry_range, value));
                rest = None;
            }
        }

        if let Some(r) = rest {
            self.entries.push((r, delta.clone()));
        }
    }

    /// Removes `delta` over `range` (adds its negation).
    pub fn remove(&mut self, range: TimeRange, delta: &V) {
        self.add(range, &delta.negate());
    }

    /// Drops zero-valued entries and merges adjacent equal-valued ones.
    pub fn purge(&mut self) {
        let old = std::mem::take(&mut self.entries);
        for (range, value) in old {
            if value.is_zero() {
                continue;
            }
            match self.entries.last_mut() {
                Some((last_range, last_value))
                    if last_range.is_adjacent_to(&range) && *last_value == value =>
                {
                    *last_range = last_range.union(&range).expect("adjacent ranges union");
                }
                _ => self.entries.push((range, value)),
            }
        }
    }

    /// True when no entries remain (typically after a purge of a net-zero
    /// history).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// `a` ends at or before `b` starts.
fn strictly_before(a: &TimeRange, b: &TimeRange) -> bool {
    match (a.upper(), b.lower()) {
        (Some(up), Some(lo)) => up <= lo,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn ts(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 9, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn r(lo: i64, up: i64) -> TimeRange {
        TimeRange::between(ts(lo), ts(up)).unwrap()
    }

    #[test]
    fn disjoint_adds_stay_separate() {
        let mut acc = RangeValueAccumulator::new();
        acc.add(r(0, 10), &1_i64);
        acc.add(r(20, 30), &1_i64);
        acc.purge();
        assert_eq!(acc.entries(), &[(r(0, 10), 1), (r(20, 30), 1)]);
    }

    #[test]
    fn overlapping_add_splits_at_bounds() {
        let mut acc = RangeValueAccumulator::new();
        acc.add(r(0, 10), &1_i64);
        acc.add(r(5, 15), &1_i64);
        acc.purge();
        assert_eq!(
            acc.entries(),
            &[(r(0, 5), 1), (r(5, 10), 2), (r(10, 15), 1)]
        );
    }

    #[test]
    fn interleaved_history_yields_canonical_partition() {
        // The worked example from the summary update path: five adds and
        // one remove collapse to exactly nine entries.
        let mut acc = RangeValueAccumulator::new();
        acc.add(r(4, 8), &1_i64);
        acc.add(r(9, 12), &1_i64);
        acc.add(r(1, 2), &1_i64);
        acc.add(r(3, 5), &1_i64);
        acc.add(r(6, 11), &1_i64);
        acc.remove(r(7, 10), &1_i64);
        acc.purge();
        assert_eq!(
            acc.entries(),
            &[
                (r(1, 2), 1),
                (r(3, 4), 1),
                (r(4, 5), 2),
                (r(5, 6), 1),
                (r(6, 7), 2),
                (r(7, 8), 1),
                (r(9, 10), 1),
                (r(10, 11), 2),
                (r(11, 12), 1),
            ]
        );
    }

    #[test]
    fn order_independence() {
        let ops: [(i64, i64, i64); 4] = [(0, 10, 2), (5, 15, 3), (8, 20, -2), (0, 4, 1)];
        let mut forward = RangeValueAccumulator::new();
        for (lo, up, v) in ops {
            forward.add(r(lo, up), &v);
        }
        forward.purge();

        let mut backward = RangeValueAccumulator::new();
        for (lo, up, v) in ops.iter().rev() {
            backward.add(r(*lo, *up), v);
        }
        backward.purge();

        assert_eq!(forward.entries(), backward.entries());
    }

    #[test]
    fn net_zero_subrange_disappears_after_purge() {
        let mut acc = RangeValueAccumulator::new();
        acc.add(r(0, 20), &5_i64);
        acc.remove(r(5, 10), &5_i64);
        acc.purge();
        assert_eq!(acc.entries(), &[(r(0, 5), 5), (r(10, 20), 5)]);

        acc.remove(r(0, 5), &5_i64);
        acc.remove(r(10, 20), &5_i64);
        acc.purge();
        assert!(acc.is_empty());
    }

    #[test]
    fn purge_merges_adjacent_equal_values() {
        let mut acc = RangeValueAccumulator::new();
        acc.add(r(0, 10), &1_i64);
        acc.add(r(10, 20), &1_i64);
        acc.purge();
        assert_eq!(acc.entries(), &[(r(0, 20), 1)]);
    }

    #[test]
    fn duration_values_accumulate() {
        let mut acc = RangeValueAccumulator::new();
        acc.add(r(0, 10), &Duration::minutes(10));
        acc.add(r(0, 10), &Duration::minutes(5));
        acc.remove(r(0, 10), &Duration::minutes(15));
        acc.purge();
        assert!(acc.is_empty());
    }

    #[test]
    fn empty_range_add_is_noop() {
        let mut acc = RangeValueAccumulator::new();
        acc.add(TimeRange::between(ts(5), ts(5)).unwrap(), &1_i64);
        assert!(acc.is_empty());
    }
}
