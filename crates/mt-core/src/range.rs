//! Half-open UTC time ranges with optional unbounded ends.
//!
//! A [`TimeRange`] is always `[lower, upper)`. A missing lower bound means
//! negative infinity, a missing upper bound positive infinity. Construction
//! rejects inverted bounds; a range whose bounds are equal is *empty* and
//! must never become a slot, so the splitting operations return `Option`
//! and drop empty results.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors building or combining ranges.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RangeError {
    /// Lower bound was after the upper bound.
    #[error("inverted range: lower {lower} is after upper {upper}")]
    Inverted {
        lower: DateTime<Utc>,
        upper: DateTime<Utc>,
    },

    /// Union of two ranges that neither overlap nor touch.
    #[error("union of disjoint ranges {0} and {1}")]
    DisjointUnion(TimeRange, TimeRange),
}

/// A half-open `[lower, upper)` interval over UTC instants.
///
/// `None` bounds are unbounded ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    lower: Option<DateTime<Utc>>,
    upper: Option<DateTime<Utc>>,
}

impl TimeRange {
    /// Creates a range, rejecting inverted bounds.
    ///
    /// Equal bounds are accepted and produce an empty range; callers that
    /// would insert such a range as a slot must drop it (see
    /// [`TimeRange::is_empty`]).
    pub fn new(
        lower: Option<DateTime<Utc>>,
        upper: Option<DateTime<Utc>>,
    ) -> Result<Self, RangeError> {
        if let (Some(lo), Some(up)) = (lower, upper) {
            if up < lo {
                return Err(RangeError::Inverted {
                    lower: lo,
                    upper: up,
                });
            }
        }
        Ok(Self { lower, upper })
    }

    /// `[lower, upper)` with both bounds present.
    pub fn between(lower: DateTime<Utc>, upper: DateTime<Utc>) -> Result<Self, RangeError> {
        Self::new(Some(lower), Some(upper))
    }

    /// `[lower, +oo)`.
    #[must_use]
    pub const fn since(lower: DateTime<Utc>) -> Self {
        Self {
            lower: Some(lower),
            upper: None,
        }
    }

    /// `(-oo, upper)`.
    #[must_use]
    pub const fn until(upper: DateTime<Utc>) -> Self {
        Self {
            lower: None,
            upper: Some(upper),
        }
    }

    /// `(-oo, +oo)`.
    #[must_use]
    pub const fn full() -> Self {
        Self {
            lower: None,
            upper: None,
        }
    }

    /// The lower bound, `None` meaning negative infinity.
    #[must_use]
    pub const fn lower(&self) -> Option<DateTime<Utc>> {
        self.lower
    }

    /// The upper bound, `None` meaning positive infinity.
    #[must_use]
    pub const fn upper(&self) -> Option<DateTime<Utc>> {
        self.upper
    }

    /// True when both bounds are present and equal (a degenerate range).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!((self.lower, self.upper), (Some(lo), Some(up)) if lo == up)
    }

    /// Duration of the range, `None` when either end is unbounded.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        match (self.lower, self.upper) {
            (Some(lo), Some(up)) => Some(up - lo),
            _ => None,
        }
    }

    /// Whether the instant falls inside `[lower, upper)`.
    #[must_use]
    pub fn contains_point(&self, t: DateTime<Utc>) -> bool {
        if self.is_empty() {
            return false;
        }
        self.lower.is_none_or(|lo| lo <= t) && self.upper.is_none_or(|up| t < up)
    }

    /// Whether `other` lies entirely inside this range.
    #[must_use]
    pub fn contains_range(&self, other: &Self) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        cmp_lower(self.lower, other.lower) != Ordering::Greater
            && cmp_upper(other.upper, self.upper) != Ordering::Greater
    }

    /// Whether the two ranges share at least one instant.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        // lower < other.upper && other.lower < upper, with infinities
        let left = match (self.lower, other.upper) {
            (Some(lo), Some(up)) => lo < up,
            _ => true,
        };
        let right = match (other.lower, self.upper) {
            (Some(lo), Some(up)) => lo < up,
            _ => true,
        };
        left && right
    }

    /// The overlapping part of the two ranges, `None` when it is empty.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        if !self.overlaps(other) {
            return None;
        }
        let lower = max_lower(self.lower, other.lower);
        let upper = min_upper(self.upper, other.upper);
        let range = Self { lower, upper };
        if range.is_empty() { None } else { Some(range) }
    }

    /// Whether the ranges touch without overlapping: one's upper equals the
    /// other's lower.
    #[must_use]
    pub fn is_adjacent_to(&self, other: &Self) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        let touches = |up: Option<DateTime<Utc>>, lo: Option<DateTime<Utc>>| {
            matches!((up, lo), (Some(u), Some(l)) if u == l)
        };
        touches(self.upper, other.lower) || touches(other.upper, self.lower)
    }

    /// The union of two overlapping or adjacent ranges.
    pub fn union(&self, other: &Self) -> Result<Self, RangeError> {
        if !self.overlaps(other) && !self.is_adjacent_to(other) {
            return Err(RangeError::DisjointUnion(*self, *other));
        }
        Ok(Self {
            lower: min_lower(self.lower, other.lower),
            upper: max_upper(self.upper, other.upper),
        })
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bound = |b: Option<DateTime<Utc>>| {
            b.map_or_else(String::new, |t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        };
        write!(f, "[{},{})", bound(self.lower), bound(self.upper))
    }
}

/// Orders ranges by lower bound, then upper; unbounded lower sorts first,
/// unbounded upper last.
impl Ord for TimeRange {
    fn cmp(&self, other: &Self) -> Ordering {
        cmp_lower(self.lower, other.lower).then_with(|| cmp_upper(self.upper, other.upper))
    }
}

impl PartialOrd for TimeRange {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Compares two lower bounds, `None` = -oo.
fn cmp_lower(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => x.cmp(&y),
    }
}

/// Compares two upper bounds, `None` = +oo.
fn cmp_upper(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(x), Some(y)) => x.cmp(&y),
    }
}

fn max_lower(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    if cmp_lower(a, b) == Ordering::Less { b } else { a }
}

fn min_lower(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    if cmp_lower(a, b) == Ordering::Greater { b } else { a }
}

fn min_upper(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    if cmp_upper(a, b) == Ordering::Greater { b } else { a }
}

fn max_upper(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    if cmp_upper(a, b) == Ordering::Less { b } else { a }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 9, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn r(lo: i64, up: i64) -> TimeRange {
        TimeRange::between(ts(lo), ts(up)).unwrap()
    }

    #[test]
    fn rejects_inverted_bounds() {
        assert!(TimeRange::between(ts(10), ts(0)).is_err());
        assert!(TimeRange::between(ts(0), ts(10)).is_ok());
    }

    #[test]
    fn equal_bounds_are_empty() {
        let range = TimeRange::between(ts(5), ts(5)).unwrap();
        assert!(range.is_empty());
        assert!(!range.contains_point(ts(5)));
    }

    #[test]
    fn contains_point_half_open() {
        let range = r(0, 10);
        assert!(range.contains_point(ts(0)));
        assert!(range.contains_point(ts(9)));
        assert!(!range.contains_point(ts(10)));
    }

    #[test]
    fn unbounded_ends_contain_everything_on_that_side() {
        let since = TimeRange::since(ts(0));
        assert!(since.contains_point(ts(100_000)));
        assert!(!since.contains_point(ts(-1)));

        let until = TimeRange::until(ts(0));
        assert!(until.contains_point(ts(-100_000)));
        assert!(!until.contains_point(ts(0)));

        assert!(TimeRange::full().contains_point(ts(0)));
    }

    #[test]
    fn overlaps_shared_boundary_is_disjoint() {
        // [0,10) and [10,20) share no instant
        assert!(!r(0, 10).overlaps(&r(10, 20)));
        assert!(r(0, 10).overlaps(&r(9, 20)));
        assert!(r(0, 10).is_adjacent_to(&r(10, 20)));
        assert!(!r(0, 10).is_adjacent_to(&r(11, 20)));
    }

    #[test]
    fn intersection_clips_to_overlap() {
        assert_eq!(r(0, 10).intersection(&r(5, 20)), Some(r(5, 10)));
        assert_eq!(r(0, 10).intersection(&r(10, 20)), None);
        assert_eq!(r(0, 10).intersection(&TimeRange::full()), Some(r(0, 10)));
    }

    #[test]
    fn intersection_with_unbounded_keeps_finite_bounds() {
        let since = TimeRange::since(ts(5));
        assert_eq!(r(0, 10).intersection(&since), Some(r(5, 10)));
        let until = TimeRange::until(ts(5));
        assert_eq!(r(0, 10).intersection(&until), Some(r(0, 5)));
    }

    #[test]
    fn union_of_adjacent_ranges() {
        assert_eq!(r(0, 10).union(&r(10, 20)).unwrap(), r(0, 20));
        assert_eq!(r(5, 15).union(&r(0, 10)).unwrap(), r(0, 15));
        assert!(r(0, 10).union(&r(11, 20)).is_err());
    }

    #[test]
    fn union_with_unbounded_stays_unbounded() {
        let since = TimeRange::since(ts(5));
        let merged = r(0, 10).union(&since).unwrap();
        assert_eq!(merged.lower(), Some(ts(0)));
        assert_eq!(merged.upper(), None);
    }

    #[test]
    fn contains_range_with_infinities() {
        assert!(TimeRange::full().contains_range(&r(0, 10)));
        assert!(!r(0, 10).contains_range(&TimeRange::full()));
        assert!(TimeRange::since(ts(0)).contains_range(&r(5, 10)));
        assert!(!TimeRange::since(ts(6)).contains_range(&r(5, 10)));
    }

    #[test]
    fn ordering_sorts_by_lower_then_upper() {
        let mut ranges = vec![r(10, 20), TimeRange::until(ts(0)), r(0, 5), r(0, 10)];
        ranges.sort();
        assert_eq!(
            ranges,
            vec![TimeRange::until(ts(0)), r(0, 5), r(0, 10), r(10, 20)]
        );
    }

    #[test]
    fn duration_known_only_for_bounded() {
        assert_eq!(r(0, 30).duration(), Some(Duration::minutes(30)));
        assert_eq!(TimeRange::since(ts(0)).duration(), None);
    }
}
