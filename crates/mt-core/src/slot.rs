//! Slots: maximal time intervals over which an entity holds one state value.
//!
//! A [`Slot`] is generic over its state bundle; each partition kind
//! (observation states, reasons, days, shifts) has its own bundle struct.
//! State is immutable for the lifetime of a slot: the reconciler only ever
//! shrinks or grows a slot's range, a state change is a delete plus an
//! insert. This keeps slot equality purely structural.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::range::TimeRange;
use crate::types::{
    MachineId, MachineModeId, ObservationStateId, ReasonId, Score, ShiftId, TemplateId,
};

/// A state bundle that can live in a slot partition.
///
/// `state_eq` drives merge coalescing: two adjacent slots whose states are
/// equal by this comparison collapse into one.
pub trait SlotState: Clone {
    /// Value equality of the carried state.
    fn state_eq(&self, other: &Self) -> bool;
}

/// A maximal interval over which one machine holds one state value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot<S> {
    /// The machine owning this partition.
    pub machine: MachineId,
    /// Half-open validity range.
    pub range: TimeRange,
    /// The carried state.
    pub state: S,
}

impl<S: SlotState> Slot<S> {
    /// Creates a slot over a non-empty range.
    ///
    /// # Panics
    ///
    /// Panics if `range` is empty; callers must drop empty ranges before
    /// building slots (the reconciler does).
    #[must_use]
    pub fn new(machine: MachineId, range: TimeRange, state: S) -> Self {
        assert!(!range.is_empty(), "slot over an empty range");
        Self {
            machine,
            range,
            state,
        }
    }

    /// Whether this slot and `other` can be merged into one.
    #[must_use]
    pub fn can_merge(&self, other: &Self) -> bool {
        self.machine == other.machine
            && self.range.is_adjacent_to(&other.range)
            && self.state.state_eq(&other.state)
    }
}

/// State of a reason slot.
///
/// The reason is `None` while resolution is pending (e.g., waiting on a
/// dynamic end time); `overwrite_required` flags the slot for later
/// re-evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasonState {
    pub machine_mode: MachineModeId,
    pub observation_state: ObservationStateId,
    pub reason: Option<ReasonId>,
    pub reason_score: Score,
    pub default_reason: bool,
    pub overwrite_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shift: Option<ShiftId>,
}

impl SlotState for ReasonState {
    fn state_eq(&self, other: &Self) -> bool {
        self == other
    }
}

/// State of an observation-state slot.
///
/// `template` present means a machine state template was associated but has
/// not been expanded over this interval yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationStateBundle {
    pub observation_state: ObservationStateId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shift: Option<ShiftId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<TemplateId>,
}

impl SlotState for ObservationStateBundle {
    fn state_eq(&self, other: &Self) -> bool {
        self == other
    }
}

/// State of a day slot.
///
/// `day` is `None` until the day template is processed over the slot's
/// range; `week` is the ISO week-year/week-number pair derived from `day`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayState {
    pub template: TemplateId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub week: Option<(i32, u32)>,
}

impl DayState {
    /// Unprocessed state: day still unknown.
    #[must_use]
    pub const fn unprocessed(template: TemplateId) -> Self {
        Self {
            template,
            day: None,
            week: None,
        }
    }

    /// Processed state for a concrete calendar day.
    #[must_use]
    pub fn for_day(template: TemplateId, day: NaiveDate) -> Self {
        let iso = day.iso_week();
        Self {
            template,
            day: Some(day),
            week: Some((iso.year(), iso.week())),
        }
    }
}

impl SlotState for DayState {
    fn state_eq(&self, other: &Self) -> bool {
        self == other
    }
}

/// State of a shift slot.
///
/// `breaks` are non-working sub-ranges recorded as metadata on the slot;
/// they never become partition entries of their own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShiftState {
    pub template: TemplateId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shift: Option<ShiftId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub breaks: Vec<TimeRange>,
}

impl SlotState for ShiftState {
    fn state_eq(&self, other: &Self) -> bool {
        self == other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn ts(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 9, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn machine() -> MachineId {
        MachineId::new("m-1").unwrap()
    }

    fn attended(template: Option<&str>) -> ObservationStateBundle {
        ObservationStateBundle {
            observation_state: ObservationStateId::new("attended").unwrap(),
            shift: None,
            template: template.map(|t| TemplateId::new(t).unwrap()),
        }
    }

    #[test]
    fn adjacent_equal_state_slots_can_merge() {
        let a = Slot::new(
            machine(),
            TimeRange::between(ts(0), ts(10)).unwrap(),
            attended(None),
        );
        let b = Slot::new(
            machine(),
            TimeRange::between(ts(10), ts(20)).unwrap(),
            attended(None),
        );
        assert!(a.can_merge(&b));
    }

    #[test]
    fn different_state_blocks_merge() {
        let a = Slot::new(
            machine(),
            TimeRange::between(ts(0), ts(10)).unwrap(),
            attended(None),
        );
        let b = Slot::new(
            machine(),
            TimeRange::between(ts(10), ts(20)).unwrap(),
            attended(Some("night-shift")),
        );
        assert!(!a.can_merge(&b));
    }

    #[test]
    fn gap_blocks_merge() {
        let a = Slot::new(
            machine(),
            TimeRange::between(ts(0), ts(10)).unwrap(),
            attended(None),
        );
        let b = Slot::new(
            machine(),
            TimeRange::between(ts(11), ts(20)).unwrap(),
            attended(None),
        );
        assert!(!a.can_merge(&b));
    }

    #[test]
    #[should_panic(expected = "empty range")]
    fn empty_range_slot_panics() {
        let _ = Slot::new(
            machine(),
            TimeRange::between(ts(5), ts(5)).unwrap(),
            attended(None),
        );
    }

    #[test]
    fn day_state_derives_iso_week() {
        let template = TemplateId::new("weekdays").unwrap();
        let state = DayState::for_day(template, NaiveDate::from_ymd_opt(2025, 1, 15).unwrap());
        assert_eq!(state.week, Some((2025, 3)));
    }
}
