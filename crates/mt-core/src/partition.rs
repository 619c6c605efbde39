//! Partition reconciliation.
//!
//! Applies a `(range, state)` assertion to the ordered, contiguous slots of
//! one machine: fully covered slots are deleted, partially covered slots
//! keep their state on the uncovered remainder, the asserted state is
//! inserted over the covered span, and adjacent slots with equal state are
//! coalesced back into one.
//!
//! The plan is a value diff against the input: re-applying an assertion the
//! partition already reflects yields an empty plan.

use thiserror::Error;

use crate::range::TimeRange;
use crate::slot::{Slot, SlotState};
use crate::types::MachineId;

/// A claim that a machine held `state` over `range`.
#[derive(Debug, Clone)]
pub struct Assertion<S> {
    pub machine: MachineId,
    pub range: TimeRange,
    pub state: S,
}

/// The slot changes needed to reconcile an assertion into a partition.
///
/// `delete` and `insert` are disjoint by value; a slot whose range shrank
/// appears as a delete of the old value plus an insert of the remainder.
/// `uncovered` lists the parts of the assertion range that fell outside the
/// queried slot window; the caller must re-invoke with a wider query to
/// cover them.
#[derive(Debug, Clone)]
pub struct ReplacementPlan<S> {
    pub delete: Vec<Slot<S>>,
    pub insert: Vec<Slot<S>>,
    pub uncovered: Vec<TimeRange>,
}

impl<S> ReplacementPlan<S> {
    /// True when the partition already reflects the assertion.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.delete.is_empty() && self.insert.is_empty() && self.uncovered.is_empty()
    }

    const fn empty() -> Self {
        Self {
            delete: Vec::new(),
            insert: Vec::new(),
            uncovered: Vec::new(),
        }
    }
}

/// Malformed input partition. Fatal: the current pass must stop and the
/// caller rolls back its transaction.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PartitionError {
    /// Slots out of order or overlapping.
    #[error("slots out of order or overlapping near {range}")]
    NotOrdered { range: TimeRange },

    /// Gap between two consecutive slots.
    #[error("gap in partition between {left} and {right}")]
    NotContiguous { left: TimeRange, right: TimeRange },

    /// A slot of another machine in the partition.
    #[error("slot of machine {found} in partition of machine {expected}")]
    MachineMismatch {
        expected: MachineId,
        found: MachineId,
    },

    /// A zero-width slot in the input.
    #[error("empty slot range {range} in input partition")]
    EmptySlot { range: TimeRange },
}

/// Reconciles an assertion against the machine's existing slots.
///
/// `existing` must be the slots overlapping (at least) `assertion.range`,
/// sorted, non-overlapping, and contiguous — the repository overlap query
/// guarantees this. An empty `existing` bootstraps the partition: the
/// assertion becomes its first slot.
pub fn apply<S: SlotState>(
    existing: &[Slot<S>],
    assertion: &Assertion<S>,
) -> Result<ReplacementPlan<S>, PartitionError> {
    check_partition(existing, &assertion.machine)?;

    if assertion.range.is_empty() {
        tracing::debug!(machine = %assertion.machine, "empty assertion range, nothing to do");
        return Ok(ReplacementPlan::empty());
    }

    if existing.is_empty() {
        return Ok(ReplacementPlan {
            delete: Vec::new(),
            insert: vec![Slot::new(
                assertion.machine.clone(),
                assertion.range,
                assertion.state.clone(),
            )],
            uncovered: Vec::new(),
        });
    }

    // Window actually covered by the queried slots.
    let span = existing
        .iter()
        .skip(1)
        .fold(existing[0].range, |acc, s| {
            acc.union(&s.range).expect("contiguous slots union")
        });

    let mut uncovered = Vec::new();
    if let Some(lo) = span.lower() {
        if let Some(outside) = assertion.range.intersection(&TimeRange::until(lo)) {
            uncovered.push(outside);
        }
    }
    if let Some(up) = span.upper() {
        if let Some(outside) = assertion.range.intersection(&TimeRange::since(up)) {
            uncovered.push(outside);
        }
    }

    let Some(effective) = assertion.range.intersection(&span) else {
        // Entirely outside the window; the caller has to widen its query.
        return Ok(ReplacementPlan {
            delete: Vec::new(),
            insert: Vec::new(),
            uncovered,
        });
    };

    // Desired slot sequence: remainders of split slots, untouched slots,
    // and the asserted slot, coalesced.
    let mut result: Vec<Slot<S>> = Vec::with_capacity(existing.len() + 1);
    for slot in existing {
        if slot.range.intersection(&effective).is_none() {
            result.push(slot.clone());
            continue;
        }
        if let Some(lo) = effective.lower() {
            if let Some(left) = slot.range.intersection(&TimeRange::until(lo)) {
                result.push(Slot::new(slot.machine.clone(), left, slot.state.clone()));
            }
        }
        if let Some(up) = effective.upper() {
            if let Some(right) = slot.range.intersection(&TimeRange::since(up)) {
                result.push(Slot::new(slot.machine.clone(), right, slot.state.clone()));
            }
        }
    }
    result.push(Slot::new(
        assertion.machine.clone(),
        effective,
        assertion.state.clone(),
    ));
    result.sort_by(|a, b| a.range.cmp(&b.range));
    let result = coalesce(result);

    // Plan = value diff of result against input.
    let delete = existing
        .iter()
        .filter(|s| !result.iter().any(|r| slot_eq(r, s)))
        .cloned()
        .collect();
    let insert = result
        .into_iter()
        .filter(|r| !existing.iter().any(|s| slot_eq(r, s)))
        .collect();

    Ok(ReplacementPlan {
        delete,
        insert,
        uncovered,
    })
}

/// Merges adjacent slots with equal state. Input must be sorted.
pub fn coalesce<S: SlotState>(slots: Vec<Slot<S>>) -> Vec<Slot<S>> {
    let mut merged: Vec<Slot<S>> = Vec::with_capacity(slots.len());
    for slot in slots {
        match merged.last_mut() {
            Some(last) if last.can_merge(&slot) => {
                last.range = last.range.union(&slot.range).expect("adjacent slots union");
            }
            _ => merged.push(slot),
        }
    }
    merged
}

/// Validates ordering only: one machine, sorted, non-overlapping, no
/// zero-width slots. Holes are allowed (partitions that are not yet full).
pub fn check_ordering<S: SlotState>(
    slots: &[Slot<S>],
    machine: &MachineId,
) -> Result<(), PartitionError> {
    for slot in slots {
        if slot.machine != *machine {
            return Err(PartitionError::MachineMismatch {
                expected: machine.clone(),
                found: slot.machine.clone(),
            });
        }
        if slot.range.is_empty() {
            return Err(PartitionError::EmptySlot { range: slot.range });
        }
    }
    for pair in slots.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        if a.range.cmp(&b.range).is_ge() || a.range.overlaps(&b.range) {
            return Err(PartitionError::NotOrdered { range: b.range });
        }
    }
    Ok(())
}

/// Validates the full input partition invariant: ordered as in
/// [`check_ordering`] and contiguous.
pub fn check_partition<S: SlotState>(
    slots: &[Slot<S>],
    machine: &MachineId,
) -> Result<(), PartitionError> {
    check_ordering(slots, machine)?;
    for pair in slots.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        if !a.range.is_adjacent_to(&b.range) {
            return Err(PartitionError::NotContiguous {
                left: a.range,
                right: b.range,
            });
        }
    }
    Ok(())
}

fn slot_eq<S: SlotState>(a: &Slot<S>, b: &Slot<S>) -> bool {
    a.machine == b.machine && a.range == b.range && a.state.state_eq(&b.state)
}
