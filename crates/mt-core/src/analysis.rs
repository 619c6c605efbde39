//! Cascading analysis.
//!
//! A change event ("modification") asserts that something held over a date
//! range: an observation state, machine activity, or a manual reason. The
//! driver reconciles the assertion into the machine's partitions in a fixed
//! order — observation-state slots first, then reason re-evaluation over
//! every touched reason slot, then duration summaries — and tracks the
//! modification through `Pending -> InProgress -> Done`.
//!
//! A synchronous modification runs all cascaded steps in one pass (a second
//! pass is a no-op); otherwise the cascade is deferred to the next pass.
//! Superseded modifications move to `Timeout`: partition changes already
//! applied are kept, not rolled back, and a dedicated audit entry records
//! that.

use std::collections::BTreeMap;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::accumulator::RangeValueAccumulator;
use crate::partition::{self, Assertion, PartitionError, ReplacementPlan};
use crate::range::TimeRange;
use crate::reason::{
    DefaultReasonTable, DynamicEndResponse, ReasonAssertion, ReasonDecision, ReasonSource, resolve,
};
use crate::repository::{
    AnalysisLogSink, AutoReasonProvider, CatalogLookup, RepositoryError, Severity, SlotRepository,
    SummaryCategory, SummaryStore,
};
use crate::slot::{ObservationStateBundle, ReasonState, Slot, SlotState};
use crate::types::{MachineId, MachineModeId, Score};

/// Engine tunables for analysis passes.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    /// How many passes a modification may stay pending on dynamic-end
    /// resolution before it completes degraded.
    pub resolver_retry_budget: u32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            resolver_retry_budget: 5,
        }
    }
}

/// Lifecycle of a modification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Pending,
    InProgress,
    Done,
    /// Superseded by the caller; partial changes are retained.
    Timeout,
    Error,
}

impl AnalysisStatus {
    /// Stable string form for storage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Timeout => "timeout",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for AnalysisStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            "timeout" => Ok(Self::Timeout),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown analysis status: {other}")),
        }
    }
}

/// What a modification asserts over its range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModificationKind {
    /// The machine was in this observation state (optionally carrying an
    /// unexpanded state template).
    ObservationState(ObservationStateBundle),
    /// The machine ran in this mode.
    Activity { machine_mode: MachineModeId },
    /// An operator asserted (or cleared) a reason.
    Reason {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        assertion: Option<ReasonAssertion>,
    },
}

/// An externally supplied change event, applied in assertion-timestamp
/// order per machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Modification {
    pub id: Uuid,
    pub machine: MachineId,
    pub kind: ModificationKind,
    pub range: TimeRange,
    #[serde(default)]
    pub synchronous: bool,
    pub status: AnalysisStatus,
    #[serde(default)]
    pub retries: u32,
}

impl Modification {
    /// A new pending modification.
    #[must_use]
    pub fn new(machine: MachineId, kind: ModificationKind, range: TimeRange) -> Self {
        Self {
            id: Uuid::new_v4(),
            machine,
            kind,
            range,
            synchronous: false,
            status: AnalysisStatus::Pending,
            retries: 0,
        }
    }

    /// Forces all cascaded steps into the same pass.
    #[must_use]
    pub const fn synchronous(mut self) -> Self {
        self.synchronous = true;
        self
    }
}

/// Fatal analysis failures. Recoverable conditions (unresolved reasons,
/// scan exhaustion) degrade to flagged slots instead of raising.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("modification {id} is not runnable in status {status:?}")]
    NotRunnable { id: Uuid, status: AnalysisStatus },
}

/// Everything the driver needs from the persistence layer.
pub trait AnalysisContext:
    SlotRepository<ObservationStateBundle>
    + SlotRepository<ReasonState>
    + CatalogLookup
    + AutoReasonProvider
    + SummaryStore
{
}

impl<T> AnalysisContext for T where
    T: SlotRepository<ObservationStateBundle>
        + SlotRepository<ReasonState>
        + CatalogLookup
        + AutoReasonProvider
        + SummaryStore
{
}

/// The cascading analysis driver.
///
/// Holds the summary accumulator for the current transaction; the caller
/// flushes it with [`AnalysisDriver::store`] before committing.
pub struct AnalysisDriver<'a, Ctx> {
    ctx: &'a mut Ctx,
    log: &'a mut dyn AnalysisLogSink,
    table: DefaultReasonTable,
    config: AnalysisConfig,
    summaries: BTreeMap<(MachineId, SummaryCategory), RangeValueAccumulator<Duration>>,
}

impl<'a, Ctx: AnalysisContext> AnalysisDriver<'a, Ctx> {
    /// Creates a driver over a persistence context.
    pub fn new(
        ctx: &'a mut Ctx,
        log: &'a mut dyn AnalysisLogSink,
        table: DefaultReasonTable,
        config: AnalysisConfig,
    ) -> Self {
        Self {
            ctx,
            log,
            table,
            config,
            summaries: BTreeMap::new(),
        }
    }

    /// Runs one analysis pass over a modification.
    ///
    /// `Done` and `Timeout` modifications are no-ops. A failed pass moves
    /// the modification to `Error` and surfaces the failure; the caller
    /// rolls back its transaction.
    pub fn run(&mut self, modification: &mut Modification) -> Result<AnalysisStatus, EngineError> {
        match modification.status {
            AnalysisStatus::Done | AnalysisStatus::Timeout => {
                tracing::debug!(id = %modification.id, status = ?modification.status, "nothing to do");
                return Ok(modification.status);
            }
            AnalysisStatus::Error => {
                return Err(EngineError::NotRunnable {
                    id: modification.id,
                    status: modification.status,
                });
            }
            AnalysisStatus::Pending | AnalysisStatus::InProgress => {}
        }

        let first_pass = modification.status == AnalysisStatus::Pending;
        modification.status = AnalysisStatus::InProgress;

        let cascade = modification.synchronous || !first_pass;
        let outcome = self.run_steps(modification, first_pass, cascade);
        match outcome {
            Ok(pending) => {
                if !cascade {
                    // Cascade deferred to the next pass.
                } else if pending {
                    modification.retries += 1;
                    if modification.retries > self.config.resolver_retry_budget {
                        self.log.record(
                            Severity::Warn,
                            "resolver retry budget exceeded, completing degraded",
                            serde_json::json!({
                                "modification": modification.id,
                                "retries": modification.retries,
                            }),
                        );
                        modification.status = AnalysisStatus::Done;
                    }
                } else {
                    modification.status = AnalysisStatus::Done;
                }
                Ok(modification.status)
            }
            Err(e) => {
                modification.status = AnalysisStatus::Error;
                self.log.record(
                    Severity::Error,
                    "analysis pass failed",
                    serde_json::json!({
                        "modification": modification.id,
                        "error": e.to_string(),
                    }),
                );
                Err(e)
            }
        }
    }

    /// Marks a modification as superseded.
    ///
    /// Partition changes already applied stay committed; a dedicated audit
    /// entry records the partial state.
    pub fn mark_timeout(&mut self, modification: &mut Modification) {
        modification.status = AnalysisStatus::Timeout;
        self.log.record(
            Severity::Warn,
            "modification superseded, partial partition changes retained",
            serde_json::json!({
                "modification": modification.id,
                "kind": "timeout-partial",
            }),
        );
    }

    /// Flushes the accumulated summary deltas through the store.
    ///
    /// Call once at the end of the transaction; the accumulator is drained.
    pub fn store(&mut self) -> Result<(), EngineError> {
        let summaries = std::mem::take(&mut self.summaries);
        for ((machine, category), mut acc) in summaries {
            acc.purge();
            for (range, delta) in acc.entries() {
                self.ctx.store_summary(&machine, category, range, *delta)?;
            }
        }
        Ok(())
    }

    /// Returns true when some reason is still pending on a dynamic end.
    fn run_steps(
        &mut self,
        modification: &Modification,
        first_pass: bool,
        cascade: bool,
    ) -> Result<bool, EngineError> {
        if first_pass {
            if let ModificationKind::ObservationState(bundle) = &modification.kind {
                self.apply_observation(&modification.machine, modification.range, bundle)?;
            }
        }
        if !cascade {
            return Ok(false);
        }
        let manual = match &modification.kind {
            ModificationKind::Reason { assertion } => assertion.as_ref(),
            _ => None,
        };
        let mode_override = match &modification.kind {
            ModificationKind::Activity { machine_mode } => Some(machine_mode),
            _ => None,
        };
        self.reevaluate_reasons(
            &modification.machine,
            modification.range,
            manual,
            mode_override,
        )
    }

    /// Step 1: reconcile the observation-state partition.
    fn apply_observation(
        &mut self,
        machine: &MachineId,
        range: TimeRange,
        bundle: &ObservationStateBundle,
    ) -> Result<(), EngineError> {
        let assertion = Assertion {
            machine: machine.clone(),
            range,
            state: bundle.clone(),
        };
        // First round reconciles the covered window; if parts of the range
        // had no slots yet they get bootstrapped and a second round
        // coalesces them with their neighbours.
        for _ in 0..2 {
            let existing = SlotRepository::<ObservationStateBundle>::find_overlapping(
                self.ctx, machine, &range,
            )?;
            let plan = partition::apply(&existing, &assertion)?;
            for slot in &plan.delete {
                SlotRepository::<ObservationStateBundle>::delete(self.ctx, slot)?;
            }
            for slot in &plan.insert {
                SlotRepository::<ObservationStateBundle>::save(self.ctx, slot)?;
            }
            if plan.uncovered.is_empty() {
                break;
            }
            for uncovered in &plan.uncovered {
                let slot = Slot::new(machine.clone(), *uncovered, bundle.clone());
                SlotRepository::<ObservationStateBundle>::save(self.ctx, &slot)?;
            }
        }
        Ok(())
    }

    /// Steps 2 and 3: re-resolve reasons over the touched range and fold
    /// the duration deltas into the summary accumulator.
    fn reevaluate_reasons(
        &mut self,
        machine: &MachineId,
        range: TimeRange,
        manual: Option<&ReasonAssertion>,
        mode_override: Option<&MachineModeId>,
    ) -> Result<bool, EngineError> {
        let existing =
            SlotRepository::<ReasonState>::find_overlapping(self.ctx, machine, &range)?;
        // Reason partitions may still have holes where no activity was ever
        // recorded, so only ordering is enforced here.
        partition::check_ordering(&existing, machine)?;

        // Work list: the touched part of each reason slot, plus — for
        // activity assertions — fresh segments derived from the
        // observation-state partition where no reason slot exists yet.
        let mut segments: Vec<(TimeRange, ReasonState)> = Vec::new();
        for slot in &existing {
            if let Some(sub) = slot.range.intersection(&range) {
                segments.push((sub, slot.state.clone()));
            }
        }
        if let Some(mode) = mode_override {
            // Parts of the range no reason slot covers.
            let mut holes = Vec::new();
            let mut rest = Some(range);
            for slot in &existing {
                let Some(r) = rest else { break };
                if let Some(lo) = slot.range.lower() {
                    if let Some(hole) = r.intersection(&TimeRange::until(lo)) {
                        holes.push(hole);
                    }
                }
                rest = match slot.range.upper() {
                    Some(up) => r.intersection(&TimeRange::since(up)),
                    None => None,
                };
            }
            if let Some(r) = rest {
                holes.push(r);
            }
            for hole in holes {
                segments.extend(self.observation_segments(machine, hole, mode)?);
            }
        }
        segments.sort_by(|a, b| a.0.cmp(&b.0));

        let candidates = self.ctx.candidates(machine)?;
        let mut pending = false;

        for (sub, base) in segments {
            let mut target = base.clone();
            if let Some(mode) = mode_override {
                if target.machine_mode != *mode {
                    // A mode change invalidates the previous reason.
                    target.machine_mode = mode.clone();
                    target.reason = None;
                    target.reason_score = Score::new(0.0).expect("zero is a valid score");
                    target.default_reason = true;
                }
            }

            let mut decision = resolve(&target, manual, &candidates, &self.table);
            let mut apply_range = sub;

            if decision.source == ReasonSource::Auto {
                match self.resolve_dynamic_end(machine, &decision, sub)? {
                    DynamicOutcome::Static => {}
                    DynamicOutcome::Pending => {
                        pending = true;
                        // Keep the current state but flag it for the retry.
                        decision = ReasonDecision {
                            reason: target.reason.clone(),
                            score: target.reason_score,
                            default_reason: target.default_reason,
                            overwrite_required: true,
                            source: decision.source,
                        };
                    }
                    DynamicOutcome::Clipped {
                        range: clipped,
                        provisional,
                    } => {
                        apply_range = clipped;
                        decision.overwrite_required = provisional;
                    }
                    DynamicOutcome::Void => {
                        decision = resolve(&target, manual, &[], &self.table);
                    }
                }
            }

            let new_state = ReasonState {
                machine_mode: target.machine_mode.clone(),
                observation_state: target.observation_state.clone(),
                reason: decision.reason.clone(),
                reason_score: decision.score,
                default_reason: decision.default_reason,
                overwrite_required: decision.overwrite_required,
                shift: target.shift.clone(),
            };
            if decision.source == ReasonSource::Unresolved {
                self.log.record(
                    Severity::Warn,
                    "reason slot without resolvable reason",
                    serde_json::json!({
                        "machine": machine.as_str(),
                        "range": sub.to_string(),
                    }),
                );
            }
            if new_state.state_eq(&base) && apply_range == sub {
                continue;
            }

            let current =
                SlotRepository::<ReasonState>::find_overlapping(self.ctx, machine, &apply_range)?;
            let plan = partition::apply(
                &current,
                &Assertion {
                    machine: machine.clone(),
                    range: apply_range,
                    state: new_state.clone(),
                },
            )?;
            self.execute_reason_plan(&plan, machine, &new_state)?;
        }

        Ok(pending)
    }

    /// Builds fresh reason segments for a hole, one per observation-state
    /// slot, carrying the asserted machine mode.
    fn observation_segments(
        &mut self,
        machine: &MachineId,
        hole: TimeRange,
        mode: &MachineModeId,
    ) -> Result<Vec<(TimeRange, ReasonState)>, EngineError> {
        let observation =
            SlotRepository::<ObservationStateBundle>::find_overlapping(self.ctx, machine, &hole)?;
        if observation.is_empty() {
            self.log.record(
                Severity::Warn,
                "no machine status found",
                serde_json::json!({
                    "machine": machine.as_str(),
                    "range": hole.to_string(),
                }),
            );
            return Ok(Vec::new());
        }
        let mut segments = Vec::new();
        for slot in &observation {
            let Some(sub) = slot.range.intersection(&hole) else {
                continue;
            };
            segments.push((
                sub,
                ReasonState {
                    machine_mode: mode.clone(),
                    observation_state: slot.state.observation_state.clone(),
                    reason: None,
                    reason_score: Score::new(0.0).expect("zero is a valid score"),
                    default_reason: true,
                    overwrite_required: false,
                    shift: slot.state.shift.clone(),
                },
            ));
        }
        Ok(segments)
    }

    /// Applies a reason plan and folds its duration deltas into the
    /// summary accumulator.
    fn execute_reason_plan(
        &mut self,
        plan: &ReplacementPlan<ReasonState>,
        machine: &MachineId,
        bootstrap_state: &ReasonState,
    ) -> Result<(), EngineError> {
        for slot in &plan.delete {
            SlotRepository::<ReasonState>::delete(self.ctx, slot)?;
            self.summary_delta(slot, false)?;
        }
        for slot in &plan.insert {
            SlotRepository::<ReasonState>::save(self.ctx, slot)?;
            self.summary_delta(slot, true)?;
        }
        for uncovered in &plan.uncovered {
            let slot = Slot::new(machine.clone(), *uncovered, bootstrap_state.clone());
            SlotRepository::<ReasonState>::save(self.ctx, &slot)?;
            self.summary_delta(&slot, true)?;
        }
        Ok(())
    }

    /// Accumulates one slot's duration under its summary category.
    fn summary_delta(&mut self, slot: &Slot<ReasonState>, add: bool) -> Result<(), EngineError> {
        let Some(duration) = slot.range.duration() else {
            // Open-ended slots are not summarized until they close.
            return Ok(());
        };
        let mode = self.ctx.machine_mode(&slot.state.machine_mode)?;
        let state = self.ctx.observation_state(&slot.state.observation_state)?;
        let (Some(mode), Some(state)) = (mode, state) else {
            self.log.record(
                Severity::Warn,
                "catalog entry missing, slot not summarized",
                serde_json::json!({
                    "machine": slot.machine.as_str(),
                    "machine_mode": slot.state.machine_mode.as_str(),
                    "observation_state": slot.state.observation_state.as_str(),
                }),
            );
            return Ok(());
        };
        let category = SummaryCategory::classify(&mode, &state);
        let acc = self
            .summaries
            .entry((slot.machine.clone(), category))
            .or_default();
        if add {
            acc.add(slot.range, &duration);
        } else {
            acc.remove(slot.range, &duration);
        }
        Ok(())
    }

    /// Asks the provider about a dynamic end for an auto-resolved reason.
    fn resolve_dynamic_end(
        &mut self,
        machine: &MachineId,
        decision: &ReasonDecision,
        sub: TimeRange,
    ) -> Result<DynamicOutcome, EngineError> {
        let (Some(reason), Some(at)) = (decision.reason.as_ref(), sub.lower()) else {
            return Ok(DynamicOutcome::Static);
        };
        let Some(response) = self.ctx.dynamic_end(machine, reason, at)? else {
            return Ok(DynamicOutcome::Static);
        };
        Ok(match response {
            DynamicEndResponse::Pending => DynamicOutcome::Pending,
            DynamicEndResponse::Hint(hint) => {
                let clipped = hint
                    .upper()
                    .and_then(|u| sub.intersection(&TimeRange::until(u)))
                    .unwrap_or(sub);
                DynamicOutcome::Clipped {
                    range: clipped,
                    provisional: true,
                }
            }
            DynamicEndResponse::Final(end) => {
                match sub.intersection(&TimeRange::until(end)) {
                    Some(clipped) => DynamicOutcome::Clipped {
                        range: clipped,
                        provisional: false,
                    },
                    // The reason ends before this segment starts.
                    None => DynamicOutcome::Void,
                }
            }
            DynamicEndResponse::NotApplicable => DynamicOutcome::Void,
        })
    }
}

/// How a dynamic-end response affects the segment being applied.
enum DynamicOutcome {
    /// No dynamic end; apply as resolved.
    Static,
    /// Retry on a later pass.
    Pending,
    /// Apply over the clipped range; `provisional` keeps the slot flagged.
    Clipped { range: TimeRange, provisional: bool },
    /// The auto reason is void; fall back without it.
    Void,
}
