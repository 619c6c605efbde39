//! Temporal slot engine for machine monitoring.
//!
//! This crate contains the fundamental types and logic for:
//! - Ranges and slots: half-open intervals carrying per-kind state bundles
//! - Partition reconciliation: splitting, merging and coalescing slots when
//!   a state assertion arrives
//! - Template expansion: turning day/shift templates into concrete slots
//! - Reason resolution: manual assertions, auto-reason candidates and the
//!   static default table
//! - Cascading analysis: the ordered re-derivation of dependent partitions
//!   and duration summaries per change event

pub mod accumulator;
pub mod analysis;
pub mod partition;
pub mod range;
pub mod reason;
pub mod repository;
pub mod slot;
pub mod template;
pub mod types;

pub use accumulator::{AccumulatorValue, RangeValueAccumulator};
pub use analysis::{
    AnalysisConfig, AnalysisDriver, AnalysisStatus, EngineError, Modification, ModificationKind,
};
pub use partition::{
    Assertion, PartitionError, ReplacementPlan, apply, check_ordering, check_partition, coalesce,
};
pub use range::{RangeError, TimeRange};
pub use reason::{
    AutoReasonCandidate, DefaultReasonRule, DefaultReasonTable, DynamicEndResponse,
    OverridePolicy, ReasonAssertion, ReasonDecision, ReasonSource, resolve,
};
pub use repository::{
    AnalysisLogSink, AutoReasonProvider, CatalogLookup, LogEntry, MemoryLogSink, RepositoryError,
    Severity, SlotRepository, SummaryCategory, SummaryStore,
};
pub use slot::{DayState, ObservationStateBundle, ReasonState, ShiftState, Slot, SlotState};
pub use template::{
    CancelToken, Expansion, Template, TemplateConfig, TemplateItem, WeekDays, adjust_to_day_begin,
    expand_days, expand_shifts, normalize_cut_off,
};
pub use types::{
    MachineId, MachineMode, MachineModeId, ObservationState, ObservationStateId, Reason, ReasonId,
    Score, Shift, ShiftId, TemplateId, ValidationError,
};
