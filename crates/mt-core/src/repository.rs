//! Boundary contracts implemented by the persistence layer.
//!
//! The engine never touches storage directly: it reads and writes slots,
//! catalog handles, summaries and log entries through these traits. All
//! calls are synchronous and treated as O(1) lookups by the algorithms;
//! batching and caching belong to the implementor.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::range::TimeRange;
use crate::reason::{AutoReasonCandidate, DynamicEndResponse};
use crate::slot::{Slot, SlotState};
use crate::template::Template;
use crate::types::{
    MachineId, MachineMode, MachineModeId, ObservationState, ObservationStateId, Reason, ReasonId,
    Shift, ShiftId, TemplateId,
};

/// A storage failure surfaced through a boundary trait.
///
/// Implementors wrap their native error; the engine treats any repository
/// failure as fatal for the current pass.
#[derive(Debug, Error)]
#[error("repository failure: {message}")]
pub struct RepositoryError {
    message: String,
}

impl RepositoryError {
    /// Wraps an implementation-specific failure.
    pub fn new(source: impl std::fmt::Display) -> Self {
        Self {
            message: source.to_string(),
        }
    }
}

/// Slot persistence for one partition kind.
pub trait SlotRepository<S: SlotState> {
    /// The machine's slots overlapping `range`, sorted by range.
    fn find_overlapping(
        &self,
        machine: &MachineId,
        range: &TimeRange,
    ) -> Result<Vec<Slot<S>>, RepositoryError>;

    /// Persists a slot.
    fn save(&mut self, slot: &Slot<S>) -> Result<(), RepositoryError>;

    /// Removes a previously persisted slot.
    fn delete(&mut self, slot: &Slot<S>) -> Result<(), RepositoryError>;
}

/// Catalog lookups returning immutable value handles.
///
/// A missing id is `Ok(None)`; only storage failures are errors.
pub trait CatalogLookup {
    fn machine_mode(&self, id: &MachineModeId) -> Result<Option<MachineMode>, RepositoryError>;
    fn observation_state(
        &self,
        id: &ObservationStateId,
    ) -> Result<Option<ObservationState>, RepositoryError>;
    fn reason(&self, id: &ReasonId) -> Result<Option<Reason>, RepositoryError>;
    fn shift(&self, id: &ShiftId) -> Result<Option<Shift>, RepositoryError>;
    fn day_template(&self, id: &TemplateId) -> Result<Option<Template>, RepositoryError>;
    fn shift_template(&self, id: &TemplateId) -> Result<Option<Template>, RepositoryError>;
}

/// Auto-reason candidates supplied by the extension registry.
pub trait AutoReasonProvider {
    /// The candidates applicable to a machine, in declaration order
    /// (declaration order breaks score ties).
    fn candidates(&self, machine: &MachineId) -> Result<Vec<AutoReasonCandidate>, RepositoryError>;

    /// Resolves the dynamic end of an auto reason starting at `at`.
    ///
    /// `Ok(None)` means the reason has no dynamic end at all (the common
    /// case); `Some(NotApplicable)` means the dynamic resolution is void
    /// and the reason must not be applied.
    fn dynamic_end(
        &mut self,
        machine: &MachineId,
        reason: &ReasonId,
        at: DateTime<Utc>,
    ) -> Result<Option<DynamicEndResponse>, RepositoryError>;
}

/// Severity of an analysis log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Append-only diagnostic record; observability, never authoritative state.
pub trait AnalysisLogSink {
    fn record(&mut self, severity: Severity, message: &str, context: serde_json::Value);
}

/// One recorded analysis log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub severity: Severity,
    pub message: String,
    pub context: serde_json::Value,
}

/// An in-memory log sink for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    pub entries: Vec<LogEntry>,
}

impl AnalysisLogSink for MemoryLogSink {
    fn record(&mut self, severity: Severity, message: &str, context: serde_json::Value) {
        self.entries.push(LogEntry {
            severity,
            message: message.to_string(),
            context,
        });
    }
}

/// Duration summary category of a reason slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryCategory {
    /// The machine mode reports the machine running.
    Running,
    /// Not running while the machine is observed.
    Stopped,
    /// Not running and nobody is watching production.
    Unattended,
}

impl SummaryCategory {
    /// Classifies a mode/state pair.
    #[must_use]
    pub const fn classify(mode: &MachineMode, state: &ObservationState) -> Self {
        match mode.running {
            Some(true) => Self::Running,
            _ => {
                if state.production {
                    Self::Stopped
                } else {
                    Self::Unattended
                }
            }
        }
    }

    /// Stable string form for storage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Unattended => "unattended",
        }
    }
}

/// Persistence of per-day duration summaries.
pub trait SummaryStore {
    /// Folds a net duration delta over `range` into the stored summary
    /// rows of `(machine, category)`.
    fn store_summary(
        &mut self,
        machine: &MachineId,
        category: SummaryCategory,
        range: &TimeRange,
        delta: Duration,
    ) -> Result<(), RepositoryError>;
}
