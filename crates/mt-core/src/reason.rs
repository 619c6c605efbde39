//! Default reason resolution.
//!
//! Every reason slot carries exactly one reason. A manual assertion wins
//! outright; otherwise the highest-scoring applicable auto-reason candidate
//! replaces the current reason; otherwise the static
//! `(machine mode, observation state)` table supplies a default. When no
//! rule applies the slot is flagged `overwrite_required` and waits for a
//! later pass instead of failing.
//!
//! Auto reasons with a dynamic end go through a three-phase protocol:
//! a resolution request returns [`DynamicEndResponse::Pending`] (retry
//! later), a hint (provisional end, re-evaluate) or a final instant
//! (authoritative, stop retrying).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::range::TimeRange;
use crate::slot::ReasonState;
use crate::types::{MachineModeId, ObservationStateId, ReasonId, Score};

/// One row of the static default-reason table.
///
/// `observation_state` of `None` matches any state; rows with an explicit
/// state win over wildcard rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultReasonRule {
    pub machine_mode: MachineModeId,
    pub observation_state: Option<ObservationStateId>,
    pub reason: ReasonId,
    pub score: Score,
}

/// The static `(machine mode, observation state) -> reason` default table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefaultReasonTable {
    rules: Vec<DefaultReasonRule>,
}

impl DefaultReasonTable {
    /// Builds a table from rules; declaration order breaks ties within one
    /// specificity level.
    #[must_use]
    pub const fn new(rules: Vec<DefaultReasonRule>) -> Self {
        Self { rules }
    }

    /// True when the table holds no rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The default rule for a mode/state pair, most specific first.
    #[must_use]
    pub fn lookup(
        &self,
        machine_mode: &MachineModeId,
        observation_state: &ObservationStateId,
    ) -> Option<&DefaultReasonRule> {
        self.rules
            .iter()
            .find(|r| {
                r.machine_mode == *machine_mode
                    && r.observation_state.as_ref() == Some(observation_state)
            })
            .or_else(|| {
                self.rules
                    .iter()
                    .find(|r| r.machine_mode == *machine_mode && r.observation_state.is_none())
            })
    }
}

/// An explicit reason assertion entered by an operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasonAssertion {
    pub reason: ReasonId,
    pub score: Score,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ReasonAssertion {
    /// A manual assertion at the conventional manual score.
    #[must_use]
    pub const fn manual(reason: ReasonId) -> Self {
        Self {
            reason,
            score: Score::MANUAL,
            details: None,
        }
    }
}

/// When an auto-reason candidate may replace the reason already on a slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverridePolicy {
    /// Replace when the candidate's score is strictly above the slot's.
    #[default]
    ScoreAbove,
    /// Always replace.
    Always,
    /// Never replace an already-set reason.
    Never,
}

impl OverridePolicy {
    fn accepts(self, candidate_score: Score, current: &ReasonState) -> bool {
        match self {
            Self::ScoreAbove => current.reason_score < candidate_score,
            Self::Always => true,
            Self::Never => current.reason.is_none(),
        }
    }
}

/// A reason proposed by an auto-reason extension for a machine.
///
/// `manual_score`, when present, is the score the candidate competes with
/// against manual assertions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoReasonCandidate {
    pub reason: ReasonId,
    pub score: Score,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_score: Option<Score>,
    #[serde(default)]
    pub can_override: OverridePolicy,
}

/// Where a resolved reason came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonSource {
    Manual,
    Auto,
    Default,
    /// The slot's existing manual/auto reason survived re-evaluation.
    Kept,
    /// No rule applied; the slot stays flagged for re-evaluation.
    Unresolved,
}

/// The outcome of a resolution pass over one slot.
#[derive(Debug, Clone, PartialEq)]
pub struct ReasonDecision {
    pub reason: Option<ReasonId>,
    pub score: Score,
    pub default_reason: bool,
    pub overwrite_required: bool,
    pub source: ReasonSource,
}

/// Answer of a dynamic end-time resolution request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DynamicEndResponse {
    /// Not enough information yet; retry on a later pass.
    Pending,
    /// A provisional bound; apply it but re-evaluate when asked again.
    Hint(TimeRange),
    /// The authoritative end; no further retries.
    Final(DateTime<Utc>),
    /// The request will never resolve; fall back to the default reason.
    NotApplicable,
}

/// Resolves the reason for a slot.
///
/// Priority: a manual assertion wins (candidates only beat it through a
/// `manual_score` strictly above the assertion's score); then the
/// highest-scoring applicable candidate, first declared on ties; then the
/// static default table. An empty outcome flags the slot instead of
/// failing.
#[must_use]
pub fn resolve(
    current: &ReasonState,
    manual: Option<&ReasonAssertion>,
    candidates: &[AutoReasonCandidate],
    table: &DefaultReasonTable,
) -> ReasonDecision {
    if let Some(assertion) = manual {
        // An auto candidate only displaces a manual reason when it carries
        // a manual score above the assertion's.
        let challenger = candidates
            .iter()
            .filter(|c| c.manual_score.is_some_and(|ms| ms > assertion.score))
            .max_by(|a, b| {
                a.manual_score
                    .partial_cmp(&b.manual_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        if let Some(winner) = challenger {
            return ReasonDecision {
                reason: Some(winner.reason.clone()),
                score: winner.manual_score.unwrap_or(winner.score),
                default_reason: false,
                overwrite_required: false,
                source: ReasonSource::Auto,
            };
        }
        return ReasonDecision {
            reason: Some(assertion.reason.clone()),
            score: assertion.score,
            default_reason: false,
            overwrite_required: false,
            source: ReasonSource::Manual,
        };
    }

    let mut best: Option<&AutoReasonCandidate> = None;
    for candidate in candidates {
        if !candidate.can_override.accepts(candidate.score, current) {
            continue;
        }
        // Strictly-greater keeps the first declared candidate on ties.
        if best.is_none_or(|b| b.score < candidate.score) {
            best = Some(candidate);
        }
    }
    if let Some(winner) = best {
        return ReasonDecision {
            reason: Some(winner.reason.clone()),
            score: winner.score,
            default_reason: false,
            overwrite_required: false,
            source: ReasonSource::Auto,
        };
    }

    if current.reason.is_some() && !current.default_reason {
        // An existing manual/auto reason is never downgraded to a default.
        return ReasonDecision {
            reason: current.reason.clone(),
            score: current.reason_score,
            default_reason: false,
            overwrite_required: current.overwrite_required,
            source: ReasonSource::Kept,
        };
    }

    if let Some(rule) = table.lookup(&current.machine_mode, &current.observation_state) {
        return ReasonDecision {
            reason: Some(rule.reason.clone()),
            score: rule.score,
            default_reason: true,
            overwrite_required: false,
            source: ReasonSource::Default,
        };
    }

    tracing::warn!(
        machine_mode = %current.machine_mode,
        observation_state = %current.observation_state,
        "no reason rule applies, flagging slot for re-evaluation"
    );
    ReasonDecision {
        reason: None,
        score: Score::new(0.0).expect("zero is a valid score"),
        default_reason: true,
        overwrite_required: true,
        source: ReasonSource::Unresolved,
    }
}
