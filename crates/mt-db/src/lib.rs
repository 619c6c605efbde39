//! Storage layer for the machine monitoring slot engine.
//!
//! Provides persistence for slots, catalog entities, the modification
//! queue, per-day summaries and the analysis log using `rusqlite`, and
//! implements the `mt-core` boundary traits on top of it.
//!
//! # Thread Safety
//!
//! The [`Database`] type wraps a `rusqlite::Connection`, which is `Send` but
//! not `Sync`: one instance per thread, or external synchronization. The
//! engine's contract already serializes passes per machine, so a single
//! connection per analysis process is the normal setup.
//!
//! # Schema
//!
//! Timestamps are stored as TEXT in ISO 8601 (`2024-01-15T10:30:00.000Z`);
//! lexicographic ordering matches chronological ordering, which the overlap
//! queries rely on. A `NULL` slot bound means an unbounded end. Slot state
//! bundles and modification kinds are JSON payloads; evolving them follows
//! the usual rules (adding fields is safe, removing or renaming needs a
//! migration).

use std::path::Path;

use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, Utc};
use rusqlite::{Connection, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use uuid::Uuid;

use mt_core::analysis::{AnalysisStatus, Modification, ModificationKind};
use mt_core::range::TimeRange;
use mt_core::reason::{
    AutoReasonCandidate, DefaultReasonRule, DefaultReasonTable, DynamicEndResponse, OverridePolicy,
};
use mt_core::repository::{
    AnalysisLogSink, AutoReasonProvider, CatalogLookup, RepositoryError, Severity, SlotRepository,
    SummaryCategory, SummaryStore,
};
use mt_core::slot::{DayState, ObservationStateBundle, ReasonState, ShiftState, Slot, SlotState};
use mt_core::template::{Template, TemplateItem};
use mt_core::types::{
    MachineId, MachineMode, MachineModeId, ObservationState, ObservationStateId, Reason, ReasonId,
    Score, Shift, ShiftId, TemplateId, ValidationError,
};

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// An error from the underlying database.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored timestamp failed to parse.
    #[error("invalid timestamp {value}")]
    TimestampParse {
        value: String,
        #[source]
        source: chrono::ParseError,
    },

    /// A stored JSON payload failed to parse.
    #[error("invalid stored payload: {0}")]
    PayloadParse(#[from] serde_json::Error),

    /// A stored identifier failed validation.
    #[error("invalid stored identifier: {0}")]
    InvalidId(#[from] ValidationError),

    /// A stored enum value was not recognized.
    #[error("invalid stored value: {value}")]
    InvalidValue { value: String },
}

/// The kind of a stored template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    Day,
    Shift,
}

impl TemplateKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Shift => "shift",
        }
    }
}

/// A per-day duration summary row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryRow {
    pub machine: MachineId,
    pub category: SummaryCategory,
    pub day: NaiveDate,
    pub duration_ms: i64,
}

/// A stored analysis log row.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisLogRow {
    pub at: DateTime<Utc>,
    pub severity: Severity,
    pub message: String,
    pub context: serde_json::Value,
}

/// A stored auto-reason candidate row.
#[derive(Debug, Clone, PartialEq)]
pub struct AutoReasonRow {
    /// `None` applies to every machine.
    pub machine: Option<MachineId>,
    pub candidate: AutoReasonCandidate,
}

/// Database connection wrapper.
///
/// See the [module documentation](self) for thread safety considerations.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database at the given path, creating it if necessary.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Opens an in-memory database.
    ///
    /// Useful for testing. The database is destroyed when the connection
    /// closes.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Initializes the database schema.
    ///
    /// This is idempotent - safe to call on an already-initialized database.
    fn init(&self) -> Result<(), DbError> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS machines (
                id TEXT PRIMARY KEY,
                name TEXT
            );

            CREATE TABLE IF NOT EXISTS machine_modes (
                id TEXT PRIMARY KEY,
                running INTEGER,
                auto INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS observation_states (
                id TEXT PRIMARY KEY,
                shift_required INTEGER NOT NULL DEFAULT 0,
                production INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS reasons (
                id TEXT PRIMARY KEY,
                code TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS shifts (
                id TEXT PRIMARY KEY,
                code TEXT NOT NULL
            );

            -- items: JSON array of template rules
            CREATE TABLE IF NOT EXISTS templates (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL CHECK (kind IN ('day', 'shift')),
                items TEXT NOT NULL
            );

            -- Slot tables: one per partition kind.
            -- lower/upper: ISO 8601 or NULL for an unbounded end
            -- state: JSON state bundle
            CREATE TABLE IF NOT EXISTS observation_slots (
                machine_id TEXT NOT NULL REFERENCES machines(id),
                lower TEXT,
                upper TEXT,
                state TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_observation_slots_machine
                ON observation_slots(machine_id, lower);

            CREATE TABLE IF NOT EXISTS reason_slots (
                machine_id TEXT NOT NULL REFERENCES machines(id),
                lower TEXT,
                upper TEXT,
                state TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_reason_slots_machine
                ON reason_slots(machine_id, lower);

            CREATE TABLE IF NOT EXISTS day_slots (
                machine_id TEXT NOT NULL REFERENCES machines(id),
                lower TEXT,
                upper TEXT,
                state TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_day_slots_machine
                ON day_slots(machine_id, lower);

            CREATE TABLE IF NOT EXISTS shift_slots (
                machine_id TEXT NOT NULL REFERENCES machines(id),
                lower TEXT,
                upper TEXT,
                state TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_shift_slots_machine
                ON shift_slots(machine_id, lower);

            -- kind: JSON modification payload
            CREATE TABLE IF NOT EXISTS modifications (
                id TEXT PRIMARY KEY,
                machine_id TEXT NOT NULL REFERENCES machines(id),
                kind TEXT NOT NULL,
                lower TEXT,
                upper TEXT,
                synchronous INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                retries INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_modifications_status
                ON modifications(status, created_at);

            CREATE TABLE IF NOT EXISTS summaries (
                machine_id TEXT NOT NULL REFERENCES machines(id),
                category TEXT NOT NULL,
                day TEXT NOT NULL,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (machine_id, category, day)
            );

            CREATE TABLE IF NOT EXISTS default_reasons (
                machine_mode_id TEXT NOT NULL REFERENCES machine_modes(id),
                observation_state_id TEXT REFERENCES observation_states(id),
                reason_id TEXT NOT NULL REFERENCES reasons(id),
                score REAL NOT NULL,
                position INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS auto_reasons (
                machine_id TEXT REFERENCES machines(id),
                reason_id TEXT NOT NULL REFERENCES reasons(id),
                score REAL NOT NULL,
                manual_score REAL,
                can_override TEXT NOT NULL DEFAULT 'score_above',
                position INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS analysis_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                at TEXT NOT NULL,
                severity TEXT NOT NULL,
                message TEXT NOT NULL,
                context TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_analysis_log_at ON analysis_log(at);
            ",
        )?;
        Ok(())
    }

    // ===== Catalog =====

    /// Inserts or updates a machine.
    pub fn upsert_machine(&mut self, id: &MachineId, name: Option<&str>) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO machines (id, name) VALUES (?, ?)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name",
            params![id.as_str(), name],
        )?;
        Ok(())
    }

    /// Lists machine ids.
    pub fn list_machines(&self) -> Result<Vec<MachineId>, DbError> {
        let mut stmt = self.conn.prepare("SELECT id FROM machines ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut machines = Vec::new();
        for row in rows {
            machines.push(MachineId::new(row?)?);
        }
        Ok(machines)
    }

    /// Inserts or updates a machine mode.
    pub fn upsert_machine_mode(&mut self, mode: &MachineMode) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO machine_modes (id, running, auto) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET running = excluded.running, auto = excluded.auto",
            params![mode.id.as_str(), mode.running, mode.auto],
        )?;
        Ok(())
    }

    /// Inserts or updates an observation state.
    pub fn upsert_observation_state(&mut self, state: &ObservationState) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO observation_states (id, shift_required, production) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                shift_required = excluded.shift_required,
                production = excluded.production",
            params![state.id.as_str(), state.shift_required, state.production],
        )?;
        Ok(())
    }

    /// Inserts or updates a reason.
    pub fn upsert_reason(&mut self, reason: &Reason) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO reasons (id, code) VALUES (?, ?)
             ON CONFLICT(id) DO UPDATE SET code = excluded.code",
            params![reason.id.as_str(), reason.code],
        )?;
        Ok(())
    }

    /// Inserts or updates a shift.
    pub fn upsert_shift(&mut self, shift: &Shift) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO shifts (id, code) VALUES (?, ?)
             ON CONFLICT(id) DO UPDATE SET code = excluded.code",
            params![shift.id.as_str(), shift.code],
        )?;
        Ok(())
    }

    /// Inserts or updates a template.
    pub fn upsert_template(
        &mut self,
        kind: TemplateKind,
        template: &Template,
    ) -> Result<(), DbError> {
        let items = serde_json::to_string(&template.items)?;
        self.conn.execute(
            "INSERT INTO templates (id, kind, items) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET kind = excluded.kind, items = excluded.items",
            params![template.id.as_str(), kind.as_str(), items],
        )?;
        Ok(())
    }

    fn template_by_kind(
        &self,
        id: &TemplateId,
        kind: TemplateKind,
    ) -> Result<Option<Template>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT items FROM templates WHERE id = ? AND kind = ?")?;
        let mut rows = stmt.query(params![id.as_str(), kind.as_str()])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let items: String = row.get(0)?;
        let items: Vec<TemplateItem> = serde_json::from_str(&items)?;
        Ok(Some(Template {
            id: id.clone(),
            items,
        }))
    }

    // ===== Default reasons =====

    /// Registers a default-reason rule, appended after the existing ones.
    pub fn insert_default_reason(&mut self, rule: &DefaultReasonRule) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO default_reasons
                (machine_mode_id, observation_state_id, reason_id, score, position)
             VALUES (?, ?, ?, ?,
                (SELECT COALESCE(MAX(position), 0) + 1 FROM default_reasons))",
            params![
                rule.machine_mode.as_str(),
                rule.observation_state.as_ref().map(ObservationStateId::as_str),
                rule.reason.as_str(),
                rule.score.value(),
            ],
        )?;
        Ok(())
    }

    /// Loads the static default-reason table in declaration order.
    pub fn default_reason_table(&self) -> Result<DefaultReasonTable, DbError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT machine_mode_id, observation_state_id, reason_id, score
            FROM default_reasons
            ORDER BY position ASC
            ",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, f64>(3)?,
            ))
        })?;
        let mut rules = Vec::new();
        for row in rows {
            let (machine_mode, observation_state, reason, score) = row?;
            rules.push(DefaultReasonRule {
                machine_mode: MachineModeId::new(machine_mode)?,
                observation_state: observation_state.map(ObservationStateId::new).transpose()?,
                reason: ReasonId::new(reason)?,
                score: Score::new(score).map_err(DbError::InvalidId)?,
            });
        }
        Ok(DefaultReasonTable::new(rules))
    }

    // ===== Auto reasons =====

    /// Registers an auto-reason candidate, appended after the existing ones.
    pub fn insert_auto_reason(&mut self, row: &AutoReasonRow) -> Result<(), DbError> {
        let can_override = match row.candidate.can_override {
            OverridePolicy::ScoreAbove => "score_above",
            OverridePolicy::Always => "always",
            OverridePolicy::Never => "never",
        };
        self.conn.execute(
            "INSERT INTO auto_reasons
                (machine_id, reason_id, score, manual_score, can_override, position)
             VALUES (?, ?, ?, ?, ?,
                (SELECT COALESCE(MAX(position), 0) + 1 FROM auto_reasons))",
            params![
                row.machine.as_ref().map(MachineId::as_str),
                row.candidate.reason.as_str(),
                row.candidate.score.value(),
                row.candidate.manual_score.map(Score::value),
                can_override,
            ],
        )?;
        Ok(())
    }

    fn auto_reason_candidates(
        &self,
        machine: &MachineId,
    ) -> Result<Vec<AutoReasonCandidate>, DbError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT reason_id, score, manual_score, can_override
            FROM auto_reasons
            WHERE machine_id IS NULL OR machine_id = ?
            ORDER BY position ASC
            ",
        )?;
        let rows = stmt.query_map([machine.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, Option<f64>>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut candidates = Vec::new();
        for row in rows {
            let (reason, score, manual_score, can_override) = row?;
            let can_override = match can_override.as_str() {
                "score_above" => OverridePolicy::ScoreAbove,
                "always" => OverridePolicy::Always,
                "never" => OverridePolicy::Never,
                other => {
                    return Err(DbError::InvalidValue {
                        value: other.to_string(),
                    });
                }
            };
            candidates.push(AutoReasonCandidate {
                reason: ReasonId::new(reason)?,
                score: Score::new(score).map_err(DbError::InvalidId)?,
                manual_score: manual_score
                    .map(Score::new)
                    .transpose()
                    .map_err(DbError::InvalidId)?,
                can_override,
            });
        }
        Ok(candidates)
    }

    // ===== Slots =====

    fn find_overlapping_slots<S>(
        &self,
        table: &str,
        machine: &MachineId,
        range: &TimeRange,
    ) -> Result<Vec<Slot<S>>, DbError>
    where
        S: SlotState + DeserializeOwned,
    {
        let lower = range.lower().map(format_timestamp);
        let upper = range.upper().map(format_timestamp);
        // Half-open overlap with NULL = unbounded; ISO 8601 strings order
        // like the instants they encode.
        let mut stmt = self.conn.prepare(&format!(
            "
            SELECT machine_id, lower, upper, state
            FROM {table}
            WHERE machine_id = ?1
              AND (upper IS NULL OR ?2 IS NULL OR upper > ?2)
              AND (lower IS NULL OR ?3 IS NULL OR lower < ?3)
            ORDER BY lower ASC
            "
        ))?;
        let rows = stmt.query_map(params![machine.as_str(), lower, upper], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut slots = Vec::new();
        for row in rows {
            let (machine_id, lower, upper, state) = row?;
            let range = parse_range(lower.as_deref(), upper.as_deref())?;
            let state: S = serde_json::from_str(&state)?;
            slots.push(Slot {
                machine: MachineId::new(machine_id)?,
                range,
                state,
            });
        }
        Ok(slots)
    }

    fn save_slot<S>(&mut self, table: &str, slot: &Slot<S>) -> Result<(), DbError>
    where
        S: SlotState + Serialize,
    {
        let state = serde_json::to_string(&slot.state)?;
        self.conn.execute(
            &format!("INSERT INTO {table} (machine_id, lower, upper, state) VALUES (?, ?, ?, ?)"),
            params![
                slot.machine.as_str(),
                slot.range.lower().map(format_timestamp),
                slot.range.upper().map(format_timestamp),
                state,
            ],
        )?;
        Ok(())
    }

    fn delete_slot<S>(&mut self, table: &str, slot: &Slot<S>) -> Result<(), DbError>
    where
        S: SlotState + Serialize,
    {
        let state = serde_json::to_string(&slot.state)?;
        let deleted = self.conn.execute(
            &format!(
                "DELETE FROM {table}
                 WHERE machine_id = ? AND lower IS ? AND upper IS ? AND state = ?"
            ),
            params![
                slot.machine.as_str(),
                slot.range.lower().map(format_timestamp),
                slot.range.upper().map(format_timestamp),
                state,
            ],
        )?;
        if deleted == 0 {
            tracing::warn!(table, machine = %slot.machine, range = %slot.range, "delete matched no slot");
        }
        Ok(())
    }

    // ===== Modifications =====

    /// Enqueues a modification.
    pub fn enqueue_modification(&mut self, modification: &Modification) -> Result<(), DbError> {
        let kind = serde_json::to_string(&modification.kind)?;
        self.conn.execute(
            "INSERT INTO modifications
                (id, machine_id, kind, lower, upper, synchronous, status, retries, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                modification.id.to_string(),
                modification.machine.as_str(),
                kind,
                modification.range.lower().map(format_timestamp),
                modification.range.upper().map(format_timestamp),
                modification.synchronous,
                modification.status.as_str(),
                modification.retries,
                format_timestamp(Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Writes back a modification's status and retry count.
    pub fn update_modification(&mut self, modification: &Modification) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE modifications SET status = ?, retries = ? WHERE id = ?",
            params![
                modification.status.as_str(),
                modification.retries,
                modification.id.to_string(),
            ],
        )?;
        Ok(())
    }

    /// The runnable modifications in creation order, oldest first.
    pub fn runnable_modifications(&self) -> Result<Vec<Modification>, DbError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT id, machine_id, kind, lower, upper, synchronous, status, retries
            FROM modifications
            WHERE status IN ('pending', 'in_progress')
            ORDER BY created_at ASC, id ASC
            ",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, bool>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, u32>(7)?,
            ))
        })?;
        let mut modifications = Vec::new();
        for row in rows {
            let (id, machine, kind, lower, upper, synchronous, status, retries) = row?;
            let kind: ModificationKind = serde_json::from_str(&kind)?;
            modifications.push(Modification {
                id: Uuid::parse_str(&id).map_err(|_| DbError::InvalidValue { value: id })?,
                machine: MachineId::new(machine)?,
                kind,
                range: parse_range(lower.as_deref(), upper.as_deref())?,
                synchronous,
                status: status
                    .parse::<AnalysisStatus>()
                    .map_err(|value| DbError::InvalidValue { value })?,
                retries,
            });
        }
        Ok(modifications)
    }

    /// Counts modifications per status string.
    pub fn modification_counts(&self) -> Result<Vec<(String, i64)>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT status, COUNT(*) FROM modifications GROUP BY status ORDER BY status ASC",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut counts = Vec::new();
        for row in rows {
            counts.push(row?);
        }
        Ok(counts)
    }

    /// Deletes completed modifications created before `before`.
    pub fn purge_done_modifications(&mut self, before: DateTime<Utc>) -> Result<usize, DbError> {
        let purged = self.conn.execute(
            "DELETE FROM modifications WHERE status = 'done' AND created_at < ?",
            params![format_timestamp(before)],
        )?;
        Ok(purged)
    }

    // ===== Summaries =====

    /// Summary rows for one machine, ordered by day then category.
    pub fn summaries(&self, machine: &MachineId) -> Result<Vec<SummaryRow>, DbError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT machine_id, category, day, duration_ms
            FROM summaries
            WHERE machine_id = ? AND duration_ms != 0
            ORDER BY day ASC, category ASC
            ",
        )?;
        let rows = stmt.query_map([machine.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;
        let mut summaries = Vec::new();
        for row in rows {
            let (machine_id, category, day, duration_ms) = row?;
            summaries.push(SummaryRow {
                machine: MachineId::new(machine_id)?,
                category: parse_category(&category)?,
                day: day
                    .parse()
                    .map_err(|_| DbError::InvalidValue { value: day })?,
                duration_ms,
            });
        }
        Ok(summaries)
    }

    // ===== Analysis log =====

    /// Analysis log rows, oldest first, optionally filtered by severity.
    pub fn analysis_log(
        &self,
        min_severity: Option<Severity>,
    ) -> Result<Vec<AnalysisLogRow>, DbError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT at, severity, message, context
            FROM analysis_log
            ORDER BY at ASC, id ASC
            ",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            let (at, severity, message, context) = row?;
            let severity = parse_severity(&severity)?;
            if let Some(min) = min_severity {
                if severity_rank(severity) < severity_rank(min) {
                    continue;
                }
            }
            entries.push(AnalysisLogRow {
                at: parse_timestamp(&at)?,
                severity,
                message,
                context: serde_json::from_str(&context)?,
            });
        }
        Ok(entries)
    }
}

// ===== Boundary trait implementations =====

impl SlotRepository<ObservationStateBundle> for Database {
    fn find_overlapping(
        &self,
        machine: &MachineId,
        range: &TimeRange,
    ) -> Result<Vec<Slot<ObservationStateBundle>>, RepositoryError> {
        self.find_overlapping_slots("observation_slots", machine, range)
            .map_err(RepositoryError::new)
    }

    fn save(&mut self, slot: &Slot<ObservationStateBundle>) -> Result<(), RepositoryError> {
        self.save_slot("observation_slots", slot)
            .map_err(RepositoryError::new)
    }

    fn delete(&mut self, slot: &Slot<ObservationStateBundle>) -> Result<(), RepositoryError> {
        self.delete_slot("observation_slots", slot)
            .map_err(RepositoryError::new)
    }
}

impl SlotRepository<ReasonState> for Database {
    fn find_overlapping(
        &self,
        machine: &MachineId,
        range: &TimeRange,
    ) -> Result<Vec<Slot<ReasonState>>, RepositoryError> {
        self.find_overlapping_slots("reason_slots", machine, range)
            .map_err(RepositoryError::new)
    }

    fn save(&mut self, slot: &Slot<ReasonState>) -> Result<(), RepositoryError> {
        self.save_slot("reason_slots", slot)
            .map_err(RepositoryError::new)
    }

    fn delete(&mut self, slot: &Slot<ReasonState>) -> Result<(), RepositoryError> {
        self.delete_slot("reason_slots", slot)
            .map_err(RepositoryError::new)
    }
}

impl SlotRepository<DayState> for Database {
    fn find_overlapping(
        &self,
        machine: &MachineId,
        range: &TimeRange,
    ) -> Result<Vec<Slot<DayState>>, RepositoryError> {
        self.find_overlapping_slots("day_slots", machine, range)
            .map_err(RepositoryError::new)
    }

    fn save(&mut self, slot: &Slot<DayState>) -> Result<(), RepositoryError> {
        self.save_slot("day_slots", slot)
            .map_err(RepositoryError::new)
    }

    fn delete(&mut self, slot: &Slot<DayState>) -> Result<(), RepositoryError> {
        self.delete_slot("day_slots", slot)
            .map_err(RepositoryError::new)
    }
}

impl SlotRepository<ShiftState> for Database {
    fn find_overlapping(
        &self,
        machine: &MachineId,
        range: &TimeRange,
    ) -> Result<Vec<Slot<ShiftState>>, RepositoryError> {
        self.find_overlapping_slots("shift_slots", machine, range)
            .map_err(RepositoryError::new)
    }

    fn save(&mut self, slot: &Slot<ShiftState>) -> Result<(), RepositoryError> {
        self.save_slot("shift_slots", slot)
            .map_err(RepositoryError::new)
    }

    fn delete(&mut self, slot: &Slot<ShiftState>) -> Result<(), RepositoryError> {
        self.delete_slot("shift_slots", slot)
            .map_err(RepositoryError::new)
    }
}

impl CatalogLookup for Database {
    fn machine_mode(&self, id: &MachineModeId) -> Result<Option<MachineMode>, RepositoryError> {
        let mut stmt = self
            .conn
            .prepare("SELECT running, auto FROM machine_modes WHERE id = ?")
            .map_err(RepositoryError::new)?;
        let mut rows = stmt
            .query(params![id.as_str()])
            .map_err(RepositoryError::new)?;
        let Some(row) = rows.next().map_err(RepositoryError::new)? else {
            return Ok(None);
        };
        Ok(Some(MachineMode {
            id: id.clone(),
            running: row.get(0).map_err(RepositoryError::new)?,
            auto: row.get(1).map_err(RepositoryError::new)?,
        }))
    }

    fn observation_state(
        &self,
        id: &ObservationStateId,
    ) -> Result<Option<ObservationState>, RepositoryError> {
        let mut stmt = self
            .conn
            .prepare("SELECT shift_required, production FROM observation_states WHERE id = ?")
            .map_err(RepositoryError::new)?;
        let mut rows = stmt
            .query(params![id.as_str()])
            .map_err(RepositoryError::new)?;
        let Some(row) = rows.next().map_err(RepositoryError::new)? else {
            return Ok(None);
        };
        Ok(Some(ObservationState {
            id: id.clone(),
            shift_required: row.get(0).map_err(RepositoryError::new)?,
            production: row.get(1).map_err(RepositoryError::new)?,
        }))
    }

    fn reason(&self, id: &ReasonId) -> Result<Option<Reason>, RepositoryError> {
        let mut stmt = self
            .conn
            .prepare("SELECT code FROM reasons WHERE id = ?")
            .map_err(RepositoryError::new)?;
        let mut rows = stmt
            .query(params![id.as_str()])
            .map_err(RepositoryError::new)?;
        let Some(row) = rows.next().map_err(RepositoryError::new)? else {
            return Ok(None);
        };
        Ok(Some(Reason {
            id: id.clone(),
            code: row.get(0).map_err(RepositoryError::new)?,
        }))
    }

    fn shift(&self, id: &ShiftId) -> Result<Option<Shift>, RepositoryError> {
        let mut stmt = self
            .conn
            .prepare("SELECT code FROM shifts WHERE id = ?")
            .map_err(RepositoryError::new)?;
        let mut rows = stmt
            .query(params![id.as_str()])
            .map_err(RepositoryError::new)?;
        let Some(row) = rows.next().map_err(RepositoryError::new)? else {
            return Ok(None);
        };
        Ok(Some(Shift {
            id: id.clone(),
            code: row.get(0).map_err(RepositoryError::new)?,
        }))
    }

    fn day_template(&self, id: &TemplateId) -> Result<Option<Template>, RepositoryError> {
        self.template_by_kind(id, TemplateKind::Day)
            .map_err(RepositoryError::new)
    }

    fn shift_template(&self, id: &TemplateId) -> Result<Option<Template>, RepositoryError> {
        self.template_by_kind(id, TemplateKind::Shift)
            .map_err(RepositoryError::new)
    }
}

impl AutoReasonProvider for Database {
    fn candidates(&self, machine: &MachineId) -> Result<Vec<AutoReasonCandidate>, RepositoryError> {
        self.auto_reason_candidates(machine)
            .map_err(RepositoryError::new)
    }

    fn dynamic_end(
        &mut self,
        _machine: &MachineId,
        _reason: &ReasonId,
        _at: DateTime<Utc>,
    ) -> Result<Option<DynamicEndResponse>, RepositoryError> {
        // Stored candidates have static bounds; dynamic ends come from the
        // extension registry, which the storage layer does not host.
        Ok(None)
    }
}

impl AnalysisLogSink for Database {
    fn record(&mut self, severity: Severity, message: &str, context: serde_json::Value) {
        // The log is pure observability; a failed insert must not abort the
        // analysis pass.
        let result = self.conn.execute(
            "INSERT INTO analysis_log (at, severity, message, context) VALUES (?, ?, ?, ?)",
            params![
                format_timestamp(Utc::now()),
                severity.to_string(),
                message,
                context.to_string(),
            ],
        );
        if let Err(e) = result {
            tracing::error!(error = %e, message, "failed to append analysis log entry");
        }
    }
}

impl SummaryStore for Database {
    fn store_summary(
        &mut self,
        machine: &MachineId,
        category: SummaryCategory,
        range: &TimeRange,
        delta: Duration,
    ) -> Result<(), RepositoryError> {
        // Summaries are per-day rows keyed by the day the range starts in.
        let Some(lower) = range.lower() else {
            tracing::warn!(machine = %machine, range = %range, "unbounded summary range skipped");
            return Ok(());
        };
        let day = lower.date_naive().to_string();
        self.conn
            .execute(
                "INSERT INTO summaries (machine_id, category, day, duration_ms)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(machine_id, category, day)
                 DO UPDATE SET duration_ms = duration_ms + excluded.duration_ms",
                params![
                    machine.as_str(),
                    category.as_str(),
                    day,
                    delta.num_milliseconds(),
                ],
            )
            .map_err(RepositoryError::new)?;
        Ok(())
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|source| DbError::TimestampParse {
            value: value.to_string(),
            source,
        })
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_range(lower: Option<&str>, upper: Option<&str>) -> Result<TimeRange, DbError> {
    let lower = lower.map(parse_timestamp).transpose()?;
    let upper = upper.map(parse_timestamp).transpose()?;
    TimeRange::new(lower, upper).map_err(|e| DbError::InvalidValue {
        value: e.to_string(),
    })
}

fn parse_category(value: &str) -> Result<SummaryCategory, DbError> {
    match value {
        "running" => Ok(SummaryCategory::Running),
        "stopped" => Ok(SummaryCategory::Stopped),
        "unattended" => Ok(SummaryCategory::Unattended),
        other => Err(DbError::InvalidValue {
            value: other.to_string(),
        }),
    }
}

fn parse_severity(value: &str) -> Result<Severity, DbError> {
    match value {
        "info" => Ok(Severity::Info),
        "warn" => Ok(Severity::Warn),
        "error" => Ok(Severity::Error),
        other => Err(DbError::InvalidValue {
            value: other.to_string(),
        }),
    }
}

const fn severity_rank(severity: Severity) -> u8 {
    match severity {
        Severity::Info => 0,
        Severity::Warn => 1,
        Severity::Error => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mt_core::analysis::{AnalysisConfig, AnalysisDriver};
    use mt_core::reason::ReasonAssertion;
    use mt_core::repository::MemoryLogSink;

    fn ts(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 9, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn r(lo: i64, up: i64) -> TimeRange {
        TimeRange::between(ts(lo), ts(up)).unwrap()
    }

    fn machine() -> MachineId {
        MachineId::new("m-1").unwrap()
    }

    fn attended() -> ObservationStateBundle {
        ObservationStateBundle {
            observation_state: ObservationStateId::new("attended").unwrap(),
            shift: None,
            template: None,
        }
    }

    fn seeded_db() -> Database {
        let mut db = Database::open_in_memory().unwrap();
        db.upsert_machine(&machine(), Some("Mill 1")).unwrap();
        db.upsert_machine_mode(&MachineMode {
            id: MachineModeId::new("active").unwrap(),
            running: Some(true),
            auto: true,
        })
        .unwrap();
        db.upsert_machine_mode(&MachineMode {
            id: MachineModeId::new("idle").unwrap(),
            running: Some(false),
            auto: true,
        })
        .unwrap();
        db.upsert_observation_state(&ObservationState {
            id: ObservationStateId::new("attended").unwrap(),
            shift_required: false,
            production: true,
        })
        .unwrap();
        db.upsert_reason(&Reason {
            id: ReasonId::new("idle-default").unwrap(),
            code: "IDL".to_string(),
        })
        .unwrap();
        db.upsert_reason(&Reason {
            id: ReasonId::new("maintenance").unwrap(),
            code: "MNT".to_string(),
        })
        .unwrap();
        db
    }

    #[test]
    fn open_in_memory_database() {
        let db = Database::open_in_memory();
        assert!(db.is_ok());
    }

    #[test]
    fn open_on_disk_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mt.db");
        drop(Database::open(&path).unwrap());
        // Re-opening runs init() again on an existing schema.
        assert!(Database::open(&path).is_ok());
    }

    #[test]
    fn slot_save_find_delete_roundtrip() {
        let mut db = seeded_db();
        let slot = Slot::new(machine(), r(0, 60), attended());
        SlotRepository::<ObservationStateBundle>::save(&mut db, &slot).unwrap();

        let found = SlotRepository::<ObservationStateBundle>::find_overlapping(
            &db,
            &machine(),
            &r(30, 90),
        )
        .unwrap();
        assert_eq!(found, vec![slot.clone()]);

        // Non-overlapping query misses it: [60, 90) shares no instant.
        let found = SlotRepository::<ObservationStateBundle>::find_overlapping(
            &db,
            &machine(),
            &r(60, 90),
        )
        .unwrap();
        assert!(found.is_empty());

        SlotRepository::<ObservationStateBundle>::delete(&mut db, &slot).unwrap();
        let found = SlotRepository::<ObservationStateBundle>::find_overlapping(
            &db,
            &machine(),
            &r(0, 60),
        )
        .unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn unbounded_slots_overlap_everything_on_that_side() {
        let mut db = seeded_db();
        let slot = Slot::new(machine(), TimeRange::since(ts(0)), attended());
        SlotRepository::<ObservationStateBundle>::save(&mut db, &slot).unwrap();

        let found = SlotRepository::<ObservationStateBundle>::find_overlapping(
            &db,
            &machine(),
            &r(1000, 2000),
        )
        .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].range.upper(), None);
    }

    #[test]
    fn overlap_query_returns_sorted_slots() {
        let mut db = seeded_db();
        for (lo, up) in [(20, 30), (0, 10), (10, 20)] {
            let slot = Slot::new(machine(), r(lo, up), attended());
            SlotRepository::<ObservationStateBundle>::save(&mut db, &slot).unwrap();
        }
        let found = SlotRepository::<ObservationStateBundle>::find_overlapping(
            &db,
            &machine(),
            &r(0, 30),
        )
        .unwrap();
        let ranges: Vec<_> = found.iter().map(|s| s.range).collect();
        assert_eq!(ranges, vec![r(0, 10), r(10, 20), r(20, 30)]);
    }

    #[test]
    fn template_roundtrip_by_kind() {
        let mut db = seeded_db();
        let template = Template {
            id: TemplateId::new("weekdays").unwrap(),
            items: vec![TemplateItem::every_day(Duration::hours(5))],
        };
        db.upsert_template(TemplateKind::Day, &template).unwrap();

        let loaded = db
            .day_template(&TemplateId::new("weekdays").unwrap())
            .unwrap();
        assert_eq!(loaded, Some(template));

        // Same id queried as a shift template yields nothing.
        let loaded = db
            .shift_template(&TemplateId::new("weekdays").unwrap())
            .unwrap();
        assert_eq!(loaded, None);
    }

    #[test]
    fn default_reason_table_preserves_declaration_order() {
        let mut db = seeded_db();
        db.insert_default_reason(&DefaultReasonRule {
            machine_mode: MachineModeId::new("idle").unwrap(),
            observation_state: Some(ObservationStateId::new("attended").unwrap()),
            reason: ReasonId::new("idle-default").unwrap(),
            score: Score::DEFAULT,
        })
        .unwrap();
        db.insert_default_reason(&DefaultReasonRule {
            machine_mode: MachineModeId::new("idle").unwrap(),
            observation_state: None,
            reason: ReasonId::new("maintenance").unwrap(),
            score: Score::DEFAULT,
        })
        .unwrap();

        let table = db.default_reason_table().unwrap();
        let rule = table
            .lookup(
                &MachineModeId::new("idle").unwrap(),
                &ObservationStateId::new("attended").unwrap(),
            )
            .unwrap();
        assert_eq!(rule.reason, ReasonId::new("idle-default").unwrap());
        let rule = table
            .lookup(
                &MachineModeId::new("idle").unwrap(),
                &ObservationStateId::new("unattended").unwrap(),
            )
            .unwrap();
        assert_eq!(rule.reason, ReasonId::new("maintenance").unwrap());
    }

    #[test]
    fn modification_queue_roundtrip() {
        let mut db = seeded_db();
        let modification = Modification::new(
            machine(),
            ModificationKind::ObservationState(attended()),
            r(0, 60),
        )
        .synchronous();
        db.enqueue_modification(&modification).unwrap();

        let runnable = db.runnable_modifications().unwrap();
        assert_eq!(runnable, vec![modification.clone()]);

        let mut done = modification;
        done.status = AnalysisStatus::Done;
        db.update_modification(&done).unwrap();
        assert!(db.runnable_modifications().unwrap().is_empty());

        let purged = db
            .purge_done_modifications(Utc::now() + Duration::hours(1))
            .unwrap();
        assert_eq!(purged, 1);
    }

    #[test]
    fn auto_reason_rows_keep_declaration_order_and_machine_filter() {
        let mut db = seeded_db();
        db.upsert_machine(&MachineId::new("m-2").unwrap(), None)
            .unwrap();
        db.insert_auto_reason(&AutoReasonRow {
            machine: None,
            candidate: AutoReasonCandidate {
                reason: ReasonId::new("maintenance").unwrap(),
                score: Score::new(120.0).unwrap(),
                manual_score: None,
                can_override: OverridePolicy::ScoreAbove,
            },
        })
        .unwrap();
        db.insert_auto_reason(&AutoReasonRow {
            machine: Some(MachineId::new("m-2").unwrap()),
            candidate: AutoReasonCandidate {
                reason: ReasonId::new("idle-default").unwrap(),
                score: Score::new(50.0).unwrap(),
                manual_score: Some(Score::new(150.0).unwrap()),
                can_override: OverridePolicy::Never,
            },
        })
        .unwrap();

        let for_m1 = db.candidates(&machine()).unwrap();
        assert_eq!(for_m1.len(), 1);
        assert_eq!(for_m1[0].reason, ReasonId::new("maintenance").unwrap());

        let for_m2 = db.candidates(&MachineId::new("m-2").unwrap()).unwrap();
        assert_eq!(for_m2.len(), 2);
        assert_eq!(for_m2[1].can_override, OverridePolicy::Never);
        assert_eq!(for_m2[1].manual_score, Some(Score::new(150.0).unwrap()));
    }

    #[test]
    fn summary_upsert_accumulates_deltas() {
        let mut db = seeded_db();
        db.store_summary(
            &machine(),
            SummaryCategory::Running,
            &r(0, 30),
            Duration::minutes(30),
        )
        .unwrap();
        db.store_summary(
            &machine(),
            SummaryCategory::Running,
            &r(30, 40),
            Duration::minutes(10),
        )
        .unwrap();
        db.store_summary(
            &machine(),
            SummaryCategory::Running,
            &r(0, 10),
            -Duration::minutes(10),
        )
        .unwrap();

        let rows = db.summaries(&machine()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].category, SummaryCategory::Running);
        assert_eq!(rows[0].duration_ms, 30 * 60 * 1000);
    }

    #[test]
    fn analysis_log_filters_by_severity() {
        let mut db = seeded_db();
        db.record(Severity::Info, "pass started", serde_json::json!({}));
        db.record(
            Severity::Warn,
            "no machine status found",
            serde_json::json!({"machine": "m-1"}),
        );

        let all = db.analysis_log(None).unwrap();
        assert_eq!(all.len(), 2);
        let warnings = db.analysis_log(Some(Severity::Warn)).unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].message, "no machine status found");
    }

    #[test]
    fn driver_runs_against_database_context() {
        let mut db = seeded_db();
        let slot = Slot::new(machine(), r(0, 60), attended());
        SlotRepository::<ObservationStateBundle>::save(&mut db, &slot).unwrap();

        let table = DefaultReasonTable::new(vec![DefaultReasonRule {
            machine_mode: MachineModeId::new("idle").unwrap(),
            observation_state: None,
            reason: ReasonId::new("idle-default").unwrap(),
            score: Score::DEFAULT,
        }]);
        let mut log = MemoryLogSink::default();
        let mut driver =
            AnalysisDriver::new(&mut db, &mut log, table, AnalysisConfig::default());

        let mut m = Modification::new(
            machine(),
            ModificationKind::Activity {
                machine_mode: MachineModeId::new("idle").unwrap(),
            },
            r(0, 30),
        )
        .synchronous();
        assert_eq!(driver.run(&mut m).unwrap(), AnalysisStatus::Done);
        driver.store().unwrap();

        let reasons =
            SlotRepository::<ReasonState>::find_overlapping(&db, &machine(), &r(0, 60)).unwrap();
        assert_eq!(reasons.len(), 1);
        assert_eq!(
            reasons[0].state.reason,
            Some(ReasonId::new("idle-default").unwrap())
        );

        let rows = db.summaries(&machine()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].category, SummaryCategory::Stopped);
        assert_eq!(rows[0].duration_ms, 30 * 60 * 1000);
    }

    #[test]
    fn manual_reason_pass_against_database() {
        let mut db = seeded_db();
        let slot = Slot::new(
            machine(),
            r(0, 30),
            ReasonState {
                machine_mode: MachineModeId::new("idle").unwrap(),
                observation_state: ObservationStateId::new("attended").unwrap(),
                reason: Some(ReasonId::new("idle-default").unwrap()),
                reason_score: Score::DEFAULT,
                default_reason: true,
                overwrite_required: false,
                shift: None,
            },
        );
        SlotRepository::<ReasonState>::save(&mut db, &slot).unwrap();

        let table = DefaultReasonTable::default();
        let mut log = MemoryLogSink::default();
        let mut driver =
            AnalysisDriver::new(&mut db, &mut log, table, AnalysisConfig::default());

        let mut m = Modification::new(
            machine(),
            ModificationKind::Reason {
                assertion: Some(ReasonAssertion::manual(
                    ReasonId::new("maintenance").unwrap(),
                )),
            },
            r(10, 20),
        )
        .synchronous();
        assert_eq!(driver.run(&mut m).unwrap(), AnalysisStatus::Done);
        driver.store().unwrap();

        let reasons =
            SlotRepository::<ReasonState>::find_overlapping(&db, &machine(), &r(0, 30)).unwrap();
        assert_eq!(reasons.len(), 3);
        assert_eq!(
            reasons[1].state.reason,
            Some(ReasonId::new("maintenance").unwrap())
        );
        assert!(!reasons[1].state.default_reason);
    }
}
