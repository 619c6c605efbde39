//! Apply a change event and drive analysis passes to completion.

use anyhow::{Context, Result, anyhow};

use mt_core::analysis::{AnalysisDriver, AnalysisStatus, Modification, ModificationKind};
use mt_core::partition::Assertion;
use mt_core::range::TimeRange;
use mt_core::reason::ReasonAssertion;
use mt_core::repository::{AnalysisLogSink, CatalogLookup, MemoryLogSink, SlotRepository};
use mt_core::slot::{DayState, ObservationStateBundle, ShiftState, Slot, SlotState};
use mt_core::template::adjust_to_day_begin;
use mt_core::types::{
    MachineId, MachineModeId, ObservationStateId, ReasonId, Score, ShiftId, TemplateId,
};
use mt_db::Database;

use super::util::{parse_instant, parse_range};
use crate::Config;

/// Applies an observation-state assertion.
#[expect(clippy::too_many_arguments, reason = "one argument per CLI flag")]
pub fn observation_state(
    db: &mut Database,
    config: &Config,
    machine: &str,
    state: &str,
    from: &str,
    to: Option<&str>,
    shift: Option<&str>,
    synchronous: bool,
) -> Result<()> {
    let machine = MachineId::new(machine)?;
    let state_id = ObservationStateId::new(state)?;
    db.observation_state(&state_id)?
        .ok_or_else(|| anyhow!("unknown observation state: {state}"))?;
    let shift = shift.map(ShiftId::new).transpose()?;
    let range = parse_range(from, to)?;

    let bundle = ObservationStateBundle {
        observation_state: state_id,
        shift,
        template: None,
    };
    let mut modification = Modification::new(
        machine,
        ModificationKind::ObservationState(bundle),
        range,
    );
    if synchronous {
        modification = modification.synchronous();
    }
    run_modification(db, config, modification)
}

/// Applies a machine activity assertion.
pub fn activity(
    db: &mut Database,
    config: &Config,
    machine: &str,
    mode: &str,
    from: &str,
    to: Option<&str>,
    synchronous: bool,
) -> Result<()> {
    let machine = MachineId::new(machine)?;
    let mode_id = MachineModeId::new(mode)?;
    db.machine_mode(&mode_id)?
        .ok_or_else(|| anyhow!("unknown machine mode: {mode}"))?;
    let range = parse_range(from, to)?;

    let mut modification = Modification::new(
        machine,
        ModificationKind::Activity {
            machine_mode: mode_id,
        },
        range,
    );
    if synchronous {
        modification = modification.synchronous();
    }
    run_modification(db, config, modification)
}

/// Applies (or clears) a manual reason assertion.
#[expect(clippy::too_many_arguments, reason = "one argument per CLI flag")]
pub fn reason(
    db: &mut Database,
    config: &Config,
    machine: &str,
    reason: Option<&str>,
    score: Option<f64>,
    from: &str,
    to: Option<&str>,
    synchronous: bool,
) -> Result<()> {
    let machine = MachineId::new(machine)?;
    let assertion = match reason {
        Some(reason) => {
            let reason_id = ReasonId::new(reason)?;
            db.reason(&reason_id)?
                .ok_or_else(|| anyhow!("unknown reason: {reason}"))?;
            let score = match score {
                Some(value) => Score::new(value)?,
                None => Score::MANUAL,
            };
            Some(ReasonAssertion {
                reason: reason_id,
                score,
                details: None,
            })
        }
        None => None,
    };
    let range = parse_range(from, to)?;

    let mut modification =
        Modification::new(machine, ModificationKind::Reason { assertion }, range);
    if synchronous {
        modification = modification.synchronous();
    }
    run_modification(db, config, modification)
}

/// Associates a day or shift template from an instant onwards.
///
/// The start is aligned to the template's next day boundary so the first
/// expanded day is complete; the tail stays marked unprocessed until
/// `mt expand` materializes it.
pub fn template(
    db: &mut Database,
    config: &Config,
    machine: &str,
    template: &str,
    from: &str,
    shift: bool,
) -> Result<()> {
    let machine = MachineId::new(machine)?;
    db.upsert_machine(&machine, None)?;
    let template_id = TemplateId::new(template)?;
    let loaded = if shift {
        db.shift_template(&template_id)?
    } else {
        db.day_template(&template_id)?
    }
    .ok_or_else(|| anyhow!("unknown template: {template}"))?;

    let from = parse_instant(from)?;
    let aligned = adjust_to_day_begin(&loaded, from, &config.template_config()).unwrap_or_else(|| {
        tracing::warn!(template = %template_id, %from, "no day boundary within horizon, using raw start");
        from
    });

    if shift {
        let assertion = Assertion {
            machine,
            range: TimeRange::since(aligned),
            state: ShiftState {
                template: template_id,
                shift: None,
                day: None,
                breaks: Vec::new(),
            },
        };
        apply_assertion(db, &assertion)?;
    } else {
        let assertion = Assertion {
            machine,
            range: TimeRange::since(aligned),
            state: DayState::unprocessed(template_id),
        };
        apply_assertion(db, &assertion)?;
    }
    println!("Template associated from {aligned}.");
    Ok(())
}

/// Runs analysis passes over a freshly enqueued modification until it
/// settles, then flushes summaries and the analysis log.
fn run_modification(
    db: &mut Database,
    config: &Config,
    mut modification: Modification,
) -> Result<()> {
    db.upsert_machine(&modification.machine, None)?;
    db.enqueue_modification(&modification)?;

    let table = db.default_reason_table()?;
    let mut log = MemoryLogSink::default();
    let mut outcome = Ok(());
    {
        let mut driver = AnalysisDriver::new(db, &mut log, table, config.analysis_config());
        loop {
            match driver.run(&mut modification) {
                Ok(AnalysisStatus::InProgress) => {}
                Ok(_) => break,
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }
        if outcome.is_ok() {
            if let Err(e) = driver.store() {
                outcome = Err(e);
            }
        }
    }
    // Persist the final status and the log even when the pass failed.
    for entry in log.entries {
        db.record(entry.severity, &entry.message, entry.context);
    }
    db.update_modification(&modification)?;
    outcome.context("analysis pass failed")?;

    println!(
        "Modification {} {}",
        modification.id,
        modification.status.as_str()
    );
    Ok(())
}

/// Reconciles an assertion into its partition, bootstrapping uncovered
/// parts and re-coalescing around them.
pub fn apply_assertion<S>(db: &mut Database, assertion: &Assertion<S>) -> Result<()>
where
    S: SlotState,
    Database: SlotRepository<S>,
{
    for _ in 0..2 {
        let existing =
            SlotRepository::<S>::find_overlapping(db, &assertion.machine, &assertion.range)?;
        let plan = mt_core::partition::apply(&existing, assertion)?;
        for slot in &plan.delete {
            SlotRepository::<S>::delete(db, slot)?;
        }
        for slot in &plan.insert {
            SlotRepository::<S>::save(db, slot)?;
        }
        if plan.uncovered.is_empty() {
            break;
        }
        for uncovered in &plan.uncovered {
            let slot = Slot::new(assertion.machine.clone(), *uncovered, assertion.state.clone());
            SlotRepository::<S>::save(db, &slot)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::init;
    use mt_core::slot::ReasonState;

    fn test_config() -> Config {
        Config {
            database_path: std::path::PathBuf::from(":memory:"),
            ..Config::default()
        }
    }

    fn seeded_db() -> Database {
        let mut db = Database::open_in_memory().unwrap();
        init::run(&mut db).unwrap();
        db
    }

    #[test]
    fn observation_state_then_activity_end_to_end() {
        let mut db = seeded_db();
        let config = test_config();

        observation_state(
            &mut db,
            &config,
            "m-1",
            "attended",
            "2025-01-15T08:00:00Z",
            Some("2025-01-15T16:00:00Z"),
            None,
            true,
        )
        .unwrap();

        activity(
            &mut db,
            &config,
            "m-1",
            "idle",
            "2025-01-15T08:00:00Z",
            Some("2025-01-15T10:00:00Z"),
            true,
        )
        .unwrap();

        let machine = MachineId::new("m-1").unwrap();
        let range = parse_range("2025-01-15T00:00:00Z", Some("2025-01-16T00:00:00Z")).unwrap();
        let reasons =
            SlotRepository::<ReasonState>::find_overlapping(&db, &machine, &range).unwrap();
        assert_eq!(reasons.len(), 1);
        assert_eq!(
            reasons[0].state.reason,
            Some(ReasonId::new("unanswered").unwrap())
        );

        let summaries = db.summaries(&machine).unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].duration_ms, 2 * 60 * 60 * 1000);
    }

    #[test]
    fn unknown_catalog_ids_are_rejected() {
        let mut db = seeded_db();
        let config = test_config();

        let err = observation_state(
            &mut db,
            &config,
            "m-1",
            "nonsense",
            "2025-01-15T08:00:00Z",
            None,
            None,
            true,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown observation state"));

        let err = activity(
            &mut db,
            &config,
            "m-1",
            "nonsense",
            "2025-01-15T08:00:00Z",
            None,
            true,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown machine mode"));
    }

    #[test]
    fn template_association_marks_tail_unprocessed() {
        let mut db = seeded_db();
        let config = test_config();
        db.upsert_template(
            mt_db::TemplateKind::Day,
            &mt_core::template::Template {
                id: TemplateId::new("calendar").unwrap(),
                items: vec![mt_core::template::TemplateItem::every_day(
                    chrono::Duration::hours(5),
                )],
            },
        )
        .unwrap();

        template(
            &mut db,
            &config,
            "m-1",
            "calendar",
            "2025-01-15T08:00:00Z",
            false,
        )
        .unwrap();

        let machine = MachineId::new("m-1").unwrap();
        let slots = SlotRepository::<DayState>::find_overlapping(
            &db,
            &machine,
            &TimeRange::since(parse_instant("2025-01-15T00:00:00Z").unwrap()),
        )
        .unwrap();
        assert_eq!(slots.len(), 1);
        // Aligned to the next +5h cut-off after 08:00, i.e. the next day.
        assert_eq!(
            slots[0].range.lower(),
            Some(parse_instant("2025-01-16T05:00:00Z").unwrap())
        );
        assert_eq!(slots[0].range.upper(), None);
        assert!(slots[0].state.day.is_none());
    }
}
