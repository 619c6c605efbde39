//! Initialize the database and seed the built-in catalog.

use anyhow::{Context, Result};

use mt_core::reason::DefaultReasonRule;
use mt_core::types::{
    MachineMode, MachineModeId, ObservationState, ObservationStateId, Reason, ReasonId, Score,
};
use mt_db::Database;

/// Seeds the catalog rows every installation starts from: the acquisition
/// machine modes, the two base observation states, their reasons and the
/// default-reason rules tying them together.
pub fn run(db: &mut Database) -> Result<()> {
    let modes = [
        ("active", Some(true), true),
        ("idle", Some(false), true),
        ("off", Some(false), true),
        ("manual", None, false),
    ];
    for (id, running, auto) in modes {
        db.upsert_machine_mode(&MachineMode {
            id: MachineModeId::new(id).context("built-in machine mode id")?,
            running,
            auto,
        })?;
    }

    let states = [("attended", false, true), ("unattended", false, false)];
    for (id, shift_required, production) in states {
        db.upsert_observation_state(&ObservationState {
            id: ObservationStateId::new(id).context("built-in observation state id")?,
            shift_required,
            production,
        })?;
    }

    let reasons = [
        ("production", "PRD"),
        ("unanswered", "UNS"),
        ("off", "OFF"),
        ("unattended-idle", "UNA"),
    ];
    for (id, code) in reasons {
        db.upsert_reason(&Reason {
            id: ReasonId::new(id).context("built-in reason id")?,
            code: code.to_string(),
        })?;
    }

    if !db.default_reason_table()?.is_empty() {
        println!("Database already initialized.");
        return Ok(());
    }
    let defaults = [
        ("active", None, "production"),
        ("idle", Some("attended"), "unanswered"),
        ("idle", Some("unattended"), "unattended-idle"),
        ("off", None, "off"),
    ];
    for (mode, state, reason) in defaults {
        db.insert_default_reason(&DefaultReasonRule {
            machine_mode: MachineModeId::new(mode).context("built-in machine mode id")?,
            observation_state: state
                .map(ObservationStateId::new)
                .transpose()
                .context("built-in observation state id")?,
            reason: ReasonId::new(reason).context("built-in reason id")?,
            score: Score::DEFAULT,
        })?;
    }

    println!("Database initialized.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mt_core::repository::CatalogLookup;

    #[test]
    fn init_seeds_catalog_and_defaults() {
        let mut db = Database::open_in_memory().unwrap();
        run(&mut db).unwrap();

        let mode = db
            .machine_mode(&MachineModeId::new("active").unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(mode.running, Some(true));

        let table = db.default_reason_table().unwrap();
        let rule = table
            .lookup(
                &MachineModeId::new("idle").unwrap(),
                &ObservationStateId::new("attended").unwrap(),
            )
            .unwrap();
        assert_eq!(rule.reason, ReasonId::new("unanswered").unwrap());
    }

    #[test]
    fn init_is_idempotent() {
        let mut db = Database::open_in_memory().unwrap();
        run(&mut db).unwrap();
        run(&mut db).unwrap();

        let table = db.default_reason_table().unwrap();
        let rule = table
            .lookup(
                &MachineModeId::new("off").unwrap(),
                &ObservationStateId::new("attended").unwrap(),
            )
            .unwrap();
        assert_eq!(rule.reason, ReasonId::new("off").unwrap());
    }
}
