//! Process pending day/shift templates up to a scan limit.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Duration, Utc};

use mt_core::partition::Assertion;
use mt_core::range::TimeRange;
use mt_core::repository::{CatalogLookup, SlotRepository};
use mt_core::slot::{DayState, ShiftState, Slot};
use mt_core::template::{CancelToken, expand_days, expand_shifts};
use mt_core::types::MachineId;
use mt_db::Database;

use super::apply::apply_assertion;
use super::util::parse_instant;

/// Expands every unprocessed template slot of a machine up to `until`
/// (default: one week ahead). Re-running resumes where the last call
/// stopped; already-materialized slots are untouched.
pub fn run(db: &mut Database, machine: &str, until: Option<&str>) -> Result<()> {
    let machine = MachineId::new(machine)?;
    let until = until
        .map(parse_instant)
        .transpose()?
        .unwrap_or_else(|| Utc::now() + Duration::days(7));
    let cancel = CancelToken::new();

    let days = expand_day_templates(db, &machine, until, &cancel)?;
    let shifts = expand_shift_templates(db, &machine, until, &cancel)?;

    println!("Materialized {days} day slot(s) and {shifts} shift slot(s).");
    Ok(())
}

fn expand_day_templates(
    db: &mut Database,
    machine: &MachineId,
    until: DateTime<Utc>,
    cancel: &CancelToken,
) -> Result<usize> {
    let window = TimeRange::until(until);
    let pending: Vec<Slot<DayState>> =
        SlotRepository::<DayState>::find_overlapping(db, machine, &window)?
            .into_iter()
            .filter(|s| s.state.day.is_none())
            .collect();

    let mut materialized = 0;
    for slot in pending {
        let Some(from) = slot.range.lower() else {
            tracing::warn!(machine = %machine, range = %slot.range, "unbounded template slot skipped");
            continue;
        };
        let template = db
            .day_template(&slot.state.template)?
            .ok_or_else(|| anyhow!("unknown day template: {}", slot.state.template))?;
        let limit = slot.range.upper().map_or(until, |u| u.min(until));
        if limit <= from {
            continue;
        }
        let expansion = expand_days(&template, from, limit, cancel);
        for (range, state) in &expansion.slots {
            apply_assertion(
                db,
                &Assertion {
                    machine: machine.clone(),
                    range: *range,
                    state: state.clone(),
                },
            )?;
            materialized += 1;
        }
    }
    Ok(materialized)
}

fn expand_shift_templates(
    db: &mut Database,
    machine: &MachineId,
    until: DateTime<Utc>,
    cancel: &CancelToken,
) -> Result<usize> {
    let window = TimeRange::until(until);
    let pending: Vec<Slot<ShiftState>> =
        SlotRepository::<ShiftState>::find_overlapping(db, machine, &window)?
            .into_iter()
            .filter(|s| s.state.day.is_none())
            .collect();

    let mut materialized = 0;
    for slot in pending {
        let Some(from) = slot.range.lower() else {
            tracing::warn!(machine = %machine, range = %slot.range, "unbounded template slot skipped");
            continue;
        };
        let template = db
            .shift_template(&slot.state.template)?
            .ok_or_else(|| anyhow!("unknown shift template: {}", slot.state.template))?;
        let limit = slot.range.upper().map_or(until, |u| u.min(until));
        if limit <= from {
            continue;
        }
        let expansion = expand_shifts(&template, from, limit, cancel);
        for (range, state) in &expansion.slots {
            apply_assertion(
                db,
                &Assertion {
                    machine: machine.clone(),
                    range: *range,
                    state: state.clone(),
                },
            )?;
            materialized += 1;
        }
    }
    Ok(materialized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use crate::commands::{apply, init};
    use chrono::NaiveDate;
    use mt_core::template::{Template, TemplateItem};
    use mt_core::types::TemplateId;
    use mt_db::TemplateKind;

    fn seeded_db() -> Database {
        let mut db = Database::open_in_memory().unwrap();
        init::run(&mut db).unwrap();
        db.upsert_template(
            TemplateKind::Day,
            &Template {
                id: TemplateId::new("calendar").unwrap(),
                items: vec![TemplateItem::every_day(Duration::hours(5))],
            },
        )
        .unwrap();
        db
    }

    fn associate(db: &mut Database, from: &str) {
        let config = Config::default();
        apply::template(db, &config, "m-1", "calendar", from, false).unwrap();
    }

    #[test]
    fn expand_materializes_days_and_keeps_tail_unprocessed() {
        let mut db = seeded_db();
        // Aligned start: 2025-01-16T05:00Z.
        associate(&mut db, "2025-01-15T08:00:00Z");

        run(&mut db, "m-1", Some("2025-01-18T05:00:00Z")).unwrap();

        let machine = MachineId::new("m-1").unwrap();
        let slots = SlotRepository::<DayState>::find_overlapping(
            &db,
            &machine,
            &TimeRange::since(parse_instant("2025-01-01T00:00:00Z").unwrap()),
        )
        .unwrap();

        // Two concrete days plus the unprocessed tail.
        assert_eq!(slots.len(), 3);
        assert_eq!(
            slots[0].state.day,
            Some(NaiveDate::from_ymd_opt(2025, 1, 16).unwrap())
        );
        assert_eq!(
            slots[1].state.day,
            Some(NaiveDate::from_ymd_opt(2025, 1, 17).unwrap())
        );
        assert!(slots[2].state.day.is_none());
        assert_eq!(
            slots[2].range.lower(),
            Some(parse_instant("2025-01-18T05:00:00Z").unwrap())
        );
        assert_eq!(slots[2].range.upper(), None);
    }

    #[test]
    fn expand_twice_resumes_without_duplicates() {
        let mut db = seeded_db();
        associate(&mut db, "2025-01-15T08:00:00Z");

        run(&mut db, "m-1", Some("2025-01-17T05:00:00Z")).unwrap();
        run(&mut db, "m-1", Some("2025-01-18T05:00:00Z")).unwrap();

        let machine = MachineId::new("m-1").unwrap();
        let slots = SlotRepository::<DayState>::find_overlapping(
            &db,
            &machine,
            &TimeRange::since(parse_instant("2025-01-01T00:00:00Z").unwrap()),
        )
        .unwrap();
        assert_eq!(slots.len(), 3);
        mt_core::partition::check_partition(&slots, &machine).unwrap();

        let days: Vec<_> = slots.iter().map(|s| s.state.day).collect();
        assert_eq!(
            days,
            vec![
                Some(NaiveDate::from_ymd_opt(2025, 1, 16).unwrap()),
                Some(NaiveDate::from_ymd_opt(2025, 1, 17).unwrap()),
                None,
            ]
        );
    }
}
