//! Report command for per-day duration summaries.

use std::io::Write;

use anyhow::Result;
use serde::Serialize;

use mt_core::types::MachineId;
use mt_db::Database;

use super::util::format_duration_ms;

/// One summary row in JSON output.
#[derive(Debug, Serialize)]
struct JsonRow {
    machine: String,
    day: String,
    category: &'static str,
    duration_ms: i64,
}

/// Prints the per-day category durations of one machine.
pub fn run<W: Write>(writer: &mut W, db: &Database, machine: &str, json: bool) -> Result<()> {
    let machine = MachineId::new(machine)?;
    let rows = db.summaries(&machine)?;

    if json {
        let rows: Vec<JsonRow> = rows
            .iter()
            .map(|r| JsonRow {
                machine: r.machine.to_string(),
                day: r.day.to_string(),
                category: r.category.as_str(),
                duration_ms: r.duration_ms,
            })
            .collect();
        writeln!(writer, "{}", serde_json::to_string_pretty(&rows)?)?;
        return Ok(());
    }

    writeln!(writer, "Summary for {machine}")?;
    if rows.is_empty() {
        writeln!(writer, "No summaries recorded.")?;
        return Ok(());
    }

    let mut current_day = None;
    for row in rows {
        if current_day != Some(row.day) {
            writeln!(writer, "{}", row.day)?;
            current_day = Some(row.day);
        }
        writeln!(
            writer,
            "  {}: {}",
            row.category.as_str(),
            format_duration_ms(row.duration_ms)
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{DateTime, Duration, TimeZone, Utc};
    use insta::assert_snapshot;
    use mt_core::range::TimeRange;
    use mt_core::repository::{SummaryCategory, SummaryStore};

    fn ts(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, day, hour, 0, 0).unwrap()
    }

    fn seeded_db() -> Database {
        let mut db = Database::open_in_memory().unwrap();
        let machine = MachineId::new("m-1").unwrap();
        db.upsert_machine(&machine, Some("Mill 1")).unwrap();
        db.store_summary(
            &machine,
            SummaryCategory::Running,
            &TimeRange::between(ts(15, 8), ts(15, 9)).unwrap(),
            Duration::minutes(90),
        )
        .unwrap();
        db.store_summary(
            &machine,
            SummaryCategory::Stopped,
            &TimeRange::between(ts(15, 10), ts(15, 11)).unwrap(),
            Duration::minutes(30),
        )
        .unwrap();
        db.store_summary(
            &machine,
            SummaryCategory::Running,
            &TimeRange::between(ts(16, 8), ts(16, 9)).unwrap(),
            Duration::minutes(45),
        )
        .unwrap();
        db
    }

    #[test]
    fn report_groups_rows_by_day() {
        let db = seeded_db();
        let mut output = Vec::new();
        run(&mut output, &db, "m-1", false).unwrap();
        let output = String::from_utf8(output).unwrap();
        assert_snapshot!(output, @r"
        Summary for m-1
        2025-01-15
          running: 1h30m
          stopped: 30m
        2025-01-16
          running: 45m
        ");
    }

    #[test]
    fn report_without_summaries() {
        let mut db = Database::open_in_memory().unwrap();
        let machine = MachineId::new("m-2").unwrap();
        db.upsert_machine(&machine, None).unwrap();
        let mut output = Vec::new();
        run(&mut output, &db, "m-2", false).unwrap();
        let output = String::from_utf8(output).unwrap();
        assert_snapshot!(output, @r"
        Summary for m-2
        No summaries recorded.
        ");
    }

    #[test]
    fn report_json_shape() {
        let db = seeded_db();
        let mut output = Vec::new();
        run(&mut output, &db, "m-1", true).unwrap();
        let rows: serde_json::Value = serde_json::from_slice(&output).unwrap();
        let rows = rows.as_array().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["category"], "running");
        assert_eq!(rows[0]["day"], "2025-01-15");
        assert_eq!(rows[0]["duration_ms"], 90 * 60 * 1000);
    }
}
