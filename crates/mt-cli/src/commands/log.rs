//! Dump the analysis log.

use std::io::Write;

use anyhow::{Result, anyhow};

use mt_core::repository::Severity;
use mt_db::Database;

/// Prints analysis log entries, optionally filtered by minimum severity.
pub fn run<W: Write>(writer: &mut W, db: &Database, severity: Option<&str>) -> Result<()> {
    let min_severity = severity.map(parse_severity).transpose()?;
    let entries = db.analysis_log(min_severity)?;

    if entries.is_empty() {
        writeln!(writer, "Analysis log is empty.")?;
        return Ok(());
    }

    for entry in entries {
        writeln!(
            writer,
            "{} [{}] {} {}",
            entry.at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            entry.severity,
            entry.message,
            entry.context,
        )?;
    }
    Ok(())
}

fn parse_severity(value: &str) -> Result<Severity> {
    match value {
        "info" => Ok(Severity::Info),
        "warn" => Ok(Severity::Warn),
        "error" => Ok(Severity::Error),
        other => Err(anyhow!("unknown severity: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mt_core::repository::AnalysisLogSink;

    #[test]
    fn log_filters_by_minimum_severity() {
        let mut db = Database::open_in_memory().unwrap();
        db.record(Severity::Info, "pass started", serde_json::json!({}));
        db.record(
            Severity::Warn,
            "no machine status found",
            serde_json::json!({"machine": "m-1"}),
        );

        let mut output = Vec::new();
        run(&mut output, &db, Some("warn")).unwrap();
        let output = String::from_utf8(output).unwrap();
        assert!(output.contains("no machine status found"));
        assert!(!output.contains("pass started"));
    }

    #[test]
    fn log_rejects_unknown_severity() {
        let db = Database::open_in_memory().unwrap();
        let mut output = Vec::new();
        assert!(run(&mut output, &db, Some("loud")).is_err());
    }

    #[test]
    fn empty_log_prints_placeholder() {
        let db = Database::open_in_memory().unwrap();
        let mut output = Vec::new();
        run(&mut output, &db, None).unwrap();
        assert_eq!(String::from_utf8(output).unwrap(), "Analysis log is empty.\n");
    }
}
