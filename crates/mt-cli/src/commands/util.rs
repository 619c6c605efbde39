//! Shared helpers for subcommands.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};

use mt_core::range::TimeRange;

/// Parses an RFC 3339 instant.
pub fn parse_instant(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .with_context(|| format!("invalid timestamp: {value}"))
}

/// Parses a `[from, to)` pair; a missing `to` makes the range open-ended.
pub fn parse_range(from: &str, to: Option<&str>) -> Result<TimeRange> {
    let lower = parse_instant(from)?;
    let Some(to) = to else {
        return Ok(TimeRange::since(lower));
    };
    let upper = parse_instant(to)?;
    let range = TimeRange::between(lower, upper).map_err(|e| anyhow!(e))?;
    if range.is_empty() {
        return Err(anyhow!("empty range: {from} == {to}"));
    }
    Ok(range)
}

/// Renders a millisecond duration as `4h30m` / `30m`.
pub fn format_duration_ms(ms: i64) -> String {
    let total_minutes = ms / 60_000;
    let hours = total_minutes / 60;
    let minutes = total_minutes % 60;
    if hours > 0 {
        format!("{hours}h{minutes:02}m")
    } else {
        format!("{minutes}m")
    }
}
