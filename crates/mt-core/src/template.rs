//! Periodic template expansion.
//!
//! Day and shift templates are recurring rules that turn into concrete slot
//! boundaries. Expansion walks the timeline day by day from a start instant
//! up to a scan limit, picks the most specific matching rule for each
//! calendar day, and emits one derived interval per boundary pair. The tail
//! beyond the scan limit stays unprocessed; `resume_from` lets a later call
//! continue where this one stopped, and expanding `[t0,t1)` then `[t1,t2)`
//! produces the same intervals as one `[t0,t2)` pass.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::range::TimeRange;
use crate::slot::{DayState, ShiftState};
use crate::types::{ShiftId, TemplateId};

/// A set of weekdays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeekDays(u8);

impl WeekDays {
    /// Every day of the week.
    pub const ALL: Self = Self(0x7f);

    /// No day at all.
    pub const NONE: Self = Self(0);

    /// Builds a set from explicit days.
    #[must_use]
    pub fn of(days: &[Weekday]) -> Self {
        let mut bits = 0;
        for day in days {
            bits |= 1 << day.num_days_from_monday();
        }
        Self(bits)
    }

    /// Whether the set contains `day`.
    #[must_use]
    pub fn contains(self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }

    /// Whether the set covers the whole week.
    #[must_use]
    pub const fn is_full(self) -> bool {
        self.0 == Self::ALL.0
    }
}

impl Default for WeekDays {
    fn default() -> Self {
        Self::ALL
    }
}

/// One rule of a day or shift template.
///
/// `cut_off` is a signed offset from midnight and may fall outside
/// `[0h, 24h)`; it is normalized before use (see [`normalize_cut_off`]).
/// Shift rules additionally carry a time window, the shift they produce and
/// their break windows; day rules leave those empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateItem {
    #[serde(default)]
    pub week_days: WeekDays,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specific_day: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_window: Option<(NaiveTime, NaiveTime)>,
    pub cut_off: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shift: Option<ShiftId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub breaks: Vec<(NaiveTime, NaiveTime)>,
}

impl TemplateItem {
    /// A catch-all day rule with the given cut-off.
    #[must_use]
    pub const fn every_day(cut_off: Duration) -> Self {
        Self {
            week_days: WeekDays::ALL,
            specific_day: None,
            time_window: None,
            cut_off,
            shift: None,
            breaks: Vec::new(),
        }
    }
}

/// A periodic template: an ordered rule list, matched most-specific first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: TemplateId,
    pub items: Vec<TemplateItem>,
}

/// Engine tunables for template processing.
#[derive(Debug, Clone)]
pub struct TemplateConfig {
    /// Forward horizon, in days, of [`adjust_to_day_begin`].
    pub day_begin_horizon_days: u32,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            day_begin_horizon_days: 7,
        }
    }
}

/// Cooperative cancellation flag checked between boundary computations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// A token that never cancels unless [`CancelToken::cancel`] is called.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Result of an expansion pass.
///
/// `slots` are sorted, non-overlapping derived intervals over
/// `[from, resume_from)`. `resume_from` is the first instant still carrying
/// the unprocessed template; it equals the scan limit unless the pass was
/// cancelled earlier.
#[derive(Debug, Clone)]
pub struct Expansion<S> {
    pub slots: Vec<(TimeRange, S)>,
    pub resume_from: Option<DateTime<Utc>>,
}

/// Normalizes a raw cut-off into `(-12h, +12h]`.
///
/// Offsets above 12h wrap to the previous day: a `+23h` cut-off behaves as
/// `-1h`, so the day boundary falls one hour before midnight.
#[must_use]
pub fn normalize_cut_off(cut_off: Duration) -> Duration {
    if cut_off > Duration::hours(12) {
        cut_off - Duration::hours(24)
    } else {
        cut_off
    }
}

/// The most specific rules matching `day`, in declaration order.
///
/// Specificity: explicit date, then weekday-restricted rules with a time
/// window, then weekday-restricted rules, then catch-alls.
fn matching_items(items: &[TemplateItem], day: NaiveDate) -> Vec<&TemplateItem> {
    let specific: Vec<_> = items
        .iter()
        .filter(|i| i.specific_day == Some(day))
        .collect();
    if !specific.is_empty() {
        return specific;
    }
    let weekday = day.weekday();
    let windowed: Vec<_> = items
        .iter()
        .filter(|i| {
            i.specific_day.is_none()
                && !i.week_days.is_full()
                && i.week_days.contains(weekday)
                && i.time_window.is_some()
        })
        .collect();
    if !windowed.is_empty() {
        return windowed;
    }
    let weekday_only: Vec<_> = items
        .iter()
        .filter(|i| {
            i.specific_day.is_none() && !i.week_days.is_full() && i.week_days.contains(weekday)
        })
        .collect();
    if !weekday_only.is_empty() {
        return weekday_only;
    }
    items
        .iter()
        .filter(|i| i.specific_day.is_none() && i.week_days.is_full())
        .collect()
}

/// The begin instant of `day` under the template, if any rule matches.
fn day_begin(items: &[TemplateItem], day: NaiveDate) -> Option<DateTime<Utc>> {
    let item = matching_items(items, day).first().copied()?;
    let midnight = day.and_hms_opt(0, 0, 0).expect("midnight is a valid time");
    Some(midnight.and_utc() + normalize_cut_off(item.cut_off))
}

/// The nearest boundary at or after `instant` that some rule defines.
///
/// Scans forward day by day, bounded by the configured horizon; an instant
/// exactly on a boundary is returned unchanged. `None` means no rule
/// produced a boundary within the horizon.
#[must_use]
pub fn adjust_to_day_begin(
    template: &Template,
    instant: DateTime<Utc>,
    config: &TemplateConfig,
) -> Option<DateTime<Utc>> {
    let start = instant.date_naive();
    for offset in 0..=i64::from(config.day_begin_horizon_days) {
        let day = start + Duration::days(offset);
        if let Some(begin) = day_begin(&template.items, day) {
            if begin >= instant {
                return Some(begin);
            }
        }
    }
    tracing::warn!(
        template = %template.id,
        %instant,
        horizon_days = config.day_begin_horizon_days,
        "no day boundary found within horizon"
    );
    None
}

/// Expands a day template over `[from, scan_limit)`.
///
/// Each emitted interval carries the calendar day owning
/// `[cutoff, next cutoff)`. Days without a matching rule leave a hole; the
/// caller keeps the template-unprocessed marker over holes and the tail.
#[must_use]
pub fn expand_days(
    template: &Template,
    from: DateTime<Utc>,
    scan_limit: DateTime<Utc>,
    cancel: &CancelToken,
) -> Expansion<DayState> {
    let mut slots = Vec::new();
    let mut resume_from = (from < scan_limit).then_some(scan_limit);
    let window = match TimeRange::between(from, scan_limit) {
        Ok(w) if !w.is_empty() => w,
        _ => {
            return Expansion {
                slots,
                resume_from: None,
            };
        }
    };

    let mut day = from.date_naive() - Duration::days(1);
    loop {
        if cancel.is_cancelled() {
            // Partial result: everything before this day's boundary stands.
            let reached = day_begin(&template.items, day).map_or(from, |b| b.max(from));
            resume_from = Some(reached.min(scan_limit));
            break;
        }
        let Some(begin) = day_begin(&template.items, day) else {
            day += Duration::days(1);
            if day > scan_limit.date_naive() + Duration::days(1) {
                break;
            }
            continue;
        };
        if begin >= scan_limit {
            break;
        }
        // The next day's own boundary closes this day.
        let mut end = day_begin(&template.items, day + Duration::days(1))
            .unwrap_or_else(|| begin + Duration::hours(24));
        if end <= begin {
            tracing::warn!(template = %template.id, %day, "inverted day boundaries, falling back to 24h");
            end = begin + Duration::hours(24);
        }
        let day_range = TimeRange::between(begin, end).expect("day begin precedes day end");
        if let Some(clipped) = day_range.intersection(&window) {
            slots.push((clipped, DayState::for_day(template.id.clone(), day)));
        }
        day += Duration::days(1);
    }

    Expansion { slots, resume_from }
}

/// Expands a shift template over `[from, scan_limit)`.
///
/// Every matching rule of a day contributes one shift interval; rules with
/// a time window produce `[day + start, day + end)` (wrapping past midnight
/// when `end <= start`), rules without one cover the whole cut-off day.
/// Break windows become metadata on the produced state, clipped to the
/// shift interval — they never form partition entries of their own.
#[must_use]
pub fn expand_shifts(
    template: &Template,
    from: DateTime<Utc>,
    scan_limit: DateTime<Utc>,
    cancel: &CancelToken,
) -> Expansion<ShiftState> {
    let mut slots: Vec<(TimeRange, ShiftState)> = Vec::new();
    let mut resume_from = (from < scan_limit).then_some(scan_limit);
    let window = match TimeRange::between(from, scan_limit) {
        Ok(w) if !w.is_empty() => w,
        _ => {
            return Expansion {
                slots,
                resume_from: None,
            };
        }
    };

    let mut day = from.date_naive() - Duration::days(1);
    while day <= scan_limit.date_naive() + Duration::days(1) {
        if cancel.is_cancelled() {
            let reached = slots
                .last()
                .and_then(|(r, _)| r.upper())
                .map_or(from, |u| u.max(from));
            resume_from = Some(reached.min(scan_limit));
            break;
        }
        let midnight = day
            .and_hms_opt(0, 0, 0)
            .expect("midnight is a valid time")
            .and_utc();
        for item in matching_items(&template.items, day) {
            let shift_range = match item.time_window {
                Some((start, end)) => {
                    let begin = midnight + signed_since_midnight(start);
                    let mut until = midnight + signed_since_midnight(end);
                    if until <= begin {
                        until += Duration::hours(24);
                    }
                    TimeRange::between(begin, until).expect("window begin precedes end")
                }
                None => {
                    let begin = midnight + normalize_cut_off(item.cut_off);
                    TimeRange::between(begin, begin + Duration::hours(24))
                        .expect("cut-off day is 24h wide")
                }
            };
            let Some(clipped) = shift_range.intersection(&window) else {
                continue;
            };
            let breaks = item
                .breaks
                .iter()
                .filter_map(|&(start, end)| {
                    let begin = midnight + signed_since_midnight(start);
                    let mut until = midnight + signed_since_midnight(end);
                    if until <= begin {
                        until += Duration::hours(24);
                    }
                    TimeRange::between(begin, until)
                        .ok()
                        .and_then(|b| b.intersection(&clipped))
                })
                .collect();
            slots.push((
                clipped,
                ShiftState {
                    template: template.id.clone(),
                    shift: item.shift.clone(),
                    day: Some(day),
                    breaks,
                },
            ));
        }
        day += Duration::days(1);
    }

    slots.sort_by(|a, b| a.0.cmp(&b.0));
    Expansion { slots, resume_from }
}

/// A local time as a signed offset from midnight.
fn signed_since_midnight(t: NaiveTime) -> Duration {
    t - NaiveTime::from_hms_opt(0, 0, 0).expect("midnight is a valid time")
}
