use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;

use crate::error::{Result, SchedulerError};
use crate::types::{Schedule, ScheduleInput};

/// Cron searches stop this far past `after`; nothing found means `None`.
pub const CRON_SEARCH_HORIZON_DAYS: i64 = 4 * 366;

/// Shortest accepted `every` interval.
pub const MIN_INTERVAL_MS: u64 = 1_000;

/// Longest accepted `every` interval (ten years).
pub const MAX_INTERVAL_MS: u64 = 10 * 366 * 24 * 60 * 60 * 1_000;

const WEEKDAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// Check that `schedule` can be evaluated. Called at create/update time so
/// dispatch never sees a malformed schedule.
pub fn validate(schedule: &Schedule) -> Result<()> {
    match schedule {
        Schedule::At { at } => {
            if at.timestamp_millis() <= 0 {
                return Err(SchedulerError::InvalidSchedule(
                    "atMs must be a positive epoch timestamp".to_string(),
                ));
            }
            Ok(())
        }
        Schedule::Every { every_ms } => {
            if *every_ms < MIN_INTERVAL_MS {
                return Err(SchedulerError::InvalidSchedule(format!(
                    "everyMs must be at least {MIN_INTERVAL_MS}, got {every_ms}"
                )));
            }
            if *every_ms > MAX_INTERVAL_MS {
                return Err(SchedulerError::InvalidSchedule(format!(
                    "everyMs must be at most {MAX_INTERVAL_MS}, got {every_ms}"
                )));
            }
            Ok(())
        }
        Schedule::Cron { expr, tz } => CronSpec::parse(expr, tz.as_deref()).map(|_| ()),
    }
}

impl TryFrom<ScheduleInput> for Schedule {
    type Error = SchedulerError;

    fn try_from(input: ScheduleInput) -> Result<Self> {
        fn missing(field: &str, kind: &str) -> SchedulerError {
            SchedulerError::InvalidSchedule(format!("{field} is required for kind \"{kind}\""))
        }

        let kind = input
            .kind
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| SchedulerError::InvalidSchedule("schedule kind is required".to_string()))?;

        let schedule = match kind {
            "at" => {
                let ms = input.at_ms.ok_or_else(|| missing("atMs", kind))?;
                let at = DateTime::from_timestamp_millis(ms).ok_or_else(|| {
                    SchedulerError::InvalidSchedule(format!("atMs is out of range: {ms}"))
                })?;
                Schedule::At { at }
            }
            "every" => {
                let ms = input.every_ms.ok_or_else(|| missing("everyMs", kind))?;
                let every_ms = u64::try_from(ms).map_err(|_| {
                    SchedulerError::InvalidSchedule(format!("everyMs must be positive, got {ms}"))
                })?;
                Schedule::Every { every_ms }
            }
            "cron" => {
                let expr = input
                    .expr
                    .filter(|e| !e.trim().is_empty())
                    .ok_or_else(|| missing("expr", kind))?;
                Schedule::Cron {
                    expr,
                    tz: input.tz.filter(|tz| !tz.trim().is_empty()),
                }
            }
            other => {
                return Err(SchedulerError::InvalidSchedule(format!(
                    "unknown schedule kind: {other}"
                )));
            }
        };

        validate(&schedule)?;
        Ok(schedule)
    }
}

/// The earliest occurrence of `schedule` strictly after `after`, or `None`
/// when the schedule will never fire again.
pub fn next_occurrence(schedule: &Schedule, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    match schedule {
        Schedule::At { at } => Ok((*at > after).then_some(*at)),
        Schedule::Every { every_ms } => Ok(Some(add_interval(after, *every_ms))),
        Schedule::Cron { expr, tz } => Ok(CronSpec::parse(expr, tz.as_deref())?.next_after(after)),
    }
}

/// Next fire time after a run anchored at `anchor`, guaranteed to lie
/// strictly after `now`.
///
/// Interval jobs keep their phase: missed periods are skipped rather than
/// replayed, so a stalled process fires once and then lines up again.
pub fn next_run_after(
    schedule: &Schedule,
    anchor: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    match schedule {
        Schedule::Every { every_ms } => {
            let next = add_interval(anchor, *every_ms);
            if next > now {
                return Ok(Some(next));
            }
            let every = *every_ms as i64;
            let elapsed = now.timestamp_millis() - anchor.timestamp_millis();
            let periods = elapsed / every + 1;
            Ok(DateTime::from_timestamp_millis(anchor.timestamp_millis() + periods * every))
        }
        _ => next_occurrence(schedule, anchor.max(now)),
    }
}

fn add_interval(after: DateTime<Utc>, every_ms: u64) -> DateTime<Utc> {
    // Millisecond granularity, the unit of `everyMs`.
    let millis = after.timestamp_millis() + every_ms as i64;
    DateTime::from_timestamp_millis(millis).unwrap_or(after)
}

/// A parsed 5-field cron expression bound to a timezone.
#[derive(Debug, Clone)]
pub struct CronSpec {
    /// One schedule normally; two when both day fields are restricted, since
    /// classic cron matches a day if EITHER field matches.
    schedules: Vec<cron::Schedule>,
    tz: Tz,
}

impl CronSpec {
    pub fn parse(expr: &str, tz: Option<&str>) -> Result<Self> {
        let tz = match tz.map(str::trim).filter(|s| !s.is_empty()) {
            Some(name) => Tz::from_str(name)
                .map_err(|_| SchedulerError::InvalidSchedule(format!("unknown timezone: {name}")))?,
            None => chrono_tz::UTC,
        };

        let expanded = expand_nickname(expr.trim())?;
        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(SchedulerError::InvalidSchedule(format!(
                "cron expression `{expr}` must have 5 fields \
                 (minute hour day-of-month month day-of-week), got {}",
                fields.len()
            )));
        }

        let minute = fields[0];
        let hour = fields[1];
        let day_of_month = any_to_star(fields[2]);
        let month = fields[3];
        let day_of_week = translate_day_of_week(fields[4])?;

        // the `cron` crate wants a leading seconds field
        let sources = if day_of_month != "*" && day_of_week != "*" {
            vec![
                format!("0 {minute} {hour} {day_of_month} {month} *"),
                format!("0 {minute} {hour} * {month} {day_of_week}"),
            ]
        } else {
            vec![format!("0 {minute} {hour} {day_of_month} {month} {day_of_week}")]
        };

        let schedules = sources
            .iter()
            .map(|src| {
                cron::Schedule::from_str(src).map_err(|e| {
                    SchedulerError::InvalidSchedule(format!("invalid cron expression `{expr}`: {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { schedules, tz })
    }

    /// Earliest matching instant strictly after `after`, within the search horizon.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&self.tz);
        let horizon = after + Duration::days(CRON_SEARCH_HORIZON_DAYS);
        self.schedules
            .iter()
            .filter_map(|s| s.after(&local).next())
            .map(|dt| dt.with_timezone(&Utc))
            .filter(|t| *t > after && *t <= horizon)
            .min()
    }
}

fn expand_nickname(expr: &str) -> Result<String> {
    if !expr.starts_with('@') {
        return Ok(expr.to_string());
    }
    let expanded = match expr.to_ascii_lowercase().as_str() {
        "@yearly" | "@annually" => "0 0 1 1 *",
        "@monthly" => "0 0 1 * *",
        "@weekly" => "0 0 * * 0",
        "@daily" | "@midnight" => "0 0 * * *",
        "@hourly" => "0 * * * *",
        _ => {
            return Err(SchedulerError::InvalidSchedule(format!(
                "unknown cron nickname: {expr}"
            )))
        }
    };
    Ok(expanded.to_string())
}

fn any_to_star(field: &str) -> &str {
    if field == "?" {
        "*"
    } else {
        field
    }
}

/// Rewrite a standard day-of-week field (0-7, 0 and 7 = Sunday, or names)
/// as an explicit list of day names, which the `cron` crate reads
/// unambiguously.
fn translate_day_of_week(field: &str) -> Result<String> {
    let field = any_to_star(field);
    if field == "*" {
        return Ok("*".to_string());
    }

    let invalid = |why: &str| {
        SchedulerError::InvalidSchedule(format!("invalid day-of-week field `{field}`: {why}"))
    };

    let mut days = BTreeSet::new();
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => {
                let step: usize = step.parse().map_err(|_| invalid("bad step"))?;
                if step == 0 {
                    return Err(invalid("step must be positive"));
                }
                (base, Some(step))
            }
            None => (item, None),
        };

        let (start, end) = if base == "*" {
            (0, 6)
        } else if let Some((a, b)) = base.split_once('-') {
            (parse_weekday(a).ok_or_else(|| invalid("bad range start"))?,
             parse_weekday(b).ok_or_else(|| invalid("bad range end"))?)
        } else {
            let day = parse_weekday(base).ok_or_else(|| invalid("bad day"))?;
            (day, if step.is_some() { 6 } else { day })
        };

        if start > end {
            return Err(invalid("range start is after range end"));
        }
        for day in (start..=end).step_by(step.unwrap_or(1)) {
            days.insert(day % 7);
        }
    }

    if days.is_empty() {
        return Err(invalid("no days selected"));
    }
    Ok(days
        .into_iter()
        .map(|d| WEEKDAY_NAMES[d])
        .collect::<Vec<_>>()
        .join(","))
}

fn parse_weekday(token: &str) -> Option<usize> {
    if let Ok(n) = token.parse::<usize>() {
        return (n <= 7).then_some(n);
    }
    let lower = token.to_ascii_lowercase();
    WEEKDAY_NAMES
        .iter()
        .position(|name| name.to_ascii_lowercase() == lower)
}
