use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::types::TaskSchedule;

/// A parsed cron expression bound to the timezone it is evaluated in.
///
/// Accepts the classic five-field form (`min hour dom mon dow`) as well as the
/// six/seven-field form with a leading seconds column. Five-field expressions
/// fire at second zero and use standard day-of-week numbering (0 or 7 =
/// Sunday, 6 = Saturday). The six/seven-field form is passed through as is and
/// numbers days the way the `cron` crate does (1 = Sunday, 7 = Saturday).
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: Schedule,
    timezone: Tz,
}

impl CronSchedule {
    /// Parse `expression` in `timezone` (UTC when `None`).
    ///
    /// Returns a human-readable reason on malformed expressions or unknown
    /// timezone names.
    pub fn parse(expression: &str, timezone: Option<&str>) -> std::result::Result<Self, String> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let normalized = match fields.len() {
            5 => {
                let dow = crate_day_of_week(fields[4])
                    .map_err(|e| format!("{expression:?}: day of week: {e}"))?;
                format!("0 {} {} {} {} {dow}", fields[0], fields[1], fields[2], fields[3])
            }
            6 | 7 => fields.join(" "),
            n => return Err(format!("expected 5 to 7 cron fields, got {n} in {expression:?}")),
        };

        let schedule =
            Schedule::from_str(&normalized).map_err(|e| format!("{expression:?}: {e}"))?;

        let timezone = match timezone {
            None => Tz::UTC,
            Some(name) => name
                .parse::<Tz>()
                .map_err(|e| format!("unknown timezone {name:?}: {e}"))?,
        };

        Ok(Self {
            expression: expression.to_string(),
            schedule,
            timezone,
        })
    }

    pub fn from_task_schedule(schedule: &TaskSchedule) -> std::result::Result<Self, String> {
        Self::parse(&schedule.cron, schedule.timezone.as_deref())
    }

    /// Next occurrence strictly after `after`, evaluated in this schedule's timezone.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&self.timezone);
        self.schedule
            .after(&local)
            .next()
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Whether a run started at `last_started_at` has a due successor at `now`.
    pub fn is_due(&self, last_started_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.next_after(last_started_at)
            .is_some_and(|next| now >= next)
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }
}

const DAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// Rewrite a standard day-of-week field (0-7, Sunday = 0 and 7) as an explicit
/// list in the `cron` crate's numbering (1 = Sunday).
fn crate_day_of_week(field: &str) -> std::result::Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut days = [false; 7];
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .ok()
                    .filter(|s| *s > 0)
                    .ok_or_else(|| format!("bad step in {part:?}"))?;
                (range, step)
            }
            None => (part, 1),
        };

        let (first, last) = match range.split_once('-') {
            _ if range == "*" => (0, 6),
            Some((a, b)) => (standard_day(a)?, standard_day(b)?),
            None if part.contains('/') => (standard_day(range)?, 6),
            None => {
                let day = standard_day(range)?;
                (day, day)
            }
        };
        if first > last {
            return Err(format!("descending range {part:?}"));
        }
        for day in (first..=last).step_by(step as usize) {
            days[(day % 7) as usize] = true;
        }
    }

    let list: Vec<String> = days
        .iter()
        .enumerate()
        .filter(|(_, set)| **set)
        .map(|(day, _)| (day + 1).to_string())
        .collect();
    Ok(list.join(","))
}

/// A single standard day token: `0`-`7` or a three-letter name.
fn standard_day(token: &str) -> std::result::Result<u32, String> {
    if let Ok(n) = token.parse::<u32>() {
        return if n <= 7 {
            Ok(n)
        } else {
            Err(format!("{n} is out of range 0-7"))
        };
    }
    let lower = token.to_ascii_lowercase();
    DAY_NAMES
        .iter()
        .position(|name| *name == lower)
        .map(|i| i as u32)
        .ok_or_else(|| format!("unknown day {token:?}"))
}
