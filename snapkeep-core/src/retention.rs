/*!
Retention clock: turns `--max-age` / `--max-date` / `--no-max-date` into a
single cutoff instant.

Age expressions are `N` or `N<unit>` with unit `d`, `w`, `m` or `y` (either
case). Anything else falls through to [`parse_date_expression`], which
understands absolute dates and a small set of relative phrases such as
`yesterday`, `3 weeks ago` or `last monday`.
*/

use crate::{Result, SnapkeepError};
use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveDateTime, TimeDelta, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// Age applied when neither `max_age` nor `max_date` is given.
pub const DEFAULT_MAX_AGE_DAYS: i64 = 7;

/// User-facing retention settings, as read from config and flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub max_age: Option<String>,
    pub max_date: Option<String>,
    pub no_max_date: bool,
}

/// The instant at or before which a snapshot counts as expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionCutoff {
    /// `--no-max-date`: the cutoff sits at epoch zero and the age gate is
    /// switched off, so only ownership and tag filters decide.
    NoMaxDate,
    Before(DateTime<Utc>),
}

impl RetentionCutoff {
    pub fn instant(&self) -> DateTime<Utc> {
        match self {
            Self::NoMaxDate => DateTime::<Utc>::UNIX_EPOCH,
            Self::Before(cutoff) => *cutoff,
        }
    }

    /// Age gate: true when a snapshot created at `created` may be purged.
    pub fn is_expired(&self, created: DateTime<Utc>) -> bool {
        match self {
            Self::NoMaxDate => true,
            Self::Before(cutoff) => created <= *cutoff,
        }
    }
}

/// Resolves retention expressions relative to a fixed "now".
#[derive(Debug, Clone, Copy)]
pub struct RetentionClock {
    now: DateTime<Utc>,
}

impl RetentionClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now }
    }

    /// Clock pinned to the current system time.
    pub fn system() -> Self {
        Self::new(Utc::now())
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn resolve_policy(&self, policy: &RetentionPolicy) -> Result<RetentionCutoff> {
        self.resolve_cutoff(
            policy.max_age.as_deref(),
            policy.max_date.as_deref(),
            policy.no_max_date,
        )
    }

    /// `no_max_date` wins over `max_date`, which wins over `max_age`.
    pub fn resolve_cutoff(
        &self,
        max_age: Option<&str>,
        max_date: Option<&str>,
        no_max_date: bool,
    ) -> Result<RetentionCutoff> {
        if no_max_date {
            return Ok(RetentionCutoff::NoMaxDate);
        }
        if let Some(date) = max_date {
            return parse_date_expression(date, self.now).map(RetentionCutoff::Before);
        }
        match max_age {
            Some(age) => self.parse_max_age(age).map(RetentionCutoff::Before),
            None => days_before(self.now, DEFAULT_MAX_AGE_DAYS).map(RetentionCutoff::Before),
        }
    }

    fn parse_max_age(&self, raw: &str) -> Result<DateTime<Utc>> {
        let age = raw.trim();
        let split = age
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(age.len());
        let (digits, unit) = age.split_at(split);

        let count = match digits.parse::<u32>() {
            Ok(count) => count,
            Err(_) => return parse_date_expression(raw, self.now),
        };

        match unit {
            "" | "d" | "D" => days_before(self.now, i64::from(count)),
            "w" | "W" => days_before(self.now, i64::from(count) * 7),
            "m" | "M" => months_before(self.now, count),
            "y" | "Y" => match count.checked_mul(12) {
                Some(months) => months_before(self.now, months),
                None => Err(SnapkeepError::retention(format!("{raw}: out of range"))),
            },
            _ => parse_date_expression(raw, self.now),
        }
    }
}

fn days_before(now: DateTime<Utc>, days: i64) -> Result<DateTime<Utc>> {
    TimeDelta::try_days(days)
        .and_then(|delta| now.checked_sub_signed(delta))
        .ok_or_else(|| SnapkeepError::retention(format!("{days} days: out of range")))
}

fn months_before(now: DateTime<Utc>, months: u32) -> Result<DateTime<Utc>> {
    now.checked_sub_months(Months::new(months))
        .ok_or_else(|| SnapkeepError::retention(format!("{months} months: out of range")))
}

fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc())
        .unwrap_or(now)
}

/// Parse an absolute or relative date expression.
///
/// Naive dates and times are taken as UTC.
pub fn parse_date_expression(raw: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let expr = raw.trim();
    let invalid = || SnapkeepError::retention(format!("cannot interpret '{raw}' as a date"));

    if expr.is_empty() {
        return Err(invalid());
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(expr) {
        return Ok(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(expr, format) {
            return Ok(parsed.and_utc());
        }
    }
    for format in ["%Y-%m-%d", "%Y/%m/%d", "%d %B %Y", "%B %d %Y", "%B %d, %Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(expr, format) {
            return date
                .and_hms_opt(0, 0, 0)
                .map(|midnight| midnight.and_utc())
                .ok_or_else(invalid);
        }
    }

    let lowered = expr.to_ascii_lowercase();
    let words: Vec<&str> = lowered.split_whitespace().collect();
    match words.as_slice() {
        ["now"] => Ok(now),
        ["today"] => Ok(start_of_day(now)),
        ["yesterday"] => days_before(start_of_day(now), 1),
        ["last", "week"] => days_before(now, 7),
        ["last", "month"] => months_before(now, 1),
        ["last", "year"] => months_before(now, 12),
        ["last", day] => {
            let weekday = day.parse::<Weekday>().map_err(|_| invalid())?;
            let today = now.weekday().num_days_from_monday();
            let target = weekday.num_days_from_monday();
            let back = match (today + 7 - target) % 7 {
                0 => 7,
                n => n,
            };
            days_before(start_of_day(now), i64::from(back))
        }
        [count, unit, "ago"] => {
            let count: u32 = count.parse().map_err(|_| invalid())?;
            relative_before(now, count, unit).ok_or_else(invalid)?
        }
        _ => Err(invalid()),
    }
}

fn relative_before(now: DateTime<Utc>, count: u32, unit: &str) -> Option<Result<DateTime<Utc>>> {
    let unit = unit.strip_suffix('s').unwrap_or(unit);
    let count = i64::from(count);
    let delta = match unit {
        "second" => TimeDelta::try_seconds(count),
        "minute" => TimeDelta::try_minutes(count),
        "hour" => TimeDelta::try_hours(count),
        "day" => return Some(days_before(now, count)),
        "week" => return Some(days_before(now, count * 7)),
        "month" => return Some(months_before(now, u32::try_from(count).ok()?)),
        "year" => return Some(months_before(now, u32::try_from(count * 12).ok()?)),
        _ => return None,
    };
    Some(
        delta
            .and_then(|delta| now.checked_sub_signed(delta))
            .ok_or_else(|| SnapkeepError::retention(format!("{count} {unit}s: out of range"))),
    )
}
