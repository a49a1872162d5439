//! Six-field cron triggers: `second minute hour day-of-month month day-of-week`.
//!
//! Supported per field: `*`, single values, ranges `a-b`, steps `*/n`, `a/n`
//! and `a-b/n`, and comma lists. `?` is accepted in the two day fields and
//! means "no constraint". Months accept `JAN`..`DEC`; weekdays accept
//! `SUN`..`SAT` or `1`..`7` with 1 = Sunday. When both day fields are
//! constrained a day matches if either one does.

use crate::error::ServerError;
use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike,
};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Search horizon. Any satisfiable expression, including Feb 29, fires within it.
const MAX_YEARS_AHEAD: i32 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid cron expression '{expression}': {reason}")]
pub struct CronError {
    pub expression: String,
    pub reason: String,
}

impl From<CronError> for ServerError {
    fn from(err: CronError) -> Self {
        ServerError::SchedulerConfig(err.to_string())
    }
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    allow_question: bool,
}

const SECONDS: FieldSpec = FieldSpec {
    name: "second",
    min: 0,
    max: 59,
    names: &[],
    allow_question: false,
};
const MINUTES: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    names: &[],
    allow_question: false,
};
const HOURS: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    names: &[],
    allow_question: false,
};
const DAYS_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
    allow_question: true,
};
const MONTHS: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: &[
        "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
    ],
    allow_question: false,
};
const DAYS_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 1,
    max: 7,
    names: &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"],
    allow_question: true,
};

/// Parsed field: one bit per allowed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Field {
    bits: u64,
    unconstrained: bool,
}

impl Field {
    fn contains(&self, value: u32) -> bool {
        self.bits & (1u64 << value) != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    seconds: Field,
    minutes: Field,
    hours: Field,
    days_of_month: Field,
    months: Field,
    days_of_week: Field,
}

impl CronExpression {
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let fail = |reason: String| CronError {
            expression: expression.to_string(),
            reason,
        };

        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 6 {
            return Err(fail(format!("expected 6 fields, found {}", parts.len())));
        }

        let field = |text: &str, spec: &FieldSpec| parse_field(text, spec).map_err(fail);

        Ok(Self {
            source: parts.join(" "),
            seconds: field(parts[0], &SECONDS)?,
            minutes: field(parts[1], &MINUTES)?,
            hours: field(parts[2], &HOURS)?,
            days_of_month: field(parts[3], &DAYS_OF_MONTH)?,
            months: field(parts[4], &MONTHS)?,
            days_of_week: field(parts[5], &DAYS_OF_WEEK)?,
        })
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self
            .days_of_week
            .contains(date.weekday().number_from_sunday());

        match (self.days_of_month.unconstrained, self.days_of_week.unconstrained) {
            (true, true) => true,
            (true, false) => dow,
            (false, true) => dom,
            (false, false) => dom || dow,
        }
    }

    /// First matching wall-clock second strictly after `after`.
    pub fn next_after_naive(&self, after: NaiveDateTime) -> Option<NaiveDateTime> {
        let mut t = after.with_nanosecond(0)? + Duration::seconds(1);
        let last_year = t.year() + MAX_YEARS_AHEAD;

        loop {
            if t.year() > last_year {
                return None;
            }

            if !self.months.contains(t.month()) {
                let (year, month) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)?;
                continue;
            }

            if !self.day_matches(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }

            if !self.hours.contains(t.hour()) {
                t = t.date().and_hms_opt(t.hour(), 0, 0)? + Duration::hours(1);
                continue;
            }

            if !self.minutes.contains(t.minute()) {
                t = t.date().and_hms_opt(t.hour(), t.minute(), 0)? + Duration::minutes(1);
                continue;
            }

            if !self.seconds.contains(t.second()) {
                t += Duration::seconds(1);
                continue;
            }

            return Some(t);
        }
    }

    /// First matching instant strictly after `after`, evaluated in `after`'s
    /// time zone. Local times skipped by a DST gap never fire.
    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let tz = after.timezone();
        let mut cursor = after.naive_local();

        loop {
            let candidate = self.next_after_naive(cursor)?;
            let resolved = match tz.from_local_datetime(&candidate) {
                LocalResult::Single(t) => Some(t),
                LocalResult::Ambiguous(earliest, _) => Some(earliest),
                LocalResult::None => None,
            };

            if let Some(t) = resolved {
                if t > *after {
                    return Some(t);
                }
            }
            cursor = candidate;
        }
    }
}

impl FromStr for CronExpression {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn parse_value(text: &str, spec: &FieldSpec) -> Result<u32, String> {
    let value = match text.parse::<u32>() {
        Ok(v) => v,
        Err(_) => {
            let upper = text.to_ascii_uppercase();
            spec.names
                .iter()
                .position(|name| *name == upper)
                .map(|index| spec.min + index as u32)
                .ok_or_else(|| format!("'{}' is not a valid {}", text, spec.name))?
        }
    };

    if value < spec.min || value > spec.max {
        return Err(format!(
            "{} {} outside {}-{}",
            spec.name, value, spec.min, spec.max
        ));
    }
    Ok(value)
}

fn parse_field(text: &str, spec: &FieldSpec) -> Result<Field, String> {
    let full = Field {
        bits: (spec.min..=spec.max).fold(0u64, |bits, v| bits | (1u64 << v)),
        unconstrained: true,
    };

    match text {
        "*" => return Ok(full),
        "?" if spec.allow_question => return Ok(full),
        "?" => return Err(format!("'?' is not allowed in the {} field", spec.name)),
        _ => {}
    }

    let mut bits = 0u64;
    for part in text.split(',') {
        if part.is_empty() {
            return Err(format!("empty entry in {} field", spec.name));
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{}' in {} field", step, spec.name))?;
                if step == 0 {
                    return Err(format!("step of zero in {} field", spec.name));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, spec)?, parse_value(b, spec)?)
        } else {
            let start = parse_value(range, spec)?;
            // `a/n` runs to the end of the field.
            (start, if step.is_some() { spec.max } else { start })
        };

        if start > end {
            return Err(format!("range {}-{} is reversed in {} field", start, end, spec.name));
        }

        for value in (start..=end).step_by(step.unwrap_or(1) as usize) {
            bits |= 1u64 << value;
        }
    }

    Ok(Field {
        bits,
        unconstrained: false,
    })
}
