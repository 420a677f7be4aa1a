//! Five-field cron expressions evaluated in a named timezone.
//!
//! Fields: `MIN HOUR DOM MON DOW`. Each field accepts `*`, `N`, `A-B`,
//! `*/S`, `A-B/S`, `A/S` and comma lists of those. Months and weekdays also
//! accept three-letter names; weekday `7` is Sunday.
//!
//! When both day-of-month and day-of-week are restricted a day matches if
//! either does. Wall-clock times skipped by a DST gap never fire; times
//! repeated by a DST fold fire once, at their first occurrence.

use std::fmt;
use std::str::FromStr;

use chrono::{
    DateTime, Datelike, Days, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike,
    Utc,
};
use chrono_tz::Tz;

/// How far ahead `next_after` searches before giving up. Covers the
/// eight-year gap between leap days around a skipped century leap year.
const SEARCH_HORIZON_DAYS: u64 = 8 * 366;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecurrenceError {
    #[error("cron expression must have 5 fields (minute hour day-of-month month day-of-week), got {0}")]
    FieldCount(usize),
    #[error("invalid {field} field '{value}': {reason}")]
    InvalidField {
        field: &'static str,
        value: String,
        reason: String,
    },
    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),
    #[error("cron expression '{0}' has no upcoming occurrence")]
    NoUpcomingOccurrence(String),
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
}

const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    names: &[],
};
const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    names: &[],
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
};
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: &[
        "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
    ],
};
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"],
};

/// Set of values allowed by one cron field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet(u64);

impl FieldSet {
    fn contains(&self, value: u32) -> bool {
        value < 64 && self.0 & (1 << value) != 0
    }

    fn values(&self) -> impl Iterator<Item = u32> + '_ {
        (0..64).filter(move |v| self.contains(*v))
    }
}

impl FieldSpec {
    fn invalid(&self, value: &str, reason: impl Into<String>) -> RecurrenceError {
        RecurrenceError::InvalidField {
            field: self.name,
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    fn value(&self, raw: &str, field: &str) -> Result<u32, RecurrenceError> {
        let upper = raw.to_ascii_uppercase();
        if let Some(pos) = self.names.iter().position(|n| *n == upper) {
            return Ok(pos as u32 + self.min);
        }
        let n: u32 = raw
            .parse()
            .map_err(|_| self.invalid(field, format!("'{raw}' is not a number")))?;
        if n < self.min || n > self.max {
            return Err(self.invalid(
                field,
                format!("{n} is outside {}-{}", self.min, self.max),
            ));
        }
        Ok(n)
    }

    fn parse(&self, field: &str) -> Result<FieldSet, RecurrenceError> {
        let mut bits = 0u64;
        for part in field.split(',') {
            if part.is_empty() {
                return Err(self.invalid(field, "empty list element"));
            }
            let (base, step) = match part.split_once('/') {
                Some((base, step)) => {
                    let step: u32 = step
                        .parse()
                        .map_err(|_| self.invalid(field, format!("bad step '{step}'")))?;
                    if step == 0 {
                        return Err(self.invalid(field, "step must be at least 1"));
                    }
                    (base, Some(step))
                }
                None => (part, None),
            };

            let (start, end) = if base == "*" {
                (self.min, self.max)
            } else if let Some((lo, hi)) = base.split_once('-') {
                let lo = self.value(lo, field)?;
                let hi = self.value(hi, field)?;
                if lo > hi {
                    return Err(self.invalid(field, format!("range {lo}-{hi} is reversed")));
                }
                (lo, hi)
            } else {
                let v = self.value(base, field)?;
                // `N/S` means every S starting at N.
                if step.is_some() { (v, self.max) } else { (v, v) }
            };

            let mut v = start;
            while v <= end {
                bits |= 1 << v;
                v += step.unwrap_or(1);
            }
        }
        Ok(FieldSet(bits))
    }
}

/// A parsed five-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
    /// Day-of-month field begins with `*`.
    dom_star: bool,
    /// Day-of-week field begins with `*`.
    dow_star: bool,
}

impl CronExpr {
    pub fn parse(expression: &str) -> Result<Self, RecurrenceError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(RecurrenceError::FieldCount(fields.len()));
        }

        let mut days_of_week = DAY_OF_WEEK.parse(fields[4])?;
        if days_of_week.contains(7) {
            days_of_week = FieldSet((days_of_week.0 & !(1 << 7)) | 1);
        }

        Ok(Self {
            source: fields.join(" "),
            minutes: MINUTE.parse(fields[0])?,
            hours: HOUR.parse(fields[1])?,
            days_of_month: DAY_OF_MONTH.parse(fields[2])?,
            months: MONTH.parse(fields[3])?,
            days_of_week,
            dom_star: fields[2].starts_with('*'),
            dow_star: fields[4].starts_with('*'),
        })
    }

    /// Normalised source text.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    fn matches_day(&self, date: NaiveDate) -> bool {
        if !self.months.contains(date.month()) {
            return false;
        }
        let dom = self.days_of_month.contains(date.day());
        let dow = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());
        if self.dom_star || self.dow_star {
            dom && dow
        } else {
            dom || dow
        }
    }

    /// Whether a wall-clock minute matches all five fields.
    pub fn matches(&self, local: NaiveDateTime) -> bool {
        self.matches_day(local.date())
            && self.hours.contains(local.hour())
            && self.minutes.contains(local.minute())
    }
}

impl FromStr for CronExpr {
    type Err = RecurrenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Resolve an IANA timezone name.
pub fn parse_timezone(name: &str) -> Result<Tz, RecurrenceError> {
    name.parse::<Tz>()
        .map_err(|_| RecurrenceError::UnknownTimezone(name.to_string()))
}

/// A cron expression bound to a timezone.
#[derive(Debug, Clone)]
pub struct Recurrence {
    expr: CronExpr,
    tz: Tz,
}

impl Recurrence {
    pub fn new(expr: CronExpr, tz: Tz) -> Self {
        Self { expr, tz }
    }

    /// Parse and validate an expression and timezone together.
    pub fn parse(expression: &str, timezone: &str) -> Result<Self, RecurrenceError> {
        Ok(Self {
            expr: CronExpr::parse(expression)?,
            tz: parse_timezone(timezone)?,
        })
    }

    pub fn expr(&self) -> &CronExpr {
        &self.expr
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// The earliest matching instant strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, RecurrenceError> {
        let local_after = after.with_timezone(&self.tz).naive_local();
        let start = local_after
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(local_after)
            + Duration::minutes(1);

        let mut date = start.date();
        let horizon = start
            .date()
            .checked_add_days(Days::new(SEARCH_HORIZON_DAYS))
            .ok_or_else(|| self.exhausted())?;

        while date <= horizon {
            if !self.expr.months.contains(date.month()) {
                date = first_of_next_month(date).ok_or_else(|| self.exhausted())?;
                continue;
            }
            if self.expr.matches_day(date) {
                for hour in self.expr.hours.values() {
                    for minute in self.expr.minutes.values() {
                        let Some(naive) = date.and_hms_opt(hour, minute, 0) else {
                            continue;
                        };
                        if naive < start {
                            continue;
                        }
                        let resolved = match self.tz.from_local_datetime(&naive) {
                            LocalResult::Single(dt) => dt,
                            LocalResult::Ambiguous(first, _) => first,
                            // Inside a DST gap.
                            LocalResult::None => continue,
                        };
                        let instant = resolved.with_timezone(&Utc);
                        if instant > after {
                            return Ok(instant);
                        }
                    }
                }
            }
            date = date.succ_opt().ok_or_else(|| self.exhausted())?;
        }

        Err(self.exhausted())
    }

    /// The next `count` occurrences after `after`.
    pub fn upcoming(
        &self,
        after: DateTime<Utc>,
        count: usize,
    ) -> Result<Vec<DateTime<Utc>>, RecurrenceError> {
        let mut out = Vec::with_capacity(count);
        let mut cursor = after;
        for _ in 0..count {
            cursor = self.next_after(cursor)?;
            out.push(cursor);
        }
        Ok(out)
    }

    fn exhausted(&self) -> RecurrenceError {
        RecurrenceError::NoUpcomingOccurrence(self.expr.source.clone())
    }
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDate> {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
}

/// Next occurrence of `cron_expression` in `timezone` strictly after `after`.
pub fn next_occurrence(
    cron_expression: &str,
    timezone: &str,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>, RecurrenceError> {
    Recurrence::parse(cron_expression, timezone)?.next_after(after)
}
