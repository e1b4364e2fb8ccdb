//! Cron expression parsing and evaluation.
//!
//! Accepts the six-field form with seconds (`second minute hour day month weekday`),
//! the classic five-field form (seconds fixed at zero) and `@` descriptors,
//! including `@every <duration>`. All evaluation happens in UTC.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, SubsecRound, Timelike, Utc};

use super::SchedulerError;

/// How many years ahead `next_after` searches before concluding an
/// expression never fires.
const SEARCH_HORIZON_YEARS: i32 = 10;

/// A parsed cron expression.
#[derive(Debug, Clone)]
pub struct CronExpression {
    source: String,
    kind: ScheduleKind,
}

#[derive(Debug, Clone)]
enum ScheduleKind {
    /// Calendar fields.
    Fields(Box<FieldSet>),
    /// Constant delay (`@every 5m`).
    Every(Duration),
}

#[derive(Debug, Clone)]
struct FieldSet {
    /// Second (0-59).
    second: CronField,
    /// Minute (0-59).
    minute: CronField,
    /// Hour (0-23).
    hour: CronField,
    /// Day of month (1-31).
    day: CronField,
    /// Month (1-12).
    month: CronField,
    /// Day of week (0-6, Sunday = 0).
    weekday: CronField,
}

/// A single field in a cron expression.
#[derive(Debug, Clone)]
enum CronField {
    /// Wildcard (`*` or `?`) - matches all values.
    Any,
    /// Specific value.
    Value(u32),
    /// Comma separated items (e.g., `1,3,10-12`).
    List(Vec<CronField>),
    /// Inclusive range (e.g., `1-5`).
    Range(u32, u32),
    /// Stepped range (e.g., `*/5`, `10-40/10`, `3/15`).
    Step { start: u32, end: u32, step: u32 },
}

impl CronField {
    /// Check if the field matches the given value.
    fn matches(&self, value: u32) -> bool {
        match self {
            Self::Any => true,
            Self::Value(v) => *v == value,
            Self::List(items) => items.iter().any(|item| item.matches(value)),
            Self::Range(start, end) => value >= *start && value <= *end,
            Self::Step { start, end, step } => {
                value >= *start && value <= *end && (value - start) % step == 0
            }
        }
    }

    fn is_any(&self) -> bool {
        matches!(self, Self::Any)
    }
}

/// Bounds and symbolic names for one field position.
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
}

const SECOND: FieldSpec = FieldSpec { name: "second", min: 0, max: 59, names: &[] };
const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59, names: &[] };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23, names: &[] };
const DAY: FieldSpec = FieldSpec { name: "day", min: 1, max: 31, names: &[] };
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: &[
        "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
    ],
};
const WEEKDAY: FieldSpec = FieldSpec {
    name: "weekday",
    min: 0,
    max: 6,
    names: &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"],
};

impl FieldSpec {
    fn value(&self, text: &str) -> Result<u32, String> {
        let value = match text.parse::<u32>() {
            Ok(value) => value,
            Err(_) => self
                .names
                .iter()
                .position(|name| name.eq_ignore_ascii_case(text))
                .and_then(|idx| u32::try_from(idx).ok())
                .map(|idx| idx + self.min)
                .ok_or_else(|| format!("invalid {} value '{text}'", self.name))?,
        };
        if value < self.min || value > self.max {
            return Err(format!(
                "{} value {value} out of range {}-{}",
                self.name, self.min, self.max
            ));
        }
        Ok(value)
    }
}

/// Cron expression parser.
#[derive(Debug)]
pub struct CronParser;

impl CronParser {
    /// Parse a cron expression string.
    ///
    /// # Format
    ///
    /// `second minute hour day month weekday`, or the five-field form without
    /// seconds.
    ///
    /// # Examples
    ///
    /// - `*/5 * * * * *` - Every 5 seconds
    /// - `0 0 * * *` - Daily at midnight
    /// - `0 30 9 * * MON-FRI` - 09:30 on weekdays
    /// - `@every 1h30m` - Every ninety minutes
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidScheduleExpression`] if the expression
    /// is malformed or can never fire.
    pub fn parse(expr: &str) -> Result<CronExpression, SchedulerError> {
        let invalid = |reason: String| SchedulerError::InvalidScheduleExpression {
            expression: expr.to_string(),
            reason,
        };

        let trimmed = expr.trim();
        let kind = match trimmed.strip_prefix('@') {
            Some(descriptor) => Self::parse_descriptor(descriptor).map_err(invalid)?,
            None => {
                let parts: Vec<&str> = trimmed.split_whitespace().collect();
                ScheduleKind::Fields(Box::new(Self::parse_fields(&parts).map_err(invalid)?))
            }
        };

        let expression = CronExpression {
            source: trimmed.to_string(),
            kind,
        };
        if expression.next_after(&Utc::now()).is_none() {
            return Err(invalid("expression never fires".to_string()));
        }
        Ok(expression)
    }

    fn parse_descriptor(descriptor: &str) -> Result<ScheduleKind, String> {
        let lowered = descriptor.to_ascii_lowercase();
        let fields = match lowered.as_str() {
            "yearly" | "annually" => "0 0 0 1 1 *",
            "monthly" => "0 0 0 1 * *",
            "weekly" => "0 0 0 * * 0",
            "daily" | "midnight" => "0 0 0 * * *",
            "hourly" => "0 0 * * * *",
            other => {
                let Some(interval) = other.strip_prefix("every") else {
                    return Err(format!("unknown descriptor '@{descriptor}'"));
                };
                return parse_duration(interval.trim()).map(ScheduleKind::Every);
            }
        };
        let parts: Vec<&str> = fields.split_whitespace().collect();
        Self::parse_fields(&parts).map(|set| ScheduleKind::Fields(Box::new(set)))
    }

    fn parse_fields(parts: &[&str]) -> Result<FieldSet, String> {
        let (second, rest) = match parts.len() {
            6 => (Self::parse_field(parts[0], &SECOND)?, &parts[1..]),
            5 => (CronField::Value(0), parts),
            n => return Err(format!("expected 5 or 6 fields, found {n}")),
        };

        Ok(FieldSet {
            second,
            minute: Self::parse_field(rest[0], &MINUTE)?,
            hour: Self::parse_field(rest[1], &HOUR)?,
            day: Self::parse_field(rest[2], &DAY)?,
            month: Self::parse_field(rest[3], &MONTH)?,
            weekday: Self::parse_field(rest[4], &WEEKDAY)?,
        })
    }

    fn parse_field(field: &str, spec: &FieldSpec) -> Result<CronField, String> {
        if field.contains(',') {
            let items = field
                .split(',')
                .map(|item| Self::parse_item(item, spec))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(CronField::List(items));
        }
        Self::parse_item(field, spec)
    }

    fn parse_item(item: &str, spec: &FieldSpec) -> Result<CronField, String> {
        if item.is_empty() {
            return Err(format!("empty {} item", spec.name));
        }

        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid {} step '{step}'", spec.name))?;
                if step == 0 || step > spec.max {
                    return Err(format!("{} step must be 1-{}", spec.name, spec.max));
                }
                (range, Some(step))
            }
            None => (item, None),
        };

        let wildcard = range == "*" || range == "?";
        let (start, end) = if wildcard {
            (spec.min, spec.max)
        } else if let Some((start, end)) = range.split_once('-') {
            (spec.value(start)?, spec.value(end)?)
        } else {
            let value = spec.value(range)?;
            if step.is_none() {
                return Ok(CronField::Value(value));
            }
            (value, spec.max)
        };

        if start > end {
            return Err(format!("{} range {start}-{end} is reversed", spec.name));
        }

        Ok(match step {
            None | Some(1) if wildcard => CronField::Any,
            None => CronField::Range(start, end),
            Some(step) => CronField::Step { start, end, step },
        })
    }
}

/// Parse a compact duration such as `5s`, `10m` or `1h30m`.
fn parse_duration(text: &str) -> Result<Duration, String> {
    if text.is_empty() {
        return Err("@every requires a duration".to_string());
    }

    let mut total: u64 = 0;
    let mut digits = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let unit = match ch {
            'h' => 3600,
            'm' => 60,
            's' => 1,
            _ => return Err(format!("invalid duration unit '{ch}' in '{text}'")),
        };
        let amount: u64 = digits
            .parse()
            .map_err(|_| format!("invalid duration '{text}'"))?;
        total = total.saturating_add(amount.saturating_mul(unit));
        digits.clear();
    }

    if !digits.is_empty() {
        return Err(format!("duration '{text}' is missing a unit"));
    }
    if total == 0 {
        return Err("@every duration must be at least one second".to_string());
    }
    Ok(Duration::from_secs(total))
}

impl CronExpression {
    /// The expression as it was written.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Calculate the next execution time strictly after the given time.
    ///
    /// Returns `None` when nothing matches within the search horizon.
    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.kind {
            ScheduleKind::Every(interval) => {
                let delay = chrono::Duration::from_std(*interval).ok()?;
                after.trunc_subsecs(0).checked_add_signed(delay)
            }
            ScheduleKind::Fields(fields) => fields.next_after(after),
        }
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FieldSet {
    fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut current = after.trunc_subsecs(0) + chrono::Duration::seconds(1);
        let last_year = current.year() + SEARCH_HORIZON_YEARS;

        while current.year() <= last_year {
            if !self.month.matches(current.month()) {
                current = start_of_next_month(&current)?;
                continue;
            }
            if !self.day_matches(&current) {
                current = start_of_day(current.date_naive().succ_opt()?);
                continue;
            }
            if !self.hour.matches(current.hour()) {
                current = current.with_minute(0)?.with_second(0)? + chrono::Duration::hours(1);
                continue;
            }
            if !self.minute.matches(current.minute()) {
                current = current.with_second(0)? + chrono::Duration::minutes(1);
                continue;
            }
            if !self.second.matches(current.second()) {
                current += chrono::Duration::seconds(1);
                continue;
            }
            return Some(current);
        }
        None
    }

    /// Day-of-month and day-of-week are OR-ed when both are restricted.
    fn day_matches(&self, time: &DateTime<Utc>) -> bool {
        let day = self.day.matches(time.day());
        let weekday = self.weekday.matches(time.weekday().num_days_from_sunday());
        if self.day.is_any() || self.weekday.is_any() {
            day && weekday
        } else {
            day || weekday
        }
    }
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

fn start_of_next_month(time: &DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if time.month() == 12 {
        (time.year() + 1, 1)
    } else {
        (time.year(), time.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).map(start_of_day)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_every_five_seconds() {
        let expr = CronParser::parse("*/5 * * * * *").unwrap();
        assert_eq!(
            expr.next_after(&at(2024, 3, 1, 12, 0, 3)),
            Some(at(2024, 3, 1, 12, 0, 5))
        );
        // Strictly after: a matching instant advances by one period.
        assert_eq!(
            expr.next_after(&at(2024, 3, 1, 12, 0, 5)),
            Some(at(2024, 3, 1, 12, 0, 10))
        );
        assert_eq!(
            expr.next_after(&at(2024, 3, 1, 12, 0, 58)),
            Some(at(2024, 3, 1, 12, 1, 0))
        );
    }

    #[test]
    fn test_five_field_form_fires_on_the_minute() {
        let expr = CronParser::parse("*/15 * * * *").unwrap();
        assert_eq!(
            expr.next_after(&at(2024, 3, 1, 12, 7, 30)),
            Some(at(2024, 3, 1, 12, 15, 0))
        );
    }

    #[test]
    fn test_daily_midnight_rolls_over_year() {
        let expr = CronParser::parse("0 0 * * *").unwrap();
        assert_eq!(
            expr.next_after(&at(2024, 12, 31, 23, 59, 59)),
            Some(at(2025, 1, 1, 0, 0, 0))
        );
    }

    #[test]
    fn test_weekday_names() {
        // 2024-01-06 is a Saturday.
        let expr = CronParser::parse("0 30 9 * * MON-FRI").unwrap();
        assert_eq!(
            expr.next_after(&at(2024, 1, 6, 10, 0, 0)),
            Some(at(2024, 1, 8, 9, 30, 0))
        );
    }

    #[test]
    fn test_month_names_and_lists() {
        let expr = CronParser::parse("0 0 12 1 jan,Jul *").unwrap();
        assert_eq!(
            expr.next_after(&at(2024, 2, 10, 0, 0, 0)),
            Some(at(2024, 7, 1, 12, 0, 0))
        );
    }

    #[test]
    fn test_day_and_weekday_are_ored_when_both_restricted() {
        // 1st of the month OR any Monday. 2024-01-02 is a Tuesday.
        let expr = CronParser::parse("0 0 0 1 * MON").unwrap();
        assert_eq!(
            expr.next_after(&at(2024, 1, 2, 0, 0, 0)),
            Some(at(2024, 1, 8, 0, 0, 0))
        );
    }

    #[test]
    fn test_stepped_range() {
        let expr = CronParser::parse("0 10-40/10 * * * *").unwrap();
        assert_eq!(
            expr.next_after(&at(2024, 3, 1, 12, 40, 0)),
            Some(at(2024, 3, 1, 13, 10, 0))
        );
        assert_eq!(
            expr.next_after(&at(2024, 3, 1, 12, 11, 0)),
            Some(at(2024, 3, 1, 12, 20, 0))
        );
    }

    #[test]
    fn test_descriptors() {
        let hourly = CronParser::parse("@hourly").unwrap();
        assert_eq!(
            hourly.next_after(&at(2024, 3, 1, 12, 0, 0)),
            Some(at(2024, 3, 1, 13, 0, 0))
        );

        let every = CronParser::parse("@every 1m30s").unwrap();
        assert_eq!(
            every.next_after(&at(2024, 3, 1, 12, 0, 0)),
            Some(at(2024, 3, 1, 12, 1, 30))
        );
        assert_eq!(every.source(), "@every 1m30s");
    }

    #[test]
    fn test_parse_invalid() {
        for expr in [
            "invalid",
            "* * *",
            "60 * * * *",
            "*/0 * * * * *",
            "5-1 * * * * *",
            "* * * * * FUNDAY",
            "@fortnightly",
            "@every 0s",
            "@every 10",
            "0 0 0 30 2 *",
        ] {
            let err = CronParser::parse(expr).unwrap_err();
            assert!(
                matches!(err, SchedulerError::InvalidScheduleExpression { .. }),
                "{expr} should be rejected"
            );
        }
    }
}
