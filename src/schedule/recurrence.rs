//! Recurrence Rules
//!
//! Parses the recurrence of a schedule and walks its occurrences.
//!
//! Supported forms:
//! - 5-field cron: `MIN HOUR DOM MON DOW` with `*`, `N`, `A-B`, `*/S`,
//!   `A-B/S` and comma lists. Day-of-week accepts 0-7 (0 and 7 are Sunday).
//! - Presets: `@yearly`, `@annually`, `@monthly`, `@weekly`, `@daily`,
//!   `@midnight`, `@hourly`.
//! - Fixed intervals: `@every 30m` (`s`, `m`, `h`, `d`), anchored at the
//!   schedule start.
//!
//! Example: `0 6 2 * *` fires at 06:00 UTC on the 2nd of every month.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use thiserror::Error;

/// How far ahead or back a cron search may scan before giving up.
/// Eight years covers expressions that only fire on February 29th.
const MAX_SCAN_DAYS: u32 = 366 * 8 + 2;

/// Recurrence parse errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecurrenceError {
    #[error("expression is empty")]
    Empty,

    #[error("expected 5 fields (MIN HOUR DOM MON DOW), found {0}")]
    FieldCount(usize),

    #[error("invalid {field} field '{value}'")]
    InvalidField { field: &'static str, value: String },

    #[error("{field} value {value} is outside {min}-{max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("unknown preset '{0}'")]
    UnknownPreset(String),

    #[error("invalid interval '{0}': expected <n><s|m|h|d>")]
    InvalidInterval(String),

    #[error("expression never fires")]
    NeverFires,
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59 };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23 };
const DAY_OF_MONTH: FieldSpec = FieldSpec { name: "day-of-month", min: 1, max: 31 };
const MONTH: FieldSpec = FieldSpec { name: "month", min: 1, max: 12 };
const DAY_OF_WEEK: FieldSpec = FieldSpec { name: "day-of-week", min: 0, max: 7 };

/// A parsed cron expression. Each field is a bitmask of allowed values.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CronSchedule {
    minutes: u64,
    hours: u64,
    days: u64,
    months: u64,
    weekdays: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

fn has_bit(mask: u64, value: u32) -> bool {
    mask & (1u64 << value) != 0
}

/// Parses one cron field into a bitmask. The flag reports whether the field
/// restricts anything (fields starting with `*` do not).
fn parse_field(text: &str, spec: &FieldSpec) -> Result<(u64, bool), RecurrenceError> {
    let invalid = || RecurrenceError::InvalidField {
        field: spec.name,
        value: text.to_string(),
    };
    let number = |s: &str| -> Result<u32, RecurrenceError> {
        let value: u32 = s.parse().map_err(|_| invalid())?;
        if value < spec.min || value > spec.max {
            return Err(RecurrenceError::OutOfRange {
                field: spec.name,
                value,
                min: spec.min,
                max: spec.max,
            });
        }
        Ok(value)
    };

    let mut mask = 0u64;

    for part in text.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| invalid())?;
                if step == 0 {
                    return Err(invalid());
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (low, high) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range.split_once('-') {
            (number(a)?, number(b)?)
        } else {
            let n = number(range)?;
            // "N/S" means "from N to the end, every S"
            if step.is_some() {
                (n, spec.max)
            } else {
                (n, n)
            }
        };

        if low > high {
            return Err(invalid());
        }

        for value in (low..=high).step_by(step.unwrap_or(1) as usize) {
            mask |= 1u64 << value;
        }
    }

    Ok((mask, !text.starts_with('*')))
}

impl CronSchedule {
    fn parse(expression: &str) -> Result<Self, RecurrenceError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(RecurrenceError::FieldCount(fields.len()));
        }

        let (minutes, _) = parse_field(fields[0], &MINUTE)?;
        let (hours, _) = parse_field(fields[1], &HOUR)?;
        let (days, dom_restricted) = parse_field(fields[2], &DAY_OF_MONTH)?;
        let (months, _) = parse_field(fields[3], &MONTH)?;
        let (mut weekdays, dow_restricted) = parse_field(fields[4], &DAY_OF_WEEK)?;

        // 7 is an alias for Sunday
        if has_bit(weekdays, 7) {
            weekdays = (weekdays & !(1u64 << 7)) | 1;
        }

        Ok(Self {
            minutes,
            hours,
            days,
            months,
            weekdays,
            dom_restricted,
            dow_restricted,
        })
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        if !has_bit(self.months, date.month()) {
            return false;
        }
        let dom = has_bit(self.days, date.day());
        let dow = has_bit(self.weekdays, date.weekday().num_days_from_sunday());

        // Classic cron: when both day fields are restricted, either may match
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    fn first_time_from(&self, hour: u32, minute: u32) -> Option<(u32, u32)> {
        for h in hour..24 {
            if !has_bit(self.hours, h) {
                continue;
            }
            let from = if h == hour { minute } else { 0 };
            if let Some(m) = (from..60).find(|m| has_bit(self.minutes, *m)) {
                return Some((h, m));
            }
        }
        None
    }

    fn last_time_until(&self, hour: u32, minute: u32) -> Option<(u32, u32)> {
        for h in (0..=hour).rev() {
            if !has_bit(self.hours, h) {
                continue;
            }
            let until = if h == hour { minute } else { 59 };
            if let Some(m) = (0..=until).rev().find(|m| has_bit(self.minutes, *m)) {
                return Some((h, m));
            }
        }
        None
    }

    fn at_or_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let t = ceil_minute(t);
        let mut date = t.date_naive();
        let (mut hour, mut minute) = (t.hour(), t.minute());

        for _ in 0..MAX_SCAN_DAYS {
            if self.day_matches(date) {
                if let Some((h, m)) = self.first_time_from(hour, minute) {
                    return date.and_hms_opt(h, m, 0).map(|n| Utc.from_utc_datetime(&n));
                }
            }
            date = date.succ_opt()?;
            hour = 0;
            minute = 0;
        }
        None
    }

    fn at_or_before(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let t = floor_minute(t);
        let mut date = t.date_naive();
        let (mut hour, mut minute) = (t.hour(), t.minute());

        for _ in 0..MAX_SCAN_DAYS {
            if self.day_matches(date) {
                if let Some((h, m)) = self.last_time_until(hour, minute) {
                    return date.and_hms_opt(h, m, 0).map(|n| Utc.from_utc_datetime(&n));
                }
            }
            date = date.pred_opt()?;
            hour = 23;
            minute = 59;
        }
        None
    }
}

fn floor_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    t - Duration::seconds(t.second() as i64) - Duration::nanoseconds(t.nanosecond() as i64)
}

fn ceil_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    let floor = floor_minute(t);
    if floor == t {
        t
    } else {
        floor + Duration::minutes(1)
    }
}

fn preset(name: &str) -> Option<&'static str> {
    match name {
        "@yearly" | "@annually" => Some("0 0 1 1 *"),
        "@monthly" => Some("0 0 1 * *"),
        "@weekly" => Some("0 0 * * 0"),
        "@daily" | "@midnight" => Some("0 0 * * *"),
        "@hourly" => Some("0 * * * *"),
        _ => None,
    }
}

fn parse_interval(text: &str) -> Result<i64, RecurrenceError> {
    let invalid = || RecurrenceError::InvalidInterval(text.to_string());
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(invalid)?;
    let (amount, unit) = text.split_at(split);
    let amount: i64 = amount.parse().map_err(|_| invalid())?;
    let scale = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        _ => return Err(invalid()),
    };
    match amount.checked_mul(scale) {
        Some(secs) if secs > 0 => Ok(secs),
        _ => Err(invalid()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Kind {
    Cron(CronSchedule),
    Every(i64),
}

/// A parsed recurrence rule.
///
/// Interval rules are anchored: their occurrences are `anchor + k * step`,
/// where the anchor is the schedule start. Cron rules ignore the anchor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recurrence {
    expression: String,
    kind: Kind,
}

impl Recurrence {
    pub fn parse(expression: &str) -> Result<Self, RecurrenceError> {
        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Err(RecurrenceError::Empty);
        }

        let kind = if let Some(rest) = trimmed.strip_prefix("@every") {
            Kind::Every(parse_interval(rest.trim())?)
        } else if trimmed.starts_with('@') {
            let cron = preset(trimmed)
                .ok_or_else(|| RecurrenceError::UnknownPreset(trimmed.to_string()))?;
            Kind::Cron(CronSchedule::parse(cron)?)
        } else {
            let cron = CronSchedule::parse(trimmed)?;
            let probe = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).single();
            if probe.and_then(|t| cron.at_or_after(t)).is_none() {
                return Err(RecurrenceError::NeverFires);
            }
            Kind::Cron(cron)
        };

        Ok(Self {
            expression: trimmed.to_string(),
            kind,
        })
    }

    /// The expression this rule was parsed from.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Returns true for `@every` rules.
    pub fn is_interval(&self) -> bool {
        matches!(self.kind, Kind::Every(_))
    }

    /// First occurrence at or after `t`.
    pub fn at_or_after(&self, anchor: DateTime<Utc>, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.kind {
            Kind::Cron(cron) => cron.at_or_after(t),
            Kind::Every(step) => {
                if t <= anchor {
                    return Some(anchor);
                }
                let elapsed = t - anchor;
                let secs = elapsed.num_seconds();
                let partial = elapsed > Duration::seconds(secs);
                let k = secs / step + i64::from(secs % step != 0 || partial);
                offset(anchor, k, *step)
            }
        }
    }

    /// First occurrence strictly after `t`.
    pub fn after(&self, anchor: DateTime<Utc>, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.kind {
            Kind::Cron(cron) => cron.at_or_after(floor_minute(t) + Duration::minutes(1)),
            Kind::Every(step) => {
                if t < anchor {
                    return Some(anchor);
                }
                let k = (t - anchor).num_seconds() / step + 1;
                offset(anchor, k, *step)
            }
        }
    }

    /// Latest occurrence at or before `t`.
    pub fn at_or_before(&self, anchor: DateTime<Utc>, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.kind {
            Kind::Cron(cron) => cron.at_or_before(t),
            Kind::Every(step) => {
                if t < anchor {
                    return None;
                }
                let k = (t - anchor).num_seconds() / step;
                offset(anchor, k, *step)
            }
        }
    }
}

fn offset(anchor: DateTime<Utc>, k: i64, step: i64) -> Option<DateTime<Utc>> {
    let secs = k.checked_mul(step)?;
    anchor.checked_add_signed(Duration::seconds(secs))
}

impl FromStr for Recurrence {
    type Err = RecurrenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_monthly_on_second_at_six() {
        let r = Recurrence::parse("0 6 2 * *").unwrap();
        let anchor = at(2019, 1, 1, 0, 0);
        assert_eq!(r.at_or_after(anchor, anchor), Some(at(2019, 1, 2, 6, 0)));
        assert_eq!(
            r.after(anchor, at(2019, 1, 2, 6, 0)),
            Some(at(2019, 2, 2, 6, 0))
        );
        assert_eq!(
            r.at_or_before(anchor, at(2019, 3, 1, 0, 0)),
            Some(at(2019, 2, 2, 6, 0))
        );
    }

    #[test]
    fn test_presets() {
        let anchor = at(2019, 1, 1, 0, 0);
        let daily = Recurrence::parse("@daily").unwrap();
        assert_eq!(
            daily.after(anchor, at(2019, 1, 1, 0, 0)),
            Some(at(2019, 1, 2, 0, 0))
        );

        let monthly = Recurrence::parse("@monthly").unwrap();
        assert_eq!(
            monthly.after(anchor, at(2019, 1, 15, 3, 0)),
            Some(at(2019, 2, 1, 0, 0))
        );

        let weekly = Recurrence::parse("@weekly").unwrap();
        // 2019-01-06 was a Sunday
        assert_eq!(weekly.at_or_after(anchor, anchor), Some(at(2019, 1, 6, 0, 0)));

        assert!(Recurrence::parse("@fortnightly").is_err());
    }

    #[test]
    fn test_steps_ranges_and_lists() {
        let r = Recurrence::parse("*/15 9-17 * * 1-5").unwrap();
        let anchor = at(2019, 1, 1, 0, 0);
        // Friday 17:50 -> Monday 09:00
        assert_eq!(
            r.after(anchor, at(2019, 1, 4, 17, 50)),
            Some(at(2019, 1, 7, 9, 0))
        );

        let r = Recurrence::parse("5,35 * * * *").unwrap();
        assert_eq!(
            r.after(anchor, at(2019, 1, 1, 10, 5)),
            Some(at(2019, 1, 1, 10, 35))
        );
    }

    #[test]
    fn test_sunday_alias() {
        let a = Recurrence::parse("0 0 * * 0").unwrap();
        let b = Recurrence::parse("0 0 * * 7").unwrap();
        let anchor = at(2019, 1, 1, 0, 0);
        assert_eq!(a.at_or_after(anchor, anchor), b.at_or_after(anchor, anchor));
    }

    #[test]
    fn test_dom_or_dow_when_both_restricted() {
        // 1st of the month OR any Monday
        let r = Recurrence::parse("0 0 1 * 1").unwrap();
        let anchor = at(2019, 1, 1, 0, 0);
        // 2019-01-01 is the 1st; the next match is Monday 2019-01-07
        assert_eq!(
            r.after(anchor, at(2019, 1, 1, 0, 0)),
            Some(at(2019, 1, 7, 0, 0))
        );
    }

    #[test]
    fn test_seconds_are_rounded() {
        let r = Recurrence::parse("* * * * *").unwrap();
        let anchor = at(2019, 1, 1, 0, 0);
        let t = at(2019, 1, 1, 0, 0) + Duration::seconds(30);
        assert_eq!(r.at_or_after(anchor, t), Some(at(2019, 1, 1, 0, 1)));
        assert_eq!(r.at_or_before(anchor, t), Some(at(2019, 1, 1, 0, 0)));
    }

    #[test]
    fn test_leap_day_only() {
        let r = Recurrence::parse("0 0 29 2 *").unwrap();
        let anchor = at(2019, 1, 1, 0, 0);
        assert_eq!(r.at_or_after(anchor, anchor), Some(at(2020, 2, 29, 0, 0)));
    }

    #[test]
    fn test_never_fires() {
        assert_eq!(
            Recurrence::parse("0 0 31 2 *").unwrap_err(),
            RecurrenceError::NeverFires
        );
    }

    #[test]
    fn test_every_interval() {
        let r = Recurrence::parse("@every 6h").unwrap();
        assert!(r.is_interval());
        let anchor = at(2019, 1, 1, 0, 0);
        assert_eq!(r.at_or_after(anchor, at(2018, 6, 1, 0, 0)), Some(anchor));
        assert_eq!(
            r.at_or_after(anchor, at(2019, 1, 1, 1, 0)),
            Some(at(2019, 1, 1, 6, 0))
        );
        assert_eq!(
            r.after(anchor, at(2019, 1, 1, 6, 0)),
            Some(at(2019, 1, 1, 12, 0))
        );
        assert_eq!(
            r.at_or_before(anchor, at(2019, 1, 1, 11, 59)),
            Some(at(2019, 1, 1, 6, 0))
        );
        assert_eq!(r.at_or_before(anchor, at(2018, 12, 31, 0, 0)), None);
    }

    #[test]
    fn test_invalid_expressions() {
        assert_eq!(Recurrence::parse("  ").unwrap_err(), RecurrenceError::Empty);
        assert_eq!(
            Recurrence::parse("0 8 * *").unwrap_err(),
            RecurrenceError::FieldCount(4)
        );
        assert!(matches!(
            Recurrence::parse("60 * * * *").unwrap_err(),
            RecurrenceError::OutOfRange { field: "minute", .. }
        ));
        assert!(Recurrence::parse("*/0 * * * *").is_err());
        assert!(Recurrence::parse("5-1 * * * *").is_err());
        assert!(Recurrence::parse("bad * * * *").is_err());
        assert!(Recurrence::parse("@every").is_err());
        assert!(Recurrence::parse("@every 0m").is_err());
        assert!(Recurrence::parse("@every 10w").is_err());
    }

    #[test]
    fn test_display_keeps_expression() {
        let r: Recurrence = " @daily ".parse().unwrap();
        assert_eq!(r.to_string(), "@daily");
        assert_eq!(r.expression(), "@daily");
    }
}
