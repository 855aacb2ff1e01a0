//! Logical Windows
//!
//! A [`LogicalWindow`] is one point of a recurrence sequence. It names the
//! time slice a run represents, independent of when the run executes, and
//! supplies the fields substituted into parameter templates.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Substitution fields every window provides.
pub const WINDOW_FIELDS: &[&str] = &[
    "full",
    "year",
    "year-month",
    "month",
    "day",
    "date",
    "ts_nodash",
];

/// A single scheduled time slice, identified by its UTC timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogicalWindow(DateTime<Utc>);

impl LogicalWindow {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self(timestamp)
    }

    /// Parses a window from `YYYY-MM`, `YYYY-MM-DD`, `YYYY-MM-DDTHH:MM[:SS]`
    /// or RFC 3339 text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        parse_timestamp(text).map(Self)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.0
    }

    /// Returns the value of a substitution field, or `None` if the field
    /// does not exist.
    pub fn field(&self, name: &str) -> Option<String> {
        let format = match name {
            "full" => "%Y-%m-%dT%H:%M:%S",
            "year" => "%Y",
            "year-month" => "%Y-%m",
            "month" => "%m",
            "day" => "%d",
            "date" => "%Y-%m-%d",
            "ts_nodash" => "%Y%m%dT%H%M%S",
            _ => return None,
        };
        Some(self.0.format(format).to_string())
    }
}

impl fmt::Display for LogicalWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%dT%H:%M:%S"))
    }
}

impl From<DateTime<Utc>> for LogicalWindow {
    fn from(timestamp: DateTime<Utc>) -> Self {
        Self(timestamp)
    }
}

/// Parses a boundary or window timestamp. Partial dates resolve to the
/// first instant of the period they name.
pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, ConfigError> {
    let text = text.trim();
    let invalid = || ConfigError::InvalidTimestamp {
        value: text.to_string(),
    };

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }

    let date = NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(&format!("{}-01", text), "%Y-%m-%d"))
        .map_err(|_| invalid())?;

    date.and_hms_opt(0, 0, 0)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(y: i32, m: u32, d: u32, h: u32) -> LogicalWindow {
        LogicalWindow::new(Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap())
    }

    #[test]
    fn test_window_fields() {
        let w = window(2019, 3, 2, 6);
        assert_eq!(w.field("full").unwrap(), "2019-03-02T06:00:00");
        assert_eq!(w.field("year").unwrap(), "2019");
        assert_eq!(w.field("year-month").unwrap(), "2019-03");
        assert_eq!(w.field("month").unwrap(), "03");
        assert_eq!(w.field("day").unwrap(), "02");
        assert_eq!(w.field("date").unwrap(), "2019-03-02");
        assert_eq!(w.field("ts_nodash").unwrap(), "20190302T060000");
    }

    #[test]
    fn test_every_listed_field_resolves() {
        let w = window(2020, 12, 31, 23);
        for name in WINDOW_FIELDS {
            assert!(w.field(name).is_some(), "field {} should resolve", name);
        }
        assert!(w.field("hour").is_none());
    }

    #[test]
    fn test_window_equality_and_order() {
        assert_eq!(window(2019, 1, 1, 0), window(2019, 1, 1, 0));
        assert!(window(2019, 1, 1, 0) < window(2019, 2, 1, 0));
    }

    #[test]
    fn test_parse_partial_dates() {
        assert_eq!(LogicalWindow::parse("2019-02").unwrap(), window(2019, 2, 1, 0));
        assert_eq!(
            LogicalWindow::parse("2019-02-02").unwrap(),
            window(2019, 2, 2, 0)
        );
        assert_eq!(
            LogicalWindow::parse("2019-02-02T06:00:00").unwrap(),
            window(2019, 2, 2, 6)
        );
        assert_eq!(
            LogicalWindow::parse("2019-02-02T07:00:00+01:00").unwrap(),
            window(2019, 2, 2, 6)
        );
    }

    #[test]
    fn test_parse_invalid() {
        assert!(LogicalWindow::parse("yesterday").is_err());
        assert!(LogicalWindow::parse("2019-13").is_err());
        assert!(LogicalWindow::parse("").is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(window(2021, 5, 1, 0).to_string(), "2021-05-01T00:00:00");
    }
}
