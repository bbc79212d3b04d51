//! Five-field calendar patterns.
//!
//! A line is `<minute> <hour> <day> <month> <weekday> [task text]`. Each
//! field is `*`, `*/N` or an exact integer. Weekdays count from Monday = 1.

use std::fmt;

use chrono::{Datelike, NaiveDateTime, Timelike};

use crate::error::ScheduleError;

/// One calendar field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Any,
    /// `*/N`: matches values evenly divisible by N.
    Step(u32),
    Exact(u32),
    /// An unparseable token. Never matches.
    Never,
}

impl Field {
    pub fn parse(token: &str) -> Self {
        if token == "*" {
            return Self::Any;
        }
        if let Some(step) = token.strip_prefix("*/") {
            return match step.parse::<u32>() {
                Ok(n) if n > 0 => Self::Step(n),
                _ => {
                    tracing::warn!("Invalid step '{}' in schedule field, it will never match", token);
                    Self::Never
                }
            };
        }
        match token.parse::<u32>() {
            Ok(n) => Self::Exact(n),
            Err(_) => {
                tracing::warn!("Invalid schedule field '{}', it will never match", token);
                Self::Never
            }
        }
    }

    pub fn matches(&self, value: u32) -> bool {
        match self {
            Self::Any => true,
            Self::Step(n) => value % n == 0,
            Self::Exact(n) => *n == value,
            Self::Never => false,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "*"),
            Self::Step(n) => write!(f, "*/{n}"),
            Self::Exact(n) => write!(f, "{n}"),
            Self::Never => write!(f, "!"),
        }
    }
}

/// A parsed schedule line.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    line: String,
    pub minute: Field,
    pub hour: Field,
    pub day: Field,
    pub month: Field,
    pub weekday: Field,
    /// Text after the calendar fields, if any.
    pub task_text: Option<String>,
    last_match: Option<NaiveDateTime>,
}

impl ScheduleEntry {
    /// Parse a line. Fewer than five whitespace-separated tokens is an error.
    pub fn parse(line: &str) -> Result<Self, ScheduleError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 5 {
            return Err(ScheduleError::Malformed {
                line: line.to_string(),
                found: tokens.len(),
            });
        }
        let task_text = (tokens.len() > 5).then(|| tokens[5..].join(" "));
        Ok(Self {
            line: line.trim().to_string(),
            minute: Field::parse(tokens[0]),
            hour: Field::parse(tokens[1]),
            day: Field::parse(tokens[2]),
            month: Field::parse(tokens[3]),
            weekday: Field::parse(tokens[4]),
            task_text,
            last_match: None,
        })
    }

    pub fn line(&self) -> &str {
        &self.line
    }

    pub fn last_match(&self) -> Option<NaiveDateTime> {
        self.last_match
    }

    /// Record `now` (floored to the minute) as the last check and test every
    /// field against it.
    pub fn matches(&mut self, now: &NaiveDateTime) -> bool {
        self.last_match = Some(floor_minute(now));
        self.minute.matches(now.minute())
            && self.hour.matches(now.hour())
            && self.day.matches(now.day())
            && self.month.matches(now.month())
            && self.weekday.matches(now.weekday().number_from_monday())
    }

    /// True when `now` falls in a different minute than the last check.
    pub fn changed(&self, now: &NaiveDateTime) -> bool {
        self.last_match != Some(floor_minute(now))
    }
}

impl fmt::Display for ScheduleEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.line)
    }
}

fn floor_minute(now: &NaiveDateTime) -> NaiveDateTime {
    now.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(*now)
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn wildcard_matches_and_changes_per_minute() {
        let mut entry = ScheduleEntry::parse("* * * * * noop").unwrap();
        assert_eq!(entry.task_text.as_deref(), Some("noop"));
        let now = at(2024, 3, 5, 10, 30, 12);
        assert!(entry.changed(&now));
        assert!(entry.matches(&now));
        assert!(!entry.changed(&now));
        assert!(!entry.changed(&at(2024, 3, 5, 10, 30, 59)));
        assert!(entry.changed(&at(2024, 3, 5, 10, 31, 0)));
        assert_eq!(entry.last_match(), Some(at(2024, 3, 5, 10, 30, 0)));
    }

    #[test]
    fn fewer_than_five_fields_is_malformed() {
        let err = ScheduleEntry::parse("* * * *").unwrap_err();
        assert_eq!(
            err,
            ScheduleError::Malformed {
                line: "* * * *".to_string(),
                found: 4
            }
        );
        let entry = ScheduleEntry::parse("0 12 * * 1").unwrap();
        assert!(entry.task_text.is_none());
    }

    #[test]
    fn step_exact_and_weekday() {
        // 2024-03-04 is a Monday.
        let mut entry = ScheduleEntry::parse("*/15 9 * 3 1 echo hi there").unwrap();
        assert_eq!(entry.task_text.as_deref(), Some("echo hi there"));
        assert!(entry.matches(&at(2024, 3, 4, 9, 45, 0)));
        assert!(!entry.matches(&at(2024, 3, 4, 9, 44, 0)));
        assert!(!entry.matches(&at(2024, 3, 5, 9, 45, 0)));
        assert!(!entry.matches(&at(2024, 4, 1, 10, 0, 0)));

        let mut sunday = ScheduleEntry::parse("0 0 * * 7").unwrap();
        assert!(sunday.matches(&at(2024, 3, 10, 0, 0, 0)));
    }

    #[test]
    fn bad_tokens_never_match() {
        assert_eq!(Field::parse("*/0"), Field::Never);
        assert_eq!(Field::parse("mon"), Field::Never);
        let mut entry = ScheduleEntry::parse("x * * * *").unwrap();
        assert!(!entry.matches(&at(2024, 1, 1, 0, 0, 0)));
    }
}
