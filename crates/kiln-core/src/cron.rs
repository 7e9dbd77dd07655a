//! Cron jobs: declarative schedules matched against calendar fields.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::RangeInclusive;
use std::time::Duration;

use chrono::{DateTime, Datelike, TimeZone, Timelike};
use kiln_config::CronEntry;
use tracing::warn;

use crate::error::{KilnError, Result};

/// Timeout of a job that doesn't declare one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

const MONTHS: [&str; 12] = [
    "january",
    "february",
    "march",
    "april",
    "may",
    "june",
    "july",
    "august",
    "september",
    "october",
    "november",
    "december",
];

const WEEKDAYS: [&str; 7] = [
    "sunday",
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
];

/// One of the six calendar fields a job is matched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalendarField {
    Year,
    /// 1 = January.
    Month,
    Day,
    /// 1 = Sunday through 7 = Saturday; 0 is accepted for Sunday.
    Weekday,
    Hour,
    Minute,
}

impl CalendarField {
    fn range(self) -> RangeInclusive<u32> {
        match self {
            CalendarField::Year => 0..=9999,
            CalendarField::Month => 1..=12,
            CalendarField::Day => 1..=31,
            CalendarField::Weekday => 0..=7,
            CalendarField::Hour => 0..=23,
            CalendarField::Minute => 0..=59,
        }
    }

    fn value(self, token: &str) -> Option<u32> {
        if let Ok(n) = token.parse::<u32>() {
            return Some(n);
        }
        let names: &[&str] = match self {
            CalendarField::Month => &MONTHS,
            CalendarField::Weekday => &WEEKDAYS,
            _ => return None,
        };
        let token = token.to_lowercase();
        if token.len() < 3 {
            return None;
        }
        let idx = names.iter().position(|n| n.starts_with(&token))?;
        // idx is below 12
        Some(idx as u32 + 1)
    }
}

impl fmt::Display for CalendarField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CalendarField::Year => "year",
            CalendarField::Month => "month",
            CalendarField::Day => "day",
            CalendarField::Weekday => "weekday",
            CalendarField::Hour => "hour",
            CalendarField::Minute => "minute",
        };
        f.write_str(name)
    }
}

/// The values a field matches: anything, or an explicit set.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FieldSet {
    #[default]
    Any,
    Values(BTreeSet<u32>),
}

impl FieldSet {
    /// Parse `*` or a list of values and inclusive `a-b` ranges separated by
    /// commas or whitespace.
    pub fn parse(field: CalendarField, expr: &str) -> std::result::Result<Self, String> {
        let expr = expr.trim();
        if expr == "*" {
            return Ok(FieldSet::Any);
        }
        let mut values = BTreeSet::new();
        let tokens = expr
            .split(|c: char| matches!(c, ',' | ' ' | '\t' | '\r' | '\n' | '"'))
            .filter(|t| !t.is_empty());
        for token in tokens {
            let (start, end) = match token.split_once('-') {
                Some((a, b)) => (a, b),
                None => (token, token),
            };
            let start = field
                .value(start)
                .ok_or_else(|| format!("invalid {field} value '{token}'"))?;
            let end = field
                .value(end)
                .ok_or_else(|| format!("invalid {field} value '{token}'"))?;
            let range = field.range();
            if !range.contains(&start) || !range.contains(&end) {
                return Err(format!("{field} value '{token}' out of range"));
            }
            if start > end {
                return Err(format!("empty {field} range '{token}'"));
            }
            for v in start..=end {
                // weekday 0 is Sunday, same as 7 in cron but 1 here
                let v = if field == CalendarField::Weekday && v == 0 { 1 } else { v };
                values.insert(v);
            }
        }
        if values.is_empty() {
            return Err(format!("empty {field} expression"));
        }
        Ok(FieldSet::Values(values))
    }

    pub fn matches(&self, value: u32) -> bool {
        match self {
            FieldSet::Any => true,
            FieldSet::Values(values) => values.contains(&value),
        }
    }
}

/// A function invocation scheduled on calendar fields.
#[derive(Debug, Clone, PartialEq)]
pub struct CronJob {
    name: String,
    function: String,
    year: FieldSet,
    month: FieldSet,
    day: FieldSet,
    weekday: FieldSet,
    hour: FieldSet,
    minute: FieldSet,
    timeout: Duration,
}

impl CronJob {
    /// A job that runs every minute until restricted.
    pub fn new(name: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            function: function.into(),
            year: FieldSet::Any,
            month: FieldSet::Any,
            day: FieldSet::Any,
            weekday: FieldSet::Any,
            hour: FieldSet::Any,
            minute: FieldSet::Any,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Build a job named after its function. `None` fields match anything.
    pub fn new_job(
        function: &str,
        year: Option<&str>,
        month: Option<&str>,
        day: Option<&str>,
        weekday: Option<&str>,
        hour: Option<&str>,
        minute: Option<&str>,
    ) -> Result<Self> {
        let fields = [
            (CalendarField::Year, year),
            (CalendarField::Month, month),
            (CalendarField::Day, day),
            (CalendarField::Weekday, weekday),
            (CalendarField::Hour, hour),
            (CalendarField::Minute, minute),
        ];
        let mut job = CronJob::new(function, function);
        for (field, expr) in fields {
            if let Some(expr) = expr {
                job = job.with_field(field, expr)?;
            }
        }
        Ok(job)
    }

    /// Build a job from a `[cron.<name>]` table.
    pub fn from_config(name: &str, entry: &CronEntry) -> Result<Self> {
        let function = entry
            .function
            .as_deref()
            .ok_or_else(|| KilnError::InvalidCron {
                name: name.to_string(),
                reason: "no function given".to_string(),
            })?;
        let mut job = CronJob::new(name, function);
        let fields = [
            (CalendarField::Year, &entry.year),
            (CalendarField::Month, &entry.month),
            (CalendarField::Day, &entry.day),
            (CalendarField::Weekday, &entry.weekday),
            (CalendarField::Hour, &entry.hour),
            (CalendarField::Minute, &entry.minute),
        ];
        for (field, value) in fields {
            if let Some(value) = value {
                job = job.with_field(field, &value.expr())?;
            }
        }
        if let Some(secs) = entry.timeout {
            job.timeout = Duration::from_secs(secs);
        }
        Ok(job)
    }

    /// Build every configured job, skipping invalid ones, shortest timeout first.
    pub fn parse_all(entries: &BTreeMap<String, CronEntry>) -> Vec<CronJob> {
        let mut jobs: Vec<CronJob> = entries
            .iter()
            .filter_map(|(name, entry)| match CronJob::from_config(name, entry) {
                Ok(job) => Some(job),
                Err(e) => {
                    warn!(job = %name, error = %e, "Skipping cron job");
                    None
                }
            })
            .collect();
        CronJob::sort(&mut jobs);
        jobs
    }

    /// Order by ascending timeout, keeping the order of equal ones.
    pub fn sort(jobs: &mut [CronJob]) {
        jobs.sort_by_key(|job| job.timeout);
    }

    /// Restrict one field to the given expression.
    pub fn with_field(mut self, field: CalendarField, expr: &str) -> Result<Self> {
        let set = FieldSet::parse(field, expr).map_err(|reason| KilnError::InvalidCron {
            name: self.name.clone(),
            reason,
        })?;
        match field {
            CalendarField::Year => self.year = set,
            CalendarField::Month => self.month = set,
            CalendarField::Day => self.day = set,
            CalendarField::Weekday => self.weekday = set,
            CalendarField::Hour => self.hour = set,
            CalendarField::Minute => self.minute = set,
        }
        Ok(self)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether every field matches the given instant.
    pub fn applies_to<Tz: TimeZone>(&self, at: &DateTime<Tz>) -> bool {
        u32::try_from(at.year()).is_ok_and(|y| self.year.matches(y))
            && self.month.matches(at.month())
            && self.day.matches(at.day())
            && self.weekday.matches(at.weekday().number_from_sunday())
            && self.hour.matches(at.hour())
            && self.minute.matches(at.minute())
    }
}

/// Milliseconds from `now_ms` (since the epoch) to the start of the next minute.
pub fn millis_to_next_full_minute(now_ms: i64) -> u64 {
    // rem_euclid keeps this in 0..60000
    60_000 - now_ms.rem_euclid(60_000) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Local, Utc};
    use kiln_config::CronField;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_every_minute_matches_everything() {
        let job = CronJob::new_job("tick", None, None, None, None, None, Some("*")).unwrap();
        let mut t = at(2024, 2, 28, 23, 0);
        for _ in 0..(60 * 30) {
            assert!(job.applies_to(&t), "should match {t}");
            t += ChronoDuration::minutes(1);
        }
        assert!(job.applies_to(&Local::now()));
    }

    #[test]
    fn test_each_field_can_reject() {
        // Wednesday 2025-06-11 14:30
        let now = at(2025, 6, 11, 14, 30);
        let job = CronJob::new_job(
            "f",
            Some("2025"),
            Some("june"),
            Some("11"),
            Some("wed"),
            Some("14"),
            Some("30"),
        )
        .unwrap();
        assert!(job.applies_to(&now));

        // 2025-06-18 is also a Wednesday
        let misses = [
            at(2025, 6, 18, 14, 30),
            at(2025, 6, 11, 15, 30),
            at(2025, 6, 11, 14, 31),
        ];
        for t in misses {
            assert!(!job.applies_to(&t), "should not match {t}");
        }

        // moving the year or month also moves the weekday
        let any_weekday = job.clone().with_field(CalendarField::Weekday, "*").unwrap();
        assert!(any_weekday.applies_to(&now));
        assert!(!any_weekday.applies_to(&at(2026, 6, 11, 14, 30)));
        assert!(!any_weekday.applies_to(&at(2025, 7, 11, 14, 30)));

        // Thursday 2025-06-12, every other field still in the set
        let any_day = job.clone().with_field(CalendarField::Day, "*").unwrap();
        assert!(any_day.applies_to(&at(2025, 6, 18, 14, 30)));
        assert!(!any_day.applies_to(&at(2025, 6, 12, 14, 30)));

        let other_weekday = job.with_field(CalendarField::Weekday, "Thursday").unwrap();
        assert!(!other_weekday.applies_to(&now));
    }

    #[test]
    fn test_ranges_and_lists() {
        let set = FieldSet::parse(CalendarField::Minute, "0-5,30 45").unwrap();
        for m in [0, 3, 5, 30, 45] {
            assert!(set.matches(m));
        }
        for m in [6, 29, 31, 59] {
            assert!(!set.matches(m));
        }
    }

    #[test]
    fn test_weekday_numbers() {
        let sunday = FieldSet::parse(CalendarField::Weekday, "0").unwrap();
        assert!(sunday.matches(1));
        let weekend = FieldSet::parse(CalendarField::Weekday, "1,7").unwrap();
        // 2025-06-14 is a Saturday
        let job = CronJob::new("w", "f");
        let job = CronJob {
            weekday: weekend,
            ..job
        };
        assert!(job.applies_to(&at(2025, 6, 14, 0, 0)));
        assert!(!job.applies_to(&at(2025, 6, 13, 0, 0)));
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(FieldSet::parse(CalendarField::Hour, "24").is_err());
        assert!(FieldSet::parse(CalendarField::Minute, "10-5").is_err());
        assert!(FieldSet::parse(CalendarField::Month, "smarch").is_err());
        assert!(FieldSet::parse(CalendarField::Day, "").is_err());
        assert!(CronJob::new_job("f", None, None, None, None, Some("x"), None).is_err());
    }

    #[test]
    fn test_from_config_and_sort() {
        let mut entries = BTreeMap::new();
        entries.insert(
            "slow".to_string(),
            CronEntry {
                function: Some("rebuild".to_string()),
                hour: Some(CronField::Number(3)),
                timeout: Some(3600),
                ..Default::default()
            },
        );
        entries.insert(
            "fast".to_string(),
            CronEntry {
                function: Some("ping".to_string()),
                minute: Some(CronField::Expr("*/x".to_string())),
                ..Default::default()
            },
        );
        entries.insert(
            "quick".to_string(),
            CronEntry {
                function: Some("ping".to_string()),
                timeout: Some(5),
                ..Default::default()
            },
        );
        entries.insert("nofunction".to_string(), CronEntry::default());

        let jobs = CronJob::parse_all(&entries);
        let names: Vec<&str> = jobs.iter().map(CronJob::name).collect();
        assert_eq!(names, vec!["quick", "slow"]);
        assert!(jobs[1].applies_to(&at(2025, 1, 1, 3, 17)));
        assert!(!jobs[1].applies_to(&at(2025, 1, 1, 4, 17)));
    }

    #[test]
    fn test_millis_to_next_full_minute() {
        assert_eq!(millis_to_next_full_minute(0), 60_000);
        assert_eq!(millis_to_next_full_minute(59_000), 1_000);
        assert_eq!(millis_to_next_full_minute(120_500), 59_500);
    }
}
