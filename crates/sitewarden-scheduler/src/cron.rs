//! Cron expression evaluation.
//!
//! Expressions are authored in the operator's local timezone and every
//! computed instant is returned in UTC. Standard 5-field Unix expressions
//! (minute, hour, day-of-month, month, day-of-week) are converted to the
//! 6-field form (with seconds) the `cron` crate expects, including the
//! day-of-week renumbering: Unix counts Sunday as 0 (or 7), the `cron`
//! crate counts it as 1.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::error::{Result, SchedulerError};

/// Computes next run instants in a fixed timezone.
#[derive(Debug, Clone, Copy)]
pub struct CronEvaluator {
    tz: Tz,
}

impl Default for CronEvaluator {
    fn default() -> Self {
        Self { tz: Tz::UTC }
    }
}

impl CronEvaluator {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    /// Build an evaluator from an IANA timezone name (e.g. "Europe/Athens").
    pub fn from_timezone(name: &str) -> Result<Self> {
        let tz = name
            .parse::<Tz>()
            .map_err(|_| SchedulerError::InvalidTimezone(name.to_string()))?;
        Ok(Self { tz })
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// First instant strictly after `after` that matches `expr`, in UTC.
    pub fn next_after(&self, expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let schedule = parse(expr)?;
        let local = after.with_timezone(&self.tz);
        schedule
            .after(&local)
            .next()
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| SchedulerError::NoUpcomingRun(expr.to_string()))
    }

    /// The next `count` run instants after `after`, in UTC.
    pub fn upcoming(&self, expr: &str, after: DateTime<Utc>, count: usize) -> Result<Vec<DateTime<Utc>>> {
        let schedule = parse(expr)?;
        let local = after.with_timezone(&self.tz);
        Ok(schedule
            .after(&local)
            .take(count)
            .map(|dt| dt.with_timezone(&Utc))
            .collect())
    }
}

/// Validate a cron expression without computing a run time.
pub fn validate(expr: &str) -> Result<()> {
    parse(expr).map(|_| ())
}

fn parse(expr: &str) -> Result<Schedule> {
    let normalized = normalize(expr).ok_or_else(|| SchedulerError::InvalidCron {
        expr: expr.to_string(),
        reason: "expected 5, 6 or 7 fields or an @macro".to_string(),
    })?;
    Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// Rewrite `expr` into the 6/7-field dialect of the `cron` crate.
fn normalize(expr: &str) -> Option<String> {
    let expr = expr.trim();
    let macro_expansion = match expr.to_ascii_lowercase().as_str() {
        "@yearly" | "@annually" => Some("0 0 0 1 1 *"),
        "@monthly" => Some("0 0 0 1 * *"),
        "@weekly" => Some("0 0 0 * * Sun"),
        "@daily" | "@midnight" => Some("0 0 0 * * *"),
        "@hourly" => Some("0 0 * * * *"),
        _ => None,
    };
    if let Some(expanded) = macro_expansion {
        return Some(expanded.to_string());
    }

    let fields: Vec<&str> = expr.split_whitespace().collect();
    match fields.len() {
        5 => {
            let dow = unix_day_of_week(fields[4]);
            Some(format!(
                "0 {} {} {} {} {}",
                fields[0], fields[1], fields[2], fields[3], dow
            ))
        }
        6 | 7 => Some(fields.join(" ")),
        _ => None,
    }
}

/// Translate a Unix day-of-week field (0/7 = Sunday) to `cron` crate
/// numbering (1 = Sunday). Names, `*` and `?` pass through unchanged.
fn unix_day_of_week(field: &str) -> String {
    field
        .split(',')
        .map(unix_day_of_week_item)
        .collect::<Vec<_>>()
        .join(",")
}

fn unix_day_of_week_item(item: &str) -> String {
    let (body, step) = match item.split_once('/') {
        Some((body, step)) => (body, format!("/{step}")),
        None => (item, String::new()),
    };

    if let Some((a, b)) = body.split_once('-') {
        if let (Ok(a), Ok(b)) = (a.parse::<u8>(), b.parse::<u8>()) {
            if a <= 7 && b <= 7 {
                return match (a, b) {
                    (0, 7) => format!("1-7{step}"),
                    (7, 7) => format!("1{step}"),
                    // "5-7" (Fri..Sun) would wrap in 1-based numbering.
                    (a, 7) => format!("{}-7{},1", a + 1, step),
                    (a, b) => format!("{}-{}{}", a % 7 + 1, b + 1, step),
                };
            }
        }
        return item.to_string();
    }

    match body.parse::<u8>() {
        Ok(n) if n <= 7 => format!("{}{}", n % 7 + 1, step),
        _ => item.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    #[test]
    fn normalizes_five_field_expressions() {
        assert_eq!(normalize("* * * * *").as_deref(), Some("0 * * * * *"));
        assert_eq!(normalize("15 3 * * *").as_deref(), Some("0 15 3 * * *"));
        assert_eq!(normalize("0 0 * * * *").as_deref(), Some("0 0 * * * *"));
        assert_eq!(normalize("@daily").as_deref(), Some("0 0 0 * * *"));
        assert!(normalize("* *").is_none());
    }

    #[test]
    fn renumbers_unix_weekdays() {
        assert_eq!(unix_day_of_week("0"), "1");
        assert_eq!(unix_day_of_week("7"), "1");
        assert_eq!(unix_day_of_week("1-5"), "2-6");
        assert_eq!(unix_day_of_week("0,6"), "1,7");
        assert_eq!(unix_day_of_week("5-7"), "6-7,1");
        assert_eq!(unix_day_of_week("0-7"), "1-7");
        assert_eq!(unix_day_of_week("7-7"), "1");
        assert_eq!(unix_day_of_week("0-6/2"), "1-7/2");
        assert_eq!(unix_day_of_week("*"), "*");
        assert_eq!(unix_day_of_week("MON-FRI"), "MON-FRI");
    }

    #[test]
    fn rejects_garbage() {
        assert!(validate("not a cron").is_err());
        assert!(validate("").is_err());
        assert!(validate("0 0 0 0 0 0 0 0").is_err());
        assert!(validate("*/5 * * * *").is_ok());
        assert!(validate("@hourly").is_ok());
        assert!(validate("0 3 * * 0-7").is_ok());
        assert!(validate("0 3 * * 7-7").is_ok());
    }

    #[test]
    fn next_after_is_strictly_later() {
        let eval = CronEvaluator::default();
        let at = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        let next = eval.next_after("0 * * * *", at).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 10, 13, 0, 0).unwrap());
    }

    #[test]
    fn daily_runs_are_a_day_apart() {
        let eval = CronEvaluator::default();
        let at = Utc.with_ymd_and_hms(2026, 3, 10, 0, 0, 0).unwrap();
        let next = eval.next_after("@daily", at).unwrap();
        assert_eq!(next - at, chrono::Duration::hours(24));
    }

    #[test]
    fn local_timezone_is_converted_to_utc() {
        // 02:30 in Athens during winter (UTC+2) is 00:30 UTC.
        let eval = CronEvaluator::from_timezone("Europe/Athens").unwrap();
        let at = Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap();
        let next = eval.next_after("30 2 * * *", at).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 16, 0, 30, 0).unwrap());
    }

    #[test]
    fn unix_monday_means_monday() {
        let eval = CronEvaluator::default();
        // 2026-03-10 is a Tuesday.
        let at = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        let next = eval.next_after("0 9 * * 1", at).unwrap();
        assert_eq!(next.weekday(), Weekday::Mon);
        assert_eq!(next.hour(), 9);
    }

    #[test]
    fn upcoming_lists_in_order() {
        let eval = CronEvaluator::default();
        let at = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        let runs = eval.upcoming("*/15 * * * *", at, 3).unwrap();
        assert_eq!(runs.len(), 3);
        assert!(runs.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(runs[0].minute(), 15);
    }

    #[test]
    fn unknown_timezone_is_rejected() {
        assert!(CronEvaluator::from_timezone("Mars/Olympus").is_err());
    }
}
