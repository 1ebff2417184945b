//! Schedule parsing and next-fire computation.
//!
//! Cron expressions use the conventional 5-field form (minute resolution) or a 6-field form
//! with a leading seconds field. Day-of-week numbers follow crontab (0 and 7 are Sunday)
//! and are remapped to the `cron` crate's 1 = Sunday numbering before parsing.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use std::str::FromStr;

use super::{CronError, CronSchedule};

/// Parse a 5- or 6-field cron expression.
pub fn parse_cron_expr(expr: &str) -> Result<cron::Schedule, CronError> {
    let mut fields: Vec<String> = expr.split_whitespace().map(String::from).collect();
    match fields.len() {
        5 => fields.insert(0, "0".to_string()),
        6 | 7 => {}
        n => {
            return Err(CronError::ScheduleInvalid(format!(
                "cron expression needs 5 or 6 fields, got {}: '{}'",
                n, expr
            )))
        }
    }
    fields[5] = remap_day_of_week(&fields[5]);
    cron::Schedule::from_str(&fields.join(" "))
        .map_err(|e| CronError::ScheduleInvalid(format!("bad cron expression '{}': {}", expr, e)))
}

fn remap_day_of_week(field: &str) -> String {
    field
        .split(',')
        .map(|part| {
            let (base, step) = match part.split_once('/') {
                Some((b, s)) => (b, Some(s)),
                None => (part, None),
            };
            let mapped = match base.split_once('-') {
                Some((a, b)) => match (a.parse::<u32>(), b.parse::<u32>()) {
                    (Ok(0), Ok(7)) => "1-7".to_string(),
                    (Ok(a), Ok(7)) if step.is_none() => format!("{}-7,1", a % 7 + 1),
                    (Ok(a), Ok(b)) => format!("{}-{}", a % 7 + 1, b % 7 + 1),
                    _ => base.to_string(),
                },
                None => match base.parse::<u32>() {
                    Ok(n) => (n % 7 + 1).to_string(),
                    Err(_) => base.to_string(),
                },
            };
            match step {
                Some(s) => format!("{}/{}", mapped, s),
                None => mapped,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse an ISO-8601 instant. Without an offset it is taken as local time.
pub fn parse_at(s: &str) -> Result<DateTime<Utc>, CronError> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Local
                .from_local_datetime(&naive)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or_else(|| CronError::ScheduleInvalid(format!("'{}' does not exist in local time", s)));
        }
    }
    Err(CronError::ScheduleInvalid(format!(
        "invalid datetime '{}', expected ISO-8601 like 2026-01-31T09:00:00",
        s
    )))
}

/// Check a schedule at creation time.
pub(crate) fn validate(schedule: &CronSchedule, now: DateTime<Utc>, grace: chrono::Duration) -> Result<(), CronError> {
    match schedule {
        CronSchedule::At { at } if *at < now - grace => Err(CronError::ScheduleInvalid(format!(
            "time {} is in the past",
            at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
        ))),
        CronSchedule::At { .. } => Ok(()),
        CronSchedule::Every { every_seconds: 0 } => Err(CronError::ScheduleInvalid(
            "every_seconds must be greater than 0".to_string(),
        )),
        CronSchedule::Every { .. } => Ok(()),
        CronSchedule::Cron { expr } => match next_after(schedule, now)? {
            Some(_) => Ok(()),
            None => Err(CronError::ScheduleInvalid(format!("cron expression '{}' never fires", expr))),
        },
    }
}

/// First fire instant for a new (or re-enabled) job.
pub(crate) fn first_fire(schedule: &CronSchedule, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, CronError> {
    match schedule {
        CronSchedule::At { at } => Ok(Some(*at)),
        _ => next_after(schedule, now),
    }
}

/// Next fire strictly after `now`. One-time jobs have none.
pub fn next_after(schedule: &CronSchedule, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, CronError> {
    match schedule {
        CronSchedule::At { .. } => Ok(None),
        CronSchedule::Every { every_seconds } => {
            let secs = i64::try_from(*every_seconds)
                .map_err(|_| CronError::ScheduleInvalid("interval too large".to_string()))?;
            Ok(now.checked_add_signed(chrono::Duration::seconds(secs)))
        }
        CronSchedule::Cron { expr } => {
            let parsed = parse_cron_expr(expr)?;
            Ok(parsed
                .after(&now.with_timezone(&Local))
                .next()
                .map(|dt| dt.with_timezone(&Utc)))
        }
    }
}

/// Human form of an interval: `30s`, `5m`, `2h`, `1h 30m`.
pub fn format_interval(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    let mut parts = Vec::new();
    if h > 0 {
        parts.push(format!("{}h", h));
    }
    if m > 0 {
        parts.push(format!("{}m", m));
    }
    if s > 0 || parts.is_empty() {
        parts.push(format!("{}s", s));
    }
    parts.join(" ")
}

pub fn describe(schedule: &CronSchedule) -> String {
    match schedule {
        CronSchedule::At { at } => format!(
            "once at {}",
            at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
        ),
        CronSchedule::Every { every_seconds } => format!("every {}", format_interval(*every_seconds)),
        CronSchedule::Cron { expr } => format!("cron '{}'", expr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn day_of_week_follows_crontab_numbering() {
        assert_eq!(remap_day_of_week("*"), "*");
        assert_eq!(remap_day_of_week("0"), "1");
        assert_eq!(remap_day_of_week("7"), "1");
        assert_eq!(remap_day_of_week("1-5"), "2-6");
        assert_eq!(remap_day_of_week("0-7"), "1-7");
        assert_eq!(remap_day_of_week("5-7"), "6-7,1");
        assert_eq!(remap_day_of_week("1,3"), "2,4");
        assert_eq!(remap_day_of_week("MON-FRI"), "MON-FRI");
    }

    #[test]
    fn five_field_expression_fires_on_the_minute() {
        let now = Utc::now();
        let next = next_after(&CronSchedule::Cron { expr: "*/5 * * * *".to_string() }, now)
            .unwrap()
            .unwrap();
        let local = next.with_timezone(&Local);
        assert!(next > now);
        assert_eq!(local.second(), 0);
        assert_eq!(local.minute() % 5, 0);
    }

    #[test]
    fn weekday_expression_skips_weekend() {
        let now = Utc::now();
        let next = next_after(&CronSchedule::Cron { expr: "0 9 * * 1-5".to_string() }, now)
            .unwrap()
            .unwrap()
            .with_timezone(&Local);
        assert!(next.weekday().number_from_monday() <= 5);
        assert_eq!(next.hour(), 9);
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        for bad in ["", "* * *", "61 * * * *", "not a cron at all x"] {
            assert!(matches!(parse_cron_expr(bad), Err(CronError::ScheduleInvalid(_))), "accepted '{}'", bad);
        }
    }

    #[test]
    fn at_accepts_offset_and_local_forms() {
        let utc = parse_at("2030-01-31T09:00:00Z").unwrap();
        assert_eq!(utc.hour(), 9);
        let local = parse_at("2030-01-31T09:00:00").unwrap().with_timezone(&Local);
        assert_eq!((local.hour(), local.minute()), (9, 0));
        assert!(parse_at("2030-01-31 09:00").is_ok());
        assert!(matches!(parse_at("tomorrow"), Err(CronError::ScheduleInvalid(_))));
    }

    #[test]
    fn validation_rules() {
        let now = Utc::now();
        let grace = chrono::Duration::seconds(60);
        let past = CronSchedule::At { at: now - chrono::Duration::minutes(10) };
        assert!(validate(&past, now, grace).is_err());
        let just_past = CronSchedule::At { at: now - chrono::Duration::seconds(5) };
        assert!(validate(&just_past, now, grace).is_ok());
        assert!(validate(&CronSchedule::Every { every_seconds: 0 }, now, grace).is_err());
        assert!(validate(&CronSchedule::Cron { expr: "bogus".to_string() }, now, grace).is_err());
    }

    #[test]
    fn intervals_read_naturally() {
        assert_eq!(format_interval(30), "30s");
        assert_eq!(format_interval(300), "5m");
        assert_eq!(format_interval(5400), "1h 30m");
        assert_eq!(format_interval(0), "0s");
        assert_eq!(describe(&CronSchedule::Every { every_seconds: 7200 }), "every 2h");
    }
}
