// ABOUTME: Cron spec parsing and next-firing computation for scheduled script entries
// ABOUTME: Accepts 5-field specs by prepending a zero seconds field, evaluated in a named timezone

use crate::config::ConfigError;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CronSchedule {
    spec: String,
    schedule: Schedule,
    tz: Tz,
}

impl CronSchedule {
    /// Parse a cron spec. Five fields means minute resolution; six or seven
    /// fields are passed through with their own seconds (and year) field.
    pub fn parse(spec: &str, timezone: &str) -> Result<Self, ConfigError> {
        let trimmed = spec.trim();
        let expr = if trimmed.split_whitespace().count() == 5 {
            format!("0 {}", trimmed)
        } else {
            trimmed.to_string()
        };
        let schedule = Schedule::from_str(&expr)
            .map_err(|e| ConfigError::invalid("crons", format!("'{}': {}", spec, e)))?;
        let tz: Tz = timezone
            .parse()
            .map_err(|_| ConfigError::invalid("timezone", format!("unknown timezone '{}'", timezone)))?;
        Ok(Self {
            spec: trimmed.to_string(),
            schedule,
            tz,
        })
    }

    pub fn spec(&self) -> &str {
        &self.spec
    }

    /// First firing strictly after `now`
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&now.with_timezone(&self.tz))
            .next()
            .map(|next| next.with_timezone(&Utc))
    }

    /// How long to sleep from `now` until the next firing
    pub fn until_next(&self, now: DateTime<Utc>) -> Option<Duration> {
        let next = self.next_after(now)?;
        Some((next - now).to_std().unwrap_or(Duration::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_five_field_spec_fires_on_minute_boundary() {
        let schedule = CronSchedule::parse("*/5 * * * *", "UTC").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 10, 2, 30).unwrap();
        let next = schedule.next_after(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 1, 10, 5, 0).unwrap());
        assert_eq!(schedule.until_next(now), Some(Duration::from_secs(150)));
    }

    #[test]
    fn test_six_field_spec_keeps_seconds() {
        let schedule = CronSchedule::parse("30 * * * * *", "UTC").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        assert_eq!(
            schedule.next_after(now).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 30).unwrap()
        );
    }

    #[test]
    fn test_timezone_shifts_firing() {
        let schedule = CronSchedule::parse("0 9 * * *", "Asia/Tokyo").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 30, 0).unwrap();
        // 09:00 JST is 00:00 UTC, so the next one is tomorrow
        assert_eq!(
            schedule.next_after(now).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_invalid_spec_and_timezone_are_config_errors() {
        assert!(matches!(
            CronSchedule::parse("every day", "UTC"),
            Err(ConfigError::InvalidOption { .. })
        ));
        assert!(matches!(
            CronSchedule::parse("* * * * *", "Mars/Olympus"),
            Err(ConfigError::InvalidOption { .. })
        ));
    }
}
