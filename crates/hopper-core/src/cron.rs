//! Cron evaluation.
//!
//! Accepts the classic 5-field form (`minute hour day month weekday`) as well
//! as the 6/7-field form with seconds (and year) understood by the `cron`
//! crate. A 5-field expression fires at second 0.
//!
//! Weekdays are best written by name (`MON-FRI`); numeric weekdays follow the
//! `cron` crate numbering (1 = Sunday).

use chrono::{DateTime, Utc, Weekday};
use cron::Schedule;
use std::str::FromStr;

use crate::{Error, Result};

/// A parsed cron expression.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: Schedule,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let trimmed = expression.trim();
        let normalized = match trimmed.split_whitespace().count() {
            5 => format!("0 {}", trimmed),
            6 | 7 => trimmed.to_string(),
            n => {
                return Err(Error::InvalidCron {
                    expression: expression.to_string(),
                    message: format!("expected 5, 6 or 7 fields, found {}", n),
                });
            }
        };

        let schedule = Schedule::from_str(&normalized).map_err(|e| Error::InvalidCron {
            expression: expression.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self {
            expression: trimmed.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First fire time strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&now).next()
    }
}

/// Next fire time of `expression` strictly after `now`.
///
/// Pure: depends only on its arguments, so catching up after downtime never
/// yields a time in the past.
pub fn next_fire_at(expression: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    CronSchedule::parse(expression)?
        .next_after(now)
        .ok_or_else(|| Error::InvalidCron {
            expression: expression.to_string(),
            message: "schedule has no upcoming fire time".to_string(),
        })
}

/// Builders for common expressions.
pub struct Cron;

impl Cron {
    pub fn minutely() -> String {
        "* * * * *".to_string()
    }

    pub fn minute_interval(minutes: u32) -> String {
        format!("*/{} * * * *", minutes)
    }

    pub fn hourly() -> String {
        "0 * * * *".to_string()
    }

    pub fn daily(hour: u32, minute: u32) -> String {
        format!("{} {} * * *", minute, hour)
    }

    pub fn weekly(day: Weekday, hour: u32, minute: u32) -> String {
        format!("{} {} * * {}", minute, hour, weekday_name(day))
    }

    pub fn monthly(day: u32, hour: u32, minute: u32) -> String {
        format!("{} {} {} * *", minute, hour, day)
    }
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "MON",
        Weekday::Tue => "TUE",
        Weekday::Wed => "WED",
        Weekday::Thu => "THU",
        Weekday::Fri => "FRI",
        Weekday::Sat => "SAT",
        Weekday::Sun => "SUN",
    }
}
