//! Recurring definitions.
//!
//! A recurring definition is a named template. Each fire spawns a brand new
//! job instance; the definition itself never runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::cron::{CronSchedule, next_fire_at};
use crate::job::{DEFAULT_QUEUE, Job, NewJob, Payload};
use crate::{Error, JobId, Result};

/// What to do when a definition fires while its previous instance is still
/// in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Skip this fire and move the schedule on.
    #[default]
    Skip,
    /// Spawn another instance regardless.
    Allow,
}

impl OverlapPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverlapPolicy::Skip => "skip",
            OverlapPolicy::Allow => "allow",
        }
    }
}

impl fmt::Display for OverlapPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OverlapPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "skip" => Ok(OverlapPolicy::Skip),
            "allow" => Ok(OverlapPolicy::Allow),
            other => Err(Error::InvalidInput(format!(
                "unknown overlap policy: {}",
                other
            ))),
        }
    }
}

/// Optional knobs for `add_or_update_recurring`.
#[derive(Debug, Clone)]
pub struct RecurringOptions {
    pub queue: String,
    pub overlap: OverlapPolicy,
    pub max_retries: Option<u32>,
}

impl Default for RecurringOptions {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            overlap: OverlapPolicy::default(),
            max_retries: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringDefinition {
    pub name: String,
    pub cron_expression: String,
    pub queue: String,
    pub payload_template: Payload,
    pub overlap: OverlapPolicy,
    pub max_retries: Option<u32>,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub next_fire_at: DateTime<Utc>,
    pub last_job_id: Option<JobId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecurringDefinition {
    pub fn new(
        name: impl Into<String>,
        cron_expression: &str,
        payload_template: Payload,
        options: RecurringOptions,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::InvalidInput(
                "recurring definition name must not be empty".to_string(),
            ));
        }

        let schedule = CronSchedule::parse(cron_expression)?;
        let next_fire_at = next_fire_at(schedule.expression(), now)?;

        Ok(Self {
            name,
            cron_expression: schedule.expression().to_string(),
            queue: options.queue,
            payload_template,
            overlap: options.overlap,
            max_retries: options.max_retries,
            last_fired_at: None,
            next_fire_at,
            last_job_id: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Carry bookkeeping over from the stored version of the same definition.
    pub fn merge_existing(mut self, existing: &RecurringDefinition) -> Self {
        self.created_at = existing.created_at;
        self.last_fired_at = existing.last_fired_at;
        self.last_job_id = existing.last_job_id;
        self
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_fire_at <= now
    }

    /// A fresh instance of the template, enqueued at `now`.
    pub fn spawn(&self, default_max_retries: u32, now: DateTime<Utc>) -> Job {
        let mut new = NewJob::new(self.payload_template.clone()).on_queue(self.queue.clone());
        new.max_retries = self.max_retries;

        let mut job = Job::enqueued(new, default_max_retries, now);
        job.recurring_name = Some(self.name.clone());
        job.cron_expression = Some(self.cron_expression.clone());
        job
    }

    /// Next fire time computed from `now`, not from the missed
    /// `next_fire_at`, so downtime never produces a backlog.
    pub fn following_fire(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        next_fire_at(&self.cron_expression, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 30).unwrap()
    }

    fn minutely() -> RecurringDefinition {
        RecurringDefinition::new(
            "report",
            "* * * * *",
            Payload::bare("report"),
            RecurringOptions::default(),
            t0(),
        )
        .unwrap()
    }

    #[test]
    fn test_new_computes_first_fire() {
        let def = minutely();
        assert_eq!(
            def.next_fire_at,
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 1, 0).unwrap()
        );
        assert!(!def.is_due(t0()));
        assert!(def.is_due(def.next_fire_at));
    }

    #[test]
    fn test_following_fire_after_outage_is_in_future() {
        let def = minutely();
        let now = t0() + Duration::hours(5) + Duration::seconds(7);
        let next = def.following_fire(now).unwrap();
        assert!(next > now);
        assert!(next - now <= Duration::minutes(1));
    }

    #[test]
    fn test_spawn_creates_enqueued_instance() {
        let def = minutely();
        let now = def.next_fire_at;
        let first = def.spawn(3, now);
        let second = def.spawn(3, now);

        assert_ne!(first.id, second.id);
        assert_eq!(first.state, crate::JobState::Enqueued);
        assert_eq!(first.recurring_name.as_deref(), Some("report"));
        assert_eq!(first.cron_expression.as_deref(), Some("* * * * *"));
        assert_eq!(first.enqueue_at, Some(now));
        assert_eq!(first.max_retries, 3);
    }

    #[test]
    fn test_invalid_definitions() {
        let bad_cron = RecurringDefinition::new(
            "x",
            "not cron",
            Payload::bare("x"),
            RecurringOptions::default(),
            t0(),
        );
        assert!(matches!(bad_cron, Err(Error::InvalidCron { .. })));

        let no_name = RecurringDefinition::new(
            "  ",
            "* * * * *",
            Payload::bare("x"),
            RecurringOptions::default(),
            t0(),
        );
        assert!(matches!(no_name, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_overlap_policy_parse() {
        assert_eq!("skip".parse::<OverlapPolicy>().unwrap(), OverlapPolicy::Skip);
        assert_eq!("allow".parse::<OverlapPolicy>().unwrap(), OverlapPolicy::Allow);
        assert!("queue".parse::<OverlapPolicy>().is_err());
    }
}
