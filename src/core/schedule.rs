//! Schedule types and trigger resolution.
//!
//! A [`ScheduleType`] is pure data describing when a task should fire:
//! immediately, on a fixed interval, on a cron expression, or at a single
//! datetime. Resolution turns a schedule plus a requested start time into
//! absolute fire instants.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur when validating or resolving schedules.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// Invalid cron expression.
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    /// Invalid interval (all units zero).
    #[error("invalid interval: {0}")]
    InvalidInterval(String),

    /// Invalid timezone.
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),
}

/// When a task should fire.
///
/// Persisted as tagged JSON alongside the task's trigger binding, so the
/// schedule survives process restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleType {
    /// Fire once, as soon as possible.
    Immediate,

    /// Fire repeatedly on a fixed interval. At least one unit must be
    /// greater than zero.
    Interval {
        #[serde(default)]
        days: u32,
        #[serde(default)]
        hours: u32,
        #[serde(default)]
        minutes: u32,
        #[serde(default)]
        seconds: u32,
    },

    /// Fire on a cron expression, evaluated in `timezone` (5- or 6-field;
    /// 5-field expressions get a `0` seconds field prepended).
    Cron { expression: String, timezone: String },

    /// Fire once at a specific instant. A past instant collapses to
    /// "fire immediately" rather than an error, so late-arriving schedule
    /// requests still run.
    At { datetime: DateTime<Utc> },
}

impl ScheduleType {
    /// Create a validated interval schedule.
    pub fn interval(
        days: u32,
        hours: u32,
        minutes: u32,
        seconds: u32,
    ) -> Result<Self, ScheduleError> {
        let schedule = Self::Interval {
            days,
            hours,
            minutes,
            seconds,
        };
        schedule.validate()?;
        Ok(schedule)
    }

    /// Create a validated cron schedule evaluated in UTC.
    pub fn cron(expression: impl Into<String>) -> Result<Self, ScheduleError> {
        Self::cron_in_timezone(expression, "UTC")
    }

    /// Create a validated cron schedule evaluated in a specific timezone.
    pub fn cron_in_timezone(
        expression: impl Into<String>,
        timezone: impl Into<String>,
    ) -> Result<Self, ScheduleError> {
        let schedule = Self::Cron {
            expression: expression.into(),
            timezone: timezone.into(),
        };
        schedule.validate()?;
        Ok(schedule)
    }

    /// Create a one-shot schedule firing at a specific instant.
    pub fn at(datetime: DateTime<Utc>) -> Self {
        Self::At { datetime }
    }

    /// Validate the schedule expression.
    ///
    /// Bindings loaded back from a durable store re-validate through here
    /// as well, since the stored JSON is not trusted to be well-formed.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        match self {
            Self::Immediate | Self::At { .. } => Ok(()),
            Self::Interval {
                days,
                hours,
                minutes,
                seconds,
            } => {
                if *days == 0 && *hours == 0 && *minutes == 0 && *seconds == 0 {
                    return Err(ScheduleError::InvalidInterval(
                        "at least one unit must be greater than zero".into(),
                    ));
                }
                Ok(())
            }
            Self::Cron {
                expression,
                timezone,
            } => {
                parse_timezone(timezone)?;
                parse_cron(expression)?;
                Ok(())
            }
        }
    }

    /// Whether the schedule produces more than one occurrence.
    pub fn is_recurring(&self) -> bool {
        matches!(self, Self::Interval { .. } | Self::Cron { .. })
    }

    /// Resolve the absolute first fire instant for this schedule.
    ///
    /// An explicit `start_at` in the future delays the first fire; a past
    /// `start_at` (or a past `At` instant) collapses to `now`.
    pub fn first_fire_at(
        &self,
        start_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ScheduleError> {
        let base = match start_at {
            Some(at) if at > now => at,
            _ => now,
        };

        match self {
            Self::Immediate => Ok(base),
            Self::At { datetime } => Ok((*datetime).max(base)),
            Self::Interval { .. } => {
                // First occurrence one interval after the base, matching the
                // semantics of a freshly armed repeating trigger.
                self.next_after(base)?
                    .ok_or_else(|| ScheduleError::InvalidInterval("no occurrence".into()))
            }
            Self::Cron { .. } => self
                .next_after(base)?
                .ok_or_else(|| ScheduleError::InvalidCron("no upcoming occurrence".into())),
        }
    }

    /// The next occurrence strictly after `after`, or `None` for one-shot
    /// schedules.
    pub fn next_after(
        &self,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        match self {
            Self::Immediate | Self::At { .. } => Ok(None),
            Self::Interval { .. } => {
                let duration = self.interval_duration().ok_or_else(|| {
                    ScheduleError::InvalidInterval("interval resolves to zero".into())
                })?;
                Ok(Some(after + duration))
            }
            Self::Cron {
                expression,
                timezone,
            } => {
                let tz = parse_timezone(timezone)?;
                let schedule = parse_cron(expression)?;
                let local = after.with_timezone(&tz);
                Ok(schedule
                    .after(&local)
                    .next()
                    .map(|dt| dt.with_timezone(&Utc)))
            }
        }
    }

    /// Total interval duration, if this is an interval schedule.
    pub fn interval_duration(&self) -> Option<Duration> {
        match self {
            Self::Interval {
                days,
                hours,
                minutes,
                seconds,
            } => {
                let total = i64::from(*days) * 86_400
                    + i64::from(*hours) * 3_600
                    + i64::from(*minutes) * 60
                    + i64::from(*seconds);
                (total > 0).then(|| Duration::seconds(total))
            }
            _ => None,
        }
    }

    /// Human-readable schedule expression for snapshots and logs.
    pub fn expression(&self) -> String {
        match self {
            Self::Immediate => "@immediate".to_string(),
            Self::Interval {
                days,
                hours,
                minutes,
                seconds,
            } => format!("@every {}d{}h{}m{}s", days, hours, minutes, seconds),
            Self::Cron { expression, .. } => expression.clone(),
            Self::At { datetime } => format!("@at {}", datetime.to_rfc3339()),
        }
    }
}

fn parse_timezone(timezone: &str) -> Result<Tz, ScheduleError> {
    timezone
        .parse::<Tz>()
        .map_err(|_| ScheduleError::InvalidTimezone(timezone.to_string()))
}

/// Parse a 5- or 6-field cron expression into an evaluable schedule.
fn parse_cron(expression: &str) -> Result<CronSchedule, ScheduleError> {
    let fields: Vec<&str> = expression.split_whitespace().collect();

    let normalized = match fields.len() {
        // Standard 5-field cron, add seconds field
        5 => format!("0 {}", expression.trim()),
        // Extended 6-field cron with seconds
        6 => expression.trim().to_string(),
        n => {
            return Err(ScheduleError::InvalidCron(format!(
                "expected 5 or 6 fields, got {}",
                n
            )));
        }
    };

    CronSchedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCron(e.to_string()))
}
