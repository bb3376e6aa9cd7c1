use chrono::{DateTime, Duration, Utc};
use croner::Cron;
use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactHandle;
use crate::error::ScheduleError;
use crate::types::{ExecutionId, JobId, RunId, TriggeredBy};

/// When a schedule fires. Cron expressions are evaluated in UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleSpec {
    /// Five fields (`min hour dom month dow`) or an `@hourly`-style macro.
    Cron { expression: String },
    Interval { seconds: u64 },
    Once { at: DateTime<Utc> },
}

impl ScheduleSpec {
    pub fn validate(&self) -> Result<(), ScheduleError> {
        match self {
            ScheduleSpec::Cron { expression } => parse_cron(expression).map(|_| ()),
            ScheduleSpec::Interval { seconds } => interval(*seconds).map(|_| ()),
            ScheduleSpec::Once { .. } => Ok(()),
        }
    }

    /// Fire time for a freshly created (or re-armed) schedule.
    pub fn first_fire(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        match self {
            ScheduleSpec::Once { at } => Ok(Some(*at)),
            _ => self.next_after(None, now),
        }
    }

    /// Fire time after a fire at `now`; always strictly later than `now`.
    ///
    /// Intervals stay anchored to `previous` while it is not too far behind.
    pub fn next_after(
        &self,
        previous: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        match self {
            ScheduleSpec::Cron { expression } => {
                let cron = parse_cron(expression)?;
                cron.find_next_occurrence(&now, false)
                    .map(Some)
                    .map_err(|e| ScheduleError::InvalidSpec(format!("{expression}: {e}")))
            }
            ScheduleSpec::Interval { seconds } => {
                let step = interval(*seconds)?;
                let anchored = previous.and_then(|p| p.checked_add_signed(step));
                let next = match anchored {
                    Some(next) if next > now => Some(next),
                    _ => now.checked_add_signed(step),
                };
                next.map(Some).ok_or_else(|| {
                    ScheduleError::InvalidSpec(format!("interval of {seconds}s overflows"))
                })
            }
            ScheduleSpec::Once { .. } => Ok(None),
        }
    }
}

fn parse_cron(expression: &str) -> Result<Cron, ScheduleError> {
    let expression = expression.trim();
    let fields = expression.split_whitespace().count();
    if !expression.starts_with('@') && fields != 5 {
        return Err(ScheduleError::InvalidSpec(format!(
            "cron expression needs 5 fields, got {fields}: {expression}"
        )));
    }
    Cron::new(expression)
        .parse()
        .map_err(|e| ScheduleError::InvalidSpec(format!("{expression}: {e}")))
}

fn interval(seconds: u64) -> Result<Duration, ScheduleError> {
    if seconds == 0 {
        return Err(ScheduleError::InvalidSpec("interval must be positive".into()));
    }
    i64::try_from(seconds)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or_else(|| ScheduleError::InvalidSpec(format!("interval of {seconds}s is too large")))
}

/// The migration a schedule starts each time it fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationTemplate {
    pub inventory_ref: ArtifactHandle,
    pub target_catalog: String,
    pub target_schema: String,
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastRun {
    pub run_id: RunId,
    pub execution_id: ExecutionId,
    pub fired_at: DateTime<Utc>,
    pub triggered_by: TriggeredBy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub job_id: JobId,
    pub name: String,
    pub spec: ScheduleSpec,
    pub template: MigrationTemplate,
    pub enabled: bool,
    /// `None` once a one-shot schedule has fired.
    pub next_fire_at: Option<DateTime<Utc>>,
    pub last_run: Option<LastRun>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_fire_at.is_some_and(|at| at <= now)
    }
}

/// Input to `Scheduler::create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSchedule {
    pub name: String,
    pub spec: ScheduleSpec,
    pub template: MigrationTemplate,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

/// Fields to change on an existing schedule; `None` leaves a field as is.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulePatch {
    pub name: Option<String>,
    pub spec: Option<ScheduleSpec>,
    pub template: Option<MigrationTemplate>,
    pub enabled: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn cron(expression: &str) -> ScheduleSpec {
        ScheduleSpec::Cron {
            expression: expression.into(),
        }
    }

    #[test]
    fn test_cron_next_fire() {
        let now = at(2026, 3, 10, 14, 7, 30);
        let next = cron("*/15 * * * *").next_after(None, now).unwrap();
        assert_eq!(next, Some(at(2026, 3, 10, 14, 15, 0)));

        let next = cron("0 2 * * *").next_after(None, now).unwrap();
        assert_eq!(next, Some(at(2026, 3, 11, 2, 0, 0)));

        let next = cron("30 9 1 * *").next_after(None, now).unwrap();
        assert_eq!(next, Some(at(2026, 4, 1, 9, 30, 0)));
    }

    #[test]
    fn test_cron_is_strictly_later() {
        let now = at(2026, 3, 10, 14, 15, 0);
        let next = cron("*/15 * * * *").next_after(None, now).unwrap().unwrap();
        assert_eq!(next, at(2026, 3, 10, 14, 30, 0));
    }

    #[test]
    fn test_cron_macros_and_lists() {
        let now = at(2026, 3, 10, 14, 7, 30);
        assert_eq!(
            cron("@hourly").next_after(None, now).unwrap(),
            Some(at(2026, 3, 10, 15, 0, 0))
        );
        assert_eq!(
            cron("@daily").next_after(None, now).unwrap(),
            Some(at(2026, 3, 11, 0, 0, 0))
        );
        assert_eq!(
            cron("0 8,20 * * *").next_after(None, now).unwrap(),
            Some(at(2026, 3, 10, 20, 0, 0))
        );
        assert_eq!(
            cron("0 9-17/4 * * *").next_after(None, now).unwrap(),
            Some(at(2026, 3, 10, 17, 0, 0))
        );
    }

    #[test]
    fn test_invalid_specs() {
        assert!(cron("* * *").validate().is_err());
        assert!(cron("* * * * * *").validate().is_err());
        assert!(cron("61 * * * *").validate().is_err());
        assert!(ScheduleSpec::Interval { seconds: 0 }.validate().is_err());
        let err = cron("nope").validate().unwrap_err();
        assert_eq!(err.kind(), "invalid_spec");
    }

    #[test]
    fn test_interval_advance() {
        let spec = ScheduleSpec::Interval { seconds: 60 };
        let prev = at(2026, 3, 10, 14, 0, 0);

        let next = spec.next_after(Some(prev), at(2026, 3, 10, 14, 0, 5)).unwrap();
        assert_eq!(next, Some(at(2026, 3, 10, 14, 1, 0)));

        // Far behind: re-anchor on now.
        let now = at(2026, 3, 10, 15, 0, 5);
        let next = spec.next_after(Some(prev), now).unwrap();
        assert_eq!(next, Some(at(2026, 3, 10, 15, 1, 5)));
    }

    #[test]
    fn test_once() {
        let when = at(2026, 1, 1, 0, 0, 0);
        let spec = ScheduleSpec::Once { at: when };
        assert_eq!(spec.first_fire(at(2026, 6, 1, 0, 0, 0)).unwrap(), Some(when));
        assert_eq!(spec.next_after(Some(when), when).unwrap(), None);
    }

    #[test]
    fn test_spec_json_shape() {
        let json = serde_json::to_value(ScheduleSpec::Interval { seconds: 300 }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "interval", "seconds": 300}));
    }
}
