use super::cron::WeeklySchedule;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Quiet hours used when a template sets an autostop requirement without one.
pub const DEFAULT_QUIET_HOURS: &str = "CRON_TZ=UTC 0 0 * * *";

/// The requirement never forces a stop sooner than this after a build starts.
pub const MIN_AUTOSTOP_REQUIREMENT_LEAD: Duration = Duration::hours(1);

pub const MAX_AUTOSTOP_REQUIREMENT_WEEKS: i64 = 16;

/// Scheduling policy a template imposes on its workspaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TemplateScheduleOptions {
    pub user_autostart_enabled: bool,
    pub user_autostop_enabled: bool,
    /// 0 means no default.
    pub default_ttl_ms: i64,
    /// 0 means unbounded.
    pub max_ttl_ms: i64,
    #[serde(default)]
    pub autostop_requirement: AutostopRequirement,
}

impl Default for TemplateScheduleOptions {
    fn default() -> Self {
        Self {
            user_autostart_enabled: true,
            user_autostop_enabled: true,
            default_ttl_ms: 0,
            max_ttl_ms: 0,
            autostop_requirement: AutostopRequirement::default(),
        }
    }
}

impl TemplateScheduleOptions {
    pub fn default_ttl(&self) -> Option<Duration> {
        (self.default_ttl_ms > 0).then(|| Duration::milliseconds(self.default_ttl_ms))
    }

    pub fn max_ttl(&self) -> Option<Duration> {
        (self.max_ttl_ms > 0).then(|| Duration::milliseconds(self.max_ttl_ms))
    }
}

/// Forces workspaces to stop during quiet hours on the given days, every
/// `weeks` weeks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct AutostopRequirement {
    /// Bit 0 is Monday ... bit 6 is Sunday. 0 disables the requirement.
    pub days_of_week: u8,
    pub weeks: i64,
    #[schema(value_type = Option<String>)]
    pub quiet_hours: Option<WeeklySchedule>,
}

impl Default for AutostopRequirement {
    fn default() -> Self {
        Self {
            days_of_week: 0,
            weeks: 1,
            quiet_hours: None,
        }
    }
}

impl AutostopRequirement {
    pub fn validate(&self) -> Result<(), String> {
        if self.days_of_week & 0b1000_0000 != 0 {
            return Err("days_of_week only has 7 bits".to_string());
        }
        if self.weeks < 1 || self.weeks > MAX_AUTOSTOP_REQUIREMENT_WEEKS {
            return Err(format!(
                "weeks must be between 1 and {MAX_AUTOSTOP_REQUIREMENT_WEEKS}"
            ));
        }
        Ok(())
    }

    /// Next forced stop at least [`MIN_AUTOSTOP_REQUIREMENT_LEAD`] after `now`,
    /// or `None` when the requirement is disabled.
    pub fn next_required_stop(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.days_of_week == 0 {
            return None;
        }

        let fallback;
        let quiet_hours = match &self.quiet_hours {
            Some(schedule) => schedule,
            None => {
                fallback = DEFAULT_QUIET_HOURS.parse::<WeeklySchedule>().ok()?;
                &fallback
            }
        };

        let weeks = self.weeks.max(1);
        // 1970-01-05 is a Monday; weeks are counted from there.
        let epoch_monday = NaiveDate::from_ymd_opt(1970, 1, 5)?;

        let mut cursor = now + MIN_AUTOSTOP_REQUIREMENT_LEAD;
        for _ in 0..(7 * weeks + 7) {
            let next = quiet_hours.next(cursor)?;
            let local = next.with_timezone(&quiet_hours.timezone()).date_naive();
            let day_bit = 1u8 << local.weekday().num_days_from_monday();
            let week = (local - epoch_monday).num_days().div_euclid(7);
            if self.days_of_week & day_bit != 0 && week.rem_euclid(weeks) == 0 {
                return Some(next);
            }
            cursor = next;
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_disabled_requirement_has_no_stop() {
        let req = AutostopRequirement::default();
        assert_eq!(req.next_required_stop(utc("2024-03-01T10:00:00Z")), None);
    }

    #[test]
    fn test_daily_requirement_uses_next_midnight() {
        let req = AutostopRequirement {
            days_of_week: 0b111_1111,
            weeks: 1,
            quiet_hours: None,
        };
        assert_eq!(
            req.next_required_stop(utc("2024-03-01T10:00:00Z")),
            Some(utc("2024-03-02T00:00:00Z"))
        );
    }

    #[test]
    fn test_requirement_respects_lead_time() {
        let req = AutostopRequirement {
            days_of_week: 0b111_1111,
            weeks: 1,
            quiet_hours: None,
        };
        // 23:30 is within an hour of midnight, so the following midnight is used.
        assert_eq!(
            req.next_required_stop(utc("2024-03-01T23:30:00Z")),
            Some(utc("2024-03-03T00:00:00Z"))
        );
    }

    #[test]
    fn test_saturday_only_requirement() {
        let req = AutostopRequirement {
            days_of_week: 1 << 5,
            weeks: 1,
            quiet_hours: Some("CRON_TZ=UTC 0 2 * * *".parse().unwrap()),
        };
        // Monday 2024-03-04 -> Saturday 2024-03-09 02:00
        assert_eq!(
            req.next_required_stop(utc("2024-03-04T10:00:00Z")),
            Some(utc("2024-03-09T02:00:00Z"))
        );
    }

    #[test]
    fn test_validate_rejects_bad_weeks() {
        let req = AutostopRequirement {
            days_of_week: 1,
            weeks: 0,
            quiet_hours: None,
        };
        assert!(req.validate().is_err());
    }
}
