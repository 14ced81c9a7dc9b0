use super::options::TemplateScheduleOptions;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

pub const TTL_MIN: Duration = Duration::minutes(1);
pub const TTL_MAX: Duration = Duration::days(7);

/// Extensions must leave the workspace running at least this long.
pub const MIN_DEADLINE_EXTENSION: Duration = Duration::minutes(30);

const MS_PER_MINUTE: i64 = 60_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TtlError {
    #[error("time until shutdown must be at least one minute")]
    TooShort,
    #[error("time until shutdown must be less than 7 days")]
    TooLong,
    #[error("time until shutdown must be less than or equal to the template's maximum TTL ({max_minutes} minutes)")]
    ExceedsTemplateMax { max_minutes: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeadlineError {
    #[error("new deadline must be at least 30 minutes in the future")]
    TooSoon,
    #[error("new deadline must be after workspace start time")]
    BeforeStart,
    #[error("new deadline is beyond the workspace's max deadline")]
    ExceedsMaxDeadline,
    #[error("deadline is out of the representable range")]
    OutOfRange,
}

/// Resolves the TTL a workspace should carry.
///
/// A missing or zero TTL falls back to the template default, which itself
/// becomes the template maximum when unset or larger than it. An explicit TTL
/// is truncated to whole minutes and must sit within `[1m, 7d]` and under the
/// template maximum.
pub fn validate_workspace_ttl(
    millis: Option<i64>,
    template_default: Option<Duration>,
    template_max: Option<Duration>,
) -> Result<Option<Duration>, TtlError> {
    let mut default = template_default;
    if let Some(max) = template_max {
        if default.map_or(true, |d| d > max) {
            default = Some(max);
        }
    }

    let ms = match millis {
        None | Some(0) => return Ok(default),
        Some(ms) => ms,
    };

    let ttl = Duration::minutes(ms / MS_PER_MINUTE);
    if ttl < TTL_MIN {
        return Err(TtlError::TooShort);
    }
    if ttl > TTL_MAX {
        return Err(TtlError::TooLong);
    }
    if let Some(max) = template_max {
        if ttl > max {
            return Err(TtlError::ExceedsTemplateMax {
                max_minutes: max.num_minutes(),
            });
        }
    }

    Ok(Some(ttl))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AutostopTimes {
    pub deadline: Option<DateTime<Utc>>,
    pub max_deadline: Option<DateTime<Utc>>,
}

/// Deadlines for a `start` build beginning at `now`.
pub fn calculate_autostop(
    now: DateTime<Utc>,
    workspace_ttl: Option<Duration>,
    options: &TemplateScheduleOptions,
) -> Result<AutostopTimes, DeadlineError> {
    let ttl = match (workspace_ttl, options.max_ttl()) {
        (Some(ttl), Some(max)) => Some(ttl.min(max)),
        (Some(ttl), None) => Some(ttl),
        (None, max) => max,
    };

    let max_deadline = options.autostop_requirement.next_required_stop(now);
    let deadline = match ttl {
        Some(ttl) => {
            let deadline = now.checked_add_signed(ttl).ok_or(DeadlineError::OutOfRange)?;
            match max_deadline {
                Some(max) if deadline > max => Some(max),
                _ => Some(deadline),
            }
        }
        None => None,
    };

    Ok(AutostopTimes {
        deadline,
        max_deadline,
    })
}

/// Deadline after an activity bump, or `None` when nothing should change.
///
/// Only bumps a deadline that is already set (manual shutdown stays manual)
/// and only ever moves it later.
pub fn bump_deadline(
    current: Option<DateTime<Utc>>,
    max_deadline: Option<DateTime<Utc>>,
    ttl: Option<Duration>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, DeadlineError> {
    let (Some(current), Some(ttl)) = (current, ttl) else {
        return Ok(None);
    };

    let mut next = now.checked_add_signed(ttl).ok_or(DeadlineError::OutOfRange)?;
    if let Some(max) = max_deadline {
        if next > max {
            next = max;
        }
    }

    Ok((next > current).then_some(next))
}

pub fn validate_deadline_extension(
    now: DateTime<Utc>,
    started_at: DateTime<Utc>,
    new_deadline: DateTime<Utc>,
    max_deadline: Option<DateTime<Utc>>,
) -> Result<(), DeadlineError> {
    if new_deadline < now + MIN_DEADLINE_EXTENSION {
        return Err(DeadlineError::TooSoon);
    }
    if new_deadline < started_at {
        return Err(DeadlineError::BeforeStart);
    }
    if max_deadline.is_some_and(|max| new_deadline > max) {
        return Err(DeadlineError::ExceedsMaxDeadline);
    }
    Ok(())
}
