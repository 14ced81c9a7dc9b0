//! Scheduling engine: TTL validation, deadline math, weekly schedules.
//!
//! Everything here is pure; the orchestrator feeds it rows and persists the
//! results.

pub mod autostop;
pub mod cron;
pub mod options;

pub use autostop::{
    bump_deadline, calculate_autostop, validate_deadline_extension, validate_workspace_ttl,
    AutostopTimes, DeadlineError, TtlError, MIN_DEADLINE_EXTENSION, TTL_MAX, TTL_MIN,
};
pub use cron::{ScheduleError, WeeklySchedule};
pub use options::{AutostopRequirement, TemplateScheduleOptions};
