//! Weekly schedules in the `[CRON_TZ=<zone>] <minute> <hour> * * <day-of-week>` form.
//!
//! Only the minute, hour and day-of-week fields are meaningful; day-of-month
//! and month must be `*`. Each field accepts `*`, numbers, ranges (`1-5`),
//! lists (`1,3,5`) and steps (`*/15`, `0-30/10`).

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("schedule must have 5 fields (minute hour day-of-month month day-of-week), got {0}")]
    FieldCount(usize),
    #[error("unknown timezone {0:?}")]
    Timezone(String),
    #[error("{field} field {value:?} is invalid")]
    Field { field: &'static str, value: String },
    #[error("{0} must be '*' in a weekly schedule")]
    NotWeekly(&'static str),
}

/// A parsed weekly schedule. Only constructed through [`FromStr`], so every
/// value held anywhere in the system has already been validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeeklySchedule {
    raw: String,
    tz: Tz,
    minutes: u64,
    hours: u32,
    // bit 0 = Sunday
    days: u8,
}

impl WeeklySchedule {
    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// First instant strictly after `after` matching the schedule, evaluated in
    /// the schedule's timezone. Local times skipped by a DST gap never match.
    pub fn next(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.with_timezone(&self.tz).date_naive();

        for offset in 0..=7 {
            let date = start + Duration::days(offset);
            if self.days & (1 << date.weekday().num_days_from_sunday()) == 0 {
                continue;
            }
            for hour in (0..24).filter(|h| self.hours & (1 << h) != 0) {
                for minute in (0..60).filter(|m| self.minutes & (1 << m) != 0) {
                    let Some(naive) = date.and_hms_opt(hour, minute, 0) else {
                        continue;
                    };
                    let Some(local) = self.tz.from_local_datetime(&naive).earliest() else {
                        continue;
                    };
                    let candidate = local.with_timezone(&Utc);
                    if candidate > after {
                        return Some(candidate);
                    }
                }
            }
        }

        None
    }
}

impl FromStr for WeeklySchedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let (tz, spec) = match raw.strip_prefix("CRON_TZ=") {
            Some(rest) => {
                let (name, spec) = rest
                    .split_once(char::is_whitespace)
                    .ok_or(ScheduleError::FieldCount(0))?;
                let tz = name
                    .parse::<Tz>()
                    .map_err(|_| ScheduleError::Timezone(name.to_string()))?;
                (tz, spec)
            }
            None => (Tz::UTC, raw),
        };

        let fields: Vec<&str> = spec.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(ScheduleError::FieldCount(fields.len()));
        }
        if fields[2] != "*" {
            return Err(ScheduleError::NotWeekly("day-of-month"));
        }
        if fields[3] != "*" {
            return Err(ScheduleError::NotWeekly("month"));
        }

        let minutes = parse_field("minute", fields[0], 0, 59)?;
        let hours = parse_field("hour", fields[1], 0, 23)? as u32;
        let mut days = parse_field("day-of-week", fields[4], 0, 7)?;
        // 7 is an alias for Sunday.
        if days & (1 << 7) != 0 {
            days = (days & !(1 << 7)) | 1;
        }

        Ok(Self {
            raw: raw.to_string(),
            tz,
            minutes,
            hours,
            days: days as u8,
        })
    }
}

fn parse_field(field: &'static str, value: &str, min: u32, max: u32) -> Result<u64, ScheduleError> {
    let invalid = || ScheduleError::Field {
        field,
        value: value.to_string(),
    };
    let number = |s: &str| -> Result<u32, ScheduleError> {
        let n: u32 = s.parse().map_err(|_| invalid())?;
        if n < min || n > max {
            return Err(invalid());
        }
        Ok(n)
    };

    let mut bits = 0u64;
    for part in value.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| invalid())?;
                if step == 0 {
                    return Err(invalid());
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            (number(lo)?, number(hi)?)
        } else {
            let n = number(range)?;
            // `5/10` means "from 5 to the end, every 10".
            (n, if step.is_some() { max } else { n })
        };
        if lo > hi {
            return Err(invalid());
        }

        let mut n = lo;
        while n <= hi {
            bits |= 1u64 << n;
            n += step.unwrap_or(1);
        }
    }

    Ok(bits)
}

impl fmt::Display for WeeklySchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for WeeklySchedule {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for WeeklySchedule {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
