//! Parsing of human-readable fire times
//!
//! Accepted forms, tried in order:
//! - RFC 3339: `2025-11-20T15:00:00Z`, `2025-11-20T17:00:00+02:00`
//! - `YYYY-MM-DD HH:MM` or `YYYY-MM-DD HH:MM:SS`, read as UTC
//! - Relative durations: `30m`, `2h`, `1d 6h`, optionally as `+30m` or `in 30m`
//! - Natural language: `tomorrow`, `next friday 8pm`
//!
//! `now` is passed in so callers (and tests) control the reference point.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};

use crate::error::{Result, SchedcastError};

/// Parse a schedule string into an absolute UTC time
///
/// # Errors
///
/// `InvalidInput` if the string is blank or matches none of the forms.
pub fn parse_schedule(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return Err(SchedcastError::InvalidInput(
            "Schedule string cannot be empty".to_string(),
        ));
    }

    if let Some(at) = parse_absolute(input) {
        return Ok(at);
    }

    if let Some(duration) = parse_relative(input) {
        return Ok(now + duration);
    }

    chrono_english::parse_date_string(input, now, chrono_english::Dialect::Us).map_err(|e| {
        SchedcastError::InvalidInput(format!("Could not parse schedule '{}': {}", input, e))
    })
}

fn parse_absolute(input: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(input) {
        return Some(at.with_timezone(&Utc));
    }

    ["%Y-%m-%d %H:%M", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(input, format).ok())
        .map(|naive| naive.and_utc())
}

fn parse_relative(input: &str) -> Option<Duration> {
    let input = input
        .strip_prefix('+')
        .or_else(|| input.strip_prefix("in "))
        .unwrap_or(input)
        .trim();

    let std_duration = humantime::parse_duration(input).ok()?;
    Duration::from_std(std_duration).ok()
}

/// Human-readable distance from `now` to `at`, e.g. "in 2h 5m" or "3m ago"
pub fn format_relative(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = at - now;
    let (seconds, future) = if delta.num_seconds() >= 0 {
        (delta.num_seconds(), true)
    } else {
        (-delta.num_seconds(), false)
    };

    let span = if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m", seconds / 60)
    } else if seconds < 86_400 {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    } else {
        format!("{}d {}h", seconds / 86_400, (seconds % 86_400) / 3600)
    };

    if future {
        format!("in {}", span)
    } else {
        format!("{} ago", span)
    }
}
