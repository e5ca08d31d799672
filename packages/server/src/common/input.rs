//! Centralized parsing for operator-supplied inputs.
//!
//! The admin layer hands the core raw strings for schedule times, durations,
//! and boolean flags. All of them are parsed here and nowhere else; anything
//! that does not match the accepted forms is rejected with `InvalidValue`.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};

use crate::common::error::{CoreError, CoreResult};

/// Parse a 14-digit local-time stamp `YYYYMMDDhhmmss` into UTC.
pub fn parse_timestamp(raw: &str) -> CoreResult<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.len() != 14 || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CoreError::InvalidValue(format!(
            "timestamp must be 14 digits (YYYYMMDDhhmmss), got {:?}",
            raw
        )));
    }

    let naive = NaiveDateTime::parse_from_str(trimmed, "%Y%m%d%H%M%S")
        .map_err(|e| CoreError::InvalidValue(format!("invalid timestamp {:?}: {}", raw, e)))?;

    // Local interpretation; an ambiguous DST instant resolves to the earlier
    // occurrence, a nonexistent one is rejected.
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| CoreError::InvalidValue(format!("timestamp {:?} does not exist locally", raw)))
}

/// Format a UTC instant as the 14-digit local stamp accepted by
/// [`parse_timestamp`].
pub fn format_timestamp(instant: &DateTime<Utc>) -> String {
    instant
        .with_timezone(&Local)
        .format("%Y%m%d%H%M%S")
        .to_string()
}

/// Parse a human-readable duration into seconds.
///
/// Accepts `"30s"`, `"5m"`, `"2h"`, or a bare integer (seconds).
pub fn parse_duration_secs(raw: &str) -> CoreResult<u64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(CoreError::InvalidValue("empty duration".into()));
    }

    let (digits, multiplier) = match trimmed.as_bytes()[trimmed.len() - 1] {
        b's' => (&trimmed[..trimmed.len() - 1], 1),
        b'm' => (&trimmed[..trimmed.len() - 1], 60),
        b'h' => (&trimmed[..trimmed.len() - 1], 3600),
        _ => (trimmed, 1),
    };

    let value: u64 = digits
        .parse()
        .map_err(|_| CoreError::InvalidValue(format!("invalid duration {:?}", raw)))?;

    value
        .checked_mul(multiplier)
        .ok_or_else(|| CoreError::InvalidValue(format!("duration {:?} overflows", raw)))
}

/// Parse an operator boolean flag.
///
/// Truthy forms: `true`, `yes`, `on`, `1` (case-insensitive). The legacy
/// spelling `one` is only honored when the operator enables `accept_one`.
pub fn parse_flag(raw: &str, accept_one: bool) -> bool {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => true,
        "one" => accept_one,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_roundtrips() {
        let parsed = parse_timestamp("20260314093000").unwrap();
        assert_eq!(format_timestamp(&parsed), "20260314093000");
    }

    #[test]
    fn timestamp_rejects_wrong_length() {
        assert!(parse_timestamp("2026031409300").is_err());
        assert!(parse_timestamp("202603140930001").is_err());
        assert!(parse_timestamp("2026-03-14 09:30").is_err());
    }

    #[test]
    fn timestamp_rejects_impossible_dates() {
        assert!(parse_timestamp("20261340093000").is_err());
        assert!(parse_timestamp("20260230093000").is_err());
    }

    #[test]
    fn durations_parse_all_forms() {
        assert_eq!(parse_duration_secs("30s").unwrap(), 30);
        assert_eq!(parse_duration_secs("5m").unwrap(), 300);
        assert_eq!(parse_duration_secs("2h").unwrap(), 7200);
        assert_eq!(parse_duration_secs("45").unwrap(), 45);
    }

    #[test]
    fn durations_reject_garbage() {
        assert!(parse_duration_secs("").is_err());
        assert!(parse_duration_secs("h").is_err());
        assert!(parse_duration_secs("5d").is_err());
        assert!(parse_duration_secs("-30s").is_err());
    }

    #[test]
    fn flags_parse_standard_forms() {
        assert!(parse_flag("true", false));
        assert!(parse_flag("ON", false));
        assert!(parse_flag("1", false));
        assert!(!parse_flag("off", false));
        assert!(!parse_flag("", false));
    }

    #[test]
    fn flag_one_requires_opt_in() {
        assert!(!parse_flag("one", false));
        assert!(parse_flag("one", true));
    }
}
