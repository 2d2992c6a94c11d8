use std::time::Duration;

use qbrouter_core::migration::GIB;

/// Parse a boolean value from a raw string, accepting common env-style forms.
///
/// Accepted truthy values (case-insensitive): `"1"`, `"true"`, `"yes"`, `"on"`.
/// Accepted falsy values: `"0"`, `"false"`, `"no"`, `"off"`.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a duration given as whole seconds (`"90"`) or in humantime form (`"1m 30s"`).
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("empty duration".into());
    }
    if let Ok(seconds) = trimmed.parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }
    humantime::parse_duration(trimmed).map_err(|err| err.to_string())
}

/// Convert a GiB amount to bytes. Negative and non-finite values are rejected.
pub fn gib_to_bytes(gib: f64) -> Result<u64, String> {
    if !gib.is_finite() || gib < 0.0 {
        return Err(format!("{gib} is not a valid size in GiB"));
    }
    Ok((gib * GIB as f64).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_accept_seconds_and_humantime() {
        assert_eq!(parse_duration("30"), Ok(Duration::from_secs(30)));
        assert_eq!(parse_duration(" 5m "), Ok(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h 30m"), Ok(Duration::from_secs(5400)));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn booleans_accept_env_forms() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn gib_sizes_convert_to_bytes() {
        assert_eq!(gib_to_bytes(50.0), Ok(50 * GIB));
        assert_eq!(gib_to_bytes(0.5), Ok(GIB / 2));
        assert!(gib_to_bytes(-1.0).is_err());
        assert!(gib_to_bytes(f64::NAN).is_err());
    }
}
