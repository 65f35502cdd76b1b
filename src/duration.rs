//! Duration parsing utilities for human-readable durations like "5m", "24h".

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{de, Deserialize, Deserializer};

/// Parse a duration string like "14d", "24h", "30m", "60s", "250ms".
///
/// Supported units:
/// - `d` - days (24 hours)
/// - `h` - hours
/// - `m` - minutes
/// - `s` - seconds
/// - `ms` - milliseconds
///
/// The input is case-insensitive and whitespace is trimmed.
///
/// # Examples
///
/// ```
/// use omnifolio::duration::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(5 * 60));
/// assert_eq!(parse_duration("24h").unwrap(), Duration::from_secs(24 * 60 * 60));
/// assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
/// ```
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim().to_lowercase();
    let (num, unit) = if s.ends_with("ms") {
        (s.trim_end_matches("ms"), "ms")
    } else if s.ends_with('d') {
        (s.trim_end_matches('d'), "d")
    } else if s.ends_with('h') {
        (s.trim_end_matches('h'), "h")
    } else if s.ends_with('m') {
        (s.trim_end_matches('m'), "m")
    } else if s.ends_with('s') {
        (s.trim_end_matches('s'), "s")
    } else {
        anyhow::bail!("Duration must end with d, h, m, s, or ms");
    };

    let num: u64 = num.parse().with_context(|| "Invalid number in duration")?;

    let millis = match unit {
        "d" => num
            .checked_mul(24 * 60 * 60 * 1000)
            .context("Duration is too large")?,
        "h" => num
            .checked_mul(60 * 60 * 1000)
            .context("Duration is too large")?,
        "m" => num.checked_mul(60 * 1000).context("Duration is too large")?,
        "s" => num.checked_mul(1000).context("Duration is too large")?,
        "ms" => num,
        _ => unreachable!(),
    };

    Ok(Duration::from_millis(millis))
}

/// Format a duration to a human-readable string.
///
/// Uses the largest unit that divides the duration evenly.
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis() as u64;

    const MS_PER_DAY: u64 = 24 * 60 * 60 * 1000;
    const MS_PER_HOUR: u64 = 60 * 60 * 1000;
    const MS_PER_MINUTE: u64 = 60 * 1000;
    const MS_PER_SECOND: u64 = 1000;

    if millis >= MS_PER_DAY && millis % MS_PER_DAY == 0 {
        format!("{}d", millis / MS_PER_DAY)
    } else if millis >= MS_PER_HOUR && millis % MS_PER_HOUR == 0 {
        format!("{}h", millis / MS_PER_HOUR)
    } else if millis >= MS_PER_MINUTE && millis % MS_PER_MINUTE == 0 {
        format!("{}m", millis / MS_PER_MINUTE)
    } else if millis >= MS_PER_SECOND && millis % MS_PER_SECOND == 0 {
        format!("{}s", millis / MS_PER_SECOND)
    } else {
        format!("{millis}ms")
    }
}

/// Serde deserializer for duration strings.
///
/// Use with `#[serde(deserialize_with = "deserialize_duration")]`.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration("24h").unwrap(), Duration::from_secs(24 * 3600));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("60s").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
    }

    #[test]
    fn test_case_and_whitespace() {
        assert_eq!(parse_duration("1D").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration(" 30M ").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_duration("\t250MS\n").unwrap(), Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_input() {
        assert!(parse_duration("1x").is_err());
        assert!(parse_duration("1").is_err());
        assert!(parse_duration("abcd").is_err());
        assert!(parse_duration("-1d").is_err());
        assert!(parse_duration("1.5h").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_overflow_rejected() {
        let max = u64::MAX.to_string();
        assert!(parse_duration(&format!("{max}d")).is_err());
        assert!(parse_duration(&format!("{max}ms")).is_ok());
    }

    #[test]
    fn test_format() {
        assert_eq!(format_duration(Duration::from_secs(86400)), "1d");
        assert_eq!(format_duration(Duration::from_secs(2 * 3600)), "2h");
        assert_eq!(format_duration(Duration::from_secs(300)), "5m");
        assert_eq!(format_duration(Duration::from_secs(45)), "45s");
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_millis(0)), "0ms");
    }

    #[test]
    fn test_roundtrip() {
        let durations = [
            Duration::from_secs(14 * 86400),
            Duration::from_secs(3600),
            Duration::from_secs(300),
            Duration::from_secs(45),
            Duration::from_millis(100),
        ];

        for d in durations {
            let formatted = format_duration(d);
            let parsed = parse_duration(&formatted).unwrap();
            assert_eq!(d, parsed, "Roundtrip failed for {d:?}");
        }
    }

    #[test]
    fn test_serde_deserialize() {
        #[derive(Deserialize)]
        struct TestConfig {
            #[serde(deserialize_with = "deserialize_duration")]
            ttl: Duration,
        }

        let config: TestConfig = toml::from_str(r#"ttl = "5m""#).unwrap();
        assert_eq!(config.ttl, Duration::from_secs(300));
    }
}
