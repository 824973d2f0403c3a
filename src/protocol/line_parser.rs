//! Text line parsers for the ASCII instruments.
//!
//! The chilled-mirror hygrometer emits lines like
//!
//! ```text
//! 11/13/25  13:41:50   DP =    2.0 C  AT  =   24.1 C  RH  =   23.5    SERVOLOCK
//! ```
//!
//! Labels may be padded with arbitrary whitespace and trailing status words are
//! ignored. The temperature probe answers a poll with a single decimal, optionally
//! labelled or suffixed with a unit.

use chrono::NaiveDateTime;
use once_cell::sync::Lazy;
use regex::Regex;

#[allow(clippy::expect_used)]
static HYGROMETER_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?P<date>\d{2}/\d{2}/\d{2})\s+(?P<time>\d{2}:\d{2}:\d{2})",
        r".*?DP\s*=\s*(?P<dp>[-+]?(?:\d+\.?\d*|\.\d+))\s*C",
        r".*?AT\s*=\s*(?P<at>[-+]?(?:\d+\.?\d*|\.\d+))\s*C",
        r".*?RH\s*=\s*(?P<rh>[-+]?(?:\d+\.?\d*|\.\d+))",
    ))
    .expect("hygrometer pattern is valid")
});

#[allow(clippy::expect_used)]
static PROBE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[A-Za-z]+\s*=?\s*)?(?P<t>[-+]?(?:\d+\.?\d*|\.\d+))\s*(?:°?C)?$")
        .expect("probe pattern is valid")
});

/// One decoded hygrometer status line
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HygrometerSample {
    /// Instrument clock, when the date and time fields form a valid timestamp
    pub instrument_time: Option<NaiveDateTime>,
    /// Dewpoint in °C
    pub dewpoint: f64,
    /// Ambient temperature in °C
    pub ambient_temperature: f64,
    /// Relative humidity in %
    pub relative_humidity: f64,
}

/// Parse a hygrometer line. Returns `None` unless all three quantities are
/// present.
pub fn parse_hygrometer_line(line: &str) -> Option<HygrometerSample> {
    let caps = HYGROMETER_LINE.captures(line)?;
    let dewpoint = caps.name("dp")?.as_str().parse().ok()?;
    let ambient_temperature = caps.name("at")?.as_str().parse().ok()?;
    let relative_humidity = caps.name("rh")?.as_str().parse().ok()?;
    let stamp = format!("{} {}", &caps["date"], &caps["time"]);
    let instrument_time = NaiveDateTime::parse_from_str(&stamp, "%m/%d/%y %H:%M:%S").ok();
    Some(HygrometerSample {
        instrument_time,
        dewpoint,
        ambient_temperature,
        relative_humidity,
    })
}

/// Parse a temperature probe reply in °C
pub fn parse_probe_line(line: &str) -> Option<f64> {
    let caps = PROBE_LINE.captures(line.trim())?;
    caps.name("t")?.as_str().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};

    #[test]
    fn test_servolock_line() {
        let line = "11/13/25  13:41:50   DP =    2.0 C  AT  =   24.1 C  RH  =   23.5    SERVOLOCK";
        let sample = parse_hygrometer_line(line).unwrap();
        assert_eq!(sample.dewpoint, 2.0);
        assert_eq!(sample.ambient_temperature, 24.1);
        assert_eq!(sample.relative_humidity, 23.5);
        let expected = NaiveDate::from_ymd_opt(2025, 11, 13)
            .unwrap()
            .and_time(NaiveTime::from_hms_opt(13, 41, 50).unwrap());
        assert_eq!(sample.instrument_time, Some(expected));
    }

    #[test]
    fn test_negative_dewpoint_and_tight_spacing() {
        let sample = parse_hygrometer_line("01/02/26 08:00:00 DP=-12.5C AT=19.0C RH=8.1").unwrap();
        assert_eq!(sample.dewpoint, -12.5);
        assert_eq!(sample.ambient_temperature, 19.0);
        assert_eq!(sample.relative_humidity, 8.1);
    }

    #[test]
    fn test_impossible_date_keeps_values() {
        let sample = parse_hygrometer_line("13/45/25 13:41:50 DP = 2.0 C AT = 24.1 C RH = 23.5").unwrap();
        assert!(sample.instrument_time.is_none());
        assert_eq!(sample.relative_humidity, 23.5);
    }

    #[test]
    fn test_incomplete_lines_do_not_match() {
        assert!(parse_hygrometer_line("11/13/25  13:41:50   DP =    2.0 C  AT  =   24.1 C").is_none());
        assert!(parse_hygrometer_line("DP = 2.0 C AT = 24.1 C RH = 23.5").is_none());
        assert!(parse_hygrometer_line("").is_none());
        assert!(parse_hygrometer_line("SERVO BALANCE").is_none());
    }

    #[test]
    fn test_probe_replies() {
        assert_eq!(parse_probe_line("23.45"), Some(23.45));
        assert_eq!(parse_probe_line("  -4.0 C "), Some(-4.0));
        assert_eq!(parse_probe_line("T=31.2°C"), Some(31.2));
        assert_eq!(parse_probe_line("+.5"), Some(0.5));
        assert!(parse_probe_line("ERR").is_none());
        assert!(parse_probe_line("23.4 25.1").is_none());
    }
}
