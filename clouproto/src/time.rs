//! Unix timestamps with microsecond resolution and the fixed `±HHMM`
//! timezone the engine formats all human-readable times in.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{FixedOffset, TimeZone};

/// Seconds elapsed since 1970-01-01 UTC.
pub fn timestamp_secs() -> u64 {
    timestamp_parts().0
}

/// Whole seconds and the microsecond fraction since 1970-01-01 UTC.
pub fn timestamp_parts() -> (u64, u32) {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => (elapsed.as_secs(), elapsed.subsec_micros()),
        Err(_) => (0, 0),
    }
}

/// Current unix time as a float with microsecond fraction.
pub fn timestamp() -> f64 {
    let (seconds, micros) = timestamp_parts();
    seconds as f64 + micros as f64 / 1_000_000.0
}

/// Fixed timezone parsed from a 5-symbol `+HHMM` / `-HHMM` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timezone {
    offset_secs: i32,
}

impl Timezone {
    pub fn parse(spec: &str) -> Result<Timezone, String> {
        if spec.len() != 5 || !spec.is_ascii() {
            return Err("timezone must be 5 symbols in the form +HHMM or -HHMM".to_string());
        }
        let sign = match &spec[..1] {
            "+" => 1i32,
            "-" => -1i32,
            _ => return Err("timezone must start with + or -".to_string()),
        };
        let hours: i32 = spec[1..3]
            .parse()
            .map_err(|_| "timezone hours are not a number".to_string())?;
        let minutes: i32 = spec[3..5]
            .parse()
            .map_err(|_| "timezone minutes are not a number".to_string())?;
        if hours > 14 || minutes > 59 {
            return Err(format!("timezone {}{:02}{:02} out of range", spec_sign(sign), hours, minutes));
        }
        Ok(Timezone {
            offset_secs: sign * (hours * 3600 + minutes * 60),
        })
    }

    pub fn utc() -> Timezone {
        Timezone { offset_secs: 0 }
    }

    pub fn label(&self) -> String {
        let sign = spec_sign(self.offset_secs.signum());
        let total = self.offset_secs.abs() / 60;
        format!("{}{:02}{:02}", sign, total / 60, total % 60)
    }

    /// Render a unix timestamp as `DD.MM.YYYY HH:MM:SS.ffffff±HHMM` in this
    /// timezone.
    pub fn format(&self, unix: f64) -> String {
        let seconds = unix.floor() as i64;
        let mut nanos = ((unix - unix.floor()) * 1_000_000.0).round() as u32 * 1_000;
        if nanos >= 1_000_000_000 {
            nanos = 0;
        }
        let offset = match FixedOffset::east_opt(self.offset_secs) {
            Some(offset) => offset,
            None => return String::from("?"),
        };
        match offset.timestamp_opt(seconds, nanos).single() {
            Some(moment) => moment.format("%d.%m.%Y %H:%M:%S%.6f%z").to_string(),
            None => String::from("?"),
        }
    }
}

fn spec_sign(sign: i32) -> char {
    if sign < 0 {
        '-'
    } else {
        '+'
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_monotone_enough() {
        let first = timestamp();
        let second = timestamp();
        assert!(second >= first);
        assert!(first > 1_500_000_000.0);
    }

    #[test]
    fn test_parse_and_label() {
        assert_eq!(Timezone::parse("+0300").unwrap().label(), "+0300");
        assert_eq!(Timezone::parse("-0430").unwrap().label(), "-0430");
        assert_eq!(Timezone::parse("+0000").unwrap(), Timezone::utc());
        assert!(Timezone::parse("0300").is_err());
        assert!(Timezone::parse("+03:0").is_err());
        assert!(Timezone::parse("+9900").is_err());
        assert!(Timezone::parse("UTC").is_err());
    }

    #[test]
    fn test_format_known_moment() {
        let tz = Timezone::parse("+0300").unwrap();
        // 2021-03-14 12:00:00.250000 UTC
        let formatted = tz.format(1_615_723_200.25);
        assert_eq!(formatted, "14.03.2021 15:00:00.250000+0300");
    }

    #[test]
    fn test_format_utc() {
        let tz = Timezone::utc();
        assert_eq!(tz.format(0.0), "01.01.1970 00:00:00.000000+0000");
    }
}
