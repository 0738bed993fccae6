//! Textual instants at the service boundary: `YYYY-MM-DDThh:mm`, no timezone.

use chrono::{DateTime, Local, NaiveDateTime};

use crate::model::Ms;

pub const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M";

/// Parse a minute-precision naive timestamp into ms on the naive timeline.
pub fn parse_datetime(value: &str) -> Result<Ms, chrono::ParseError> {
    let dt = NaiveDateTime::parse_from_str(value.trim(), DATETIME_FORMAT)?;
    Ok(dt.and_utc().timestamp_millis())
}

/// Inverse of [`parse_datetime`]. Seconds and millis are dropped.
pub fn format_ms(ms: Ms) -> String {
    match DateTime::from_timestamp_millis(ms) {
        Some(dt) => dt.naive_utc().format(DATETIME_FORMAT).to_string(),
        None => ms.to_string(),
    }
}

/// Local wall-clock time as an instant on the naive timeline.
pub fn now_ms() -> Ms {
    Local::now().naive_local().and_utc().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;

    #[test]
    fn parse_minute_precision() {
        let a = parse_datetime("2024-01-01T09:00").unwrap();
        let b = parse_datetime("2024-01-01T10:30").unwrap();
        assert_eq!(b - a, H + H / 2);
    }

    #[test]
    fn parse_epoch() {
        assert_eq!(parse_datetime("1970-01-01T00:00").unwrap(), 0);
        assert_eq!(parse_datetime("1970-01-01T01:00").unwrap(), H);
    }

    #[test]
    fn parse_trims_whitespace() {
        assert_eq!(parse_datetime(" 1970-01-01T00:01 ").unwrap(), 60_000);
    }

    #[test]
    fn parse_rejects_other_formats() {
        assert!(parse_datetime("2024-01-01 09:00").is_err());
        assert!(parse_datetime("2024-01-01T09:00:00").is_err());
        assert!(parse_datetime("2024-01-01").is_err());
        assert!(parse_datetime("2024-13-01T09:00").is_err());
        assert!(parse_datetime("").is_err());
    }

    #[test]
    fn format_roundtrips() {
        let text = "2024-02-29T23:59";
        assert_eq!(format_ms(parse_datetime(text).unwrap()), text);
    }

    #[test]
    fn now_is_on_same_timeline() {
        let now = now_ms();
        assert!(now > parse_datetime("2020-01-01T00:00").unwrap());
    }
}
