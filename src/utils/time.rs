//! Wall-clock helpers. All pipeline timestamps are unix epoch milliseconds.

use chrono::{DateTime, NaiveDate, Utc};

pub fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Parse a timestamp in any of the shapes market data arrives in:
/// epoch seconds, epoch millis, RFC 3339, or a bare `YYYY-MM-DD` date.
pub fn parse_timestamp_ms(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(n) = raw.parse::<f64>() {
        if !n.is_finite() || n <= 0.0 {
            return None;
        }
        // Anything below 1e12 cannot be millis after 2001, treat as seconds.
        let ms = if n < 1e12 { n * 1000.0 } else { n };
        return Some(ms as u64);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        let ms = dt.timestamp_millis();
        return (ms > 0).then_some(ms as u64);
    }
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let ms = d.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis();
        return (ms > 0).then_some(ms as u64);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("1706800000", Some(1_706_800_000_000))]
    #[case("1706800000123", Some(1_706_800_000_123))]
    #[case("2024-02-01T15:06:40Z", Some(1_706_800_000_000))]
    #[case("2024-02-01", Some(1_706_745_600_000))]
    #[case("", None)]
    #[case("-5", None)]
    #[case("yesterday", None)]
    fn parses_supported_shapes(#[case] raw: &str, #[case] expected: Option<u64>) {
        assert_eq!(parse_timestamp_ms(raw), expected);
    }

    #[test]
    fn now_is_positive() {
        assert!(now_ms() > 1_600_000_000_000);
    }
}
