use chrono::{DateTime, SecondsFormat, Utc};

/// Storage form of a timestamp: UTC RFC 3339 with microseconds and a fixed
/// width, so lexicographic order in SQL equals chronological order. The
/// `completed_at >= started_at` CHECK depends on this.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp. Tolerates any RFC 3339 offset and normalises
/// back to UTC.
pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn fixed_width_keeps_lexicographic_order_chronological() {
        let early = Utc.with_ymd_and_hms(2026, 1, 1, 9, 59, 59).unwrap();
        let late = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        assert!(fmt_ts(early) < fmt_ts(late));
    }

    #[test]
    fn round_trip_preserves_microseconds() {
        let ts = Utc.timestamp_micros(1_767_225_600_123_456).unwrap();
        assert_eq!(parse_ts(&fmt_ts(ts)), Some(ts));
    }

    #[test]
    fn offset_timestamps_normalise_to_utc() {
        let parsed = parse_ts("2026-01-29T10:00:00+02:00").unwrap();
        assert_eq!(fmt_ts(parsed), "2026-01-29T08:00:00.000000Z");
    }
}
