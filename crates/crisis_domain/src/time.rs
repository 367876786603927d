use std::time::{SystemTime, UNIX_EPOCH};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|d| u64::try_from(d.as_millis()).ok())
        .unwrap_or(0)
}

/// RFC 3339 rendering of a unix millisecond timestamp, always in UTC.
pub fn rfc3339_from_unix_ms(unix_ms: u64) -> String {
    let nanos = i128::from(unix_ms) * 1_000_000;
    OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_else(|| "1970-01-01T00:00:00Z".to_owned())
}

pub fn now_rfc3339() -> String {
    rfc3339_from_unix_ms(now_unix_ms())
}

pub fn unix_ms_from_rfc3339(raw: &str) -> Option<u64> {
    let parsed = OffsetDateTime::parse(raw.trim(), &Rfc3339).ok()?;
    u64::try_from(parsed.unix_timestamp_nanos() / 1_000_000).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc3339_round_trips_through_unix_ms() {
        let rendered = rfc3339_from_unix_ms(1_700_000_000_123);
        assert_eq!(rendered, "2023-11-14T22:13:20.123Z");
        assert_eq!(unix_ms_from_rfc3339(&rendered), Some(1_700_000_000_123));
    }

    #[test]
    fn epoch_renders_without_fraction() {
        assert_eq!(rfc3339_from_unix_ms(0), "1970-01-01T00:00:00Z");
    }

    #[test]
    fn garbage_timestamps_do_not_parse() {
        assert_eq!(unix_ms_from_rfc3339("yesterday"), None);
        assert_eq!(unix_ms_from_rfc3339(""), None);
    }
}
