//! Timestamp decoding for backend payloads.
//!
//! The shipment API emits `createdDate` as RFC 3339, as an offset-less
//! ISO-8601 local date-time, or as epoch milliseconds depending on the
//! serializer in front of it. Offset-less values are read as UTC. Anything
//! else decodes to `None` so that callers treat the field as absent.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

pub fn deserialize_opt<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw.as_ref().and_then(parse_timestamp))
}

pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|millis| millis as i64))
            .and_then(DateTime::from_timestamp_millis),
        Value::String(raw) => parse_timestamp_str(raw),
        _ => None,
    }
}

pub fn parse_timestamp_str(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_rfc3339_with_offset() {
        let parsed = parse_timestamp(&json!("2025-03-01T10:00:00+07:00")).expect("timestamp");
        assert_eq!(parsed, Utc.with_ymd_and_hms(2025, 3, 1, 3, 0, 0).unwrap());
    }

    #[test]
    fn reads_offsetless_iso_as_utc() {
        let parsed = parse_timestamp(&json!("2025-03-01T10:00:00.123")).expect("timestamp");
        assert_eq!(
            parsed.timestamp_millis(),
            Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap().timestamp_millis() + 123
        );
    }

    #[test]
    fn accepts_epoch_millis() {
        let parsed = parse_timestamp(&json!(1_700_000_000_000_i64)).expect("timestamp");
        assert_eq!(parsed.timestamp(), 1_700_000_000);
    }

    #[test]
    fn garbage_is_absent() {
        assert!(parse_timestamp(&json!("yesterday")).is_none());
        assert!(parse_timestamp(&json!(true)).is_none());
        assert!(parse_timestamp_str("   ").is_none());
    }
}
