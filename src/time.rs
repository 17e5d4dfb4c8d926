use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn to_date(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
}

/// Render a millisecond timestamp the way it is stored in the audit trail.
pub fn format_ms(ms: i64) -> String {
    match to_date(ms) {
        Some(date) => date.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => ms.to_string(),
    }
}

/// Normalise a user supplied date into UTC milliseconds.
///
/// Accepts RFC 3339 timestamps (any offset) and bare `YYYY-MM-DD` dates, which
/// are taken as midnight UTC.
pub fn parse_date_ms(input: &str) -> Option<i64> {
    let trimmed = input.trim();
    if let Ok(date) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(date.with_timezone(&Utc).timestamp_millis());
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().timestamp_millis())
}
