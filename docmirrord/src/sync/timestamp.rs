//! Remote timestamps arrive as RFC 3339 strings with anywhere from zero to seven fractional
//! digits, and occasionally without an offset. Everything is normalized to UTC and stored as
//! integer microseconds.

use thiserror::Error;
use time::format_description::FormatItem;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime, UtcOffset};

const NAIVE_ISO: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second][optional [.[subsecond]]]");
const NAIVE_SPACED: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second][optional [.[subsecond]]]");
const DATE_ONLY: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unparseable timestamp: {0:?}")]
pub struct TimestampError(pub String);

pub fn parse(raw: &str) -> Result<OffsetDateTime, TimestampError> {
    let trimmed = raw.trim();
    if let Ok(parsed) = OffsetDateTime::parse(trimmed, &Rfc3339) {
        return Ok(truncate_to_micros(parsed.to_offset(UtcOffset::UTC)));
    }
    for format in [NAIVE_ISO, NAIVE_SPACED] {
        if let Ok(parsed) = PrimitiveDateTime::parse(trimmed, format) {
            return Ok(truncate_to_micros(parsed.assume_utc()));
        }
    }
    if let Ok(date) = Date::parse(trimmed, DATE_ONLY) {
        return Ok(date.midnight().assume_utc());
    }
    Err(TimestampError(raw.to_string()))
}

/// Lenient variant for optional metadata columns: missing and malformed both become `None`.
pub fn parse_opt(raw: Option<&str>) -> Option<OffsetDateTime> {
    raw.and_then(|value| parse(value).ok())
}

pub fn to_micros(value: OffsetDateTime) -> i64 {
    (value.unix_timestamp_nanos() / 1_000) as i64
}

pub fn from_micros(micros: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(micros) * 1_000).ok()
}

pub fn format(value: OffsetDateTime) -> String {
    value
        .to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .unwrap_or_else(|_| value.unix_timestamp().to_string())
}

fn truncate_to_micros(value: OffsetDateTime) -> OffsetDateTime {
    let micros = value.microsecond();
    value.replace_microsecond(micros).unwrap_or(value)
}
