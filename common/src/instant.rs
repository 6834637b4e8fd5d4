use chrono::{DateTime, LocalResult, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::InstantError;

const LOCAL_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%dT%H:%M:%S",
];

/// Parses an RFC 3339 instant, or a local wall-clock time in `tz`.
pub fn parse_instant(raw: &str, tz: Tz) -> Result<DateTime<Utc>, InstantError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(InstantError::Empty);
    }

    if let Ok(instant) = DateTime::parse_from_rfc3339(raw) {
        return Ok(instant.with_timezone(&Utc));
    }

    let naive = LOCAL_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .ok_or_else(|| InstantError::Unparseable(raw.to_string()))?;

    match tz.from_local_datetime(&naive) {
        LocalResult::Single(local) => Ok(local.with_timezone(&Utc)),
        // Repeated hour at the end of DST: take the first occurrence.
        LocalResult::Ambiguous(earliest, _) => Ok(earliest.with_timezone(&Utc)),
        LocalResult::None => Err(InstantError::Nonexistent(raw.to_string())),
    }
}

/// Canonical persisted form.
pub fn format_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn format_local(instant: DateTime<Utc>, tz: Tz) -> String {
    instant.with_timezone(&tz).format("%a %d.%m. %H:%M").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_rfc3339_and_local_times() {
        let tz: Tz = "Europe/Berlin".parse().unwrap();
        let expected = Utc.with_ymd_and_hms(2026, 1, 10, 5, 30, 0).unwrap();

        assert_eq!(parse_instant("2026-01-10T05:30:00Z", tz), Ok(expected));
        assert_eq!(parse_instant("2026-01-10T06:30:00+01:00", tz), Ok(expected));
        assert_eq!(parse_instant("2026-01-10 06:30", tz), Ok(expected));
    }

    #[test]
    fn rejects_garbage_and_gaps() {
        let tz: Tz = "Europe/Berlin".parse().unwrap();

        assert_eq!(parse_instant("  ", tz), Err(InstantError::Empty));
        assert!(matches!(
            parse_instant("tomorrow", tz),
            Err(InstantError::Unparseable(_))
        ));
        // 02:30 does not exist on the spring-forward night.
        assert!(matches!(
            parse_instant("2026-03-29 02:30", tz),
            Err(InstantError::Nonexistent(_))
        ));
    }

    #[test]
    fn persisted_form_round_trips() {
        let instant = Utc.with_ymd_and_hms(2026, 6, 1, 22, 15, 0).unwrap();
        assert_eq!(format_instant(instant), "2026-06-01T22:15:00Z");
    }
}
