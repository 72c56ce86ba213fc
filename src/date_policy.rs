//! Shared date handling: upstream's Pacific-local date parsing (§4.4.2)
//! and the read-time sanitization policy applied to every tick-reading
//! query (§4.2).
//!
//! Upstream timestamps are always parsed as Pacific local time and
//! stored as a UTC instant; nothing in this crate parses a date string
//! without an explicit zone (spec §9 design note on dates/time zones).

use chrono::{NaiveDate, NaiveDateTime, TimeZone};
use chrono_tz::America::Los_Angeles;

use crate::Error;

const FORMAT_LONG: &str = "%b %e, %Y, %l:%M %P";
const FORMAT_SQL: &str = "%Y-%m-%d %H:%M:%S";
const FORMAT_DATE_ONLY: &str = "%Y-%m-%d";

/// Parses an upstream tick date, trying the three known formats in
/// order (spec §4.4.2), interpreting the parsed wall-clock time as
/// Pacific local time and returning the equivalent UTC instant.
///
/// # Errors
///
/// Returns an error if none of the known formats match.
pub fn parse_upstream_climbed_at(raw: &str) -> Result<NaiveDateTime, Error> {
    let raw = raw.trim();
    let naive_local = NaiveDateTime::parse_from_str(raw, FORMAT_LONG)
        .or_else(|_| NaiveDateTime::parse_from_str(raw, FORMAT_SQL))
        .or_else(|_| {
            NaiveDate::parse_from_str(raw, FORMAT_DATE_ONLY)
                .map(|d| d.and_hms_opt(0, 0, 0).expect("midnight is always valid"))
        })
        .map_err(|_| Error::InvalidInput(format!("unrecognized tick date: {raw}")))?;

    pacific_local_to_utc_naive(naive_local)
}

/// Interprets a naive wall-clock time as Pacific local time and returns
/// the equivalent UTC naive instant. DST-ambiguous times resolve to the
/// earlier of the two possible UTC instants.
fn pacific_local_to_utc_naive(naive_local: NaiveDateTime) -> Result<NaiveDateTime, Error> {
    Los_Angeles
        .from_local_datetime(&naive_local)
        .earliest()
        .map(|dt| dt.naive_utc())
        .ok_or_else(|| Error::InvalidInput(format!("ambiguous or invalid local time: {naive_local}")))
}

/// Rejects a tick write whose `climbed_at` is more than 24h in the
/// future (spec §4.2, hard invalid on write).
///
/// # Errors
///
/// Returns `Error::InvalidInput` if `climbed_at` is further in the
/// future than `now + 24h`.
pub fn validate_climbed_at_for_write(
    climbed_at: NaiveDateTime,
    now: NaiveDateTime,
) -> Result<(), Error> {
    if climbed_at > now + chrono::Duration::hours(24) {
        return Err(Error::InvalidInput(format!(
            "climbed_at {climbed_at} is more than 24h in the future"
        )));
    }
    Ok(())
}

/// The outcome of applying the read-time sanitization policy (§4.2) to
/// a single tick's `climbed_at`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Sanitized {
    /// Usable as-is, or year-typo corrected; carries the adjusted value.
    Adjusted(NaiveDateTime),
    /// More than 30 days in the future after any year-typo correction;
    /// excluded from every tick-reading query.
    ExcludedFuture,
}

/// Applies the §4.2 date-sanitization policy used by every tick-reading
/// query: a date 350-380 days in the future is assumed to be a
/// year-typo and corrected; a date still more than 30 days in the
/// future is dropped.
#[must_use]
pub fn sanitize_climbed_at(climbed_at: NaiveDateTime, now: NaiveDateTime) -> Sanitized {
    let delta = climbed_at - now;
    if delta >= chrono::Duration::days(350) && delta <= chrono::Duration::days(380) {
        Sanitized::Adjusted(climbed_at - chrono::Duration::days(365))
    } else if delta > chrono::Duration::days(30) {
        Sanitized::ExcludedFuture
    } else {
        Sanitized::Adjusted(climbed_at)
    }
}

/// Lower bound of the "recent" window (spec §4.2): ticks older than this
/// are excluded from recency-based views.
pub const RECENCY_WINDOW_DAYS: i64 = 365 * 2;

/// Whether an (already-sanitized) tick counts as "recent" — not older
/// than two years (spec §4.2).
#[must_use]
pub fn is_recent(adjusted: NaiveDateTime, now: NaiveDateTime) -> bool {
    adjusted >= now - chrono::Duration::days(RECENCY_WINDOW_DAYS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 7, 26)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    #[test]
    fn year_typo_is_corrected() {
        let ts = now() + chrono::Duration::days(365);
        match sanitize_climbed_at(ts, now()) {
            Sanitized::Adjusted(adjusted) => {
                assert_eq!(adjusted, ts - chrono::Duration::days(365));
            }
            Sanitized::ExcludedFuture => panic!("expected a year-typo correction"),
        }
    }

    #[test]
    fn far_future_is_excluded() {
        let ts = now() + chrono::Duration::days(31);
        assert_eq!(sanitize_climbed_at(ts, now()), Sanitized::ExcludedFuture);
    }

    #[test]
    fn near_future_passes_through_unadjusted() {
        let ts = now() + chrono::Duration::days(10);
        assert_eq!(sanitize_climbed_at(ts, now()), Sanitized::Adjusted(ts));
    }

    #[test]
    fn write_rejects_more_than_24h_future() {
        let ts = now() + chrono::Duration::hours(25);
        assert!(validate_climbed_at_for_write(ts, now()).is_err());
    }

    #[test]
    fn write_accepts_24h_future_boundary() {
        let ts = now() + chrono::Duration::hours(24);
        assert!(validate_climbed_at_for_write(ts, now()).is_ok());
    }

    #[test]
    fn recency_cutoff_is_two_years() {
        let recent = now() - chrono::Duration::days(700);
        let stale = now() - chrono::Duration::days(800);
        assert!(is_recent(recent, now()));
        assert!(!is_recent(stale, now()));
    }

    #[test]
    fn parses_long_format() {
        let parsed = parse_upstream_climbed_at("Jan 9, 2025, 3:45 pm").unwrap();
        assert_eq!(parsed.date(), NaiveDate::from_ymd_opt(2025, 1, 9).unwrap());
    }

    #[test]
    fn parses_sql_format() {
        let parsed = parse_upstream_climbed_at("2025-01-09 15:45:00").unwrap();
        assert_eq!(parsed.date(), NaiveDate::from_ymd_opt(2025, 1, 9).unwrap());
    }

    #[test]
    fn parses_date_only_format() {
        let parsed = parse_upstream_climbed_at("2025-01-09").unwrap();
        assert_eq!(parsed.date(), NaiveDate::from_ymd_opt(2025, 1, 9).unwrap());
    }

    #[test]
    fn rejects_unrecognized_format() {
        assert!(parse_upstream_climbed_at("not a date").is_err());
    }
}
