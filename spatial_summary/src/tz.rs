//! Timestamp and time zone helpers.
//!
//! What this module provides:
//! - [`parse_ts_to_utc`]: Parse RFC-3339 timestamps (as stored in every table) into UTC.
//! - [`to_rfc3339_millis`]: The storage format. Fixed width with a trailing `Z`, so lexical
//!   order of stored strings equals chronological order and SQL `<`/`>` on them is sound.
//! - [`parse_tz`]: IANA name -> [`chrono_tz::Tz`].
//! - [`local_midnight_utc`]: The UTC instant at which a calendar day starts in the grouping
//!   time zone. Period windows are built from these.
//! - [`local_date`]: The calendar day a UTC instant falls on in the grouping time zone.
//!
//! Midnight can be skipped or repeated by a DST transition in some zones
//! (e.g. America/Santiago, America/Havana). [`DstPolicy`] decides how such a day start is
//! resolved; period math uses [`DstPolicy::PreferEarliest`] then [`DstPolicy::ShiftForward`]
//! so every day has exactly one start instant.

use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

/// RFC-3339 with offset -> UTC.
///
/// Example:
/// - "2024-03-10T09:30:00-05:00" -> "2024-03-10T14:30:00Z"
pub fn parse_ts_to_utc(s: &str) -> anyhow::Result<DateTime<Utc>> {
    let dt = DateTime::parse_from_rfc3339(s).with_context(|| format!("bad rfc3339: {s}"))?;
    Ok(dt.with_timezone(&Utc))
}

/// Format a UTC datetime as an RFC-3339 string with millisecond precision.
pub fn to_rfc3339_millis(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Parse an IANA time zone name (e.g. "Australia/Darwin").
pub fn parse_tz(name: &str) -> anyhow::Result<Tz> {
    name.trim()
        .parse::<Tz>()
        .map_err(|e| anyhow::anyhow!("bad tz {name}: {e}"))
}

/// Policy for handling DST edge cases when converting local naive timestamps to UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DstPolicy {
    /// Error on ambiguous (fall-back) or nonexistent (spring-forward) local times.
    Strict,
    /// For ambiguous local times pick the earlier instant.
    PreferEarliest,
    /// For ambiguous local times pick the later instant.
    PreferLatest,
    /// For nonexistent local times, step forward one minute at a time (max 2 hours)
    /// until a valid instant is found.
    ShiftForward,
}

/// Convert a naive local timestamp to UTC using a specific time zone and DST policy.
///
/// Errors:
/// - Returns an error if the time is ambiguous or nonexistent and `policy` does not resolve it.
pub fn from_local_naive_with_policy(
    naive: NaiveDateTime,
    tz: Tz,
    policy: DstPolicy,
) -> anyhow::Result<DateTime<Utc>> {
    use chrono::offset::LocalResult::*;
    match tz.from_local_datetime(&naive) {
        Single(dt) => Ok(dt.with_timezone(&Utc)),
        Ambiguous(a, b) => match policy {
            DstPolicy::PreferEarliest => Ok(a.with_timezone(&Utc)),
            DstPolicy::PreferLatest => Ok(b.with_timezone(&Utc)),
            _ => Err(anyhow::anyhow!("ambiguous local time {naive} in {tz}")),
        },
        None => match policy {
            DstPolicy::ShiftForward => {
                let mut t = naive;
                for _ in 0..120 {
                    t += chrono::Duration::minutes(1);
                    if let Single(dt) = tz.from_local_datetime(&t) {
                        return Ok(dt.with_timezone(&Utc));
                    }
                }
                Err(anyhow::anyhow!("nonexistent local time {naive} in {tz}"))
            }
            _ => Err(anyhow::anyhow!("nonexistent local time {naive} in {tz}")),
        },
    }
}

/// UTC instant of local midnight starting `day` in `tz`.
pub fn local_midnight_utc(day: NaiveDate, tz: Tz) -> anyhow::Result<DateTime<Utc>> {
    let naive = day.and_time(chrono::NaiveTime::MIN);
    from_local_naive_with_policy(naive, tz, DstPolicy::PreferEarliest)
        .or_else(|_| from_local_naive_with_policy(naive, tz, DstPolicy::ShiftForward))
}

/// Calendar day of `ts` as observed in `tz`.
pub fn local_date(ts: DateTime<Utc>, tz: Tz) -> NaiveDate {
    ts.with_timezone(&tz).date_naive()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    #[test]
    fn parse_rfc3339_offset_to_utc() {
        let got = parse_ts_to_utc("2024-03-10T09:30:00-05:00").expect("parse");
        let want = Utc.with_ymd_and_hms(2024, 3, 10, 14, 30, 0).unwrap();
        assert_eq!(got, want);
    }

    #[test]
    fn storage_format_sorts_chronologically() {
        let a = to_rfc3339_millis(Utc.with_ymd_and_hms(2019, 12, 31, 23, 59, 59).unwrap());
        let b = to_rfc3339_millis(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(a, "2019-12-31T23:59:59.000Z");
        assert!(a < b);
    }

    #[test]
    fn darwin_midnight_is_previous_utc_afternoon() {
        // Australia/Darwin is UTC+09:30 year-round.
        let tz = parse_tz("Australia/Darwin").unwrap();
        let day = NaiveDate::from_ymd_opt(2020, 6, 1).unwrap();
        let got = local_midnight_utc(day, tz).unwrap();
        assert_eq!(got, Utc.with_ymd_and_hms(2020, 5, 31, 14, 30, 0).unwrap());
        assert_eq!(local_date(got, tz), day);
    }

    #[test]
    fn skipped_midnight_shifts_forward() {
        // Havana springs forward at 00:00 -> 01:00 on 2024-03-10.
        let tz = parse_tz("America/Havana").unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        let got = local_midnight_utc(day, tz).unwrap();
        assert_eq!(local_date(got, tz), day);
        assert_eq!(got, Utc.with_ymd_and_hms(2024, 3, 10, 5, 0, 0).unwrap());
    }

    #[test]
    fn ny_fall_back_prefer_earliest_and_latest() {
        let naive = NaiveDate::from_ymd_opt(2024, 11, 3)
            .unwrap()
            .and_hms_opt(1, 30, 0)
            .unwrap();
        let tz: Tz = "America/New_York".parse().unwrap();

        let early = from_local_naive_with_policy(naive, tz, DstPolicy::PreferEarliest).unwrap();
        assert_eq!(early, Utc.with_ymd_and_hms(2024, 11, 3, 5, 30, 0).unwrap());
        let late = from_local_naive_with_policy(naive, tz, DstPolicy::PreferLatest).unwrap();
        assert_eq!(late, Utc.with_ymd_and_hms(2024, 11, 3, 6, 30, 0).unwrap());
        assert!(from_local_naive_with_policy(naive, tz, DstPolicy::Strict).is_err());
    }

    #[test]
    fn bad_zone_name_errors() {
        assert!(parse_tz("Mars/Olympus_Mons").is_err());
    }
}
