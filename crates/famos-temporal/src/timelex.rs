//! TimeLex – relative time phrases to UTC ranges.
//!
//! All arithmetic happens in the caller's local calendar; only the final
//! boundaries convert to UTC. Around DST transitions that means a "day" can
//! span 23 or 25 hours, and instants inside a spring-forward gap resolve to
//! the first valid instant after it.

use chrono::{
    DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc, Weekday,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::TemporalError;

/// Half-open UTC interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtcRange {
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Exclusive end.
    pub end: DateTime<Utc>,
}

impl UtcRange {
    /// Whether `ts` falls inside the range.
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }
}

/// Named local dayparts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Daypart {
    /// 05:00–12:00 by default.
    Morning,
    /// 12:00–17:00 by default.
    Afternoon,
    /// 17:00–22:00 by default.
    Evening,
    /// 22:00–05:00 (crosses midnight) by default.
    Night,
}

/// Local-time daypart boundaries, hours `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaypartBounds {
    /// Morning start hour.
    pub morning: (u32, u32),
    /// Afternoon bounds.
    pub afternoon: (u32, u32),
    /// Evening bounds.
    pub evening: (u32, u32),
    /// Night bounds; wraps midnight when `start > end`.
    pub night: (u32, u32),
}

impl Default for DaypartBounds {
    fn default() -> Self {
        Self {
            morning: (5, 12),
            afternoon: (12, 17),
            evening: (17, 22),
            night: (22, 5),
        }
    }
}

impl DaypartBounds {
    fn bounds(&self, part: Daypart) -> (u32, u32) {
        match part {
            Daypart::Morning => self.morning,
            Daypart::Afternoon => self.afternoon,
            Daypart::Evening => self.evening,
            Daypart::Night => self.night,
        }
    }
}

/// Convert a local naive instant to UTC.
///
/// Ambiguous instants (fall-back hour) take the earliest occurrence; instants
/// in a spring-forward gap move forward to the first valid wall time.
fn local_to_utc(tz: Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    match tz.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
        chrono::LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        chrono::LocalResult::None => {
            // Inside a skipped hour; step forward until the wall clock exists.
            let mut probe = naive;
            for _ in 0..6 {
                probe += Duration::minutes(30);
                if let chrono::LocalResult::Single(dt) = tz.from_local_datetime(&probe) {
                    return dt.with_timezone(&Utc);
                }
            }
            // Pathological zone data; fall back to interpreting as UTC.
            Utc.from_utc_datetime(&naive)
        }
    }
}

fn day_range(tz: Tz, date: NaiveDate) -> UtcRange {
    let start = local_to_utc(tz, date.and_time(NaiveTime::MIN));
    let end = local_to_utc(tz, (date + Duration::days(1)).and_time(NaiveTime::MIN));
    UtcRange { start, end }
}

fn daypart_range(tz: Tz, date: NaiveDate, bounds: (u32, u32)) -> UtcRange {
    let (from, to) = bounds;
    let start_naive = date.and_hms_opt(from, 0, 0).unwrap_or(date.and_time(NaiveTime::MIN));
    let end_date = if to <= from { date + Duration::days(1) } else { date };
    let end_naive = end_date
        .and_hms_opt(to, 0, 0)
        .unwrap_or(end_date.and_time(NaiveTime::MIN));
    UtcRange {
        start: local_to_utc(tz, start_naive),
        end: local_to_utc(tz, end_naive),
    }
}

fn iso_week_range(tz: Tz, date: NaiveDate) -> UtcRange {
    let monday = date - Duration::days(date.weekday().num_days_from_monday() as i64);
    let start = local_to_utc(tz, monday.and_time(NaiveTime::MIN));
    let end = local_to_utc(tz, (monday + Duration::days(7)).and_time(NaiveTime::MIN));
    UtcRange { start, end }
}

fn month_range(tz: Tz, year: i32, month: u32) -> UtcRange {
    let first = NaiveDate::from_ymd_opt(year, month, 1)
        .unwrap_or_else(|| NaiveDate::from_ymd_opt(year, 1, 1).expect("january exists"));
    let (ny, nm) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    let next = NaiveDate::from_ymd_opt(ny, nm, 1).expect("first of month exists");
    UtcRange {
        start: local_to_utc(tz, first.and_time(NaiveTime::MIN)),
        end: local_to_utc(tz, next.and_time(NaiveTime::MIN)),
    }
}

fn months_back(year: i32, month: u32, n: u32) -> (i32, u32) {
    let total = year * 12 + month as i32 - 1 - n as i32;
    (total.div_euclid(12), (total.rem_euclid(12) + 1) as u32)
}

fn parse_weekday(word: &str) -> Option<Weekday> {
    match word {
        "monday" => Some(Weekday::Mon),
        "tuesday" => Some(Weekday::Tue),
        "wednesday" => Some(Weekday::Wed),
        "thursday" => Some(Weekday::Thu),
        "friday" => Some(Weekday::Fri),
        "saturday" => Some(Weekday::Sat),
        "sunday" => Some(Weekday::Sun),
        _ => None,
    }
}

fn parse_daypart(word: &str) -> Option<Daypart> {
    match word {
        "morning" => Some(Daypart::Morning),
        "afternoon" => Some(Daypart::Afternoon),
        "evening" => Some(Daypart::Evening),
        "night" => Some(Daypart::Night),
        _ => None,
    }
}

/// Parse a relative time phrase into one or more UTC ranges anchored at
/// `now` in `tz`.
pub fn parse_phrase(
    phrase: &str,
    now: DateTime<Utc>,
    tz: Tz,
    dayparts: &DaypartBounds,
) -> Result<Vec<UtcRange>, TemporalError> {
    let local_now = now.with_timezone(&tz);
    let today = local_now.date_naive();
    let normalized = phrase.trim().to_lowercase();
    let words: Vec<&str> = normalized.split_whitespace().collect();

    let range = match words.as_slice() {
        ["today"] => day_range(tz, today),
        ["yesterday"] => day_range(tz, today - Duration::days(1)),
        ["this", "week"] => iso_week_range(tz, today),
        ["last", "week"] => iso_week_range(tz, today - Duration::days(7)),
        ["this", "month"] => month_range(tz, today.year(), today.month()),
        ["last", "month"] => {
            let (y, m) = months_back(today.year(), today.month(), 1);
            month_range(tz, y, m)
        }
        ["last", "night"] => daypart_range(tz, today - Duration::days(1), dayparts.night),
        ["tonight"] | ["this", "night"] => daypart_range(tz, today, dayparts.night),
        ["yesterday", part] if parse_daypart(part).is_some() => {
            let part = parse_daypart(part).expect("guard checked");
            daypart_range(tz, today - Duration::days(1), dayparts.bounds(part))
        }
        ["this", part] if parse_daypart(part).is_some() => {
            let part = parse_daypart(part).expect("guard checked");
            daypart_range(tz, today, dayparts.bounds(part))
        }
        [n, "days", "ago"] | [n, "day", "ago"] => {
            let n: i64 = n
                .parse()
                .map_err(|_| TemporalError::UnrecognizedPhrase(phrase.to_string()))?;
            day_range(tz, today - Duration::days(n))
        }
        [n, "weeks", "ago"] | [n, "week", "ago"] => {
            let n: i64 = n
                .parse()
                .map_err(|_| TemporalError::UnrecognizedPhrase(phrase.to_string()))?;
            iso_week_range(tz, today - Duration::days(7 * n))
        }
        [n, "months", "ago"] | [n, "month", "ago"] => {
            let n: u32 = n
                .parse()
                .map_err(|_| TemporalError::UnrecognizedPhrase(phrase.to_string()))?;
            let (y, m) = months_back(today.year(), today.month(), n);
            month_range(tz, y, m)
        }
        ["last", day] if parse_weekday(day).is_some() => {
            let target = parse_weekday(day).expect("guard checked");
            // Most recent strictly-past occurrence.
            let mut date = today - Duration::days(1);
            while date.weekday() != target {
                date -= Duration::days(1);
            }
            day_range(tz, date)
        }
        ["next", day] if parse_weekday(day).is_some() => {
            let target = parse_weekday(day).expect("guard checked");
            let mut date = today + Duration::days(1);
            while date.weekday() != target {
                date += Duration::days(1);
            }
            day_range(tz, date)
        }
        _ => return Err(TemporalError::UnrecognizedPhrase(phrase.to_string())),
    };

    Ok(vec![range])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().expect("test timestamp")
    }

    fn parse(phrase: &str, now: &str, tz: &str) -> UtcRange {
        let tz: Tz = tz.parse().unwrap();
        parse_phrase(phrase, at(now), tz, &DaypartBounds::default()).unwrap()[0]
    }

    #[test]
    fn yesterday_morning_in_utc() {
        let r = parse("yesterday morning", "2025-09-06T10:00:00Z", "UTC");
        assert_eq!(r.start, at("2025-09-05T05:00:00Z"));
        assert_eq!(r.end, at("2025-09-05T12:00:00Z"));
        assert!(r.contains(at("2025-09-05T06:30:00Z")));
        assert!(!r.contains(at("2025-09-05T13:00:00Z")));
    }

    #[test]
    fn last_night_crosses_midnight() {
        let r = parse("last night", "2025-09-06T10:00:00Z", "UTC");
        assert_eq!(r.start, at("2025-09-05T22:00:00Z"));
        assert_eq!(r.end, at("2025-09-06T05:00:00Z"));
    }

    #[test]
    fn phrase_is_anchored_to_caller_timezone() {
        // 02:00 UTC on the 6th is still the evening of the 5th in Los Angeles.
        let r = parse("this evening", "2025-09-06T02:00:00Z", "America/Los_Angeles");
        // Local evening 17:00–22:00 PDT (UTC-7) ⇒ 00:00–05:00 UTC on the 6th.
        assert_eq!(r.start, at("2025-09-06T00:00:00Z"));
        assert_eq!(r.end, at("2025-09-06T05:00:00Z"));
    }

    #[test]
    fn dst_fall_back_day_has_25_hours() {
        // US DST ended 2024-11-03 in Los Angeles.
        let r = parse("yesterday", "2024-11-04T20:00:00Z", "America/Los_Angeles");
        assert_eq!((r.end - r.start).num_hours(), 25);
    }

    #[test]
    fn dst_spring_forward_day_has_23_hours() {
        // US DST began 2024-03-10 in Los Angeles.
        let r = parse("yesterday", "2024-03-11T20:00:00Z", "America/Los_Angeles");
        assert_eq!((r.end - r.start).num_hours(), 23);
    }

    #[test]
    fn iso_week_starts_monday() {
        // 2025-09-06 is a Saturday; its ISO week began Monday the 1st.
        let r = parse("this week", "2025-09-06T10:00:00Z", "UTC");
        assert_eq!(r.start, at("2025-09-01T00:00:00Z"));
        assert_eq!(r.end, at("2025-09-08T00:00:00Z"));
    }

    #[test]
    fn n_days_ago() {
        let r = parse("3 days ago", "2025-09-06T10:00:00Z", "UTC");
        assert_eq!(r.start, at("2025-09-03T00:00:00Z"));
        assert_eq!(r.end, at("2025-09-04T00:00:00Z"));
    }

    #[test]
    fn last_weekday_is_strictly_in_the_past() {
        // Now is Saturday 2025-09-06; "last saturday" is 2025-08-30.
        let r = parse("last saturday", "2025-09-06T10:00:00Z", "UTC");
        assert_eq!(r.start, at("2025-08-30T00:00:00Z"));
    }

    #[test]
    fn last_month_handles_january() {
        let r = parse("last month", "2025-01-15T10:00:00Z", "UTC");
        assert_eq!(r.start, at("2024-12-01T00:00:00Z"));
        assert_eq!(r.end, at("2025-01-01T00:00:00Z"));
    }

    #[test]
    fn unknown_phrase_is_an_error() {
        let tz: Tz = "UTC".parse().unwrap();
        let err = parse_phrase("sometime nice", Utc::now(), tz, &DaypartBounds::default());
        assert!(err.is_err());
    }
}
