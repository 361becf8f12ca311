//! Listing date text to UTC timestamps.
//!
//! Listing sites print dates in many shapes ("Sat 14 March 2026, 7:30pm",
//! "2026-03-14T19:30:00+11:00", "tomorrow"). Times without an offset are taken
//! as UTC.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%d %B %Y",
    "%B %d %Y",
    "%d %b %Y",
    "%b %d %Y",
    "%A %d %B %Y",
    "%a %d %b %Y",
    "%A %B %d %Y",
    "%a %b %d %Y",
    "%d/%m/%Y",
];

const TIME_FORMATS: &[&str] = &["%I:%M %p", "%H:%M"];

/// Parse an absolute date or date-time. Returns `None` when nothing matches.
pub fn parse_event_date(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }

    let normalized = normalize_listing_text(text);
    for date_format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(&normalized, date_format) {
            return Some(date.and_time(NaiveTime::MIN).and_utc());
        }
        for time_format in TIME_FORMATS {
            let format = format!("{date_format} {time_format}");
            if let Ok(naive) = NaiveDateTime::parse_from_str(&normalized, &format) {
                return Some(naive.and_utc());
            }
        }
    }
    None
}

/// Resolve the handful of relative phrases listing sites use instead of a date.
///
/// The phrase picks a calendar day relative to `now`. A time printed alongside
/// it ("tomorrow, 7:30pm") sets the time of day; otherwise the event is placed at
/// the last second of that day. Either way the result depends only on the day
/// of `now`, so repeated scrapes of one listing on one day agree.
pub fn parse_relative_date(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let lowered = text.trim().to_lowercase();
    let days_ahead = if lowered.contains("today") || lowered.contains("tonight") {
        0
    } else if lowered.contains("tomorrow") {
        1
    } else if lowered.contains("this weekend") {
        let weekday = i64::from(now.weekday().num_days_from_monday());
        (5 - weekday).rem_euclid(7)
    } else if lowered.contains("next week") {
        7
    } else if lowered.contains("next month") {
        30
    } else {
        return None;
    };

    let day = now.date_naive() + Duration::days(days_ahead);
    let time = listing_time(text).unwrap_or_else(end_of_day);
    Some(day.and_time(time).and_utc())
}

/// Absolute formats first, then relative phrases anchored at `now`.
pub fn parse_listing_date(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    parse_event_date(text).or_else(|| parse_relative_date(text, now))
}

/// Drop punctuation and filler ("at", ordinal suffixes) and split "7pm" into
/// "7:00 pm" so the strftime patterns above can match.
fn normalize_listing_text(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .map(|c| if matches!(c, ',' | '|' | '@') { ' ' } else { c })
        .collect();

    let mut tokens = Vec::new();
    for token in cleaned.split_whitespace() {
        if token.eq_ignore_ascii_case("at") || token.eq_ignore_ascii_case("from") {
            continue;
        }
        tokens.push(split_meridiem(strip_ordinal(token)));
    }
    tokens.join(" ")
}

/// First clock time in free text, e.g. "7pm", "7:30 PM" or "19:30".
fn listing_time(text: &str) -> Option<NaiveTime> {
    let normalized = normalize_listing_text(text);
    let tokens: Vec<&str> = normalized.split_whitespace().collect();
    for (index, token) in tokens.iter().enumerate() {
        if let Some(next) = tokens.get(index + 1) {
            let pair = format!("{token} {next}");
            if let Ok(time) = NaiveTime::parse_from_str(&pair, "%I:%M %p") {
                return Some(time);
            }
        }
        if let Ok(time) = NaiveTime::parse_from_str(token, "%H:%M") {
            return Some(time);
        }
    }
    None
}

fn end_of_day() -> NaiveTime {
    NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN)
}

fn strip_ordinal(token: &str) -> &str {
    for suffix in ["st", "nd", "rd", "th"] {
        if let Some(prefix) = token.strip_suffix(suffix) {
            if !prefix.is_empty() && prefix.chars().all(|c| c.is_ascii_digit()) {
                return prefix;
            }
        }
    }
    token
}

fn split_meridiem(token: &str) -> String {
    let lower = token.to_ascii_lowercase();
    for suffix in ["am", "pm"] {
        if let Some(prefix) = lower.strip_suffix(suffix) {
            if !prefix.is_empty() && prefix.chars().all(|c| c.is_ascii_digit()) {
                // chrono needs minutes to build a time.
                return format!("{prefix}:00 {suffix}");
            }
            if !prefix.is_empty() && prefix.chars().all(|c| c.is_ascii_digit() || c == ':') {
                return format!("{prefix} {suffix}");
            }
        }
    }
    token.to_string()
}
