//! Temporal context (C1): a short natural-language string describing "now" in the
//! configured timezone, computed once per request and reused across every outbound
//! message that needs it (classifier, primary/xai/meta system prompts, enrichment).
//!
//! Grounded on `original_source/src/config.py::date_context`.

use chrono::{Datelike, Timelike};
use chrono_tz::Tz;

pub fn temporal_context(tz: &Tz) -> String {
    let now = chrono::Utc::now().with_timezone(tz);

    let weekday = now.format("%A").to_string();
    let date = now.format("%B %-d, %Y").to_string();
    let time = now.format("%-I:%M %p").to_string();
    let tz_abbr = now.format("%Z").to_string();

    let period = time_of_day(now.hour());
    let day_type = if matches!(now.weekday(), chrono::Weekday::Sat | chrono::Weekday::Sun) {
        "weekend"
    } else {
        "weekday"
    };
    let season = season_for_month(now.month());

    format!(
        "Today is {weekday}, {date}. It is {period} ({time} {tz_abbr}). \
         It is a {day_type}. The current season is {season}."
    )
}

fn time_of_day(hour: u32) -> &'static str {
    match hour {
        0..=4 => "late night",
        5..=11 => "morning",
        12..=16 => "afternoon",
        17..=20 => "evening",
        _ => "night",
    }
}

fn season_for_month(month: u32) -> &'static str {
    match month {
        12 | 1 | 2 => "winter",
        3..=5 => "spring",
        6..=8 => "summer",
        9..=11 => "autumn",
        _ => unreachable!("chrono month is always 1..=12"),
    }
}
