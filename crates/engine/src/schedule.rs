use chrono::{Datelike, NaiveDateTime, NaiveTime, Weekday};
use zapdesk_core::types::ScheduleEntry;

fn weekday_en(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

fn parse_hhmm(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").ok()
}

/// Entry for the weekday of `at` carrying both bounds.
pub fn todays_entry(schedules: &[ScheduleEntry], at: NaiveDateTime) -> Option<&ScheduleEntry> {
    let today = weekday_en(at.weekday());
    schedules.iter().find(|s| {
        s.weekday_en.eq_ignore_ascii_case(today)
            && s.start_time.as_deref().is_some_and(|v| !v.is_empty())
            && s.end_time.as_deref().is_some_and(|v| !v.is_empty())
    })
}

/// Whether `at` falls inside today's window. No usable entry for the day,
/// or bounds that do not parse, count as open.
pub fn is_within_hours(schedules: &[ScheduleEntry], at: NaiveDateTime) -> bool {
    let Some(entry) = todays_entry(schedules, at) else {
        return true;
    };
    let bounds = entry
        .start_time
        .as_deref()
        .and_then(parse_hhmm)
        .zip(entry.end_time.as_deref().and_then(parse_hhmm));
    let Some((start, end)) = bounds else {
        return true;
    };

    let now = at.time();
    now >= start && now <= end
}
