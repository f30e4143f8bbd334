//! Business-calendar helpers: weekend collapsing and ISO week bookkeeping.

use chrono::{Datelike, Duration, NaiveDate, Weekday};

/// Saturday and Sunday output is attributed to the preceding Friday.
pub fn shift_weekend_to_friday(day: NaiveDate) -> NaiveDate {
    match day.weekday() {
        Weekday::Sat => day - Duration::days(1),
        Weekday::Sun => day - Duration::days(2),
        _ => day,
    }
}

/// `YYYY-Www` using the ISO week-numbering year, so 2024-12-30 is `2025-W01`.
pub fn iso_week_id(day: NaiveDate) -> String {
    let week = day.iso_week();
    format!("{}-W{:02}", week.year(), week.week())
}

pub fn week_start_of(day: NaiveDate) -> NaiveDate {
    day - Duration::days(i64::from(day.weekday().num_days_from_monday()))
}

/// Monday and Sunday (both inclusive) of the ISO week containing `day`.
pub fn week_bounds(day: NaiveDate) -> (NaiveDate, NaiveDate) {
    let start = week_start_of(day);
    (start, start + Duration::days(6))
}
