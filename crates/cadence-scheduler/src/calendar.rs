//! Calendar primitives — anniversaries, leap-year policy, ages.
//! Pure functions over `chrono::NaiveDate`; no clock access.

use chrono::{Datelike, Duration, NaiveDate};

/// Gregorian leap-year test.
pub fn is_leap_year(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

/// The anchor's anniversary in a given year. Feb 29 anchors resolve to
/// Feb 28 in non-leap years.
pub fn anniversary_in(year: i32, anchor: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, anchor.month(), anchor.day()).unwrap_or_else(|| {
        // Only Feb 29 can fail to materialize in another year.
        NaiveDate::from_ymd_opt(year, 2, 28).expect("Feb 28 exists in every year")
    })
}

/// The first anniversary of `anchor` falling on or after `from`.
pub fn next_anniversary_on_or_after(anchor: NaiveDate, from: NaiveDate) -> NaiveDate {
    let this_year = anniversary_in(from.year(), anchor);
    if this_year >= from {
        this_year
    } else {
        anniversary_in(from.year() + 1, anchor)
    }
}

/// Signed day offset.
pub fn add_days(date: NaiveDate, n: i64) -> NaiveDate {
    date + Duration::days(n)
}

/// Whole years completed between `birth` and `on` (floor).
pub fn age_on(birth: NaiveDate, on: NaiveDate) -> i32 {
    let mut age = on.year() - birth.year();
    if (on.month(), on.day()) < (birth.month(), birth.day()) {
        age -= 1;
    }
    // A Feb 29 birth counts Feb 28 as the birthday in non-leap years.
    if birth.month() == 2 && birth.day() == 29 && !is_leap_year(on.year()) && (on.month(), on.day()) == (2, 28) {
        age = on.year() - birth.year();
    }
    age
}

/// Signed number of days from `a` to `b`.
pub fn days_between(a: NaiveDate, b: NaiveDate) -> i64 {
    (b - a).num_days()
}

/// First day of the given month.
pub fn month_start(year: i32, month: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, 1).expect("month in 1..=12")
}
