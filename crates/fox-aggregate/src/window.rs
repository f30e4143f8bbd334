//! Scan windows per run mode.
//!
//! A recent run covers `recent_days` whole days ending today. Jobs whose
//! buckets span more than one calendar day widen that window so every bucket
//! they touch is recomputed from complete data.

use chrono::{Days, NaiveDate};
use fox_core::{shift_weekend_to_friday, week_bounds, week_start_of};
use fox_storage::TimeWindow;

use crate::{JobContext, RunMode};

/// `[first, until)` of the recent window.
pub fn recent_days(today: NaiveDate, days: u32) -> (NaiveDate, NaiveDate) {
    let back = u64::from(days.max(1) - 1);
    let first = today.checked_sub_days(Days::new(back)).unwrap_or(today);
    let until = today.checked_add_days(Days::new(1)).unwrap_or(today);
    (first, until)
}

/// Plain day window: whole history for a full run, the trailing days otherwise.
pub fn daily(ctx: &JobContext) -> TimeWindow {
    match ctx.mode {
        RunMode::Full => TimeWindow::AllTime,
        RunMode::Recent => {
            let (first, until) = recent_days(ctx.today, ctx.recent_days);
            TimeWindow::days(first, until)
        }
    }
}

/// For buckets that fold Saturday and Sunday into Friday: a window opening on
/// a weekend opens on that Friday instead.
pub fn weekend_folded(ctx: &JobContext) -> TimeWindow {
    match ctx.mode {
        RunMode::Full => TimeWindow::AllTime,
        RunMode::Recent => {
            let (first, until) = recent_days(ctx.today, ctx.recent_days);
            TimeWindow::days(shift_weekend_to_friday(first), until)
        }
    }
}

/// Widened to whole ISO weeks, Monday of the first through Sunday of the last.
pub fn whole_weeks(ctx: &JobContext) -> TimeWindow {
    match ctx.mode {
        RunMode::Full => TimeWindow::AllTime,
        RunMode::Recent => {
            let (first, _) = recent_days(ctx.today, ctx.recent_days);
            let (_, sunday) = week_bounds(ctx.today);
            let until = sunday.checked_add_days(Days::new(1)).unwrap_or(sunday);
            TimeWindow::days(week_start_of(first), until)
        }
    }
}
