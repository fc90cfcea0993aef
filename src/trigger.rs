//! Next-fire-time arithmetic for scheduled tasks.
//!
//! Everything here is integer math over unix timestamps in UTC. "Today at
//! HH:MM" means the UTC day, so the results are unaffected by DST
//! transitions. All returned times are strictly in the future relative to
//! the supplied `now`.

use crate::task_store::TimeUnit;

const DAY_SECS: i64 = 24 * 60 * 60;

/// Normalize a stored regularity before use.
///
/// A regularity of zero (or less) becomes 2, for every unit. For the minute
/// unit a regularity of 1 also becomes 2. Both clamps are compatibility
/// policy carried over from the data already in production rows, not a
/// requirement of the arithmetic below.
fn clamp_regularity(regularity: i64, unit: TimeUnit) -> i64 {
    let r = if regularity <= 0 { 2 } else { regularity };
    if unit == TimeUnit::Minute && r == 1 {
        2
    } else {
        r
    }
}

/// Compute the next fire time strictly after `now`.
///
/// `offset` is seconds past UTC midnight for the hour/day/week units. For
/// the minute unit only its minute-of-hour component (`offset / 60` mod 60)
/// matters: the task is anchored at that minute and fires every
/// `regularity` minutes from it. A candidate equal to the current minute
/// counts as already past.
pub fn next_fire_time(regularity: i64, unit: TimeUnit, offset: i64, now: i64) -> i64 {
    let regularity = clamp_regularity(regularity, unit);

    match unit {
        TimeUnit::Minute => {
            let anchor_minute = offset.div_euclid(60).rem_euclid(60);
            let current_minute_ts = now - now.rem_euclid(60);
            let hour_start = now - now.rem_euclid(60 * 60);

            let mut candidate = hour_start + anchor_minute * 60;
            while candidate <= current_minute_ts {
                candidate += regularity * 60;
            }
            candidate
        }
        TimeUnit::Hour | TimeUnit::Day | TimeUnit::Week => {
            let day_start = now - now.rem_euclid(DAY_SECS);
            let mut candidate = day_start + offset.rem_euclid(DAY_SECS);
            // Anchor at or before now, then step forward past it
            if candidate > now {
                candidate -= DAY_SECS;
            }
            let step = unit.secs() * regularity;
            while candidate <= now {
                candidate += step;
            }
            candidate
        }
    }
}

/// Like [`next_fire_time`], but when the task is more than half a step
/// overdue the result is pushed out by one extra full step. This bounds the
/// pile-up of fires after downtime: a long outage costs at most one skipped
/// interval per task instead of a burst.
///
/// `old_next_time == 0` means the task has never fired; with no missed
/// anchor to measure from, no extra step is added.
pub fn catch_up_next_fire_time(
    regularity: i64,
    unit: TimeUnit,
    offset: i64,
    old_next_time: i64,
    now: i64,
) -> i64 {
    let next = next_fire_time(regularity, unit, offset, now);
    let step = unit.secs() * clamp_regularity(regularity, unit);
    if old_next_time > 0 && now - old_next_time > step / 2 {
        next + step
    } else {
        next
    }
}
