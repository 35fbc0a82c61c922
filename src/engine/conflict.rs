use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::model::{Ledger, Status};

use super::slots::{overlaps, slot_end};

/// Occupied intervals on one calendar day, derived from each scheduled
/// appointment's start time and its service type's duration. Rejected
/// appointments no longer block slots. Lookup is by exact date; an
/// appointment never occupies time on any other day.
pub fn booked_intervals(
    ledger: &Ledger,
    date: NaiveDate,
    duration_of: impl Fn(&Ulid) -> Option<u32>,
) -> Vec<(NaiveTime, NaiveTime)> {
    ledger
        .on_day(date)
        .filter(|a| a.status == Status::Scheduled)
        .filter_map(|a| {
            let minutes = duration_of(&a.service_type_id)?;
            // An interval running into midnight is clamped to end-of-day;
            // durations are assumed to fit within one day.
            let end = slot_end(a.time, minutes)
                .unwrap_or_else(|| NaiveTime::from_hms_opt(23, 59, 59).unwrap());
            Some((a.time, end))
        })
        .collect()
}

/// Keep only candidates whose `[start, start + duration)` interval
/// touches no booked interval. Order is preserved.
pub fn filter_conflicts(
    candidates: Vec<NaiveTime>,
    duration_minutes: u32,
    busy: &[(NaiveTime, NaiveTime)],
) -> Vec<NaiveTime> {
    candidates
        .into_iter()
        .filter(|&start| {
            let Some(end) = slot_end(start, duration_minutes) else {
                return false;
            };
            !busy.iter().any(|&(bs, be)| overlaps(start, end, bs, be))
        })
        .collect()
}
