use chrono::NaiveTime;

use crate::model::RecurringRule;

/// End of a slot starting at `start`, or `None` if it would cross
/// midnight (such a slot is never offered).
pub fn slot_end(start: NaiveTime, duration_minutes: u32) -> Option<NaiveTime> {
    let (end, wrapped) =
        start.overflowing_add_signed(chrono::Duration::minutes(duration_minutes as i64));
    (wrapped == 0).then_some(end)
}

/// Half-open interval overlap: `[a_start, a_end)` vs `[b_start, b_end)`.
pub fn overlaps(a_start: NaiveTime, a_end: NaiveTime, b_start: NaiveTime, b_end: NaiveTime) -> bool {
    a_start < b_end && b_start < a_end
}

/// Expand one rule into the ordered candidate start times for a single
/// day, stepping by the service duration from `rule.start_time` until
/// the next slot would end past `rule.end_time`.
///
/// Candidates overlapping the rule's break window are dropped, but the
/// cursor still advances by the fixed step and does not realign to the
/// break boundary. Slots right after a break can therefore sit offset
/// from it; that is deliberate, deterministic behavior.
///
/// A remainder shorter than the duration at the end of the window is
/// never offered.
pub fn candidate_starts(rule: &RecurringRule, duration_minutes: u32) -> Vec<NaiveTime> {
    debug_assert!(duration_minutes > 0, "duration must be positive");
    let break_window = rule.break_window();
    let mut starts = Vec::new();
    let mut cursor = rule.start_time;

    while let Some(end) = slot_end(cursor, duration_minutes) {
        if end > rule.end_time {
            break;
        }
        let in_break = break_window.is_some_and(|(bs, be)| overlaps(cursor, end, bs, be));
        if !in_break {
            starts.push(cursor);
        }
        cursor = end;
    }
    starts
}
