use std::collections::HashSet;

use chrono::{Datelike, NaiveDate, Weekday};

use crate::model::RecurringRule;

pub(crate) fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Decide one date's eligibility and gather its matching rules.
///
/// A date contributes slots only if it is not excluded, not a weekend,
/// and at least one rule matches its weekday inside the rule's validity
/// range. Each date is judged on its own, with no cross-day state.
///
/// The returned rules are ordered by (start_time, id) so that slot
/// generation is deterministic when several rules cover the same day.
pub fn resolve_day<'a>(
    date: NaiveDate,
    rules: &'a [RecurringRule],
    exclusions: &HashSet<NaiveDate>,
) -> Vec<&'a RecurringRule> {
    if exclusions.contains(&date) || is_weekend(date) {
        return Vec::new();
    }
    let mut matched: Vec<&RecurringRule> = rules.iter().filter(|r| r.matches(date)).collect();
    matched.sort_by_key(|r| (r.start_time, r.id));
    matched
}
