use std::collections::HashSet;

use chrono::{Days, NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::model::{Ledger, RecurringRule, Slot};

use super::calendar::resolve_day;
use super::conflict::{booked_intervals, filter_conflicts};
use super::slots::{candidate_starts, slot_end};
use super::{Engine, today};

impl Engine {
    /// Free slots for a service type over the configured horizon,
    /// starting today. Ascending by (date, time); empty when the service
    /// type is unknown or fully booked. Read-only and safe to call
    /// repeatedly and concurrently.
    pub async fn free_slots(&self, service_type_id: Ulid) -> Vec<Slot> {
        self.free_slots_from(service_type_id, today(), self.lookahead_days())
            .await
    }

    /// Same, with an explicit horizon length.
    pub async fn free_slots_within(&self, service_type_id: Ulid, lookahead_days: u32) -> Vec<Slot> {
        self.free_slots_from(service_type_id, today(), lookahead_days)
            .await
    }

    /// Deterministic core: horizon is `[origin, origin + lookahead_days]`,
    /// both ends inclusive.
    pub async fn free_slots_from(
        &self,
        service_type_id: Ulid,
        origin: NaiveDate,
        lookahead_days: u32,
    ) -> Vec<Slot> {
        let Some(duration) = self
            .catalog
            .service_types
            .get(&service_type_id)
            .map(|st| st.duration_minutes)
        else {
            return Vec::new();
        };
        let lookahead = lookahead_days.min(crate::limits::MAX_LOOKAHEAD_DAYS);

        let (rules, exclusions) = self.calendar_snapshot();
        let ledger = self.ledger.read().await;

        let mut out = Vec::new();
        for offset in 0..=lookahead {
            let Some(date) = origin.checked_add_days(Days::new(offset as u64)) else {
                break;
            };
            for time in self.day_free_starts(&ledger, &rules, &exclusions, date, duration) {
                out.push(Slot { date, time });
            }
        }
        out
    }

    /// Free start times on one calendar day: resolve the day's rules,
    /// generate candidates per matching rule, drop booked conflicts,
    /// then keep the earliest of any pair of mutually overlapping
    /// candidates (possible when several rules cover the day at offset
    /// start times). Also used by the committer, which already holds the
    /// ledger write guard.
    pub(super) fn day_free_starts(
        &self,
        ledger: &Ledger,
        rules: &[RecurringRule],
        exclusions: &HashSet<NaiveDate>,
        date: NaiveDate,
        duration_minutes: u32,
    ) -> Vec<NaiveTime> {
        let matched = resolve_day(date, rules, exclusions);
        if matched.is_empty() {
            return Vec::new();
        }

        let mut candidates: Vec<NaiveTime> = Vec::new();
        for rule in matched {
            candidates.extend(candidate_starts(rule, duration_minutes));
        }
        candidates.sort_unstable();
        candidates.dedup();

        let busy = booked_intervals(ledger, date, |id| {
            self.catalog
                .service_types
                .get(id)
                .map(|st| st.duration_minutes)
        });
        let survivors = filter_conflicts(candidates, duration_minutes, &busy);

        let mut free = Vec::with_capacity(survivors.len());
        let mut horizon: Option<NaiveTime> = None;
        for start in survivors {
            if horizon.is_some_and(|h| start < h) {
                continue;
            }
            if let Some(end) = slot_end(start, duration_minutes) {
                free.push(start);
                horizon = Some(end);
            }
        }
        free
    }

    pub(super) fn calendar_snapshot(&self) -> (Vec<RecurringRule>, HashSet<NaiveDate>) {
        let rules: Vec<RecurringRule> =
            self.catalog.rules.iter().map(|e| e.value().clone()).collect();
        let exclusions: HashSet<NaiveDate> =
            self.catalog.exclusions.iter().map(|e| *e.key()).collect();
        (rules, exclusions)
    }
}
