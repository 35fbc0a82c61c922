use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// A bookable kind of appointment, e.g. "Passport application".
///
/// Immutable once an appointment references it, except for
/// `notification_template`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceType {
    pub id: Ulid,
    pub name: String,
    pub duration_minutes: u32,
    pub notification_template: Option<String>,
}

/// A repeating weekly working window.
///
/// `day_of_week` is 0 = Monday … 4 = Friday. The rule applies to every
/// matching weekday inside `[valid_from, valid_to]`. The optional break
/// window removes candidate slots that overlap it; a break with
/// `break_start >= break_end` (or only one bound set) is ignored at
/// slot generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringRule {
    pub id: Ulid,
    pub day_of_week: u8,
    pub valid_from: NaiveDate,
    pub valid_to: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub break_start: Option<NaiveTime>,
    pub break_end: Option<NaiveTime>,
}

impl RecurringRule {
    /// The break window, if present and well-formed.
    pub fn break_window(&self) -> Option<(NaiveTime, NaiveTime)> {
        match (self.break_start, self.break_end) {
            (Some(s), Some(e)) if s < e => Some((s, e)),
            _ => None,
        }
    }

    /// Does this rule apply to the given calendar date?
    pub fn matches(&self, date: NaiveDate) -> bool {
        use chrono::Datelike;
        self.day_of_week as u32 == date.weekday().num_days_from_monday()
            && self.valid_from <= date
            && date <= self.valid_to
    }
}

/// A single calendar date removed from availability regardless of rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionDay {
    pub date: NaiveDate,
    pub reason: Option<String>,
}

/// Appointment lifecycle. Closed set; anything else is rejected at
/// construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Scheduled,
    Rejected,
}

/// A committed booking. The occupied interval is
/// `[time, time + service type duration)` on `date`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    /// Unique, strictly increasing, gap-free across successful commits.
    pub number: u32,
    pub service_type_id: Ulid,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_birth_date: NaiveDate,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub status: Status,
}

impl Appointment {
    pub fn slot(&self) -> Slot {
        Slot {
            date: self.date,
            time: self.time,
        }
    }
}

/// A bookable `(date, time)` pair. Printable form is `YYYY-MM-DD HH:MM`,
/// which is also the wire format clients submit back when booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Slot {
    pub date: NaiveDate,
    pub time: NaiveTime,
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.date.format("%Y-%m-%d"), self.time.format("%H:%M"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseSlotError(pub String);

impl fmt::Display for ParseSlotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid slot timestamp: {:?}", self.0)
    }
}

impl std::error::Error for ParseSlotError {}

impl FromStr for Slot {
    type Err = ParseSlotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dt = chrono::NaiveDateTime::parse_from_str(s.trim(), "%Y-%m-%d %H:%M")
            .map_err(|_| ParseSlotError(s.to_string()))?;
        Ok(Slot {
            date: dt.date(),
            time: dt.time(),
        })
    }
}

/// Validated input for the booking committer. Built once at the boundary;
/// the engine never reads loose form fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub service_type_id: Ulid,
    /// Printable timestamp as offered by `free_slots`, re-parsed by the
    /// committer.
    pub slot: String,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_birth_date: NaiveDate,
}

// ── WAL record format ────────────────────────────────────────────

/// The event types, flat and self-contained. This is the WAL record
/// format; variant order is part of the on-disk encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    ServiceTypeCreated {
        id: Ulid,
        name: String,
        duration_minutes: u32,
        notification_template: Option<String>,
    },
    ServiceTypeTemplateUpdated {
        id: Ulid,
        notification_template: Option<String>,
    },
    ServiceTypeDeleted {
        id: Ulid,
    },
    RuleAdded {
        id: Ulid,
        day_of_week: u8,
        valid_from: NaiveDate,
        valid_to: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
        break_start: Option<NaiveTime>,
        break_end: Option<NaiveTime>,
    },
    RuleRemoved {
        id: Ulid,
    },
    ExclusionAdded {
        date: NaiveDate,
        reason: Option<String>,
    },
    ExclusionRemoved {
        date: NaiveDate,
    },
    AppointmentBooked {
        id: Ulid,
        number: u32,
        service_type_id: Ulid,
        customer_name: String,
        customer_email: String,
        customer_birth_date: NaiveDate,
        date: NaiveDate,
        time: NaiveTime,
    },
    AppointmentRejected {
        id: Ulid,
    },
    AppointmentDeleted {
        id: Ulid,
    },
}

// ── Booking ledger ───────────────────────────────────────────────

/// Why a ledger insert was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertViolation {
    DuplicateId,
    DuplicateNumber,
}

/// Committed appointments, indexed three ways: by id (lookup/mutation),
/// by number (allocation + status queries), by day (conflict filtering).
///
/// The ledger itself is not synchronized; the engine wraps it in an
/// `RwLock` and holds the write guard across allocation + insert.
#[derive(Debug, Default)]
pub struct Ledger {
    by_id: HashMap<Ulid, Appointment>,
    by_number: BTreeMap<u32, Ulid>,
    by_day: BTreeMap<NaiveDate, Vec<Ulid>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn get(&self, id: &Ulid) -> Option<&Appointment> {
        self.by_id.get(id)
    }

    pub fn get_by_number(&self, number: u32) -> Option<&Appointment> {
        self.by_number.get(&number).and_then(|id| self.by_id.get(id))
    }

    /// The next appointment number: `1 + max(existing)`, starting at 1.
    pub fn next_number(&self) -> u32 {
        self.by_number.last_key_value().map_or(1, |(n, _)| n + 1)
    }

    /// Insert a new appointment, refusing duplicate ids or numbers.
    pub fn insert(&mut self, appt: Appointment) -> Result<(), InsertViolation> {
        if self.by_id.contains_key(&appt.id) {
            return Err(InsertViolation::DuplicateId);
        }
        if self.by_number.contains_key(&appt.number) {
            return Err(InsertViolation::DuplicateNumber);
        }
        self.by_number.insert(appt.number, appt.id);
        self.by_day.entry(appt.date).or_default().push(appt.id);
        self.by_id.insert(appt.id, appt);
        Ok(())
    }

    pub fn remove(&mut self, id: &Ulid) -> Option<Appointment> {
        let appt = self.by_id.remove(id)?;
        self.by_number.remove(&appt.number);
        if let Some(day) = self.by_day.get_mut(&appt.date) {
            day.retain(|a| a != id);
            if day.is_empty() {
                self.by_day.remove(&appt.date);
            }
        }
        Some(appt)
    }

    /// Flip status, returning the previous one.
    pub fn set_status(&mut self, id: &Ulid, status: Status) -> Option<Status> {
        let appt = self.by_id.get_mut(id)?;
        let prev = appt.status;
        appt.status = status;
        Some(prev)
    }

    /// Appointments on one calendar day, in insertion order.
    pub fn on_day(&self, date: NaiveDate) -> impl Iterator<Item = &Appointment> {
        self.by_day
            .get(&date)
            .into_iter()
            .flatten()
            .filter_map(|id| self.by_id.get(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Appointment> {
        self.by_number.values().filter_map(|id| self.by_id.get(id))
    }

    pub fn references_service_type(&self, service_type_id: &Ulid) -> bool {
        self.by_id
            .values()
            .any(|a| a.service_type_id == *service_type_id)
    }

}
