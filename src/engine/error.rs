use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::Slot;

#[derive(Debug)]
pub enum EngineError {
    /// Unknown service type, rule, or appointment id.
    NotFound(Ulid),
    /// No exclusion recorded for this date.
    NoSuchExclusion(NaiveDate),
    /// Duplicate service type name or exclusion date.
    AlreadyExists(String),
    /// Service type still referenced by appointments.
    InUse(Ulid),
    /// Malformed or unparsable slot timestamp.
    InvalidSlot(String),
    /// The requested slot vanished between display and submission.
    SlotNoLongerAvailable(Slot),
    /// Storage-level uniqueness violation during commit (appointment
    /// number or id). Retried internally up to a bound before surfacing.
    Conflict(u32),
    /// Malformed rule or request field, rejected before any mutation.
    Validation(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::NoSuchExclusion(date) => write!(f, "no exclusion on {date}"),
            EngineError::AlreadyExists(what) => write!(f, "already exists: {what}"),
            EngineError::InUse(id) => {
                write!(f, "service type {id} still referenced by appointments")
            }
            EngineError::InvalidSlot(raw) => write!(f, "invalid slot timestamp: {raw:?}"),
            EngineError::SlotNoLongerAvailable(slot) => {
                write!(f, "slot {slot} is no longer available")
            }
            EngineError::Conflict(number) => {
                write!(f, "commit conflict on appointment number {number}")
            }
            EngineError::Validation(msg) => write!(f, "validation failed: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
