//! termin: an availability and booking engine for municipal-style
//! appointment desks.
//!
//! Opening hours are declared as weekday recurring rules with optional
//! breaks, closures as exclusion days. The engine derives bookable
//! slots per service type over a rolling horizon and commits bookings
//! atomically: each appointment gets a unique, monotonically increasing
//! number, and a slot can never be taken twice. State is an in-memory
//! ledger rebuilt on startup from a CRC-framed write-ahead log; clients
//! speak newline-delimited JSON over TCP.

pub mod config;
pub mod engine;
pub mod limits;
pub mod maintenance;
pub mod model;
pub mod notify;
pub mod observability;
pub mod wal;
pub mod wire;
