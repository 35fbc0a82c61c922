//! Metric names and the Prometheus exporter.
//!
//! RED metrics on the command path, USE metrics on the WAL writer and
//! the connection pool. All names are `const` so call sites cannot
//! drift from the registered descriptions.

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

pub const COMMANDS_TOTAL: &str = "termin_commands_total";
pub const COMMAND_ERRORS_TOTAL: &str = "termin_command_errors_total";
pub const COMMAND_DURATION_SECONDS: &str = "termin_command_duration_seconds";

pub const BOOKINGS_TOTAL: &str = "termin_bookings_total";
pub const BOOKING_CONFLICTS_TOTAL: &str = "termin_booking_conflicts_total";

pub const CONNECTIONS_ACTIVE: &str = "termin_connections_active";
pub const CONNECTIONS_TOTAL: &str = "termin_connections_total";
pub const CONNECTIONS_REJECTED_TOTAL: &str = "termin_connections_rejected_total";

pub const WAL_FLUSH_BATCH_SIZE: &str = "termin_wal_flush_batch_size";
pub const WAL_FLUSH_DURATION_SECONDS: &str = "termin_wal_flush_duration_seconds";
pub const WAL_COMPACTIONS_TOTAL: &str = "termin_wal_compactions_total";

/// Install the Prometheus recorder and its scrape endpoint. `None`
/// registers descriptions against the default (no-op) recorder, which
/// keeps tests and embedded use quiet.
pub fn init(port: Option<u16>) {
    if let Some(port) = port {
        let builder = PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], port));
        match builder.install() {
            Ok(()) => info!(port, "prometheus exporter listening"),
            Err(err) => tracing::warn!(%err, "prometheus exporter failed to start"),
        }
    }

    describe_counter!(COMMANDS_TOTAL, "Commands processed, by op");
    describe_counter!(COMMAND_ERRORS_TOTAL, "Commands that returned an error, by op");
    describe_histogram!(
        COMMAND_DURATION_SECONDS,
        Unit::Seconds,
        "Wall time per command"
    );
    describe_counter!(BOOKINGS_TOTAL, "Appointments committed");
    describe_counter!(
        BOOKING_CONFLICTS_TOTAL,
        "Booking attempts retried after a uniqueness clash"
    );
    describe_gauge!(CONNECTIONS_ACTIVE, "Client connections currently open");
    describe_counter!(CONNECTIONS_TOTAL, "Client connections accepted");
    describe_counter!(
        CONNECTIONS_REJECTED_TOTAL,
        "Client connections refused at the admission limit"
    );
    describe_histogram!(WAL_FLUSH_BATCH_SIZE, "Events per group-commit flush");
    describe_histogram!(
        WAL_FLUSH_DURATION_SECONDS,
        Unit::Seconds,
        "Wall time per group-commit flush"
    );
    describe_counter!(WAL_COMPACTIONS_TOTAL, "WAL compactions completed");
}
