//! Event fan-out and booking notifications.
//!
//! Every committed event is published on a global broadcast channel and,
//! for appointment events, on a per-service-type channel. Wire
//! subscribers and the mailer task both consume these; a slow consumer
//! lags and drops, it never blocks a commit.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{info, warn};
use ulid::Ulid;

use crate::engine::Engine;
use crate::model::{Event, ServiceType};

pub const CHANNEL_CAPACITY: usize = 256;

pub struct NotifyHub {
    global: broadcast::Sender<Event>,
    per_type: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        let (global, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            global,
            per_type: DashMap::new(),
        }
    }

    /// Subscribe to appointment events of a single service type.
    pub fn subscribe(&self, service_type_id: Ulid) -> broadcast::Receiver<Event> {
        self.per_type
            .entry(service_type_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.global.subscribe()
    }

    /// Publish an event. `route` carries the service type of an
    /// appointment event; catalog events are global only.
    pub fn send(&self, route: Option<Ulid>, event: &Event) {
        // A send error only means nobody is listening.
        let _ = self.global.send(event.clone());
        if let Some(id) = route
            && let Some(tx) = self.per_type.get(&id)
        {
            let _ = tx.send(event.clone());
        }
    }

    /// Drop the channel of a deleted service type.
    pub fn remove(&self, service_type_id: &Ulid) {
        self.per_type.remove(service_type_id);
    }
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

// ── Booking notifications ────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub appointment_number: u32,
    pub recipient: String,
    pub body: String,
}

#[derive(Debug)]
pub struct DeliveryError(pub String);

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "delivery failed: {}", self.0)
    }
}

impl std::error::Error for DeliveryError {}

/// Transport seam for the mailer. The default implementation logs;
/// deployments plug in SMTP or whatever else behind this.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError>;
}

pub struct LogDelivery;

#[async_trait]
impl Delivery for LogDelivery {
    async fn deliver(&self, n: &Notification) -> Result<(), DeliveryError> {
        info!(
            number = n.appointment_number,
            recipient = %n.recipient,
            "booking notification"
        );
        Ok(())
    }
}

/// Render the confirmation for one booked appointment. The service
/// type's template, when set, is appended after the standard summary.
pub fn render(
    number: u32,
    recipient: &str,
    date: chrono::NaiveDate,
    time: chrono::NaiveTime,
    service_type: &ServiceType,
) -> Notification {
    let mut body = format!(
        "Your appointment for {} is confirmed.\nNumber: {}\nDate: {}\nTime: {}\n",
        service_type.name,
        number,
        date,
        time.format("%H:%M"),
    );
    if let Some(extra) = &service_type.notification_template {
        body.push('\n');
        body.push_str(extra);
        body.push('\n');
    }
    Notification {
        appointment_number: number,
        recipient: recipient.to_string(),
        body,
    }
}

/// Background task: turn every booked-appointment event into one
/// notification. Delivery failures are logged and dropped; the booking
/// itself already committed.
pub async fn run_mailer(engine: Arc<Engine>, delivery: Arc<dyn Delivery>) {
    let mut rx = engine.notify.subscribe_all();
    loop {
        match rx.recv().await {
            Ok(Event::AppointmentBooked {
                number,
                service_type_id,
                customer_email,
                date,
                time,
                ..
            }) => {
                let Some(st) = engine.get_service_type(&service_type_id) else {
                    continue;
                };
                let n = render(number, &customer_email, date, time, &st);
                if let Err(err) = delivery.deliver(&n).await {
                    warn!(number, %err, "notification delivery failed");
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "mailer lagged, notifications dropped");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
