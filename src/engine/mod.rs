mod availability;
mod calendar;
mod conflict;
mod error;
mod mutations;
mod queries;
mod slots;
#[cfg(test)]
mod tests;

pub use calendar::resolve_day;
pub use conflict::{booked_intervals, filter_conflicts};
pub use error::EngineError;
pub use slots::{candidate_starts, slot_end};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

/// Local wall-clock date; the engine has no notion of time zones.
pub(crate) fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group
/// commit: buffer the first append, drain everything immediately
/// available, then a single fsync for the whole batch before any caller
/// is told its event is durable.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                while deferred.is_none() {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => deferred = Some(other),
                        Err(_) => break, // channel empty, flush what we have
                    }
                }
                flush_batch(&mut wal, batch);
                if let Some(cmd) = deferred {
                    handle_maintenance(&mut wal, cmd);
                }
            }
            other => handle_maintenance(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let mut append_err: Option<io::Error> = None;
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    let result = match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    };
    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_maintenance(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Catalog + engine ─────────────────────────────────────

/// Service types, recurring rules, and exclusion days. Read-mostly;
/// mutated only through WAL-journaled events.
pub(crate) struct Catalog {
    pub service_types: DashMap<Ulid, ServiceType>,
    pub rules: DashMap<Ulid, RecurringRule>,
    pub exclusions: DashMap<NaiveDate, ExclusionDay>,
}

impl Catalog {
    fn new() -> Self {
        Self {
            service_types: DashMap::new(),
            rules: DashMap::new(),
            exclusions: DashMap::new(),
        }
    }

    /// Apply one journaled event. Infallible by construction: mutations
    /// validate before journaling, so replayed events always fit.
    fn apply(&self, ledger: &mut Ledger, event: &Event) {
        match event {
            Event::ServiceTypeCreated {
                id,
                name,
                duration_minutes,
                notification_template,
            } => {
                self.service_types.insert(
                    *id,
                    ServiceType {
                        id: *id,
                        name: name.clone(),
                        duration_minutes: *duration_minutes,
                        notification_template: notification_template.clone(),
                    },
                );
            }
            Event::ServiceTypeTemplateUpdated {
                id,
                notification_template,
            } => {
                if let Some(mut st) = self.service_types.get_mut(id) {
                    st.notification_template = notification_template.clone();
                }
            }
            Event::ServiceTypeDeleted { id } => {
                self.service_types.remove(id);
            }
            Event::RuleAdded {
                id,
                day_of_week,
                valid_from,
                valid_to,
                start_time,
                end_time,
                break_start,
                break_end,
            } => {
                self.rules.insert(
                    *id,
                    RecurringRule {
                        id: *id,
                        day_of_week: *day_of_week,
                        valid_from: *valid_from,
                        valid_to: *valid_to,
                        start_time: *start_time,
                        end_time: *end_time,
                        break_start: *break_start,
                        break_end: *break_end,
                    },
                );
            }
            Event::RuleRemoved { id } => {
                self.rules.remove(id);
            }
            Event::ExclusionAdded { date, reason } => {
                self.exclusions.insert(
                    *date,
                    ExclusionDay {
                        date: *date,
                        reason: reason.clone(),
                    },
                );
            }
            Event::ExclusionRemoved { date } => {
                self.exclusions.remove(date);
            }
            Event::AppointmentBooked {
                id,
                number,
                service_type_id,
                customer_name,
                customer_email,
                customer_birth_date,
                date,
                time,
            } => {
                let appt = Appointment {
                    id: *id,
                    number: *number,
                    service_type_id: *service_type_id,
                    customer_name: customer_name.clone(),
                    customer_email: customer_email.clone(),
                    customer_birth_date: *customer_birth_date,
                    date: *date,
                    time: *time,
                    status: Status::Scheduled,
                };
                if let Err(v) = ledger.insert(appt) {
                    tracing::warn!("skipping unappliable booking event {id}: {v:?}");
                }
            }
            Event::AppointmentRejected { id } => {
                ledger.set_status(id, Status::Rejected);
            }
            Event::AppointmentDeleted { id } => {
                ledger.remove(id);
            }
        }
    }
}

/// The availability & booking engine. All reads go through shared
/// locks; the only mutual-exclusion point is the ledger write lock held
/// across number allocation + insert in `book`.
pub struct Engine {
    pub(crate) catalog: Catalog,
    pub(crate) ledger: RwLock<Ledger>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    lookahead_days: u32,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start the group-commit writer.
    /// Must be called inside a tokio runtime.
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        lookahead_days: u32,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let catalog = Catalog::new();
        let mut ledger = Ledger::new();
        for event in &events {
            catalog.apply(&mut ledger, event);
        }

        Ok(Self {
            catalog,
            ledger: RwLock::new(ledger),
            wal_tx,
            notify,
            lookahead_days: lookahead_days.min(crate::limits::MAX_LOOKAHEAD_DAYS),
        })
    }

    pub fn lookahead_days(&self) -> u32 {
        self.lookahead_days
    }

    /// Write an event to the WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append + apply + notify in one call. The caller holds the
    /// ledger write guard, so nothing observes the state between the
    /// durable append and the in-memory apply.
    pub(super) async fn persist_and_apply(
        &self,
        ledger: &mut Ledger,
        route: Option<Ulid>,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.catalog.apply(ledger, event);
        self.notify.send(route, event);
        Ok(())
    }

    /// Rewrite the WAL with the minimal event stream recreating the
    /// current catalog and ledger.
    ///
    /// Holds the ledger read lock across the snapshot and the writer
    /// handoff. Mutations hold the write lock until their append is
    /// durable, so no event can slip between the snapshot and the file
    /// swap and be dropped from the rewritten log.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let ledger = self.ledger.read().await;
        let mut events = Vec::new();

        let mut types: Vec<ServiceType> = self
            .catalog
            .service_types
            .iter()
            .map(|e| e.value().clone())
            .collect();
        types.sort_by_key(|t| t.id);
        for t in types {
            events.push(Event::ServiceTypeCreated {
                id: t.id,
                name: t.name,
                duration_minutes: t.duration_minutes,
                notification_template: t.notification_template,
            });
        }

        let mut rules: Vec<RecurringRule> =
            self.catalog.rules.iter().map(|e| e.value().clone()).collect();
        rules.sort_by_key(|r| r.id);
        for r in rules {
            events.push(Event::RuleAdded {
                id: r.id,
                day_of_week: r.day_of_week,
                valid_from: r.valid_from,
                valid_to: r.valid_to,
                start_time: r.start_time,
                end_time: r.end_time,
                break_start: r.break_start,
                break_end: r.break_end,
            });
        }

        let mut exclusions: Vec<ExclusionDay> = self
            .catalog
            .exclusions
            .iter()
            .map(|e| e.value().clone())
            .collect();
        exclusions.sort_by_key(|x| x.date);
        for x in exclusions {
            events.push(Event::ExclusionAdded {
                date: x.date,
                reason: x.reason,
            });
        }

        for a in ledger.iter() {
            events.push(Event::AppointmentBooked {
                id: a.id,
                number: a.number,
                service_type_id: a.service_type_id,
                customer_name: a.customer_name.clone(),
                customer_email: a.customer_email.clone(),
                customer_birth_date: a.customer_birth_date,
                date: a.date,
                time: a.time,
            });
            if a.status == Status::Rejected {
                events.push(Event::AppointmentRejected { id: a.id });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
