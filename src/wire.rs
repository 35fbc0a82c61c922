//! Newline-delimited JSON protocol.
//!
//! One request object per line, one response object per line. Every
//! response carries `"ok"`; failures add `"error"` and a stable
//! `"code"`. A connection that sent `subscribe` also receives
//! committed events as `{"event": ...}` lines, interleaved with its
//! responses.

use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, NaiveTime};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::debug;
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::model::{BookingRequest, Event, Slot};
use crate::observability;

const MAX_LINE_LEN: usize = 16 * 1024;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", deny_unknown_fields)]
pub enum Request {
    ListServiceTypes,
    AddServiceType {
        name: String,
        duration_minutes: u32,
        #[serde(default)]
        notification_template: Option<String>,
    },
    SetNotificationTemplate {
        id: Ulid,
        #[serde(default)]
        notification_template: Option<String>,
    },
    DeleteServiceType {
        id: Ulid,
    },
    ListRules,
    AddRule {
        day_of_week: u8,
        valid_from: NaiveDate,
        valid_to: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
        #[serde(default)]
        break_start: Option<NaiveTime>,
        #[serde(default)]
        break_end: Option<NaiveTime>,
    },
    RemoveRule {
        id: Ulid,
    },
    ListExclusions,
    AddExclusion {
        date: NaiveDate,
        #[serde(default)]
        reason: Option<String>,
    },
    RemoveExclusion {
        date: NaiveDate,
    },
    FreeSlots {
        service_type_id: Ulid,
        #[serde(default)]
        lookahead_days: Option<u32>,
    },
    Book {
        service_type_id: Ulid,
        slot: String,
        customer_name: String,
        customer_email: String,
        customer_birth_date: NaiveDate,
    },
    Status {
        customer_name: String,
        number: u32,
        birth_date: NaiveDate,
    },
    ListAppointments,
    AppointmentsForServiceType {
        id: Ulid,
    },
    Reject {
        id: Ulid,
    },
    DeleteAppointment {
        id: Ulid,
    },
    Purge {
        before: NaiveDate,
    },
    Subscribe {
        #[serde(default)]
        service_type_id: Option<Ulid>,
    },
}

pub fn command_label(req: &Request) -> &'static str {
    match req {
        Request::ListServiceTypes => "list_service_types",
        Request::AddServiceType { .. } => "add_service_type",
        Request::SetNotificationTemplate { .. } => "set_notification_template",
        Request::DeleteServiceType { .. } => "delete_service_type",
        Request::ListRules => "list_rules",
        Request::AddRule { .. } => "add_rule",
        Request::RemoveRule { .. } => "remove_rule",
        Request::ListExclusions => "list_exclusions",
        Request::AddExclusion { .. } => "add_exclusion",
        Request::RemoveExclusion { .. } => "remove_exclusion",
        Request::FreeSlots { .. } => "free_slots",
        Request::Book { .. } => "book",
        Request::Status { .. } => "status",
        Request::ListAppointments => "list_appointments",
        Request::AppointmentsForServiceType { .. } => "appointments_for_service_type",
        Request::Reject { .. } => "reject",
        Request::DeleteAppointment { .. } => "delete_appointment",
        Request::Purge { .. } => "purge",
        Request::Subscribe { .. } => "subscribe",
    }
}

fn error_code(err: &EngineError) -> &'static str {
    match err {
        EngineError::NotFound(_) => "not_found",
        EngineError::NoSuchExclusion(_) => "no_such_exclusion",
        EngineError::AlreadyExists(_) => "already_exists",
        EngineError::InUse(_) => "in_use",
        EngineError::InvalidSlot(_) => "invalid_slot",
        EngineError::SlotNoLongerAvailable(_) => "slot_taken",
        EngineError::Conflict(_) => "conflict",
        EngineError::Validation(_) => "validation",
        EngineError::LimitExceeded(_) => "limit_exceeded",
        EngineError::WalError(_) => "wal",
    }
}

fn ok(payload: Value) -> Value {
    let mut obj = json!({"ok": true});
    if let (Some(out), Some(extra)) = (obj.as_object_mut(), payload.as_object()) {
        for (k, v) in extra {
            out.insert(k.clone(), v.clone());
        }
    }
    obj
}

fn fail(err: &EngineError) -> Value {
    json!({"ok": false, "error": err.to_string(), "code": error_code(err)})
}

fn bad_request(msg: impl std::fmt::Display) -> Value {
    json!({"ok": false, "error": msg.to_string(), "code": "bad_request"})
}

/// Drive one client connection until it closes or errors.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
) -> Result<(), LinesCodecError> {
    let peer = socket.peer_addr().ok();
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let mut sub: Option<broadcast::Receiver<Event>> = None;

    loop {
        tokio::select! {
            line = framed.next() => {
                let line = match line {
                    None => return Ok(()),
                    Some(line) => line?,
                };
                if line.trim().is_empty() {
                    continue;
                }
                let response = handle_line(&engine, &line, &mut sub).await;
                framed.send(response.to_string()).await?;
            }
            event = recv_event(&mut sub), if sub.is_some() => {
                match event {
                    Ok(ev) => framed.send(json!({"event": ev}).to_string()).await?,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(?peer, skipped, "subscriber lagged");
                        framed
                            .send(json!({"lagged": skipped}).to_string())
                            .await?;
                    }
                    Err(broadcast::error::RecvError::Closed) => sub = None,
                }
            }
        }
    }
}

async fn recv_event(
    sub: &mut Option<broadcast::Receiver<Event>>,
) -> Result<Event, broadcast::error::RecvError> {
    match sub {
        Some(rx) => rx.recv().await,
        // Guarded by `if sub.is_some()`.
        None => std::future::pending().await,
    }
}

/// Parse and dispatch one request line.
pub(crate) async fn handle_line(
    engine: &Engine,
    line: &str,
    sub: &mut Option<broadcast::Receiver<Event>>,
) -> Value {
    let req: Request = match serde_json::from_str(line) {
        Ok(req) => req,
        Err(err) => return bad_request(err),
    };
    let op = command_label(&req);
    let started = Instant::now();

    let response = match req {
        Request::Subscribe { service_type_id } => {
            *sub = Some(match service_type_id {
                Some(id) => engine.notify.subscribe(id),
                None => engine.notify.subscribe_all(),
            });
            ok(json!({"subscribed": true}))
        }
        other => dispatch(engine, other).await,
    };

    metrics::counter!(observability::COMMANDS_TOTAL, "op" => op).increment(1);
    if response.get("ok") == Some(&Value::Bool(false)) {
        metrics::counter!(observability::COMMAND_ERRORS_TOTAL, "op" => op).increment(1);
    }
    metrics::histogram!(observability::COMMAND_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
    response
}

async fn dispatch(engine: &Engine, req: Request) -> Value {
    match req {
        Request::Subscribe { .. } => unreachable!("handled by the connection loop"),
        Request::ListServiceTypes => {
            ok(json!({"service_types": engine.list_service_types()}))
        }
        Request::AddServiceType {
            name,
            duration_minutes,
            notification_template,
        } => match engine
            .add_service_type(name, duration_minutes, notification_template)
            .await
        {
            Ok(st) => ok(json!({"service_type": st})),
            Err(err) => fail(&err),
        },
        Request::SetNotificationTemplate {
            id,
            notification_template,
        } => match engine
            .update_notification_template(id, notification_template)
            .await
        {
            Ok(()) => ok(json!({})),
            Err(err) => fail(&err),
        },
        Request::DeleteServiceType { id } => match engine.delete_service_type(id).await {
            Ok(()) => ok(json!({})),
            Err(err) => fail(&err),
        },
        Request::ListRules => ok(json!({"rules": engine.list_rules()})),
        Request::AddRule {
            day_of_week,
            valid_from,
            valid_to,
            start_time,
            end_time,
            break_start,
            break_end,
        } => match engine
            .add_rule(
                day_of_week,
                valid_from,
                valid_to,
                start_time,
                end_time,
                break_start,
                break_end,
            )
            .await
        {
            Ok(rule) => ok(json!({"rule": rule})),
            Err(err) => fail(&err),
        },
        Request::RemoveRule { id } => match engine.remove_rule(id).await {
            Ok(()) => ok(json!({})),
            Err(err) => fail(&err),
        },
        Request::ListExclusions => ok(json!({"exclusions": engine.list_exclusions()})),
        Request::AddExclusion { date, reason } => {
            match engine.add_exclusion(date, reason).await {
                Ok(day) => ok(json!({"exclusion": day})),
                Err(err) => fail(&err),
            }
        }
        Request::RemoveExclusion { date } => match engine.remove_exclusion(date).await {
            Ok(()) => ok(json!({})),
            Err(err) => fail(&err),
        },
        Request::FreeSlots {
            service_type_id,
            lookahead_days,
        } => {
            if engine.get_service_type(&service_type_id).is_none() {
                return fail(&EngineError::NotFound(service_type_id));
            }
            let slots = match lookahead_days {
                Some(days) => engine.free_slots_within(service_type_id, days).await,
                None => engine.free_slots(service_type_id).await,
            };
            let rendered: Vec<String> = slots.iter().map(Slot::to_string).collect();
            ok(json!({"slots": rendered}))
        }
        Request::Book {
            service_type_id,
            slot,
            customer_name,
            customer_email,
            customer_birth_date,
        } => {
            let req = BookingRequest {
                service_type_id,
                slot,
                customer_name,
                customer_email,
                customer_birth_date,
            };
            match engine.book(req).await {
                Ok(appt) => ok(json!({"appointment": appt})),
                Err(err) => fail(&err),
            }
        }
        Request::Status {
            customer_name,
            number,
            birth_date,
        } => match engine
            .appointment_status(&customer_name, number, birth_date)
            .await
        {
            Some(appt) => ok(json!({"appointment": appt})),
            None => bad_request("no appointment matches those credentials"),
        },
        Request::ListAppointments => {
            ok(json!({"appointments": engine.list_appointments().await}))
        }
        Request::AppointmentsForServiceType { id } => {
            ok(json!({"appointments": engine.appointments_for_service_type(&id).await}))
        }
        Request::Reject { id } => match engine.reject_appointment(id).await {
            Ok(()) => ok(json!({})),
            Err(err) => fail(&err),
        },
        Request::DeleteAppointment { id } => match engine.delete_appointment(id).await {
            Ok(()) => ok(json!({})),
            Err(err) => fail(&err),
        },
        Request::Purge { before } => match engine.purge_appointments_before(before).await {
            Ok(removed) => ok(json!({"removed": removed})),
            Err(err) => fail(&err),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;

    fn test_wal_path(tag: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push("termin_test_wire");
        std::fs::create_dir_all(&p).unwrap();
        p.push(format!("{tag}_{}.wal", Ulid::new()));
        p
    }

    fn engine(tag: &str) -> Engine {
        Engine::new(test_wal_path(tag), Arc::new(NotifyHub::new()), 60).unwrap()
    }

    #[tokio::test]
    async fn unknown_op_is_bad_request() {
        let engine = engine("unknown_op");
        let mut sub = None;
        let resp = handle_line(&engine, r#"{"op":"frobnicate"}"#, &mut sub).await;
        assert_eq!(resp["ok"], false);
        assert_eq!(resp["code"], "bad_request");
    }

    #[tokio::test]
    async fn add_and_list_service_types() {
        let engine = engine("add_list");
        let mut sub = None;
        let resp = handle_line(
            &engine,
            r#"{"op":"add_service_type","name":"Passport application","duration_minutes":30}"#,
            &mut sub,
        )
        .await;
        assert_eq!(resp["ok"], true);
        assert_eq!(resp["service_type"]["name"], "Passport application");

        let resp = handle_line(&engine, r#"{"op":"list_service_types"}"#, &mut sub).await;
        assert_eq!(resp["ok"], true);
        assert_eq!(resp["service_types"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn free_slots_for_unknown_type_is_not_found() {
        let engine = engine("free_unknown");
        let mut sub = None;
        let line = format!(
            r#"{{"op":"free_slots","service_type_id":"{}"}}"#,
            Ulid::new()
        );
        let resp = handle_line(&engine, &line, &mut sub).await;
        assert_eq!(resp["ok"], false);
        assert_eq!(resp["code"], "not_found");
    }

    #[tokio::test]
    async fn subscribe_arms_the_event_stream() {
        let engine = engine("subscribe");
        let mut sub = None;
        let resp = handle_line(&engine, r#"{"op":"subscribe"}"#, &mut sub).await;
        assert_eq!(resp["ok"], true);
        assert!(sub.is_some());

        engine
            .add_service_type("Document certification".into(), 20, None)
            .await
            .unwrap();
        let event = sub.unwrap().recv().await.unwrap();
        assert!(matches!(event, Event::ServiceTypeCreated { .. }));
    }
}
