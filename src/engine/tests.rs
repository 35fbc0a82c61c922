use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Datelike, Days, NaiveDate, NaiveTime};
use tokio_test::assert_ok;
use ulid::Ulid;

use crate::model::{BookingRequest, ServiceType, Slot, Status};
use crate::notify::NotifyHub;

use super::{Engine, EngineError, today};

fn test_wal_path(tag: &str) -> PathBuf {
    let mut p = std::env::temp_dir();
    p.push("termin_test_engine");
    std::fs::create_dir_all(&p).unwrap();
    p.push(format!("{tag}_{}.wal", Ulid::new()));
    p
}

fn engine_at(path: PathBuf) -> Engine {
    Engine::new(path, Arc::new(NotifyHub::new()), 60).unwrap()
}

fn engine(tag: &str) -> Engine {
    engine_at(test_wal_path(tag))
}

fn time(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

/// First date strictly after today falling on the given weekday.
fn next_matching(day_of_week: u8) -> NaiveDate {
    let mut d = today().checked_add_days(Days::new(1)).unwrap();
    while d.weekday().num_days_from_monday() != day_of_week as u32 {
        d = d.checked_add_days(Days::new(1)).unwrap();
    }
    d
}

async fn service_type(engine: &Engine, name: &str, minutes: u32) -> ServiceType {
    engine
        .add_service_type(name.to_string(), minutes, None)
        .await
        .unwrap()
}

/// One rule on the weekday of `date`, valid for a year around today.
async fn working_window(
    engine: &Engine,
    date: NaiveDate,
    start: NaiveTime,
    end: NaiveTime,
    brk: Option<(NaiveTime, NaiveTime)>,
) {
    engine
        .add_rule(
            date.weekday().num_days_from_monday() as u8,
            today(),
            today().checked_add_days(Days::new(365)).unwrap(),
            start,
            end,
            brk.map(|b| b.0),
            brk.map(|b| b.1),
        )
        .await
        .unwrap();
}

fn request(st: &ServiceType, date: NaiveDate, t: NaiveTime) -> BookingRequest {
    BookingRequest {
        service_type_id: st.id,
        slot: format!("{date} {}", t.format("%H:%M")),
        customer_name: "Ada Lovelace".into(),
        customer_email: "ada@example.org".into(),
        customer_birth_date: NaiveDate::from_ymd_opt(1990, 12, 10).unwrap(),
    }
}

fn starts_on(slots: &[Slot], date: NaiveDate) -> Vec<NaiveTime> {
    slots.iter().filter(|s| s.date == date).map(|s| s.time).collect()
}

#[tokio::test]
async fn window_boundary_yields_exact_fits_only() {
    let engine = engine("boundary");
    let st = service_type(&engine, "Passport application", 30).await;
    let date = next_matching(0);
    working_window(&engine, date, time(9, 0), time(10, 0), None).await;

    let slots = engine.free_slots(st.id).await;
    assert_eq!(starts_on(&slots, date), vec![time(9, 0), time(9, 30)]);
}

#[tokio::test]
async fn break_drops_slots_without_realigning() {
    let engine = engine("break");
    let st = service_type(&engine, "Passport application", 30).await;
    let date = next_matching(1);
    working_window(
        &engine,
        date,
        time(9, 0),
        time(10, 0),
        Some((time(9, 30), time(9, 45))),
    )
    .await;

    // 09:30 collides with the break; the cursor still advances to
    // 10:00, so nothing after the break fits either.
    let slots = engine.free_slots(st.id).await;
    assert_eq!(starts_on(&slots, date), vec![time(9, 0)]);
}

#[tokio::test]
async fn booked_slot_disappears_and_cannot_be_taken_twice() {
    let engine = engine("taken");
    let st = service_type(&engine, "Passport application", 30).await;
    let date = next_matching(2);
    working_window(&engine, date, time(9, 0), time(10, 0), None).await;

    let appt = assert_ok!(engine.book(request(&st, date, time(9, 0))).await);
    assert_eq!(appt.number, 1);
    assert_eq!(appt.status, Status::Scheduled);
    assert_eq!(appt.slot().to_string(), format!("{date} 09:00"));

    let slots = engine.free_slots(st.id).await;
    assert_eq!(starts_on(&slots, date), vec![time(9, 30)]);

    let err = engine.book(request(&st, date, time(9, 0))).await.unwrap_err();
    assert!(matches!(err, EngineError::SlotNoLongerAvailable(_)));
}

#[tokio::test]
async fn concurrent_bookings_for_one_slot_commit_exactly_once() {
    let engine = engine("race");
    let st = service_type(&engine, "Passport application", 30).await;
    let date = next_matching(3);
    working_window(&engine, date, time(9, 0), time(10, 0), None).await;

    let (a, b) = tokio::join!(
        engine.book(request(&st, date, time(9, 0))),
        engine.book(request(&st, date, time(9, 0))),
    );
    let wins = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(wins, 1);
    let loser = if a.is_ok() { b } else { a };
    assert!(matches!(
        loser.unwrap_err(),
        EngineError::SlotNoLongerAvailable(_)
    ));
}

#[tokio::test]
async fn concurrent_adds_of_one_name_commit_once() {
    let engine = engine("dup_name_race");
    let (a, b) = tokio::join!(
        engine.add_service_type("Visa".into(), 30, None),
        engine.add_service_type("Visa".into(), 30, None),
    );
    let oks = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(oks, 1);
    let loser = if a.is_ok() { b } else { a };
    assert!(matches!(loser.unwrap_err(), EngineError::AlreadyExists(_)));
    assert_eq!(engine.list_service_types().len(), 1);
}

#[tokio::test]
async fn concurrent_adds_of_one_exclusion_commit_once() {
    let engine = engine("dup_exclusion_race");
    let date = next_matching(0);
    let (a, b) = tokio::join!(
        engine.add_exclusion(date, None),
        engine.add_exclusion(date, None),
    );
    let oks = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(oks, 1);
    let loser = if a.is_ok() { b } else { a };
    assert!(matches!(loser.unwrap_err(), EngineError::AlreadyExists(_)));
    assert_eq!(engine.list_exclusions().len(), 1);
}

#[tokio::test]
async fn numbers_are_gap_free_and_keep_climbing() {
    let engine = engine("numbers");
    let st = service_type(&engine, "Passport application", 30).await;
    let date = next_matching(0);
    working_window(&engine, date, time(8, 0), time(12, 0), None).await;

    let a = engine.book(request(&st, date, time(8, 0))).await.unwrap();
    let b = engine.book(request(&st, date, time(8, 30))).await.unwrap();
    let c = engine.book(request(&st, date, time(9, 0))).await.unwrap();
    assert_eq!((a.number, b.number, c.number), (1, 2, 3));

    engine.reject_appointment(b.id).await.unwrap();
    let d = engine.book(request(&st, date, time(9, 30))).await.unwrap();
    assert_eq!(d.number, 4);
}

#[tokio::test]
async fn rejection_frees_the_slot_and_is_idempotent() {
    let engine = engine("reject");
    let st = service_type(&engine, "Passport application", 30).await;
    let date = next_matching(1);
    working_window(&engine, date, time(9, 0), time(10, 0), None).await;

    let appt = engine.book(request(&st, date, time(9, 0))).await.unwrap();
    assert_eq!(starts_on(&engine.free_slots(st.id).await, date), vec![time(9, 30)]);

    engine.reject_appointment(appt.id).await.unwrap();
    assert_eq!(
        starts_on(&engine.free_slots(st.id).await, date),
        vec![time(9, 0), time(9, 30)]
    );
    // A second rejection changes nothing.
    engine.reject_appointment(appt.id).await.unwrap();

    let status = engine
        .appointment_status("ADA LOVELACE", appt.number, appt.customer_birth_date)
        .await
        .unwrap();
    assert_eq!(status.status, Status::Rejected);

    // The slot can be taken again; the old number stays burned.
    let again = engine.book(request(&st, date, time(9, 0))).await.unwrap();
    assert_eq!(again.number, 2);
}

#[tokio::test]
async fn appointments_of_other_durations_still_block() {
    let engine = engine("durations");
    let short = service_type(&engine, "Document certification", 20).await;
    let long = service_type(&engine, "Passport application", 30).await;
    let date = next_matching(2);
    working_window(&engine, date, time(9, 0), time(10, 0), None).await;

    engine.book(request(&short, date, time(9, 0))).await.unwrap();

    // [09:00, 09:20) knocks out the long type's 09:00 candidate.
    let slots = engine.free_slots(long.id).await;
    assert_eq!(starts_on(&slots, date), vec![time(9, 30)]);
}

#[tokio::test]
async fn free_slots_is_idempotent_without_writes() {
    let engine = engine("idempotent");
    let st = service_type(&engine, "Passport application", 30).await;
    let date = next_matching(0);
    working_window(&engine, date, time(9, 0), time(11, 0), None).await;
    engine.book(request(&st, date, time(9, 30))).await.unwrap();

    let first = engine.free_slots(st.id).await;
    let second = engine.free_slots(st.id).await;
    assert!(!first.is_empty());
    assert_eq!(first, second);
}

#[tokio::test]
async fn staggered_rules_never_yield_overlapping_slots() {
    let engine = engine("staggered");
    let st = service_type(&engine, "Passport application", 30).await;
    let date = next_matching(1);
    // Two windows on the same day, offset by half a step. Candidates
    // merge to 9:00, 9:15, 9:30, 9:45, 10:00; earliest-wins keeps the
    // on-the-hour run.
    working_window(&engine, date, time(9, 0), time(10, 30), None).await;
    working_window(&engine, date, time(9, 15), time(10, 30), None).await;

    let starts = starts_on(&engine.free_slots(st.id).await, date);
    assert_eq!(starts, vec![time(9, 0), time(9, 30), time(10, 0)]);
    for pair in starts.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(gap >= chrono::Duration::minutes(30), "slots overlap: {pair:?}");
    }
}

#[tokio::test]
async fn weekends_and_exclusion_days_offer_nothing() {
    let engine = engine("closed_days");
    let st = service_type(&engine, "Passport application", 30).await;
    let date = next_matching(4);
    working_window(&engine, date, time(9, 0), time(10, 0), None).await;

    engine
        .add_exclusion(date, Some("public holiday".into()))
        .await
        .unwrap();

    let slots = engine.free_slots(st.id).await;
    assert!(starts_on(&slots, date).is_empty());
    assert!(slots.iter().all(|s| s.date.weekday().num_days_from_monday() < 5));

    let err = engine.book(request(&st, date, time(9, 0))).await.unwrap_err();
    assert!(matches!(err, EngineError::SlotNoLongerAvailable(_)));

    engine.remove_exclusion(date).await.unwrap();
    assert!(!starts_on(&engine.free_slots(st.id).await, date).is_empty());
}

#[tokio::test]
async fn exclusion_bookkeeping_errors() {
    let engine = engine("exclusion_errors");
    let date = next_matching(0);
    engine.add_exclusion(date, None).await.unwrap();
    assert!(matches!(
        engine.add_exclusion(date, None).await.unwrap_err(),
        EngineError::AlreadyExists(_)
    ));
    let other = next_matching(1);
    assert!(matches!(
        engine.remove_exclusion(other).await.unwrap_err(),
        EngineError::NoSuchExclusion(_)
    ));
}

#[tokio::test]
async fn malformed_slot_and_unknown_type_are_rejected() {
    let engine = engine("bad_input");
    let st = service_type(&engine, "Passport application", 30).await;
    let date = next_matching(0);
    working_window(&engine, date, time(9, 0), time(10, 0), None).await;

    let mut req = request(&st, date, time(9, 0));
    req.slot = "next tuesday at nine".into();
    assert!(matches!(
        engine.book(req).await.unwrap_err(),
        EngineError::InvalidSlot(_)
    ));

    let mut req = request(&st, date, time(9, 0));
    req.service_type_id = Ulid::new();
    assert!(matches!(
        engine.book(req).await.unwrap_err(),
        EngineError::NotFound(_)
    ));

    // Unknown type on the query side is simply empty, not an error.
    assert!(engine.free_slots(Ulid::new()).await.is_empty());
}

#[tokio::test]
async fn catalog_validation() {
    let engine = engine("validation");
    assert!(matches!(
        engine.add_service_type("  ".into(), 30, None).await.unwrap_err(),
        EngineError::Validation(_)
    ));
    assert!(matches!(
        engine.add_service_type("Visa".into(), 0, None).await.unwrap_err(),
        EngineError::Validation(_)
    ));
    let st = service_type(&engine, "Visa", 30).await;
    assert!(matches!(
        engine.add_service_type("Visa".into(), 20, None).await.unwrap_err(),
        EngineError::AlreadyExists(_)
    ));

    assert!(matches!(
        engine
            .add_rule(5, today(), today(), time(9, 0), time(10, 0), None, None)
            .await
            .unwrap_err(),
        EngineError::Validation(_)
    ));
    assert!(matches!(
        engine
            .add_rule(0, today(), today(), time(10, 0), time(9, 0), None, None)
            .await
            .unwrap_err(),
        EngineError::Validation(_)
    ));

    engine
        .update_notification_template(st.id, Some("Bring ID.".into()))
        .await
        .unwrap();
    assert_eq!(
        engine.get_service_type(&st.id).unwrap().notification_template,
        Some("Bring ID.".into())
    );
}

#[tokio::test]
async fn referenced_service_type_cannot_be_deleted() {
    let engine = engine("in_use");
    let st = service_type(&engine, "Passport application", 30).await;
    let date = next_matching(3);
    working_window(&engine, date, time(9, 0), time(10, 0), None).await;
    let appt = engine.book(request(&st, date, time(9, 0))).await.unwrap();

    assert!(matches!(
        engine.delete_service_type(st.id).await.unwrap_err(),
        EngineError::InUse(_)
    ));
    // Rejected appointments still pin the type.
    engine.reject_appointment(appt.id).await.unwrap();
    assert!(matches!(
        engine.delete_service_type(st.id).await.unwrap_err(),
        EngineError::InUse(_)
    ));

    engine.delete_appointment(appt.id).await.unwrap();
    engine.delete_service_type(st.id).await.unwrap();
    assert!(engine.get_service_type(&st.id).is_none());
}

#[tokio::test]
async fn purge_drops_everything_before_the_threshold() {
    let engine = engine("purge");
    let st = service_type(&engine, "Passport application", 30).await;
    let date = next_matching(0);
    working_window(&engine, date, time(9, 0), time(10, 0), None).await;
    engine.book(request(&st, date, time(9, 0))).await.unwrap();

    let untouched = engine
        .purge_appointments_before(date)
        .await
        .unwrap();
    assert_eq!(untouched, 0);

    let removed = engine
        .purge_appointments_before(date.checked_add_days(Days::new(1)).unwrap())
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(engine.list_appointments().await.is_empty());
}

#[tokio::test]
async fn status_lookup_requires_all_three_credentials() {
    let engine = engine("status");
    let st = service_type(&engine, "Passport application", 30).await;
    let date = next_matching(1);
    working_window(&engine, date, time(9, 0), time(10, 0), None).await;
    let appt = engine.book(request(&st, date, time(9, 0))).await.unwrap();

    let birth = appt.customer_birth_date;
    assert!(engine.appointment_status("ada lovelace", appt.number, birth).await.is_some());
    assert!(engine.appointment_status("someone else", appt.number, birth).await.is_none());
    assert!(engine.appointment_status("ada lovelace", appt.number + 1, birth).await.is_none());
    assert!(
        engine
            .appointment_status(
                "ada lovelace",
                appt.number,
                NaiveDate::from_ymd_opt(1991, 1, 1).unwrap()
            )
            .await
            .is_none()
    );
}

#[tokio::test]
async fn replay_reconstructs_the_full_state() {
    let path = test_wal_path("replay");
    let date = next_matching(2);
    let (st_id, appt_number) = {
        let engine = engine_at(path.clone());
        let st = service_type(&engine, "Passport application", 30).await;
        working_window(&engine, date, time(9, 0), time(10, 0), None).await;
        let appt = engine.book(request(&st, date, time(9, 0))).await.unwrap();
        engine
            .book(request(&st, date, time(9, 30)))
            .await
            .unwrap();
        engine.reject_appointment(appt.id).await.unwrap();
        (st.id, appt.number)
    };

    let engine = engine_at(path);
    assert_eq!(engine.list_service_types().len(), 1);
    let appts = engine.appointments_for_service_type(&st_id).await;
    assert_eq!(appts.len(), 2);
    assert_eq!(
        appts.iter().filter(|a| a.status == Status::Rejected).count(),
        1
    );
    // 09:00 was freed by the rejection, 09:30 is still taken.
    assert_eq!(starts_on(&engine.free_slots(st_id).await, date), vec![time(9, 0)]);
    // Numbering resumes past the replayed maximum.
    let next = engine.book(request(
        &engine.get_service_type(&st_id).unwrap(),
        date,
        time(9, 0),
    ))
    .await
    .unwrap();
    assert_eq!(next.number, appt_number + 2);
}

#[tokio::test]
async fn compaction_preserves_state_across_restart() {
    let path = test_wal_path("compact");
    let date = next_matching(3);
    let st_id = {
        let engine = engine_at(path.clone());
        let st = service_type(&engine, "Passport application", 30).await;
        working_window(&engine, date, time(9, 0), time(10, 0), None).await;
        let doomed = engine.book(request(&st, date, time(9, 0))).await.unwrap();
        engine.delete_appointment(doomed.id).await.unwrap();
        engine.book(request(&st, date, time(9, 30))).await.unwrap();
        engine.compact_wal().await.unwrap();
        st.id
    };

    let engine = engine_at(path);
    let appts = engine.appointments_for_service_type(&st_id).await;
    assert_eq!(appts.len(), 1);
    assert_eq!(appts[0].time, time(9, 30));
    assert_eq!(starts_on(&engine.free_slots(st_id).await, date), vec![time(9, 0)]);
}

#[tokio::test]
async fn seeding_runs_once() {
    let engine = engine("seed");
    engine.seed_defaults().await.unwrap();
    assert_eq!(engine.list_service_types().len(), 2);
    engine.seed_defaults().await.unwrap();
    assert_eq!(engine.list_service_types().len(), 2);

    let names: Vec<String> = engine
        .list_service_types()
        .into_iter()
        .map(|st| st.name)
        .collect();
    assert_eq!(names, vec!["Document certification", "Passport application"]);
}
