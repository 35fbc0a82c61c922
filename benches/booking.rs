//! Throughput and latency probe for the availability and booking paths.
//!
//! Not a criterion bench on purpose: the interesting numbers are tail
//! latencies under concurrent committers, which are easier to read off
//! a plain run. `cargo bench` prints a small report.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Days, Local, NaiveTime};
use tokio::runtime::Runtime;
use ulid::Ulid;

use termin::engine::Engine;
use termin::model::BookingRequest;
use termin::notify::NotifyHub;

const QUERY_ROUNDS: usize = 2_000;
const COMMITTERS: usize = 32;
const BOOKINGS_PER_COMMITTER: usize = 50;

fn bench_wal_path() -> PathBuf {
    let mut p = std::env::temp_dir();
    p.push(format!("termin_bench_{}.wal", Ulid::new()));
    p
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
    sorted[idx]
}

fn report(label: &str, mut samples: Vec<Duration>) {
    samples.sort();
    println!(
        "{label}: n={} p50={:?} p95={:?} p99={:?} max={:?}",
        samples.len(),
        percentile(&samples, 0.50),
        percentile(&samples, 0.95),
        percentile(&samples, 0.99),
        samples.last().copied().unwrap_or(Duration::ZERO),
    );
}

fn main() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let path = bench_wal_path();
        let engine = Arc::new(Engine::new(path.clone(), Arc::new(NotifyHub::new()), 60).unwrap());

        let st = engine
            .add_service_type("Passport application".into(), 15, None)
            .await
            .unwrap();
        let today = Local::now().date_naive();
        for dow in 0..5u8 {
            engine
                .add_rule(
                    dow,
                    today,
                    today.checked_add_days(Days::new(365)).unwrap(),
                    NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
                    NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
                    Some(NaiveTime::from_hms_opt(12, 0, 0).unwrap()),
                    Some(NaiveTime::from_hms_opt(13, 0, 0).unwrap()),
                )
                .await
                .unwrap();
        }

        // Availability over the full horizon, hot in cache.
        let mut samples = Vec::with_capacity(QUERY_ROUNDS);
        for _ in 0..QUERY_ROUNDS {
            let t = Instant::now();
            let slots = engine.free_slots(st.id).await;
            samples.push(t.elapsed());
            assert!(!slots.is_empty());
        }
        report("free_slots", samples);

        // Concurrent committers racing over the same horizon. Losers
        // hitting slot_taken are part of the workload, not a failure.
        let slots = engine.free_slots(st.id).await;
        let started = Instant::now();
        let mut tasks = Vec::new();
        for worker in 0..COMMITTERS {
            let engine = Arc::clone(&engine);
            let slots = slots.clone();
            let service_type_id = st.id;
            tasks.push(tokio::spawn(async move {
                let mut samples = Vec::with_capacity(BOOKINGS_PER_COMMITTER);
                let mut committed = 0usize;
                for i in 0..BOOKINGS_PER_COMMITTER {
                    let slot = slots[(worker + i * COMMITTERS) % slots.len()];
                    let req = BookingRequest {
                        service_type_id,
                        slot: slot.to_string(),
                        customer_name: format!("Worker {worker}"),
                        customer_email: format!("w{worker}@example.org"),
                        customer_birth_date: today,
                    };
                    let t = Instant::now();
                    if engine.book(req).await.is_ok() {
                        committed += 1;
                    }
                    samples.push(t.elapsed());
                }
                (samples, committed)
            }));
        }

        let mut all = Vec::new();
        let mut committed = 0usize;
        for task in tasks {
            let (samples, n) = task.await.unwrap();
            all.extend(samples);
            committed += n;
        }
        let wall = started.elapsed();
        report("book", all);
        println!(
            "book: committed={committed}/{} wall={wall:?} ({:.0} commits/s)",
            COMMITTERS * BOOKINGS_PER_COMMITTER,
            committed as f64 / wall.as_secs_f64(),
        );

        let _ = std::fs::remove_file(path);
    });
}
