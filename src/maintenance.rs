//! Background WAL compaction.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::Engine;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Periodically rewrite the WAL as the minimal event stream for the
/// current state, once enough appends have accumulated since the last
/// compaction. Runs until the process exits.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut tick = tokio::time::interval(SWEEP_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        info!(appends, threshold, "compacting WAL");
        match engine.compact_wal().await {
            Ok(()) => {
                metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
            }
            Err(err) => warn!(%err, "WAL compaction failed"),
        }
    }
}
