use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites a clinic's WAL with the minimal event set
/// once enough appends accumulate. One per clinic, spawned at engine
/// creation.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
