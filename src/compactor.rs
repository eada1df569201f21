use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::catalog::Fleet;
use crate::engine::EngineError;
use crate::store::{ReservationStore, StoreError};

/// Background task that compacts the reservation and fleet WALs once enough
/// appends have accumulated since their last compaction.
pub async fn run_compactor(store: Arc<ReservationStore>, fleet: Arc<Fleet>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_due(&store, threshold).await {
            error!("reservation WAL compaction failed: {e}");
        }
        if let Err(e) = compact_fleet_if_due(&fleet, threshold).await {
            error!("fleet WAL compaction failed: {e}");
        }
    }
}

/// Compact when at least `threshold` appends happened since the last
/// compaction. Returns whether a compaction ran.
pub async fn compact_if_due(store: &ReservationStore, threshold: u64) -> Result<bool, StoreError> {
    let appends = store.appends_since_compact().await?;
    if appends < threshold {
        debug!("compaction not due: {appends}/{threshold} appends");
        return Ok(false);
    }
    store.compact().await?;
    metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
    info!(
        "compacted reservation WAL after {appends} appends ({} reservations)",
        store.reservation_count()
    );
    Ok(true)
}

pub async fn compact_fleet_if_due(fleet: &Fleet, threshold: u64) -> Result<bool, EngineError> {
    let appends = fleet.appends_since_compact().await;
    if appends < threshold {
        return Ok(false);
    }
    fleet.compact().await?;
    metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
    info!("compacted fleet WAL after {appends} appends ({} cars)", fleet.len());
    Ok(true)
}
