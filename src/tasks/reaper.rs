//! Queue-age reaper.
//!
//! Fails pending records that aged out before any dispatcher claimed them,
//! bounding queue growth when no worker is healthy. Expired records are
//! failed directly — `owner` is never set — and a best-effort `error` event
//! is mirrored to any live subscriber. Repeated expiries signal systemic
//! under-capacity, not a bug in one task.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{info, warn};

use crate::config::DispatcherConfig;
use crate::events::{ResultBroker, StreamEvent};
use crate::tasks::TaskStorage;

/// One reaper pass: fail every pending record older than `max_queue_age`.
/// Returns how many records were expired. Safe to run with no dispatcher
/// alive, and safe to race against live claims (the per-record guard skips
/// anything a dispatcher grabbed between scan and update).
pub async fn expire_pass(
    storage: &TaskStorage,
    broker: &ResultBroker,
    max_queue_age: Duration,
) -> anyhow::Result<usize> {
    let cutoff = Utc::now().timestamp_millis() - max_queue_age.as_millis() as i64;
    let stale = storage.stale_pending(cutoff).await?;
    if stale.is_empty() {
        return Ok(0);
    }

    let error = format!(
        "expired before claim (pending longer than {}s)",
        max_queue_age.as_secs()
    );
    let mut expired = 0;
    for task_id in &stale {
        match storage.fail_if_pending(task_id, &error).await {
            Ok(true) => {
                info!(task_id = %task_id, "reaper expired unclaimed task");
                broker.publish(
                    task_id,
                    StreamEvent::Error {
                        message: error.clone(),
                    },
                );
                expired += 1;
            }
            Ok(false) => {
                // Claimed between scan and update — leave it alone.
            }
            Err(e) => {
                warn!(task_id = %task_id, err = %e, "failed to expire task");
            }
        }
    }

    if expired > 0 {
        info!(count = expired, "reaper pass expired unclaimed tasks");
    }
    Ok(expired)
}

/// Background reaper loop. Spawn once per process next to the dispatcher.
pub async fn run_reaper(
    storage: Arc<TaskStorage>,
    broker: Arc<ResultBroker>,
    config: DispatcherConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let max_age = Duration::from_secs(config.max_queue_age_secs);
    info!(
        interval_secs = config.reaper_interval_secs,
        max_queue_age_secs = config.max_queue_age_secs,
        "reaper started"
    );
    let mut ticker = interval(Duration::from_secs(config.reaper_interval_secs));

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = expire_pass(&storage, &broker, max_age).await {
                    warn!(err = %e, "reaper pass failed");
                }
            }
        }
    }
    info!("reaper stopped");
}
