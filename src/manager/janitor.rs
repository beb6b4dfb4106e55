//! Janitor: periodic reclamation of idle instances and dead stream queues.
//!
//! Best-effort by design: a missed sweep is never an error, and a live
//! session is protected by the same per-instance execution lock workers
//! hold.

use super::TaskManager;
use crate::constants::{RESULT_QUEUE, RESULT_RETENTION_SECS};
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub(super) async fn janitor_loop(manager: Arc<TaskManager>, mut shutdown: watch::Receiver<bool>) {
    let period = Duration::from_secs(manager.config.cleanup_interval_seconds);
    debug!("janitor started (period: {:?})", period);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(period) => {
                sweep(&manager).await;
            }
        }
    }
    debug!("janitor stopped");
}

/// One full sweep: idle instances, stale stream queues, expired results.
pub(crate) async fn sweep(manager: &Arc<TaskManager>) {
    let idle_limit = chrono::Duration::seconds(manager.config.instance_timeout_seconds as i64);
    let now = Utc::now();
    let mut reclaimed = 0usize;

    for (session_key, instance) in manager.registry.snapshot().await {
        if now - instance.last_used() <= idle_limit {
            continue;
        }
        // Only reclaim when no task is executing: taking the execution lock
        // non-blockingly proves that.
        let Some(guard) = instance.try_acquire() else {
            continue;
        };
        if manager.registry.destroy(&session_key).await {
            manager.contexts.destroy(&session_key).await;
            reclaimed += 1;
        }
        drop(guard);
    }

    let stale = manager.stale_streams().await;
    let stale_count = stale.len();
    for task_id in stale {
        manager.drop_stream(&task_id).await;
    }

    match manager
        .queue
        .purge_expired(RESULT_QUEUE, Duration::from_secs(RESULT_RETENTION_SECS))
        .await
    {
        Ok(purged) if purged > 0 => {
            debug!("purged {} unclaimed results", purged);
        }
        Ok(_) => {}
        Err(e) => warn!("result retention purge failed: {}", e),
    }

    if reclaimed > 0 || stale_count > 0 {
        info!(
            "janitor sweep: {} instances reclaimed, {} stream queues removed",
            reclaimed, stale_count
        );
    }
}
