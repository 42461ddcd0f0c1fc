//! Periodic background work: liveness sweeps, statistics flushes and
//! statistics retention.

use crate::handlers::AppState;
use crate::metrics;
use std::sync::Arc;
use std::time::Duration;
use tenvis_herald_core::connection::now_millis;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// How often old statistics are deleted.
const RETENTION_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Spawn every background task the configuration asks for.
pub fn spawn_all(state: &Arc<AppState>) -> Vec<JoinHandle<()>> {
    let mut tasks = vec![spawn_sweeper(Arc::clone(state))];
    if state.config.statistics.enabled {
        tasks.push(spawn_statistics(Arc::clone(state)));
        tasks.push(spawn_retention(Arc::clone(state)));
    }
    tasks
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Close silent connections and refresh the channel gauges.
pub async fn sweep(state: &AppState) -> usize {
    let closed = state.dispatcher.close_stale(state.config.heartbeat.timeout()).await;
    if closed > 0 {
        info!(closed, "Closed connections that stopped responding");
    }
    let stats = state.dispatcher.manager().local().stats();
    metrics::set_channel_stats(stats.channel_count, stats.total_subscriptions);
    closed
}

fn spawn_sweeper(state: Arc<AppState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = ticker(state.config.heartbeat.sweep_interval());
        ticker.tick().await;
        loop {
            ticker.tick().await;
            sweep(&state).await;
        }
    })
}

fn spawn_statistics(state: Arc<AppState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = ticker(state.config.statistics.interval());
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let summary = state
                .dispatcher
                .statistics()
                .save(state.dispatcher.manager().as_ref(), state.store.as_ref())
                .await;
            if summary.failed > 0 {
                warn!(failed = summary.failed, "Some statistics could not be stored");
            }
        }
    })
}

/// Delete statistics older than the retention period.
pub async fn purge_statistics(state: &AppState) -> usize {
    let retention = state.config.statistics.retention().as_millis() as u64;
    let cutoff = now_millis().saturating_sub(retention);
    match state.store.delete_older_than(cutoff, None).await {
        Ok(deleted) => {
            debug!(deleted, "Purged old statistics");
            deleted
        }
        Err(e) => {
            warn!(error = %e, "Failed to purge old statistics");
            0
        }
    }
}

fn spawn_retention(state: Arc<AppState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = ticker(RETENTION_INTERVAL);
        loop {
            ticker.tick().await;
            purge_statistics(&state).await;
        }
    })
}
