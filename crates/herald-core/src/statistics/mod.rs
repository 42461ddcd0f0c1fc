//! Per-app usage statistics.
//!
//! The collector counts connections and messages between flushes. A flush
//! writes one record per active app to a [`StatisticsStore`] and restarts the
//! counters from the live, cluster-wide connection count.

mod store;

pub use store::{
    GraphData, MemoryStatisticsStore, Series, StatisticRecord, StatisticsStore, StoreError,
    TimeRange,
};

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::app::AppProvider;
use crate::connection::now_millis;
use crate::manager::ChannelManager;

/// Counters of one app since the last flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Statistic {
    pub app_id: String,
    pub current_connections: u64,
    pub peak_connections: u64,
    pub websocket_messages: u64,
    pub api_messages: u64,
}

impl Statistic {
    #[must_use]
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            ..Self::default()
        }
    }

    pub fn connection(&mut self) {
        self.current_connections += 1;
        self.peak_connections = self.peak_connections.max(self.current_connections);
    }

    pub fn disconnection(&mut self) {
        self.current_connections = self.current_connections.saturating_sub(1);
    }

    pub fn websocket_message(&mut self) {
        self.websocket_messages += 1;
    }

    pub fn api_message(&mut self) {
        self.api_messages += 1;
    }

    /// An entry with nothing to report.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.current_connections == 0
            && self.peak_connections == 0
            && self.websocket_messages == 0
            && self.api_messages == 0
    }

    #[must_use]
    pub fn to_record(&self, timestamp: u64) -> StatisticRecord {
        StatisticRecord {
            app_id: self.app_id.clone(),
            peak_connections: self.peak_connections,
            websocket_messages_count: self.websocket_messages,
            api_messages_count: self.api_messages,
            timestamp,
        }
    }

    /// Start a new interval after `flushed` was stored.
    ///
    /// Messages counted since the snapshot are kept.
    pub fn reset(&mut self, connections: u64, flushed: &Statistic) {
        self.websocket_messages = self.websocket_messages.saturating_sub(flushed.websocket_messages);
        self.api_messages = self.api_messages.saturating_sub(flushed.api_messages);
        self.current_connections = connections;
        self.peak_connections = connections;
    }
}

/// What a flush did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveSummary {
    pub stored: usize,
    pub removed: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Counts activity per app between flushes.
pub struct StatisticsCollector {
    statistics: DashMap<String, Statistic>,
    apps: Arc<dyn AppProvider>,
}

impl StatisticsCollector {
    #[must_use]
    pub fn new(apps: Arc<dyn AppProvider>) -> Self {
        Self {
            statistics: DashMap::new(),
            apps,
        }
    }

    fn update(&self, app_id: &str, f: impl FnOnce(&mut Statistic)) {
        let mut entry = self
            .statistics
            .entry(app_id.to_string())
            .or_insert_with(|| Statistic::new(app_id));
        f(entry.value_mut());
    }

    pub fn web_socket_message(&self, app_id: &str) {
        self.update(app_id, Statistic::websocket_message);
    }

    pub fn api_message(&self, app_id: &str) {
        self.update(app_id, Statistic::api_message);
    }

    pub fn connection(&self, app_id: &str) {
        self.update(app_id, Statistic::connection);
    }

    pub fn disconnection(&self, app_id: &str) {
        self.update(app_id, Statistic::disconnection);
    }

    /// Snapshot of an app's counters.
    #[must_use]
    pub fn get(&self, app_id: &str) -> Option<Statistic> {
        self.statistics.get(app_id).map(|s| s.clone())
    }

    /// Snapshot of every app's counters.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Statistic> {
        self.statistics.iter().map(|s| s.clone()).collect()
    }

    /// Drop all counters.
    pub fn flush(&self) {
        self.statistics.clear();
    }

    /// Store one record per app and start new intervals.
    ///
    /// Apps with statistics disabled are left untouched. Idle entries are
    /// removed instead of stored. If the store fails for an app, its counters
    /// keep accumulating until the next flush.
    pub async fn save(&self, manager: &dyn ChannelManager, store: &dyn StatisticsStore) -> SaveSummary {
        let mut summary = SaveSummary::default();
        let app_ids: Vec<String> = self.statistics.iter().map(|s| s.key().clone()).collect();

        for app_id in app_ids {
            let Some(snapshot) = self.get(&app_id) else {
                continue;
            };

            let enabled = self
                .apps
                .find_by_id(&app_id)
                .is_some_and(|app| app.enable_statistics);
            if !enabled {
                summary.skipped += 1;
                continue;
            }

            if snapshot.is_idle() {
                self.statistics.remove_if(&app_id, |_, s| s.is_idle());
                summary.removed += 1;
                continue;
            }

            if let Err(e) = store.store(snapshot.to_record(now_millis())).await {
                warn!(app_id = %app_id, error = %e, "Failed to store statistics");
                summary.failed += 1;
                continue;
            }

            let connections = manager.global_connection_count(&app_id).await as u64;
            if let Some(mut statistic) = self.statistics.get_mut(&app_id) {
                statistic.reset(connections, &snapshot);
            }
            summary.stored += 1;
        }

        debug!(?summary, "Statistics saved");
        summary
    }
}
