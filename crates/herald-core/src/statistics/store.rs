//! Persistence of flushed statistics.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;
use tokio::sync::RwLock;

/// Statistics store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend rejected the operation.
    #[error("Statistics store unavailable: {0}")]
    Unavailable(String),
}

/// One flushed interval of an app's activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticRecord {
    pub app_id: String,
    pub peak_connections: u64,
    pub websocket_messages_count: u64,
    pub api_messages_count: u64,
    /// Epoch milliseconds of the flush.
    pub timestamp: u64,
}

/// Inclusive time bounds, in epoch milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: Option<u64>,
    pub to: Option<u64>,
}

impl TimeRange {
    #[must_use]
    pub fn contains(&self, timestamp: u64) -> bool {
        self.from.map_or(true, |from| timestamp >= from) && self.to.map_or(true, |to| timestamp <= to)
    }
}

/// One metric as chart coordinates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Series {
    pub x: Vec<u64>,
    pub y: Vec<u64>,
}

/// Records reshaped for charting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphData {
    pub peak_connections: Series,
    pub websocket_messages_count: Series,
    pub api_messages_count: Series,
}

impl GraphData {
    /// Build chart data from records in timestamp order.
    #[must_use]
    pub fn from_records(records: &[StatisticRecord]) -> Self {
        let mut graph = Self::default();
        for record in records {
            graph.peak_connections.x.push(record.timestamp);
            graph.peak_connections.y.push(record.peak_connections);
            graph.websocket_messages_count.x.push(record.timestamp);
            graph.websocket_messages_count.y.push(record.websocket_messages_count);
            graph.api_messages_count.x.push(record.timestamp);
            graph.api_messages_count.y.push(record.api_messages_count);
        }
        graph
    }
}

/// Where flushed statistics go.
#[async_trait]
pub trait StatisticsStore: Send + Sync {
    /// Persist a record.
    async fn store(&self, record: StatisticRecord) -> Result<(), StoreError>;

    /// Records of an app within a range, oldest first.
    async fn records(&self, app_id: &str, range: TimeRange) -> Result<Vec<StatisticRecord>, StoreError>;

    /// Records of an app within a range, shaped for charting.
    async fn graph(&self, app_id: &str, range: TimeRange) -> Result<GraphData, StoreError> {
        Ok(GraphData::from_records(&self.records(app_id, range).await?))
    }

    /// Delete records older than `cutoff` (epoch milliseconds), optionally
    /// for one app only. Returns how many were deleted.
    async fn delete_older_than(&self, cutoff: u64, app_id: Option<&str>) -> Result<usize, StoreError>;
}

/// Default number of records kept in memory.
const DEFAULT_MAX_RECORDS: usize = 100_000;

/// In-memory store, bounded by record count.
#[derive(Debug)]
pub struct MemoryStatisticsStore {
    records: RwLock<VecDeque<StatisticRecord>>,
    max_records: usize,
}

impl MemoryStatisticsStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_records(DEFAULT_MAX_RECORDS)
    }

    /// Keep at most `max_records`, dropping the oldest.
    #[must_use]
    pub fn with_max_records(max_records: usize) -> Self {
        Self {
            records: RwLock::new(VecDeque::new()),
            max_records,
        }
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

impl Default for MemoryStatisticsStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StatisticsStore for MemoryStatisticsStore {
    async fn store(&self, record: StatisticRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        records.push_back(record);
        while records.len() > self.max_records {
            records.pop_front();
        }
        Ok(())
    }

    async fn records(&self, app_id: &str, range: TimeRange) -> Result<Vec<StatisticRecord>, StoreError> {
        let records = self.records.read().await;
        let mut matching: Vec<_> = records
            .iter()
            .filter(|r| r.app_id == app_id && range.contains(r.timestamp))
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.timestamp);
        Ok(matching)
    }

    async fn delete_older_than(&self, cutoff: u64, app_id: Option<&str>) -> Result<usize, StoreError> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|r| r.timestamp >= cutoff || app_id.is_some_and(|id| r.app_id != id));
        Ok(before - records.len())
    }
}
