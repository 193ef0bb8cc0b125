//! In-memory store, used as a test double and for dry runs.

use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::errors::Result;

use super::{
    ChannelDataPoint, ChannelRecord, ExperimentRecord, FeeChangeRecord, TimeSeriesStore,
};

#[derive(Debug, Default)]
struct Inner {
    experiment: Option<ExperimentRecord>,
    channels: Vec<ChannelRecord>,
    data_points: Vec<ChannelDataPoint>,
    changes: Vec<FeeChangeRecord>,
}

/// Everything kept in a mutex-guarded vector; ordering matches append order.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded fee changes, in append order.
    pub fn changes(&self) -> Vec<FeeChangeRecord> {
        self.inner.lock().unwrap().changes.clone()
    }

    /// Number of data points recorded so far.
    pub fn data_point_count(&self) -> usize {
        self.inner.lock().unwrap().data_points.len()
    }

    pub fn experiment(&self) -> Option<ExperimentRecord> {
        self.inner.lock().unwrap().experiment.clone()
    }
}

impl TimeSeriesStore for MemoryStore {
    fn save_experiment(&self, record: &ExperimentRecord) -> Result<()> {
        self.inner.lock().unwrap().experiment = Some(record.clone());
        Ok(())
    }

    fn save_channel(&self, record: &ChannelRecord) -> Result<()> {
        self.inner.lock().unwrap().channels.push(record.clone());
        Ok(())
    }

    fn append_data_point(&self, point: &ChannelDataPoint) -> Result<()> {
        self.inner.lock().unwrap().data_points.push(point.clone());
        Ok(())
    }

    fn append_change(&self, change: &FeeChangeRecord) -> Result<()> {
        self.inner.lock().unwrap().changes.push(change.clone());
        Ok(())
    }

    fn query_recent(
        &self,
        channel_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ChannelDataPoint>> {
        let inner = self.inner.lock().unwrap();
        let mut points: Vec<ChannelDataPoint> = inner
            .data_points
            .iter()
            .filter(|p| p.channel_id == channel_id && p.at >= since)
            .cloned()
            .collect();
        points.sort_by_key(|p| p.at);
        Ok(points)
    }

    fn query_rollbacks(&self) -> Result<Vec<FeeChangeRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .changes
            .iter()
            .filter(|c| c.is_rollback())
            .cloned()
            .collect())
    }
}
