//! Time-series persistence for experiment data.
//!
//! The control loop appends a data point per channel per cycle and a record
//! per applied fee change; the safety monitor reads recent data points back.
//! Only the query contract matters to the core — the JSON-lines store is
//! one implementation, the in-memory store backs tests.

mod jsonl;
mod memory;

pub use jsonl::JsonlStore;
pub use memory::MemoryStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::Result;

/// Reason prefix marking a change as a safety rollback.
pub const ROLLBACK_PREFIX: &str = "ROLLBACK";

/// The one-per-run experiment record.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExperimentRecord {
    pub started_at: DateTime<Utc>,
    pub channel_count: usize,
}

/// One row per managed channel: identity, segment, and the immutable
/// baseline alongside the current fees.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChannelRecord {
    pub channel_id: String,
    pub segment: String,
    pub capacity_sat: u64,
    pub monthly_flow_msat: u64,
    pub peer_pubkey: String,
    pub baseline_outbound_ppm: u32,
    pub baseline_inbound_ppm: i32,
    pub current_outbound_ppm: u32,
    pub current_inbound_ppm: i32,
}

/// One observation of one channel at one cycle.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChannelDataPoint {
    pub at: DateTime<Utc>,
    /// Whole hours since experiment start.
    pub experiment_hour: u32,
    pub channel_id: String,
    pub segment: String,
    pub parameter_set: String,
    pub outbound_fee_ppm: u32,
    pub outbound_base_msat: u64,
    pub inbound_fee_ppm: i32,
    pub local_balance_sat: u64,
    pub remote_balance_sat: u64,
    pub balance_ratio: f64,
    pub forwarded_in_msat: u64,
    pub forwarded_out_msat: u64,
    pub fee_earned_msat: u64,
}

impl ChannelDataPoint {
    /// Total forwarded volume at this observation, msat.
    pub fn flow_msat(&self) -> u64 {
        self.forwarded_in_msat + self.forwarded_out_msat
    }
}

/// One applied (or refused) fee change.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeeChangeRecord {
    pub at: DateTime<Utc>,
    pub channel_id: String,
    pub parameter_set: String,
    pub old_outbound_ppm: u32,
    pub new_outbound_ppm: u32,
    pub old_inbound_ppm: i32,
    pub new_inbound_ppm: i32,
    pub reason: String,
    pub success: bool,
}

impl FeeChangeRecord {
    /// Whether this change reverted a channel to its baseline.
    pub fn is_rollback(&self) -> bool {
        self.reason.starts_with(ROLLBACK_PREFIX)
    }
}

/// Append-only persistence consumed by the control loop.
///
/// Write failures surface as [`crate::Error::Persistence`]; the caller logs
/// them and carries on — bookkeeping never undoes an applied fee change.
pub trait TimeSeriesStore: Send + Sync {
    fn save_experiment(&self, record: &ExperimentRecord) -> Result<()>;
    fn save_channel(&self, record: &ChannelRecord) -> Result<()>;
    fn append_data_point(&self, point: &ChannelDataPoint) -> Result<()>;
    fn append_change(&self, change: &FeeChangeRecord) -> Result<()>;
    /// Data points for one channel at or after `since`, oldest first.
    fn query_recent(&self, channel_id: &str, since: DateTime<Utc>)
        -> Result<Vec<ChannelDataPoint>>;
    /// All recorded rollback changes.
    fn query_rollbacks(&self) -> Result<Vec<FeeChangeRecord>>;
}
