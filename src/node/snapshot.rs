//! Raw channel data as reported by the node management API.

use serde::{Deserialize, Serialize};

/// Point-in-time view of one channel, as delivered by the node source.
///
/// Everything the feature extractor needs; no derived fields.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChannelSnapshot {
    pub channel_id: String,
    pub capacity_sat: u64,
    pub local_balance_sat: u64,
    pub remote_balance_sat: u64,
    pub outbound_fee_ppm: u32,
    pub outbound_base_msat: u64,
    /// Signed; negative means discount.
    pub inbound_fee_ppm: i32,
    pub inbound_base_msat: i64,
    pub forwarded_in_7d_msat: u64,
    pub forwarded_out_7d_msat: u64,
    pub fee_earned_msat: u64,
    pub peer_pubkey: String,
    pub peer_alias: Option<String>,
    pub age_days: Option<u32>,
    /// Outbound fee rates other nodes charge on channels to the same peer.
    #[serde(default)]
    pub peer_fee_rates: Vec<u32>,
    #[serde(default)]
    pub alternative_routes: u32,
}

/// Fee update command sent to the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct FeeUpdate {
    pub outbound_fee_ppm: u32,
    pub outbound_base_msat: u64,
    pub inbound_fee_ppm: i32,
    pub inbound_base_msat: i64,
}

impl FeeUpdate {
    pub fn new(
        outbound_fee_ppm: u32,
        outbound_base_msat: u64,
        inbound_fee_ppm: i32,
        inbound_base_msat: i64,
    ) -> Self {
        Self {
            outbound_fee_ppm,
            outbound_base_msat,
            inbound_fee_ppm,
            inbound_base_msat,
        }
    }
}
