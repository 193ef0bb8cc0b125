//! Channel feature extraction.
//!
//! Turns a raw node snapshot into the flat, typed record the policy engine
//! matches and calculates against. Pure data transformation, no I/O; a
//! feature record is built fresh every cycle and never mutated.

use serde::{Deserialize, Serialize};

use crate::node::ChannelSnapshot;

/// Activity classification derived from 7-day volume relative to capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityLevel {
    Inactive,
    Low,
    Medium,
    High,
}

impl ActivityLevel {
    /// Classify from 7-day forwarded volume (msat) against capacity (sat).
    ///
    /// Thresholds on the volume/capacity ratio: >10% high, >1% medium,
    /// any non-zero flow low, otherwise inactive.
    pub fn classify(volume_7d_msat: u64, capacity_sat: u64) -> Self {
        if volume_7d_msat == 0 {
            return ActivityLevel::Inactive;
        }
        let capacity_msat = capacity_sat.saturating_mul(1000).max(1);
        let utilization = volume_7d_msat as f64 / capacity_msat as f64;
        if utilization > 0.10 {
            ActivityLevel::High
        } else if utilization > 0.01 {
            ActivityLevel::Medium
        } else {
            ActivityLevel::Low
        }
    }

    /// Whether the channel forwarded anything at all in the window.
    pub fn is_active(&self) -> bool {
        !matches!(self, ActivityLevel::Inactive)
    }
}

impl std::fmt::Display for ActivityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActivityLevel::Inactive => "inactive",
            ActivityLevel::Low => "low",
            ActivityLevel::Medium => "medium",
            ActivityLevel::High => "high",
        };
        write!(f, "{s}")
    }
}

/// Per-cycle, read-only view of one channel.
///
/// Owned exclusively by the cycle that created it.
#[derive(Debug, Clone)]
pub struct ChannelFeature {
    pub channel_id: String,
    /// Total channel capacity in sats.
    pub capacity_sat: u64,
    pub local_balance_sat: u64,
    pub remote_balance_sat: u64,
    /// local / (local + remote), in [0, 1]. Zero-capacity channels get 0.5.
    pub balance_ratio: f64,
    /// Current outbound fee rate in ppm.
    pub outbound_fee_ppm: u32,
    /// Current outbound base fee in msat.
    pub outbound_base_msat: u64,
    /// Current inbound fee rate in ppm; negative means discount.
    pub inbound_fee_ppm: i32,
    /// Current inbound base fee in msat, signed.
    pub inbound_base_msat: i64,
    /// Forwarded volume received through this channel over 7 days, msat.
    pub forwarded_in_7d_msat: u64,
    /// Forwarded volume sent through this channel over 7 days, msat.
    pub forwarded_out_7d_msat: u64,
    pub activity: ActivityLevel,
    pub peer_pubkey: String,
    pub peer_alias: Option<String>,
    /// Accumulated fee revenue earned on this channel, msat.
    pub fee_earned_msat: u64,
    /// Channel age in days, if the source reports it.
    pub age_days: Option<u32>,
    /// Outbound fee rates of other nodes on channels to the same peer.
    pub peer_fee_rates: Vec<u32>,
    /// Number of alternative routes to the peer.
    pub alternative_routes: u32,
}

impl ChannelFeature {
    /// Build a feature record from a raw snapshot.
    pub fn from_snapshot(snapshot: &ChannelSnapshot) -> Self {
        let total = snapshot.local_balance_sat + snapshot.remote_balance_sat;
        let balance_ratio = if total == 0 {
            0.5
        } else {
            snapshot.local_balance_sat as f64 / total as f64
        };
        let volume_7d = snapshot.forwarded_in_7d_msat + snapshot.forwarded_out_7d_msat;

        Self {
            channel_id: snapshot.channel_id.clone(),
            capacity_sat: snapshot.capacity_sat,
            local_balance_sat: snapshot.local_balance_sat,
            remote_balance_sat: snapshot.remote_balance_sat,
            balance_ratio,
            outbound_fee_ppm: snapshot.outbound_fee_ppm,
            outbound_base_msat: snapshot.outbound_base_msat,
            inbound_fee_ppm: snapshot.inbound_fee_ppm,
            inbound_base_msat: snapshot.inbound_base_msat,
            forwarded_in_7d_msat: snapshot.forwarded_in_7d_msat,
            forwarded_out_7d_msat: snapshot.forwarded_out_7d_msat,
            activity: ActivityLevel::classify(volume_7d, snapshot.capacity_sat),
            peer_pubkey: snapshot.peer_pubkey.clone(),
            peer_alias: snapshot.peer_alias.clone(),
            fee_earned_msat: snapshot.fee_earned_msat,
            age_days: snapshot.age_days,
            peer_fee_rates: snapshot.peer_fee_rates.clone(),
            alternative_routes: snapshot.alternative_routes,
        }
    }

    /// Total forwarded volume over the 7-day window, msat.
    pub fn flow_7d_msat(&self) -> u64 {
        self.forwarded_in_7d_msat + self.forwarded_out_7d_msat
    }

    /// Own outbound fee relative to the average peer fee, if known.
    pub fn peer_fee_ratio(&self) -> Option<f64> {
        if self.peer_fee_rates.is_empty() {
            return None;
        }
        let avg = self.peer_fee_rates.iter().map(|&r| r as f64).sum::<f64>()
            / self.peer_fee_rates.len() as f64;
        if avg == 0.0 {
            return None;
        }
        Some(self.outbound_fee_ppm as f64 / avg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::ChannelSnapshot;

    fn snapshot() -> ChannelSnapshot {
        ChannelSnapshot {
            channel_id: "871x2x1".to_string(),
            capacity_sat: 5_000_000,
            local_balance_sat: 4_500_000,
            remote_balance_sat: 500_000,
            outbound_fee_ppm: 100,
            outbound_base_msat: 1000,
            inbound_fee_ppm: 0,
            inbound_base_msat: 0,
            forwarded_in_7d_msat: 400_000_000,
            forwarded_out_7d_msat: 200_000_000,
            fee_earned_msat: 12_000,
            peer_pubkey: "02abc".to_string(),
            peer_alias: Some("carol".to_string()),
            age_days: Some(120),
            peer_fee_rates: vec![50, 150],
            alternative_routes: 3,
        }
    }

    #[test]
    fn test_balance_ratio() {
        let feature = ChannelFeature::from_snapshot(&snapshot());
        assert!((feature.balance_ratio - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_zero_capacity_defaults_to_half() {
        let mut snap = snapshot();
        snap.local_balance_sat = 0;
        snap.remote_balance_sat = 0;
        let feature = ChannelFeature::from_snapshot(&snap);
        assert_eq!(feature.balance_ratio, 0.5);
    }

    #[test]
    fn test_activity_thresholds() {
        // 600M msat over 5M sat (= 5G msat) capacity is 12% -> high
        assert_eq!(
            ActivityLevel::classify(600_000_000, 5_000_000),
            ActivityLevel::High
        );
        // 100M msat is 2% -> medium
        assert_eq!(
            ActivityLevel::classify(100_000_000, 5_000_000),
            ActivityLevel::Medium
        );
        // 10M msat is 0.2% -> low
        assert_eq!(
            ActivityLevel::classify(10_000_000, 5_000_000),
            ActivityLevel::Low
        );
        assert_eq!(
            ActivityLevel::classify(0, 5_000_000),
            ActivityLevel::Inactive
        );
    }

    #[test]
    fn test_peer_fee_ratio() {
        let feature = ChannelFeature::from_snapshot(&snapshot());
        // 100 ppm against an average of 100 ppm
        assert!((feature.peer_fee_ratio().unwrap() - 1.0).abs() < 1e-9);

        let mut snap = snapshot();
        snap.peer_fee_rates.clear();
        let feature = ChannelFeature::from_snapshot(&snap);
        assert!(feature.peer_fee_ratio().is_none());
    }
}
