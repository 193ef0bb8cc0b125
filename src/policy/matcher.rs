//! Rule matching predicates.

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::feature::{ActivityLevel, ChannelFeature};

/// Matching criteria for a policy rule.
///
/// Every bound is optional; an unset bound is a wildcard. A channel matches
/// iff every populated bound holds. Numeric bounds are inclusive, list
/// bounds are set membership.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PolicyMatcher {
    /// Explicit channel ids.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity_min_sat: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity_max_sat: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance_ratio_min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance_ratio_max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age_min_days: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age_max_days: Option<u32>,
    /// Activity levels the channel must currently be in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<Vec<ActivityLevel>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_7d_min_msat: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_7d_max_msat: Option<u64>,
    /// Peer public keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternative_routes_min: Option<u32>,
    /// Own fee divided by average peer fee.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_fee_ratio_min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_fee_ratio_max: Option<f64>,
}

impl PolicyMatcher {
    /// Evaluate this matcher against a feature record.
    pub fn matches(&self, feature: &ChannelFeature) -> bool {
        if let Some(ref ids) = self.channel_ids {
            if !ids.iter().any(|id| id == &feature.channel_id) {
                trace!(channel = %feature.channel_id, "channel id not in matcher set");
                return false;
            }
        }
        if let Some(min) = self.capacity_min_sat {
            if feature.capacity_sat < min {
                return false;
            }
        }
        if let Some(max) = self.capacity_max_sat {
            if feature.capacity_sat > max {
                return false;
            }
        }
        if let Some(min) = self.balance_ratio_min {
            if feature.balance_ratio < min {
                return false;
            }
        }
        if let Some(max) = self.balance_ratio_max {
            if feature.balance_ratio > max {
                return false;
            }
        }
        if let Some(min) = self.age_min_days {
            match feature.age_days {
                Some(age) if age >= min => {}
                _ => return false,
            }
        }
        if let Some(max) = self.age_max_days {
            match feature.age_days {
                Some(age) if age <= max => {}
                _ => return false,
            }
        }
        if let Some(ref levels) = self.activity {
            if !levels.contains(&feature.activity) {
                return false;
            }
        }
        if let Some(min) = self.flow_7d_min_msat {
            if feature.flow_7d_msat() < min {
                return false;
            }
        }
        if let Some(max) = self.flow_7d_max_msat {
            if feature.flow_7d_msat() > max {
                return false;
            }
        }
        if let Some(ref peers) = self.peer_ids {
            if !peers.iter().any(|p| p == &feature.peer_pubkey) {
                return false;
            }
        }
        if let Some(min) = self.alternative_routes_min {
            if feature.alternative_routes < min {
                return false;
            }
        }
        if self.peer_fee_ratio_min.is_some() || self.peer_fee_ratio_max.is_some() {
            let ratio = match feature.peer_fee_ratio() {
                Some(r) => r,
                // Ratio bounds cannot hold without peer fee data.
                None => return false,
            };
            if let Some(min) = self.peer_fee_ratio_min {
                if ratio < min {
                    return false;
                }
            }
            if let Some(max) = self.peer_fee_ratio_max {
                if ratio > max {
                    return false;
                }
            }
        }
        true
    }
}
