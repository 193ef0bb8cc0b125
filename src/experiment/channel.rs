//! Channels under management: segments, baselines, and change history.

use chrono::{DateTime, Utc};

use crate::node::{ChannelSnapshot, FeeUpdate};
use crate::store::ChannelRecord;

/// Capacity × activity classification, derived once at initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelSegment {
    /// >5M sats, high activity
    HighCapActive,
    /// >5M sats, low activity
    HighCapInactive,
    /// 1-5M sats, active
    MedCapActive,
    /// 1-5M sats, inactive
    MedCapInactive,
    /// <1M sats, active
    LowCapActive,
    /// <1M sats, inactive
    LowCapInactive,
}

impl ChannelSegment {
    /// Classify from capacity and monthly flow volume.
    pub fn classify(capacity_sat: u64, monthly_flow_msat: u64) -> Self {
        if capacity_sat > 5_000_000 {
            if monthly_flow_msat > 10_000_000 {
                ChannelSegment::HighCapActive
            } else {
                ChannelSegment::HighCapInactive
            }
        } else if capacity_sat > 1_000_000 {
            if monthly_flow_msat > 1_000_000 {
                ChannelSegment::MedCapActive
            } else {
                ChannelSegment::MedCapInactive
            }
        } else if monthly_flow_msat > 100_000 {
            ChannelSegment::LowCapActive
        } else {
            ChannelSegment::LowCapInactive
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ChannelSegment::HighCapActive
                | ChannelSegment::MedCapActive
                | ChannelSegment::LowCapActive
        )
    }
}

impl std::fmt::Display for ChannelSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChannelSegment::HighCapActive => "high_cap_active",
            ChannelSegment::HighCapInactive => "high_cap_inactive",
            ChannelSegment::MedCapActive => "med_cap_active",
            ChannelSegment::MedCapInactive => "med_cap_inactive",
            ChannelSegment::LowCapActive => "low_cap_active",
            ChannelSegment::LowCapInactive => "low_cap_inactive",
        };
        write!(f, "{s}")
    }
}

/// One entry in a channel's append-only change history.
#[derive(Debug, Clone)]
pub struct FeeChange {
    pub at: DateTime<Utc>,
    pub old_fees: FeeUpdate,
    pub new_fees: FeeUpdate,
    pub reason: String,
    pub success: bool,
}

/// A change waiting on the safety monitor's verdict.
///
/// Replaces the original's global "last changes" and "rollback candidates"
/// maps; each channel carries its own record so the control loop and the
/// safety monitor share no hidden state.
#[derive(Debug, Clone)]
pub struct PendingRollback {
    pub applied_at: DateTime<Utc>,
    /// Revenue decline fraction that triggers the rollback.
    pub threshold: f64,
    /// Rules that produced the change, for counter attribution.
    pub rule_names: Vec<String>,
    /// Whether the observed revenue delta was already attributed.
    pub impact_recorded: bool,
}

/// A channel under management.
pub struct ExperimentChannel {
    channel_id: String,
    segment: ChannelSegment,
    capacity_sat: u64,
    monthly_flow_msat: u64,
    peer_pubkey: String,
    /// First observed fees; the rollback target. Never changes.
    baseline: FeeUpdate,
    current: FeeUpdate,
    history: Vec<FeeChange>,
    pending_rollback: Option<PendingRollback>,
    /// Accumulated earned revenue at the last observation, for computing
    /// per-cycle deltas.
    last_earned_msat: Option<u64>,
}

impl ExperimentChannel {
    /// Create from the first snapshot; the fees observed here become the
    /// immutable baseline.
    pub fn new(snapshot: &ChannelSnapshot) -> Self {
        // The 7-day window scaled to a month approximates the monthly flow
        // used for segment classification.
        let monthly_flow_msat =
            (snapshot.forwarded_in_7d_msat + snapshot.forwarded_out_7d_msat) * 30 / 7;
        let fees = FeeUpdate::new(
            snapshot.outbound_fee_ppm,
            snapshot.outbound_base_msat,
            snapshot.inbound_fee_ppm,
            snapshot.inbound_base_msat,
        );
        Self {
            channel_id: snapshot.channel_id.clone(),
            segment: ChannelSegment::classify(snapshot.capacity_sat, monthly_flow_msat),
            capacity_sat: snapshot.capacity_sat,
            monthly_flow_msat,
            peer_pubkey: snapshot.peer_pubkey.clone(),
            baseline: fees,
            current: fees,
            history: Vec::new(),
            pending_rollback: None,
            last_earned_msat: None,
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn segment(&self) -> ChannelSegment {
        self.segment
    }

    pub fn baseline_fees(&self) -> FeeUpdate {
        self.baseline
    }

    pub fn current_fees(&self) -> FeeUpdate {
        self.current
    }

    pub fn history(&self) -> &[FeeChange] {
        &self.history
    }

    pub fn pending_rollback(&self) -> Option<&PendingRollback> {
        self.pending_rollback.as_ref()
    }

    /// Record a successfully applied forward change. Arms the safety
    /// monitor when the producing rule opted into auto-rollback.
    pub fn record_applied_change(
        &mut self,
        at: DateTime<Utc>,
        new_fees: FeeUpdate,
        reason: String,
        rule_names: Vec<String>,
        rollback_threshold: Option<f64>,
    ) {
        self.history.push(FeeChange {
            at,
            old_fees: self.current,
            new_fees,
            reason,
            success: true,
        });
        self.current = new_fees;
        self.pending_rollback = rollback_threshold.map(|threshold| PendingRollback {
            applied_at: at,
            threshold,
            rule_names,
            impact_recorded: false,
        });
    }

    /// Record a refused change; current fees stay as they were.
    pub fn record_failed_change(&mut self, at: DateTime<Utc>, attempted: FeeUpdate, reason: String) {
        self.history.push(FeeChange {
            at,
            old_fees: self.current,
            new_fees: attempted,
            reason,
            success: false,
        });
    }

    /// Revert to the baseline. Clears rollback tracking: the same change
    /// is never rolled back twice, and the rollback itself is not watched.
    pub fn record_rollback(&mut self, at: DateTime<Utc>, reason: String) {
        self.history.push(FeeChange {
            at,
            old_fees: self.current,
            new_fees: self.baseline,
            reason,
            success: true,
        });
        self.current = self.baseline;
        self.pending_rollback = None;
    }

    /// Mark the pending change's revenue impact as attributed.
    pub fn mark_impact_recorded(&mut self) {
        if let Some(pending) = self.pending_rollback.as_mut() {
            pending.impact_recorded = true;
        }
    }

    /// Successful changes recorded on the given UTC day.
    pub fn changes_on_day(&self, now: DateTime<Utc>) -> u32 {
        let day = now.date_naive();
        self.history
            .iter()
            .filter(|c| c.success && c.at.date_naive() == day)
            .count() as u32
    }

    /// Timestamp of the last successful change, if any.
    pub fn last_change_at(&self) -> Option<DateTime<Utc>> {
        self.history.iter().rev().find(|c| c.success).map(|c| c.at)
    }

    /// Per-cycle revenue delta from the node's accumulated counter.
    pub fn earned_delta(&mut self, total_earned_msat: u64) -> u64 {
        let delta = match self.last_earned_msat {
            Some(prev) => total_earned_msat.saturating_sub(prev),
            None => 0,
        };
        self.last_earned_msat = Some(total_earned_msat);
        delta
    }

    /// Persistent row for the store.
    pub fn to_record(&self) -> ChannelRecord {
        ChannelRecord {
            channel_id: self.channel_id.clone(),
            segment: self.segment.to_string(),
            capacity_sat: self.capacity_sat,
            monthly_flow_msat: self.monthly_flow_msat,
            peer_pubkey: self.peer_pubkey.clone(),
            baseline_outbound_ppm: self.baseline.outbound_fee_ppm,
            baseline_inbound_ppm: self.baseline.inbound_fee_ppm,
            current_outbound_ppm: self.current.outbound_fee_ppm,
            current_inbound_ppm: self.current.inbound_fee_ppm,
        }
    }
}
