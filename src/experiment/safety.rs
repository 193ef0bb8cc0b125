//! Safety monitor: detects and reverts underperforming fee changes.
//!
//! A change armed with auto-rollback is observed for at least the minimum
//! window, then judged by splitting its data points into an earlier and a
//! recent half. A revenue decline past the rule's threshold or a flow
//! decline past the global threshold condemns the change. Zero-denominator
//! comparisons are skipped rather than guessed at.

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::config::SafetyConfig;
use crate::store::ChannelDataPoint;

use super::channel::ExperimentChannel;

/// Verdict on one pending change.
#[derive(Debug, Clone)]
pub struct RollbackDecision {
    pub channel_id: String,
    /// Human-readable cause, e.g. `revenue decline 41.3%`.
    pub cause: String,
    pub revenue_decline: Option<f64>,
    pub flow_decline: Option<f64>,
    /// Observed revenue change over the window (recent minus earlier),
    /// msat, for rule counter attribution.
    pub revenue_delta_msat: i64,
}

/// Observation outcome for a pending change that is old enough to judge.
#[derive(Debug, Clone)]
pub enum SafetyVerdict {
    /// Change looks fine (or cannot be judged yet); keep watching.
    Keep { revenue_delta_msat: i64 },
    /// Change must be reverted.
    Rollback(RollbackDecision),
}

pub struct SafetyMonitor {
    config: SafetyConfig,
}

impl SafetyMonitor {
    pub fn new(config: SafetyConfig) -> Self {
        Self { config }
    }

    /// Minimum time a change must be observed before it is judged.
    pub fn min_observation(&self) -> Duration {
        Duration::hours(self.config.min_observation_hours as i64)
    }

    /// Judge one channel's pending change against its data points since
    /// the change. Returns `None` while the observation window is still
    /// open or there is not enough data to split.
    pub fn evaluate(
        &self,
        channel: &ExperimentChannel,
        now: DateTime<Utc>,
        points: &[ChannelDataPoint],
    ) -> Option<SafetyVerdict> {
        let pending = channel.pending_rollback()?;
        if now - pending.applied_at < self.min_observation() {
            return None;
        }
        if points.len() < 2 {
            debug!(
                channel = %channel.channel_id(),
                points = points.len(),
                "not enough data points to judge change"
            );
            return None;
        }

        // Earlier half against the most recent half of the elapsed window.
        let mid = points.len() / 2;
        let (earlier, recent) = points.split_at(mid);

        let earlier_revenue: u64 = earlier.iter().map(|p| p.fee_earned_msat).sum();
        let recent_revenue: u64 = recent.iter().map(|p| p.fee_earned_msat).sum();
        let revenue_delta_msat = recent_revenue as i64 - earlier_revenue as i64;

        let revenue_decline = if earlier_revenue > 0 {
            Some(1.0 - recent_revenue as f64 / earlier_revenue as f64)
        } else {
            None
        };

        let earlier_flow: u64 = earlier.iter().map(|p| p.flow_msat()).sum();
        let recent_flow: u64 = recent.iter().map(|p| p.flow_msat()).sum();
        let flow_decline = if earlier_flow > 0 {
            Some(1.0 - recent_flow as f64 / earlier_flow as f64)
        } else {
            None
        };

        if let Some(decline) = revenue_decline {
            if decline > pending.threshold {
                return Some(SafetyVerdict::Rollback(RollbackDecision {
                    channel_id: channel.channel_id().to_string(),
                    cause: format!("revenue decline {:.1}%", decline * 100.0),
                    revenue_decline,
                    flow_decline,
                    revenue_delta_msat,
                }));
            }
        }
        if let Some(decline) = flow_decline {
            if decline > self.config.flow_decline_threshold {
                return Some(SafetyVerdict::Rollback(RollbackDecision {
                    channel_id: channel.channel_id().to_string(),
                    cause: format!("flow decline {:.1}%", decline * 100.0),
                    revenue_decline,
                    flow_decline,
                    revenue_delta_msat,
                }));
            }
        }

        Some(SafetyVerdict::Keep { revenue_delta_msat })
    }
}
