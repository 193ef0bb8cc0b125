//! The parameter-set sequence and its scheduler.
//!
//! An experiment walks a fixed sequence of parameter sets, each with a
//! configured duration. The scheduler is a pure function of elapsed time:
//! accumulate durations in order and report the first set whose boundary
//! has not been passed; beyond the last boundary the experiment is
//! complete and only measurement continues.

use serde::{Deserialize, Serialize};

use crate::config::ScheduleConfig;
use crate::policy::FeeStrategy;

/// One named phase of the rollout, in fixed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterSet {
    /// Measurement only; establishes the pre-change reference.
    Baseline,
    Conservative,
    Aggressive,
    Advanced,
    /// Measurement only; establishes the post-change reference.
    Stabilization,
}

impl ParameterSet {
    /// The fixed walk order.
    pub const SEQUENCE: [ParameterSet; 5] = [
        ParameterSet::Baseline,
        ParameterSet::Conservative,
        ParameterSet::Aggressive,
        ParameterSet::Advanced,
        ParameterSet::Stabilization,
    ];

    /// Position in the sequence, for monotonicity checks.
    pub fn rank(&self) -> usize {
        Self::SEQUENCE.iter().position(|s| s == self).unwrap_or(0)
    }

    /// Whether this set proposes fee changes at all.
    pub fn changes_fees(&self) -> bool {
        matches!(
            self,
            ParameterSet::Conservative | ParameterSet::Aggressive | ParameterSet::Advanced
        )
    }

    /// Which strategies this set allows the calculator to run.
    ///
    /// Conservative sticks to balance steering and explicit values, the
    /// aggressive set adds flow following, and advanced opens up the
    /// history-driven optimizer.
    pub fn permits(&self, strategy: FeeStrategy) -> bool {
        match self {
            ParameterSet::Baseline | ParameterSet::Stabilization => false,
            ParameterSet::Conservative => !matches!(
                strategy,
                FeeStrategy::FlowBased | FeeStrategy::RevenueMax
            ),
            ParameterSet::Aggressive => !matches!(strategy, FeeStrategy::RevenueMax),
            ParameterSet::Advanced => true,
        }
    }

    /// Legacy phase name, kept for presentation only.
    pub fn phase_alias(&self) -> &'static str {
        match self {
            ParameterSet::Baseline => "baseline",
            ParameterSet::Conservative => "initial",
            ParameterSet::Aggressive => "moderate",
            ParameterSet::Advanced => "aggressive",
            ParameterSet::Stabilization => "stabilization",
        }
    }
}

impl std::fmt::Display for ParameterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ParameterSet::Baseline => "baseline",
            ParameterSet::Conservative => "conservative",
            ParameterSet::Aggressive => "aggressive",
            ParameterSet::Advanced => "advanced",
            ParameterSet::Stabilization => "stabilization",
        };
        write!(f, "{s}")
    }
}

/// Durations and intensities for the full sequence.
#[derive(Debug, Clone)]
pub struct Schedule {
    durations_hours: [u32; 5],
    conservative_intensity: f64,
    aggressive_intensity: f64,
    advanced_intensity: f64,
}

impl Schedule {
    pub fn from_config(config: &ScheduleConfig) -> Self {
        Self {
            durations_hours: [
                config.baseline_hours,
                config.conservative_hours,
                config.aggressive_hours,
                config.advanced_hours,
                config.stabilization_hours,
            ],
            conservative_intensity: config.conservative_intensity,
            aggressive_intensity: config.aggressive_intensity,
            advanced_intensity: config.advanced_intensity,
        }
    }

    /// The active parameter set after `elapsed_hours`, or `None` once the
    /// experiment is complete.
    pub fn active(&self, elapsed_hours: f64) -> Option<ParameterSet> {
        if elapsed_hours < 0.0 {
            return Some(ParameterSet::Baseline);
        }
        let mut boundary = 0.0;
        for (set, &duration) in ParameterSet::SEQUENCE.iter().zip(&self.durations_hours) {
            boundary += duration as f64;
            if elapsed_hours < boundary {
                return Some(*set);
            }
        }
        None
    }

    pub fn total_hours(&self) -> u32 {
        self.durations_hours.iter().sum()
    }

    pub fn is_complete(&self, elapsed_hours: f64) -> bool {
        self.active(elapsed_hours).is_none()
    }

    /// Strategy intensity multiplier for a set. Measurement-only sets have
    /// zero intensity.
    pub fn intensity(&self, set: ParameterSet) -> f64 {
        match set {
            ParameterSet::Conservative => self.conservative_intensity,
            ParameterSet::Aggressive => self.aggressive_intensity,
            ParameterSet::Advanced => self.advanced_intensity,
            ParameterSet::Baseline | ParameterSet::Stabilization => 0.0,
        }
    }
}

impl Default for Schedule {
    fn default() -> Self {
        Self::from_config(&ScheduleConfig::default())
    }
}
