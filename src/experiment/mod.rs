//! The safety-monitored control loop.
//!
//! A run walks the parameter-set schedule; each cycle snapshots every
//! managed channel, lets the policy engine propose fees, applies what the
//! cadence rules allow, and hands recently changed channels to the safety
//! monitor for a rollback verdict.

mod channel;
mod controller;
mod safety;
mod schedule;


pub use channel::{ChannelSegment, ExperimentChannel, FeeChange, PendingRollback};
pub use controller::{CycleReport, ExperimentController};
pub use safety::{RollbackDecision, SafetyMonitor, SafetyVerdict};
pub use schedule::{ParameterSet, Schedule};
