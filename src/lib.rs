#![deny(unreachable_pub)]

//! Policy-driven fee management for Lightning routing nodes.
//!
//! This crate decides, on a recurring schedule, what fee parameters each
//! payment channel should carry (outbound rate/base and signed inbound
//! rate/base), applies them through the node's management API, and reverts
//! changes that measurably hurt revenue or throughput:
//! - **Policy engine**: ordered rule matching plus pluggable fee strategies,
//!   including inbound-fee economics (`policy`)
//! - **Experiment loop**: phased rollout schedule, cadence gating, and the
//!   safety monitor that rolls underperforming changes back (`experiment`)
//! - **Node source**: abstract channel snapshot / fee update capability with
//!   an lnd-manage REST implementation (`node`)
//! - **Time-series store**: append-only persistence of data points and fee
//!   changes (`store`)

mod config;
mod errors;

pub mod experiment;
pub mod node;
pub mod policy;
pub mod store;

// Re-exports
pub use config::{
    AppConfig, CadenceConfig, EngineConfig, LogFormat, LoggingConfig, LoopConfig, NodeConfig,
    SafetyConfig, ScheduleConfig, StorageConfig,
};
pub use errors::{Error, Result};
pub use experiment::{
    ChannelSegment, CycleReport, ExperimentChannel, ExperimentController, FeeChange,
    ParameterSet, PendingRollback, RollbackDecision, SafetyMonitor, Schedule,
};
pub use node::{ChannelSnapshot, FeeUpdate, LndManageClient, NodeClient};
pub use policy::{
    ActivityLevel, ChannelFeature, FeeDecision, FeePolicy, FeeStrategy, FlowTrend, PolicyEngine,
    PolicyKind, PolicyMatcher, PolicyRule, RuleCounters, RuleSet, StrategyContext,
};
pub use store::{
    ChannelDataPoint, ChannelRecord, ExperimentRecord, FeeChangeRecord, JsonlStore, MemoryStore,
    TimeSeriesStore,
};
