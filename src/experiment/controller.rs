//! The control loop.
//!
//! One cycle: resolve the active parameter set, snapshot every managed
//! channel (bounded concurrency), gate by cadence, run the policy engine,
//! apply changed fees, persist the cycle's data points, then let the
//! safety monitor judge pending changes. A failing channel never aborts
//! the cycle; a failing store write never undoes an applied fee.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Timelike, Utc};
use futures_util::stream::{self, StreamExt};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, CadenceConfig};
use crate::errors::{Error, Result};
use crate::node::{ChannelSnapshot, FeeUpdate, NodeClient};
use crate::policy::{
    ChannelFeature, FeeDecision, FlowTrend, PerformanceSample, PolicyEngine, StrategyContext,
};
use crate::store::{
    ChannelDataPoint, ExperimentRecord, FeeChangeRecord, TimeSeriesStore, ROLLBACK_PREFIX,
};

use super::channel::ExperimentChannel;
use super::safety::{RollbackDecision, SafetyMonitor, SafetyVerdict};
use super::schedule::{ParameterSet, Schedule};

/// Outcome of one cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub at: DateTime<Utc>,
    /// Active set, or `None` once the experiment is complete.
    pub parameter_set: Option<ParameterSet>,
    pub channels_observed: usize,
    pub snapshots_failed: usize,
    pub changes_applied: u32,
    pub changes_rejected: u32,
    pub rollbacks: u32,
    /// Whether another cycle should run.
    pub continue_experiment: bool,
}

/// Orchestrates the policy engine, schedule, and safety monitor against a
/// node data source and a time-series store.
pub struct ExperimentController<C: NodeClient + 'static, S: TimeSeriesStore> {
    config: AppConfig,
    client: Arc<C>,
    store: S,
    engine: PolicyEngine,
    schedule: Schedule,
    monitor: SafetyMonitor,
    channels: HashMap<String, ExperimentChannel>,
    started_at: Option<DateTime<Utc>>,
}

impl<C: NodeClient + 'static, S: TimeSeriesStore> ExperimentController<C, S> {
    pub fn new(config: AppConfig, client: Arc<C>, store: S, engine: PolicyEngine) -> Self {
        let schedule = Schedule::from_config(&config.schedule);
        let monitor = SafetyMonitor::new(config.safety.clone());
        Self {
            config,
            client,
            store,
            engine,
            schedule,
            monitor,
            channels: HashMap::new(),
            started_at: None,
        }
    }

    pub fn channels(&self) -> impl Iterator<Item = &ExperimentChannel> {
        self.channels.values()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn engine(&self) -> &PolicyEngine {
        &self.engine
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Enumerate channels, record their baselines, and persist the
    /// experiment layout. Must run before the first cycle.
    pub async fn initialize(&mut self, now: DateTime<Utc>) -> Result<usize> {
        let ids = self.client.list_channel_ids().await?;
        info!(channels = ids.len(), "initializing experiment");

        let (snapshots, failed) = self.fetch_snapshots(&ids).await;
        if snapshots.is_empty() {
            return Err(Error::config("no channels available to manage"));
        }
        if failed > 0 {
            warn!(failed, "some channels were unreachable at initialization");
        }

        for snapshot in &snapshots {
            let channel = ExperimentChannel::new(snapshot);
            debug!(
                channel = %channel.channel_id(),
                segment = %channel.segment(),
                baseline_outbound = channel.baseline_fees().outbound_fee_ppm,
                "channel enrolled"
            );
            self.channels
                .insert(channel.channel_id().to_string(), channel);
        }
        self.started_at = Some(now);

        let record = ExperimentRecord {
            started_at: now,
            channel_count: self.channels.len(),
        };
        if let Err(e) = self.store.save_experiment(&record) {
            warn!(error = %e, "could not persist experiment record");
        }
        for channel in self.channels.values() {
            if let Err(e) = self.store.save_channel(&channel.to_record()) {
                warn!(error = %e, channel = %channel.channel_id(), "could not persist channel row");
            }
        }

        info!(
            channels = self.channels.len(),
            total_hours = self.schedule.total_hours(),
            "experiment initialized"
        );
        Ok(self.channels.len())
    }

    /// Run cycles on the configured interval until the experiment
    /// completes or shutdown is signalled. Shutdown interrupts the
    /// inter-cycle sleep but never a cycle in progress.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut interval = tokio::time::interval(self.config.run_loop.cycle_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.run_cycle(Utc::now()).await?;
                    info!(
                        parameter_set = %report.parameter_set.map(|s| s.to_string()).unwrap_or_else(|| "complete".to_string()),
                        observed = report.channels_observed,
                        applied = report.changes_applied,
                        rejected = report.changes_rejected,
                        rollbacks = report.rollbacks,
                        "cycle finished"
                    );
                    if !report.continue_experiment {
                        info!("experiment complete, stopping loop");
                        return Ok(());
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shutdown requested, stopping loop");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// One full cycle at the given wall-clock time.
    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> Result<CycleReport> {
        let started = self
            .started_at
            .ok_or_else(|| Error::config("experiment not initialized"))?;
        let elapsed_hours = (now - started).num_seconds() as f64 / 3600.0;
        let parameter_set = self.schedule.active(elapsed_hours);
        let set_label = parameter_set
            .map(|s| s.to_string())
            .unwrap_or_else(|| "complete".to_string());

        debug!(
            hour = %format!("{elapsed_hours:.1}"),
            parameter_set = %set_label,
            phase = parameter_set.map(|s| s.phase_alias()).unwrap_or("complete"),
            "starting cycle"
        );

        let ids: Vec<String> = self.channels.keys().cloned().collect();
        let (snapshots, snapshots_failed) = self.fetch_snapshots(&ids).await;
        let features: Vec<ChannelFeature> =
            snapshots.iter().map(ChannelFeature::from_snapshot).collect();

        let mut report = CycleReport {
            at: now,
            parameter_set,
            channels_observed: features.len(),
            snapshots_failed,
            changes_applied: 0,
            changes_rejected: 0,
            rollbacks: 0,
            continue_experiment: parameter_set.is_some(),
        };

        if let Some(set) = parameter_set.filter(|s| s.changes_fees()) {
            self.apply_changes(&features, set, &set_label, now, &mut report)
                .await;
        }

        self.persist_data_points(&features, &set_label, elapsed_hours, now);

        self.run_safety_monitor(&set_label, now, &mut report).await;

        Ok(report)
    }

    /// Steps (3) and (4): cadence gate, match, calculate, apply.
    async fn apply_changes(
        &mut self,
        features: &[ChannelFeature],
        set: ParameterSet,
        set_label: &str,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) {
        let intensity = self.schedule.intensity(set);

        for feature in features {
            let Some(channel) = self.channels.get(&feature.channel_id) else {
                continue;
            };
            if !cadence_allows(&self.config.cadence, channel, now) {
                debug!(channel = %feature.channel_id, "cadence gate: skipped this cycle");
                continue;
            }
            let segment_active = channel.segment().is_active();
            let current_outbound = channel.current_fees().outbound_fee_ppm;

            // Resolve everything that needs the immutable engine borrow
            // before any mutation below.
            let (decision, rule_names, rollback_threshold, strategy_label) = {
                let matched = self.engine.match_channel(feature);
                // The parameter set decides which strategies may run.
                let permitted: Vec<_> = matched
                    .into_iter()
                    .filter(|r| set.permits(r.policy.strategy))
                    .collect();
                if permitted.is_empty() {
                    continue;
                }
                let ctx = StrategyContext {
                    intensity,
                    segment_active: Some(segment_active),
                    flow_trend: flow_trend(
                        &self.store,
                        self.config.engine.flow_lookback_hours,
                        &feature.channel_id,
                        now,
                    ),
                };
                let decision = self.engine.calculate(feature, &permitted, &ctx);
                let names: Vec<String> = permitted.iter().map(|r| r.name.clone()).collect();
                let last = permitted.last().expect("permitted is non-empty");
                let threshold = last
                    .policy
                    .auto_rollback
                    .then_some(last.policy.rollback_threshold);
                let strategy_label = last.policy.strategy.to_string();
                (decision, names, threshold, strategy_label)
            };

            let decision = clamp_step(&self.config.cadence, current_outbound, decision);
            if !decision.differs_from(feature) {
                continue;
            }

            let update = FeeUpdate::new(
                decision.outbound_fee_ppm,
                decision.outbound_base_msat,
                decision.inbound_fee_ppm,
                decision.inbound_base_msat,
            );
            let reason = format!("[{set_label}] {strategy_label} ({})", rule_names.join(","));
            let old = channel.current_fees();

            match self.client.apply_fees(&feature.channel_id, &update).await {
                Ok(()) => {
                    info!(
                        channel = %feature.channel_id,
                        outbound = %format!("{} -> {}", old.outbound_fee_ppm, update.outbound_fee_ppm),
                        inbound = %format!("{} -> {}", old.inbound_fee_ppm, update.inbound_fee_ppm),
                        reason = %reason,
                        "fee change applied"
                    );
                    self.engine.record_applied(&rule_names, now);
                    let channel = self
                        .channels
                        .get_mut(&feature.channel_id)
                        .expect("channel present");
                    channel.record_applied_change(
                        now,
                        update,
                        reason.clone(),
                        rule_names,
                        rollback_threshold,
                    );
                    self.persist_change(change_record(
                        now, &feature.channel_id, set_label, old, update, &reason, true,
                    ));
                    report.changes_applied += 1;
                }
                Err(e) => {
                    warn!(channel = %feature.channel_id, error = %e, "fee change rejected");
                    let channel = self
                        .channels
                        .get_mut(&feature.channel_id)
                        .expect("channel present");
                    channel.record_failed_change(now, update, reason.clone());
                    self.persist_change(change_record(
                        now, &feature.channel_id, set_label, old, update, &reason, false,
                    ));
                    report.changes_rejected += 1;
                }
            }
        }
    }

    /// Step (5): a data point for every observed channel, changed or not,
    /// plus the performance history feeding revenue_max.
    fn persist_data_points(
        &mut self,
        features: &[ChannelFeature],
        set_label: &str,
        elapsed_hours: f64,
        now: DateTime<Utc>,
    ) {
        for feature in features {
            let Some(channel) = self.channels.get_mut(&feature.channel_id) else {
                continue;
            };
            let earned_delta = channel.earned_delta(feature.fee_earned_msat);
            let point = ChannelDataPoint {
                at: now,
                experiment_hour: elapsed_hours.max(0.0) as u32,
                channel_id: feature.channel_id.clone(),
                segment: channel.segment().to_string(),
                parameter_set: set_label.to_string(),
                outbound_fee_ppm: feature.outbound_fee_ppm,
                outbound_base_msat: feature.outbound_base_msat,
                inbound_fee_ppm: feature.inbound_fee_ppm,
                local_balance_sat: feature.local_balance_sat,
                remote_balance_sat: feature.remote_balance_sat,
                balance_ratio: feature.balance_ratio,
                forwarded_in_msat: feature.forwarded_in_7d_msat,
                forwarded_out_msat: feature.forwarded_out_7d_msat,
                fee_earned_msat: earned_delta,
            };
            if let Err(e) = self.store.append_data_point(&point) {
                warn!(channel = %feature.channel_id, error = %e, "could not persist data point");
            }
            self.engine.record_performance(
                &feature.channel_id,
                PerformanceSample {
                    at: now,
                    outbound_fee_ppm: feature.outbound_fee_ppm,
                    inbound_fee_ppm: feature.inbound_fee_ppm,
                    fee_earned_msat: earned_delta,
                    flow_msat: feature.flow_7d_msat(),
                },
            );
        }
    }

    /// Step (6): judge every channel with a pending change old enough to
    /// evaluate; issue rollbacks. Rollbacks bypass the cadence gate.
    async fn run_safety_monitor(
        &mut self,
        set_label: &str,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) {
        let mut rollbacks: Vec<RollbackDecision> = Vec::new();
        let mut impacts: Vec<(String, i64, Vec<String>)> = Vec::new();

        for (id, channel) in &self.channels {
            let Some(pending) = channel.pending_rollback() else {
                continue;
            };
            if now - pending.applied_at < self.monitor.min_observation() {
                continue;
            }
            let points = match self.store.query_recent(id, pending.applied_at) {
                Ok(points) => points,
                Err(e) => {
                    warn!(channel = %id, error = %e, "could not query data points for safety check");
                    continue;
                }
            };
            match self.monitor.evaluate(channel, now, &points) {
                Some(SafetyVerdict::Rollback(decision)) => rollbacks.push(decision),
                Some(SafetyVerdict::Keep { revenue_delta_msat }) if !pending.impact_recorded => {
                    impacts.push((id.clone(), revenue_delta_msat, pending.rule_names.clone()));
                }
                _ => {}
            }
        }

        for (id, delta, names) in impacts {
            self.engine.record_revenue_impact(&names, delta);
            if let Some(channel) = self.channels.get_mut(&id) {
                channel.mark_impact_recorded();
            }
        }

        for decision in rollbacks {
            let Some(channel) = self.channels.get(&decision.channel_id) else {
                continue;
            };
            let baseline = channel.baseline_fees();
            let old = channel.current_fees();
            let (rule_names, impact_recorded) = channel
                .pending_rollback()
                .map(|p| (p.rule_names.clone(), p.impact_recorded))
                .unwrap_or((Vec::new(), true));
            let reason = format!("{ROLLBACK_PREFIX}: {}", decision.cause);

            match self.client.apply_fees(&decision.channel_id, &baseline).await {
                Ok(()) => {
                    warn!(
                        channel = %decision.channel_id,
                        cause = %decision.cause,
                        outbound = %format!("{} -> {}", old.outbound_fee_ppm, baseline.outbound_fee_ppm),
                        "change rolled back to baseline"
                    );
                    if !impact_recorded {
                        self.engine
                            .record_revenue_impact(&rule_names, decision.revenue_delta_msat);
                    }
                    let channel = self
                        .channels
                        .get_mut(&decision.channel_id)
                        .expect("channel present");
                    channel.record_rollback(now, reason.clone());
                    self.persist_change(change_record(
                        now,
                        &decision.channel_id,
                        set_label,
                        old,
                        baseline,
                        &reason,
                        true,
                    ));
                    report.rollbacks += 1;
                }
                Err(e) => {
                    // Pending stays armed; the next cycle retries.
                    warn!(
                        channel = %decision.channel_id,
                        error = %e,
                        "rollback rejected, retrying next cycle"
                    );
                    let channel = self
                        .channels
                        .get_mut(&decision.channel_id)
                        .expect("channel present");
                    channel.record_failed_change(now, baseline, reason.clone());
                    self.persist_change(change_record(
                        now,
                        &decision.channel_id,
                        set_label,
                        old,
                        baseline,
                        &reason,
                        false,
                    ));
                }
            }
        }
    }

    fn persist_change(&self, record: FeeChangeRecord) {
        if let Err(e) = self.store.append_change(&record) {
            error!(channel = %record.channel_id, error = %e, "could not persist fee change record");
        }
    }

    /// Fetch snapshots with bounded concurrency. Failures are logged and
    /// counted; the cycle proceeds with whatever arrived.
    async fn fetch_snapshots(&self, ids: &[String]) -> (Vec<ChannelSnapshot>, usize) {
        let concurrency = self.config.run_loop.snapshot_concurrency.max(1);
        let results: Vec<Result<ChannelSnapshot>> = stream::iter(ids.iter().cloned().map(|id| {
            let client = Arc::clone(&self.client);
            async move { client.channel_snapshot(&id).await }
        }))
        .buffer_unordered(concurrency)
        .collect()
        .await;

        let mut snapshots = Vec::with_capacity(results.len());
        let mut failed = 0;
        for result in results {
            match result {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => {
                    warn!(error = %e, "snapshot unavailable, channel skipped this cycle");
                    failed += 1;
                }
            }
        }
        (snapshots, failed)
    }
}

/// All three cadence conditions must hold for a forward change.
fn cadence_allows(
    cadence: &CadenceConfig,
    channel: &ExperimentChannel,
    now: DateTime<Utc>,
) -> bool {
    if channel.changes_on_day(now) >= cadence.max_daily_changes {
        return false;
    }
    if !cadence.update_hours.contains(&now.hour()) {
        return false;
    }
    if let Some(last) = channel.last_change_at() {
        if now - last < Duration::hours(cadence.min_change_gap_hours as i64) {
            return false;
        }
    }
    true
}

/// Per-change step limits on the outbound rate.
fn clamp_step(cadence: &CadenceConfig, current_outbound: u32, decision: FeeDecision) -> FeeDecision {
    if current_outbound == 0 {
        return decision;
    }
    let ceiling = (current_outbound as f64 * (1.0 + cadence.max_increase_pct)).round() as u32;
    let floor = ((current_outbound as f64 * (1.0 - cadence.max_decrease_pct)).floor() as u32).max(1);
    FeeDecision {
        outbound_fee_ppm: decision.outbound_fee_ppm.clamp(floor, ceiling),
        ..decision
    }
}

/// Recent third of the lookback window against the earliest third.
fn flow_trend<S: TimeSeriesStore>(
    store: &S,
    lookback_hours: u32,
    channel_id: &str,
    now: DateTime<Utc>,
) -> FlowTrend {
    let since = now - Duration::hours(lookback_hours as i64);
    let points = match store.query_recent(channel_id, since) {
        Ok(points) => points,
        Err(e) => {
            warn!(channel = %channel_id, error = %e, "flow trend query failed");
            return FlowTrend::Unknown;
        }
    };
    if points.len() < 3 {
        return FlowTrend::Unknown;
    }
    let third = points.len() / 3;
    let earliest: u64 = points[..third].iter().map(|p| p.flow_msat()).sum();
    let recent: u64 = points[points.len() - third..]
        .iter()
        .map(|p| p.flow_msat())
        .sum();
    if recent > earliest {
        FlowTrend::Increasing
    } else {
        FlowTrend::Decreasing
    }
}

fn change_record(
    at: DateTime<Utc>,
    channel_id: &str,
    set_label: &str,
    old: FeeUpdate,
    new: FeeUpdate,
    reason: &str,
    success: bool,
) -> FeeChangeRecord {
    FeeChangeRecord {
        at,
        channel_id: channel_id.to_string(),
        parameter_set: set_label.to_string(),
        old_outbound_ppm: old.outbound_fee_ppm,
        new_outbound_ppm: new.outbound_fee_ppm,
        old_inbound_ppm: old.inbound_fee_ppm,
        new_inbound_ppm: new.inbound_fee_ppm,
        reason: reason.to_string(),
        success,
    }
}
