//! Policy engine: rule matching and fee strategy calculation.
//!
//! Matching walks the priority-sorted rule list and is pure with respect to
//! engine state. Calculation folds the matched rules in order; a later rule
//! overrides a field only when its strategy actually sets that field, which
//! lets a non-final default rule run first and a specific final rule win.
//! Per-rule counters and the per-channel performance history are the only
//! mutable state and are touched exclusively by the control loop.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, trace};

use crate::config::EngineConfig;

use super::feature::ChannelFeature;
use super::inbound;
use super::rule::{FeeStrategy, PolicyKind, PolicyRule, RuleCounters, RuleSet};

/// Direction of a channel's recent flow compared to its earlier flow.
///
/// Derived by the control loop from the most recent third of the lookback
/// window against the earliest third.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowTrend {
    Increasing,
    Decreasing,
    /// Not enough data points to compare.
    #[default]
    Unknown,
}

/// Inputs to strategy evaluation that are not part of the feature record.
#[derive(Debug, Clone, Copy)]
pub struct StrategyContext {
    /// Intensity multiplier of the active parameter set.
    pub intensity: f64,
    /// Whether the channel's segment is an active one, when known.
    pub segment_active: Option<bool>,
    pub flow_trend: FlowTrend,
}

impl Default for StrategyContext {
    fn default() -> Self {
        Self {
            intensity: 1.0,
            segment_active: None,
            flow_trend: FlowTrend::Unknown,
        }
    }
}

/// The four fee values produced by a calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeDecision {
    pub outbound_fee_ppm: u32,
    pub outbound_base_msat: u64,
    pub inbound_fee_ppm: i32,
    pub inbound_base_msat: i64,
}

impl FeeDecision {
    /// Whether applying this decision would change the channel's fees.
    pub fn differs_from(&self, feature: &ChannelFeature) -> bool {
        self.outbound_fee_ppm != feature.outbound_fee_ppm
            || self.outbound_base_msat != feature.outbound_base_msat
            || self.inbound_fee_ppm != feature.inbound_fee_ppm
            || self.inbound_base_msat != feature.inbound_base_msat
    }
}

/// One observed fee→outcome pair, feeding the revenue_max strategy.
#[derive(Debug, Clone)]
pub struct PerformanceSample {
    pub at: DateTime<Utc>,
    pub outbound_fee_ppm: u32,
    pub inbound_fee_ppm: i32,
    pub fee_earned_msat: u64,
    pub flow_msat: u64,
}

/// Partially-folded fee values during strategy evaluation.
///
/// Rates are kept signed and unclamped until the final clamp pass.
#[derive(Debug, Default, Clone, Copy)]
struct Partial {
    outbound_ppm: Option<i64>,
    outbound_base: Option<u64>,
    inbound_ppm: Option<i64>,
    inbound_base: Option<i64>,
}

/// The fee policy engine.
pub struct PolicyEngine {
    rules: RuleSet,
    config: EngineConfig,
    counters: HashMap<String, RuleCounters>,
    performance: HashMap<String, Vec<PerformanceSample>>,
}

impl PolicyEngine {
    pub fn new(rules: RuleSet, config: EngineConfig) -> Self {
        Self {
            rules,
            config,
            counters: HashMap::new(),
            performance: HashMap::new(),
        }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Find the rules matching a channel, in priority order.
    ///
    /// A matched `final` rule terminates the walk; rules after it are not
    /// evaluated at all. No side effects.
    pub fn match_channel(&self, feature: &ChannelFeature) -> Vec<&PolicyRule> {
        let mut matched = Vec::new();
        for rule in self.rules.iter() {
            if !rule.enabled {
                trace!(rule = %rule.name, "skipping disabled rule");
                continue;
            }
            if rule.matcher.matches(feature) {
                trace!(
                    channel = %feature.channel_id,
                    rule = %rule.name,
                    priority = rule.priority,
                    "rule matched"
                );
                matched.push(rule);
                if rule.policy.kind == PolicyKind::Final {
                    break;
                }
            }
        }
        debug!(
            channel = %feature.channel_id,
            matched = ?matched.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
            "policy match complete"
        );
        matched
    }

    /// Compute the four fee values for a channel from its matched rules.
    ///
    /// Fields no strategy sets fall back to the channel's current values,
    /// so an empty match list means "no change". The last matched rule's
    /// min/max clamps apply first, then the global safety clamp: outbound
    /// in `[1, max_fee_ppm]` and an inbound discount never deeper than 80%
    /// of the outbound rate.
    pub fn calculate(
        &self,
        feature: &ChannelFeature,
        matched: &[&PolicyRule],
        ctx: &StrategyContext,
    ) -> FeeDecision {
        let mut partial = Partial::default();
        for rule in matched {
            self.apply_strategy(rule, feature, ctx, &mut partial);
        }

        let mut outbound = partial
            .outbound_ppm
            .unwrap_or(feature.outbound_fee_ppm as i64);
        let mut inbound = partial.inbound_ppm.unwrap_or(feature.inbound_fee_ppm as i64);

        // The last matched rule's clamps win.
        if let Some(rule) = matched.last() {
            let p = &rule.policy;
            if let Some(min) = p.min_fee_ppm {
                outbound = outbound.max(min as i64);
            }
            if let Some(max) = p.max_fee_ppm {
                outbound = outbound.min(max as i64);
            }
            if let Some(min) = p.min_inbound_ppm {
                inbound = inbound.max(min as i64);
            }
            if let Some(max) = p.max_inbound_ppm {
                inbound = inbound.min(max as i64);
            }
        }

        // Global safety clamp: never free, never above the ceiling.
        let outbound = outbound.clamp(1, self.config.max_fee_ppm as i64) as u32;
        // A discount deeper than 80% of the outbound rate could make the
        // total route cost structurally negative.
        let max_discount = -((outbound as f64 * 0.8) as i64);
        let inbound = if inbound < 0 {
            inbound.max(max_discount)
        } else {
            inbound
        } as i32;

        FeeDecision {
            outbound_fee_ppm: outbound,
            outbound_base_msat: partial.outbound_base.unwrap_or(feature.outbound_base_msat),
            inbound_fee_ppm: inbound,
            inbound_base_msat: partial.inbound_base.unwrap_or(feature.inbound_base_msat),
        }
    }

    fn apply_strategy(
        &self,
        rule: &PolicyRule,
        feature: &ChannelFeature,
        ctx: &StrategyContext,
        partial: &mut Partial,
    ) {
        let policy = &rule.policy;
        // Base fees are never strategy-computed; explicit values apply for
        // any strategy.
        if let Some(base) = policy.outbound_base_msat {
            partial.outbound_base = Some(base);
        }
        if let Some(base) = policy.inbound_base_msat {
            partial.inbound_base = Some(base);
        }

        // The strategy's reference outbound rate: explicit if configured,
        // otherwise the channel's current rate.
        let base = policy.outbound_fee_ppm.unwrap_or(feature.outbound_fee_ppm) as f64;
        let current_inbound = feature.inbound_fee_ppm as i64;
        let intensity = ctx.intensity;

        match policy.strategy {
            FeeStrategy::Static => {
                if let Some(ppm) = policy.outbound_fee_ppm {
                    partial.outbound_ppm = Some(ppm as i64);
                }
                if let Some(ppm) = policy.inbound_fee_ppm {
                    partial.inbound_ppm = Some(ppm as i64);
                }
            }
            FeeStrategy::BalanceBased => {
                let ratio = feature.balance_ratio;
                if ratio > self.config.high_balance_threshold {
                    // Outbound-heavy: cheapen outbound, widen the discount.
                    partial.outbound_ppm = Some((base * (1.0 - 0.5 * intensity)) as i64);
                    partial.inbound_ppm =
                        Some(inbound::liquidity_discount(ratio, intensity) as i64);
                } else if ratio < self.config.low_balance_threshold {
                    // Depleted: charge more for what little is left and stop
                    // discounting inbound.
                    partial.outbound_ppm = Some((base * (1.0 + intensity)) as i64);
                    partial.inbound_ppm = Some(current_inbound.max(0));
                } else {
                    match ctx.segment_active {
                        Some(true) => {
                            partial.outbound_ppm = Some((base + 25.0 * intensity) as i64);
                            partial.inbound_ppm =
                                Some(current_inbound + (10.0 * intensity) as i64);
                        }
                        Some(false) => {
                            partial.outbound_ppm = Some((base - 25.0 * intensity) as i64);
                            partial.inbound_ppm =
                                Some(current_inbound - (15.0 * intensity) as i64);
                        }
                        None => {
                            partial.outbound_ppm = Some(base as i64);
                            partial.inbound_ppm =
                                Some(inbound::liquidity_discount(ratio, 0.5 * intensity) as i64);
                        }
                    }
                }
            }
            FeeStrategy::FlowBased => match ctx.flow_trend {
                FlowTrend::Increasing => {
                    partial.outbound_ppm = Some((base + 75.0 * intensity) as i64);
                    partial.inbound_ppm = Some(current_inbound + (20.0 * intensity) as i64);
                }
                FlowTrend::Decreasing | FlowTrend::Unknown => {
                    // Falling or absent traffic: cut rates to attract flow.
                    partial.outbound_ppm = Some((base - 75.0 * intensity) as i64);
                    partial.inbound_ppm = Some(current_inbound - (25.0 * intensity) as i64);
                }
            },
            FeeStrategy::RevenueMax => {
                let best = self
                    .performance
                    .get(&feature.channel_id)
                    .and_then(|samples| samples.iter().max_by_key(|s| s.fee_earned_msat));
                match best {
                    Some(sample) => {
                        partial.outbound_ppm = Some(sample.outbound_fee_ppm as i64);
                        partial.inbound_ppm = Some(sample.inbound_fee_ppm as i64);
                    }
                    None => {
                        // No history yet: behave like static.
                        if let Some(ppm) = policy.outbound_fee_ppm {
                            partial.outbound_ppm = Some(ppm as i64);
                        }
                        if let Some(ppm) = policy.inbound_fee_ppm {
                            partial.inbound_ppm = Some(ppm as i64);
                        }
                    }
                }
            }
            FeeStrategy::InboundDiscount => {
                if let Some(ppm) = policy.outbound_fee_ppm {
                    partial.outbound_ppm = Some(ppm as i64);
                }
                let liquidity = inbound::liquidity_discount(feature.balance_ratio, intensity);
                let competitive =
                    inbound::competitive_fee(feature.outbound_fee_ppm, &feature.peer_fee_rates);
                partial.inbound_ppm = Some(liquidity.min(competitive) as i64);
            }
            FeeStrategy::InboundPremium => {
                if let Some(ppm) = policy.outbound_fee_ppm {
                    partial.outbound_ppm = Some(ppm as i64);
                }
                partial.inbound_ppm = Some(inbound::flow_ratio_fee(
                    feature.forwarded_in_7d_msat,
                    feature.forwarded_out_7d_msat,
                ) as i64);
            }
        }
    }

    // === Counters and performance history (control-loop only) ===

    /// Record that a change derived from these rules was applied.
    pub fn record_applied(&mut self, rule_names: &[String], at: DateTime<Utc>) {
        for name in rule_names {
            let counters = self.counters.entry(name.clone()).or_default();
            counters.applied_count += 1;
            counters.last_applied = Some(at);
        }
    }

    /// Attribute an observed revenue delta to previously applied rules.
    pub fn record_revenue_impact(&mut self, rule_names: &[String], delta_msat: i64) {
        for name in rule_names {
            self.counters.entry(name.clone()).or_default().revenue_impact_msat += delta_msat;
        }
    }

    pub fn counters(&self, rule_name: &str) -> Option<&RuleCounters> {
        self.counters.get(rule_name)
    }

    /// Append one performance sample for a channel, pruning anything older
    /// than the configured retention.
    pub fn record_performance(&mut self, channel_id: &str, sample: PerformanceSample) {
        let cutoff = sample.at - Duration::days(self.config.history_retention_days as i64);
        let samples = self.performance.entry(channel_id.to_string()).or_default();
        samples.push(sample);
        samples.retain(|s| s.at > cutoff);
    }

    pub fn performance_history(&self, channel_id: &str) -> &[PerformanceSample] {
        self.performance
            .get(channel_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::ChannelSnapshot;
    use crate::policy::matcher::PolicyMatcher;
    use crate::policy::rule::FeePolicy;

    fn feature(balance_ratio_pct: u64, outbound_ppm: u32) -> ChannelFeature {
        let capacity = 5_000_000u64;
        let local = capacity * balance_ratio_pct / 100;
        ChannelFeature::from_snapshot(&ChannelSnapshot {
            channel_id: "871x2x1".to_string(),
            capacity_sat: capacity,
            local_balance_sat: local,
            remote_balance_sat: capacity - local,
            outbound_fee_ppm: outbound_ppm,
            outbound_base_msat: 1000,
            inbound_fee_ppm: 0,
            inbound_base_msat: 0,
            forwarded_in_7d_msat: 600_000_000,
            forwarded_out_7d_msat: 600_000_000,
            fee_earned_msat: 50_000,
            peer_pubkey: "02abc".to_string(),
            peer_alias: None,
            age_days: Some(200),
            peer_fee_rates: vec![],
            alternative_routes: 0,
        })
    }

    fn rule(name: &str, priority: u32, kind: PolicyKind, strategy: FeeStrategy) -> PolicyRule {
        PolicyRule {
            name: name.to_string(),
            priority,
            enabled: true,
            matcher: PolicyMatcher::default(),
            policy: FeePolicy {
                strategy,
                kind,
                ..Default::default()
            },
        }
    }

    fn engine(rules: Vec<PolicyRule>) -> PolicyEngine {
        PolicyEngine::new(RuleSet::new(rules).unwrap(), EngineConfig::default())
    }

    #[test]
    fn test_final_rule_stops_walk() {
        let engine = engine(vec![
            rule("defaults", 1, PolicyKind::NonFinal, FeeStrategy::Static),
            rule("stop-here", 10, PolicyKind::Final, FeeStrategy::Static),
            rule("unreachable", 20, PolicyKind::Final, FeeStrategy::Static),
        ]);
        let matched = engine.match_channel(&feature(50, 100));
        let names: Vec<&str> = matched.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["defaults", "stop-here"]);
        // Only the last matched rule may be final.
        assert!(matched[..matched.len() - 1]
            .iter()
            .all(|r| r.policy.kind == PolicyKind::NonFinal));
    }

    #[test]
    fn test_disabled_rule_skipped() {
        let mut disabled = rule("off", 1, PolicyKind::Final, FeeStrategy::Static);
        disabled.enabled = false;
        let engine = engine(vec![
            disabled,
            rule("on", 2, PolicyKind::Final, FeeStrategy::Static),
        ]);
        let matched = engine.match_channel(&feature(50, 100));
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].name, "on");
    }

    #[test]
    fn test_no_match_means_no_change() {
        let mut never = rule("never", 1, PolicyKind::Final, FeeStrategy::Static);
        never.matcher.capacity_min_sat = Some(u64::MAX);
        let engine = engine(vec![never]);
        let f = feature(50, 100);
        let matched = engine.match_channel(&f);
        assert!(matched.is_empty());
        let decision = engine.calculate(&f, &matched, &StrategyContext::default());
        assert!(!decision.differs_from(&f));
    }

    #[test]
    fn test_balance_based_high_ratio() {
        // Balance ratio 0.9 at intensity 1.0: outbound halves, inbound
        // gets the full liquidity discount.
        let engine = engine(vec![rule(
            "balance",
            1,
            PolicyKind::Final,
            FeeStrategy::BalanceBased,
        )]);
        let f = feature(90, 100);
        let matched = engine.match_channel(&f);
        let decision = engine.calculate(
            &f,
            &matched,
            &StrategyContext {
                intensity: 1.0,
                segment_active: Some(true),
                flow_trend: FlowTrend::Unknown,
            },
        );
        assert_eq!(decision.outbound_fee_ppm, 50);
        assert_eq!(decision.inbound_fee_ppm, -40); // clamped to 80% of 50
    }

    #[test]
    fn test_balance_based_low_ratio_raises() {
        let engine = engine(vec![rule(
            "balance",
            1,
            PolicyKind::Final,
            FeeStrategy::BalanceBased,
        )]);
        let f = feature(10, 100);
        let matched = engine.match_channel(&f);
        let decision = engine.calculate(
            &f,
            &matched,
            &StrategyContext {
                intensity: 1.0,
                segment_active: Some(true),
                flow_trend: FlowTrend::Unknown,
            },
        );
        assert_eq!(decision.outbound_fee_ppm, 200);
        assert_eq!(decision.inbound_fee_ppm, 0);
    }

    #[test]
    fn test_later_rule_overrides_only_set_fields() {
        let mut defaults = rule("defaults", 1, PolicyKind::NonFinal, FeeStrategy::Static);
        defaults.policy.outbound_fee_ppm = Some(1000);
        defaults.policy.inbound_fee_ppm = Some(-10);

        let mut specific = rule("specific", 10, PolicyKind::Final, FeeStrategy::Static);
        specific.policy.outbound_fee_ppm = Some(250);
        // inbound left unset: the default survives the fold.

        let engine = engine(vec![defaults, specific]);
        let f = feature(50, 100);
        let matched = engine.match_channel(&f);
        let decision = engine.calculate(&f, &matched, &StrategyContext::default());
        assert_eq!(decision.outbound_fee_ppm, 250);
        assert_eq!(decision.inbound_fee_ppm, -10);
    }

    #[test]
    fn test_rule_clamps_then_global_clamp() {
        let mut capped = rule("capped", 1, PolicyKind::Final, FeeStrategy::Static);
        capped.policy.outbound_fee_ppm = Some(9000);
        capped.policy.max_fee_ppm = Some(8000);

        let engine = engine(vec![capped]);
        let f = feature(50, 100);
        let matched = engine.match_channel(&f);
        let decision = engine.calculate(&f, &matched, &StrategyContext::default());
        // Rule clamp takes it to 8000, global ceiling to 5000.
        assert_eq!(decision.outbound_fee_ppm, 5000);
    }

    #[test]
    fn test_outbound_never_below_one() {
        let mut floor = rule("floor", 1, PolicyKind::Final, FeeStrategy::Static);
        floor.policy.outbound_fee_ppm = Some(0);
        let engine = engine(vec![floor]);
        let f = feature(50, 100);
        let matched = engine.match_channel(&f);
        let decision = engine.calculate(&f, &matched, &StrategyContext::default());
        assert_eq!(decision.outbound_fee_ppm, 1);
    }

    #[test]
    fn test_discount_capped_at_80_pct_of_outbound() {
        let mut deep = rule("deep", 1, PolicyKind::Final, FeeStrategy::Static);
        deep.policy.outbound_fee_ppm = Some(100);
        deep.policy.inbound_fee_ppm = Some(-500);
        let engine = engine(vec![deep]);
        let f = feature(50, 100);
        let matched = engine.match_channel(&f);
        let decision = engine.calculate(&f, &matched, &StrategyContext::default());
        assert_eq!(decision.inbound_fee_ppm, -80);
    }

    #[test]
    fn test_flow_based_lowers_on_no_flow() {
        // Zero 7-day flow and no history: the strategy must lower fees to
        // activate the channel, not raise them.
        let engine = engine(vec![rule(
            "flow",
            1,
            PolicyKind::Final,
            FeeStrategy::FlowBased,
        )]);
        let mut f = feature(50, 200);
        f.forwarded_in_7d_msat = 0;
        f.forwarded_out_7d_msat = 0;
        let matched = engine.match_channel(&f);
        let decision = engine.calculate(
            &f,
            &matched,
            &StrategyContext {
                intensity: 0.5,
                segment_active: Some(false),
                flow_trend: FlowTrend::Unknown,
            },
        );
        assert!(decision.outbound_fee_ppm < 200);
        assert!(decision.inbound_fee_ppm < 0);
    }

    #[test]
    fn test_flow_based_raises_on_increasing() {
        let engine = engine(vec![rule(
            "flow",
            1,
            PolicyKind::Final,
            FeeStrategy::FlowBased,
        )]);
        let f = feature(50, 200);
        let matched = engine.match_channel(&f);
        let decision = engine.calculate(
            &f,
            &matched,
            &StrategyContext {
                intensity: 1.0,
                segment_active: Some(true),
                flow_trend: FlowTrend::Increasing,
            },
        );
        assert_eq!(decision.outbound_fee_ppm, 275);
    }

    #[test]
    fn test_revenue_max_uses_best_sample() {
        let mut engine = engine(vec![rule(
            "revmax",
            1,
            PolicyKind::Final,
            FeeStrategy::RevenueMax,
        )]);
        let now = Utc::now();
        engine.record_performance(
            "871x2x1",
            PerformanceSample {
                at: now,
                outbound_fee_ppm: 150,
                inbound_fee_ppm: -20,
                fee_earned_msat: 9_000,
                flow_msat: 1,
            },
        );
        engine.record_performance(
            "871x2x1",
            PerformanceSample {
                at: now,
                outbound_fee_ppm: 400,
                inbound_fee_ppm: 0,
                fee_earned_msat: 2_000,
                flow_msat: 1,
            },
        );
        let f = feature(50, 100);
        let matched = engine.match_channel(&f);
        let decision = engine.calculate(&f, &matched, &StrategyContext::default());
        assert_eq!(decision.outbound_fee_ppm, 150);
        assert_eq!(decision.inbound_fee_ppm, -20);
    }

    #[test]
    fn test_revenue_max_falls_back_to_static() {
        let mut revmax = rule("revmax", 1, PolicyKind::Final, FeeStrategy::RevenueMax);
        revmax.policy.outbound_fee_ppm = Some(500);
        let engine = engine(vec![revmax]);
        let f = feature(50, 100);
        let matched = engine.match_channel(&f);
        let decision = engine.calculate(&f, &matched, &StrategyContext::default());
        assert_eq!(decision.outbound_fee_ppm, 500);
    }

    #[test]
    fn test_counters_update_on_apply_only() {
        let mut engine = engine(vec![rule(
            "counted",
            1,
            PolicyKind::Final,
            FeeStrategy::Static,
        )]);
        let f = feature(50, 100);
        let _ = engine.match_channel(&f);
        assert!(engine.counters("counted").is_none());

        engine.record_applied(&["counted".to_string()], Utc::now());
        assert_eq!(engine.counters("counted").unwrap().applied_count, 1);

        engine.record_revenue_impact(&["counted".to_string()], -1500);
        assert_eq!(
            engine.counters("counted").unwrap().revenue_impact_msat,
            -1500
        );
    }

    #[test]
    fn test_performance_history_retention() {
        let mut engine = engine(vec![]);
        let now = Utc::now();
        engine.record_performance(
            "chan",
            PerformanceSample {
                at: now - Duration::days(45),
                outbound_fee_ppm: 100,
                inbound_fee_ppm: 0,
                fee_earned_msat: 1,
                flow_msat: 1,
            },
        );
        engine.record_performance(
            "chan",
            PerformanceSample {
                at: now,
                outbound_fee_ppm: 200,
                inbound_fee_ppm: 0,
                fee_earned_msat: 2,
                flow_msat: 2,
            },
        );
        let history = engine.performance_history("chan");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outbound_fee_ppm, 200);
    }
}
