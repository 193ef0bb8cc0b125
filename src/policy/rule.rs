//! Policy rules: fee templates, execution kinds, and rule-file loading.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::{Error, Result};

use super::matcher::PolicyMatcher;

/// Fee calculation strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeStrategy {
    /// Use the rule's literal configured values.
    Static,
    /// Steer liquidity based on the local balance ratio.
    BalanceBased,
    /// Follow the flow trend: raise into rising demand, cut to attract.
    FlowBased,
    /// Pick the historically best-performing rate from performance history.
    RevenueMax,
    /// Inbound-fee optimization via the liquidity/competitive discounts.
    InboundDiscount,
    /// Inbound-fee optimization via the flow-ratio premium.
    InboundPremium,
}

impl std::fmt::Display for FeeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FeeStrategy::Static => "static",
            FeeStrategy::BalanceBased => "balance_based",
            FeeStrategy::FlowBased => "flow_based",
            FeeStrategy::RevenueMax => "revenue_max",
            FeeStrategy::InboundDiscount => "inbound_discount",
            FeeStrategy::InboundPremium => "inbound_premium",
        };
        write!(f, "{s}")
    }
}

/// Whether a matched rule terminates further rule evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Stop evaluating further rules on match.
    #[default]
    Final,
    /// Keep evaluating; used for cascading defaults.
    NonFinal,
}

/// Fee output template of a rule.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeePolicy {
    /// Explicit outbound fee rate in ppm.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbound_fee_ppm: Option<u32>,
    /// Explicit outbound base fee in msat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbound_base_msat: Option<u64>,
    /// Explicit inbound fee rate in ppm (negative = discount).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbound_fee_ppm: Option<i32>,
    /// Explicit inbound base fee in msat, signed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbound_base_msat: Option<i64>,
    #[serde(default = "default_strategy")]
    pub strategy: FeeStrategy,
    #[serde(default)]
    pub kind: PolicyKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_fee_ppm: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fee_ppm: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_inbound_ppm: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_inbound_ppm: Option<i32>,
    /// Whether changes applied through this rule are watched by the safety
    /// monitor and reverted on decline.
    #[serde(default = "default_auto_rollback")]
    pub auto_rollback: bool,
    /// Revenue decline fraction that triggers a rollback for this rule.
    #[serde(default = "default_rollback_threshold")]
    pub rollback_threshold: f64,
}

fn default_strategy() -> FeeStrategy {
    FeeStrategy::Static
}

fn default_auto_rollback() -> bool {
    true
}

fn default_rollback_threshold() -> f64 {
    0.3
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            outbound_fee_ppm: None,
            outbound_base_msat: None,
            inbound_fee_ppm: None,
            inbound_base_msat: None,
            strategy: default_strategy(),
            kind: PolicyKind::default(),
            min_fee_ppm: None,
            max_fee_ppm: None,
            min_inbound_ppm: None,
            max_inbound_ppm: None,
            auto_rollback: default_auto_rollback(),
            rollback_threshold: default_rollback_threshold(),
        }
    }
}

/// A complete policy rule: matcher plus fee policy.
///
/// Immutable after load. Per-rule performance counters live in a separate
/// map (see [`RuleCounters`]) so the rule list stays freely shareable.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PolicyRule {
    pub name: String,
    /// Lower priority runs first.
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub matcher: PolicyMatcher,
    #[serde(default)]
    pub policy: FeePolicy,
}

fn default_priority() -> u32 {
    100
}

fn default_enabled() -> bool {
    true
}

/// Mutable per-rule performance counters, keyed by rule name.
///
/// Mutated in place only by the control loop as rules are applied.
#[derive(Debug, Clone, Default)]
pub struct RuleCounters {
    /// How many times the rule contributed to an applied change.
    pub applied_count: u64,
    /// Cumulative observed revenue delta (msat) attributed to the rule.
    pub revenue_impact_msat: i64,
    pub last_applied: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default, rename = "rule")]
    rules: Vec<PolicyRule>,
}

/// The priority-sorted set of policy rules, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<PolicyRule>,
}

impl RuleSet {
    /// Build a rule set from already-parsed rules (used in tests and by
    /// programmatic construction). Sorts by ascending priority and
    /// validates.
    pub fn new(mut rules: Vec<PolicyRule>) -> Result<Self> {
        Self::validate(&rules)?;
        rules.sort_by_key(|r| r.priority);
        Ok(Self { rules })
    }

    /// Load and validate a TOML rule file. Any malformation is fatal.
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read rule file {path}: {e}")))?;
        let file: RuleFile = toml::from_str(&content)
            .map_err(|e| Error::config(format!("cannot parse rule file {path}: {e}")))?;
        let set = Self::new(file.rules)?;
        info!(path = %path, rules = set.len(), "Loaded policy rules");
        Ok(set)
    }

    fn validate(rules: &[PolicyRule]) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for rule in rules {
            if rule.name.is_empty() {
                return Err(Error::config("rule with empty name"));
            }
            if !seen.insert(rule.name.as_str()) {
                return Err(Error::config(format!("duplicate rule name: {}", rule.name)));
            }
            let p = &rule.policy;
            if let (Some(min), Some(max)) = (p.min_fee_ppm, p.max_fee_ppm) {
                if min > max {
                    return Err(Error::config(format!(
                        "rule {}: min_fee_ppm {min} > max_fee_ppm {max}",
                        rule.name
                    )));
                }
            }
            if let (Some(min), Some(max)) = (p.min_inbound_ppm, p.max_inbound_ppm) {
                if min > max {
                    return Err(Error::config(format!(
                        "rule {}: min_inbound_ppm {min} > max_inbound_ppm {max}",
                        rule.name
                    )));
                }
            }
            if !(0.0..=1.0).contains(&p.rollback_threshold) {
                return Err(Error::config(format!(
                    "rule {}: rollback_threshold {} outside [0, 1]",
                    rule.name, p.rollback_threshold
                )));
            }
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &PolicyRule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [[rule]]
        name = "defaults"
        priority = 1

        [rule.policy]
        strategy = "static"
        kind = "non_final"
        outbound_fee_ppm = 1000

        [[rule]]
        name = "drain-heavy"
        priority = 20

        [rule.matcher]
        balance_ratio_min = 0.8

        [rule.policy]
        strategy = "balance_based"
        rollback_threshold = 0.2
    "#;

    #[test]
    fn test_load_sorts_by_priority() {
        let file: RuleFile = toml::from_str(SAMPLE).unwrap();
        let set = RuleSet::new(file.rules).unwrap();
        let priorities: Vec<u32> = set.iter().map(|r| r.priority).collect();
        assert_eq!(priorities, vec![1, 20]);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_defaults() {
        let file: RuleFile = toml::from_str(SAMPLE).unwrap();
        let set = RuleSet::new(file.rules).unwrap();
        let rule = set.iter().find(|r| r.name == "drain-heavy").unwrap();
        assert!(rule.enabled);
        assert_eq!(rule.policy.kind, PolicyKind::Final);
        assert!(rule.policy.auto_rollback);
        assert_eq!(rule.policy.rollback_threshold, 0.2);
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let bad = r#"
            [[rule]]
            name = "x"
            [rule.policy]
            strategy = "martingale"
        "#;
        assert!(toml::from_str::<RuleFile>(bad).is_err());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let rules = vec![
            PolicyRule {
                name: "a".into(),
                priority: 1,
                enabled: true,
                matcher: PolicyMatcher::default(),
                policy: FeePolicy::default(),
            },
            PolicyRule {
                name: "a".into(),
                priority: 2,
                enabled: true,
                matcher: PolicyMatcher::default(),
                policy: FeePolicy::default(),
            },
        ];
        assert!(matches!(RuleSet::new(rules), Err(Error::Config(_))));
    }

    #[test]
    fn test_inverted_clamps_rejected() {
        let rules = vec![PolicyRule {
            name: "a".into(),
            priority: 1,
            enabled: true,
            matcher: PolicyMatcher::default(),
            policy: FeePolicy {
                min_fee_ppm: Some(500),
                max_fee_ppm: Some(100),
                ..Default::default()
            },
        }];
        assert!(matches!(RuleSet::new(rules), Err(Error::Config(_))));
    }
}
