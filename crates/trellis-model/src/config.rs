//! Engine configuration and the data-driven qualification / level schedules.
//!
//! Nothing layer- or level-specific is hard-coded in the engines; they query
//! these schedules. The `standard()` constructors carry the production
//! defaults, and operators override per layer / per level as config data.

use crate::types::Wallet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 72 hours, the default window a pending reward stays open.
pub const DEFAULT_PENDING_WINDOW_MS: u64 = 72 * 60 * 60 * 1000;

/// Matrix geometry and engine budgets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixConfig {
    /// Maximum tree depth. No slot is assigned below this layer.
    pub max_layers: u32,
    /// How many upline ancestors of the referrer receive a placement.
    pub upline_depth: u32,
    /// How long a pending reward may wait before the rollup sweep takes it.
    pub pending_window_ms: u64,
    /// Optimistic retries per root before a placement is deferred.
    pub placement_retry_budget: u32,
    /// Retries for external lookups (level, referral count) before the
    /// qualification is reported indeterminate.
    pub lookup_retry_budget: u32,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            max_layers: 19,
            upline_depth: 19,
            pending_window_ms: DEFAULT_PENDING_WINDOW_MS,
            placement_retry_budget: 5,
            lookup_retry_budget: 3,
        }
    }
}

impl MatrixConfig {
    #[must_use]
    pub fn with_max_layers(mut self, layers: u32) -> Self {
        self.max_layers = layers;
        self
    }

    #[must_use]
    pub fn with_upline_depth(mut self, depth: u32) -> Self {
        self.upline_depth = depth;
        self
    }

    #[must_use]
    pub fn with_pending_window_ms(mut self, window: u64) -> Self {
        self.pending_window_ms = window;
        self
    }

    #[must_use]
    pub fn with_placement_retry_budget(mut self, budget: u32) -> Self {
        self.placement_retry_budget = budget;
        self
    }

    #[must_use]
    pub fn with_lookup_retry_budget(mut self, budget: u32) -> Self {
        self.lookup_retry_budget = budget;
        self
    }
}

/// What a recipient must hold to receive a layer-N reward immediately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualificationRule {
    pub layer: u32,
    pub required_level: u8,
    /// Some layers additionally (or instead) require a number of direct
    /// referrals; `None` means level-only.
    pub min_direct_referrals: Option<u32>,
}

impl QualificationRule {
    /// The default rule for a layer: required level equals the layer number,
    /// no referral requirement.
    #[must_use]
    pub fn level_only(layer: u32) -> Self {
        Self {
            layer,
            required_level: layer.min(u8::MAX as u32) as u8,
            min_direct_referrals: None,
        }
    }
}

/// Per-layer qualification rules with layer-specific overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualificationSchedule {
    overrides: HashMap<u32, QualificationRule>,
}

impl QualificationSchedule {
    /// Level-only rules for every layer.
    #[must_use]
    pub fn standard() -> Self {
        Self::default()
    }

    /// Install an override for one layer.
    #[must_use]
    pub fn with_rule(mut self, rule: QualificationRule) -> Self {
        self.overrides.insert(rule.layer, rule);
        self
    }

    /// The rule in force for a layer.
    #[must_use]
    pub fn rule_for(&self, layer: u32) -> QualificationRule {
        self.overrides
            .get(&layer)
            .cloned()
            .unwrap_or_else(|| QualificationRule::level_only(layer))
    }
}

/// Price and reward configuration for one membership level.
///
/// Price and reward are distinct configured values; the reward for a level is
/// constant across every recipient triggered by that level-up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelTier {
    pub level: u8,
    /// Purchase price, minor units.
    pub price_minor: u64,
    /// Reward paid per qualifying recipient, minor units.
    pub reward_minor: u64,
    /// Direct referrals required to purchase this level.
    pub required_direct_referrals: u32,
}

/// The full level table, levels 1..=N.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelSchedule {
    tiers: Vec<LevelTier>,
}

impl LevelSchedule {
    /// Build a schedule from explicit tiers. Tiers must be sorted by level.
    #[must_use]
    pub fn new(tiers: Vec<LevelTier>) -> Self {
        Self { tiers }
    }

    /// The production 19-level table: level 1 costs 100.00, each level adds
    /// 50.00, level 19 costs 1000.00. Reward equals price. Referral
    /// requirements ramp 0, 3, 5, 7, 10, 12, then +2 per level, capped at 50
    /// for level 19.
    #[must_use]
    pub fn standard() -> Self {
        let tiers = (1u8..=19)
            .map(|level| {
                let price_minor = (100 + (u64::from(level) - 1) * 50) * 100;
                let required_direct_referrals = match level {
                    1 => 0,
                    2 => 3,
                    3 => 5,
                    4 => 7,
                    5 => 10,
                    6 => 12,
                    19 => 50,
                    n => (u32::from(n) - 6) * 2 + 12,
                };
                LevelTier {
                    level,
                    price_minor,
                    reward_minor: price_minor,
                    required_direct_referrals,
                }
            })
            .collect();
        Self { tiers }
    }

    /// Configuration for one level, if it exists.
    #[must_use]
    pub fn tier(&self, level: u8) -> Option<&LevelTier> {
        self.tiers.iter().find(|t| t.level == level)
    }

    /// The constant reward amount for a triggering level.
    #[must_use]
    pub fn reward_for(&self, level: u8) -> Option<u64> {
        self.tier(level).map(|t| t.reward_minor)
    }

    /// Highest configured level.
    #[must_use]
    pub fn max_level(&self) -> u8 {
        self.tiers.iter().map(|t| t.level).max().unwrap_or(0)
    }
}

/// The activation/upgrade event emitted by the payment collaborator.
///
/// This is the single input that drives the core: placement on first level,
/// reward distribution on every level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationEvent {
    pub wallet: Wallet,
    pub new_level: u8,
    pub referrer: Option<Wallet>,
    /// What the member paid, minor units. Informational; rewards come from
    /// the level schedule, not this amount.
    pub payment_minor: u64,
    pub transaction_reference: String,
}
