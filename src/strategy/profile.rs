//! Strategy Profile Configuration
//!
//! Serde model for profile files. A profile carries one `TimedTradeConfig`
//! per coin; the kernel vectorises profiles for the same coin together, which
//! requires every profile to share that coin's rule count and tier schedule
//! (validated at kernel construction, fatal on mismatch).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::replay::types::CoinId;

fn one() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

/// How the base size factor is derived for an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeStrategy {
    Fixed,
    Edge,
    Depth,
    Confidence,
}

impl Default for SizeStrategy {
    fn default() -> Self {
        SizeStrategy::Fixed
    }
}

impl SizeStrategy {
    /// Compact encoding for the kernel's columnar arrays.
    pub fn encode(self) -> u8 {
        match self {
            SizeStrategy::Fixed => 0,
            SizeStrategy::Edge => 1,
            SizeStrategy::Depth => 2,
            SizeStrategy::Confidence => 3,
        }
    }

    pub fn decode(code: u8) -> SizeStrategy {
        match code {
            1 => SizeStrategy::Edge,
            2 => SizeStrategy::Depth,
            3 => SizeStrategy::Confidence,
            _ => SizeStrategy::Fixed,
        }
    }
}

/// One tier of entry rules, active while `time_left_sec <= tier_seconds`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierRule {
    pub tier_seconds: f64,
    pub minimum_price_difference: f64,
    #[serde(default)]
    pub minimum_share_price: f64,
    #[serde(default = "one")]
    pub maximum_share_price: f64,
    #[serde(default)]
    pub minimum_spend: f64,
    pub maximum_spend: f64,
    #[serde(default = "one")]
    pub size_scale: f64,
    #[serde(default)]
    pub size_strategy: SizeStrategy,

    // Optional per-rule signal thresholds; absent thresholds do not gate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_spread: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_book_imbalance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_trade_velocity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_momentum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_volatility: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_staleness_sec: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_flow_imbalance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_open_exposure: Option<f64>,
}

/// A cross-over rule is a tier rule plus recovery gates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossRule {
    #[serde(flatten)]
    pub rule: TierRule,
    #[serde(default)]
    pub min_loss_to_trigger: f64,
    #[serde(default)]
    pub min_recovery_multiple: f64,
}

/// Cross-over configuration for one coin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossConfig {
    pub trade_allowed_time_left: f64,
    pub rules: Vec<CrossRule>,
}

/// Edge-score component weights.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EdgeWeights {
    pub gap: f64,
    pub depth: f64,
    pub imbalance: f64,
    pub velocity: f64,
    pub momentum: f64,
    pub volatility: f64,
    pub spread: f64,
    pub reference: f64,
}

impl Default for EdgeWeights {
    fn default() -> Self {
        Self {
            gap: 0.30,
            depth: 0.15,
            imbalance: 0.15,
            velocity: 0.10,
            momentum: 0.15,
            volatility: 0.05,
            spread: 0.07,
            reference: 0.03,
        }
    }
}

/// Per-component cap factors for edge-score ratios.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EdgeCaps {
    pub gap: f64,
    pub depth: f64,
    pub velocity: f64,
    pub momentum: f64,
    pub volatility: f64,
    pub spread: f64,
}

impl Default for EdgeCaps {
    fn default() -> Self {
        Self {
            gap: 2.0,
            depth: 2.0,
            velocity: 2.0,
            momentum: 2.0,
            volatility: 2.0,
            spread: 1.0,
        }
    }
}

/// Soft-ranking edge model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeModel {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub weights: EdgeWeights,
    #[serde(default)]
    pub caps: EdgeCaps,
    #[serde(default = "EdgeModel::default_tau")]
    pub staleness_tau_sec: f64,
    /// Reject instead of renormalising when a component is missing.
    #[serde(default)]
    pub require_signals: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_score: Option<f64>,
}

impl EdgeModel {
    fn default_tau() -> f64 {
        30.0
    }
}

impl Default for EdgeModel {
    fn default() -> Self {
        Self {
            enabled: true,
            weights: EdgeWeights::default(),
            caps: EdgeCaps::default(),
            staleness_tau_sec: Self::default_tau(),
            require_signals: false,
            min_score: None,
        }
    }
}

/// Hard/soft veto model over per-rule thresholds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateModel {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "GateModel::default_floor")]
    pub per_signal_floor: f64,
    #[serde(default = "GateModel::default_min_multiplier")]
    pub min_gate_multiplier: f64,
}

impl GateModel {
    fn default_floor() -> f64 {
        0.5
    }

    fn default_min_multiplier() -> f64 {
        0.25
    }
}

impl Default for GateModel {
    fn default() -> Self {
        Self {
            enabled: true,
            per_signal_floor: Self::default_floor(),
            min_gate_multiplier: Self::default_min_multiplier(),
        }
    }
}

/// Spend-shaping model; only the edge-weighted mode exists.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SizeModel {
    #[serde(default = "SizeModel::default_mode")]
    pub mode: SizeMode,
    #[serde(default = "SizeModel::default_gamma")]
    pub gamma: f64,
    #[serde(default = "SizeModel::default_floor")]
    pub min_floor: f64,
    #[serde(default = "SizeModel::default_ceil")]
    pub max_ceil: f64,
    #[serde(default = "default_true")]
    pub confidence_blend: bool,
    #[serde(default = "default_true")]
    pub apply_gate_multiplier: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeMode {
    EdgeWeighted,
}

impl SizeModel {
    fn default_mode() -> SizeMode {
        SizeMode::EdgeWeighted
    }

    fn default_gamma() -> f64 {
        1.2
    }

    fn default_floor() -> f64 {
        0.5
    }

    fn default_ceil() -> f64 {
        1.5
    }
}

impl Default for SizeModel {
    fn default() -> Self {
        Self {
            mode: Self::default_mode(),
            gamma: Self::default_gamma(),
            min_floor: Self::default_floor(),
            max_ceil: Self::default_ceil(),
            confidence_blend: true,
            apply_gate_multiplier: true,
        }
    }
}

/// Streak-based governor that tightens entries after consecutive losses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LossGovernor {
    pub streak_threshold: u32,
    #[serde(default = "LossGovernor::default_min_diff_multiplier")]
    pub loss_min_diff_multiplier: f64,
    #[serde(default = "LossGovernor::default_size_scale_multiplier")]
    pub loss_size_scale_multiplier: f64,
}

impl LossGovernor {
    fn default_min_diff_multiplier() -> f64 {
        1.5
    }

    fn default_size_scale_multiplier() -> f64 {
        0.5
    }
}

/// Multiplicative overrides applied to the selected cross rule.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CrossModeOverrides {
    pub min_diff_multiplier: f64,
    pub size_multiplier: f64,
    pub min_recovery_multiplier: f64,
}

impl Default for CrossModeOverrides {
    fn default() -> Self {
        Self {
            min_diff_multiplier: 1.0,
            size_multiplier: 1.0,
            min_recovery_multiplier: 1.0,
        }
    }
}

/// Precision-vs-opportunistic split for cross trades by time left.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossModes {
    /// At or below this many seconds left, the precision overrides apply;
    /// above it, the opportunistic ones.
    pub precision_time_left: f64,
    #[serde(default)]
    pub precision: CrossModeOverrides,
    #[serde(default)]
    pub opportunistic: CrossModeOverrides,
}

/// Per-coin trading configuration of one profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimedTradeConfig {
    pub trade_allowed_time_left: f64,
    pub rules: Vec<TierRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cross: Option<CrossConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_model: Option<EdgeModel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_model: Option<GateModel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_model: Option<SizeModel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss_governor: Option<LossGovernor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cross_modes: Option<CrossModes>,
}

/// A named strategy profile: one timed config per traded coin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub name: String,
    pub coins: HashMap<CoinId, TimedTradeConfig>,
}

impl Profile {
    pub fn config_for(&self, coin: CoinId) -> Option<&TimedTradeConfig> {
        self.coins.get(&coin)
    }
}

/// Parse a profile file: a JSON array of profiles.
pub fn parse_profiles(raw: &str) -> anyhow::Result<Vec<Profile>> {
    let profiles: Vec<Profile> = serde_json::from_str(raw)?;
    anyhow::ensure!(!profiles.is_empty(), "profile file contains no profiles");
    Ok(profiles)
}
