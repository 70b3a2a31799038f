//! Multi-Profile Tiered Decision Kernel
//!
//! Evaluates every configured profile against one coin's market snapshot per
//! scheduler step. Parameters for P profiles x R tier rules are packed into
//! flat columnar arrays indexed by `p * R + t` (absent thresholds encoded as
//! NaN, size strategies as u8), so a per-tick evaluation allocates nothing.
//! The live engine evaluates the same layout; a replay over identical inputs
//! must reproduce its decisions exactly.
//!
//! The kernel is the only component that mutates position or P&L state.
//! Every guard that rejects a profile is a silent skip of that profile only;
//! the sole fatal error is a schema violation at construction (profiles for
//! one coin disagreeing on rule count or tier schedule).

use anyhow::{ensure, Result};
use tracing::debug;

use crate::replay::config::SweepEnv;
use crate::replay::signals::{MarketSignals, SignalConfig};
use crate::replay::state::MarketState;
use crate::replay::types::{CoinId, DataStatus, Millis, ProfileSummary};
use crate::strategy::fills::{simulate_buy, simulate_sell};
use crate::strategy::profile::{
    CrossModeOverrides, CrossModes, EdgeModel, GateModel, LossGovernor, Profile, SizeModel,
    SizeStrategy, TierRule,
};

const EPS: f64 = 1e-9;
/// Seconds over which the confidence staleness score ramps to zero.
const CONFIDENCE_STALENESS_RAMP_SEC: f64 = 60.0;
/// Tau for the confidence staleness decay multiplier.
const CONFIDENCE_DECAY_TAU_SEC: f64 = 30.0;
/// Minimum distinct signal components for a confidence estimate.
const CONFIDENCE_MIN_COMPONENTS: usize = 3;

/// Open position side for one (profile, coin).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    None,
    Up,
    Down,
}

impl Outcome {
    fn from_up(up: bool) -> Self {
        if up {
            Outcome::Up
        } else {
            Outcome::Down
        }
    }

    fn is_up(self) -> bool {
        self == Outcome::Up
    }
}

/// Per-profile position and per-market bookkeeping.
#[derive(Debug, Clone)]
struct PositionState {
    outcome: Outcome,
    shares: f64,
    cost: f64,
    crossed: bool,
    /// Realised P&L accumulated within the current market (cross exits plus
    /// terminal settlement).
    realized_pnl: f64,
    market_had_trade: bool,
    market_trade_counted: bool,
    pending_due_ms: Option<Millis>,
    pending_outcome: Outcome,
    pending_rule_idx: usize,
    pending_spend: f64,
    last_decision_ms: Millis,
    last_resolved_epoch: u64,
    /// Favoured side at entry time, for flip detection.
    entry_favored_up: bool,
}

impl PositionState {
    fn new() -> Self {
        Self {
            outcome: Outcome::None,
            shares: 0.0,
            cost: 0.0,
            crossed: false,
            realized_pnl: 0.0,
            market_had_trade: false,
            market_trade_counted: false,
            pending_due_ms: None,
            pending_outcome: Outcome::None,
            pending_rule_idx: 0,
            pending_spend: 0.0,
            last_decision_ms: 0,
            last_resolved_epoch: 0,
            entry_favored_up: false,
        }
    }

    fn clear_market_fields(&mut self) {
        self.outcome = Outcome::None;
        self.shares = 0.0;
        self.cost = 0.0;
        self.crossed = false;
        self.realized_pnl = 0.0;
        self.market_had_trade = false;
        self.market_trade_counted = false;
        self.pending_due_ms = None;
        self.pending_outcome = Outcome::None;
        self.pending_rule_idx = 0;
        self.pending_spend = 0.0;
        self.last_decision_ms = 0;
    }
}

/// Lifetime performance counters per profile.
#[derive(Debug, Clone, Default)]
struct ProfileStats {
    total_trades: u64,
    cross_trades: u64,
    wins: u64,
    losses: u64,
    total_profit: f64,
    loss_streak: u32,
}

/// Columnar rule parameters, one slot per `p * rule_count + tier`.
#[derive(Debug, Clone, Default)]
struct RuleColumns {
    min_diff: Vec<f64>,
    min_share: Vec<f64>,
    max_share: Vec<f64>,
    min_spend: Vec<f64>,
    max_spend: Vec<f64>,
    size_scale: Vec<f64>,
    size_strategy: Vec<u8>,
    max_spread: Vec<f64>,
    min_imbalance: Vec<f64>,
    min_velocity: Vec<f64>,
    min_momentum: Vec<f64>,
    max_volatility: Vec<f64>,
    max_staleness: Vec<f64>,
    min_flow: Vec<f64>,
    min_confidence: Vec<f64>,
    max_open_exposure: Vec<f64>,
}

fn opt(value: Option<f64>) -> f64 {
    value.unwrap_or(f64::NAN)
}

impl RuleColumns {
    fn push_rule(&mut self, rule: &TierRule) {
        self.min_diff.push(rule.minimum_price_difference);
        self.min_share.push(rule.minimum_share_price);
        self.max_share.push(rule.maximum_share_price);
        self.min_spend.push(rule.minimum_spend);
        self.max_spend.push(rule.maximum_spend);
        self.size_scale.push(rule.size_scale);
        self.size_strategy.push(rule.size_strategy.encode());
        self.max_spread.push(opt(rule.max_spread));
        self.min_imbalance.push(opt(rule.min_book_imbalance));
        self.min_velocity.push(opt(rule.min_trade_velocity));
        self.min_momentum.push(opt(rule.min_momentum));
        self.max_volatility.push(opt(rule.max_volatility));
        self.max_staleness.push(opt(rule.max_staleness_sec));
        self.min_flow.push(opt(rule.min_flow_imbalance));
        self.min_confidence.push(opt(rule.min_confidence));
        self.max_open_exposure.push(opt(rule.max_open_exposure));
    }
}

/// Vectorised decision kernel for one coin.
pub struct CoinKernel {
    coin: CoinId,
    profile_names: Vec<String>,
    rule_count: usize,
    /// Shared tier schedule (ascending), one slot per rule.
    tier_seconds: Vec<f64>,
    /// Per-profile entry window (seconds of time-left).
    trade_allowed: Vec<f64>,
    entry: RuleColumns,

    cross_rule_count: usize,
    cross_tier_seconds: Vec<f64>,
    /// Per-profile cross window; NaN when the profile has no cross config.
    cross_allowed: Vec<f64>,
    cross: RuleColumns,
    cross_min_loss: Vec<f64>,
    cross_min_recovery: Vec<f64>,

    edge_models: Vec<Option<EdgeModel>>,
    gate_models: Vec<Option<GateModel>>,
    size_models: Vec<Option<SizeModel>>,
    loss_governors: Vec<Option<LossGovernor>>,
    cross_modes: Vec<Option<CrossModes>>,

    positions: Vec<PositionState>,
    stats: Vec<ProfileStats>,

    current_slug: Option<String>,
    epoch: u64,
    /// Last observed threshold/underlying, for resolving an outgoing market
    /// when only the successor snapshot is delivered.
    last_threshold: f64,
    last_crypto_price: f64,

    sweep: SweepEnv,
    signal_config: SignalConfig,
}

impl CoinKernel {
    /// Build the kernel for `coin` over every profile configured for it.
    /// Returns `Ok(None)` when no profile trades this coin.
    ///
    /// Fatal here, and only here: profiles for the same coin disagreeing on
    /// rule count or tier schedule (entry or cross).
    pub fn new(
        coin: CoinId,
        profiles: &[Profile],
        sweep: SweepEnv,
        signal_config: SignalConfig,
    ) -> Result<Option<Self>> {
        let configured: Vec<(&Profile, &crate::strategy::profile::TimedTradeConfig)> = profiles
            .iter()
            .filter_map(|p| p.config_for(coin).map(|c| (p, c)))
            .collect();
        if configured.is_empty() {
            return Ok(None);
        }

        let rule_count = configured[0].1.rules.len();
        ensure!(rule_count > 0, "{coin}: profile {} has no tier rules", configured[0].0.name);
        let tier_seconds: Vec<f64> = configured[0].1.rules.iter().map(|r| r.tier_seconds).collect();
        ensure!(
            tier_seconds.windows(2).all(|w| w[0] <= w[1]),
            "{coin}: tier schedule must be ascending"
        );

        let mut kernel = Self {
            coin,
            profile_names: Vec::new(),
            rule_count,
            tier_seconds: tier_seconds.clone(),
            trade_allowed: Vec::new(),
            entry: RuleColumns::default(),
            cross_rule_count: 0,
            cross_tier_seconds: Vec::new(),
            cross_allowed: Vec::new(),
            cross: RuleColumns::default(),
            cross_min_loss: Vec::new(),
            cross_min_recovery: Vec::new(),
            edge_models: Vec::new(),
            gate_models: Vec::new(),
            size_models: Vec::new(),
            loss_governors: Vec::new(),
            cross_modes: Vec::new(),
            positions: Vec::new(),
            stats: Vec::new(),
            current_slug: None,
            epoch: 0,
            last_threshold: 0.0,
            last_crypto_price: 0.0,
            sweep,
            signal_config,
        };

        // The shared cross schedule comes from the first profile that has one.
        let cross_schedule: Option<Vec<f64>> = configured
            .iter()
            .find_map(|(_, c)| c.cross.as_ref())
            .map(|cross| cross.rules.iter().map(|r| r.rule.tier_seconds).collect());
        kernel.cross_rule_count = cross_schedule.as_ref().map_or(0, |s| s.len());
        kernel.cross_tier_seconds = cross_schedule.unwrap_or_default();

        for (profile, config) in &configured {
            ensure!(
                config.rules.len() == rule_count,
                "{coin}: profile {} has {} rules, expected {}",
                profile.name,
                config.rules.len(),
                rule_count
            );
            for (rule, &expected) in config.rules.iter().zip(&tier_seconds) {
                ensure!(
                    (rule.tier_seconds - expected).abs() < EPS,
                    "{coin}: profile {} tier schedule diverges at {}s",
                    profile.name,
                    expected
                );
            }

            kernel.profile_names.push(profile.name.clone());
            kernel.trade_allowed.push(config.trade_allowed_time_left);
            for rule in &config.rules {
                kernel.entry.push_rule(rule);
            }

            match config.cross.as_ref() {
                Some(cross) => {
                    ensure!(
                        cross.rules.len() == kernel.cross_rule_count,
                        "{coin}: profile {} has {} cross rules, expected {}",
                        profile.name,
                        cross.rules.len(),
                        kernel.cross_rule_count
                    );
                    for (rule, &expected) in cross.rules.iter().zip(&kernel.cross_tier_seconds) {
                        ensure!(
                            (rule.rule.tier_seconds - expected).abs() < EPS,
                            "{coin}: profile {} cross schedule diverges at {}s",
                            profile.name,
                            expected
                        );
                    }
                    kernel.cross_allowed.push(cross.trade_allowed_time_left);
                    for rule in &cross.rules {
                        kernel.cross.push_rule(&rule.rule);
                        kernel.cross_min_loss.push(rule.min_loss_to_trigger);
                        kernel.cross_min_recovery.push(rule.min_recovery_multiple);
                    }
                }
                None => {
                    kernel.cross_allowed.push(f64::NAN);
                    for _ in 0..kernel.cross_rule_count {
                        kernel.cross.push_rule(&placeholder_rule());
                        kernel.cross_min_loss.push(f64::NAN);
                        kernel.cross_min_recovery.push(f64::NAN);
                    }
                }
            }

            kernel.edge_models.push(config.edge_model.clone());
            kernel.gate_models.push(config.gate_model);
            kernel.size_models.push(config.size_model);
            kernel.loss_governors.push(config.loss_governor);
            kernel.cross_modes.push(config.cross_modes);
            kernel.positions.push(PositionState::new());
            kernel.stats.push(ProfileStats::default());
        }

        Ok(Some(kernel))
    }

    pub fn coin(&self) -> CoinId {
        self.coin
    }

    pub fn profile_count(&self) -> usize {
        self.profile_names.len()
    }

    /// Earliest pending execution across profiles, if any.
    pub fn next_pending_due(&self) -> Option<Millis> {
        self.positions.iter().filter_map(|p| p.pending_due_ms).min()
    }

    /// Per-tick entry point. Returns the earliest pending due time so the
    /// runner can schedule its next step.
    pub fn evaluate(&mut self, snapshot: &MarketState, now: Millis) -> Option<Millis> {
        // 1. Slug change: settle everything against the outgoing market.
        if self.current_slug.as_deref() != Some(snapshot.slug()) {
            if self.current_slug.is_some() {
                let crypto = self.last_crypto_price;
                let threshold = self.last_threshold;
                self.resolve_all(crypto, threshold);
            }
            self.current_slug = Some(snapshot.slug().to_string());
            self.epoch += 1;
        }

        if snapshot.crypto_price > 0.0 {
            self.last_crypto_price = snapshot.crypto_price;
        }
        if snapshot.threshold() > 0.0 {
            self.last_threshold = snapshot.threshold();
        }

        // 2. Pending executions that have come due.
        self.drain_pendings(snapshot, now);

        // 3. Expired market: settle and stop.
        if snapshot.time_left_sec <= 0.0 {
            self.resolve_all(snapshot.crypto_price, snapshot.threshold());
            return None;
        }

        // 4. A decidable snapshot needs a threshold, an underlying price, and
        //    fresh book data.
        let threshold = snapshot.threshold();
        if threshold <= 0.0
            || snapshot.crypto_price <= 0.0
            || snapshot.data_status != DataStatus::Healthy
        {
            return self.next_pending_due();
        }

        // 5.
        let price_diff = (snapshot.crypto_price - threshold).abs();
        let favored_up = snapshot.crypto_price >= threshold;

        // 6.
        self.cross_pass(snapshot, now, price_diff, favored_up);

        // 7.
        self.entry_pass(snapshot, now, price_diff, favored_up);

        // 8.
        self.next_pending_due()
    }

    /// Final summaries; `runtime_sec` is wall-clock measured by the caller.
    pub fn summaries(&self, runtime_sec: f64) -> Vec<ProfileSummary> {
        self.profile_names
            .iter()
            .enumerate()
            .map(|(p, name)| ProfileSummary {
                profile: name.clone(),
                runtime_sec,
                total_trades: self.stats[p].total_trades,
                cross_trades: if self.cross_rule_count > 0 {
                    Some(self.stats[p].cross_trades)
                } else {
                    None
                },
                wins: self.stats[p].wins,
                losses: self.stats[p].losses,
                total_profit: self.stats[p].total_profit,
                open_exposure: if self.positions[p].outcome == Outcome::None {
                    0.0
                } else {
                    self.positions[p].cost
                },
            })
            .collect()
    }

    // -------------------------------------------------------------------
    // Pending execution
    // -------------------------------------------------------------------

    fn drain_pendings(&mut self, snapshot: &MarketState, now: Millis) {
        for p in 0..self.positions.len() {
            let Some(due) = self.positions[p].pending_due_ms else {
                continue;
            };
            if due > now {
                continue;
            }
            let outcome = self.positions[p].pending_outcome;
            let rule_idx = self.positions[p].pending_rule_idx;
            let spend = self.positions[p].pending_spend;
            // One attempt per pending; unfillable means no trade this tier.
            self.positions[p].pending_due_ms = None;

            if self.positions[p].outcome != Outcome::None || outcome == Outcome::None {
                continue;
            }
            let idx = p * self.rule_count + rule_idx;
            let token = snapshot.token_id_for_up(outcome.is_up());
            let Some(book) = snapshot.book(token) else {
                continue;
            };
            let Some(fill) = simulate_buy(
                &book.asks,
                spend,
                self.entry.min_share[idx],
                self.entry.max_share[idx],
                self.entry.min_spend[idx],
            ) else {
                continue;
            };

            let position = &mut self.positions[p];
            position.outcome = outcome;
            position.shares = fill.shares;
            position.cost = fill.cost;
            position.entry_favored_up = outcome.is_up();
            position.market_had_trade = true;
            if !position.market_trade_counted {
                position.market_trade_counted = true;
                self.stats[p].total_trades += 1;
            }
            debug!(
                coin = %self.coin,
                profile = %self.profile_names[p],
                slug = snapshot.slug(),
                outcome = ?outcome,
                shares = fill.shares,
                cost = fill.cost,
                "entry filled"
            );
        }
    }

    // -------------------------------------------------------------------
    // Cross-over pass
    // -------------------------------------------------------------------

    fn cross_pass(&mut self, snapshot: &MarketState, now: Millis, price_diff: f64, favored_up: bool) {
        if self.cross_rule_count == 0 {
            return;
        }
        let time_left = snapshot.time_left_sec;
        let Some(tier) = first_tier(&self.cross_tier_seconds, time_left) else {
            return;
        };

        for p in 0..self.positions.len() {
            let allowed = self.cross_allowed[p];
            if !allowed.is_finite() || time_left > allowed {
                continue;
            }
            let position = &self.positions[p];
            if position.outcome == Outcome::None || position.outcome == Outcome::from_up(favored_up)
            {
                continue;
            }
            if !self.sweep.cross_allow_no_flip && position.entry_favored_up == favored_up {
                continue;
            }

            let idx = p * self.cross_rule_count + tier;
            let overrides = self.mode_overrides(p, time_left);

            let min_diff = self.cross.min_diff[idx] * overrides.min_diff_multiplier;
            if price_diff + EPS < min_diff {
                continue;
            }

            // Exit leg: sell the held side into its bids.
            let held_token = snapshot.token_id_for_up(position.outcome.is_up());
            let Some(held_book) = snapshot.book(held_token) else {
                continue;
            };
            let Some(exit) = simulate_sell(&held_book.bids, position.shares) else {
                continue;
            };
            let realized = exit.proceeds - position.cost;
            if realized >= 0.0 {
                continue;
            }
            if realized.abs() + EPS < self.cross_min_loss[idx] {
                continue;
            }

            // Entry leg gates mirror the entry pass on the cross columns.
            let favored_token = snapshot.token_id_for_up(favored_up);
            let Some(&favored_ask) = snapshot.best_ask.get(favored_token) else {
                continue;
            };
            if favored_ask < self.cross.min_share[idx] || favored_ask > self.cross.max_share[idx] {
                continue;
            }
            if !self.signal_gates_pass(&self.cross, idx, p, snapshot, favored_up) {
                continue;
            }
            if matches!(
                self.edge_for(p, snapshot, price_diff, min_diff, favored_up),
                EdgeOutcome::Rejected
            ) {
                continue;
            }
            if matches!(
                self.gate_for(p, &self.cross, idx, snapshot, favored_up),
                GateOutcome::Blocked
            ) {
                continue;
            }

            let spend_cap = self.cross.max_spend[idx]
                * self.cross.size_scale[idx]
                * overrides.size_multiplier;
            let spend = match self.capped_spend(spend_cap, self.cross.min_spend[idx], self.cross.max_open_exposure[idx]) {
                Some(spend) => spend,
                None => continue,
            };
            let Some(favored_book) = snapshot.book(favored_token) else {
                continue;
            };
            let Some(entry) = simulate_buy(
                &favored_book.asks,
                spend,
                self.cross.min_share[idx],
                self.cross.max_share[idx],
                self.cross.min_spend[idx],
            ) else {
                continue;
            };

            // Recovery gate: projected full-win profit must cover the
            // realised loss by the configured multiple.
            let projected = entry.shares - entry.cost;
            let required = realized.abs()
                * self.cross_min_recovery[idx]
                * overrides.min_recovery_multiplier;
            if projected + EPS < required {
                continue;
            }

            let position = &mut self.positions[p];
            let recross = position.crossed;
            position.realized_pnl += realized;
            position.outcome = Outcome::from_up(favored_up);
            position.shares = entry.shares;
            position.cost = entry.cost;
            position.crossed = true;
            position.market_had_trade = true;
            position.last_decision_ms = now;
            self.stats[p].cross_trades += 1;
            debug!(
                coin = %self.coin,
                profile = %self.profile_names[p],
                slug = snapshot.slug(),
                realized,
                shares = entry.shares,
                cost = entry.cost,
                recross,
                "crossed position"
            );
        }
    }

    fn mode_overrides(&self, profile: usize, time_left: f64) -> CrossModeOverrides {
        match &self.cross_modes[profile] {
            Some(modes) => {
                if time_left <= modes.precision_time_left {
                    modes.precision
                } else {
                    modes.opportunistic
                }
            }
            None => CrossModeOverrides::default(),
        }
    }

    // -------------------------------------------------------------------
    // Entry pass
    // -------------------------------------------------------------------

    fn entry_pass(&mut self, snapshot: &MarketState, now: Millis, price_diff: f64, favored_up: bool) {
        let time_left = snapshot.time_left_sec;
        let Some(tier) = first_tier(&self.tier_seconds, time_left) else {
            return;
        };
        let favored_token = snapshot.token_id_for_up(favored_up);
        let favored_ask = snapshot.best_ask.get(favored_token).copied();

        for p in 0..self.positions.len() {
            if time_left > self.trade_allowed[p] {
                continue;
            }
            let position = &self.positions[p];
            if position.outcome != Outcome::None || position.pending_due_ms.is_some() {
                continue;
            }
            if position.last_decision_ms > 0
                && now - position.last_decision_ms < self.sweep.cooldown_ms
            {
                continue;
            }

            let idx = p * self.rule_count + tier;
            let governed = self.governor_active(p);
            let min_diff = self.entry.min_diff[idx]
                * governed
                    .map(|g| g.loss_min_diff_multiplier)
                    .unwrap_or(1.0);
            if price_diff + EPS < min_diff {
                continue;
            }
            let Some(ask) = favored_ask else { continue };
            if ask < self.entry.min_share[idx] || ask > self.entry.max_share[idx] {
                continue;
            }
            if !self.signal_gates_pass(&self.entry, idx, p, snapshot, favored_up) {
                continue;
            }

            let confidence = self.confidence(snapshot, price_diff, min_diff, favored_up);
            if !self.confidence_gates_pass(idx, confidence) {
                continue;
            }

            let edge = match self.edge_for(p, snapshot, price_diff, min_diff, favored_up) {
                EdgeOutcome::Rejected => continue,
                EdgeOutcome::Score(edge) => edge,
            };
            let gate = match self.gate_for(p, &self.entry, idx, snapshot, favored_up) {
                GateOutcome::Blocked => continue,
                GateOutcome::Multiplier(gate) => gate,
            };

            let spend_base = self.sized_spend(idx, snapshot, price_diff, min_diff, confidence, edge, gate);
            let spend_base = spend_base * governed.map(|g| g.loss_size_scale_multiplier).unwrap_or(1.0);
            let Some(spend) = self.capped_spend(
                spend_base,
                self.entry.min_spend[idx],
                self.entry.max_open_exposure[idx],
            ) else {
                continue;
            };

            let position = &mut self.positions[p];
            position.pending_due_ms = Some(now + self.sweep.latency_base_ms);
            position.pending_outcome = Outcome::from_up(favored_up);
            position.pending_rule_idx = tier;
            position.pending_spend = spend;
            position.last_decision_ms = now;
            debug!(
                coin = %self.coin,
                profile = %self.profile_names[p],
                slug = snapshot.slug(),
                tier,
                spend,
                due = now + self.sweep.latency_base_ms,
                "entry scheduled"
            );
        }
    }

    fn governor_active(&self, profile: usize) -> Option<&LossGovernor> {
        let governor = self.loss_governors[profile].as_ref()?;
        (self.stats[profile].loss_streak > governor.streak_threshold).then_some(governor)
    }

    fn confidence_gates_pass(&self, idx: usize, confidence: Option<f64>) -> bool {
        let mut required = self.entry.min_confidence[idx];
        if self.sweep.force_min_confidence.is_finite() {
            required = if required.is_nan() {
                self.sweep.force_min_confidence
            } else {
                required.max(self.sweep.force_min_confidence)
            };
        }
        if required.is_nan() {
            return true;
        }
        matches!(confidence, Some(c) if c + EPS >= required)
    }

    // -------------------------------------------------------------------
    // Signal gating
    // -------------------------------------------------------------------

    /// Hard binary threshold checks, used when no gate model is configured.
    /// With a gate model the same thresholds become soft penalties inside
    /// `gate_for`, blocking only on missing signals or a product below the
    /// model's floor.
    fn signal_gates_pass(
        &self,
        columns: &RuleColumns,
        idx: usize,
        profile: usize,
        snapshot: &MarketState,
        favored_up: bool,
    ) -> bool {
        if self.gate_models[profile].as_ref().is_some_and(|g| g.enabled) {
            return true;
        }
        let signals = &snapshot.signals;
        threshold_checks(columns, idx, signals, favored_up)
            .all(|(value, threshold, is_min)| match value {
                Some(v) => {
                    if is_min {
                        v + EPS >= threshold
                    } else {
                        v <= threshold + EPS
                    }
                }
                None => false,
            })
    }

    fn gate_for(
        &self,
        profile: usize,
        columns: &RuleColumns,
        idx: usize,
        snapshot: &MarketState,
        favored_up: bool,
    ) -> GateOutcome {
        let Some(gate) = self.gate_models[profile].as_ref().filter(|g| g.enabled) else {
            return GateOutcome::Multiplier(1.0);
        };
        let signals = &snapshot.signals;
        let mut product = 1.0;
        for (value, threshold, is_min) in threshold_checks(columns, idx, signals, favored_up) {
            let Some(value) = value else {
                return GateOutcome::Blocked;
            };
            let ratio = if is_min {
                if threshold <= EPS {
                    1.0
                } else {
                    value / threshold
                }
            } else if value <= threshold + EPS {
                1.0
            } else {
                threshold / value
            };
            product *= ratio.clamp(gate.per_signal_floor, 1.0);
        }
        if product < gate.min_gate_multiplier {
            GateOutcome::Blocked
        } else {
            GateOutcome::Multiplier(product)
        }
    }

    fn edge_for(
        &self,
        profile: usize,
        snapshot: &MarketState,
        price_diff: f64,
        min_diff: f64,
        favored_up: bool,
    ) -> EdgeOutcome {
        let Some(model) = self.edge_models[profile].as_ref().filter(|m| m.enabled) else {
            return EdgeOutcome::Score(None);
        };
        let score = edge_score(
            model,
            &self.signal_config,
            &snapshot.signals,
            snapshot.crypto_price,
            price_diff,
            min_diff,
            favored_up,
        );
        match score {
            None if model.require_signals => EdgeOutcome::Rejected,
            None => EdgeOutcome::Score(None),
            Some(score) => {
                if model.min_score.is_some_and(|min| score + EPS < min) {
                    EdgeOutcome::Rejected
                } else {
                    EdgeOutcome::Score(Some(score))
                }
            }
        }
    }

    /// Confidence estimate for the favoured side, or `None` when too few
    /// signal components are derivable.
    fn confidence(
        &self,
        snapshot: &MarketState,
        price_diff: f64,
        min_diff: f64,
        favored_up: bool,
    ) -> Option<f64> {
        confidence_score(
            &self.signal_config,
            &snapshot.signals,
            snapshot.crypto_price,
            price_diff,
            min_diff,
            favored_up,
        )
    }

    // -------------------------------------------------------------------
    // Sizing
    // -------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn sized_spend(
        &self,
        idx: usize,
        snapshot: &MarketState,
        price_diff: f64,
        min_diff: f64,
        confidence: Option<f64>,
        edge: Option<f64>,
        gate: f64,
    ) -> f64 {
        let profile = idx / self.rule_count;
        let signals = &snapshot.signals;
        let depth = signals.depth_value;
        let max_spend = self.entry.max_spend[idx];

        let base = match SizeStrategy::decode(self.entry.size_strategy[idx]) {
            SizeStrategy::Fixed => 1.0,
            SizeStrategy::Edge => {
                if min_diff <= EPS {
                    1.0
                } else {
                    (price_diff / min_diff).clamp(0.5, 2.0)
                }
            }
            SizeStrategy::Depth => {
                let depth = depth.unwrap_or(0.0);
                if max_spend <= EPS {
                    0.5
                } else {
                    (depth / max_spend).clamp(0.5, 2.0)
                }
            }
            SizeStrategy::Confidence => (0.5 + 0.5 * confidence.unwrap_or(0.0)).clamp(0.5, 1.0),
        };

        let mut factor = base;
        if let (Some(model), Some(edge)) = (self.size_models[profile].as_ref(), edge) {
            factor *= edge.powf(model.gamma).clamp(model.min_floor, model.max_ceil);
            if model.confidence_blend {
                if let Some(confidence) = confidence {
                    factor *= 0.5 + 0.5 * confidence;
                }
            }
            if let Some(depth) = depth {
                if max_spend > EPS {
                    factor *= (depth / max_spend).clamp(0.5, 1.5);
                }
            }
            if let Some(spread) = signals.spread {
                factor *= (1.0 - spread / self.signal_config.spread_full_scale).clamp(0.5, 1.0);
            }
            if model.apply_gate_multiplier {
                factor *= gate;
            }
        }

        max_spend * self.entry.size_scale[idx] * factor
    }

    /// Clamp a spend to the rule's exposure cap; below the minimum spend the
    /// entry is not viable.
    fn capped_spend(&self, spend: f64, min_spend: f64, exposure_cap: f64) -> Option<f64> {
        let mut spend = spend.max(min_spend);
        if exposure_cap.is_finite() {
            if min_spend > exposure_cap + EPS {
                return None;
            }
            spend = spend.min(exposure_cap);
        }
        (spend > EPS).then_some(spend)
    }

    // -------------------------------------------------------------------
    // Terminal resolution
    // -------------------------------------------------------------------

    fn resolve_all(&mut self, crypto_price: f64, threshold: f64) {
        for p in 0..self.positions.len() {
            if self.positions[p].last_resolved_epoch == self.epoch {
                continue;
            }
            let winner_up = crypto_price >= threshold;
            let position = &mut self.positions[p];

            if position.outcome != Outcome::None {
                if position.outcome == Outcome::from_up(winner_up) {
                    position.realized_pnl += position.shares - position.cost;
                } else {
                    position.realized_pnl -= position.cost;
                }
            }

            let realized = position.realized_pnl;
            let traded = position.market_had_trade;
            position.clear_market_fields();
            position.last_resolved_epoch = self.epoch;

            if traded {
                let stats = &mut self.stats[p];
                stats.total_profit += realized;
                if realized > 0.0 {
                    stats.wins += 1;
                    stats.loss_streak = 0;
                } else if realized < 0.0 {
                    stats.losses += 1;
                    stats.loss_streak += 1;
                }
                debug!(
                    coin = %self.coin,
                    profile = %self.profile_names[p],
                    realized,
                    total_profit = stats.total_profit,
                    "market resolved"
                );
            }
        }
    }
}

enum GateOutcome {
    Blocked,
    Multiplier(f64),
}

enum EdgeOutcome {
    Rejected,
    Score(Option<f64>),
}

/// First tier whose bound covers the remaining time, on an ascending
/// schedule.
fn first_tier(tier_seconds: &[f64], time_left: f64) -> Option<usize> {
    tier_seconds.iter().position(|&t| t + EPS >= time_left)
}

fn placeholder_rule() -> TierRule {
    TierRule {
        tier_seconds: f64::NAN,
        minimum_price_difference: f64::NAN,
        minimum_share_price: f64::NAN,
        maximum_share_price: f64::NAN,
        minimum_spend: f64::NAN,
        maximum_spend: f64::NAN,
        size_scale: f64::NAN,
        size_strategy: SizeStrategy::Fixed,
        max_spread: None,
        min_book_imbalance: None,
        min_trade_velocity: None,
        min_momentum: None,
        max_volatility: None,
        max_staleness_sec: None,
        min_flow_imbalance: None,
        min_confidence: None,
        max_open_exposure: None,
    }
}

/// Iterate the (signal value, threshold, is-min-threshold) triples for every
/// threshold present on the rule at `idx`. Momentum and flow are aligned to
/// the favoured side before comparison.
fn threshold_checks<'a>(
    columns: &'a RuleColumns,
    idx: usize,
    signals: &'a MarketSignals,
    favored_up: bool,
) -> impl Iterator<Item = (Option<f64>, f64, bool)> + 'a {
    let align = move |value: Option<f64>| value.map(|v| if favored_up { v } else { -v });
    [
        (signals.spread, columns.max_spread[idx], false),
        (signals.book_imbalance, columns.min_imbalance[idx], true),
        (Some(signals.trade_velocity), columns.min_velocity[idx], true),
        (align(signals.price_momentum), columns.min_momentum[idx], true),
        (signals.price_volatility, columns.max_volatility[idx], false),
        (signals.price_staleness_sec, columns.max_staleness[idx], false),
        (
            align(signals.trade_flow_imbalance),
            columns.min_flow[idx],
            true,
        ),
    ]
    .into_iter()
    .filter(|(_, threshold, _)| !threshold.is_nan())
}

/// Weighted-mean confidence over the normalised signal scores.
pub fn confidence_score(
    config: &SignalConfig,
    signals: &MarketSignals,
    crypto_price: f64,
    price_diff: f64,
    min_diff: f64,
    favored_up: bool,
) -> Option<f64> {
    let mut weighted = 0.0;
    let mut weight_total = 0.0;
    let mut components = 0usize;
    let mut add = |score: Option<f64>, weight: f64| {
        if let Some(score) = score {
            weighted += score.clamp(0.0, 1.0) * weight;
            weight_total += weight;
            components += 1;
        }
    };

    add(
        signals
            .spread
            .map(|s| (1.0 - s / config.spread_full_scale).clamp(0.0, 1.0)),
        0.15,
    );
    add(signals.book_imbalance, 0.25);
    add(signals.trade_flow_imbalance.map(|f| 0.5 * (1.0 + f)), 0.20);
    add(
        signals.price_momentum.map(|m| {
            let aligned = if favored_up { m } else { -m };
            let norm_scale = config.momentum_norm_per_sec * crypto_price.max(EPS);
            let norm = (aligned / norm_scale).clamp(-1.0, 1.0);
            0.5 * (1.0 + norm)
        }),
        0.25,
    );
    add(
        signals
            .price_staleness_sec
            .map(|s| (1.0 - s / CONFIDENCE_STALENESS_RAMP_SEC).clamp(0.0, 1.0)),
        0.10,
    );
    add(Some(signals.reference_quality), 0.05);

    if components < CONFIDENCE_MIN_COMPONENTS || weight_total <= EPS {
        return None;
    }
    let mut score = weighted / weight_total;

    if min_diff > EPS {
        score *= (price_diff / min_diff).clamp(0.5, 1.5);
    }
    if let Some(staleness) = signals.price_staleness_sec {
        score *= (-staleness / CONFIDENCE_DECAY_TAU_SEC).exp().clamp(0.5, 1.0);
    }
    Some(score.clamp(0.0, 1.0))
}

/// Configurable-weight edge score in [0, 1]; the soft rank behind entry
/// sizing and the `minScore` rejection gate.
pub fn edge_score(
    model: &EdgeModel,
    config: &SignalConfig,
    signals: &MarketSignals,
    crypto_price: f64,
    price_diff: f64,
    min_diff: f64,
    favored_up: bool,
) -> Option<f64> {
    let caps = &model.caps;
    let weights = &model.weights;
    let mut weighted = 0.0;
    let mut weight_total = 0.0;
    let mut missing = false;
    let mut add = |score: Option<f64>, weight: f64| match score {
        Some(score) => {
            weighted += score.clamp(0.0, 1.0) * weight;
            weight_total += weight;
        }
        None => missing = true,
    };

    let capped = |ratio: f64, cap: f64| {
        if cap <= EPS {
            0.0
        } else {
            ratio.min(cap).max(0.0) / cap
        }
    };

    let gap_ratio = if min_diff > EPS { price_diff / min_diff } else { caps.gap };
    add(Some(capped(gap_ratio, caps.gap)), weights.gap);
    add(
        signals
            .depth_value
            .map(|d| capped(d / config.slippage_notional.max(EPS), caps.depth)),
        weights.depth,
    );
    add(signals.book_imbalance, weights.imbalance);
    add(
        Some(capped(
            signals.trade_velocity / config.velocity_norm.max(EPS),
            caps.velocity,
        )),
        weights.velocity,
    );
    add(
        signals.price_momentum.map(|m| {
            let aligned = if favored_up { m } else { -m };
            let norm_scale = config.momentum_norm_per_sec * crypto_price.max(EPS);
            capped((aligned / norm_scale).max(0.0), caps.momentum)
        }),
        weights.momentum,
    );
    add(
        signals
            .price_volatility
            .map(|v| capped(price_diff / v.max(EPS), caps.volatility)),
        weights.volatility,
    );
    add(
        signals
            .spread
            .map(|s| capped((1.0 - s / config.spread_full_scale).clamp(0.0, 1.0), caps.spread)),
        weights.spread,
    );
    add(Some(signals.reference_quality), weights.reference);

    if missing && model.require_signals {
        return None;
    }
    if weight_total <= EPS {
        return None;
    }
    let mut score = weighted / weight_total;
    if let Some(staleness) = signals.price_staleness_sec {
        if model.staleness_tau_sec > EPS {
            score *= (-staleness / model.staleness_tau_sec).exp();
        }
    }
    Some(score.clamp(0.0, 1.0))
}

