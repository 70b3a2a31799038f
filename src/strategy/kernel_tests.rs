//! Behavioural tests for the decision kernel: entry scheduling and fills,
//! cross-overs, trade counting, governors, and terminal resolution.

use crate::replay::config::SweepEnv;
use crate::replay::signals::SignalConfig;
use crate::replay::state::MarketState;
use crate::replay::types::{CoinId, MakerOrder, MarketMeta, Millis, Side, Tick, TradeEvent};
use crate::strategy::kernel::CoinKernel;
use crate::strategy::profile::{
    CrossConfig, CrossRule, EdgeModel, GateModel, LossGovernor, Profile, TierRule,
    TimedTradeConfig,
};
use std::collections::HashMap;

fn meta(slug: &str, start_ms: Millis, end_ms: Millis) -> MarketMeta {
    MarketMeta {
        slug: slug.into(),
        coin: CoinId::Btc,
        start_ms,
        end_ms,
        up_token_id: "up".into(),
        down_token_id: "down".into(),
        market_name: None,
    }
}

fn base_rule() -> TierRule {
    TierRule {
        tier_seconds: 1_000.0,
        minimum_price_difference: 0.0,
        minimum_share_price: 0.0,
        maximum_share_price: 1.0,
        minimum_spend: 1.0,
        maximum_spend: 10.0,
        size_scale: 1.0,
        size_strategy: crate::strategy::profile::SizeStrategy::Fixed,
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

fn profile_of(name: &str, config: TimedTradeConfig) -> Profile {
    Profile {
        name: name.into(),
        coins: HashMap::from([(CoinId::Btc, config)]),
    }
}

fn simple_profile(name: &str, rule: TierRule) -> Profile {
    profile_of(
        name,
        TimedTradeConfig {
            trade_allowed_time_left: 1_000.0,
            rules: vec![rule],
            cross: None,
            edge_model: None,
            gate_model: None,
            size_model: None,
            loss_governor: None,
            cross_modes: None,
        },
    )
}

fn cross_profile(name: &str) -> Profile {
    profile_of(
        name,
        TimedTradeConfig {
            trade_allowed_time_left: 1_000.0,
            rules: vec![base_rule()],
            cross: Some(CrossConfig {
                trade_allowed_time_left: 1_000.0,
                rules: vec![CrossRule {
                    rule: base_rule(),
                    min_loss_to_trigger: 0.0,
                    min_recovery_multiple: 0.0,
                }],
            }),
            edge_model: None,
            gate_model: None,
            size_model: None,
            loss_governor: None,
            cross_modes: None,
        },
    )
}

fn sweep() -> SweepEnv {
    SweepEnv::default()
}

fn kernel_for(profiles: &[Profile]) -> CoinKernel {
    CoinKernel::new(CoinId::Btc, profiles, sweep(), SignalConfig::default())
        .unwrap()
        .unwrap()
}

fn maker(token: &str, side: Side, price: f64, size: f64) -> MakerOrder {
    MakerOrder {
        price,
        size,
        side,
        token_id: token.into(),
    }
}

fn book_trade(timestamp: Millis, makers: Vec<MakerOrder>) -> TradeEvent {
    TradeEvent {
        timestamp,
        token_id: "up".into(),
        price: 0.40,
        size: 10.0,
        side: Some(Side::Buy),
        trade_id: None,
        taker_order_id: None,
        bucket_index: None,
        maker_orders: Some(makers),
    }
}

/// Market [1000, 2000], first tick 100 fixes the reference, plus an up-token
/// ask ladder at 0.40.
fn entry_ready_state(slug: &str) -> MarketState {
    let mut state = MarketState::new(meta(slug, 1_000, 2_000), 1_000, 0);
    state.apply_tick(Tick { timestamp: 1_100, value: 100.0 }, 1_100);
    state.apply_trade(
        book_trade(1_100, vec![maker("up", Side::Sell, 0.40, 100.0)]),
        1_100,
    );
    state
}

fn eval_at(kernel: &mut CoinKernel, state: &mut MarketState, now: Millis) -> Option<Millis> {
    state.update_derived(now, &SignalConfig::default());
    kernel.evaluate(state, now)
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

#[test]
fn test_rule_count_mismatch_is_fatal() {
    let a = simple_profile("a", base_rule());
    let mut two_tier = base_rule();
    two_tier.tier_seconds = 500.0;
    let b = profile_of(
        "b",
        TimedTradeConfig {
            trade_allowed_time_left: 1_000.0,
            rules: vec![two_tier, base_rule()],
            cross: None,
            edge_model: None,
            gate_model: None,
            size_model: None,
            loss_governor: None,
            cross_modes: None,
        },
    );
    assert!(CoinKernel::new(CoinId::Btc, &[a, b], sweep(), SignalConfig::default()).is_err());
}

#[test]
fn test_tier_schedule_mismatch_is_fatal() {
    let a = simple_profile("a", base_rule());
    let mut other = base_rule();
    other.tier_seconds = 700.0;
    let b = simple_profile("b", other);
    assert!(CoinKernel::new(CoinId::Btc, &[a, b], sweep(), SignalConfig::default()).is_err());
}

#[test]
fn test_unconfigured_coin_yields_no_kernel() {
    let profile = Profile {
        name: "ethonly".into(),
        coins: HashMap::new(),
    };
    let kernel = CoinKernel::new(CoinId::Btc, &[profile], sweep(), SignalConfig::default()).unwrap();
    assert!(kernel.is_none());
}

// ---------------------------------------------------------------------------
// Entry, fill, resolution
// ---------------------------------------------------------------------------

#[test]
fn test_entry_fill_and_winning_resolution() {
    let mut kernel = kernel_for(&[simple_profile("p", base_rule())]);
    let mut state = entry_ready_state("m1");

    // Decision at 1100 schedules execution one latency-base later.
    let pending = eval_at(&mut kernel, &mut state, 1_100);
    assert_eq!(pending, Some(1_115));
    assert_eq!(kernel.next_pending_due(), Some(1_115));

    // Fill at 1115: 10 spend at 0.40 = 25 shares.
    let pending = eval_at(&mut kernel, &mut state, 1_115);
    assert_eq!(pending, None);

    // Terminal tick moves the underlying above the reference.
    state.apply_tick(Tick { timestamp: 1_900, value: 110.0 }, 1_900);
    eval_at(&mut kernel, &mut state, 1_900);

    // Expiry: up wins, P&L = 25 - 10 = +15.
    eval_at(&mut kernel, &mut state, 2_000);
    let summary = &kernel.summaries(0.0)[0];
    assert_eq!(summary.total_trades, 1);
    assert_eq!(summary.wins, 1);
    assert_eq!(summary.losses, 0);
    assert!((summary.total_profit - 15.0).abs() < 1e-9);
    assert_eq!(summary.open_exposure, 0.0);
}

#[test]
fn test_losing_resolution() {
    let mut kernel = kernel_for(&[simple_profile("p", base_rule())]);
    let mut state = entry_ready_state("m1");

    eval_at(&mut kernel, &mut state, 1_100);
    eval_at(&mut kernel, &mut state, 1_115);
    state.apply_tick(Tick { timestamp: 1_900, value: 90.0 }, 1_900);
    eval_at(&mut kernel, &mut state, 2_000);

    let summary = &kernel.summaries(0.0)[0];
    assert_eq!(summary.losses, 1);
    assert!((summary.total_profit + 10.0).abs() < 1e-9);
}

#[test]
fn test_share_price_band_splits_profiles() {
    let mut strict = base_rule();
    strict.minimum_share_price = 0.50;
    let profiles = [simple_profile("strict", strict), simple_profile("loose", base_rule())];
    let mut kernel = kernel_for(&profiles);
    let mut state = entry_ready_state("m1");

    eval_at(&mut kernel, &mut state, 1_100);
    eval_at(&mut kernel, &mut state, 1_115);
    eval_at(&mut kernel, &mut state, 2_000);

    let summaries = kernel.summaries(0.0);
    let strict = summaries.iter().find(|s| s.profile == "strict").unwrap();
    let loose = summaries.iter().find(|s| s.profile == "loose").unwrap();
    assert_eq!(strict.total_trades, 0);
    assert_eq!(loose.total_trades, 1);
}

#[test]
fn test_no_entry_without_book_data() {
    let mut kernel = kernel_for(&[simple_profile("p", base_rule())]);
    // Tick only: data status never becomes healthy.
    let mut state = MarketState::new(meta("m1", 1_000, 2_000), 1_000, 0);
    state.apply_tick(Tick { timestamp: 1_100, value: 100.0 }, 1_100);

    assert_eq!(eval_at(&mut kernel, &mut state, 1_100), None);
    assert_eq!(kernel.next_pending_due(), None);
}

#[test]
fn test_unfillable_pending_and_cooldown() {
    let mut kernel = kernel_for(&[simple_profile("p", base_rule())]);
    // Ask ladder too thin to reach the minimum spend.
    let mut state = MarketState::new(meta("m1", 1_000, 2_000), 1_000, 0);
    state.apply_tick(Tick { timestamp: 1_100, value: 100.0 }, 1_100);
    state.apply_trade(
        book_trade(1_100, vec![maker("up", Side::Sell, 0.40, 1.0)]),
        1_100,
    );

    assert_eq!(eval_at(&mut kernel, &mut state, 1_100), Some(1_115));
    // Fill attempt: 0.40 notional available < min_spend 1.0; pending cleared.
    assert_eq!(eval_at(&mut kernel, &mut state, 1_115), None);

    // Within the 200ms decision cooldown: no re-entry.
    assert_eq!(eval_at(&mut kernel, &mut state, 1_200), None);
    // After the cooldown the profile tries again.
    assert_eq!(eval_at(&mut kernel, &mut state, 1_301), Some(1_316));
}

#[test]
fn test_pending_is_not_rescheduled() {
    let mut kernel = kernel_for(&[simple_profile("p", base_rule())]);
    let mut state = entry_ready_state("m1");

    assert_eq!(eval_at(&mut kernel, &mut state, 1_100), Some(1_115));
    // Re-evaluating before the due time keeps the original pending.
    assert_eq!(eval_at(&mut kernel, &mut state, 1_110), Some(1_115));
}

#[test]
fn test_open_exposure_caps_spend() {
    let mut rule = base_rule();
    rule.max_open_exposure = Some(5.0);
    let mut kernel = kernel_for(&[simple_profile("p", rule)]);
    let mut state = entry_ready_state("m1");

    eval_at(&mut kernel, &mut state, 1_100);
    eval_at(&mut kernel, &mut state, 1_115);
    state.apply_tick(Tick { timestamp: 1_900, value: 110.0 }, 1_900);
    eval_at(&mut kernel, &mut state, 2_000);

    // 5 spend at 0.40 = 12.5 shares, P&L 12.5 - 5 = 7.5.
    let summary = &kernel.summaries(0.0)[0];
    assert!((summary.total_profit - 7.5).abs() < 1e-9);
}

// ---------------------------------------------------------------------------
// Cross-over
// ---------------------------------------------------------------------------

/// Two-sided books on both tokens so both cross legs can transact.
fn crossable_state(slug: &str) -> MarketState {
    let mut state = MarketState::new(meta(slug, 1_000, 2_000), 1_000, 0);
    state.apply_tick(Tick { timestamp: 1_100, value: 100.0 }, 1_100);
    state.apply_trade(
        book_trade(
            1_100,
            vec![
                maker("up", Side::Sell, 0.40, 100.0),
                maker("up", Side::Buy, 0.35, 100.0),
                maker("down", Side::Sell, 0.55, 100.0),
                maker("down", Side::Buy, 0.30, 100.0),
            ],
        ),
        1_100,
    );
    state
}

#[test]
fn test_cross_exits_loss_and_reenters_favored() {
    let mut kernel = kernel_for(&[cross_profile("p")]);
    let mut state = crossable_state("m1");

    eval_at(&mut kernel, &mut state, 1_100);
    eval_at(&mut kernel, &mut state, 1_115); // filled: up, 25 shares, cost 10

    // Favoured side flips to down.
    state.apply_tick(Tick { timestamp: 1_200, value: 85.0 }, 1_200);
    eval_at(&mut kernel, &mut state, 1_200);

    // Down stays the winner at expiry.
    eval_at(&mut kernel, &mut state, 2_000);

    let summary = &kernel.summaries(0.0)[0];
    assert_eq!(summary.cross_trades, Some(1));
    // The cross re-entry does not double-count the market's trade.
    assert_eq!(summary.total_trades, 1);
    // Exit: 25 shares into 0.35 bids = 8.75, realized -1.25.
    // Entry: 10 spend at 0.55 = 18.1818... shares; win pays shares - cost.
    let entry_shares = 10.0 / 0.55;
    let expected = -1.25 + (entry_shares - 10.0);
    assert!((summary.total_profit - expected).abs() < 1e-9);
    assert_eq!(summary.wins, 1);
}

#[test]
fn test_cross_requires_realized_loss() {
    let mut kernel = kernel_for(&[cross_profile("p")]);
    let mut state = MarketState::new(meta("m1", 1_000, 2_000), 1_000, 0);
    state.apply_tick(Tick { timestamp: 1_100, value: 100.0 }, 1_100);
    // Up bids above the entry cost basis: exiting would be profitable, so
    // the cross must not trigger.
    state.apply_trade(
        book_trade(
            1_100,
            vec![
                maker("up", Side::Sell, 0.40, 100.0),
                maker("up", Side::Buy, 0.50, 100.0),
                maker("down", Side::Sell, 0.55, 100.0),
            ],
        ),
        1_100,
    );

    eval_at(&mut kernel, &mut state, 1_100);
    eval_at(&mut kernel, &mut state, 1_115);
    state.apply_tick(Tick { timestamp: 1_200, value: 85.0 }, 1_200);
    eval_at(&mut kernel, &mut state, 1_200);

    let summary = &kernel.summaries(0.0)[0];
    assert_eq!(summary.cross_trades, Some(0));
}

#[test]
fn test_cross_recovery_multiple_gate() {
    let mut profile = cross_profile("p");
    let config = profile.coins.get_mut(&CoinId::Btc).unwrap();
    // Projected profit must cover 10x the realized loss; entry of ~8.18
    // projected vs 12.5 required fails.
    config.cross.as_mut().unwrap().rules[0].min_recovery_multiple = 10.0;
    let mut kernel = kernel_for(&[profile]);
    let mut state = crossable_state("m1");

    eval_at(&mut kernel, &mut state, 1_100);
    eval_at(&mut kernel, &mut state, 1_115);
    state.apply_tick(Tick { timestamp: 1_200, value: 85.0 }, 1_200);
    eval_at(&mut kernel, &mut state, 1_200);

    assert_eq!(kernel.summaries(0.0)[0].cross_trades, Some(0));
}

// ---------------------------------------------------------------------------
// Governors and gates
// ---------------------------------------------------------------------------

#[test]
fn test_loss_governor_tightens_entries() {
    let mut rule = base_rule();
    rule.minimum_price_difference = 10.0;
    let mut profile = simple_profile("p", rule);
    profile
        .coins
        .get_mut(&CoinId::Btc)
        .unwrap()
        .loss_governor = Some(LossGovernor {
        streak_threshold: 0,
        loss_min_diff_multiplier: 2.0,
        loss_size_scale_multiplier: 0.5,
    });
    let mut kernel = kernel_for(&[profile]);

    // Market 1: enter (diff 15 >= 10) and lose.
    let mut state = entry_ready_state("m1");
    state.apply_tick(Tick { timestamp: 1_150, value: 115.0 }, 1_150);
    eval_at(&mut kernel, &mut state, 1_150);
    eval_at(&mut kernel, &mut state, 1_165);
    state.apply_tick(Tick { timestamp: 1_900, value: 90.0 }, 1_900);
    eval_at(&mut kernel, &mut state, 2_000);
    assert_eq!(kernel.summaries(0.0)[0].losses, 1);

    // Market 2: diff 15 no longer clears the governed bar of 20.
    let mut state = entry_ready_state("m2");
    state.apply_tick(Tick { timestamp: 1_150, value: 115.0 }, 1_150);
    assert_eq!(eval_at(&mut kernel, &mut state, 1_150), None);

    // Diff 25 does.
    state.apply_tick(Tick { timestamp: 1_400, value: 125.0 }, 1_400);
    assert!(eval_at(&mut kernel, &mut state, 1_400).is_some());
}

#[test]
fn test_gate_model_soft_thresholds() {
    // Spread 0.05 vs threshold 0.01: penalty clamps to the 0.5 floor.
    let mut rule = base_rule();
    rule.max_spread = Some(0.01);

    let strict_gate = GateModel {
        enabled: true,
        per_signal_floor: 0.5,
        min_gate_multiplier: 0.9,
    };
    let lenient_gate = GateModel {
        min_gate_multiplier: 0.4,
        ..strict_gate
    };

    for (gate, expect_entry) in [(strict_gate, false), (lenient_gate, true)] {
        let mut profile = simple_profile("p", rule.clone());
        profile.coins.get_mut(&CoinId::Btc).unwrap().gate_model = Some(gate);
        let mut kernel = kernel_for(&[profile]);

        let mut state = MarketState::new(meta("m1", 1_000, 2_000), 1_000, 0);
        state.apply_tick(Tick { timestamp: 1_100, value: 100.0 }, 1_100);
        state.apply_trade(
            book_trade(
                1_100,
                vec![
                    maker("up", Side::Sell, 0.45, 100.0),
                    maker("up", Side::Buy, 0.40, 100.0),
                ],
            ),
            1_100,
        );
        let scheduled = eval_at(&mut kernel, &mut state, 1_100).is_some();
        assert_eq!(scheduled, expect_entry);
    }
}

#[test]
fn test_hard_thresholds_without_gate_model() {
    let mut rule = base_rule();
    rule.max_spread = Some(0.01);
    let mut kernel = kernel_for(&[simple_profile("p", rule)]);

    let mut state = MarketState::new(meta("m1", 1_000, 2_000), 1_000, 0);
    state.apply_tick(Tick { timestamp: 1_100, value: 100.0 }, 1_100);
    state.apply_trade(
        book_trade(
            1_100,
            vec![
                maker("up", Side::Sell, 0.45, 100.0),
                maker("up", Side::Buy, 0.40, 100.0),
            ],
        ),
        1_100,
    );
    // Spread 0.05 > 0.01 is a hard reject without a gate model.
    assert_eq!(eval_at(&mut kernel, &mut state, 1_100), None);
}

#[test]
fn test_forced_min_confidence_blocks_entries() {
    let mut env = SweepEnv::default();
    env.force_min_confidence = 0.99;
    let mut kernel = CoinKernel::new(
        CoinId::Btc,
        &[simple_profile("p", base_rule())],
        env,
        SignalConfig::default(),
    )
    .unwrap()
    .unwrap();
    let mut state = entry_ready_state("m1");
    assert_eq!(eval_at(&mut kernel, &mut state, 1_100), None);
}

#[test]
fn test_edge_min_score_rejects() {
    let mut profile = simple_profile("p", base_rule());
    profile.coins.get_mut(&CoinId::Btc).unwrap().edge_model = Some(EdgeModel {
        min_score: Some(0.99),
        ..EdgeModel::default()
    });
    let mut kernel = kernel_for(&[profile]);
    let mut state = entry_ready_state("m1");
    assert_eq!(eval_at(&mut kernel, &mut state, 1_100), None);

    let mut profile = simple_profile("p", base_rule());
    profile.coins.get_mut(&CoinId::Btc).unwrap().edge_model = Some(EdgeModel {
        min_score: Some(0.01),
        ..EdgeModel::default()
    });
    let mut kernel = kernel_for(&[profile]);
    let mut state = entry_ready_state("m1");
    assert!(eval_at(&mut kernel, &mut state, 1_100).is_some());
}

// ---------------------------------------------------------------------------
// Resolution edge cases
// ---------------------------------------------------------------------------

#[test]
fn test_resolution_is_idempotent_within_epoch() {
    let mut kernel = kernel_for(&[simple_profile("p", base_rule())]);
    let mut state = entry_ready_state("m1");

    eval_at(&mut kernel, &mut state, 1_100);
    eval_at(&mut kernel, &mut state, 1_115);
    state.apply_tick(Tick { timestamp: 1_900, value: 110.0 }, 1_900);
    eval_at(&mut kernel, &mut state, 2_000);
    eval_at(&mut kernel, &mut state, 2_000);
    eval_at(&mut kernel, &mut state, 2_001);

    let summary = &kernel.summaries(0.0)[0];
    assert_eq!(summary.wins, 1);
    assert!((summary.total_profit - 15.0).abs() < 1e-9);
}

#[test]
fn test_slug_change_resolves_outgoing_market() {
    let mut kernel = kernel_for(&[simple_profile("p", base_rule())]);
    let mut state = entry_ready_state("m1");

    eval_at(&mut kernel, &mut state, 1_100);
    eval_at(&mut kernel, &mut state, 1_115);
    state.apply_tick(Tick { timestamp: 1_900, value: 110.0 }, 1_900);
    eval_at(&mut kernel, &mut state, 1_900);

    // The next market's snapshot arrives without an explicit expiry pass.
    let mut successor = entry_ready_state("m2");
    eval_at(&mut kernel, &mut successor, 2_100);

    let summary = &kernel.summaries(0.0)[0];
    // Outgoing market resolved with the last observed price/threshold.
    assert_eq!(summary.wins, 1);
    assert!((summary.total_profit - 15.0).abs() < 1e-9);
}

#[test]
fn test_untraded_market_contributes_nothing() {
    let mut kernel = kernel_for(&[simple_profile("p", base_rule())]);
    let mut state = MarketState::new(meta("m1", 1_000, 2_000), 1_000, 0);
    state.apply_tick(Tick { timestamp: 1_100, value: 100.0 }, 1_100);

    eval_at(&mut kernel, &mut state, 1_100);
    eval_at(&mut kernel, &mut state, 2_000);

    let summary = &kernel.summaries(0.0)[0];
    assert_eq!(summary.total_trades, 0);
    assert_eq!(summary.wins + summary.losses, 0);
    assert_eq!(summary.total_profit, 0.0);
}
