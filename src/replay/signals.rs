//! Derived Market Signals
//!
//! Pure functions from one market state's windows to the signal block the
//! decision kernel consumes. Book-derived components are computed on the
//! favoured outcome token; flow is sign-aligned at the kernel, not here.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::replay::book::OrderBookSnapshot;
use crate::replay::types::{Millis, ReferenceSource, Side, Tick, TradeEvent, MILLIS_PER_SEC};

/// Tuning for signal derivation.
#[derive(Debug, Clone, Copy)]
pub struct SignalConfig {
    /// Book levels counted for imbalance and depth.
    pub depth_levels: usize,
    /// Notional scale for depth normalisation in the edge model.
    pub slippage_notional: f64,
    /// Recent-trade window width.
    pub trade_window_ms: Millis,
    /// Price-history entries considered for momentum.
    pub momentum_window: usize,
    /// Spread at which the inverse spread score reaches zero.
    pub spread_full_scale: f64,
    /// Momentum normaliser: fraction of the underlying price per second.
    pub momentum_norm_per_sec: f64,
    /// Trade velocity considered "busy" (trades per second).
    pub velocity_norm: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            depth_levels: 3,
            slippage_notional: 50.0,
            trade_window_ms: 300_000,
            momentum_window: 30,
            spread_full_scale: 0.10,
            momentum_norm_per_sec: 0.0005,
            velocity_norm: 0.2,
        }
    }
}

/// Signal block computed per evaluation. `None` means not derivable from the
/// data at hand; the gate model treats that as a hard block for any rule
/// thresholding on it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketSignals {
    pub spread: Option<f64>,
    /// Bid-side share of top-N notional on the favoured token, in [0, 1].
    pub book_imbalance: Option<f64>,
    /// Top-N ask-side notional on the favoured token (buyable depth).
    pub depth_value: Option<f64>,
    /// Recent trades per second across the market.
    pub trade_velocity: f64,
    /// Signed underlying-price slope, units per second.
    pub price_momentum: Option<f64>,
    /// Underlying price range across the history window.
    pub price_volatility: Option<f64>,
    pub price_staleness_sec: Option<f64>,
    /// (BUY - SELL) notional over total, favoured token, in [-1, 1].
    pub trade_flow_imbalance: Option<f64>,
    /// Presence-weighted reference quality in [0, 1].
    pub reference_quality: f64,
}

/// Compute the signal block for the favoured token of one market state.
#[allow(clippy::too_many_arguments)]
pub fn compute_signals(
    config: &SignalConfig,
    favored_book: Option<&OrderBookSnapshot>,
    price_history: &VecDeque<Tick>,
    recent_trades: &[TradeEvent],
    favored_token: &str,
    crypto_price_timestamp: Millis,
    reference_source: ReferenceSource,
    now: Millis,
) -> MarketSignals {
    let mut signals = MarketSignals {
        reference_quality: reference_source.quality(),
        ..MarketSignals::default()
    };

    if let Some(book) = favored_book {
        signals.spread = book.spread();
        let bid_value = book.bid_value_top(config.depth_levels);
        let ask_value = book.ask_value_top(config.depth_levels);
        if bid_value + ask_value > 0.0 {
            signals.book_imbalance = Some(bid_value / (bid_value + ask_value));
        }
        if !book.asks.is_empty() {
            signals.depth_value = Some(ask_value);
        }
    }

    let window_sec = config.trade_window_ms as f64 / MILLIS_PER_SEC as f64;
    if window_sec > 0.0 {
        signals.trade_velocity = recent_trades.len() as f64 / window_sec;
    }

    let mut buy_notional = 0.0;
    let mut sell_notional = 0.0;
    for trade in recent_trades.iter().filter(|t| t.token_id == favored_token) {
        let notional = trade.price * trade.size;
        match trade.side {
            Some(Side::Buy) => buy_notional += notional,
            Some(Side::Sell) => sell_notional += notional,
            None => {}
        }
    }
    if buy_notional + sell_notional > 0.0 {
        signals.trade_flow_imbalance =
            Some((buy_notional - sell_notional) / (buy_notional + sell_notional));
    }

    signals.price_momentum = momentum(price_history, config.momentum_window);
    signals.price_volatility = volatility(price_history);

    if crypto_price_timestamp > 0 {
        signals.price_staleness_sec =
            Some((now - crypto_price_timestamp).max(0) as f64 / MILLIS_PER_SEC as f64);
    }

    signals
}

/// Signed slope of the trailing `window` history entries, units per second.
fn momentum(history: &VecDeque<Tick>, window: usize) -> Option<f64> {
    if history.len() < 2 {
        return None;
    }
    let start = history.len().saturating_sub(window.max(2));
    let first = history[start];
    let last = history[history.len() - 1];
    let span_sec = (last.timestamp - first.timestamp) as f64 / MILLIS_PER_SEC as f64;
    if span_sec <= 0.0 {
        return None;
    }
    Some((last.value - first.value) / span_sec)
}

/// Range of the history window.
fn volatility(history: &VecDeque<Tick>) -> Option<f64> {
    if history.len() < 2 {
        return None;
    }
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for tick in history {
        lo = lo.min(tick.value);
        hi = hi.max(tick.value);
    }
    Some(hi - lo)
}
