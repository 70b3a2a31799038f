//! Per-Market Replay State
//!
//! One `MarketState` exists per coin with an active market. The scheduler
//! owns creation/mutation; the decision kernel only reads snapshots (and
//! performs resolution through its own bookkeeping). Invariants:
//!
//! - `price_history` holds at most 180 ticks; oldest evicted on push.
//! - `recent_trades` holds only trades within the trailing 5-minute window.
//! - `reference_price` is captured from the first tick at or after market
//!   start and never overwritten afterwards.

use std::collections::{HashMap, VecDeque};

use crate::replay::book::{self, OrderBookSnapshot};
use crate::replay::signals::{compute_signals, MarketSignals, SignalConfig};
use crate::replay::types::{
    DataStatus, MarketMeta, Millis, ReferenceSource, Tick, TradeEvent, MILLIS_PER_SEC,
};

/// Bounded underlying-price history length.
pub const PRICE_HISTORY_CAP: usize = 180;
/// Data is `stale` (rather than `unknown`) once a state has waited this long
/// for its first book update.
pub const STALE_AFTER_MS: Millis = 10_000;

/// Reconstructed view of one active market.
#[derive(Debug, Clone)]
pub struct MarketState {
    pub meta: MarketMeta,
    /// Effective close: `meta.end_ms` plus pipeline latency.
    pub market_end_ms: Millis,
    pub order_books: HashMap<String, OrderBookSnapshot>,
    pub best_bid: HashMap<String, f64>,
    pub best_ask: HashMap<String, f64>,
    pub price_history: VecDeque<Tick>,
    /// Chronological, trimmed to the signal window on every derived update.
    pub recent_trades: Vec<TradeEvent>,
    pub crypto_price: f64,
    pub crypto_price_timestamp: Millis,
    pub last_book_update_ms: Millis,
    pub last_price_update_ms: Millis,
    pub selected_at_ms: Millis,
    pub reference_price: f64,
    pub reference_source: ReferenceSource,
    /// Authoritative threshold when positive; otherwise the reference price
    /// stands in.
    pub price_to_beat: f64,
    pub data_status: DataStatus,
    pub signals: MarketSignals,
    pub time_left_sec: f64,
}

impl MarketState {
    pub fn new(meta: MarketMeta, selected_at_ms: Millis, latency_ms: Millis) -> Self {
        let market_end_ms = meta.end_ms + latency_ms;
        Self {
            meta,
            market_end_ms,
            order_books: HashMap::new(),
            best_bid: HashMap::new(),
            best_ask: HashMap::new(),
            price_history: VecDeque::with_capacity(PRICE_HISTORY_CAP),
            recent_trades: Vec::new(),
            crypto_price: 0.0,
            crypto_price_timestamp: 0,
            last_book_update_ms: 0,
            last_price_update_ms: 0,
            selected_at_ms,
            reference_price: 0.0,
            reference_source: ReferenceSource::Missing,
            price_to_beat: 0.0,
            data_status: DataStatus::Unknown,
            signals: MarketSignals::default(),
            time_left_sec: (market_end_ms - selected_at_ms) as f64 / MILLIS_PER_SEC as f64,
        }
    }

    pub fn slug(&self) -> &str {
        &self.meta.slug
    }

    /// Threshold the market resolves against.
    #[inline]
    pub fn threshold(&self) -> f64 {
        if self.price_to_beat > 0.0 {
            self.price_to_beat
        } else {
            self.reference_price
        }
    }

    /// Whether the up outcome is currently favoured. Meaningful only when
    /// both threshold and underlying price are known.
    #[inline]
    pub fn favored_up(&self) -> bool {
        self.crypto_price >= self.threshold()
    }

    pub fn favored_token_id(&self) -> &str {
        if self.favored_up() {
            &self.meta.up_token_id
        } else {
            &self.meta.down_token_id
        }
    }

    pub fn token_id_for_up(&self, up: bool) -> &str {
        if up {
            &self.meta.up_token_id
        } else {
            &self.meta.down_token_id
        }
    }

    pub fn book(&self, token_id: &str) -> Option<&OrderBookSnapshot> {
        self.order_books.get(token_id)
    }

    /// Ingest one underlying price tick that has become visible.
    ///
    /// Ticks earlier than market start are discarded upstream; the first
    /// eligible tick fixes the historical reference price.
    pub fn apply_tick(&mut self, tick: Tick, now: Millis) {
        self.crypto_price = tick.value;
        self.crypto_price_timestamp = tick.timestamp;
        self.last_price_update_ms = now;

        if self.price_history.len() == PRICE_HISTORY_CAP {
            self.price_history.pop_front();
        }
        self.price_history.push_back(tick);

        if self.reference_source == ReferenceSource::Missing && tick.timestamp >= self.meta.start_ms
        {
            self.reference_price = tick.value;
            self.reference_source = ReferenceSource::Historical;
        }
    }

    /// Ingest one trade print: derive book sides, refresh best prices, and
    /// append to the recent-trade window.
    pub fn apply_trade(&mut self, trade: TradeEvent, now: Millis) {
        book::apply_trade(&mut self.order_books, &trade);
        for (token_id, snapshot) in &self.order_books {
            match snapshot.best_bid() {
                Some(price) => {
                    self.best_bid.insert(token_id.clone(), price);
                }
                None => {
                    self.best_bid.remove(token_id);
                }
            }
            match snapshot.best_ask() {
                Some(price) => {
                    self.best_ask.insert(token_id.clone(), price);
                }
                None => {
                    self.best_ask.remove(token_id);
                }
            }
        }
        self.last_book_update_ms = now;
        self.recent_trades.push(trade);
    }

    /// Recompute windowed/derived fields after a batch of mutations.
    pub fn update_derived(&mut self, now: Millis, config: &SignalConfig) {
        let cutoff = now - config.trade_window_ms;
        if self
            .recent_trades
            .first()
            .is_some_and(|t| t.timestamp < cutoff)
        {
            self.recent_trades.retain(|t| t.timestamp >= cutoff);
        }

        self.time_left_sec = (self.market_end_ms - now) as f64 / MILLIS_PER_SEC as f64;

        self.data_status = if self.last_book_update_ms > 0 {
            DataStatus::Healthy
        } else if now - self.selected_at_ms > STALE_AFTER_MS {
            DataStatus::Stale
        } else {
            DataStatus::Unknown
        };

        let favored_token = self.favored_token_id().to_string();
        self.signals = compute_signals(
            config,
            self.order_books.get(&favored_token),
            &self.price_history,
            &self.recent_trades,
            &favored_token,
            self.crypto_price_timestamp,
            self.reference_source,
            now,
        );
    }
}
