//! Event-Time Merge Scheduler
//!
//! Merges per-coin tick, trade, and market-activation streams into one
//! monotone logical time. The runner asks for the next event time and then
//! advances to exactly that instant; everything that becomes visible at or
//! before it is applied to the per-coin market states in a fixed phase
//! order (market activation, then ticks, then trades, then derived fields),
//! which together with the trade total order makes replay deterministic.
//!
//! Latency semantics: `latency_ms` is added to every tick's visible time
//! (pipeline delay on the crypto feed) and to each market's effective close.
//! Trades are not latency-shifted.

use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::replay::config::ReplayEnv;
use crate::replay::heap::KeyedHeap;
use crate::replay::signals::SignalConfig;
use crate::replay::state::MarketState;
use crate::replay::stream::JsonlReader;
use crate::replay::types::{CoinId, MarketMeta, Millis, Tick, TradeEvent};

/// Grace window for out-of-range trade timestamps.
const TRADE_RANGE_SLACK_MS: Millis = 60_000;

/// Heap keys for the three per-coin event streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum StreamKey {
    Market(CoinId),
    Tick(CoinId),
    Trade(CoinId),
}

/// Everything a replay needs to start, resolved by the caller.
#[derive(Debug, Clone, Default)]
pub struct ReplayInputs {
    pub markets_by_coin: HashMap<CoinId, Vec<MarketMeta>>,
    pub trade_paths: HashMap<String, PathBuf>,
    pub tick_paths: HashMap<CoinId, PathBuf>,
    /// Optional clamp; markets entirely outside are dropped up front.
    pub range: Option<(Millis, Millis)>,
}

/// FNV-1a over the applied event sequence, for determinism verification.
#[derive(Debug, Clone)]
pub struct ReplayFingerprint {
    hash: u64,
    events: u64,
}

impl Default for ReplayFingerprint {
    fn default() -> Self {
        Self {
            hash: 0xcbf29ce484222325,
            events: 0,
        }
    }
}

impl ReplayFingerprint {
    fn update(&mut self, time: Millis, kind: u8, coin: CoinId) {
        let mut bytes = [0u8; 10];
        bytes[..8].copy_from_slice(&time.to_le_bytes());
        bytes[8] = kind;
        bytes[9] = coin as u8;
        for byte in bytes {
            self.hash ^= byte as u64;
            self.hash = self.hash.wrapping_mul(0x100000001b3);
        }
        self.events += 1;
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn events(&self) -> u64 {
        self.events
    }
}

/// The merge scheduler over one set of replay inputs.
pub struct EventScheduler {
    env: ReplayEnv,
    signal_config: SignalConfig,
    /// Coins participating in this replay, sorted for deterministic walks.
    coins: Vec<CoinId>,
    markets: HashMap<CoinId, Vec<MarketMeta>>,
    next_market: HashMap<CoinId, usize>,
    active: HashMap<CoinId, MarketState>,
    tick_readers: HashMap<CoinId, JsonlReader<Tick>>,
    /// Active slug's trade reader per coin.
    trade_readers: HashMap<CoinId, JsonlReader<TradeEvent>>,
    trade_paths: HashMap<String, PathBuf>,
    finished_slugs: HashSet<String>,
    heap: KeyedHeap<StreamKey, ()>,
    dirty: HashSet<CoinId>,
    /// States that reached their effective end during the last advance; the
    /// runner hands them to the kernel for terminal resolution.
    expired: Vec<MarketState>,
    now: Millis,
    fingerprint: ReplayFingerprint,
}

impl EventScheduler {
    pub fn new(inputs: ReplayInputs, env: ReplayEnv, signal_config: SignalConfig) -> Result<Self> {
        let mut scheduler = Self {
            env,
            signal_config,
            coins: Vec::new(),
            markets: HashMap::new(),
            next_market: HashMap::new(),
            active: HashMap::new(),
            tick_readers: HashMap::new(),
            trade_readers: HashMap::new(),
            trade_paths: inputs.trade_paths,
            finished_slugs: HashSet::new(),
            heap: KeyedHeap::new(),
            dirty: HashSet::new(),
            expired: Vec::new(),
            now: Millis::MIN,
            fingerprint: ReplayFingerprint::default(),
        };

        let mut coins: Vec<CoinId> = inputs.markets_by_coin.keys().copied().collect();
        coins.sort();

        for coin in coins {
            let mut markets = inputs.markets_by_coin.get(&coin).cloned().unwrap_or_default();
            markets.retain(|m| {
                if !m.is_valid() {
                    warn!(coin = %coin, slug = %m.slug, "dropping structurally invalid market");
                    return false;
                }
                if !scheduler.trade_paths.contains_key(&m.slug) {
                    warn!(coin = %coin, slug = %m.slug, "dropping market without trade archive");
                    return false;
                }
                if let Some((from, to)) = inputs.range {
                    if m.end_ms + scheduler.env.latency_ms < from || m.start_ms > to {
                        return false;
                    }
                }
                true
            });
            markets.sort_by_key(|m| m.start_ms);
            if markets.is_empty() {
                debug!(coin = %coin, "no replayable markets for coin");
                continue;
            }

            let Some(tick_path) = inputs.tick_paths.get(&coin) else {
                warn!(coin = %coin, "dropping coin without tick archive");
                continue;
            };
            let mut reader: JsonlReader<Tick> = match JsonlReader::open_json(
                tick_path,
                scheduler.env.tick_reader_config(),
            ) {
                Ok(reader) => reader,
                Err(err) => {
                    warn!(coin = %coin, error = %err, "dropping coin, tick archive unreadable");
                    continue;
                }
            };
            if reader.peek().is_none() {
                warn!(coin = %coin, "dropping coin, tick archive empty");
                continue;
            }

            info!(coin = %coin, markets = markets.len(), "coin scheduled for replay");
            scheduler.heap_market_upsert(coin, markets[0].start_ms);
            scheduler.tick_readers.insert(coin, reader);
            scheduler.markets.insert(coin, markets);
            scheduler.next_market.insert(coin, 0);
            scheduler.coins.push(coin);
        }

        Ok(scheduler)
    }

    pub fn now(&self) -> Millis {
        self.now
    }

    /// Coins that survived input validation, sorted.
    pub fn coins(&self) -> &[CoinId] {
        &self.coins
    }

    pub fn active_state(&self, coin: CoinId) -> Option<&MarketState> {
        self.active.get(&coin)
    }

    /// Sorted snapshot handles for the kernel.
    pub fn active_states(&self) -> Vec<(CoinId, &MarketState)> {
        self.coins
            .iter()
            .filter_map(|&coin| self.active.get(&coin).map(|s| (coin, s)))
            .collect()
    }

    pub fn fingerprint(&self) -> &ReplayFingerprint {
        &self.fingerprint
    }

    /// Earliest pending event across every stream, or `None` when the replay
    /// is exhausted.
    pub fn next_event_time(&mut self) -> Option<Millis> {
        if self.env.event_queue {
            self.heap.peek_time()
        } else {
            // Linear fallback: scan the same per-stream heads the heap tracks.
            let mut earliest: Option<Millis> = None;
            let mut fold = |candidate: Option<Millis>| {
                earliest = match (earliest, candidate) {
                    (None, c) => c,
                    (e, None) => e,
                    (Some(e), Some(c)) => Some(e.min(c)),
                };
            };
            for i in 0..self.coins.len() {
                let coin = self.coins[i];
                fold(self.market_event_time(coin));
                fold(self.tick_event_time(coin));
                fold(self.trade_event_time(coin));
            }
            earliest
        }
    }

    /// Coins mutated since the last drain of the dirty set, sorted.
    pub fn take_dirty(&mut self) -> Vec<CoinId> {
        let mut coins: Vec<CoinId> = self.dirty.drain().collect();
        coins.sort();
        coins
    }

    /// States that expired during the most recent `advance_to`.
    pub fn take_expired(&mut self) -> Vec<MarketState> {
        std::mem::take(&mut self.expired)
    }

    /// Advance logical time to `t`, applying every event visible at or
    /// before it. Repeating the same `t` is a no-op.
    pub fn advance_to(&mut self, t: Millis) {
        if t < self.now {
            return;
        }
        self.now = t;

        for i in 0..self.coins.len() {
            let coin = self.coins[i];
            self.roll_markets(coin);
            self.drain_ticks(coin);
            self.drain_trades(coin);
        }

        for i in 0..self.coins.len() {
            let coin = self.coins[i];
            if let Some(state) = self.active.get_mut(&coin) {
                state.update_derived(self.now, &self.signal_config);
            }
            self.refresh_heap(coin);
        }
    }

    // -------------------------------------------------------------------
    // Phase 1: market activation
    // -------------------------------------------------------------------

    fn roll_markets(&mut self, coin: CoinId) {
        // Close an expired state first; its slug is finished for good.
        if let Some(state) = self.active.get(&coin) {
            if self.now >= state.market_end_ms {
                let mut state = self.active.remove(&coin).unwrap();
                state.update_derived(self.now, &self.signal_config);
                self.finished_slugs.insert(state.slug().to_string());
                if let Some(mut reader) = self.trade_readers.remove(&coin) {
                    reader.close();
                }
                self.fingerprint.update(self.now, 0, coin);
                self.dirty.insert(coin);
                info!(
                    coin = %coin,
                    slug = state.slug(),
                    now = self.now,
                    "market closed"
                );
                self.expired.push(state);
            } else {
                return;
            }
        }

        let Some(markets) = self.markets.get(&coin) else {
            return;
        };
        let mut idx = self.next_market.get(&coin).copied().unwrap_or(0);
        while idx < markets.len() {
            let meta = &markets[idx];
            let effective_end = meta.end_ms + self.env.latency_ms;
            if self.now > effective_end {
                // Already past; never opened, never will be.
                debug!(coin = %coin, slug = %meta.slug, "skipping past market");
                idx += 1;
                continue;
            }
            if self.now < meta.start_ms {
                break;
            }
            if self.finished_slugs.contains(&meta.slug) {
                idx += 1;
                continue;
            }

            let meta = meta.clone();
            let Some(path) = self.trade_paths.get(&meta.slug).cloned() else {
                idx += 1;
                continue;
            };
            match JsonlReader::open_json(&path, self.env.trade_reader_config()) {
                Ok(reader) => {
                    self.trade_readers.insert(coin, reader);
                    let state = MarketState::new(meta.clone(), self.now, self.env.latency_ms);
                    info!(
                        coin = %coin,
                        slug = %meta.slug,
                        start_ms = meta.start_ms,
                        end_ms = meta.end_ms,
                        selected_at = self.now,
                        "market activated"
                    );
                    self.fingerprint.update(self.now, 1, coin);
                    self.active.insert(coin, state);
                    self.dirty.insert(coin);
                    idx += 1;
                    break;
                }
                Err(err) => {
                    warn!(coin = %coin, slug = %meta.slug, error = %err, "dropping market, trade archive unreadable");
                    idx += 1;
                }
            }
        }
        self.next_market.insert(coin, idx);
    }

    // -------------------------------------------------------------------
    // Phase 2: tick drain
    // -------------------------------------------------------------------

    fn drain_ticks(&mut self, coin: CoinId) {
        let Some(state) = self.active.get_mut(&coin) else {
            return;
        };
        let Some(reader) = self.tick_readers.get_mut(&coin) else {
            return;
        };
        let latency = self.env.latency_ms;
        while let Some(tick) = reader.peek() {
            if tick.timestamp + latency > self.now {
                break;
            }
            let Some(tick) = reader.shift() else {
                break;
            };
            if tick.timestamp < state.meta.start_ms {
                continue;
            }
            if !tick.value.is_finite() || tick.value <= 0.0 {
                continue;
            }
            state.apply_tick(tick, self.now);
            self.fingerprint.update(self.now, 2, coin);
            self.dirty.insert(coin);
        }
    }

    // -------------------------------------------------------------------
    // Phase 3: trade drain
    // -------------------------------------------------------------------

    fn drain_trades(&mut self, coin: CoinId) {
        let Some(state) = self.active.get_mut(&coin) else {
            return;
        };
        let Some(reader) = self.trade_readers.get_mut(&coin) else {
            return;
        };
        let earliest = state.meta.start_ms - TRADE_RANGE_SLACK_MS;
        let latest = state.meta.end_ms + TRADE_RANGE_SLACK_MS;
        while let Some(trade) = reader.peek() {
            if trade.timestamp > self.now {
                break;
            }
            let Some(trade) = reader.shift() else {
                break;
            };
            if trade.timestamp < earliest || trade.timestamp > latest {
                continue;
            }
            if !(trade.price.is_finite() && trade.size.is_finite()) || trade.size <= 0.0 {
                continue;
            }
            state.apply_trade(trade, self.now);
            self.fingerprint.update(self.now, 3, coin);
            self.dirty.insert(coin);
        }
    }

    // -------------------------------------------------------------------
    // Per-stream head times (shared by the heap and the scan fallback)
    // -------------------------------------------------------------------

    fn market_event_time(&self, coin: CoinId) -> Option<Millis> {
        if let Some(state) = self.active.get(&coin) {
            return Some(state.market_end_ms);
        }
        let markets = self.markets.get(&coin)?;
        let idx = self.next_market.get(&coin).copied().unwrap_or(0);
        markets.get(idx).map(|m| m.start_ms.max(self.now))
    }

    fn tick_event_time(&mut self, coin: CoinId) -> Option<Millis> {
        if !self.active.contains_key(&coin) {
            return None;
        }
        let latency = self.env.latency_ms;
        self.tick_readers
            .get_mut(&coin)
            .and_then(|r| r.peek().map(|t| t.timestamp + latency))
    }

    fn trade_event_time(&mut self, coin: CoinId) -> Option<Millis> {
        let earliest = self
            .active
            .get(&coin)
            .map(|s| s.meta.start_ms - TRADE_RANGE_SLACK_MS)?;
        let reader = self.trade_readers.get_mut(&coin)?;
        // Drop heads that would be discarded anyway, so a stale print can
        // never drag the event clock backwards.
        while let Some(trade) = reader.peek() {
            if trade.timestamp < earliest {
                reader.shift();
                continue;
            }
            return Some(trade.timestamp.max(self.now));
        }
        None
    }

    fn refresh_heap(&mut self, coin: CoinId) {
        match self.market_event_time(coin) {
            Some(time) => self.heap_market_upsert(coin, time),
            None => {
                self.heap.remove(&StreamKey::Market(coin));
            }
        }
        match self.tick_event_time(coin) {
            Some(time) => self.heap.upsert(StreamKey::Tick(coin), time, ()),
            None => {
                self.heap.remove(&StreamKey::Tick(coin));
            }
        }
        match self.trade_event_time(coin) {
            Some(time) => self.heap.upsert(StreamKey::Trade(coin), time, ()),
            None => {
                self.heap.remove(&StreamKey::Trade(coin));
            }
        }
    }

    fn heap_market_upsert(&mut self, coin: CoinId, time: Millis) {
        self.heap.upsert(StreamKey::Market(coin), time, ());
    }
}
