//! Core record types for the historical replay engine.
//!
//! Everything here mirrors the on-disk JSONL schema: timestamps are integer
//! milliseconds since the Unix epoch, prices and sizes are IEEE-754 doubles.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Milliseconds since Unix epoch (1970-01-01 00:00:00 UTC).
pub type Millis = i64;

/// Conversion constants
pub const MILLIS_PER_SEC: i64 = 1_000;
pub const MILLIS_PER_MIN: i64 = 60 * MILLIS_PER_SEC;

/// The closed set of underlying coins with up/down markets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoinId {
    Btc,
    Eth,
    Sol,
    Xrp,
}

impl CoinId {
    pub const ALL: [CoinId; 4] = [CoinId::Btc, CoinId::Eth, CoinId::Sol, CoinId::Xrp];

    pub fn as_str(&self) -> &'static str {
        match self {
            CoinId::Btc => "btc",
            CoinId::Eth => "eth",
            CoinId::Sol => "sol",
            CoinId::Xrp => "xrp",
        }
    }
}

impl fmt::Display for CoinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CoinId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "btc" => Ok(CoinId::Btc),
            "eth" => Ok(CoinId::Eth),
            "sol" => Ok(CoinId::Sol),
            "xrp" => Ok(CoinId::Xrp),
            other => Err(format!("unknown coin: {other}")),
        }
    }
}

/// Aggressor/maker side of a trade or resting order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY", alias = "buy", alias = "Buy")]
    Buy,
    #[serde(rename = "SELL", alias = "sell", alias = "Sell")]
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

/// Market metadata, immutable once loaded from `markets.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketMeta {
    pub slug: String,
    pub coin: CoinId,
    pub start_ms: Millis,
    pub end_ms: Millis,
    pub up_token_id: String,
    pub down_token_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_name: Option<String>,
}

impl MarketMeta {
    /// Structural sanity: positive window and distinct outcome tokens.
    pub fn is_valid(&self) -> bool {
        self.start_ms < self.end_ms && self.up_token_id != self.down_token_id
    }
}

/// One underlying price observation from `crypto/<coin>.jsonl`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub timestamp: Millis,
    pub value: f64,
}

/// A maker order attached to a trade print, describing resting book depth
/// on one side of one outcome token at execution time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MakerOrder {
    pub price: f64,
    pub size: f64,
    pub side: Side,
    pub token_id: String,
}

/// One trade print from `trades/<slug>.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeEvent {
    pub timestamp: Millis,
    pub token_id: String,
    pub price: f64,
    pub size: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side: Option<Side>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trade_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taker_order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_index: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maker_orders: Option<Vec<MakerOrder>>,
}

impl TradeEvent {
    /// Natural key used for archive deduplication. Float fields compare by
    /// bit pattern so NaN payloads cannot collapse distinct records.
    pub fn natural_key(&self) -> TradeKey {
        TradeKey {
            timestamp: self.timestamp,
            token_id: self.token_id.clone(),
            price_bits: self.price.to_bits(),
            size_bits: self.size.to_bits(),
            side: self.side,
            trade_id: self.trade_id.clone(),
            taker_order_id: self.taker_order_id.clone(),
        }
    }
}

/// Dedup identity of a trade record: (timestamp, tokenId, price, size, side,
/// tradeId, takerOrderId).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TradeKey {
    pub timestamp: Millis,
    pub token_id: String,
    pub price_bits: u64,
    pub size_bits: u64,
    pub side: Option<Side>,
    pub trade_id: Option<String>,
    pub taker_order_id: Option<String>,
}

/// Where the active market's reference price came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceSource {
    Missing,
    Historical,
    Live,
}

impl ReferenceSource {
    /// Presence-weighted quality used by the signal layer.
    pub fn quality(&self) -> f64 {
        match self {
            ReferenceSource::Historical => 1.0,
            ReferenceSource::Live => 0.7,
            ReferenceSource::Missing => 0.0,
        }
    }
}

/// Freshness classification of a market state's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataStatus {
    Unknown,
    Stale,
    Healthy,
}

/// Per-profile performance summary produced by a completed replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSummary {
    pub profile: String,
    pub runtime_sec: f64,
    pub total_trades: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cross_trades: Option<u64>,
    pub wins: u64,
    pub losses: u64,
    pub total_profit: f64,
    pub open_exposure: f64,
}

impl ProfileSummary {
    pub fn zero(profile: impl Into<String>) -> Self {
        Self {
            profile: profile.into(),
            runtime_sec: 0.0,
            total_trades: 0,
            cross_trades: None,
            wins: 0,
            losses: 0,
            total_profit: 0.0,
            open_exposure: 0.0,
        }
    }

    /// Fold another summary for the same profile into this one.
    /// Totals are summed; runtime takes the max (workers run in parallel).
    pub fn absorb(&mut self, other: &ProfileSummary) {
        self.runtime_sec = self.runtime_sec.max(other.runtime_sec);
        self.total_trades += other.total_trades;
        self.cross_trades = match (self.cross_trades, other.cross_trades) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
        };
        self.wins += other.wins;
        self.losses += other.losses;
        self.total_profit += other.total_profit;
        self.open_exposure += other.open_exposure;
    }
}
