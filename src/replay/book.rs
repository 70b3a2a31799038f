//! Order Book Snapshots Derived From Trade Prints
//!
//! Historical archives carry no standalone L2 feed; book state is derived
//! from each trade's attached maker orders. A trade without maker depth
//! implies a one-sided book collapse: an aggressive BUY leaves only the
//! traded ask level visible, an aggressive SELL only the traded bid level.
//! Changing that fallback silently alters backtest outcomes, so it is
//! preserved exactly.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::replay::types::{MakerOrder, Millis, Side, TradeEvent};

/// One price level of a derived book side.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

/// Last trade print applied to a book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LastTrade {
    pub price: f64,
    pub size: f64,
    pub side: Option<Side>,
    pub timestamp: Millis,
}

/// Derived book snapshot for one outcome token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    /// Sorted descending by price (best bid first).
    pub bids: Vec<BookLevel>,
    /// Sorted ascending by price (best ask first).
    pub asks: Vec<BookLevel>,
    pub last_trade: Option<LastTrade>,
    pub total_bid_value: f64,
    pub total_ask_value: f64,
}

impl OrderBookSnapshot {
    #[inline]
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    #[inline]
    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }

    pub fn spread(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        }
    }

    /// Notional value (price x size) across the top `levels` of one side.
    pub fn bid_value_top(&self, levels: usize) -> f64 {
        self.bids.iter().take(levels).map(|l| l.price * l.size).sum()
    }

    pub fn ask_value_top(&self, levels: usize) -> f64 {
        self.asks.iter().take(levels).map(|l| l.price * l.size).sum()
    }

    fn recompute_totals(&mut self) {
        self.total_bid_value = self.bids.iter().map(|l| l.price * l.size).sum();
        self.total_ask_value = self.asks.iter().map(|l| l.price * l.size).sum();
    }
}

/// Apply one trade print to the per-token book map.
///
/// With maker orders, every (token, side) group present in the trade replaces
/// that side of that token's book; sides not mentioned are left untouched.
/// Without maker orders, the traded token collapses to a one-sided book.
pub fn apply_trade(books: &mut HashMap<String, OrderBookSnapshot>, trade: &TradeEvent) {
    match trade.maker_orders.as_deref() {
        Some(makers) if !makers.is_empty() => apply_maker_orders(books, makers),
        _ => {
            if let Some(side) = trade.side {
                let book = books.entry(trade.token_id.clone()).or_default();
                match side {
                    Side::Buy => {
                        book.bids.clear();
                        book.asks = vec![BookLevel {
                            price: trade.price,
                            size: trade.size,
                        }];
                    }
                    Side::Sell => {
                        book.asks.clear();
                        book.bids = vec![BookLevel {
                            price: trade.price,
                            size: trade.size,
                        }];
                    }
                }
                book.recompute_totals();
            }
        }
    }

    let book = books.entry(trade.token_id.clone()).or_default();
    book.last_trade = Some(LastTrade {
        price: trade.price,
        size: trade.size,
        side: trade.side,
        timestamp: trade.timestamp,
    });
}

fn apply_maker_orders(books: &mut HashMap<String, OrderBookSnapshot>, makers: &[MakerOrder]) {
    // Group levels by (token, side), aggregating size at equal prices.
    let mut grouped: HashMap<(String, Side), HashMap<u64, BookLevel>> = HashMap::new();
    for maker in makers {
        if !(maker.price.is_finite() && maker.size.is_finite()) || maker.size <= 0.0 {
            continue;
        }
        let levels = grouped
            .entry((maker.token_id.clone(), maker.side))
            .or_default();
        levels
            .entry(maker.price.to_bits())
            .and_modify(|l| l.size += maker.size)
            .or_insert(BookLevel {
                price: maker.price,
                size: maker.size,
            });
    }

    for ((token_id, side), levels) in grouped {
        let mut levels: Vec<BookLevel> = levels.into_values().collect();
        let book = books.entry(token_id).or_default();
        match side {
            // Maker BUY orders are resting bids, maker SELLs resting asks.
            Side::Buy => {
                levels.sort_by(|a, b| b.price.total_cmp(&a.price));
                book.bids = levels;
            }
            Side::Sell => {
                levels.sort_by(|a, b| a.price.total_cmp(&b.price));
                book.asks = levels;
            }
        }
        book.recompute_totals();
    }
}
