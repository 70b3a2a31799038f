//! Paper Fill Simulation
//!
//! Fills are simulated by walking the recorded ladder: buys consume ask
//! levels in ascending price within the rule's share-price band, sells
//! consume bid levels in descending price. No adaptive slippage model beyond
//! the ladder walk itself.

use crate::replay::book::BookLevel;

const EPS: f64 = 1e-9;

/// Result of a simulated aggressive buy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BuyFill {
    pub shares: f64,
    pub cost: f64,
}

impl BuyFill {
    pub fn avg_price(&self) -> f64 {
        if self.shares > 0.0 {
            self.cost / self.shares
        } else {
            0.0
        }
    }
}

/// Result of a simulated aggressive sell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SellFill {
    pub proceeds: f64,
    pub shares_sold: f64,
}

/// Walk asks in ascending price while `price <= max_share`, skipping levels
/// below `min_share`, consuming up to `max_spend` notional into fractional
/// shares. Returns `None` when the achievable cost stays below `min_spend`
/// or no shares are obtainable.
pub fn simulate_buy(
    asks: &[BookLevel],
    max_spend: f64,
    min_share: f64,
    max_share: f64,
    min_spend: f64,
) -> Option<BuyFill> {
    if max_spend <= 0.0 {
        return None;
    }
    let mut budget = max_spend;
    let mut shares = 0.0;
    let mut cost = 0.0;

    for level in asks {
        if level.price > max_share {
            break;
        }
        if level.price < min_share || level.price <= 0.0 || level.size <= 0.0 {
            continue;
        }
        let level_value = level.price * level.size;
        let use_value = budget.min(level_value);
        if use_value <= EPS {
            break;
        }
        shares += use_value / level.price;
        cost += use_value;
        budget -= use_value;
        if budget <= EPS {
            break;
        }
    }

    if cost + EPS < min_spend || shares <= EPS {
        return None;
    }
    Some(BuyFill { shares, cost })
}

/// Walk bids in descending price consuming whole-share lots down to the
/// required quantity (a final sub-share remainder may be taken fractionally).
/// Returns `None` when the book cannot absorb the full quantity.
pub fn simulate_sell(bids: &[BookLevel], quantity: f64) -> Option<SellFill> {
    if quantity <= EPS {
        return None;
    }
    let mut remaining = quantity;
    let mut proceeds = 0.0;

    for level in bids {
        if level.price <= 0.0 || level.size <= 0.0 {
            continue;
        }
        let whole = level.size.floor();
        let available = if whole >= 1.0 { whole } else { level.size };
        let take = if remaining < 1.0 {
            remaining.min(level.size)
        } else {
            remaining.min(available)
        };
        if take <= EPS {
            continue;
        }
        proceeds += take * level.price;
        remaining -= take;
        if remaining <= EPS {
            return Some(SellFill {
                proceeds,
                shares_sold: quantity,
            });
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn levels(rows: &[(f64, f64)]) -> Vec<BookLevel> {
        rows.iter()
            .map(|&(price, size)| BookLevel { price, size })
            .collect()
    }

    #[test]
    fn test_buy_single_level() {
        let asks = levels(&[(0.40, 100.0)]);
        let fill = simulate_buy(&asks, 10.0, 0.0, 1.0, 1.0).unwrap();
        assert!((fill.shares - 25.0).abs() < 1e-9);
        assert!((fill.cost - 10.0).abs() < 1e-9);
        assert!((fill.avg_price() - 0.40).abs() < 1e-9);
    }

    #[test]
    fn test_buy_walks_ladder() {
        let asks = levels(&[(0.40, 10.0), (0.50, 10.0), (0.60, 100.0)]);
        // 4 + 5 = 9 at the first two levels, 1 remaining at 0.60.
        let fill = simulate_buy(&asks, 10.0, 0.0, 1.0, 1.0).unwrap();
        let expected_shares = 10.0 + 10.0 + 1.0 / 0.60;
        assert!((fill.shares - expected_shares).abs() < 1e-9);
        assert!((fill.cost - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_buy_respects_share_price_band() {
        let asks = levels(&[(0.10, 10.0), (0.40, 10.0), (0.90, 10.0)]);
        // Band excludes the cheap and expensive levels.
        let fill = simulate_buy(&asks, 100.0, 0.20, 0.50, 1.0).unwrap();
        assert!((fill.cost - 4.0).abs() < 1e-9);
        assert!((fill.shares - 10.0).abs() < 1e-9);

        // max_share below the whole ladder: nothing fillable.
        assert!(simulate_buy(&asks, 100.0, 0.0, 0.05, 0.0).is_none());
    }

    #[test]
    fn test_buy_rejects_below_min_spend() {
        let asks = levels(&[(0.40, 1.0)]);
        // Only 0.40 notional available but 5.0 required.
        assert!(simulate_buy(&asks, 10.0, 0.0, 1.0, 5.0).is_none());
    }

    #[test]
    fn test_sell_walks_bids() {
        let bids = levels(&[(0.55, 20.0), (0.50, 20.0)]);
        let fill = simulate_sell(&bids, 30.0).unwrap();
        assert!((fill.proceeds - (20.0 * 0.55 + 10.0 * 0.50)).abs() < 1e-9);
        assert!((fill.shares_sold - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_sell_insufficient_liquidity() {
        let bids = levels(&[(0.55, 5.0)]);
        assert!(simulate_sell(&bids, 30.0).is_none());
        assert!(simulate_sell(&[], 1.0).is_none());
    }

    #[test]
    fn test_sell_fractional_remainder() {
        let bids = levels(&[(0.55, 20.0)]);
        let fill = simulate_sell(&bids, 12.5).unwrap();
        assert!((fill.proceeds - 12.5 * 0.55).abs() < 1e-9);
    }
}
