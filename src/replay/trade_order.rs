//! Trade Record Ordering
//!
//! One total order over trade prints, shared by archive merging, load-time
//! sort verification, and dedup. Ordering levels:
//!
//! 1. `timestamp`
//! 2. `bucketIndex` (absent compares as 0)
//! 3. `tradeId` (absent compares as "", lexicographic)
//! 4. `takerOrderId` (absent compares as "")
//! 5. original input index (stability only; callers that need it rely on a
//!    stable sort rather than an explicit field)

use std::cmp::Ordering;

use tracing::warn;

use crate::replay::types::TradeEvent;

/// Total order over trade records (without the stability level).
pub fn compare_trades(a: &TradeEvent, b: &TradeEvent) -> Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.bucket_index.unwrap_or(0).cmp(&b.bucket_index.unwrap_or(0)))
        .then_with(|| {
            a.trade_id
                .as_deref()
                .unwrap_or("")
                .cmp(b.trade_id.as_deref().unwrap_or(""))
        })
        .then_with(|| {
            a.taker_order_id
                .as_deref()
                .unwrap_or("")
                .cmp(b.taker_order_id.as_deref().unwrap_or(""))
        })
}

/// Sort trades into the canonical order. The sort is stable, so records that
/// compare equal keep their original file order.
pub fn sort_chronologically(trades: &mut [TradeEvent]) {
    trades.sort_by(compare_trades);
}

/// Whether a slice already obeys the canonical order.
pub fn is_sorted(trades: &[TradeEvent]) -> bool {
    trades
        .windows(2)
        .all(|pair| compare_trades(&pair[0], &pair[1]) != Ordering::Greater)
}

/// Verify a loaded archive is sorted; re-sort in place with a warning if not.
/// Returns true when a re-sort was needed.
pub fn ensure_sorted(slug: &str, trades: &mut [TradeEvent]) -> bool {
    if is_sorted(trades) {
        return false;
    }
    warn!(slug, count = trades.len(), "trade archive out of order, re-sorting");
    sort_chronologically(trades);
    true
}
