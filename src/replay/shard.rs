//! Coin Shard Driver
//!
//! Fast-mode fan-out: profile state is strictly per-(profile, coin) inside
//! the kernel, so coins are independent and each can replay on its own
//! worker. Workers share nothing but their start-up inputs and their final
//! summary rows; reduction happens on the driver thread once all workers
//! return. Failed coins are dropped from the reduction with a warning; if
//! every worker fails the driver falls back to a single-process replay.

use anyhow::Result;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::replay::config::{ReplayEnv, SweepEnv};
use crate::replay::runner::ReplayRunner;
use crate::replay::scheduler::ReplayInputs;
use crate::replay::signals::SignalConfig;
use crate::replay::types::{CoinId, ProfileSummary};
use crate::strategy::profile::Profile;

/// Slice one coin's inputs out of the full set.
fn shard_inputs(inputs: &ReplayInputs, coin: CoinId) -> ReplayInputs {
    let markets = inputs
        .markets_by_coin
        .get(&coin)
        .cloned()
        .unwrap_or_default();
    let trade_paths = markets
        .iter()
        .filter_map(|m| {
            inputs
                .trade_paths
                .get(&m.slug)
                .map(|p| (m.slug.clone(), p.clone()))
        })
        .collect();
    let tick_paths = inputs
        .tick_paths
        .get(&coin)
        .map(|p| HashMap::from([(coin, p.clone())]))
        .unwrap_or_default();
    ReplayInputs {
        markets_by_coin: HashMap::from([(coin, markets)]),
        trade_paths,
        tick_paths,
        range: inputs.range,
    }
}

fn run_single_coin(
    inputs: ReplayInputs,
    profiles: &[Profile],
    env: &ReplayEnv,
    sweep: SweepEnv,
    signal_config: SignalConfig,
) -> Result<Vec<ProfileSummary>> {
    let mut runner = ReplayRunner::new(inputs, profiles, env.clone(), sweep, signal_config)?;
    Ok(runner.run_max_speed())
}

/// Run a max-speed replay fanned out one worker per coin, reducing the
/// per-profile summaries (sums, max runtime) on completion.
pub fn run_sharded(
    inputs: &ReplayInputs,
    profiles: &[Profile],
    env: &ReplayEnv,
    sweep: SweepEnv,
    signal_config: SignalConfig,
) -> Result<Vec<ProfileSummary>> {
    let mut coins: Vec<CoinId> = inputs.markets_by_coin.keys().copied().collect();
    coins.sort();
    if coins.len() <= 1 || !env.coin_workers {
        return run_single_coin(inputs.clone(), profiles, env, sweep, signal_config);
    }

    let worker_limit = env.coin_worker_limit.clamp(1, coins.len());
    info!(coins = coins.len(), workers = worker_limit, "sharded replay starting");

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(worker_limit)
        .thread_name(|i| format!("replay-coin-{i}"))
        .build()?;

    let failed: Mutex<Vec<CoinId>> = Mutex::new(Vec::new());
    let results: Vec<(CoinId, Vec<ProfileSummary>)> = pool.install(|| {
        coins
            .par_iter()
            .filter_map(|&coin| {
                let shard = shard_inputs(inputs, coin);
                match run_single_coin(shard, profiles, env, sweep, signal_config) {
                    Ok(summaries) => Some((coin, summaries)),
                    Err(err) => {
                        warn!(coin = %coin, error = %err, "coin worker failed");
                        failed.lock().push(coin);
                        None
                    }
                }
            })
            .collect()
    });

    let failed = failed.into_inner();
    if results.is_empty() {
        warn!("all coin workers failed, falling back to single-process replay");
        return run_single_coin(inputs.clone(), profiles, env, sweep, signal_config);
    }
    if !failed.is_empty() {
        let mut failed = failed;
        failed.sort();
        warn!(?failed, "reduced summaries exclude failed coins");
    }

    // Deterministic reduce order: by coin, then profile order.
    let mut results = results;
    results.sort_by_key(|(coin, _)| *coin);
    let mut by_name: HashMap<String, ProfileSummary> = HashMap::new();
    for (_, summaries) in &results {
        for summary in summaries {
            by_name
                .entry(summary.profile.clone())
                .and_modify(|acc| acc.absorb(summary))
                .or_insert_with(|| summary.clone());
        }
    }
    Ok(profiles
        .iter()
        .filter_map(|p| by_name.remove(&p.name))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::types::MarketMeta;

    #[test]
    fn test_shard_inputs_partition() {
        let mut inputs = ReplayInputs::default();
        inputs.markets_by_coin.insert(
            CoinId::Btc,
            vec![MarketMeta {
                slug: "btc-m".into(),
                coin: CoinId::Btc,
                start_ms: 0,
                end_ms: 1,
                up_token_id: "u".into(),
                down_token_id: "d".into(),
                market_name: None,
            }],
        );
        inputs.markets_by_coin.insert(CoinId::Eth, vec![]);
        inputs.trade_paths.insert("btc-m".into(), "trades/btc-m.jsonl".into());
        inputs.trade_paths.insert("eth-m".into(), "trades/eth-m.jsonl".into());
        inputs.tick_paths.insert(CoinId::Btc, "crypto/btc.jsonl".into());
        inputs.tick_paths.insert(CoinId::Eth, "crypto/eth.jsonl".into());

        let shard = shard_inputs(&inputs, CoinId::Btc);
        assert_eq!(shard.markets_by_coin.len(), 1);
        assert_eq!(shard.trade_paths.len(), 1);
        assert!(shard.trade_paths.contains_key("btc-m"));
        assert_eq!(shard.tick_paths.len(), 1);
        assert!(shard.tick_paths.contains_key(&CoinId::Btc));
    }
}
