//! ReplayBot - Paper-Trading Backtester for Up/Down Prediction Markets
//!
//! CLI shell around the historical replay core: resolves archive paths,
//! loads strategy profiles, parses the requested time range, and runs the
//! replay in real-time or max-speed (coin-sharded) mode. All date parsing
//! lives here; the core consumes integer milliseconds only.
//!
//! # Exit Codes
//!
//! - 0: replay completed
//! - 1: configuration or input error

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use dotenv::dotenv;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use replaybot_backend::replay::archive::merge_into_archive;
use replaybot_backend::replay::cache_index::CacheIndex;
use replaybot_backend::replay::shard::run_sharded;
use replaybot_backend::replay::signals::SignalConfig;
use replaybot_backend::replay::stream::ReaderConfig;
use replaybot_backend::replay::DEFAULT_TICK_INTERVAL_MS;
use replaybot_backend::{
    parse_profiles, CoinId, MarketMeta, Millis, ProfileSummary, ReplayEnv, ReplayInputs,
    ReplayRunner, SweepEnv,
};

#[derive(Debug, Parser)]
#[command(name = "replaybot", about = "Historical replay backtester for up/down markets")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Replay archived markets against one or more strategy profiles.
    Run(RunArgs),
    /// Merge a freshly fetched trade archive into the cached one.
    Merge(MergeArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Data directory containing markets.jsonl, trades/, crypto/, cache/.
    #[arg(long, env = "BACKTEST_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Profile file (JSON array of profiles).
    #[arg(long)]
    profiles: PathBuf,

    /// Replay range start (RFC3339). Defaults to the earliest market.
    #[arg(long)]
    from: Option<String>,

    /// Replay range end (RFC3339). Defaults to the latest market.
    #[arg(long)]
    to: Option<String>,

    /// Max-speed mode with one worker per coin.
    #[arg(long)]
    fast: bool,

    /// Real-time speed factor (simulated ms per wall ms).
    #[arg(long, default_value_t = 1.0)]
    speed: f64,

    /// Evaluation tick interval for real-time mode (ms).
    #[arg(long, default_value_t = DEFAULT_TICK_INTERVAL_MS)]
    tick_interval_ms: Millis,

    /// Override BACKTEST_LATENCY_MS.
    #[arg(long)]
    latency_ms: Option<Millis>,

    /// Write the per-profile summary report to this JSON file.
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct MergeArgs {
    /// Data directory (the target archive lives under trades/).
    #[arg(long, env = "BACKTEST_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Market slug whose archive should be updated.
    #[arg(long)]
    slug: String,

    /// Freshly fetched, sorted trade file to merge in.
    #[arg(long)]
    incoming: PathBuf,
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run(args) => run(args).await,
        Command::Merge(args) => merge(args),
    };
    if let Err(err) = result {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "replaybot_backend=info,replaybot=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(args: RunArgs) -> Result<()> {
    let mut env = ReplayEnv::from_env();
    if let Some(latency_ms) = args.latency_ms {
        env.latency_ms = latency_ms.max(0);
    }
    let sweep = SweepEnv::from_env();
    let signal_config = SignalConfig::default();

    let profiles_raw = fs::read_to_string(&args.profiles)
        .with_context(|| format!("failed to read profile file {}", args.profiles.display()))?;
    let profiles = parse_profiles(&profiles_raw)?;
    info!(count = profiles.len(), "profiles loaded");

    let range = parse_range(args.from.as_deref(), args.to.as_deref())?;
    let inputs = resolve_inputs(&args.data_dir, range)?;

    let summaries = if args.fast {
        let profiles = profiles.clone();
        let env = env.clone();
        tokio::task::spawn_blocking(move || {
            run_sharded(&inputs, &profiles, &env, sweep, signal_config)
        })
        .await
        .context("sharded replay worker panicked")??
    } else {
        let mut runner = ReplayRunner::new(inputs, &profiles, env, sweep, signal_config)?;
        let stop = runner.stop_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping replay");
                stop.stop();
            }
        });
        let summaries = runner.run_real_time(args.speed, args.tick_interval_ms).await;
        info!(fingerprint = %format!("{:016x}", runner.fingerprint_hash()), "replay fingerprint");
        summaries
    };

    report(&summaries);
    if let Some(path) = args.output {
        let body = serde_json::to_string_pretty(&summaries)?;
        fs::write(&path, body)
            .with_context(|| format!("failed to write report {}", path.display()))?;
        info!(path = %path.display(), "report written");
    }
    Ok(())
}

fn merge(args: MergeArgs) -> Result<()> {
    let target = args.data_dir.join("trades").join(format!("{}.jsonl", args.slug));
    let stats = merge_into_archive(&target, &args.incoming, ReaderConfig::default())?;

    let index_path = args.data_dir.join("cache").join("index.json");
    let mut index = CacheIndex::load(&index_path);
    index.record_market_trades(&args.slug, &stats, Utc::now().timestamp_millis());
    index.save(&index_path)?;
    info!(
        slug = %args.slug,
        count = stats.count,
        duplicates = stats.duplicates_dropped,
        "archive merged and cache index updated"
    );
    Ok(())
}

fn parse_range(from: Option<&str>, to: Option<&str>) -> Result<Option<(Millis, Millis)>> {
    let parse = |s: &str| -> Result<Millis> {
        Ok(DateTime::parse_from_rfc3339(s)
            .with_context(|| format!("invalid RFC3339 timestamp: {s}"))?
            .with_timezone(&Utc)
            .timestamp_millis())
    };
    match (from, to) {
        (None, None) => Ok(None),
        (from, to) => {
            let from = from.map(parse).transpose()?.unwrap_or(Millis::MIN);
            let to = to.map(parse).transpose()?.unwrap_or(Millis::MAX);
            anyhow::ensure!(from <= to, "--from must not be after --to");
            Ok(Some((from, to)))
        }
    }
}

/// Load markets.jsonl and resolve per-slug/per-coin archive paths. Markets
/// without a trade archive on disk are left out here so the scheduler's
/// missing-data warnings fire once with full context.
fn resolve_inputs(data_dir: &Path, range: Option<(Millis, Millis)>) -> Result<ReplayInputs> {
    let markets_path = data_dir.join("markets.jsonl");
    let raw = fs::read_to_string(&markets_path)
        .with_context(|| format!("failed to read {}", markets_path.display()))?;

    let mut markets_by_coin: HashMap<CoinId, Vec<MarketMeta>> = HashMap::new();
    let mut trade_paths = HashMap::new();
    let mut parse_failures = 0u64;
    for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let meta: MarketMeta = match serde_json::from_str(line) {
            Ok(meta) => meta,
            Err(err) => {
                parse_failures += 1;
                if parse_failures == 1 {
                    warn!(error = %err, "skipping unparseable market metadata line");
                }
                continue;
            }
        };
        let trade_path = data_dir.join("trades").join(format!("{}.jsonl", meta.slug));
        if trade_path.exists() {
            trade_paths.insert(meta.slug.clone(), trade_path);
        }
        markets_by_coin.entry(meta.coin).or_default().push(meta);
    }
    anyhow::ensure!(
        !markets_by_coin.is_empty(),
        "no market metadata found in {}",
        markets_path.display()
    );

    let tick_paths = markets_by_coin
        .keys()
        .filter_map(|&coin| {
            let path = data_dir.join("crypto").join(format!("{coin}.jsonl"));
            path.exists().then_some((coin, path))
        })
        .collect();

    Ok(ReplayInputs {
        markets_by_coin,
        trade_paths,
        tick_paths,
        range,
    })
}

fn report(summaries: &[ProfileSummary]) {
    info!("{:-<78}", "");
    info!(
        "{:<20} {:>8} {:>7} {:>6} {:>7} {:>12} {:>10}",
        "profile", "trades", "crosses", "wins", "losses", "profit", "runtime"
    );
    for s in summaries {
        info!(
            "{:<20} {:>8} {:>7} {:>6} {:>7} {:>12.2} {:>9.1}s",
            s.profile,
            s.total_trades,
            s.cross_trades.map_or_else(|| "-".into(), |c| c.to_string()),
            s.wins,
            s.losses,
            s.total_profit,
            s.runtime_sec
        );
    }
    info!("{:-<78}", "");
}
