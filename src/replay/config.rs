//! Environment Knobs
//!
//! Replay behaviour is tuned through `BACKTEST_*` and `SWEEP_*` environment
//! variables, each accepting a numeric or boolean token. Invalid values fall
//! back to the documented defaults rather than failing the run.

use std::env;

use crate::replay::stream::ReaderConfig;
use crate::replay::types::Millis;

fn get_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match get_env(key) {
        None => default,
        Some(v) => match v.to_lowercase().as_str() {
            "1" | "true" | "yes" | "y" | "on" => true,
            "0" | "false" | "no" | "n" | "off" => false,
            other => other.parse::<f64>().map(|n| n != 0.0).unwrap_or(default),
        },
    }
}

fn env_i64(key: &str, default: i64) -> i64 {
    get_env(key)
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    get_env(key)
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|&v| v > 0)
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    get_env(key)
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}

/// Scheduler/runner-level knobs.
#[derive(Debug, Clone)]
pub struct ReplayEnv {
    /// Pipeline latency added to every tick and to market close.
    pub latency_ms: Millis,
    /// Use the keyed-heap scheduler index (linear scan when disabled).
    pub event_queue: bool,
    /// Restrict between-tick kernel evaluation to dirty coins.
    pub dirty_eval: bool,
    pub tick_buffer_lines: usize,
    pub trade_buffer_lines: usize,
    pub chunk_bytes: usize,
    /// Fan out one worker per coin in fast mode.
    pub coin_workers: bool,
    pub coin_worker_limit: usize,
}

impl Default for ReplayEnv {
    fn default() -> Self {
        Self {
            latency_ms: 80,
            event_queue: true,
            dirty_eval: true,
            tick_buffer_lines: 5_000,
            trade_buffer_lines: 2_000,
            chunk_bytes: 1 << 20,
            coin_workers: true,
            coin_worker_limit: default_worker_limit(),
        }
    }
}

impl ReplayEnv {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            latency_ms: env_i64("BACKTEST_LATENCY_MS", defaults.latency_ms).max(0),
            event_queue: env_bool("BACKTEST_EVENT_QUEUE", defaults.event_queue),
            dirty_eval: env_bool("BACKTEST_DIRTY_EVAL", defaults.dirty_eval),
            tick_buffer_lines: env_usize(
                "BACKTEST_STREAM_TICK_BUFFER_LINES",
                defaults.tick_buffer_lines,
            ),
            trade_buffer_lines: env_usize(
                "BACKTEST_STREAM_TRADE_BUFFER_LINES",
                defaults.trade_buffer_lines,
            ),
            chunk_bytes: env_usize("BACKTEST_STREAM_CHUNK_BYTES", defaults.chunk_bytes),
            coin_workers: env_bool("BACKTEST_COIN_WORKERS", defaults.coin_workers),
            coin_worker_limit: env_usize("BACKTEST_COIN_WORKER_LIMIT", defaults.coin_worker_limit),
        }
    }

    pub fn tick_reader_config(&self) -> ReaderConfig {
        ReaderConfig {
            chunk_bytes: self.chunk_bytes,
            buffer_lines: self.tick_buffer_lines,
        }
    }

    pub fn trade_reader_config(&self) -> ReaderConfig {
        ReaderConfig {
            chunk_bytes: self.chunk_bytes,
            buffer_lines: self.trade_buffer_lines,
        }
    }
}

/// Decision-kernel sweep knobs.
#[derive(Debug, Clone, Copy)]
pub struct SweepEnv {
    /// Delay between a passing entry decision and its execution.
    pub latency_base_ms: Millis,
    /// Minimum spacing between decisions per profile.
    pub cooldown_ms: Millis,
    /// Cross without requiring a favoured-side flip since entry.
    pub cross_allow_no_flip: bool,
    /// When finite, a confidence floor forced onto every entry.
    pub force_min_confidence: f64,
}

impl Default for SweepEnv {
    fn default() -> Self {
        Self {
            latency_base_ms: 15,
            cooldown_ms: 200,
            cross_allow_no_flip: true,
            force_min_confidence: f64::NAN,
        }
    }
}

impl SweepEnv {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            latency_base_ms: env_i64("SWEEP_DECISION_LATENCY_BASE_MS", defaults.latency_base_ms)
                .max(0),
            cooldown_ms: env_i64("SWEEP_DECISION_COOLDOWN_MS", defaults.cooldown_ms).max(0),
            cross_allow_no_flip: env_bool("SWEEP_CROSS_ALLOW_NO_FLIP", defaults.cross_allow_no_flip),
            force_min_confidence: env_f64(
                "SWEEP_FORCE_MIN_CONFIDENCE",
                defaults.force_min_confidence,
            ),
        }
    }
}

fn default_worker_limit() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
