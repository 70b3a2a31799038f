//! Replay Runner
//!
//! Drives the scheduler and decision kernels to completion. Two modes:
//! real-time (timer-paced, scaled by a speed factor) and max-speed (a tight
//! event-time loop). Each step advances to the earliest of the scheduler's
//! next event, the kernels' next pending execution, and (in real-time mode)
//! the next evaluation tick; expired markets are resolved before live ones
//! are re-evaluated, and the dirty-coin set bounds re-evaluation in between
//! scheduled ticks.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

use crate::replay::config::{ReplayEnv, SweepEnv};
use crate::replay::scheduler::{EventScheduler, ReplayInputs};
use crate::replay::signals::SignalConfig;
use crate::replay::types::{CoinId, Millis, ProfileSummary};
use crate::strategy::kernel::CoinKernel;
use crate::strategy::profile::Profile;

/// Default evaluation tick spacing in real-time mode.
pub const DEFAULT_TICK_INTERVAL_MS: Millis = 250;
/// Default headless progress log spacing (simulated time).
pub const HEADLESS_LOG_INTERVAL_MS: Millis = 15_000;

/// How a replay is driven.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RunMode {
    /// Timer-paced, `speed` simulated milliseconds per wall millisecond.
    RealTime { speed: f64, tick_interval_ms: Millis },
    /// Tight event-time loop, no pacing, no periodic progress log.
    MaxSpeed,
}

/// Cooperative stop flag shared with the host.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// One replay over one set of inputs and profiles.
pub struct ReplayRunner {
    scheduler: EventScheduler,
    kernels: HashMap<CoinId, CoinKernel>,
    coins: Vec<CoinId>,
    profile_order: Vec<String>,
    env: ReplayEnv,
    stop: StopHandle,
    started_at: Instant,
}

impl ReplayRunner {
    pub fn new(
        inputs: ReplayInputs,
        profiles: &[Profile],
        env: ReplayEnv,
        sweep: SweepEnv,
        signal_config: SignalConfig,
    ) -> Result<Self> {
        let scheduler = EventScheduler::new(inputs, env.clone(), signal_config)?;
        let coins = scheduler.coins().to_vec();
        let mut kernels = HashMap::new();
        for &coin in &coins {
            if let Some(kernel) = CoinKernel::new(coin, profiles, sweep, signal_config)? {
                kernels.insert(coin, kernel);
            }
        }
        Ok(Self {
            scheduler,
            kernels,
            coins,
            profile_order: profiles.iter().map(|p| p.name.clone()).collect(),
            env,
            stop: StopHandle::default(),
            started_at: Instant::now(),
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn fingerprint_hash(&self) -> u64 {
        self.scheduler.fingerprint().hash()
    }

    /// Run to completion in the given mode, handing the summaries to the
    /// completion callback before returning them.
    pub async fn start<F>(&mut self, mode: RunMode, on_complete: F) -> Vec<ProfileSummary>
    where
        F: FnOnce(&[ProfileSummary]),
    {
        let summaries = match mode {
            RunMode::RealTime {
                speed,
                tick_interval_ms,
            } => self.run_real_time(speed, tick_interval_ms).await,
            RunMode::MaxSpeed => self.run_max_speed(),
        };
        on_complete(&summaries);
        summaries
    }

    /// Max-speed replay: run the event loop to exhaustion.
    pub fn run_max_speed(&mut self) -> Vec<ProfileSummary> {
        self.started_at = Instant::now();
        while !self.stop.is_stopped() {
            let Some(t) = self.next_step_time(None) else {
                break;
            };
            self.step(t, false);
        }
        self.summaries()
    }

    /// Real-time replay: pace simulated time against the wall clock,
    /// `speed` simulated milliseconds per wall millisecond.
    pub async fn run_real_time(&mut self, speed: f64, tick_interval_ms: Millis) -> Vec<ProfileSummary> {
        let speed = if speed.is_finite() && speed > 0.0 { speed } else { 1.0 };
        let interval = tick_interval_ms.max(1);
        self.started_at = Instant::now();
        let mut next_log_at: Option<Millis> = None;

        while !self.stop.is_stopped() {
            let sim_now = self.scheduler.now();
            let eval_tick = if sim_now == Millis::MIN {
                None
            } else {
                Some(sim_now + (interval as f64 * speed) as Millis)
            };
            let Some(t) = self.next_step_time(eval_tick) else {
                break;
            };

            if sim_now != Millis::MIN && t > sim_now {
                let wall_ms = ((t - sim_now) as f64 / speed).min(interval as f64);
                tokio::time::sleep(Duration::from_millis(wall_ms.max(0.0) as u64)).await;
                if self.stop.is_stopped() {
                    break;
                }
            }

            let forced_eval = eval_tick.is_some_and(|tick| t >= tick);
            self.step(t, forced_eval);

            let log_due = *next_log_at.get_or_insert(t + HEADLESS_LOG_INTERVAL_MS);
            if t >= log_due {
                self.log_progress();
                next_log_at = Some(t + HEADLESS_LOG_INTERVAL_MS);
            }
        }
        self.summaries()
    }

    /// Earliest of scheduler event, kernel pending, and optional eval tick.
    fn next_step_time(&mut self, eval_tick: Option<Millis>) -> Option<Millis> {
        let sched = self.scheduler.next_event_time();
        let pending = self
            .kernels
            .values()
            .filter_map(|k| k.next_pending_due())
            .min();
        let mut next = match (sched, pending) {
            (None, None) => return None,
            (Some(a), None) | (None, Some(a)) => a,
            (Some(a), Some(b)) => a.min(b),
        };
        if let Some(tick) = eval_tick {
            next = next.min(tick);
        }
        Some(next.max(self.scheduler.now()))
    }

    /// One step: advance the scheduler, resolve expired markets, evaluate.
    fn step(&mut self, t: Millis, force_all: bool) {
        self.scheduler.advance_to(t);

        for state in self.scheduler.take_expired() {
            if let Some(kernel) = self.kernels.get_mut(&state.meta.coin) {
                kernel.evaluate(&state, t);
            }
        }

        let mut eval: Vec<CoinId> = if force_all || !self.env.dirty_eval {
            let _ = self.scheduler.take_dirty();
            self.coins.clone()
        } else {
            self.scheduler.take_dirty()
        };
        // Pending executions come due without any new market data; those
        // coins must be evaluated regardless of dirtiness.
        for (&coin, kernel) in &self.kernels {
            if kernel.next_pending_due().is_some_and(|due| due <= t) && !eval.contains(&coin) {
                eval.push(coin);
            }
        }
        eval.sort();

        for coin in eval {
            let Some(kernel) = self.kernels.get_mut(&coin) else {
                continue;
            };
            if let Some(state) = self.scheduler.active_state(coin) {
                kernel.evaluate(state, t);
            }
        }
    }

    fn log_progress(&self) {
        for (coin, state) in self.scheduler.active_states() {
            info!(
                coin = %coin,
                slug = state.slug(),
                crypto = state.crypto_price,
                threshold = state.threshold(),
                time_left_sec = %format!("{:.1}", state.time_left_sec),
                trades_window = state.recent_trades.len(),
                "replay progress"
            );
        }
    }

    /// Reduce per-coin kernel summaries into one row per profile, in the
    /// order profiles were supplied.
    pub fn summaries(&self) -> Vec<ProfileSummary> {
        let runtime_sec = self.started_at.elapsed().as_secs_f64();
        let mut by_name: HashMap<String, ProfileSummary> = HashMap::new();
        let mut coins: Vec<&CoinId> = self.kernels.keys().collect();
        coins.sort();
        for coin in coins {
            for summary in self.kernels[coin].summaries(runtime_sec) {
                by_name
                    .entry(summary.profile.clone())
                    .and_modify(|acc| acc.absorb(&summary))
                    .or_insert(summary);
            }
        }
        self.profile_order
            .iter()
            .filter_map(|name| by_name.remove(name))
            .collect()
    }
}
