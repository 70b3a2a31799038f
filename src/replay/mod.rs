//! Historical Replay Engine
//!
//! Deterministic event-time replay of binary up/down prediction markets.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                       ReplayRunner                         │
//! │   (drives event loop, real-time or max-speed, stop flag)   │
//! └────────────────────────────────────────────────────────────┘
//!                │                             │
//!                ▼                             ▼
//! ┌──────────────────────────┐   ┌───────────────────────────┐
//! │      EventScheduler      │   │    CoinKernel (per coin)  │
//! │ market/tick/trade merge  │──▶│  multi-profile decisions  │
//! │ KeyedHeap next-event     │   │  pending fills, P&L       │
//! └──────────────────────────┘   └───────────────────────────┘
//!        │           │
//!        ▼           ▼
//! ┌────────────┐ ┌────────────┐
//! │ JsonlReader│ │ MarketState│
//! │ (lazy IO)  │ │ books+sigs │
//! └────────────┘ └────────────┘
//! ```
//!
//! # Determinism Guarantees
//!
//! - Logical time only advances to event times the scheduler announces.
//! - Within one instant, phases apply in a fixed order: market activation,
//!   then ticks, then trades, then derived-field updates.
//! - Trade archives obey one total order (`trade_order`); merges dedup by
//!   natural key.
//! - Identical inputs, profiles, latency, and env knobs produce identical
//!   summaries (and an identical replay fingerprint).

pub mod archive;
pub mod book;
pub mod cache_index;
pub mod config;
pub mod heap;
pub mod runner;
pub mod scheduler;
pub mod shard;
pub mod signals;
pub mod state;
pub mod stream;
pub mod trade_order;
pub mod types;

pub use config::{ReplayEnv, SweepEnv};
pub use runner::{ReplayRunner, RunMode, StopHandle, DEFAULT_TICK_INTERVAL_MS};
pub use scheduler::{EventScheduler, ReplayInputs};
pub use types::{CoinId, MarketMeta, Millis, ProfileSummary, Side, Tick, TradeEvent};
