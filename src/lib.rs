//! ReplayBot Backend Library
//!
//! Exposes the replay engine and decision layer for binaries and tests.

pub mod replay;
pub mod strategy;

// Re-export the headline types at crate root for convenience
pub use replay::{
    CoinId, EventScheduler, MarketMeta, Millis, ProfileSummary, ReplayEnv, ReplayInputs,
    ReplayRunner, StopHandle, SweepEnv, Tick, TradeEvent,
};
pub use strategy::{parse_profiles, CoinKernel, Profile};
