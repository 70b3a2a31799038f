//! Decision Layer
//!
//! Profile configuration, the vectorised decision kernel, and paper fill
//! simulation. The kernel owns all position and P&L mutation; the replay
//! engine only feeds it snapshots.

pub mod fills;
pub mod kernel;
pub mod profile;

pub use kernel::CoinKernel;
pub use profile::{parse_profiles, Profile, TierRule, TimedTradeConfig};

#[cfg(test)]
mod kernel_tests;
