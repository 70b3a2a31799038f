//! Cache Index
//!
//! On-disk manifest (`cache/index.json`) describing which tick and trade
//! ranges have been fetched, consumed by the out-of-scope acquisition layer
//! and updated here after archive merges. A version mismatch is treated as an
//! empty index rather than an error.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::warn;

use crate::replay::archive::MergeStats;
use crate::replay::types::{CoinId, MarketMeta, Millis};

pub const CACHE_INDEX_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickRangeEntry {
    pub min_ts: Option<Millis>,
    pub max_ts: Option<Millis>,
    pub count: u64,
    pub last_fetched_at: Millis,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRangeEntry {
    pub min_ts: Option<Millis>,
    pub max_ts: Option<Millis>,
    pub count: u64,
    pub truncated: bool,
    pub last_fetched_at: Millis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaEntry {
    pub slug: String,
    pub coin: CoinId,
    pub start_ms: Millis,
    pub end_ms: Millis,
    pub last_fetched_at: Millis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheIndex {
    pub version: u32,
    #[serde(default)]
    pub crypto_ticks: HashMap<String, TickRangeEntry>,
    #[serde(default)]
    pub market_trades: HashMap<String, TradeRangeEntry>,
    #[serde(default)]
    pub market_meta: HashMap<String, MetaEntry>,
}

impl Default for CacheIndex {
    fn default() -> Self {
        Self {
            version: CACHE_INDEX_VERSION,
            crypto_ticks: HashMap::new(),
            market_trades: HashMap::new(),
            market_meta: HashMap::new(),
        }
    }
}

impl CacheIndex {
    /// Load an index from disk. Missing file, unparseable contents, or a
    /// version mismatch all yield an empty index.
    pub fn load(path: &Path) -> Self {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(_) => return Self::default(),
        };
        match serde_json::from_str::<CacheIndex>(&raw) {
            Ok(index) if index.version == CACHE_INDEX_VERSION => index,
            Ok(index) => {
                warn!(
                    path = %path.display(),
                    found = index.version,
                    expected = CACHE_INDEX_VERSION,
                    "cache index version mismatch, starting empty"
                );
                Self::default()
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "unreadable cache index, starting empty");
                Self::default()
            }
        }
    }

    /// Persist via temp-file-plus-rename so a crash never corrupts the index.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create cache dir {}", parent.display()))?;
        }
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(self).context("failed to encode cache index")?;
        fs::write(&tmp, body)
            .with_context(|| format!("failed to write cache index {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("failed to replace cache index {}", path.display()))?;
        Ok(())
    }

    pub fn record_market_trades(&mut self, slug: &str, stats: &MergeStats, fetched_at: Millis) {
        self.market_trades.insert(
            slug.to_string(),
            TradeRangeEntry {
                min_ts: stats.min_ts,
                max_ts: stats.max_ts,
                count: stats.count,
                truncated: false,
                last_fetched_at: fetched_at,
            },
        );
    }

    pub fn record_market_meta(&mut self, meta: &MarketMeta, fetched_at: Millis) {
        self.market_meta.insert(
            meta.slug.clone(),
            MetaEntry {
                slug: meta.slug.clone(),
                coin: meta.coin,
                start_ms: meta.start_ms,
                end_ms: meta.end_ms,
                last_fetched_at: fetched_at,
            },
        );
    }
}
