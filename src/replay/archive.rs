//! Trade Archive Merge
//!
//! Two-way external merge of two already-sorted trade archives into a third,
//! deduplicated by the natural trade key. Both inputs are streamed through
//! line readers and the output goes through a buffered writer into a
//! temporary file that is atomically renamed onto the target on completion,
//! so a crash mid-merge leaves the source archives intact.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::replay::stream::{JsonlReader, ReaderConfig};
use crate::replay::trade_order::compare_trades;
use crate::replay::types::{Millis, TradeEvent, TradeKey};

/// Output statistics fed into the cache index after a merge.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MergeStats {
    pub count: u64,
    pub min_ts: Option<Millis>,
    pub max_ts: Option<Millis>,
    pub duplicates_dropped: u64,
}

impl MergeStats {
    fn record(&mut self, trade: &TradeEvent) {
        self.count += 1;
        self.min_ts = Some(self.min_ts.map_or(trade.timestamp, |ts| ts.min(trade.timestamp)));
        self.max_ts = Some(self.max_ts.map_or(trade.timestamp, |ts| ts.max(trade.timestamp)));
    }
}

/// Merge two sorted trade archives into `target`.
///
/// On each step the smaller head is emitted (ties favour the left input)
/// unless its natural key equals the last emitted key, in which case the
/// duplicate is dropped without emission.
pub fn merge_trade_archives(
    left: &Path,
    right: &Path,
    target: &Path,
    config: ReaderConfig,
) -> Result<MergeStats> {
    let mut left_reader: JsonlReader<TradeEvent> = JsonlReader::open_json(left, config)?;
    let mut right_reader: JsonlReader<TradeEvent> = JsonlReader::open_json(right, config)?;

    let tmp_path = temp_sibling(target);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create archive dir {}", parent.display()))?;
    }
    let tmp_file = File::create(&tmp_path)
        .with_context(|| format!("failed to create merge temp file {}", tmp_path.display()))?;
    let mut writer = BufWriter::new(tmp_file);

    let mut stats = MergeStats::default();
    let mut last_key: Option<TradeKey> = None;

    loop {
        let take_left = match (left_reader.peek(), right_reader.peek()) {
            (None, None) => break,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (Some(l), Some(r)) => compare_trades(l, r) != std::cmp::Ordering::Greater,
        };
        let trade = if take_left {
            left_reader.shift()
        } else {
            right_reader.shift()
        };
        let Some(trade) = trade else { break };

        let key = trade.natural_key();
        if last_key.as_ref() == Some(&key) {
            stats.duplicates_dropped += 1;
            continue;
        }
        serde_json::to_writer(&mut writer, &trade).context("failed to encode merged trade")?;
        writer.write_all(b"\n").context("failed to write merged trade")?;
        stats.record(&trade);
        last_key = Some(key);
    }

    writer
        .into_inner()
        .context("failed to flush merged archive")?
        .sync_all()
        .context("failed to sync merged archive")?;
    fs::rename(&tmp_path, target).with_context(|| {
        format!(
            "failed to rename {} onto {}",
            tmp_path.display(),
            target.display()
        )
    })?;

    debug!(
        left = %left.display(),
        right = %right.display(),
        target = %target.display(),
        count = stats.count,
        duplicates = stats.duplicates_dropped,
        "merged trade archives"
    );
    Ok(stats)
}

fn temp_sibling(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "merge".into());
    name.push(".tmp");
    target.with_file_name(name)
}

/// Merge `incoming` into an existing archive at `target` in place. When no
/// archive exists yet, the incoming file is merged with itself, which also
/// normalises ordering and strips duplicates.
pub fn merge_into_archive(target: &Path, incoming: &Path, config: ReaderConfig) -> Result<MergeStats> {
    let staged = temp_sibling(&target.with_extension("staged"));
    let existing = if target.exists() {
        fs::copy(target, &staged)
            .with_context(|| format!("failed to stage existing archive {}", target.display()))?;
        staged.clone()
    } else {
        incoming.to_path_buf()
    };
    let stats = merge_trade_archives(&existing, incoming, target, config)?;
    if staged.exists() {
        let _ = fs::remove_file(&staged);
    }
    info!(target = %target.display(), count = stats.count, "archive updated");
    Ok(stats)
}
