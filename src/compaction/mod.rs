//! # Compaction Module
//!
//! Leveled compaction with file-count triggers and TTL-based tombstone
//! garbage collection at the bottom level.
//!
//! ## Trigger & selection
//!
//! A level is over-full when its file count exceeds its threshold
//! (L0 has its own, lower limit; deeper levels share `max_per_level`).
//! Selection takes the **oldest** excess files from the over-full
//! level plus every next-level file whose key range overlaps them.
//!
//! ## Merge
//!
//! Inputs are merged with the engine's k-way
//! [`MergeIterator`](crate::engine::iter::MergeIterator) in
//! `(key ASC, seq DESC)` order. Per key group the winner is the
//! highest-seq record; on a full tie a tombstone wins. Older versions
//! are dropped.
//!
//! ## Tombstone GC
//!
//! A winning tombstone is dropped only when this is a **bottom-level**
//! compaction (no live files at any deeper level) *and* its deletion
//! timestamp is at least `ttl` old. The timestamp comes from the
//! tombstone's 8-byte value payload when present, else from the
//! engine's seq → time oracle; with neither, the tombstone is
//! retained.
//!
//! ## Atomicity protocol
//!
//! ```text
//! CompactionStart(level, inputs)          → manifest (durable)
//! write output SST to the next level
//! CompactionEnd(level, output, inputs, …) → manifest (durable)
//! SstDelete(input) × N                    → manifest
//! unlink inputs once all reader handles release
//! ```
//!
//! Crash before `CompactionEnd`: the output is an orphan removed on
//! next open and the inputs remain live. After `CompactionEnd` but
//! before the deletes, reads observe old and new files — harmless,
//! reconciled by the delete events. A compaction whose output would be
//! empty writes `CompactionEnd` with an empty output name, which the
//! manifest fold treats as "no file produced".

#[cfg(test)]
mod tests;

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, info};

use crate::engine::iter::{MergeIterator, dedupe_newest};
use crate::manifest::{Manifest, ManifestError, ManifestEvent, key_hex};
use crate::memtable::MemRecord;
use crate::sstable::{SstError, SstHandle, SstMeta, SstWriter};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by compaction.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// SST read/write failure.
    #[error("SST error: {0}")]
    Sst(#[from] SstError),

    /// Manifest append failure.
    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Thresholds driving compaction.
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// File-count threshold for L1 and deeper.
    pub max_per_level: usize,

    /// File-count threshold for L0 (lower: L0 files overlap freely).
    pub l0_limit: usize,

    /// Minimum tombstone age before bottom-level GC may drop it.
    pub tombstone_ttl_millis: u64,

    /// Bloom false-positive rate for compaction outputs.
    pub bloom_fp_rate: f64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            max_per_level: 10,
            l0_limit: 4,
            tombstone_ttl_millis: 24 * 60 * 60 * 1000,
            bloom_fp_rate: 0.01,
        }
    }
}

/// Maps a sequence number to an approximate wall-clock time in millis.
///
/// The engine samples `(seq, now)` pairs at flush boundaries; the
/// compactor asks it to age tombstones that carry no timestamp
/// payload. `None` means "unknown" and the tombstone is retained.
pub type SeqTimeOracle = dyn Fn(u64) -> Option<u64> + Send + Sync;

// ------------------------------------------------------------------------------------------------
// Task selection
// ------------------------------------------------------------------------------------------------

/// A selected unit of compaction work.
pub struct CompactionTask {
    /// Source level.
    pub level: u32,

    /// Inputs from the source level (oldest first).
    pub inputs: Vec<SstHandle>,

    /// Overlapping inputs from `level + 1`.
    pub next_level_inputs: Vec<SstHandle>,

    /// Whether no live data exists below `level + 1`.
    pub is_bottom: bool,
}

impl CompactionTask {
    /// All input handles, source level first.
    pub fn all_inputs(&self) -> impl Iterator<Item = &SstHandle> {
        self.inputs.iter().chain(&self.next_level_inputs)
    }

    /// Input file names in manifest order.
    pub fn input_files(&self) -> Vec<String> {
        self.all_inputs()
            .map(|handle| file_name_of(handle))
            .collect()
    }
}

fn file_name_of(handle: &SstHandle) -> String {
    handle
        .path()
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Level threshold: L0 is special.
fn threshold(config: &CompactionConfig, level: u32) -> usize {
    if level == 0 {
        config.l0_limit
    } else {
        config.max_per_level
    }
}

/// Picks the next compaction task, or `None` when no level is
/// over-full.
///
/// `levels` holds the live handles per level, oldest first — the same
/// order the manifest records seals.
pub fn pick_task(
    config: &CompactionConfig,
    levels: &[(u32, Vec<SstHandle>)],
) -> Option<CompactionTask> {
    for (level, files) in levels {
        let limit = threshold(config, *level);
        if files.len() <= limit {
            continue;
        }

        // Oldest excess files from the over-full level.
        let take = files.len() - limit + 1;
        let inputs: Vec<SstHandle> = files.iter().take(take).cloned().collect();

        // Key envelope of the selected inputs.
        let mut start: &[u8] = &[];
        let mut end: &[u8] = &[];
        for handle in &inputs {
            if start.is_empty() || handle.min_key() < start {
                start = handle.min_key();
            }
            if handle.max_key() > end {
                end = handle.max_key();
            }
        }

        // Overlapping files from the next level.
        let next_level = level + 1;
        let next_level_inputs: Vec<SstHandle> = levels
            .iter()
            .find(|(l, _)| *l == next_level)
            .map(|(_, files)| {
                files
                    .iter()
                    .filter(|handle| {
                        handle.max_key() >= start && (end.is_empty() || handle.min_key() <= end)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let is_bottom = levels
            .iter()
            .all(|(l, files)| *l <= next_level || files.is_empty());

        debug!(
            level,
            inputs = inputs.len(),
            next_level_inputs = next_level_inputs.len(),
            is_bottom,
            "compaction task selected"
        );
        return Some(CompactionTask {
            level: *level,
            inputs,
            next_level_inputs,
            is_bottom,
        });
    }
    None
}

// ------------------------------------------------------------------------------------------------
// Execution
// ------------------------------------------------------------------------------------------------

/// Result of one executed compaction.
pub struct CompactionOutcome {
    /// Source level.
    pub level: u32,

    /// Metadata of the output table (`None` when everything was
    /// eliminated).
    pub output: Option<SstMeta>,

    /// Input file names now scheduled for deletion.
    pub removed: Vec<String>,
}

/// Executes a compaction task end to end.
///
/// Merges the inputs, applies tombstone GC, writes the output table to
/// `sst_dir`, and drives the manifest protocol. The caller swaps its
/// in-memory level sets from the returned outcome and unlinks input
/// files once their reader handles drain.
pub fn run_task(
    task: &CompactionTask,
    manifest: &Manifest,
    sst_dir: &Path,
    config: &CompactionConfig,
    oracle: &SeqTimeOracle,
    now_millis: u64,
) -> Result<CompactionOutcome, CompactionError> {
    let input_files = task.input_files();
    manifest.append_durable(ManifestEvent::CompactionStart {
        level: task.level,
        inputs: input_files.clone(),
    })?;

    // Merge all inputs. Each SST iterator is collected up front so read
    // errors surface before any output exists.
    let mut sources: Vec<Box<dyn Iterator<Item = MemRecord>>> = Vec::new();
    let mut expected = 0usize;
    for handle in task.all_inputs() {
        let records: Vec<MemRecord> = handle
            .range_iter(&[], &[])
            .collect::<Result<Vec<_>, _>>()?;
        expected += records.len();
        sources.push(Box::new(records.into_iter()));
    }
    let merged = dedupe_newest(MergeIterator::new(sources));

    // Survivor selection with bottom-level tombstone GC.
    let ttl = config.tombstone_ttl_millis;
    let survivors = merged.filter(|rec| {
        if !rec.is_tombstone() {
            return true;
        }
        if !task.is_bottom {
            return true;
        }
        let deletion_ts = if rec.value.len() == 8 {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&rec.value);
            Some(u64::from_le_bytes(bytes))
        } else {
            oracle(rec.seq)
        };
        match deletion_ts {
            Some(ts) => now_millis.saturating_sub(ts) < ttl,
            // Unknown age: keep the tombstone.
            None => true,
        }
    });

    // Write the output table at the next level.
    let target_level = task.level + 1;
    let output_name = sst_file_name(target_level);
    let output_path = sst_dir.join(&output_name);
    let mut writer = SstWriter::create(&output_path, expected, config.bloom_fp_rate)?;
    let mut written = 0u64;
    for rec in survivors {
        writer.add(&rec.key, &rec.value, rec.seq, rec.flags)?;
        written += 1;
    }

    let output_meta = if written > 0 {
        Some(writer.finish()?)
    } else {
        // Nothing survived; drop the writer and its tmp file.
        drop(writer);
        let _ = std::fs::remove_file(output_path.with_extension("tmp"));
        None
    };

    manifest.append_durable(ManifestEvent::CompactionEnd {
        level: task.level,
        output: output_meta
            .as_ref()
            .map(|_| output_name.clone())
            .unwrap_or_default(),
        inputs: input_files.clone(),
        entries: output_meta.as_ref().map(|meta| meta.entries as u64).unwrap_or(0),
        first_key_hex: output_meta.as_ref().map(|meta| key_hex(&meta.first_key)),
        last_key_hex: output_meta.as_ref().map(|meta| key_hex(&meta.last_key)),
    })?;

    for file in &input_files {
        manifest.append_durable(ManifestEvent::SstDelete { file: file.clone() })?;
    }

    info!(
        level = task.level,
        inputs = input_files.len(),
        survivors = written,
        output = ?output_meta.as_ref().map(|meta| &meta.path),
        "compaction finished"
    );
    Ok(CompactionOutcome {
        level: task.level,
        output: output_meta,
        removed: input_files,
    })
}

// ------------------------------------------------------------------------------------------------
// File naming
// ------------------------------------------------------------------------------------------------

/// Builds an SST file name: `L{level}_{epochMillis}_{shortUuid}.sst`.
pub fn sst_file_name(level: u32) -> String {
    let epoch_millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let short_uuid: u32 = rand::random();
    format!("L{level}_{epoch_millis}_{short_uuid:08x}.sst")
}
