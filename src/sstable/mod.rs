//! Sorted String Table (SST) Module
//!
//! Immutable, sorted, on-disk runs: 32 KiB data blocks, a sparse key
//! index, a bloom filter, and a fixed 32-byte footer. Files are written
//! once (atomically, `.tmp` → rename) and never modified.
//!
//! # On-disk layout
//!
//! ```text
//! [ data block × N, each 32 KiB ]
//! [ index block ]   AKIX: [magic u32][count u32]
//!                         [(firstKey32[32] ‖ blockOff u64) × count]
//!                         [crc32c u32 over everything before]
//! [ bloom block ]   AKBL: [magic u32][bitCount u32][hashCount u32]
//!                         [bit bytes][crc32c u32 over everything before]
//! [ footer 32 B ]   AKSS: [magic u32][ver u32 = 1][indexOff u64]
//!                         [bloomOff u64][entries u32][crc32c u32]
//! ```
//!
//! The footer's `crc32c` is the file-level checksum over
//! `[0 .. fileSize-4)` — every byte of the file except the checksum
//! itself. `firstKey32` is the first 32 bytes of a block's first key,
//! zero-padded.
//!
//! # Reading
//!
//! [`SstReader::open`] validates the footer (magic, version, file CRC),
//! memory-maps the file, and loads the index and bloom blocks. Point
//! lookups bloom-prefilter, binary-search the index for the candidate
//! block (largest `firstKey32 ≤ key`), CRC-validate that block, and
//! scan it with the `miniKey`/`keyFP64` fast path before any full key
//! compare. Range scans lower-bound on the index and walk blocks
//! forward.
//!
//! # Handles
//!
//! [`SstHandle`] wraps the reader in an atomic refcount. Readers may
//! hold handles while the compactor schedules the file for deletion;
//! the engine unlinks only when every handle is gone **and** the
//! manifest has durably recorded the delete.

pub mod bloom;
pub mod builder;

#[cfg(test)]
mod tests;

pub use builder::{SstMeta, SstWriter};

use std::{
    fs::File,
    io,
    ops::Deref,
    path::{Path, PathBuf},
    sync::{Arc, Weak},
};

use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, trace};

use crate::block::{BLOCK_SIZE, BlockError, RecordCursor, RecordView};
use crate::codec;
use crate::memtable::MemRecord;

use bloom::BloomFilter;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Footer magic `'AKSS'`.
pub const MAGIC_FOOTER: u32 = 0x414B_5353;

/// Index block magic `'AKIX'`.
pub const MAGIC_INDEX: u32 = 0x414B_4958;

/// Bloom block magic `'AKBL'`.
pub const MAGIC_BLOOM: u32 = 0x414B_424C;

/// Fixed footer size.
pub const FOOTER_SIZE: usize = 32;

/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

/// Width of the truncated first-key prefix stored per index entry.
pub const FIRST_KEY32_LEN: usize = 32;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by SST operations.
#[derive(Debug, Error)]
pub enum SstError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Footer magic/version/CRC mismatch — the file is excluded from the
    /// live set.
    #[error("SST footer invalid: {0}")]
    FooterInvalid(&'static str),

    /// A data/index/bloom block failed its CRC or framing.
    #[error("SST block: {0}")]
    Block(#[from] BlockError),

    /// Structural failure outside block framing.
    #[error("SST corrupt: {0}")]
    Corrupt(&'static str),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Index entries
// ------------------------------------------------------------------------------------------------

/// One sparse-index entry: a block's truncated first key and its file
/// offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// First 32 bytes of the block's first key, zero-padded.
    pub first_key32: [u8; FIRST_KEY32_LEN],

    /// Byte offset of the block in the file.
    pub block_off: u64,
}

/// Truncates `key` to its zero-padded 32-byte index prefix.
pub fn first_key32(key: &[u8]) -> [u8; FIRST_KEY32_LEN] {
    let mut out = [0u8; FIRST_KEY32_LEN];
    let n = key.len().min(FIRST_KEY32_LEN);
    out[..n].copy_from_slice(&key[..n]);
    out
}

// ------------------------------------------------------------------------------------------------
// SstReader
// ------------------------------------------------------------------------------------------------

/// Memory-mapped reader over one immutable SST file.
#[derive(Debug)]
pub struct SstReader {
    path: PathBuf,
    mmap: Mmap,
    index: Vec<IndexEntry>,
    bloom: BloomFilter,
    entries: u32,
    min_key: Vec<u8>,
    max_key: Vec<u8>,
    max_seq: u64,
}

impl SstReader {
    /// Opens and fully validates an SST file.
    ///
    /// Verifies the footer magic, version, and (when non-zero) the
    /// file-level CRC, then loads the index and bloom blocks. Any
    /// failure is [`SstError::FooterInvalid`] or [`SstError::Corrupt`]
    /// and the caller excludes the file from the live set.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SstError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        // Safety: SST files are immutable once renamed into place and
        // the mmap is read-only; all offsets are bounds-checked below.
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < FOOTER_SIZE {
            return Err(SstError::FooterInvalid("file shorter than footer"));
        }
        let footer = &mmap[mmap.len() - FOOTER_SIZE..];
        let magic = u32::from_le_bytes([footer[0], footer[1], footer[2], footer[3]]);
        if magic != MAGIC_FOOTER {
            return Err(SstError::FooterInvalid("bad magic"));
        }
        let version = u32::from_le_bytes([footer[4], footer[5], footer[6], footer[7]]);
        if version != FORMAT_VERSION {
            return Err(SstError::FooterInvalid("unsupported version"));
        }
        let index_off = u64::from_le_bytes([
            footer[8], footer[9], footer[10], footer[11], footer[12], footer[13], footer[14],
            footer[15],
        ]) as usize;
        let bloom_off = u64::from_le_bytes([
            footer[16], footer[17], footer[18], footer[19], footer[20], footer[21], footer[22],
            footer[23],
        ]) as usize;
        let entries = u32::from_le_bytes([footer[24], footer[25], footer[26], footer[27]]);
        let stored_crc = u32::from_le_bytes([footer[28], footer[29], footer[30], footer[31]]);

        if stored_crc != 0 {
            let computed = codec::crc32c(&mmap[..mmap.len() - 4]);
            if computed != stored_crc {
                return Err(SstError::FooterInvalid("file checksum mismatch"));
            }
        }

        if index_off >= mmap.len() - FOOTER_SIZE
            || bloom_off >= mmap.len() - FOOTER_SIZE
            || bloom_off <= index_off
        {
            return Err(SstError::FooterInvalid("section offset out of range"));
        }

        let index = parse_index_block(&mmap[index_off..bloom_off])?;
        let bloom = parse_bloom_block(&mmap[bloom_off..mmap.len() - FOOTER_SIZE])?;

        let mut reader = Self {
            path,
            mmap,
            index,
            bloom,
            entries,
            min_key: Vec::new(),
            max_key: Vec::new(),
            max_seq: 0,
        };
        reader.load_key_bounds()?;
        trace!(path = %reader.path.display(), entries, blocks = reader.index.len(), "SST opened");
        Ok(reader)
    }

    /// Derives exact min/max keys and max seq by scanning the first and
    /// last data blocks (the index only stores truncated prefixes).
    fn load_key_bounds(&mut self) -> Result<(), SstError> {
        let Some(first) = self.index.first() else {
            return Ok(());
        };
        let mut cursor = RecordCursor::new(self.block_slice(first.block_off)?)?;
        if let Some(rec) = cursor.try_next()? {
            self.min_key = rec.key.to_vec();
        }

        let last = self.index[self.index.len() - 1];
        let mut cursor = RecordCursor::new(self.block_slice(last.block_off)?)?;
        let mut last_key = Vec::new();
        while let Some(rec) = cursor.try_next()? {
            last_key = rec.key.to_vec();
        }
        self.max_key = last_key;

        // Max seq needs all blocks; it is cheap relative to open I/O and
        // recovery depends on it.
        let mut max_seq = 0;
        for entry in &self.index {
            let mut cursor = RecordCursor::new(self.block_slice(entry.block_off)?)?;
            while let Some(rec) = cursor.try_next()? {
                max_seq = max_seq.max(rec.seq());
            }
        }
        self.max_seq = max_seq;
        Ok(())
    }

    fn block_slice(&self, off: u64) -> Result<&[u8], SstError> {
        let off = off as usize;
        let end = off
            .checked_add(BLOCK_SIZE)
            .ok_or(SstError::Corrupt("block offset overflow"))?;
        if end > self.mmap.len() {
            return Err(SstError::Corrupt("block offset out of range"));
        }
        Ok(&self.mmap[off..end])
    }

    /// File path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total record count.
    pub fn entries(&self) -> u32 {
        self.entries
    }

    /// File size in bytes.
    pub fn file_size(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// Smallest key in the table (empty when the table is empty).
    pub fn min_key(&self) -> &[u8] {
        &self.min_key
    }

    /// Largest key in the table.
    pub fn max_key(&self) -> &[u8] {
        &self.max_key
    }

    /// Highest seq in the table.
    pub fn max_seq(&self) -> u64 {
        self.max_seq
    }

    /// Whether `[start, end)` overlaps this table's key range.
    pub fn overlaps(&self, start: &[u8], end: &[u8]) -> bool {
        if self.index.is_empty() {
            return false;
        }
        let after_end = !end.is_empty() && self.min_key.as_slice() >= end;
        let before_start = self.max_key.as_slice() < start;
        !(after_end || before_start)
    }

    /// Bloom-filter membership test: `false` means the key is
    /// definitely absent from this table.
    pub fn might_contain(&self, key: &[u8]) -> bool {
        self.bloom.might_contain(key)
    }

    /// Index position of the candidate block for `key`: the largest
    /// entry with `firstKey32 ≤ key`.
    fn candidate_block(&self, key: &[u8]) -> Option<usize> {
        if self.index.is_empty() {
            return None;
        }
        let probe = first_key32(key);
        let pos = self.index.partition_point(|e| e.first_key32 <= probe);
        Some(pos.saturating_sub(1))
    }

    /// Point lookup.
    ///
    /// Returns the record view (tombstones included) or `None`. The view
    /// borrows this reader's mapping.
    pub fn get(&self, key: &[u8]) -> Result<Option<RecordView<'_>>, SstError> {
        if !self.bloom.might_contain(key) {
            return Ok(None);
        }
        let Some(block_idx) = self.candidate_block(key) else {
            return Ok(None);
        };

        let fp = codec::key_fp64(key);
        let mini = codec::mini_key(key);

        let block = self.block_slice(self.index[block_idx].block_off)?;
        let mut cursor = RecordCursor::new(block)?;
        while let Some(rec) = cursor.try_next()? {
            // Blocks are sorted; stop once past the key.
            if rec.header.mini_key == mini && rec.header.key_fp64 == fp && rec.key == key {
                return Ok(Some(rec));
            }
            if rec.key > key {
                break;
            }
        }
        Ok(None)
    }

    /// Range scan over `[start, end_exclusive)` (empty `end` = unbounded),
    /// yielding owned records in key order, tombstones included.
    pub fn range_iter(&self, start: &[u8], end_exclusive: &[u8]) -> SstRangeIter<'_> {
        let start_block = self.candidate_block(start).unwrap_or(0);
        SstRangeIter {
            reader: self,
            block_idx: start_block,
            cursor: None,
            start: start.to_vec(),
            end_exclusive: end_exclusive.to_vec(),
            done: self.index.is_empty(),
        }
    }
}

/// Forward iterator over an SST key range.
pub struct SstRangeIter<'a> {
    reader: &'a SstReader,
    block_idx: usize,
    cursor: Option<RecordCursor<'a>>,
    start: Vec<u8>,
    end_exclusive: Vec<u8>,
    done: bool,
}

impl Iterator for SstRangeIter<'_> {
    type Item = Result<MemRecord, SstError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if self.cursor.is_none() {
                if self.block_idx >= self.reader.index.len() {
                    self.done = true;
                    return None;
                }
                let off = self.reader.index[self.block_idx].block_off;
                let block = match self.reader.block_slice(off) {
                    Ok(block) => block,
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                };
                match RecordCursor::new(block) {
                    Ok(cursor) => self.cursor = Some(cursor),
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e.into()));
                    }
                }
            }

            let cursor = self.cursor.as_mut()?;
            match cursor.try_next() {
                Ok(Some(rec)) => {
                    if rec.key < self.start.as_slice() {
                        continue;
                    }
                    if !self.end_exclusive.is_empty() && rec.key >= self.end_exclusive.as_slice() {
                        self.done = true;
                        return None;
                    }
                    let mut owned = MemRecord::put(rec.key.to_vec(), rec.value.to_vec(), rec.seq());
                    owned.flags = rec.header.flags;
                    return Some(Ok(owned));
                }
                Ok(None) => {
                    self.cursor = None;
                    self.block_idx += 1;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Section parsers
// ------------------------------------------------------------------------------------------------

/// Parses the AKIX index section (`buf` spans index start → bloom start).
fn parse_index_block(buf: &[u8]) -> Result<Vec<IndexEntry>, SstError> {
    if buf.len() < 12 {
        return Err(SstError::Corrupt("index block too short"));
    }
    let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if magic != MAGIC_INDEX {
        return Err(SstError::Corrupt("index block magic mismatch"));
    }
    let count = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    let entry_len = FIRST_KEY32_LEN + 8;
    let expected = 8 + count * entry_len + 4;
    if buf.len() != expected {
        return Err(SstError::Corrupt("index block length mismatch"));
    }
    let stored_crc = u32::from_le_bytes([
        buf[expected - 4],
        buf[expected - 3],
        buf[expected - 2],
        buf[expected - 1],
    ]);
    if codec::crc32c(&buf[..expected - 4]) != stored_crc {
        return Err(SstError::Corrupt("index block checksum mismatch"));
    }

    let mut entries = Vec::with_capacity(count);
    let mut pos = 8;
    for _ in 0..count {
        let mut first_key32 = [0u8; FIRST_KEY32_LEN];
        first_key32.copy_from_slice(&buf[pos..pos + FIRST_KEY32_LEN]);
        pos += FIRST_KEY32_LEN;
        let block_off = u64::from_le_bytes([
            buf[pos],
            buf[pos + 1],
            buf[pos + 2],
            buf[pos + 3],
            buf[pos + 4],
            buf[pos + 5],
            buf[pos + 6],
            buf[pos + 7],
        ]);
        pos += 8;
        entries.push(IndexEntry {
            first_key32,
            block_off,
        });
    }
    Ok(entries)
}

/// Parses the AKBL bloom section (`buf` spans bloom start → footer).
fn parse_bloom_block(buf: &[u8]) -> Result<BloomFilter, SstError> {
    if buf.len() < 16 {
        return Err(SstError::Corrupt("bloom block too short"));
    }
    let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if magic != MAGIC_BLOOM {
        return Err(SstError::Corrupt("bloom block magic mismatch"));
    }
    let bit_count = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let hash_count = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
    let bit_bytes = bit_count.div_ceil(8) as usize;
    let expected = 12 + bit_bytes + 4;
    if buf.len() != expected {
        return Err(SstError::Corrupt("bloom block length mismatch"));
    }
    let stored_crc = u32::from_le_bytes([
        buf[expected - 4],
        buf[expected - 3],
        buf[expected - 2],
        buf[expected - 1],
    ]);
    if codec::crc32c(&buf[..expected - 4]) != stored_crc {
        return Err(SstError::Corrupt("bloom block checksum mismatch"));
    }
    Ok(BloomFilter::from_parts(
        buf[12..12 + bit_bytes].to_vec(),
        bit_count,
        hash_count,
    ))
}

// ------------------------------------------------------------------------------------------------
// SstHandle — refcounted reader
// ------------------------------------------------------------------------------------------------

/// Atomically refcounted handle to an open [`SstReader`].
///
/// Cloning ([`acquire`](Self::acquire)) bumps the refcount; dropping
/// releases it. The engine defers file unlink until every handle is
/// gone and the manifest has recorded the deletion.
pub struct SstHandle {
    inner: Arc<SstReader>,
}

impl SstHandle {
    /// Opens the file and wraps it in a fresh handle.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SstError> {
        let reader = SstReader::open(path)?;
        debug!(path = %reader.path().display(), "SST handle opened");
        Ok(Self {
            inner: Arc::new(reader),
        })
    }

    /// Takes an additional reference for a concurrent reader.
    pub fn acquire(&self) -> SstHandle {
        SstHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Current strong refcount (for deletion gating and stats).
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Weak reference used by the pending-delete sweep.
    pub fn downgrade(&self) -> Weak<SstReader> {
        Arc::downgrade(&self.inner)
    }
}

impl Deref for SstHandle {
    type Target = SstReader;

    fn deref(&self) -> &SstReader {
        &self.inner
    }
}

impl Clone for SstHandle {
    fn clone(&self) -> Self {
        self.acquire()
    }
}
