//! SST writer — builds a complete table file from a sorted record
//! stream.
//!
//! The writer consumes strictly key-sorted, duplicate-free records
//! (the memtable snapshot or compaction merge guarantees both), packs
//! them into 32 KiB data blocks, and finishes the file with the index
//! block, bloom block, and footer described in the
//! [module docs](super).
//!
//! # File-level checksum
//!
//! The footer's trailing `crc32c` covers `[0 .. fileSize-4)`. The
//! writer maintains the checksum incrementally as sections hit the
//! file, so finishing never re-reads what was already written.
//!
//! # Atomicity
//!
//! Everything is written to `{path}.tmp`, fsynced, then renamed into
//! place. A crash mid-build leaves only a `.tmp` orphan that open-time
//! cleanup removes.
//!
//! # Block observer
//!
//! A caller may attach a block observer: every finished data block is
//! handed to it exactly as written. The engine uses this to tee flush
//! blocks into the stripe writer without packing twice.

use std::{
    fs::{File, OpenOptions, rename},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::block::{BLOCK_SIZE, BlockPacker, FLAG_TOMBSTONE};
use crate::codec;

use super::{
    FIRST_KEY32_LEN, FOOTER_SIZE, FORMAT_VERSION, IndexEntry, MAGIC_BLOOM, MAGIC_FOOTER,
    MAGIC_INDEX, SstError, first_key32,
};
use super::bloom::BloomFilter;

/// Callback invoked with every finished data block.
pub type BlockObserver<'a> = Box<dyn FnMut(&[u8; BLOCK_SIZE]) + 'a>;

/// Metadata of a finished SST file.
#[derive(Debug, Clone)]
pub struct SstMeta {
    /// Final path of the table.
    pub path: PathBuf,

    /// Total record count.
    pub entries: u32,

    /// Smallest key written.
    pub first_key: Vec<u8>,

    /// Largest key written.
    pub last_key: Vec<u8>,

    /// Total file size in bytes.
    pub file_size: u64,

    /// Number of data blocks.
    pub blocks: usize,
}

/// Streaming writer for one SST file.
pub struct SstWriter<'a> {
    final_path: PathBuf,
    tmp_path: PathBuf,
    file: BufWriter<File>,
    packer: BlockPacker,
    bloom: BloomFilter,
    index: Vec<IndexEntry>,
    /// Running crc32c over every byte written so far.
    crc: u32,
    /// Bytes written so far (== next block offset).
    offset: u64,
    entries: u32,
    first_key: Vec<u8>,
    last_key: Vec<u8>,
    /// First key of the block currently being packed.
    block_first_key: Option<[u8; FIRST_KEY32_LEN]>,
    observer: Option<BlockObserver<'a>>,
}

impl<'a> SstWriter<'a> {
    /// Creates a writer targeting `path`.
    ///
    /// `expected_entries` sizes the bloom filter for the configured
    /// false-positive rate.
    pub fn create(
        path: impl AsRef<Path>,
        expected_entries: usize,
        bloom_fp_rate: f64,
    ) -> Result<Self, SstError> {
        let final_path = path.as_ref().to_path_buf();
        let tmp_path = final_path.with_extension("tmp");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;

        Ok(Self {
            final_path,
            tmp_path,
            file: BufWriter::new(file),
            packer: BlockPacker::new(),
            bloom: BloomFilter::with_capacity(expected_entries, bloom_fp_rate),
            index: Vec::new(),
            crc: 0,
            offset: 0,
            entries: 0,
            first_key: Vec::new(),
            last_key: Vec::new(),
            block_first_key: None,
            observer: None,
        })
    }

    /// Attaches a data-block observer (e.g. the stripe tee).
    pub fn with_block_observer(mut self, observer: BlockObserver<'a>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Appends one record. Keys must arrive strictly ascending.
    pub fn add(&mut self, key: &[u8], value: &[u8], seq: u64, flags: u8) -> Result<(), SstError> {
        if !self.last_key.is_empty() || self.entries > 0 {
            if key <= self.last_key.as_slice() {
                return Err(SstError::Internal(format!(
                    "records out of order: {:02x?} after {:02x?}",
                    &key[..key.len().min(16)],
                    &self.last_key[..self.last_key.len().min(16)],
                )));
            }
        }

        let fp = codec::key_fp64(key);
        let mini = codec::mini_key(key);
        if !self.packer.try_append(key, value, seq, flags, fp, mini)? {
            self.emit_block()?;
            // A record the packer rejects twice can never fit; try_append
            // surfaces ValueTooLarge on its own for those.
            if !self.packer.try_append(key, value, seq, flags, fp, mini)? {
                return Err(SstError::Internal("record rejected by empty packer".into()));
            }
        }

        if self.block_first_key.is_none() {
            self.block_first_key = Some(first_key32(key));
        }
        if self.first_key.is_empty() && self.entries == 0 {
            self.first_key = key.to_vec();
        }
        self.last_key = key.to_vec();
        self.bloom.insert(key);
        self.entries += 1;
        Ok(())
    }

    /// Convenience for tombstones.
    pub fn add_tombstone(&mut self, key: &[u8], seq: u64) -> Result<(), SstError> {
        self.add(key, &[], seq, FLAG_TOMBSTONE)
    }

    /// Flushes the packer's current block to the file.
    fn emit_block(&mut self) -> Result<(), SstError> {
        if self.packer.is_empty() {
            return Ok(());
        }
        let first = self
            .block_first_key
            .take()
            .ok_or_else(|| SstError::Internal("block without first key".into()))?;
        self.index.push(IndexEntry {
            first_key32: first,
            block_off: self.offset,
        });

        let file = &mut self.file;
        let crc = &mut self.crc;
        let observer = &mut self.observer;
        let mut io_result: Result<(), std::io::Error> = Ok(());
        self.packer.end_block(&mut |block: &[u8; BLOCK_SIZE]| {
            if let Err(e) = file.write_all(block) {
                io_result = Err(e);
                return;
            }
            *crc = codec::crc32c_append(*crc, block);
            if let Some(observer) = observer.as_mut() {
                observer(block);
            }
        });
        io_result?;
        self.offset += BLOCK_SIZE as u64;
        Ok(())
    }

    /// Writes a section, folding it into the running checksum.
    fn write_section(&mut self, bytes: &[u8]) -> Result<(), SstError> {
        self.file.write_all(bytes)?;
        self.crc = codec::crc32c_append(self.crc, bytes);
        self.offset += bytes.len() as u64;
        Ok(())
    }

    /// Finishes the table: final block, index, bloom, footer, fsync,
    /// atomic rename. Returns the table metadata.
    pub fn finish(mut self) -> Result<SstMeta, SstError> {
        self.emit_block()?;

        // Index block.
        let index_off = self.offset;
        let mut section = Vec::with_capacity(8 + self.index.len() * (FIRST_KEY32_LEN + 8) + 4);
        section.extend_from_slice(&MAGIC_INDEX.to_le_bytes());
        section.extend_from_slice(&(self.index.len() as u32).to_le_bytes());
        for entry in &self.index {
            section.extend_from_slice(&entry.first_key32);
            section.extend_from_slice(&entry.block_off.to_le_bytes());
        }
        let section_crc = codec::crc32c(&section);
        section.extend_from_slice(&section_crc.to_le_bytes());
        self.write_section(&section)?;

        // Bloom block.
        let bloom_off = self.offset;
        let mut section =
            Vec::with_capacity(12 + self.bloom.bit_bytes().len() + 4);
        section.extend_from_slice(&MAGIC_BLOOM.to_le_bytes());
        section.extend_from_slice(&self.bloom.bit_count().to_le_bytes());
        section.extend_from_slice(&self.bloom.hash_count().to_le_bytes());
        section.extend_from_slice(self.bloom.bit_bytes());
        let section_crc = codec::crc32c(&section);
        section.extend_from_slice(&section_crc.to_le_bytes());
        self.write_section(&section)?;

        // Footer: fold its first 28 bytes into the file CRC, then store
        // the CRC itself as the final 4 bytes.
        let mut footer = Vec::with_capacity(FOOTER_SIZE);
        footer.extend_from_slice(&MAGIC_FOOTER.to_le_bytes());
        footer.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        footer.extend_from_slice(&index_off.to_le_bytes());
        footer.extend_from_slice(&bloom_off.to_le_bytes());
        footer.extend_from_slice(&self.entries.to_le_bytes());
        let file_crc = codec::crc32c_append(self.crc, &footer);
        footer.extend_from_slice(&file_crc.to_le_bytes());
        self.file.write_all(&footer)?;
        self.offset += FOOTER_SIZE as u64;

        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        rename(&self.tmp_path, &self.final_path)?;

        debug!(
            path = %self.final_path.display(),
            entries = self.entries,
            blocks = self.index.len(),
            size = self.offset,
            "SST sealed"
        );
        Ok(SstMeta {
            path: self.final_path,
            entries: self.entries,
            first_key: self.first_key,
            last_key: self.last_key,
            file_size: self.offset,
            blocks: self.index.len(),
        })
    }
}
