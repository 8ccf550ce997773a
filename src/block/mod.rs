//! Record and block binary format.
//!
//! This module owns the two lowest-level on-disk structures: the fixed
//! 32-byte record header (`AKHdr32`) and the fixed 32 KiB block that WAL
//! payloads, stripe lanes, and SSTable data sections are all built from.
//! The layout is bit-exact and little-endian throughout.
//!
//! # Record header (AKHdr32, 32 bytes)
//!
//! ```text
//! off  size  field     meaning
//! 0    2     kLen      key length, u16, ≤ 2^14
//! 2    4     vLen      value length, u32, ≤ PAYLOAD_LIMIT
//! 6    8     seq       global sequence number, u64
//! 14   1     flags     bit0 = TOMBSTONE; others reserved = 0
//! 15   1     pad0      MUST be 0
//! 16   8     keyFP64   SipHash-2-4(key) under the fixed seed
//! 24   8     miniKey   first min(8, kLen) key bytes, LE-packed, zero-padded
//! ```
//!
//! # Block (32,768 bytes)
//!
//! ```text
//! [0..4)              payloadLen, u32 LE
//! [4..4+payloadLen)   concatenated (AKHdr32 || key || value) records
//! [..BLOCK_SIZE-4)    zero padding
//! [BLOCK_SIZE-4..)    crc32c over [0..BLOCK_SIZE-4), u32 LE
//! ```
//!
//! Invariants: `payloadLen ≤ PAYLOAD_LIMIT`; every record fits entirely
//! inside the payload region; padding is strictly zero.
//!
//! # Reading
//!
//! [`verify_block`] checks the CRC, the payload bound, and the zero
//! padding. [`RecordCursor`] then walks the payload, validating
//! per-record bounds and yielding [`RecordView`]s that **borrow** the
//! block buffer — the cursor never copies key or value bytes.


use thiserror::Error;

use crate::codec;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Fixed block size (32 KiB).
pub const BLOCK_SIZE: usize = 32 * 1024;

/// Maximum total payload bytes per block: the block minus the 4-byte
/// length prefix and the 4-byte trailing CRC.
pub const PAYLOAD_LIMIT: usize = BLOCK_SIZE - 8;

/// Encoded size of a record header.
pub const HEADER_SIZE: usize = 32;

/// Maximum key length (16 KiB).
pub const MAX_KEY_LEN: usize = 1 << 14;

/// `flags` bit marking a record as a tombstone.
pub const FLAG_TOMBSTONE: u8 = 0x01;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by block packing and unpacking.
#[derive(Debug, Error)]
pub enum BlockError {
    /// Key exceeds [`MAX_KEY_LEN`]. Rejected at the API boundary.
    #[error("key too large: {0} bytes (max {MAX_KEY_LEN})")]
    KeyTooLarge(usize),

    /// Record exceeds the block payload limit. Rejected at the API boundary.
    #[error("value too large: record of {0} bytes exceeds payload limit {PAYLOAD_LIMIT}")]
    ValueTooLarge(usize),

    /// CRC mismatch or structural failure in a block.
    #[error("block corrupt: {0}")]
    Corrupt(&'static str),
}

// ------------------------------------------------------------------------------------------------
// Record header
// ------------------------------------------------------------------------------------------------

/// Parsed `AKHdr32` record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Key length in bytes (≤ [`MAX_KEY_LEN`]).
    pub k_len: u16,

    /// Value length in bytes (≤ [`PAYLOAD_LIMIT`]).
    pub v_len: u32,

    /// Global sequence number of this mutation.
    pub seq: u64,

    /// Record flags; bit0 = tombstone, remaining bits reserved zero.
    pub flags: u8,

    /// SipHash-2-4 fingerprint of the key under the fixed seed.
    pub key_fp64: u64,

    /// First min(8, kLen) key bytes, LE-packed and zero-padded.
    pub mini_key: u64,
}

impl RecordHeader {
    /// Serializes the header into a 32-byte array.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..2].copy_from_slice(&self.k_len.to_le_bytes());
        out[2..6].copy_from_slice(&self.v_len.to_le_bytes());
        out[6..14].copy_from_slice(&self.seq.to_le_bytes());
        out[14] = self.flags;
        // out[15] stays 0 (pad0)
        out[16..24].copy_from_slice(&self.key_fp64.to_le_bytes());
        out[24..32].copy_from_slice(&self.mini_key.to_le_bytes());
        out
    }

    /// Parses a header from the first 32 bytes of `buf`.
    ///
    /// Validates the pad byte and the length bounds; does **not** check
    /// that key/value bytes actually follow — that is the cursor's job.
    pub fn parse(buf: &[u8]) -> Result<Self, BlockError> {
        if buf.len() < HEADER_SIZE {
            return Err(BlockError::Corrupt("record header truncated"));
        }
        let k_len = u16::from_le_bytes([buf[0], buf[1]]);
        let v_len = u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]);
        let seq = u64::from_le_bytes([
            buf[6], buf[7], buf[8], buf[9], buf[10], buf[11], buf[12], buf[13],
        ]);
        let flags = buf[14];
        if buf[15] != 0 {
            return Err(BlockError::Corrupt("record header pad byte non-zero"));
        }
        if k_len as usize > MAX_KEY_LEN {
            return Err(BlockError::Corrupt("record key length out of range"));
        }
        if v_len as usize > PAYLOAD_LIMIT {
            return Err(BlockError::Corrupt("record value length out of range"));
        }
        let key_fp64 = u64::from_le_bytes([
            buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
        ]);
        let mini_key = u64::from_le_bytes([
            buf[24], buf[25], buf[26], buf[27], buf[28], buf[29], buf[30], buf[31],
        ]);
        Ok(Self {
            k_len,
            v_len,
            seq,
            flags,
            key_fp64,
            mini_key,
        })
    }

    /// Whether the tombstone flag is set.
    pub fn is_tombstone(&self) -> bool {
        self.flags & FLAG_TOMBSTONE != 0
    }
}

// ------------------------------------------------------------------------------------------------
// RecordView — zero-copy record
// ------------------------------------------------------------------------------------------------

/// A parsed record borrowing its key and value from a block buffer.
///
/// Never owns memory; the caller holds the block's lifetime.
#[derive(Debug, Clone, Copy)]
pub struct RecordView<'a> {
    /// Parsed header fields.
    pub header: RecordHeader,

    /// Key bytes, borrowed from the block.
    pub key: &'a [u8],

    /// Value bytes, borrowed from the block. Empty for tombstones.
    pub value: &'a [u8],
}

impl<'a> RecordView<'a> {
    /// Sequence number of this record.
    pub fn seq(&self) -> u64 {
        self.header.seq
    }

    /// Whether this record is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.header.is_tombstone()
    }
}

// ------------------------------------------------------------------------------------------------
// BlockPacker
// ------------------------------------------------------------------------------------------------

/// Accumulates records into a 32 KiB block buffer.
///
/// `try_append` either takes the whole record or leaves the buffer
/// untouched; `end_block` finalizes the trailer, hands the block to a
/// sink, and resets for the next block.
pub struct BlockPacker {
    /// The block under construction. Always exactly [`BLOCK_SIZE`] bytes;
    /// the unfilled region is kept zero so finalization never re-pads.
    buf: Box<[u8; BLOCK_SIZE]>,

    /// Bytes of payload written so far (excludes prefix and trailer).
    payload_len: usize,

    /// Records accepted into the current block.
    record_count: usize,
}

impl BlockPacker {
    /// Creates an empty packer.
    pub fn new() -> Self {
        Self {
            buf: Box::new([0u8; BLOCK_SIZE]),
            payload_len: 0,
            record_count: 0,
        }
    }

    /// Bytes of payload accumulated so far.
    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    /// Number of records accepted into the current block.
    pub fn record_count(&self) -> usize {
        self.record_count
    }

    /// Whether the current block holds no records.
    pub fn is_empty(&self) -> bool {
        self.record_count == 0
    }

    /// Attempts to append one record.
    ///
    /// Returns `Ok(false)` — buffer unchanged — when the record does not
    /// fit in the remaining payload space of **this** block. Records that
    /// can never fit in any block fail with [`BlockError::ValueTooLarge`]
    /// (or [`BlockError::KeyTooLarge`]); no state changes.
    pub fn try_append(
        &mut self,
        key: &[u8],
        value: &[u8],
        seq: u64,
        flags: u8,
        key_fp64: u64,
        mini_key: u64,
    ) -> Result<bool, BlockError> {
        if key.len() > MAX_KEY_LEN {
            return Err(BlockError::KeyTooLarge(key.len()));
        }
        let record_len = HEADER_SIZE + key.len() + value.len();
        if record_len > PAYLOAD_LIMIT {
            return Err(BlockError::ValueTooLarge(record_len));
        }
        if record_len > PAYLOAD_LIMIT - self.payload_len {
            return Ok(false);
        }

        let header = RecordHeader {
            k_len: key.len() as u16,
            v_len: value.len() as u32,
            seq,
            flags,
            key_fp64,
            mini_key,
        };

        let mut pos = 4 + self.payload_len;
        self.buf[pos..pos + HEADER_SIZE].copy_from_slice(&header.encode());
        pos += HEADER_SIZE;
        self.buf[pos..pos + key.len()].copy_from_slice(key);
        pos += key.len();
        self.buf[pos..pos + value.len()].copy_from_slice(value);

        self.payload_len += record_len;
        self.record_count += 1;
        Ok(true)
    }

    /// Finalizes the current block and emits it to `sink`, then resets.
    ///
    /// Writes the payload length prefix and the trailing CRC32C; padding
    /// is already zero by construction. Calling on an empty packer emits
    /// nothing.
    pub fn end_block(&mut self, sink: &mut dyn FnMut(&[u8; BLOCK_SIZE])) {
        if self.record_count == 0 {
            return;
        }
        self.buf[0..4].copy_from_slice(&(self.payload_len as u32).to_le_bytes());
        let crc = codec::crc32c(&self.buf[..BLOCK_SIZE - 4]);
        self.buf[BLOCK_SIZE - 4..].copy_from_slice(&crc.to_le_bytes());

        sink(&self.buf);

        *self.buf = [0u8; BLOCK_SIZE];
        self.payload_len = 0;
        self.record_count = 0;
    }
}

impl Default for BlockPacker {
    fn default() -> Self {
        Self::new()
    }
}

// ------------------------------------------------------------------------------------------------
// Block verification
// ------------------------------------------------------------------------------------------------

/// Validates a block's framing: size, CRC, payload bound, zero padding.
///
/// Returns the payload length on success.
pub fn verify_block(block: &[u8]) -> Result<usize, BlockError> {
    if block.len() != BLOCK_SIZE {
        return Err(BlockError::Corrupt("block size mismatch"));
    }
    let stored_crc = u32::from_le_bytes([
        block[BLOCK_SIZE - 4],
        block[BLOCK_SIZE - 3],
        block[BLOCK_SIZE - 2],
        block[BLOCK_SIZE - 1],
    ]);
    let computed = codec::crc32c(&block[..BLOCK_SIZE - 4]);
    if stored_crc != computed {
        return Err(BlockError::Corrupt("block checksum mismatch"));
    }

    let payload_len = u32::from_le_bytes([block[0], block[1], block[2], block[3]]) as usize;
    if payload_len > PAYLOAD_LIMIT {
        return Err(BlockError::Corrupt("payload length out of range"));
    }
    if block[4 + payload_len..BLOCK_SIZE - 4].iter().any(|&b| b != 0) {
        return Err(BlockError::Corrupt("non-zero padding"));
    }
    Ok(payload_len)
}

// ------------------------------------------------------------------------------------------------
// RecordCursor — forward-only unpacker
// ------------------------------------------------------------------------------------------------

/// Forward-only cursor over a block's payload region.
///
/// Construct with [`RecordCursor::new`], which validates the framing via
/// [`verify_block`]. Each [`try_next`](Self::try_next) yields a
/// [`RecordView`] borrowing the block, `Ok(None)` on clean end, or
/// [`BlockError::Corrupt`] on malformed per-record framing.
#[derive(Debug)]
pub struct RecordCursor<'a> {
    /// Payload region `[4, 4+payload_len)` of the block.
    payload: &'a [u8],

    /// Cursor into `payload`, always at the next header to decode.
    pos: usize,
}

impl<'a> RecordCursor<'a> {
    /// Validates `block` and positions the cursor at the first record.
    pub fn new(block: &'a [u8]) -> Result<Self, BlockError> {
        let payload_len = verify_block(block)?;
        Ok(Self {
            payload: &block[4..4 + payload_len],
            pos: 0,
        })
    }

    /// Builds a cursor over an already-verified block, skipping the CRC
    /// pass. `payload_len` must come from a prior [`verify_block`].
    pub fn new_unchecked(block: &'a [u8], payload_len: usize) -> Self {
        Self {
            payload: &block[4..4 + payload_len],
            pos: 0,
        }
    }

    /// Decodes the next record, advancing the cursor.
    pub fn try_next(&mut self) -> Result<Option<RecordView<'a>>, BlockError> {
        if self.pos == self.payload.len() {
            return Ok(None);
        }
        if self.payload.len() - self.pos < HEADER_SIZE {
            return Err(BlockError::Corrupt("trailing partial record header"));
        }

        let header = RecordHeader::parse(&self.payload[self.pos..])?;
        let body_start = self.pos + HEADER_SIZE;
        let k_len = header.k_len as usize;
        let v_len = header.v_len as usize;

        let Some(body_end) = body_start.checked_add(k_len + v_len) else {
            return Err(BlockError::Corrupt("record length overflow"));
        };
        if body_end > self.payload.len() {
            return Err(BlockError::Corrupt("record overruns payload"));
        }

        let key = &self.payload[body_start..body_start + k_len];
        let value = &self.payload[body_start + k_len..body_end];
        self.pos = body_end;

        Ok(Some(RecordView { header, key, value }))
    }
}
