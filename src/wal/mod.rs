//! Write-Ahead Logging (WAL) Module
//!
//! Durable, append-only, **group-committed** write-ahead log. Every
//! mutation is framed, CRC-protected, and fsynced before the caller's
//! completion ticket fires — a `put` or `delete` never acknowledges
//! before its bytes are on disk.
//!
//! # On-disk layout
//!
//! A segment is a bare sequence of frames (no file header):
//!
//! ```text
//! [LEN_LE u32][PAYLOAD][CRC32C_LE u32]
//! [LEN_LE u32][PAYLOAD][CRC32C_LE u32]
//! ...
//! ```
//!
//! The CRC covers the payload only. The payload is `[kind u8][body]`:
//!
//! | kind | op         | body                                     |
//! |------|------------|------------------------------------------|
//! | 0    | Add        | AKHdr32 ‖ key ‖ value                    |
//! | 1    | Delete     | AKHdr32 ‖ key                            |
//! | 2    | Seal       | (empty) — segment rotation marker        |
//! | 3    | Checkpoint | stripes_written u64 LE ‖ last_seq u64 LE |
//!
//! Segments are named `{prefix}_{NNNNNN}.log` with a monotonic index;
//! a SEAL record is the last frame of every rotated segment.
//!
//! # Group commit
//!
//! Appends are enqueued onto a single-writer channel. A dedicated writer
//! thread batches frames until `group_n` entries or `group_micros` µs
//! have accumulated, issues **one** write and **one** fsync
//! (`sync_data` in fast mode, `sync_all` in durable mode), then
//! completes every ticket in the batch. No lock is held across the
//! fsync — callers park on their tickets instead.
//!
//! # Replay
//!
//! [`WalReplay`] walks segments in index order, verifying every CRC. A
//! short tail (torn write) ends the segment silently with a warning —
//! crash between write and fsync is expected. A CRC mismatch in a
//! *complete* frame is [`WalError::Corrupt`] and fatal at open: the log
//! is the ground truth and a hole in it means data loss.
//!
//! # Checkpoints & pruning
//!
//! [`Wal::checkpoint`] records the flush/stripe high-water mark. The
//! segment containing the most recent checkpoint is the pruning
//! boundary: [`Wal::prune_obsolete_segments`] unlinks all segments with
//! a strictly smaller index.

#[cfg(test)]
mod tests;

use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Read, Write},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::block::{BlockError, FLAG_TOMBSTONE, HEADER_SIZE, MAX_KEY_LEN, PAYLOAD_LIMIT, RecordHeader};
use crate::codec::{self, pool::BufPool};

const U32_SIZE: usize = std::mem::size_of::<u32>();

/// Upper bound on a frame's payload: kind byte + header + max key + max
/// value, rounded up. Anything larger in a length prefix is corruption.
pub const MAX_FRAME_PAYLOAD: usize = 1 + HEADER_SIZE + MAX_KEY_LEN + PAYLOAD_LIMIT;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// CRC mismatch in a complete frame. Fatal at open.
    #[error("WAL corrupt: segment {segment} offset {offset}: {reason}")]
    Corrupt {
        /// Segment index containing the bad frame.
        segment: u64,
        /// Byte offset of the frame.
        offset: u64,
        /// What failed.
        reason: &'static str,
    },

    /// Partial trailing frame (torn write). Recoverable — discarded at open.
    #[error("WAL truncated: segment {segment} offset {offset}")]
    Truncated {
        /// Segment index with the torn tail.
        segment: u64,
        /// Byte offset where the tail begins.
        offset: u64,
    },

    /// Operation payload exceeds [`MAX_FRAME_PAYLOAD`].
    #[error("WAL record too large: {0} bytes")]
    RecordTooLarge(usize),

    /// Malformed record body inside a CRC-valid frame.
    #[error("WAL record malformed: {0}")]
    Record(#[from] BlockError),

    /// The WAL writer has shut down; the operation was not made durable.
    #[error("WAL closed")]
    Closed,

    /// Internal consistency error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl WalError {
    /// Clones the shape of an I/O error for fan-out to a whole batch of
    /// completion tickets (`io::Error` itself is not `Clone`).
    fn replicate_io(err: &io::Error) -> WalError {
        WalError::Io(io::Error::new(err.kind(), err.to_string()))
    }
}

// ------------------------------------------------------------------------------------------------
// Operations
// ------------------------------------------------------------------------------------------------

/// A logical WAL record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalOp {
    /// Insert or update a key. `flags` carries the tombstone bit for
    /// tombstones that ship a deletion-timestamp payload.
    Add {
        key: Vec<u8>,
        value: Vec<u8>,
        seq: u64,
        flags: u8,
    },

    /// Delete a key (empty-value tombstone).
    Delete { key: Vec<u8>, seq: u64 },

    /// Segment rotation marker. Written by the writer thread only.
    Seal,

    /// Durability high-water mark for pruning and recovery.
    Checkpoint { stripes_written: u64, last_seq: u64 },
}

const KIND_ADD: u8 = 0;
const KIND_DELETE: u8 = 1;
const KIND_SEAL: u8 = 2;
const KIND_CHECKPOINT: u8 = 3;

impl WalOp {
    /// Upper bound on this op's full frame size, for pool sizing.
    fn frame_estimate(&self) -> usize {
        let body = match self {
            WalOp::Add { key, value, .. } => HEADER_SIZE + key.len() + value.len(),
            WalOp::Delete { key, .. } => HEADER_SIZE + key.len(),
            WalOp::Seal => 0,
            WalOp::Checkpoint { .. } => 16,
        };
        U32_SIZE + 1 + body + U32_SIZE
    }

    /// Appends the frame payload (`[kind][body]`) to `buf`.
    fn encode_into(&self, buf: &mut Vec<u8>) -> Result<(), WalError> {
        match self {
            WalOp::Add {
                key,
                value,
                seq,
                flags,
            } => {
                if key.len() > MAX_KEY_LEN {
                    return Err(BlockError::KeyTooLarge(key.len()).into());
                }
                if HEADER_SIZE + key.len() + value.len() > PAYLOAD_LIMIT {
                    return Err(
                        BlockError::ValueTooLarge(HEADER_SIZE + key.len() + value.len()).into(),
                    );
                }
                buf.push(KIND_ADD);
                let header = RecordHeader {
                    k_len: key.len() as u16,
                    v_len: value.len() as u32,
                    seq: *seq,
                    flags: *flags,
                    key_fp64: codec::key_fp64(key),
                    mini_key: codec::mini_key(key),
                };
                buf.extend_from_slice(&header.encode());
                buf.extend_from_slice(key);
                buf.extend_from_slice(value);
            }
            WalOp::Delete { key, seq } => {
                if key.len() > MAX_KEY_LEN {
                    return Err(BlockError::KeyTooLarge(key.len()).into());
                }
                buf.push(KIND_DELETE);
                let header = RecordHeader {
                    k_len: key.len() as u16,
                    v_len: 0,
                    seq: *seq,
                    flags: FLAG_TOMBSTONE,
                    key_fp64: codec::key_fp64(key),
                    mini_key: codec::mini_key(key),
                };
                buf.extend_from_slice(&header.encode());
                buf.extend_from_slice(key);
            }
            WalOp::Seal => buf.push(KIND_SEAL),
            WalOp::Checkpoint {
                stripes_written,
                last_seq,
            } => {
                buf.push(KIND_CHECKPOINT);
                buf.extend_from_slice(&stripes_written.to_le_bytes());
                buf.extend_from_slice(&last_seq.to_le_bytes());
            }
        }
        Ok(())
    }

    /// Decodes a frame payload.
    fn decode(payload: &[u8], segment: u64, offset: u64) -> Result<WalOp, WalError> {
        let corrupt = |reason| WalError::Corrupt {
            segment,
            offset,
            reason,
        };
        let (&kind, body) = payload.split_first().ok_or(corrupt("empty payload"))?;
        match kind {
            KIND_ADD | KIND_DELETE => {
                let header = RecordHeader::parse(body)?;
                let k_len = header.k_len as usize;
                let v_len = header.v_len as usize;
                if body.len() != HEADER_SIZE + k_len + v_len {
                    return Err(corrupt("record body length mismatch"));
                }
                let key = body[HEADER_SIZE..HEADER_SIZE + k_len].to_vec();
                if kind == KIND_DELETE {
                    if v_len != 0 {
                        return Err(corrupt("delete record carries a value"));
                    }
                    Ok(WalOp::Delete {
                        key,
                        seq: header.seq,
                    })
                } else {
                    let value = body[HEADER_SIZE + k_len..].to_vec();
                    Ok(WalOp::Add {
                        key,
                        value,
                        seq: header.seq,
                        flags: header.flags,
                    })
                }
            }
            KIND_SEAL => {
                if !body.is_empty() {
                    return Err(corrupt("seal record carries a body"));
                }
                Ok(WalOp::Seal)
            }
            KIND_CHECKPOINT => {
                if body.len() != 16 {
                    return Err(corrupt("checkpoint record length mismatch"));
                }
                let stripes_written = u64::from_le_bytes([
                    body[0], body[1], body[2], body[3], body[4], body[5], body[6], body[7],
                ]);
                let last_seq = u64::from_le_bytes([
                    body[8], body[9], body[10], body[11], body[12], body[13], body[14], body[15],
                ]);
                Ok(WalOp::Checkpoint {
                    stripes_written,
                    last_seq,
                })
            }
            _ => Err(corrupt("unknown record kind")),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Options & tickets
// ------------------------------------------------------------------------------------------------

/// Group-commit and durability knobs for the WAL writer.
#[derive(Debug, Clone)]
pub struct WalOptions {
    /// Flush the batch after this many queued frames.
    pub group_n: usize,

    /// Flush the batch after this many microseconds with a non-empty queue.
    pub group_micros: u64,

    /// `true` = `sync_data` (fdatasync), `false` = `sync_all` (fsync).
    pub fast_mode: bool,
}

impl Default for WalOptions {
    fn default() -> Self {
        Self {
            group_n: 32,
            group_micros: 500,
            fast_mode: true,
        }
    }
}

/// Completion handle for an enqueued WAL operation.
///
/// [`wait`](Self::wait) parks until the containing batch is durable.
#[derive(Debug)]
pub struct WalTicket {
    rx: Receiver<Result<(), WalError>>,
}

impl WalTicket {
    /// Blocks until the operation's batch is fsynced (or fails).
    pub fn wait(self) -> Result<(), WalError> {
        match self.rx.recv() {
            Ok(result) => result,
            // Writer gone without completing us — the write is not durable.
            Err(_) => Err(WalError::Closed),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Writer commands
// ------------------------------------------------------------------------------------------------

type Completion = Sender<Result<(), WalError>>;

enum WalCommand {
    Append {
        frame: Vec<u8>,
        done: Completion,
    },
    Seal {
        done: Sender<Result<u64, WalError>>,
    },
    Checkpoint {
        stripes_written: u64,
        last_seq: u64,
        done: Completion,
    },
    Shutdown {
        done: Completion,
    },
}

// ------------------------------------------------------------------------------------------------
// WAL handle
// ------------------------------------------------------------------------------------------------

/// Handle to a segmented, group-committed write-ahead log.
pub struct Wal {
    tx: Sender<WalCommand>,
    writer: Option<JoinHandle<()>>,
    dir: PathBuf,
    prefix: String,
    pool: Arc<BufPool>,
    /// Segment index containing the most recent durable checkpoint.
    checkpoint_segment: Arc<AtomicU64>,
    closed: AtomicBool,
}

impl Wal {
    /// Opens (or creates) the WAL in `dir` and starts the writer thread.
    ///
    /// Appending resumes at the highest existing segment index, or at
    /// segment 1 on a fresh directory. Replay the log with
    /// [`WalReplay`] **before** opening — the writer appends to the
    /// newest segment and a torn tail must be accounted first.
    pub fn open(
        dir: impl AsRef<Path>,
        prefix: &str,
        options: WalOptions,
        pool: Arc<BufPool>,
    ) -> Result<Self, WalError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let segments = list_segments(&dir, prefix)?;
        let segment_index = segments.last().map(|(idx, _)| *idx).unwrap_or(1);
        let path = segment_path(&dir, prefix, segment_index);

        // Trim a torn tail before appending: new frames written after
        // leftover partial bytes would be unreachable on replay.
        if path.exists() {
            let mut data = Vec::new();
            File::open(&path)?.read_to_end(&mut data)?;
            let valid = valid_prefix_len(&data);
            if valid < data.len() as u64 {
                warn!(
                    path = %path.display(),
                    valid,
                    total = data.len(),
                    "truncating torn WAL tail before reopen"
                );
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(valid)?;
                file.sync_all()?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!(path = %path.display(), segment = segment_index, "WAL opened");

        let checkpoint_segment = Arc::new(AtomicU64::new(0));
        let (tx, rx) = channel::unbounded();

        let state = WriterState {
            dir: dir.clone(),
            prefix: prefix.to_string(),
            file: BufWriter::new(file),
            segment_index,
            options: options.clone(),
            checkpoint_segment: Arc::clone(&checkpoint_segment),
            pool: Arc::clone(&pool),
        };
        let writer = std::thread::Builder::new()
            .name("akkara-wal".into())
            .spawn(move || writer_loop(state, rx))
            .map_err(|e| WalError::Internal(format!("failed to spawn WAL writer: {e}")))?;

        Ok(Self {
            tx,
            writer: Some(writer),
            dir,
            prefix: prefix.to_string(),
            pool,
            checkpoint_segment,
            closed: AtomicBool::new(false),
        })
    }

    /// Enqueues an operation and returns its completion ticket.
    ///
    /// The ticket fires once the frame's batch is fsynced. Callers that
    /// need the durability contract (`put`, `delete`) must wait on it
    /// before acknowledging.
    pub fn append(&self, op: &WalOp) -> Result<WalTicket, WalError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WalError::Closed);
        }

        let mut frame = self.pool.get(op.frame_estimate());
        frame.clear();
        // Reserve the length prefix slot, encode, then patch it.
        frame.extend_from_slice(&[0u8; U32_SIZE]);
        op.encode_into(&mut frame)?;
        let payload_len = frame.len() - U32_SIZE;
        if payload_len > MAX_FRAME_PAYLOAD {
            return Err(WalError::RecordTooLarge(payload_len));
        }
        frame[..U32_SIZE].copy_from_slice(&(payload_len as u32).to_le_bytes());
        let crc = codec::crc32c(&frame[U32_SIZE..]);
        frame.extend_from_slice(&crc.to_le_bytes());

        let (done, rx) = channel::bounded(1);
        self.tx
            .send(WalCommand::Append { frame, done })
            .map_err(|_| WalError::Closed)?;
        trace!(len = payload_len, "WAL frame enqueued");
        Ok(WalTicket { rx })
    }

    /// Appends an operation and blocks until it is durable.
    pub fn append_durable(&self, op: &WalOp) -> Result<(), WalError> {
        self.append(op)?.wait()
    }

    /// Writes a SEAL record, fsyncs, and rotates to the next segment.
    ///
    /// Returns the new segment index.
    pub fn seal_segment(&self) -> Result<u64, WalError> {
        let (done, rx) = channel::bounded(1);
        self.tx
            .send(WalCommand::Seal { done })
            .map_err(|_| WalError::Closed)?;
        rx.recv().map_err(|_| WalError::Closed)?
    }

    /// Writes a CHECKPOINT record and fsyncs.
    ///
    /// On return the containing segment is the pruning boundary.
    pub fn checkpoint(&self, stripes_written: u64, last_seq: u64) -> Result<(), WalError> {
        let (done, rx) = channel::bounded(1);
        self.tx
            .send(WalCommand::Checkpoint {
                stripes_written,
                last_seq,
                done,
            })
            .map_err(|_| WalError::Closed)?;
        rx.recv().map_err(|_| WalError::Closed)?
    }

    /// Deletes segments with an index strictly below the last
    /// checkpointed segment. Returns the number of files removed.
    pub fn prune_obsolete_segments(&self) -> Result<usize, WalError> {
        let boundary = self.checkpoint_segment.load(Ordering::Acquire);
        if boundary == 0 {
            return Ok(0);
        }
        let mut removed = 0;
        for (idx, path) in list_segments(&self.dir, &self.prefix)? {
            if idx < boundary {
                fs::remove_file(&path)?;
                removed += 1;
                debug!(segment = idx, path = %path.display(), "WAL segment pruned");
            }
        }
        Ok(removed)
    }

    /// Stops the writer thread, completing still-pending tickets with
    /// [`WalError::Closed`]. Idempotent.
    pub fn close(&mut self) -> Result<(), WalError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let (done, rx) = channel::bounded(1);
        if self.tx.send(WalCommand::Shutdown { done }).is_ok() {
            let _ = rx.recv();
        }
        if let Some(handle) = self.writer.take() {
            handle
                .join()
                .map_err(|_| WalError::Internal("WAL writer thread panicked".into()))?;
        }
        Ok(())
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, "WAL close failed on drop");
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Writer thread
// ------------------------------------------------------------------------------------------------

struct WriterState {
    dir: PathBuf,
    prefix: String,
    file: BufWriter<File>,
    segment_index: u64,
    options: WalOptions,
    checkpoint_segment: Arc<AtomicU64>,
    /// Writer-side pool: frames are returned here after hitting disk.
    pool: Arc<BufPool>,
}

impl WriterState {
    /// Writes every frame of the batch, issues one fsync, and completes
    /// all tickets.
    fn flush_batch(&mut self, batch: &mut Vec<(Vec<u8>, Completion)>) {
        if batch.is_empty() {
            return;
        }
        let result = self.write_and_sync(batch);
        for (frame, done) in batch.drain(..) {
            let completion = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(WalError::replicate_io(e)),
            };
            // A dropped receiver just means the caller stopped waiting.
            let _ = done.send(completion);
            self.pool.release(frame);
        }
    }

    fn write_and_sync(&mut self, batch: &[(Vec<u8>, Completion)]) -> io::Result<()> {
        for (frame, _) in batch {
            self.file.write_all(frame)?;
        }
        self.file.flush()?;
        let file = self.file.get_ref();
        if self.options.fast_mode {
            file.sync_data()?;
        } else {
            file.sync_all()?;
        }
        trace!(frames = batch.len(), segment = self.segment_index, "WAL batch committed");
        Ok(())
    }

    /// Writes one control frame directly and fsyncs (`sync_all` — control
    /// records always take the durable path).
    fn write_control(&mut self, op: &WalOp) -> Result<(), WalError> {
        let mut payload = Vec::with_capacity(32);
        op.encode_into(&mut payload)?;
        let crc = codec::crc32c(&payload);
        self.file.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.file.write_all(&payload)?;
        self.file.write_all(&crc.to_le_bytes())?;
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(())
    }

    fn seal_and_rotate(&mut self) -> Result<u64, WalError> {
        self.write_control(&WalOp::Seal)?;
        let next_index = self
            .segment_index
            .checked_add(1)
            .ok_or_else(|| WalError::Internal("WAL segment index overflow".into()))?;
        let path = segment_path(&self.dir, &self.prefix, next_index);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.file = BufWriter::new(file);
        self.segment_index = next_index;
        info!(segment = next_index, path = %path.display(), "WAL rotated");
        Ok(next_index)
    }

    fn checkpoint(&mut self, stripes_written: u64, last_seq: u64) -> Result<(), WalError> {
        self.write_control(&WalOp::Checkpoint {
            stripes_written,
            last_seq,
        })?;
        self.checkpoint_segment
            .store(self.segment_index, Ordering::Release);
        debug!(
            segment = self.segment_index,
            stripes_written, last_seq, "WAL checkpoint durable"
        );
        Ok(())
    }
}

fn writer_loop(mut state: WriterState, rx: Receiver<WalCommand>) {
    let mut batch: Vec<(Vec<u8>, Completion)> = Vec::new();
    let group_n = state.options.group_n.max(1);
    let group_wait = Duration::from_micros(state.options.group_micros.max(1));

    loop {
        let command = if batch.is_empty() {
            match rx.recv() {
                Ok(cmd) => cmd,
                Err(_) => return, // all handles dropped
            }
        } else {
            match rx.recv_timeout(group_wait) {
                Ok(cmd) => cmd,
                Err(RecvTimeoutError::Timeout) => {
                    state.flush_batch(&mut batch);
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    state.flush_batch(&mut batch);
                    return;
                }
            }
        };

        match command {
            WalCommand::Append { frame, done } => {
                batch.push((frame, done));
                if batch.len() >= group_n {
                    state.flush_batch(&mut batch);
                }
            }
            WalCommand::Seal { done } => {
                state.flush_batch(&mut batch);
                let _ = done.send(state.seal_and_rotate());
            }
            WalCommand::Checkpoint {
                stripes_written,
                last_seq,
                done,
            } => {
                state.flush_batch(&mut batch);
                let _ = done.send(state.checkpoint(stripes_written, last_seq));
            }
            WalCommand::Shutdown { done } => {
                state.flush_batch(&mut batch);
                let final_sync = state
                    .file
                    .flush()
                    .and_then(|_| state.file.get_ref().sync_all())
                    .map_err(WalError::Io);
                let _ = done.send(final_sync);
                // Reject anything that raced in behind the shutdown.
                while let Ok(cmd) = rx.try_recv() {
                    match cmd {
                        WalCommand::Append { done, .. } => {
                            let _ = done.send(Err(WalError::Closed));
                        }
                        WalCommand::Seal { done } => {
                            let _ = done.send(Err(WalError::Closed));
                        }
                        WalCommand::Checkpoint { done, .. } => {
                            let _ = done.send(Err(WalError::Closed));
                        }
                        WalCommand::Shutdown { done } => {
                            let _ = done.send(Ok(()));
                        }
                    }
                }
                return;
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Segment naming
// ------------------------------------------------------------------------------------------------

/// Builds `{dir}/{prefix}_{NNNNNN}.log`.
pub fn segment_path(dir: &Path, prefix: &str, index: u64) -> PathBuf {
    dir.join(format!("{prefix}_{index:06}.log"))
}

/// Length of the valid frame prefix of a segment: parsing stops at the
/// first frame that is incomplete or fails its CRC.
fn valid_prefix_len(data: &[u8]) -> u64 {
    let mut pos = 0usize;
    while pos < data.len() {
        let remaining = &data[pos..];
        if remaining.len() < U32_SIZE {
            break;
        }
        let len =
            u32::from_le_bytes([remaining[0], remaining[1], remaining[2], remaining[3]]) as usize;
        if len == 0 || len > MAX_FRAME_PAYLOAD {
            break;
        }
        if remaining.len() < U32_SIZE + len + U32_SIZE {
            break;
        }
        let payload = &remaining[U32_SIZE..U32_SIZE + len];
        let stored_crc = u32::from_le_bytes([
            remaining[U32_SIZE + len],
            remaining[U32_SIZE + len + 1],
            remaining[U32_SIZE + len + 2],
            remaining[U32_SIZE + len + 3],
        ]);
        if codec::crc32c(payload) != stored_crc {
            break;
        }
        pos += U32_SIZE + len + U32_SIZE;
    }
    pos as u64
}

/// Parses the index from a `{prefix}_{NNNNNN}.log` file name.
fn parse_segment_index(name: &str, prefix: &str) -> Option<u64> {
    name.strip_prefix(prefix)?
        .strip_prefix('_')?
        .strip_suffix(".log")?
        .parse()
        .ok()
}

/// Lists WAL segments in `dir`, sorted by index.
pub fn list_segments(dir: &Path, prefix: &str) -> io::Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    if !dir.exists() {
        return Ok(segments);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if let Some(name) = path.file_name().and_then(|n| n.to_str())
            && let Some(idx) = parse_segment_index(name, prefix)
        {
            segments.push((idx, path));
        }
    }
    segments.sort_by_key(|(idx, _)| *idx);
    Ok(segments)
}

// ------------------------------------------------------------------------------------------------
// Replay
// ------------------------------------------------------------------------------------------------

/// An entry yielded during replay.
#[derive(Debug)]
pub struct WalEntry {
    /// Segment the frame was read from.
    pub segment: u64,

    /// The decoded operation.
    pub op: WalOp,
}

/// Streaming replay over all segments of a WAL directory, index order.
///
/// Yields every decodable frame; a torn tail ends the affected segment
/// with a warning (the iterator continues with the next segment), while
/// a CRC mismatch in a complete frame surfaces as
/// [`WalError::Corrupt`] and ends iteration.
pub struct WalReplay {
    segments: std::vec::IntoIter<(u64, PathBuf)>,
    current: Option<(u64, Vec<u8>, usize)>,
    /// Count of torn tails discarded so far.
    truncated_tails: usize,
    failed: bool,
}

impl WalReplay {
    /// Opens a replay over `{prefix}_*.log` files in `dir`.
    pub fn open(dir: impl AsRef<Path>, prefix: &str) -> Result<Self, WalError> {
        let segments = list_segments(dir.as_ref(), prefix)?;
        debug!(count = segments.len(), "WAL replay started");
        Ok(Self {
            segments: segments.into_iter(),
            current: None,
            truncated_tails: 0,
            failed: false,
        })
    }

    /// Number of torn tails silently discarded so far.
    pub fn truncated_tails(&self) -> usize {
        self.truncated_tails
    }

    fn load_next_segment(&mut self) -> Result<bool, WalError> {
        let Some((idx, path)) = self.segments.next() else {
            return Ok(false);
        };
        let mut data = Vec::new();
        File::open(&path)?.read_to_end(&mut data)?;
        trace!(segment = idx, bytes = data.len(), "WAL replaying segment");
        self.current = Some((idx, data, 0));
        Ok(true)
    }

    /// Decodes the next frame of the current segment.
    ///
    /// Returns `Ok(None)` at the clean end of the segment, and
    /// `Err(Truncated)` on a torn tail (the caller skips to the next
    /// segment).
    fn next_in_segment(&mut self) -> Result<Option<WalEntry>, WalError> {
        enum Step {
            End,
            Entry(WalEntry, usize),
        }

        let step = {
            let Some((segment, data, pos)) = self.current.as_ref() else {
                return Ok(None);
            };
            let segment = *segment;
            let offset = *pos as u64;
            let remaining = &data[*pos..];

            if remaining.is_empty() {
                Step::End
            } else if remaining.len() < U32_SIZE {
                return Err(WalError::Truncated { segment, offset });
            } else {
                let len =
                    u32::from_le_bytes([remaining[0], remaining[1], remaining[2], remaining[3]])
                        as usize;
                if len == 0 {
                    // Zero-filled tail (preallocation); treat as clean end.
                    warn!(segment, offset, "WAL zero-length frame, stopping segment");
                    Step::End
                } else if len > MAX_FRAME_PAYLOAD {
                    return Err(WalError::Corrupt {
                        segment,
                        offset,
                        reason: "frame length out of range",
                    });
                } else if remaining.len() < U32_SIZE + len + U32_SIZE {
                    return Err(WalError::Truncated { segment, offset });
                } else {
                    let payload = &remaining[U32_SIZE..U32_SIZE + len];
                    let stored_crc = u32::from_le_bytes([
                        remaining[U32_SIZE + len],
                        remaining[U32_SIZE + len + 1],
                        remaining[U32_SIZE + len + 2],
                        remaining[U32_SIZE + len + 3],
                    ]);
                    if codec::crc32c(payload) != stored_crc {
                        return Err(WalError::Corrupt {
                            segment,
                            offset,
                            reason: "frame checksum mismatch",
                        });
                    }
                    let op = WalOp::decode(payload, segment, offset)?;
                    Step::Entry(
                        WalEntry { segment, op },
                        *pos + U32_SIZE + len + U32_SIZE,
                    )
                }
            }
        };

        match step {
            Step::End => {
                self.current = None;
                Ok(None)
            }
            Step::Entry(entry, new_pos) => {
                if let Some((_, _, pos)) = self.current.as_mut() {
                    *pos = new_pos;
                }
                Ok(Some(entry))
            }
        }
    }
}

impl Iterator for WalReplay {
    type Item = Result<WalEntry, WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            match self.next_in_segment() {
                Ok(Some(entry)) => return Some(Ok(entry)),
                Ok(None) => match self.load_next_segment() {
                    Ok(true) => continue,
                    Ok(false) => return None,
                    Err(e) => {
                        self.failed = true;
                        return Some(Err(e));
                    }
                },
                Err(WalError::Truncated { segment, offset }) => {
                    // Torn write at the tail — expected after a crash.
                    warn!(segment, offset, "WAL torn tail discarded");
                    self.truncated_tails += 1;
                    self.current = None;
                    match self.load_next_segment() {
                        Ok(true) => continue,
                        Ok(false) => return None,
                        Err(e) => {
                            self.failed = true;
                            return Some(Err(e));
                        }
                    }
                }
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
