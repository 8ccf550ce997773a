//! Stripe-aligned block appender with erasure-coded redundancy.
//!
//! A **stripe** is `k` data blocks plus `m` parity blocks, all written
//! at the same byte offset of their respective **lane** files. Lanes
//! are plain append-only files (`data_{i}.akd`, `parity_{j}.akp`), so
//! stripe `s` occupies `[s·BLOCK_SIZE, (s+1)·BLOCK_SIZE)` in every
//! lane.
//!
//! # Writer state machine
//!
//! Per stripe: `EMPTY → FILLING` (fewer than `k` blocks buffered) `→
//! SEALING` (`k` reached: parity computed, `k+m` lane writes issued)
//! `→ DURABLE` (the group-commit worker's fsync covers it and
//! `last_durable` advances). The producer is single-threaded; multiple
//! sealed stripes may be awaiting one fsync.
//!
//! # Flush policy
//!
//! The background worker fsyncs all lanes once `max_blocks` sealed
//! blocks are pending or `max_micros` µs have passed since the first
//! pending seal. [`StripeWriter::flush`] with [`FlushMode::Sync`]
//! pads out a partial stripe with empty blocks, seals it, and parks
//! until everything sealed is durable; [`FlushMode::Async`] returns a
//! ticket instead.
//!
//! # Reader & recovery
//!
//! [`StripeReader::read_stripe`] CRC-validates every lane block and
//! reconstructs up to `m` missing or corrupt lanes through the parity
//! coder; beyond that it fails with [`StripeError::Corrupt`].
//! [`recover`] scans lane tails, truncates any incomplete trailing
//! stripe (a crash mid-seal), drops trailing stripes that cannot be
//! reconstructed, and reports where the writer may resume.

pub mod parity;

#[cfg(test)]
mod tests;

use std::{
    fs::{self, File, OpenOptions},
    io,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::block::{BLOCK_SIZE, verify_block};
use crate::codec;

use parity::{ParityCoder, ParityError, ParityKind};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by stripe operations.
#[derive(Debug, Error)]
pub enum StripeError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Erasures exceed the parity budget, or a rebuilt lane failed its
    /// CRC. The stripe cannot be served; the engine stays up.
    #[error("stripe {stripe} corrupt: {reason}")]
    Corrupt {
        /// Stripe index.
        stripe: u64,
        /// What failed.
        reason: &'static str,
    },

    /// Parity math failure.
    #[error("parity error: {0}")]
    Parity(#[from] ParityError),

    /// The writer has shut down.
    #[error("stripe writer closed")]
    Closed,

    /// Internal consistency error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Lane file layout
// ------------------------------------------------------------------------------------------------

/// Path of data lane `i`.
pub fn data_lane_path(dir: &Path, lane: usize) -> PathBuf {
    dir.join(format!("data_{lane}.akd"))
}

/// Path of parity lane `j`.
pub fn parity_lane_path(dir: &Path, lane: usize) -> PathBuf {
    dir.join(format!("parity_{lane}.akp"))
}

/// A fully zero-record block (`payloadLen = 0`, valid CRC). Used to pad
/// the final partial stripe on flush.
pub fn empty_block() -> Box<[u8; BLOCK_SIZE]> {
    let mut block = Box::new([0u8; BLOCK_SIZE]);
    let crc = codec::crc32c(&block[..BLOCK_SIZE - 4]);
    block[BLOCK_SIZE - 4..].copy_from_slice(&crc.to_le_bytes());
    block
}

/// The open lane files of one stripe set: `k` data then `m` parity.
struct Lanes {
    data: Vec<File>,
    parity: Vec<File>,
}

impl Lanes {
    fn create(dir: &Path, k: usize, m: usize) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let mut data = Vec::with_capacity(k);
        for lane in 0..k {
            data.push(
                OpenOptions::new()
                    .create(true)
                    .read(true)
                    .write(true)
                    .open(data_lane_path(dir, lane))?,
            );
        }
        let mut parity = Vec::with_capacity(m);
        for lane in 0..m {
            parity.push(
                OpenOptions::new()
                    .create(true)
                    .read(true)
                    .write(true)
                    .open(parity_lane_path(dir, lane))?,
            );
        }
        Ok(Self { data, parity })
    }

    fn sync_all_lanes(&self, fast_mode: bool) -> io::Result<()> {
        for file in self.data.iter().chain(&self.parity) {
            if fast_mode {
                file.sync_data()?;
            } else {
                file.sync_all()?;
            }
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Flush policy & tickets
// ------------------------------------------------------------------------------------------------

/// Group-commit thresholds for the stripe fsync worker.
#[derive(Debug, Clone)]
pub struct StripePolicy {
    /// Fsync once this many sealed-but-not-durable blocks are pending.
    pub max_blocks: usize,

    /// Fsync once this many microseconds have passed since the first
    /// pending seal.
    pub max_micros: u64,

    /// `true` = `sync_data` per lane, `false` = `sync_all`.
    pub fast_mode: bool,
}

impl Default for StripePolicy {
    fn default() -> Self {
        Self {
            max_blocks: 32,
            max_micros: 1_000,
            fast_mode: true,
        }
    }
}

/// Flush blocking behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Block until everything sealed so far is durable.
    Sync,

    /// Return a ticket completed at durability.
    Async,
}

/// Completion handle for an asynchronous stripe flush.
///
/// Dropping the ticket without waiting means the caller treats the
/// flush as failed.
#[derive(Debug)]
pub struct StripeTicket {
    rx: Receiver<Result<(), StripeError>>,
}

impl StripeTicket {
    /// Blocks until the flush target is durable.
    pub fn wait(self) -> Result<(), StripeError> {
        match self.rx.recv() {
            Ok(result) => result,
            Err(_) => Err(StripeError::Closed),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Fsync worker
// ------------------------------------------------------------------------------------------------

enum SyncCommand {
    Sealed { stripe: u64 },
    WaitDurable {
        upto: u64,
        done: Sender<Result<(), StripeError>>,
    },
    Shutdown {
        done: Sender<Result<(), StripeError>>,
    },
}

struct SyncWorker {
    lanes: Arc<Lanes>,
    policy: StripePolicy,
    k: usize,
    /// Count of durable stripes (next index not yet durable).
    durable: Arc<AtomicU64>,
    /// Count of sealed stripes the worker has been told about.
    sealed: u64,
    first_pending: Option<Instant>,
    waiters: Vec<(u64, Sender<Result<(), StripeError>>)>,
}

impl SyncWorker {
    fn sync_now(&mut self) {
        if self.sealed == self.durable.load(Ordering::Acquire) {
            self.first_pending = None;
            self.complete_waiters(None);
            return;
        }
        let result = self.lanes.sync_all_lanes(self.policy.fast_mode);
        match result {
            Ok(()) => {
                self.durable.store(self.sealed, Ordering::Release);
                trace!(durable = self.sealed, "stripe group fsync");
                self.first_pending = None;
                self.complete_waiters(None);
            }
            Err(e) => {
                warn!(error = %e, "stripe fsync failed");
                let msg = e.to_string();
                self.complete_waiters(Some(msg));
            }
        }
    }

    fn complete_waiters(&mut self, error: Option<String>) {
        let durable = self.durable.load(Ordering::Acquire);
        self.waiters.retain(|(upto, done)| {
            if let Some(msg) = &error {
                let _ = done.send(Err(StripeError::Internal(msg.clone())));
                false
            } else if *upto <= durable {
                let _ = done.send(Ok(()));
                false
            } else {
                true
            }
        });
    }

    fn pending_blocks(&self) -> usize {
        (self.sealed - self.durable.load(Ordering::Acquire)) as usize * self.k
    }
}

fn sync_loop(mut worker: SyncWorker, rx: Receiver<SyncCommand>) {
    let wait = Duration::from_micros(worker.policy.max_micros.max(1));
    loop {
        let command = if worker.first_pending.is_none() {
            match rx.recv() {
                Ok(cmd) => cmd,
                Err(_) => {
                    worker.sync_now();
                    return;
                }
            }
        } else {
            match rx.recv_timeout(wait) {
                Ok(cmd) => cmd,
                Err(RecvTimeoutError::Timeout) => {
                    worker.sync_now();
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    worker.sync_now();
                    return;
                }
            }
        };

        match command {
            SyncCommand::Sealed { stripe } => {
                worker.sealed = worker.sealed.max(stripe + 1);
                if worker.first_pending.is_none() {
                    worker.first_pending = Some(Instant::now());
                }
                if worker.pending_blocks() >= worker.policy.max_blocks.max(1) {
                    worker.sync_now();
                }
            }
            SyncCommand::WaitDurable { upto, done } => {
                if upto <= worker.durable.load(Ordering::Acquire) {
                    let _ = done.send(Ok(()));
                } else {
                    worker.waiters.push((upto, done));
                    // A waiter is an explicit durability demand.
                    worker.sync_now();
                }
            }
            SyncCommand::Shutdown { done } => {
                worker.sync_now();
                let _ = done.send(Ok(()));
                return;
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// StripeWriter
// ------------------------------------------------------------------------------------------------

/// Single-producer, stripe-aligned block appender over `k+m` lanes.
pub struct StripeWriter {
    lanes: Arc<Lanes>,
    coder: ParityCoder,
    /// Blocks buffered for the stripe currently FILLING (< k).
    pending: Vec<Box<[u8; BLOCK_SIZE]>>,
    /// Index of the next stripe to seal.
    next_stripe: u64,
    /// Count of durable stripes, shared with the fsync worker.
    durable: Arc<AtomicU64>,
    tx: Sender<SyncCommand>,
    worker: Option<JoinHandle<()>>,
    closed: bool,
}

impl StripeWriter {
    /// Opens the lane files in `dir` and starts the fsync worker.
    ///
    /// `start_stripe` is where appending resumes — the stripe count
    /// reported by [`recover`].
    pub fn open(
        dir: impl AsRef<Path>,
        kind: ParityKind,
        k: usize,
        policy: StripePolicy,
        start_stripe: u64,
    ) -> Result<Self, StripeError> {
        let coder = kind.coder(k);
        let lanes = Arc::new(Lanes::create(dir.as_ref(), k, coder.parity_lanes())?);
        let durable = Arc::new(AtomicU64::new(start_stripe));

        let (tx, rx) = channel::unbounded();
        let worker_state = SyncWorker {
            lanes: Arc::clone(&lanes),
            policy,
            k,
            durable: Arc::clone(&durable),
            sealed: start_stripe,
            first_pending: None,
            waiters: Vec::new(),
        };
        let worker = std::thread::Builder::new()
            .name("akkara-stripe".into())
            .spawn(move || sync_loop(worker_state, rx))
            .map_err(|e| StripeError::Internal(format!("failed to spawn stripe worker: {e}")))?;

        info!(
            dir = %dir.as_ref().display(),
            k,
            m = coder.parity_lanes(),
            start_stripe,
            "stripe writer opened"
        );
        Ok(Self {
            lanes,
            coder,
            pending: Vec::with_capacity(k),
            next_stripe: start_stripe,
            durable,
            tx,
            worker: Some(worker),
            closed: false,
        })
    }

    /// Data lanes per stripe.
    pub fn k(&self) -> usize {
        self.coder.data_lanes()
    }

    /// Index of the next stripe to seal (== count of sealed stripes).
    pub fn next_stripe(&self) -> u64 {
        self.next_stripe
    }

    /// Count of durable stripes.
    pub fn last_durable(&self) -> u64 {
        self.durable.load(Ordering::Acquire)
    }

    /// Appends one block to the FILLING stripe.
    ///
    /// Returns `Some(stripe_index)` when this block completed a stripe
    /// and its lane writes were issued, `None` while still filling.
    pub fn append_block(&mut self, block: &[u8; BLOCK_SIZE]) -> Result<Option<u64>, StripeError> {
        if self.closed {
            return Err(StripeError::Closed);
        }
        self.pending.push(Box::new(*block));
        if self.pending.len() < self.coder.data_lanes() {
            return Ok(None);
        }
        let sealed = self.seal_pending()?;
        Ok(Some(sealed))
    }

    /// Computes parity for the buffered blocks and issues the `k+m`
    /// lane writes at the stripe offset.
    fn seal_pending(&mut self) -> Result<u64, StripeError> {
        let stripe = self.next_stripe;
        let offset = stripe * BLOCK_SIZE as u64;

        let data_refs: Vec<&[u8]> = self.pending.iter().map(|b| b.as_slice()).collect();
        let mut parity_out: Vec<Vec<u8>> = vec![Vec::new(); self.coder.parity_lanes()];
        self.coder.encode_into(&data_refs, &mut parity_out)?;

        for (lane, block) in self.pending.iter().enumerate() {
            self.lanes.data[lane].write_all_at(block.as_slice(), offset)?;
        }
        for (lane, block) in parity_out.iter().enumerate() {
            self.lanes.parity[lane].write_all_at(block, offset)?;
        }

        self.pending.clear();
        self.next_stripe += 1;
        let _ = self.tx.send(SyncCommand::Sealed { stripe });
        trace!(stripe, "stripe sealed");
        Ok(stripe)
    }

    /// Seals a partial stripe (padding with empty blocks) and requests
    /// durability for everything sealed.
    ///
    /// [`FlushMode::Sync`] blocks until durable and returns `None`;
    /// [`FlushMode::Async`] returns a ticket.
    pub fn flush(&mut self, mode: FlushMode) -> Result<Option<StripeTicket>, StripeError> {
        if self.closed {
            return Err(StripeError::Closed);
        }
        if !self.pending.is_empty() {
            let pad = empty_block();
            while self.pending.len() < self.coder.data_lanes() {
                self.pending.push(pad.clone());
            }
            self.seal_pending()?;
        }

        let upto = self.next_stripe;
        let (done, rx) = channel::bounded(1);
        self.tx
            .send(SyncCommand::WaitDurable { upto, done })
            .map_err(|_| StripeError::Closed)?;

        match mode {
            FlushMode::Sync => {
                rx.recv().map_err(|_| StripeError::Closed)??;
                Ok(None)
            }
            FlushMode::Async => Ok(Some(StripeTicket { rx })),
        }
    }

    /// Flushes synchronously and stops the fsync worker. Idempotent.
    pub fn close(&mut self) -> Result<(), StripeError> {
        if self.closed {
            return Ok(());
        }
        self.flush(FlushMode::Sync)?;
        self.closed = true;
        let (done, rx) = channel::bounded(1);
        if self.tx.send(SyncCommand::Shutdown { done }).is_ok() {
            let _ = rx.recv();
        }
        if let Some(handle) = self.worker.take() {
            handle
                .join()
                .map_err(|_| StripeError::Internal("stripe worker thread panicked".into()))?;
        }
        Ok(())
    }
}

impl Drop for StripeWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "stripe writer close failed on drop");
        }
    }
}

// ------------------------------------------------------------------------------------------------
// StripeReader
// ------------------------------------------------------------------------------------------------

/// Sequential reader over a stripe set, with parity reconstruction.
pub struct StripeReader {
    dir: PathBuf,
    coder: ParityCoder,
}

impl StripeReader {
    /// Opens a reader over the lanes in `dir`.
    ///
    /// Readers hold no file handles between calls — lanes are opened
    /// per read so the reader never interferes with the writer's
    /// exclusive ownership.
    pub fn open(dir: impl AsRef<Path>, kind: ParityKind, k: usize) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            coder: kind.coder(k),
        }
    }

    /// Number of complete stripes present across all lanes.
    pub fn stripe_count(&self) -> u64 {
        let k = self.coder.data_lanes();
        let m = self.coder.parity_lanes();
        let mut count = u64::MAX;
        for lane in 0..k {
            count = count.min(lane_block_count(&data_lane_path(&self.dir, lane)));
        }
        for lane in 0..m {
            count = count.min(lane_block_count(&parity_lane_path(&self.dir, lane)));
        }
        if count == u64::MAX { 0 } else { count }
    }

    /// Reads stripe `stripe`, reconstructing up to `m` damaged lanes.
    ///
    /// Returns the `k` data blocks. Fails with [`StripeError::Corrupt`]
    /// when erasures exceed the parity budget.
    pub fn read_stripe(&self, stripe: u64) -> Result<Vec<Vec<u8>>, StripeError> {
        let k = self.coder.data_lanes();
        let m = self.coder.parity_lanes();
        let offset = stripe * BLOCK_SIZE as u64;

        let mut data: Vec<Option<Vec<u8>>> = (0..k)
            .map(|lane| read_lane_block(&data_lane_path(&self.dir, lane), offset))
            .collect();
        let mut parity: Vec<Option<Vec<u8>>> = (0..m)
            .map(|lane| read_lane_block(&parity_lane_path(&self.dir, lane), offset))
            .collect();

        let erasures = data.iter().filter(|b| b.is_none()).count()
            + parity.iter().filter(|b| b.is_none()).count();
        if erasures > 0 {
            debug!(stripe, erasures, "stripe lane damage, reconstructing");
            self.coder
                .reconstruct(&mut data, &mut parity, BLOCK_SIZE)
                .map_err(|_| StripeError::Corrupt {
                    stripe,
                    reason: "erasures exceed parity",
                })?;
            // A rebuilt data lane must still be a well-formed block.
            for lane in data.iter().flatten() {
                if verify_block(lane).is_err() {
                    return Err(StripeError::Corrupt {
                        stripe,
                        reason: "reconstructed block failed checksum",
                    });
                }
            }
        }

        Ok(data
            .into_iter()
            .map(|lane| lane.unwrap_or_default())
            .collect())
    }

    /// Iterator over all stripes in order.
    pub fn stripes(&self) -> impl Iterator<Item = Result<Vec<Vec<u8>>, StripeError>> + '_ {
        (0..self.stripe_count()).map(move |idx| self.read_stripe(idx))
    }
}

/// Complete blocks in a lane file (0 when absent).
fn lane_block_count(path: &Path) -> u64 {
    fs::metadata(path)
        .map(|meta| meta.len() / BLOCK_SIZE as u64)
        .unwrap_or(0)
}

/// Reads and CRC-validates one block; `None` marks the lane erased at
/// this offset (missing, short, or corrupt).
fn read_lane_block(path: &Path, offset: u64) -> Option<Vec<u8>> {
    let file = File::open(path).ok()?;
    let mut block = vec![0u8; BLOCK_SIZE];
    file.read_exact_at(&mut block, offset).ok()?;
    verify_block(&block).ok()?;
    Some(block)
}

// ------------------------------------------------------------------------------------------------
// Recovery
// ------------------------------------------------------------------------------------------------

/// Outcome of [`recover`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripeRecovery {
    /// Index of the newest valid stripe, if any.
    pub last_sealed: Option<u64>,

    /// Index of the newest durable stripe — after truncation this
    /// equals `last_sealed` (everything kept survived the crash).
    pub last_durable: Option<u64>,

    /// Whether a torn or unrecoverable tail was truncated.
    pub truncated_tail: bool,

    /// Count of valid stripes; the writer resumes here.
    pub stripes: u64,
}

/// Scans lane tails, truncates incomplete or unreadable trailing
/// stripes, and reports where the writer may resume.
pub fn recover(dir: impl AsRef<Path>, kind: ParityKind, k: usize) -> Result<StripeRecovery, StripeError> {
    let dir = dir.as_ref();
    let m = kind.parity_lanes();

    let mut lane_paths: Vec<PathBuf> = (0..k).map(|lane| data_lane_path(dir, lane)).collect();
    lane_paths.extend((0..m).map(|lane| parity_lane_path(dir, lane)));

    let exists = lane_paths.iter().any(|p| p.exists());
    if !exists {
        return Ok(StripeRecovery {
            last_sealed: None,
            last_durable: None,
            truncated_tail: false,
            stripes: 0,
        });
    }

    // Complete stripes = the shortest lane, rounded down to block size.
    let mut complete = u64::MAX;
    let mut ragged = false;
    for path in &lane_paths {
        let len = fs::metadata(path).map(|meta| meta.len()).unwrap_or(0);
        if len % BLOCK_SIZE as u64 != 0 {
            ragged = true;
        }
        complete = complete.min(len / BLOCK_SIZE as u64);
    }
    if complete == u64::MAX {
        complete = 0;
    }

    // Drop trailing stripes that cannot be served even with parity —
    // a crash can tear several lane writes of the same stripe.
    let reader = StripeReader::open(dir, kind, k);
    let mut kept = complete;
    while kept > 0 {
        match reader.read_stripe(kept - 1) {
            Ok(_) => break,
            Err(StripeError::Corrupt { .. }) => {
                warn!(stripe = kept - 1, "unrecoverable trailing stripe truncated");
                kept -= 1;
            }
            Err(e) => return Err(e),
        }
    }

    let truncated_tail = ragged || kept != complete;
    let target = kept * BLOCK_SIZE as u64;
    for path in &lane_paths {
        if let Ok(meta) = fs::metadata(path)
            && meta.len() > target
        {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(target)?;
            file.sync_all()?;
        }
    }

    info!(stripes = kept, truncated_tail, "stripe recovery complete");
    Ok(StripeRecovery {
        last_sealed: kept.checked_sub(1),
        last_durable: kept.checked_sub(1),
        truncated_tail,
        stripes: kept,
    })
}
