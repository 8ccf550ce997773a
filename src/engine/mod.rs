//! # Storage Engine
//!
//! The engine glues the subsystems into one crash-safe, ordered
//! key-value store: WAL-first writes into the sharded memtable,
//! background flushes into SSTs (teed into the stripe set), leveled
//! compaction, and the manifest as metadata authority.
//!
//! ## Write path
//!
//! `put`/`delete` allocate a sequence number, append to the WAL, **wait
//! for the group-commit fsync**, and only then install into the
//! memtable — a record is never visible to readers before it is
//! durable. The returned seq is unique and globally increasing.
//!
//! ## Read path
//!
//! `get` consults the memtable, then SSTs newest-to-oldest (bloom
//! prefilter, per-level short-circuit, tombstones terminate the
//! search), and — only when everything else had no verdict and
//! `use_stripe_for_read` is set — falls back to a sequential stripe
//! scan. Stripe evidence never overrides SST evidence.
//!
//! ## Flush
//!
//! When a memtable shard crosses its byte threshold (or on explicit
//! [`Db::flush`]), the engine seals a consistent snapshot and rotates
//! the WAL under a brief writer-exclusion barrier, then hands the
//! snapshot to the single flush worker. The worker packs it into an L0
//! SST (each data block teed into the stripe writer), waits for SST
//! and stripe durability, seals the file in the manifest, checkpoints
//! the WAL, and prunes obsolete segments.
//!
//! ## Recovery
//!
//! [`Db::open`] folds the manifest, opens the live SSTs (excluding and
//! flagging unopenable ones), removes orphan files, recovers the
//! stripe set (truncating torn tails), replays the WAL from the
//! checkpoint boundary (discarding a torn tail frame), and seeds the
//! sequence counter above everything durable.
//!
//! ## Shutdown
//!
//! [`Db::close`] flushes, drains and joins every worker, and releases
//! the buffer pool. Operations after close fail with
//! [`EngineError::Closed`].

pub mod iter;

#[cfg(test)]
mod tests;

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, RwLock, Weak,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::{SystemTime, UNIX_EPOCH},
};

use crossbeam::channel::{self, Receiver, Sender};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::block::{BLOCK_SIZE, BlockError, HEADER_SIZE, MAX_KEY_LEN, PAYLOAD_LIMIT};
use crate::codec::pool::BufPool;
use crate::compaction::{self, CompactionConfig, CompactionError};
use crate::manifest::{
    Manifest, ManifestError, ManifestEvent, ManifestState, key_hex,
};
use crate::memtable::{MemRecord, MemSnapshot, Memtable, MemtableError, default_shard_count};
use crate::sstable::{SstError, SstHandle, SstReader, SstWriter};
use crate::stripe::{
    self, FlushMode, StripeError, StripePolicy, StripeReader, StripeWriter, parity::ParityKind,
};
use crate::wal::{Wal, WalError, WalOp, WalOptions, WalReplay};

use iter::{MergeIterator, VisibleIter, dedupe_newest};

// ------------------------------------------------------------------------------------------------
// Directory layout
// ------------------------------------------------------------------------------------------------

const WAL_DIR: &str = "wal";
const SST_DIR: &str = "sst";
const STRIPE_DIR: &str = "stripe";
const MANIFEST_DIR: &str = "manifest";
const WAL_PREFIX: &str = "wal";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by the engine API.
#[derive(Debug, Error)]
pub enum EngineError {
    /// WAL subsystem failure.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Memtable subsystem failure.
    #[error("Memtable error: {0}")]
    Memtable(#[from] MemtableError),

    /// SST subsystem failure.
    #[error("SST error: {0}")]
    Sst(#[from] SstError),

    /// Stripe subsystem failure.
    #[error("Stripe error: {0}")]
    Stripe(#[from] StripeError),

    /// Manifest subsystem failure.
    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Compaction failure.
    #[error("Compaction error: {0}")]
    Compaction(#[from] CompactionError),

    /// Record framing failure.
    #[error("Record error: {0}")]
    Record(#[from] BlockError),

    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Key exceeds the 16 KiB limit. No state change.
    #[error("key too large: {0} bytes")]
    KeyTooLarge(usize),

    /// Record exceeds the block payload limit. No state change.
    #[error("value too large: {0} bytes")]
    ValueTooLarge(usize),

    /// The engine has been closed.
    #[error("engine closed")]
    Closed,

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`Db`] instance.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Root directory of the database.
    pub base_dir: PathBuf,

    /// Data lanes per stripe. 0 disables the stripe subsystem.
    pub k: usize,

    /// Parity scheme; its lane count is the `m` of the stripe set.
    pub parity: ParityKind,

    /// WAL group-commit: flush after this many queued entries.
    pub wal_group_n: usize,

    /// WAL group-commit: flush after this many microseconds.
    pub wal_group_micros: u64,

    /// WAL durability: `true` = fdatasync, `false` = fsync.
    pub wal_fast_mode: bool,

    /// Stripe durability: `true` = fdatasync per lane.
    pub stripe_fast_mode: bool,

    /// Stripe group-commit: fsync after this many sealed blocks.
    pub flush_max_blocks: usize,

    /// Stripe group-commit: fsync after this many microseconds.
    pub flush_max_micros: u64,

    /// Log successful CAS installs to the WAL.
    pub durable_cas: bool,

    /// Target bloom filter false-positive rate.
    pub bloom_fp_rate: f64,

    /// Allow the sequential stripe fallback on reads.
    pub use_stripe_for_read: bool,

    /// Memtable shard count.
    pub shard_count: usize,

    /// Per-shard byte threshold arming the flush hint.
    pub memtable_threshold_per_shard: usize,

    /// File-count compaction threshold for L1 and deeper.
    pub max_files_per_level: usize,

    /// File-count compaction threshold for L0.
    pub l0_file_limit: usize,

    /// Minimum tombstone age before bottom-level GC drops it.
    pub tombstone_ttl_millis: u64,

    /// Manifest size that triggers rotation.
    pub manifest_rotate_bytes: u64,
}

impl DbConfig {
    /// Defaults rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            k: 4,
            parity: ParityKind::Xor,
            wal_group_n: 32,
            wal_group_micros: 500,
            wal_fast_mode: true,
            stripe_fast_mode: true,
            flush_max_blocks: 32,
            flush_max_micros: 1_000,
            durable_cas: true,
            bloom_fp_rate: 0.01,
            use_stripe_for_read: false,
            shard_count: default_shard_count(),
            memtable_threshold_per_shard: 4 * 1024 * 1024,
            max_files_per_level: 10,
            l0_file_limit: 4,
            tombstone_ttl_millis: 24 * 60 * 60 * 1000,
            manifest_rotate_bytes: 4 * 1024 * 1024,
        }
    }

    fn compaction(&self) -> CompactionConfig {
        CompactionConfig {
            max_per_level: self.max_files_per_level,
            l0_limit: self.l0_file_limit,
            tombstone_ttl_millis: self.tombstone_ttl_millis,
            bloom_fp_rate: self.bloom_fp_rate,
        }
    }
}

/// Snapshot of engine counters returned by [`Db::stats`].
#[derive(Debug, Clone)]
pub struct DbStats {
    /// Records resident in the memtable (active + sealed).
    pub memtable_entries: usize,

    /// Accounted bytes in the active memtable maps.
    pub memtable_bytes: usize,

    /// `(level, file_count)` pairs for every non-empty level.
    pub levels: Vec<(u32, usize)>,

    /// Stripes sealed so far.
    pub stripes: u64,

    /// Highest assigned sequence number.
    pub last_seq: u64,
}

// ------------------------------------------------------------------------------------------------
// Worker messages
// ------------------------------------------------------------------------------------------------

enum FlushJob {
    Flush {
        snapshot: MemSnapshot,
        done: Option<Sender<Result<(), String>>>,
    },
    Shutdown {
        done: Sender<Result<(), String>>,
    },
}

enum CompactMsg {
    Check,
    Shutdown { done: Sender<()> },
}

// ------------------------------------------------------------------------------------------------
// Shared state
// ------------------------------------------------------------------------------------------------

struct DbShared {
    config: DbConfig,
    memtable: Memtable,
    wal: Mutex<Wal>,
    manifest: Mutex<Manifest>,
    /// Live SST handles per level, seal order (oldest first).
    levels: RwLock<BTreeMap<u32, Vec<SstHandle>>>,
    /// Files awaiting unlink: manifest already recorded the delete,
    /// the last reader handle may not have dropped yet.
    pending_delete: Mutex<Vec<(PathBuf, Weak<SstReader>)>>,
    /// `(max_seq, wall_millis)` samples taken at flush boundaries,
    /// feeding the compactor's seq → time oracle.
    seq_time: RwLock<Vec<(u64, u64)>>,
    /// Serializes compaction rounds: the background worker and
    /// caller-invoked [`Db::compact`] must never interleave.
    compact_gate: Mutex<()>,
    pool: Arc<BufPool>,
    /// Writer-exclusion barrier: operations hold it shared; the flush
    /// seal (memtable + WAL rotation) holds it exclusively so no write
    /// can straddle the snapshot boundary.
    seal_barrier: RwLock<()>,
    closed: AtomicBool,
    sst_dir: PathBuf,
    stripe_dir: PathBuf,
}

impl DbShared {
    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::Acquire) {
            Err(EngineError::Closed)
        } else {
            Ok(())
        }
    }

    fn now_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Unlinks pending-delete files whose last reader handle is gone.
    fn sweep_pending_deletes(&self) {
        let mut pending = match self.pending_delete.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        pending.retain(|(path, weak)| {
            if weak.upgrade().is_some() {
                return true;
            }
            match fs::remove_file(path) {
                Ok(()) => {
                    debug!(path = %path.display(), "retired SST unlinked");
                    false
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to unlink retired SST");
                    true
                }
            }
        });
    }

    /// Newest on-disk version of `key`: `(seq, is_tombstone, value)`.
    fn sst_lookup(&self, key: &[u8]) -> Result<Option<(u64, bool, Vec<u8>)>, EngineError> {
        let levels = self
            .levels
            .read()
            .map_err(|_| EngineError::Internal("levels lock poisoned".into()))?;

        for files in levels.values() {
            let mut best: Option<(u64, bool, Vec<u8>)> = None;
            // Newest file first within a level.
            for handle in files.iter().rev() {
                if !handle.might_contain(key) {
                    continue;
                }
                if let Some(rec) = handle.get(key)? {
                    let candidate = (rec.seq(), rec.is_tombstone(), rec.value.to_vec());
                    if best.as_ref().map(|(seq, _, _)| candidate.0 > *seq).unwrap_or(true) {
                        best = Some(candidate);
                    }
                }
            }
            if best.is_some() {
                // Deeper levels hold strictly older versions.
                return Ok(best);
            }
        }
        Ok(None)
    }

    /// Sequential stripe fallback: newest version of `key` across all
    /// stripes, or `None`. Never consulted unless configured, and never
    /// overriding SST evidence.
    fn stripe_lookup(&self, key: &[u8]) -> Result<Option<(u64, bool, Vec<u8>)>, EngineError> {
        let reader = StripeReader::open(&self.stripe_dir, self.config.parity, self.config.k);
        let mut best: Option<(u64, bool, Vec<u8>)> = None;
        for stripe in reader.stripes() {
            let blocks = stripe?;
            for block in &blocks {
                let mut cursor = crate::block::RecordCursor::new(block)?;
                while let Some(rec) = cursor.try_next()? {
                    if rec.key == key
                        && best.as_ref().map(|(seq, _, _)| rec.seq() > *seq).unwrap_or(true)
                    {
                        best = Some((rec.seq(), rec.is_tombstone(), rec.value.to_vec()));
                    }
                }
            }
        }
        Ok(best)
    }

    /// Oracle: approximate wall time for `seq`, from flush samples.
    fn seq_to_millis(&self, seq: u64) -> Option<u64> {
        let samples = self.seq_time.read().ok()?;
        samples
            .iter()
            .find(|(sample_seq, _)| *sample_seq >= seq)
            .map(|(_, millis)| *millis)
    }
}

// ------------------------------------------------------------------------------------------------
// Db — public handle
// ------------------------------------------------------------------------------------------------

/// The embedded storage engine.
///
/// Cheaply cloneable; all clones share one engine instance.
pub struct Db {
    shared: Arc<DbShared>,
    flush_tx: Sender<FlushJob>,
    compact_tx: Sender<CompactMsg>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
    /// Counts public handles only (workers hold `shared` but not this),
    /// so the last `Db` clone can close on drop.
    handle_token: Arc<()>,
}

impl Clone for Db {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            flush_tx: self.flush_tx.clone(),
            compact_tx: self.compact_tx.clone(),
            workers: Arc::clone(&self.workers),
            handle_token: Arc::clone(&self.handle_token),
        }
    }
}

impl Db {
    /// Opens (or creates) a database under `config.base_dir`,
    /// performing full startup recovery.
    pub fn open(config: DbConfig) -> Result<Self, EngineError> {
        let base = &config.base_dir;
        let wal_dir = base.join(WAL_DIR);
        let sst_dir = base.join(SST_DIR);
        let stripe_dir = base.join(STRIPE_DIR);
        let manifest_dir = base.join(MANIFEST_DIR);
        for dir in [&wal_dir, &sst_dir, &stripe_dir, &manifest_dir] {
            fs::create_dir_all(dir)?;
        }

        // 1. Fold the manifest.
        let manifest = Manifest::open(&manifest_dir, config.manifest_rotate_bytes)?;
        let state = manifest.state()?;

        // 2. Open live SSTs; exclude and flag unopenable files.
        let levels = open_live_ssts(&manifest, &state, &sst_dir)?;

        // 3. Remove orphans (files the manifest does not reference).
        remove_orphan_ssts(&manifest.state()?, &sst_dir)?;

        // 4. Recover the stripe set.
        let stripe_info = stripe::recover(&stripe_dir, config.parity, config.k)?;
        if let Some(expected) = state.last_checkpoint.stripe
            && stripe_info.stripes < expected
        {
            warn!(
                durable = stripe_info.stripes,
                expected, "stripe set behind manifest checkpoint"
            );
        }

        // 5. Replay the WAL into a fresh memtable.
        let memtable = Memtable::new(config.shard_count, config.memtable_threshold_per_shard);
        let replay_floor = state.last_checkpoint.last_seq.unwrap_or(0);
        let mut max_replayed = 0u64;
        let mut replayed = 0usize;
        for entry in WalReplay::open(&wal_dir, WAL_PREFIX)? {
            let entry = entry?;
            match entry.op {
                WalOp::Add {
                    key,
                    value,
                    seq,
                    flags,
                } => {
                    max_replayed = max_replayed.max(seq);
                    if seq > replay_floor {
                        let mut rec = MemRecord::put(key, value, seq);
                        rec.flags = flags;
                        memtable.put(rec)?;
                        replayed += 1;
                    }
                }
                WalOp::Delete { key, seq } => {
                    max_replayed = max_replayed.max(seq);
                    if seq > replay_floor {
                        memtable.put(MemRecord::tombstone(key, seq))?;
                        replayed += 1;
                    }
                }
                WalOp::Seal | WalOp::Checkpoint { .. } => {}
            }
        }

        // 6. Seed the global sequence counter above everything durable.
        let mut floor = replay_floor.max(max_replayed);
        for files in levels.values() {
            for handle in files {
                floor = floor.max(handle.max_seq());
            }
        }
        memtable.bump_seq_floor(floor);

        info!(
            base = %base.display(),
            live_ssts = levels.values().map(|files| files.len()).sum::<usize>(),
            stripes = stripe_info.stripes,
            replayed,
            last_seq = floor,
            "engine opened"
        );

        // 7. Start the runtime.
        let pool = Arc::new(BufPool::new());
        let wal = Wal::open(
            &wal_dir,
            WAL_PREFIX,
            WalOptions {
                group_n: config.wal_group_n,
                group_micros: config.wal_group_micros,
                fast_mode: config.wal_fast_mode,
            },
            Arc::clone(&pool),
        )?;
        let stripe_writer = StripeWriter::open(
            &stripe_dir,
            config.parity,
            config.k,
            StripePolicy {
                max_blocks: config.flush_max_blocks,
                max_micros: config.flush_max_micros,
                fast_mode: config.stripe_fast_mode,
            },
            stripe_info.stripes,
        )?;

        let shared = Arc::new(DbShared {
            memtable,
            wal: Mutex::new(wal),
            manifest: Mutex::new(manifest),
            levels: RwLock::new(levels),
            pending_delete: Mutex::new(Vec::new()),
            seq_time: RwLock::new(Vec::new()),
            compact_gate: Mutex::new(()),
            pool,
            seal_barrier: RwLock::new(()),
            closed: AtomicBool::new(false),
            sst_dir,
            stripe_dir,
            config,
        });

        let (flush_tx, flush_rx) = channel::unbounded();
        let (compact_tx, compact_rx) = channel::unbounded();

        let flush_shared = Arc::clone(&shared);
        let flush_compact_tx = compact_tx.clone();
        let flush_worker = std::thread::Builder::new()
            .name("akkara-flush".into())
            .spawn(move || flush_loop(flush_shared, stripe_writer, flush_rx, flush_compact_tx))
            .map_err(|e| EngineError::Internal(format!("failed to spawn flush worker: {e}")))?;

        let compact_shared = Arc::clone(&shared);
        let compact_worker = std::thread::Builder::new()
            .name("akkara-compact".into())
            .spawn(move || compact_loop(compact_shared, compact_rx))
            .map_err(|e| EngineError::Internal(format!("failed to spawn compaction worker: {e}")))?;

        Ok(Self {
            shared,
            flush_tx,
            compact_tx,
            workers: Arc::new(Mutex::new(vec![flush_worker, compact_worker])),
            handle_token: Arc::new(()),
        })
    }

    fn check_record_size(key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        if key.len() > MAX_KEY_LEN {
            return Err(EngineError::KeyTooLarge(key.len()));
        }
        if HEADER_SIZE + key.len() + value.len() > PAYLOAD_LIMIT {
            return Err(EngineError::ValueTooLarge(value.len()));
        }
        Ok(())
    }

    /// Inserts a key-value pair. Returns the assigned seq once the WAL
    /// write is durable.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<u64, EngineError> {
        self.shared.ensure_open()?;
        Self::check_record_size(key, value)?;

        let barrier = self
            .shared
            .seal_barrier
            .read()
            .map_err(|_| EngineError::Internal("seal barrier poisoned".into()))?;

        let seq = self.shared.memtable.next_seq();
        let op = WalOp::Add {
            key: key.to_vec(),
            value: value.to_vec(),
            seq,
            flags: 0,
        };
        let ticket = {
            let wal = self
                .shared
                .wal
                .lock()
                .map_err(|_| EngineError::Internal("wal lock poisoned".into()))?;
            wal.append(&op)?
        };
        ticket.wait()?;

        self.shared
            .memtable
            .put(MemRecord::put(key.to_vec(), value.to_vec(), seq))?;
        drop(barrier);

        self.maybe_flush()?;
        Ok(seq)
    }

    /// Deletes a key (tombstone write). Returns the assigned seq once
    /// the WAL write is durable.
    pub fn delete(&self, key: &[u8]) -> Result<u64, EngineError> {
        self.shared.ensure_open()?;
        if key.len() > MAX_KEY_LEN {
            return Err(EngineError::KeyTooLarge(key.len()));
        }

        let barrier = self
            .shared
            .seal_barrier
            .read()
            .map_err(|_| EngineError::Internal("seal barrier poisoned".into()))?;

        let seq = self.shared.memtable.next_seq();
        let op = WalOp::Delete {
            key: key.to_vec(),
            seq,
        };
        let ticket = {
            let wal = self
                .shared
                .wal
                .lock()
                .map_err(|_| EngineError::Internal("wal lock poisoned".into()))?;
            wal.append(&op)?
        };
        ticket.wait()?;

        self.shared
            .memtable
            .put(MemRecord::tombstone(key.to_vec(), seq))?;
        drop(barrier);

        self.maybe_flush()?;
        Ok(seq)
    }

    /// Point lookup.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        self.shared.ensure_open()?;

        // 1. Memtable — the newest resident version is authoritative.
        if let Some(rec) = self.shared.memtable.get(key)? {
            return Ok(if rec.is_tombstone() {
                None
            } else {
                Some(rec.value)
            });
        }

        // 2. SSTs, newest to oldest; a tombstone terminates the search.
        if let Some((_, is_tombstone, value)) = self.shared.sst_lookup(key)? {
            return Ok(if is_tombstone { None } else { Some(value) });
        }

        // 3. Last-resort stripe fallback.
        if self.shared.config.use_stripe_for_read && self.shared.config.k > 0 {
            if let Some((_, is_tombstone, value)) = self.shared.stripe_lookup(key)? {
                return Ok(if is_tombstone { None } else { Some(value) });
            }
        }
        Ok(None)
    }

    /// Compare-and-swap.
    ///
    /// Succeeds iff the current version of `key` carries exactly
    /// `expected_seq` (`0` = key absent). `Some(value)` installs a put,
    /// `None` a tombstone. Returns `false` on mismatch — never an
    /// error. With `durable_cas`, the installed record is logged to the
    /// WAL (replay is idempotent by seq).
    pub fn compare_and_swap(
        &self,
        key: &[u8],
        expected_seq: u64,
        new_value: Option<&[u8]>,
    ) -> Result<bool, EngineError> {
        self.shared.ensure_open()?;
        if let Some(value) = new_value {
            Self::check_record_size(key, value)?;
        }

        let barrier = self
            .shared
            .seal_barrier
            .read()
            .map_err(|_| EngineError::Internal("seal barrier poisoned".into()))?;

        // Resolve the on-disk seq in case the key was flushed out of
        // the memtable. SSTs are immutable, so this cannot go stale.
        let disk_seq = self
            .shared
            .sst_lookup(key)?
            .map(|(seq, _, _)| seq)
            .unwrap_or(0);

        let installed = self.shared.memtable.compare_and_swap(
            key,
            expected_seq,
            new_value.map(|value| value.to_vec()),
            disk_seq,
        )?;

        let Some(rec) = installed else {
            return Ok(false);
        };

        if self.shared.config.durable_cas {
            let op = if rec.is_tombstone() {
                WalOp::Delete {
                    key: rec.key.clone(),
                    seq: rec.seq,
                }
            } else {
                WalOp::Add {
                    key: rec.key.clone(),
                    value: rec.value.clone(),
                    seq: rec.seq,
                    flags: rec.flags,
                }
            };
            let ticket = {
                let wal = self
                    .shared
                    .wal
                    .lock()
                    .map_err(|_| EngineError::Internal("wal lock poisoned".into()))?;
                wal.append(&op)?
            };
            ticket.wait()?;
        }
        drop(barrier);

        self.maybe_flush()?;
        Ok(true)
    }

    /// Range scan over `[start, end_exclusive)` (empty `end` =
    /// unbounded). Yields `(key, value, seq)` in strictly ascending key
    /// order; tombstones are filtered.
    pub fn range(
        &self,
        start: &[u8],
        end_exclusive: &[u8],
    ) -> Result<impl Iterator<Item = (Vec<u8>, Vec<u8>, u64)> + use<>, EngineError> {
        self.shared.ensure_open()?;

        let mut sources: Vec<Box<dyn Iterator<Item = MemRecord>>> = Vec::new();
        let mem_records: Vec<MemRecord> =
            self.shared.memtable.range_iter(start, end_exclusive)?.collect();
        sources.push(Box::new(mem_records.into_iter()));

        let levels = self
            .shared
            .levels
            .read()
            .map_err(|_| EngineError::Internal("levels lock poisoned".into()))?;
        for files in levels.values() {
            for handle in files {
                if !handle.overlaps(start, end_exclusive) {
                    continue;
                }
                let records: Vec<MemRecord> = handle
                    .range_iter(start, end_exclusive)
                    .collect::<Result<Vec<_>, _>>()?;
                sources.push(Box::new(records.into_iter()));
            }
        }
        drop(levels);

        Ok(VisibleIter::new(dedupe_newest(MergeIterator::new(sources))))
    }

    /// Highest sequence number assigned so far.
    pub fn last_seq(&self) -> u64 {
        self.shared.memtable.last_seq()
    }

    /// Seals the memtable when a shard crossed its threshold.
    fn maybe_flush(&self) -> Result<(), EngineError> {
        if !self.shared.memtable.needs_flush()? {
            return Ok(());
        }
        self.seal_and_enqueue(None)?;
        Ok(())
    }

    /// Seals a snapshot (under the writer-exclusion barrier, rotating
    /// the WAL in the same critical section) and hands it to the flush
    /// worker.
    fn seal_and_enqueue(
        &self,
        done: Option<Sender<Result<(), String>>>,
    ) -> Result<bool, EngineError> {
        let barrier = self
            .shared
            .seal_barrier
            .write()
            .map_err(|_| EngineError::Internal("seal barrier poisoned".into()))?;

        let Some(snapshot) = self.shared.memtable.seal()? else {
            drop(barrier);
            if let Some(done) = done {
                let _ = done.send(Ok(()));
            }
            return Ok(false);
        };
        // Rotate the WAL inside the barrier: every seq in the snapshot
        // now lives in segments older than the new head, and nothing
        // newer can land in those segments.
        {
            let wal = self
                .shared
                .wal
                .lock()
                .map_err(|_| EngineError::Internal("wal lock poisoned".into()))?;
            wal.seal_segment()?;
        }
        drop(barrier);

        debug!(entries = snapshot.len(), epoch = snapshot.epoch, "flush enqueued");
        self.flush_tx
            .send(FlushJob::Flush { snapshot, done })
            .map_err(|_| EngineError::Closed)?;
        Ok(true)
    }

    /// Flushes the memtable and blocks until SST + stripe durability
    /// and the manifest checkpoint.
    pub fn flush(&self) -> Result<(), EngineError> {
        self.shared.ensure_open()?;
        let (done, rx) = channel::bounded(1);
        let enqueued = self.seal_and_enqueue(Some(done))?;
        if !enqueued {
            return Ok(());
        }
        match rx.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(msg)) => Err(EngineError::Internal(msg)),
            Err(_) => Err(EngineError::Closed),
        }
    }

    /// Runs compaction until no level is over-full. Blocks the caller;
    /// background triggering goes through the compaction worker.
    pub fn compact(&self) -> Result<(), EngineError> {
        self.shared.ensure_open()?;
        run_compactions(&self.shared)
    }

    /// Engine statistics.
    pub fn stats(&self) -> Result<DbStats, EngineError> {
        let levels = self
            .shared
            .levels
            .read()
            .map_err(|_| EngineError::Internal("levels lock poisoned".into()))?;
        let level_counts = levels
            .iter()
            .filter(|(_, files)| !files.is_empty())
            .map(|(level, files)| (*level, files.len()))
            .collect();
        let stripes = self
            .shared
            .manifest
            .lock()
            .map_err(|_| EngineError::Internal("manifest lock poisoned".into()))?
            .state()?
            .stripes_committed;
        Ok(DbStats {
            memtable_entries: self.shared.memtable.entry_count()?,
            memtable_bytes: self.shared.memtable.active_bytes()?,
            levels: level_counts,
            stripes,
            last_seq: self.shared.memtable.last_seq(),
        })
    }

    /// Flushes, stops every worker, and releases pooled buffers.
    /// Idempotent; operations after close fail with
    /// [`EngineError::Closed`].
    pub fn close(&self) -> Result<(), EngineError> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // Final flush of whatever is resident, then stop the worker.
        let (done, rx) = channel::bounded(1);
        match self.seal_and_enqueue(Some(done)) {
            Ok(true) => match rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(msg)) => warn!(error = %msg, "final flush failed"),
                Err(_) => warn!("flush worker gone before final flush completed"),
            },
            Ok(false) => {}
            Err(e) => warn!(error = %e, "failed to seal final snapshot"),
        }
        let (done, rx) = channel::bounded(1);
        if self.flush_tx.send(FlushJob::Shutdown { done }).is_ok() {
            let _ = rx.recv();
        }

        let (done, rx) = channel::bounded(1);
        if self.compact_tx.send(CompactMsg::Shutdown { done }).is_ok() {
            let _ = rx.recv();
        }

        if let Ok(mut workers) = self.workers.lock() {
            for handle in workers.drain(..) {
                let _ = handle.join();
            }
        }

        {
            let mut wal = self
                .shared
                .wal
                .lock()
                .map_err(|_| EngineError::Internal("wal lock poisoned".into()))?;
            wal.close()?;
        }
        {
            let mut manifest = self
                .shared
                .manifest
                .lock()
                .map_err(|_| EngineError::Internal("manifest lock poisoned".into()))?;
            manifest.close()?;
        }
        self.shared.sweep_pending_deletes();
        self.shared.pool.drain();
        info!("engine closed");
        Ok(())
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if Arc::strong_count(&self.handle_token) == 1
            && !self.shared.closed.load(Ordering::Acquire)
            && let Err(e) = self.close()
        {
            error!(error = %e, "engine close failed on drop");
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Open helpers
// ------------------------------------------------------------------------------------------------

/// Opens every live SST; unopenable files are excluded from the live
/// set and flagged in the manifest with a `Truncate` note.
fn open_live_ssts(
    manifest: &Manifest,
    state: &ManifestState,
    sst_dir: &Path,
) -> Result<BTreeMap<u32, Vec<SstHandle>>, EngineError> {
    let mut levels: BTreeMap<u32, Vec<SstHandle>> = BTreeMap::new();
    for sst in state.live_files() {
        let path = sst_dir.join(&sst.file);
        match SstHandle::open(&path) {
            Ok(handle) => levels.entry(sst.level).or_default().push(handle),
            Err(e) => {
                warn!(file = %sst.file, error = %e, "live SST unopenable; excluding");
                manifest.append_durable(ManifestEvent::SstDelete {
                    file: sst.file.clone(),
                })?;
                manifest.append_durable(ManifestEvent::Truncate {
                    note: Some(format!("excluded {}: {e}", sst.file)),
                })?;
            }
        }
    }
    Ok(levels)
}

/// Removes SST-directory files the manifest does not reference.
fn remove_orphan_ssts(state: &ManifestState, sst_dir: &Path) -> Result<(), EngineError> {
    for entry in fs::read_dir(sst_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let is_sst = name.ends_with(".sst");
        let is_tmp = name.ends_with(".tmp");
        if (is_sst && !state.is_live(name)) || is_tmp {
            info!(file = name, "removing orphan SST file");
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Flush worker
// ------------------------------------------------------------------------------------------------

fn flush_loop(
    shared: Arc<DbShared>,
    mut stripe_writer: StripeWriter,
    rx: Receiver<FlushJob>,
    compact_tx: Sender<CompactMsg>,
) {
    while let Ok(job) = rx.recv() {
        match job {
            FlushJob::Flush { snapshot, done } => {
                let result = run_flush(&shared, &mut stripe_writer, &snapshot);
                match &result {
                    Ok(()) => {
                        let _ = compact_tx.send(CompactMsg::Check);
                    }
                    Err(e) => error!(error = %e, "flush failed"),
                }
                if let Some(done) = done {
                    let _ = done.send(result.map_err(|e| e.to_string()));
                }
            }
            FlushJob::Shutdown { done } => {
                let result = stripe_writer.close().map_err(|e| e.to_string());
                let _ = done.send(result);
                return;
            }
        }
    }
    let _ = stripe_writer.close();
}

/// One flush: snapshot → L0 SST (blocks teed into the stripe set) →
/// durability → manifest seal → WAL checkpoint + prune.
fn run_flush(
    shared: &Arc<DbShared>,
    stripe_writer: &mut StripeWriter,
    snapshot: &MemSnapshot,
) -> Result<(), EngineError> {
    let file_name = compaction::sst_file_name(0);
    let path = shared.sst_dir.join(&file_name);
    let use_stripe = shared.config.k > 0;

    let mut stripe_error: Option<StripeError> = None;
    let meta = {
        let mut writer = SstWriter::create(&path, snapshot.len(), shared.config.bloom_fp_rate)?;
        if use_stripe {
            let stripe_ref = &mut *stripe_writer;
            let err_ref = &mut stripe_error;
            writer = writer.with_block_observer(Box::new(move |block: &[u8; BLOCK_SIZE]| {
                if err_ref.is_none()
                    && let Err(e) = stripe_ref.append_block(block)
                {
                    *err_ref = Some(e);
                }
            }));
        }
        for rec in snapshot.iter() {
            writer.add(&rec.key, &rec.value, rec.seq, rec.flags)?;
        }
        writer.finish()?
    };
    if let Some(e) = stripe_error {
        return Err(e.into());
    }

    // Stripe durability before the manifest admits the flush.
    if use_stripe {
        stripe_writer.flush(FlushMode::Sync)?;
    }

    let max_seq = snapshot.max_seq();
    let stripes = stripe_writer.next_stripe();
    {
        let manifest = shared
            .manifest
            .lock()
            .map_err(|_| EngineError::Internal("manifest lock poisoned".into()))?;
        if use_stripe {
            manifest.append(ManifestEvent::StripeCommit {
                next_stripe: stripes,
            })?;
        }
        manifest.append_durable(ManifestEvent::SstSeal {
            level: 0,
            file: file_name.clone(),
            entries: meta.entries as u64,
            first_key_hex: Some(key_hex(&meta.first_key)),
            last_key_hex: Some(key_hex(&meta.last_key)),
        })?;
        manifest.append_durable(ManifestEvent::Checkpoint {
            name: None,
            stripe: use_stripe.then_some(stripes),
            last_seq: Some(max_seq),
        })?;
    }

    // Publish the new table, then drop the sealed memtable data.
    let handle = SstHandle::open(&meta.path)?;
    {
        let mut levels = shared
            .levels
            .write()
            .map_err(|_| EngineError::Internal("levels lock poisoned".into()))?;
        levels.entry(0).or_default().push(handle);
    }
    shared.memtable.release(snapshot.epoch)?;

    // Record the seq → time sample for tombstone aging.
    {
        let mut samples = shared
            .seq_time
            .write()
            .map_err(|_| EngineError::Internal("seq_time lock poisoned".into()))?;
        samples.push((max_seq, DbShared::now_millis()));
    }

    // WAL checkpoint: everything ≤ max_seq is durable in the SST.
    {
        let wal = shared
            .wal
            .lock()
            .map_err(|_| EngineError::Internal("wal lock poisoned".into()))?;
        wal.checkpoint(stripes, max_seq)?;
        wal.prune_obsolete_segments()?;
    }

    shared.sweep_pending_deletes();
    info!(
        file = %file_name,
        entries = meta.entries,
        max_seq,
        "memtable flushed"
    );
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Compaction worker
// ------------------------------------------------------------------------------------------------

fn compact_loop(shared: Arc<DbShared>, rx: Receiver<CompactMsg>) {
    while let Ok(msg) = rx.recv() {
        match msg {
            CompactMsg::Check => {
                if let Err(e) = run_compactions(&shared) {
                    error!(error = %e, "background compaction failed");
                }
            }
            CompactMsg::Shutdown { done } => {
                let _ = done.send(());
                return;
            }
        }
    }
}

/// Runs compactions until no level is over-full.
fn run_compactions(shared: &Arc<DbShared>) -> Result<(), EngineError> {
    let _gate = shared
        .compact_gate
        .lock()
        .map_err(|_| EngineError::Internal("compact gate poisoned".into()))?;
    let config = shared.config.compaction();
    loop {
        let snapshot: Vec<(u32, Vec<SstHandle>)> = {
            let levels = shared
                .levels
                .read()
                .map_err(|_| EngineError::Internal("levels lock poisoned".into()))?;
            levels
                .iter()
                .map(|(level, files)| (*level, files.clone()))
                .collect()
        };

        let Some(task) = compaction::pick_task(&config, &snapshot) else {
            return Ok(());
        };

        let oracle_shared = Arc::clone(shared);
        let oracle = move |seq: u64| oracle_shared.seq_to_millis(seq);
        let outcome = {
            let manifest = shared
                .manifest
                .lock()
                .map_err(|_| EngineError::Internal("manifest lock poisoned".into()))?;
            compaction::run_task(
                &task,
                &manifest,
                &shared.sst_dir,
                &config,
                &oracle,
                DbShared::now_millis(),
            )?
        };

        // Swap in the outcome: remove inputs, add the output.
        let removed: std::collections::HashSet<&String> = outcome.removed.iter().collect();
        {
            let mut levels = shared
                .levels
                .write()
                .map_err(|_| EngineError::Internal("levels lock poisoned".into()))?;
            let mut retired: Vec<(PathBuf, Weak<SstReader>)> = Vec::new();
            for files in levels.values_mut() {
                files.retain(|handle| {
                    let name = handle
                        .path()
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    if removed.contains(&name) {
                        retired.push((handle.path().to_path_buf(), handle.downgrade()));
                        false
                    } else {
                        true
                    }
                });
            }
            levels.retain(|_, files| !files.is_empty());
            if let Some(meta) = &outcome.output {
                let handle = SstHandle::open(&meta.path)?;
                levels.entry(outcome.level + 1).or_default().push(handle);
            }

            let mut pending = shared
                .pending_delete
                .lock()
                .map_err(|_| EngineError::Internal("pending_delete lock poisoned".into()))?;
            pending.extend(retired);
        }

        shared.sweep_pending_deletes();
    }
}
