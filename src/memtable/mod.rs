//! # Memtable Module
//!
//! The mutable, in-memory write buffer of the storage engine: a **sharded,
//! sequence-versioned sorted map**.
//!
//! ## Design Invariants
//!
//! - Every mutation carries a sequence number drawn from the memtable's
//!   global, lock-free counter; higher seq always wins per key.
//! - A key lives in exactly one shard (`key_hash32 % shard_count`), so a
//!   point lookup touches one lock and a sealed snapshot never holds two
//!   entries for the same key.
//! - Deletes are tombstone records, not physical removal; resolution is
//!   deferred to readers and the compactor.
//! - Byte accounting (`kLen + vLen + 24` per entry) drives the flush
//!   trigger; sealed snapshots stay readable until the flush worker
//!   reports them durable.
//!
//! ## Concurrency
//!
//! - Shards are independent `RwLock`s — writers to different shards do
//!   not contend.
//! - `next_seq` is a lock-free atomic fetch-add.
//! - Sealing swaps the active maps out under the write locks and leaves
//!   them readable as immutable snapshots; one background flush worker
//!   per memtable consumes snapshots in order, preserving per-key
//!   ordering across flushes.
//!
//! ## Flush Semantics
//!
//! [`Memtable::seal`] produces a [`MemSnapshot`]: one sorted map per
//! shard, a consistent cut of the whole memtable. [`MemSnapshot::iter`]
//! merges the shards into a single stream in unsigned-lex key order with
//! one entry per key, each carrying its original seq — exactly the input
//! contract of the SST writer.

#[cfg(test)]
mod tests;

use std::{
    collections::{BTreeMap, VecDeque},
    ops::Bound,
    sync::{
        Arc, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use thiserror::Error;
use tracing::{debug, trace};

use crate::block::FLAG_TOMBSTONE;
use crate::codec;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Memtable`] operations.
#[derive(Debug, Error)]
pub enum MemtableError {
    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// MemRecord
// ------------------------------------------------------------------------------------------------

/// A single versioned entry in the memtable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemRecord {
    /// The key bytes.
    pub key: Vec<u8>,

    /// The value bytes. Empty for tombstones (emptiness does **not**
    /// imply deletion — the flag does).
    pub value: Vec<u8>,

    /// Global sequence number of this mutation.
    pub seq: u64,

    /// Record flags; bit0 = tombstone.
    pub flags: u8,

    /// Shard/bucket hash of the key (low half of the SipHash fingerprint).
    pub key_hash32: u32,
}

impl MemRecord {
    /// Creates a put record.
    pub fn put(key: Vec<u8>, value: Vec<u8>, seq: u64) -> Self {
        let key_hash32 = codec::key_hash32(&key);
        Self {
            key,
            value,
            seq,
            flags: 0,
            key_hash32,
        }
    }

    /// Creates a tombstone record.
    pub fn tombstone(key: Vec<u8>, seq: u64) -> Self {
        let key_hash32 = codec::key_hash32(&key);
        Self {
            key,
            value: Vec::new(),
            seq,
            flags: FLAG_TOMBSTONE,
            key_hash32,
        }
    }

    /// Whether this record marks a deletion.
    pub fn is_tombstone(&self) -> bool {
        self.flags & FLAG_TOMBSTONE != 0
    }

    /// Accounted in-memory footprint of this record.
    pub fn approx_bytes(&self) -> usize {
        self.key.len() + self.value.len() + 24
    }
}

// ------------------------------------------------------------------------------------------------
// Shard
// ------------------------------------------------------------------------------------------------

/// One shard of the memtable: the active map plus sealed snapshots
/// awaiting flush, newest first.
struct Shard {
    /// Writable map, keyed by unsigned-lex key bytes.
    active: BTreeMap<Vec<u8>, MemRecord>,

    /// Sealed maps awaiting flush, newest first, tagged with the
    /// snapshot epoch that sealed them.
    immutables: VecDeque<(u64, Arc<BTreeMap<Vec<u8>, MemRecord>>)>,

    /// Accounted size of `active`.
    bytes_active: usize,
}

impl Shard {
    fn new() -> Self {
        Self {
            active: BTreeMap::new(),
            immutables: VecDeque::new(),
            bytes_active: 0,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Memtable Core
// ------------------------------------------------------------------------------------------------

/// Sharded, sequence-versioned in-memory write buffer.
pub struct Memtable {
    /// Independent fine-grained shard locks.
    shards: Vec<RwLock<Shard>>,

    /// Global sequence counter. Stores the **next** seq to hand out.
    next_seq: AtomicU64,

    /// Monotonic epoch tagging sealed snapshots.
    seal_epoch: AtomicU64,

    /// Per-shard byte threshold that arms the flush hint.
    threshold_per_shard: usize,
}

/// Number of shards for the current machine:
/// `min(8, max(2, available_parallelism))`.
pub fn default_shard_count() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    cpus.clamp(2, 8)
}

impl Memtable {
    /// Creates an empty memtable with the given shard count and per-shard
    /// flush threshold in bytes.
    pub fn new(shard_count: usize, threshold_per_shard: usize) -> Self {
        let shard_count = shard_count.max(1);
        let mut shards = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            shards.push(RwLock::new(Shard::new()));
        }
        Self {
            shards,
            next_seq: AtomicU64::new(1),
            seal_epoch: AtomicU64::new(0),
            threshold_per_shard,
        }
    }

    /// Allocates the next global sequence number. Lock-free.
    pub fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Highest sequence number handed out so far (0 if none).
    pub fn last_seq(&self) -> u64 {
        self.next_seq.load(Ordering::SeqCst).saturating_sub(1)
    }

    /// Advances the sequence counter past `seq`.
    ///
    /// Must only be called during recovery, before any writes — it keeps
    /// fresh sequence numbers above everything replayed or found on disk.
    pub fn bump_seq_floor(&self, seq: u64) {
        let mut current = self.next_seq.load(Ordering::SeqCst);
        while current < seq.saturating_add(1) {
            match self.next_seq.compare_exchange(
                current,
                seq.saturating_add(1),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    fn shard_for(&self, key_hash32: u32) -> &RwLock<Shard> {
        &self.shards[key_hash32 as usize % self.shards.len()]
    }

    fn read_shard<'a>(&self, shard: &'a RwLock<Shard>) -> Result<RwLockReadGuard<'a, Shard>, MemtableError> {
        shard
            .read()
            .map_err(|_| MemtableError::Internal("shard lock poisoned".into()))
    }

    fn write_shard<'a>(
        &self,
        shard: &'a RwLock<Shard>,
    ) -> Result<RwLockWriteGuard<'a, Shard>, MemtableError> {
        shard
            .write()
            .map_err(|_| MemtableError::Internal("shard lock poisoned".into()))
    }

    /// Inserts a record, keeping the highest-seq version per key.
    ///
    /// A record whose seq is not newer than the resident version is
    /// discarded — this makes WAL replay idempotent.
    pub fn put(&self, rec: MemRecord) -> Result<(), MemtableError> {
        let shard = self.shard_for(rec.key_hash32);
        let mut guard = self.write_shard(shard)?;

        let added = rec.approx_bytes();
        let resident = guard
            .active
            .get(&rec.key)
            .map(|current| (current.seq, current.approx_bytes()));
        match resident {
            Some((current_seq, _)) if current_seq >= rec.seq => {
                trace!(seq = rec.seq, current = current_seq, "stale put discarded");
                return Ok(());
            }
            Some((_, removed)) => {
                guard.bytes_active += added;
                guard.bytes_active -= removed;
            }
            None => guard.bytes_active += added,
        }
        guard.active.insert(rec.key.clone(), rec);
        Ok(())
    }

    /// Returns the newest resident version of `key`, tombstones included.
    pub fn get(&self, key: &[u8]) -> Result<Option<MemRecord>, MemtableError> {
        let shard = self.shard_for(codec::key_hash32(key));
        let guard = self.read_shard(shard)?;

        if let Some(rec) = guard.active.get(key) {
            return Ok(Some(rec.clone()));
        }
        for (_, sealed) in &guard.immutables {
            if let Some(rec) = sealed.get(key) {
                return Ok(Some(rec.clone()));
            }
        }
        Ok(None)
    }

    /// Compare-and-swap on a single key.
    ///
    /// Succeeds iff the current version of `key` carries exactly
    /// `expected_seq`; `expected_seq == 0` means "key must be absent".
    /// When the memtable holds no version of the key, `disk_seq` — the
    /// seq of the newest on-disk version, 0 if none — stands in as the
    /// current seq (SSTs are immutable, so it cannot change under us).
    ///
    /// On success installs a put (`Some(value)`) or a tombstone (`None`)
    /// with a freshly allocated seq, and returns it for WAL logging.
    pub fn compare_and_swap(
        &self,
        key: &[u8],
        expected_seq: u64,
        new_value: Option<Vec<u8>>,
        disk_seq: u64,
    ) -> Result<Option<MemRecord>, MemtableError> {
        let key_hash32 = codec::key_hash32(key);
        let shard = self.shard_for(key_hash32);
        let mut guard = self.write_shard(shard)?;

        let current_seq = guard
            .active
            .get(key)
            .map(|rec| rec.seq)
            .or_else(|| {
                guard
                    .immutables
                    .iter()
                    .find_map(|(_, sealed)| sealed.get(key).map(|rec| rec.seq))
            })
            .unwrap_or(disk_seq);

        if current_seq != expected_seq {
            trace!(current_seq, expected_seq, "CAS mismatch");
            return Ok(None);
        }

        let seq = self.next_seq();
        let rec = match new_value {
            Some(value) => MemRecord::put(key.to_vec(), value, seq),
            None => MemRecord::tombstone(key.to_vec(), seq),
        };

        let added = rec.approx_bytes();
        let removed = guard.active.get(key).map(|current| current.approx_bytes());
        match removed {
            Some(removed) => {
                guard.bytes_active += added;
                guard.bytes_active -= removed;
            }
            None => guard.bytes_active += added,
        }
        guard.active.insert(rec.key.clone(), rec.clone());
        Ok(Some(rec))
    }

    /// Merging iterator over `[start, end_exclusive)` across all shards.
    ///
    /// Yields the newest resident version per key (tombstones included)
    /// in unsigned-lex key order. Callers perform the external merge with
    /// SST iterators.
    pub fn range_iter(
        &self,
        start: &[u8],
        end_exclusive: &[u8],
    ) -> Result<impl Iterator<Item = MemRecord> + use<>, MemtableError> {
        let mut merged: BTreeMap<Vec<u8>, MemRecord> = BTreeMap::new();
        let range = (
            Bound::Included(start.to_vec()),
            if end_exclusive.is_empty() {
                Bound::Unbounded
            } else {
                Bound::Excluded(end_exclusive.to_vec())
            },
        );

        for shard in &self.shards {
            let guard = self.read_shard(shard)?;

            for (key, rec) in guard.active.range::<Vec<u8>, _>((range.0.clone(), range.1.clone())) {
                match merged.get(key) {
                    Some(existing) if existing.seq >= rec.seq => {}
                    _ => {
                        merged.insert(key.clone(), rec.clone());
                    }
                }
            }
            for (_, sealed) in &guard.immutables {
                for (key, rec) in sealed.range::<Vec<u8>, _>((range.0.clone(), range.1.clone())) {
                    match merged.get(key) {
                        Some(existing) if existing.seq >= rec.seq => {}
                        _ => {
                            merged.insert(key.clone(), rec.clone());
                        }
                    }
                }
            }
        }

        Ok(merged.into_values())
    }

    /// Whether any shard has crossed the flush threshold.
    pub fn needs_flush(&self) -> Result<bool, MemtableError> {
        for shard in &self.shards {
            if self.read_shard(shard)?.bytes_active >= self.threshold_per_shard {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Seals the active maps of **all** shards into immutables and
    /// returns the consistent snapshot for the flush worker.
    ///
    /// Returns `None` when the memtable is empty. Sealed data remains
    /// visible to reads until [`release`](Self::release) is called with
    /// the snapshot's epoch (after the flush proves it durable).
    pub fn seal(&self) -> Result<Option<MemSnapshot>, MemtableError> {
        let epoch = self.seal_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let mut maps = Vec::with_capacity(self.shards.len());
        let mut total = 0usize;

        // Take all write locks in index order to get a consistent cut.
        let mut guards = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            guards.push(self.write_shard(shard)?);
        }
        for guard in &mut guards {
            let sealed = std::mem::take(&mut guard.active);
            total += sealed.len();
            let sealed = Arc::new(sealed);
            guard.immutables.push_front((epoch, Arc::clone(&sealed)));
            guard.bytes_active = 0;
            maps.push(sealed);
        }
        drop(guards);

        if total == 0 {
            // Nothing was sealed; drop the empty immutables again.
            self.release(epoch)?;
            return Ok(None);
        }

        debug!(epoch, entries = total, "memtable sealed");
        Ok(Some(MemSnapshot { epoch, maps }))
    }

    /// Drops the sealed maps of `epoch` from every shard once the flush
    /// worker has made them durable.
    pub fn release(&self, epoch: u64) -> Result<(), MemtableError> {
        for shard in &self.shards {
            let mut guard = self.write_shard(shard)?;
            guard.immutables.retain(|(e, _)| *e != epoch);
        }
        Ok(())
    }

    /// Total accounted bytes across all active shard maps.
    pub fn active_bytes(&self) -> Result<usize, MemtableError> {
        let mut total = 0;
        for shard in &self.shards {
            total += self.read_shard(shard)?.bytes_active;
        }
        Ok(total)
    }

    /// Total entries resident (active + sealed), for stats.
    pub fn entry_count(&self) -> Result<usize, MemtableError> {
        let mut total = 0;
        for shard in &self.shards {
            let guard = self.read_shard(shard)?;
            total += guard.active.len();
            total += guard
                .immutables
                .iter()
                .map(|(_, sealed)| sealed.len())
                .sum::<usize>();
        }
        Ok(total)
    }
}

// ------------------------------------------------------------------------------------------------
// MemSnapshot — sealed flush input
// ------------------------------------------------------------------------------------------------

/// A consistent sealed snapshot of the memtable: one sorted map per shard.
///
/// Because shards partition the key space by hash, the maps are disjoint;
/// [`iter`](Self::iter) merges them into one stream in unsigned-lex key
/// order with exactly one entry per key, each carrying its original seq.
pub struct MemSnapshot {
    /// Epoch to pass back to [`Memtable::release`] after the flush.
    pub epoch: u64,

    /// Per-shard sealed maps.
    maps: Vec<Arc<BTreeMap<Vec<u8>, MemRecord>>>,
}

impl MemSnapshot {
    /// Total number of records in the snapshot.
    pub fn len(&self) -> usize {
        self.maps.iter().map(|map| map.len()).sum()
    }

    /// Whether the snapshot holds no records.
    pub fn is_empty(&self) -> bool {
        self.maps.iter().all(|map| map.is_empty())
    }

    /// Highest seq contained in the snapshot (0 when empty).
    pub fn max_seq(&self) -> u64 {
        self.maps
            .iter()
            .flat_map(|map| map.values())
            .map(|rec| rec.seq)
            .max()
            .unwrap_or(0)
    }

    /// K-way merge over the shard maps, yielding records in strict
    /// unsigned-lex key order.
    pub fn iter(&self) -> impl Iterator<Item = &MemRecord> {
        // Shards are disjoint, so a heap merge never sees equal keys.
        use std::cmp::Reverse;
        use std::collections::BinaryHeap;

        struct HeadEntry<'a> {
            rec: &'a MemRecord,
            source: usize,
        }
        impl PartialEq for HeadEntry<'_> {
            fn eq(&self, other: &Self) -> bool {
                self.rec.key == other.rec.key
            }
        }
        impl Eq for HeadEntry<'_> {}
        impl PartialOrd for HeadEntry<'_> {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }
        impl Ord for HeadEntry<'_> {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                self.rec.key.cmp(&other.rec.key)
            }
        }

        let mut iters: Vec<_> = self.maps.iter().map(|map| map.values()).collect();
        let mut heap = BinaryHeap::new();
        for (idx, iter) in iters.iter_mut().enumerate() {
            if let Some(rec) = iter.next() {
                heap.push(Reverse(HeadEntry { rec, source: idx }));
            }
        }

        std::iter::from_fn(move || {
            let Reverse(head) = heap.pop()?;
            if let Some(next) = iters[head.source].next() {
                heap.push(Reverse(HeadEntry {
                    rec: next,
                    source: head.source,
                }));
            }
            Some(head.rec)
        })
    }
}
