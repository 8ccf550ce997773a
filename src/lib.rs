//! # AkkaraDB
//!
//! An embeddable, single-node, **ordered key-value storage engine**
//! built for predictable tail latency and crash safety. Keys and
//! values are opaque byte sequences; a globally monotonic sequence
//! number orders every mutation.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                          Db                                │
//! │   put/delete ──► WAL (group commit) ──► Memtable (shards)  │
//! │                                            │ seal          │
//! │                                            ▼               │
//! │   flush worker ──► SST writer ──┬──► L0 SSTs ──► compactor │
//! │                                 └──► Stripe lanes (k + m)  │
//! │                                                            │
//! │   ┌──────────────────────────────────────────────────────┐ │
//! │   │       Manifest (append-only event log)               │ │
//! │   └──────────────────────────────────────────────────────┘ │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`engine`] | Public `Db` handle — open, put/get/delete/CAS, range, flush, compact, close |
//! | [`memtable`] | Sharded, sequence-versioned in-memory write buffer |
//! | [`wal`] | Segmented, group-committed write-ahead log |
//! | [`block`] | Fixed 32-byte record header and 32 KiB block format |
//! | [`stripe`] | k+m lane stripe appender with XOR / Reed–Solomon parity |
//! | [`sstable`] | Immutable sorted tables: blocks, sparse index, bloom filter |
//! | [`manifest`] | Append-only metadata event log defining the live file set |
//! | [`compaction`] | Leveled k-way merge with TTL tombstone GC |
//! | [`encoding`] | Deterministic little-endian wire format + varint |
//! | [`codec`] | CRC32C, fixed-seed SipHash-2-4, pooled buffers |
//!
//! ## Key guarantees
//!
//! - **Durability before visibility** — a `put`/`delete` is fsynced in
//!   the WAL before it can be observed by any reader, and the returned
//!   sequence number is unique and globally increasing.
//! - **Crash recovery** — on open, the manifest is folded, live SSTs
//!   are verified, stripe tails are truncated, and the WAL is replayed
//!   from the last checkpoint; a torn trailing frame is discarded.
//! - **Erasure-coded redundancy** — flushed blocks are teed into a
//!   stripe set; up to `m` lost or corrupt lanes per stripe are
//!   rebuilt bit-identically from parity.
//! - **Bounded read amplification** — per-SST bloom filters, a sparse
//!   key index, and a `miniKey` fast path keep point lookups cheap.
//! - **TTL tombstone GC** — bottom-level compaction drops tombstones
//!   once they age past the configured TTL.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use akkaradb::engine::{Db, DbConfig};
//!
//! let db = Db::open(DbConfig::new("/tmp/my_db")).unwrap();
//!
//! // Write — returns the assigned sequence number once durable.
//! let seq = db.put(b"hello", b"world").unwrap();
//!
//! // Read.
//! assert_eq!(db.get(b"hello").unwrap(), Some(b"world".to_vec()));
//!
//! // Compare-and-swap.
//! assert!(db.compare_and_swap(b"hello", seq, Some(b"world2")).unwrap());
//!
//! // Delete.
//! db.delete(b"hello").unwrap();
//! assert_eq!(db.get(b"hello").unwrap(), None);
//!
//! // Range scan (end-exclusive, tombstones filtered).
//! for (key, value, seq) in db.range(b"a", b"z").unwrap() {
//!     println!("{key:?} = {value:?} @ {seq}");
//! }
//!
//! // Graceful shutdown.
//! db.close().unwrap();
//! ```

pub mod block;
pub mod codec;
pub mod compaction;
pub mod encoding;
pub mod engine;
pub mod manifest;
pub mod memtable;
pub mod sstable;
pub mod stripe;
pub mod wal;

pub use engine::{Db, DbConfig, DbStats, EngineError};
pub use stripe::parity::ParityKind;
