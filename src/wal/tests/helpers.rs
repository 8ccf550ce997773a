#![cfg(test)]

use std::path::Path;
use std::sync::Arc;

use crate::codec::pool::BufPool;
use crate::wal::{Wal, WalEntry, WalError, WalOp, WalOptions, WalReplay};

/// Opens a WAL with small group-commit thresholds suited to tests.
pub fn open_wal(dir: &Path) -> Wal {
    Wal::open(
        dir,
        "wal",
        WalOptions {
            group_n: 4,
            group_micros: 200,
            fast_mode: true,
        },
        Arc::new(BufPool::new()),
    )
    .unwrap()
}

/// Collects every replayable entry, failing the test on a hard error.
pub fn replay_all(dir: &Path) -> Vec<WalEntry> {
    WalReplay::open(dir, "wal")
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

/// Collects entries until the first error, returning both.
pub fn replay_until_error(dir: &Path) -> (Vec<WalEntry>, Option<WalError>) {
    let mut entries = Vec::new();
    let mut error = None;
    for item in WalReplay::open(dir, "wal").unwrap() {
        match item {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                error = Some(e);
                break;
            }
        }
    }
    (entries, error)
}

/// Convenience constructor for an `Add` op.
pub fn add(key: &[u8], value: &[u8], seq: u64) -> WalOp {
    WalOp::Add {
        key: key.to_vec(),
        value: value.to_vec(),
        seq,
        flags: 0,
    }
}

/// Convenience constructor for a `Delete` op.
pub fn delete(key: &[u8], seq: u64) -> WalOp {
    WalOp::Delete {
        key: key.to_vec(),
        seq,
    }
}
