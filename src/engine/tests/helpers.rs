#![cfg(test)]

use std::path::Path;

use crate::engine::{Db, DbConfig};
use crate::stripe::parity::ParityKind;

/// Small-threshold config suited to tests: flushes trigger after a few
/// KiB, group-commit windows are tight.
pub fn test_config(dir: &Path) -> DbConfig {
    DbConfig {
        wal_group_n: 4,
        wal_group_micros: 200,
        flush_max_blocks: 4,
        flush_max_micros: 200,
        memtable_threshold_per_shard: 16 * 1024,
        shard_count: 4,
        k: 2,
        parity: ParityKind::Xor,
        manifest_rotate_bytes: 64 * 1024,
        ..DbConfig::new(dir)
    }
}

/// Opens a fresh engine in `dir` with the test config.
pub fn open_db(dir: &Path) -> Db {
    Db::open(test_config(dir)).unwrap()
}

/// Initializes test tracing once.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Snapshots the on-disk state of a running engine into `dst`.
///
/// Copying the directory captures exactly the bytes a crash would
/// leave behind — everything fsynced is present, nothing else is
/// guaranteed — without fighting the live engine's worker threads.
pub fn crash_image(src: &Path, dst: &Path) {
    copy_dir(src, dst);
}

fn copy_dir(src: &Path, dst: &Path) {
    std::fs::create_dir_all(dst).unwrap();
    for entry in std::fs::read_dir(src).unwrap() {
        let entry = entry.unwrap();
        let target = dst.join(entry.file_name());
        if entry.path().is_dir() {
            copy_dir(&entry.path(), &target);
        } else {
            std::fs::copy(entry.path(), &target).unwrap();
        }
    }
}
