#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::memtable::{MemRecord, Memtable};
    use crate::wal::tests::helpers::{add, delete, open_wal, replay_all};
    use crate::wal::{WalOp, WalReplay};

    /// Applies replayed ops to a memtable the way the engine does.
    fn rebuild_memtable(dir: &std::path::Path) -> Memtable {
        let mt = Memtable::new(4, 1 << 20);
        let mut max_seq = 0u64;
        for entry in WalReplay::open(dir, "wal").unwrap() {
            let entry = entry.unwrap();
            match entry.op {
                WalOp::Add {
                    key, value, seq, flags,
                } => {
                    max_seq = max_seq.max(seq);
                    let mut rec = MemRecord::put(key, value, seq);
                    rec.flags = flags;
                    mt.put(rec).unwrap();
                }
                WalOp::Delete { key, seq } => {
                    max_seq = max_seq.max(seq);
                    mt.put(MemRecord::tombstone(key, seq)).unwrap();
                }
                WalOp::Seal | WalOp::Checkpoint { .. } => {}
            }
        }
        mt.bump_seq_floor(max_seq);
        mt
    }

    #[test]
    fn test_memtable_rebuilt_from_wal() {
        let tmp = TempDir::new().unwrap();
        let wal = open_wal(tmp.path());

        for i in 0..200u64 {
            wal.append(&add(format!("key:{i:05}").as_bytes(), b"payload", i + 1))
                .unwrap();
        }
        wal.append_durable(&delete(b"key:00042", 201)).unwrap();
        drop(wal);

        let mt = rebuild_memtable(tmp.path());
        assert_eq!(
            mt.get(b"key:00077").unwrap().unwrap().value,
            b"payload"
        );
        assert!(mt.get(b"key:00042").unwrap().unwrap().is_tombstone());
        assert_eq!(mt.last_seq(), 201);
        assert_eq!(mt.next_seq(), 202, "fresh seqs continue past replayed ones");
    }

    #[test]
    fn test_double_replay_yields_identical_state() {
        let tmp = TempDir::new().unwrap();
        let wal = open_wal(tmp.path());
        for i in 0..50u64 {
            wal.append(&add(format!("k{:02}", i % 10).as_bytes(), &i.to_le_bytes(), i + 1))
                .unwrap();
        }
        wal.append_durable(&delete(b"k03", 51)).unwrap();
        drop(wal);

        let a = rebuild_memtable(tmp.path());
        let b = rebuild_memtable(tmp.path());

        let collect = |mt: &Memtable| {
            mt.range_iter(b"", b"")
                .unwrap()
                .map(|r| (r.key, r.value, r.seq, r.flags))
                .collect::<Vec<_>>()
        };
        assert_eq!(collect(&a), collect(&b));
    }

    #[test]
    fn test_replay_across_segments_in_order() {
        let tmp = TempDir::new().unwrap();
        let wal = open_wal(tmp.path());
        wal.append_durable(&add(b"a", b"1", 1)).unwrap();
        wal.seal_segment().unwrap();
        wal.append_durable(&add(b"a", b"2", 2)).unwrap();
        drop(wal);

        let mt = rebuild_memtable(tmp.path());
        assert_eq!(mt.get(b"a").unwrap().unwrap().value, b"2");
    }

    #[test]
    fn test_empty_directory_replays_nothing() {
        let tmp = TempDir::new().unwrap();
        assert!(replay_all(tmp.path()).is_empty());
    }

    #[test]
    fn test_tombstone_flag_preserved_through_replay() {
        let tmp = TempDir::new().unwrap();
        let wal = open_wal(tmp.path());
        // A tombstone shipping an 8-byte deletion timestamp payload
        // travels as Add with the tombstone flag.
        wal.append_durable(&WalOp::Add {
            key: b"k".to_vec(),
            value: 1_700_000_000_000u64.to_le_bytes().to_vec(),
            seq: 1,
            flags: crate::block::FLAG_TOMBSTONE,
        })
        .unwrap();
        drop(wal);

        let entries = replay_all(tmp.path());
        match &entries[0].op {
            WalOp::Add { flags, value, .. } => {
                assert_eq!(*flags, crate::block::FLAG_TOMBSTONE);
                assert_eq!(value.len(), 8);
            }
            other => panic!("unexpected op {other:?}"),
        }
    }
}
