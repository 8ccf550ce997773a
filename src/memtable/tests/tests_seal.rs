#[cfg(test)]
mod tests {
    use crate::memtable::{MemRecord, Memtable};

    #[test]
    fn test_seal_empty_returns_none() {
        let mt = Memtable::new(4, 1024);
        assert!(mt.seal().unwrap().is_none());
    }

    #[test]
    fn test_needs_flush_arms_on_threshold() {
        let mt = Memtable::new(1, 64);
        assert!(!mt.needs_flush().unwrap());

        mt.put(MemRecord::put(b"key".to_vec(), vec![0u8; 64], 1)).unwrap();
        assert!(mt.needs_flush().unwrap());
    }

    #[test]
    fn test_snapshot_sorted_unique_with_original_seqs() {
        let mt = Memtable::new(8, 1 << 20);
        let mut expected = Vec::new();
        for i in 0..100 {
            let key = format!("key:{i:05}").into_bytes();
            let seq = mt.next_seq();
            mt.put(MemRecord::put(key.clone(), b"v".to_vec(), seq)).unwrap();
            expected.push((key, seq));
        }
        expected.sort();

        let snapshot = mt.seal().unwrap().unwrap();
        assert_eq!(snapshot.len(), 100);

        let flushed: Vec<(Vec<u8>, u64)> = snapshot
            .iter()
            .map(|rec| (rec.key.clone(), rec.seq))
            .collect();
        assert_eq!(flushed, expected, "snapshot must be key-sorted with original seqs");
    }

    #[test]
    fn test_sealed_data_remains_readable_until_release() {
        let mt = Memtable::new(4, 1 << 20);
        let seq = mt.next_seq();
        mt.put(MemRecord::put(b"k".to_vec(), b"v".to_vec(), seq)).unwrap();

        let snapshot = mt.seal().unwrap().unwrap();

        // Still visible from the immutables.
        assert_eq!(mt.get(b"k").unwrap().unwrap().value, b"v");

        mt.release(snapshot.epoch).unwrap();
        assert!(mt.get(b"k").unwrap().is_none());
    }

    #[test]
    fn test_write_after_seal_goes_to_fresh_active() {
        let mt = Memtable::new(4, 1 << 20);
        mt.put(MemRecord::put(b"k".to_vec(), b"old".to_vec(), 1)).unwrap();
        let snapshot = mt.seal().unwrap().unwrap();

        mt.put(MemRecord::put(b"k".to_vec(), b"new".to_vec(), 2)).unwrap();

        // Active wins over sealed.
        assert_eq!(mt.get(b"k").unwrap().unwrap().value, b"new");

        // The snapshot still carries the old version.
        let sealed: Vec<_> = snapshot.iter().collect();
        assert_eq!(sealed.len(), 1);
        assert_eq!(sealed[0].value, b"old");
    }

    #[test]
    fn test_two_snapshots_release_independently() {
        let mt = Memtable::new(2, 1 << 20);
        mt.put(MemRecord::put(b"a".to_vec(), b"1".to_vec(), 1)).unwrap();
        let snap1 = mt.seal().unwrap().unwrap();

        mt.put(MemRecord::put(b"b".to_vec(), b"2".to_vec(), 2)).unwrap();
        let snap2 = mt.seal().unwrap().unwrap();

        mt.release(snap1.epoch).unwrap();
        assert!(mt.get(b"a").unwrap().is_none());
        assert_eq!(mt.get(b"b").unwrap().unwrap().value, b"2");

        mt.release(snap2.epoch).unwrap();
        assert!(mt.get(b"b").unwrap().is_none());
    }

    #[test]
    fn test_snapshot_max_seq() {
        let mt = Memtable::new(4, 1 << 20);
        mt.put(MemRecord::put(b"a".to_vec(), b"1".to_vec(), 3)).unwrap();
        mt.put(MemRecord::put(b"b".to_vec(), b"2".to_vec(), 9)).unwrap();
        let snapshot = mt.seal().unwrap().unwrap();
        assert_eq!(snapshot.max_seq(), 9);
    }
}
