#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::engine::EngineError;
    use crate::engine::tests::helpers::{init_tracing, open_db};

    #[test]
    fn test_basic_put_get_delete() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let db = open_db(tmp.path());

        let seq = db.put(b"hello", b"world").unwrap();
        assert_eq!(seq, 1);
        assert_eq!(db.get(b"hello").unwrap(), Some(b"world".to_vec()));

        let seq = db.delete(b"hello").unwrap();
        assert_eq!(seq, 2);
        assert_eq!(db.get(b"hello").unwrap(), None);
        db.close().unwrap();
    }

    #[test]
    fn test_get_absent_key() {
        let tmp = TempDir::new().unwrap();
        let db = open_db(tmp.path());
        assert_eq!(db.get(b"never-written").unwrap(), None);
        db.close().unwrap();
    }

    #[test]
    fn test_overwrite_latest_wins() {
        let tmp = TempDir::new().unwrap();
        let db = open_db(tmp.path());

        let seq1 = db.put(b"k", b"v1").unwrap();
        let seq2 = db.put(b"k", b"v2").unwrap();
        assert!(seq2 > seq1, "seqs must be globally increasing");
        assert_eq!(db.get(b"k").unwrap(), Some(b"v2".to_vec()));
        db.close().unwrap();
    }

    #[test]
    fn test_empty_value_permitted() {
        let tmp = TempDir::new().unwrap();
        let db = open_db(tmp.path());
        db.put(b"k", b"").unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(Vec::new()));
        db.close().unwrap();
    }

    #[test]
    fn test_key_too_large_rejected() {
        let tmp = TempDir::new().unwrap();
        let db = open_db(tmp.path());
        let key = vec![b'k'; crate::block::MAX_KEY_LEN + 1];
        assert!(matches!(
            db.put(&key, b"v").unwrap_err(),
            EngineError::KeyTooLarge(_)
        ));
        // No state change: a normal write still gets seq 1.
        assert_eq!(db.put(b"ok", b"v").unwrap(), 1);
        db.close().unwrap();
    }

    #[test]
    fn test_value_too_large_rejected() {
        let tmp = TempDir::new().unwrap();
        let db = open_db(tmp.path());
        let value = vec![0u8; crate::block::PAYLOAD_LIMIT];
        assert!(matches!(
            db.put(b"k", &value).unwrap_err(),
            EngineError::ValueTooLarge(_)
        ));
        db.close().unwrap();
    }

    #[test]
    fn test_operations_after_close_rejected() {
        let tmp = TempDir::new().unwrap();
        let db = open_db(tmp.path());
        db.put(b"k", b"v").unwrap();
        db.close().unwrap();

        assert!(matches!(db.put(b"x", b"y").unwrap_err(), EngineError::Closed));
        assert!(matches!(db.get(b"k").unwrap_err(), EngineError::Closed));
        // Double close is a no-op.
        db.close().unwrap();
    }

    #[test]
    fn test_concurrent_writers_unique_seqs() {
        let tmp = TempDir::new().unwrap();
        let db = open_db(tmp.path());

        let mut handles = Vec::new();
        for t in 0..4 {
            let db = db.clone();
            handles.push(std::thread::spawn(move || {
                (0..50)
                    .map(|i| db.put(format!("t{t}:k{i}").as_bytes(), b"v").unwrap())
                    .collect::<Vec<u64>>()
            }));
        }
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 200, "seqs must be unique across writers");
        db.close().unwrap();
    }

    #[test]
    fn test_stats_reflect_writes() {
        let tmp = TempDir::new().unwrap();
        let db = open_db(tmp.path());
        for i in 0..10 {
            db.put(format!("k{i}").as_bytes(), b"v").unwrap();
        }
        let stats = db.stats().unwrap();
        assert_eq!(stats.last_seq, 10);
        assert!(stats.memtable_entries > 0 || !stats.levels.is_empty());
        db.close().unwrap();
    }
}
