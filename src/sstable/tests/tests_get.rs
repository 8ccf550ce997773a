#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::sstable::SstHandle;
    use crate::sstable::tests::tests_writer::tests::build_table;

    #[test]
    fn test_point_lookup_hits() {
        let tmp = TempDir::new().unwrap();
        let (path, _) = build_table(tmp.path(), "t.sst", 10_000);
        let handle = SstHandle::open(&path).unwrap();

        for i in [0usize, 1, 4999, 5000, 9998, 9999] {
            let key = format!("key:{i:08}");
            let rec = handle.get(key.as_bytes()).unwrap().unwrap();
            assert_eq!(rec.value, format!("value-{i}").as_bytes());
            assert_eq!(rec.seq(), i as u64 + 1);
        }
    }

    #[test]
    fn test_point_lookup_misses() {
        let tmp = TempDir::new().unwrap();
        let (path, _) = build_table(tmp.path(), "t.sst", 1000);
        let handle = SstHandle::open(&path).unwrap();

        assert!(handle.get(b"key:99999999").unwrap().is_none());
        assert!(handle.get(b"aaa").unwrap().is_none());
        assert!(handle.get(b"key:00000500x").unwrap().is_none());
    }

    #[test]
    fn test_bloom_prefilter_rejects_absent() {
        let tmp = TempDir::new().unwrap();
        let (path, _) = build_table(tmp.path(), "t.sst", 1000);
        let handle = SstHandle::open(&path).unwrap();

        for i in 0..1000 {
            let key = format!("key:{i:08}");
            assert!(handle.might_contain(key.as_bytes()), "no false negatives");
        }

        let rejected = (0..1000)
            .filter(|i| !handle.might_contain(format!("nope:{i:08}").as_bytes()))
            .count();
        assert!(rejected > 900, "bloom should reject most absent keys");
    }

    #[test]
    fn test_overlap_bounds() {
        let tmp = TempDir::new().unwrap();
        let (path, _) = build_table(tmp.path(), "t.sst", 100);
        let handle = SstHandle::open(&path).unwrap();

        assert!(handle.overlaps(b"key:00000050", b"key:00000060"));
        assert!(handle.overlaps(b"", b""));
        assert!(!handle.overlaps(b"key:00000100", b"")); // past max
        assert!(!handle.overlaps(b"", b"key:00000000")); // before min (exclusive end)
    }

    #[test]
    fn test_keys_longer_than_index_prefix() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("long.sst");
        let mut writer = crate::sstable::SstWriter::create(&path, 3, 0.01).unwrap();

        let base = "prefix-".repeat(10); // 70 bytes, beyond firstKey32
        for suffix in ["aaa", "bbb", "ccc"] {
            let key = format!("{base}{suffix}");
            writer.add(key.as_bytes(), suffix.as_bytes(), 1, 0).unwrap();
        }
        writer.finish().unwrap();

        let handle = SstHandle::open(&path).unwrap();
        let rec = handle.get(format!("{base}bbb").as_bytes()).unwrap().unwrap();
        assert_eq!(rec.value, b"bbb");
    }
}
