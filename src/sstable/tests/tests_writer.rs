#[cfg(test)]
pub mod tests {
    use std::path::{Path, PathBuf};

    use tempfile::TempDir;

    use crate::block::BLOCK_SIZE;
    use crate::sstable::{SstHandle, SstMeta, SstWriter};

    /// Builds a table of `count` sequential keys and returns its meta.
    pub fn build_table(dir: &Path, name: &str, count: usize) -> (PathBuf, SstMeta) {
        let path = dir.join(name);
        let mut writer = SstWriter::create(&path, count, 0.01).unwrap();
        for i in 0..count {
            let key = format!("key:{i:08}");
            let value = format!("value-{i}");
            writer.add(key.as_bytes(), value.as_bytes(), i as u64 + 1, 0).unwrap();
        }
        let meta = writer.finish().unwrap();
        (path, meta)
    }

    #[test]
    fn test_meta_reflects_contents() {
        let tmp = TempDir::new().unwrap();
        let (path, meta) = build_table(tmp.path(), "t.sst", 1000);

        assert_eq!(meta.entries, 1000);
        assert_eq!(meta.first_key, b"key:00000000");
        assert_eq!(meta.last_key, b"key:00000999");
        assert!(meta.blocks >= 1);
        assert_eq!(
            meta.file_size,
            std::fs::metadata(&path).unwrap().len()
        );
        assert!(!path.with_extension("tmp").exists(), "tmp file must be renamed away");
    }

    #[test]
    fn test_unsorted_input_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut writer = SstWriter::create(tmp.path().join("bad.sst"), 10, 0.01).unwrap();
        writer.add(b"bbb", b"1", 1, 0).unwrap();
        assert!(writer.add(b"aaa", b"2", 2, 0).is_err());
        assert!(writer.add(b"bbb", b"3", 3, 0).is_err(), "duplicates are rejected");
    }

    #[test]
    fn test_reopen_round_trip() {
        let tmp = TempDir::new().unwrap();
        let (path, meta) = build_table(tmp.path(), "t.sst", 5000);

        let handle = SstHandle::open(&path).unwrap();
        assert_eq!(handle.entries(), 5000);
        assert_eq!(handle.min_key(), meta.first_key.as_slice());
        assert_eq!(handle.max_key(), meta.last_key.as_slice());
        assert_eq!(handle.max_seq(), 5000);
        assert_eq!(handle.file_size(), meta.file_size);
    }

    #[test]
    fn test_block_observer_sees_every_block() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tee.sst");

        let mut seen: Vec<[u8; BLOCK_SIZE]> = Vec::new();
        let meta = {
            let mut writer = SstWriter::create(&path, 2000, 0.01)
                .unwrap()
                .with_block_observer(Box::new(|block: &[u8; BLOCK_SIZE]| {
                    seen.push(*block);
                }));
            for i in 0..2000 {
                let key = format!("key:{i:08}");
                writer.add(key.as_bytes(), &[0xAB; 64], i as u64 + 1, 0).unwrap();
            }
            writer.finish().unwrap()
        };

        assert_eq!(seen.len(), meta.blocks);
        // Observed bytes are exactly the file's data-block region.
        let file = std::fs::read(&path).unwrap();
        for (i, block) in seen.iter().enumerate() {
            assert_eq!(
                &file[i * BLOCK_SIZE..(i + 1) * BLOCK_SIZE],
                block.as_slice()
            );
        }
    }

    #[test]
    fn test_tombstones_written_with_flag() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tomb.sst");
        let mut writer = SstWriter::create(&path, 2, 0.01).unwrap();
        writer.add(b"alive", b"v", 1, 0).unwrap();
        writer.add_tombstone(b"dead", 2).unwrap();
        writer.finish().unwrap();

        let handle = SstHandle::open(&path).unwrap();
        let rec = handle.get(b"dead").unwrap().unwrap();
        assert!(rec.is_tombstone());
        assert!(rec.value.is_empty());
        let rec = handle.get(b"alive").unwrap().unwrap();
        assert!(!rec.is_tombstone());
    }

    #[test]
    fn test_handle_refcounting() {
        let tmp = TempDir::new().unwrap();
        let (path, _) = build_table(tmp.path(), "t.sst", 10);

        let handle = SstHandle::open(&path).unwrap();
        assert_eq!(handle.refcount(), 1);
        let second = handle.acquire();
        assert_eq!(handle.refcount(), 2);

        let weak = handle.downgrade();
        drop(second);
        assert_eq!(handle.refcount(), 1);
        drop(handle);
        assert!(weak.upgrade().is_none(), "all handles released");
    }
}
