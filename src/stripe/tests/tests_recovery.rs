#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;

    use tempfile::TempDir;

    use crate::block::BLOCK_SIZE;
    use crate::stripe::parity::ParityKind;
    use crate::stripe::tests::tests_writer::tests::test_block;
    use crate::stripe::{
        FlushMode, StripePolicy, StripeReader, StripeWriter, data_lane_path, recover,
    };

    fn write_stripes(dir: &std::path::Path, k: usize, blocks: u64) {
        let mut writer =
            StripeWriter::open(dir, ParityKind::Xor, k, StripePolicy::default(), 0).unwrap();
        for i in 0..blocks {
            writer.append_block(&test_block(i)).unwrap();
        }
        writer.flush(FlushMode::Sync).unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn test_recover_empty_dir() {
        let tmp = TempDir::new().unwrap();
        let info = recover(tmp.path(), ParityKind::Xor, 4).unwrap();
        assert_eq!(info.stripes, 0);
        assert_eq!(info.last_sealed, None);
        assert!(!info.truncated_tail);
    }

    #[test]
    fn test_recover_clean_shutdown() {
        let tmp = TempDir::new().unwrap();
        write_stripes(tmp.path(), 4, 12);

        let info = recover(tmp.path(), ParityKind::Xor, 4).unwrap();
        assert_eq!(info.stripes, 3);
        assert_eq!(info.last_sealed, Some(2));
        assert_eq!(info.last_durable, Some(2));
        assert!(!info.truncated_tail);
    }

    #[test]
    fn test_recover_truncates_ragged_tail() {
        let tmp = TempDir::new().unwrap();
        write_stripes(tmp.path(), 2, 4);

        // Simulate a torn lane write: lane 0 got half a block of stripe 2.
        let path = data_lane_path(tmp.path(), 0);
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(2 * BLOCK_SIZE as u64 + 1000).unwrap();

        let info = recover(tmp.path(), ParityKind::Xor, 2).unwrap();
        assert_eq!(info.stripes, 2);
        assert!(info.truncated_tail);

        // Lane is trimmed back to the stripe boundary.
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            2 * BLOCK_SIZE as u64
        );
    }

    #[test]
    fn test_recover_drops_unreadable_trailing_stripe() {
        let tmp = TempDir::new().unwrap();
        write_stripes(tmp.path(), 2, 4);

        // Corrupt the last stripe in BOTH data lanes — beyond m=1 parity.
        for lane in 0..2 {
            let path = data_lane_path(tmp.path(), lane);
            let mut contents = std::fs::read(&path).unwrap();
            let off = BLOCK_SIZE + 50;
            contents[off] ^= 0xFF;
            std::fs::write(&path, &contents).unwrap();
        }

        let info = recover(tmp.path(), ParityKind::Xor, 2).unwrap();
        assert_eq!(info.stripes, 1, "unrecoverable tail stripe must be dropped");
        assert!(info.truncated_tail);
    }

    #[test]
    fn test_writer_resumes_after_recovery() {
        let tmp = TempDir::new().unwrap();
        write_stripes(tmp.path(), 2, 4);

        let info = recover(tmp.path(), ParityKind::Xor, 2).unwrap();
        assert_eq!(info.stripes, 2);

        let mut writer = StripeWriter::open(
            tmp.path(),
            ParityKind::Xor,
            2,
            StripePolicy::default(),
            info.stripes,
        )
        .unwrap();
        writer.append_block(&test_block(100)).unwrap();
        writer.append_block(&test_block(101)).unwrap();
        writer.flush(FlushMode::Sync).unwrap();
        writer.close().unwrap();

        let reader = StripeReader::open(tmp.path(), ParityKind::Xor, 2);
        assert_eq!(reader.stripe_count(), 3);
        reader.read_stripe(2).unwrap();
    }
}
