#[cfg(test)]
pub mod tests {
    use tempfile::TempDir;

    use crate::block::{BLOCK_SIZE, BlockPacker};
    use crate::codec;
    use crate::stripe::parity::ParityKind;
    use crate::stripe::{
        FlushMode, StripePolicy, StripeWriter, data_lane_path, parity_lane_path,
    };

    pub fn test_block(tag: u64) -> Box<[u8; BLOCK_SIZE]> {
        let mut packer = BlockPacker::new();
        let key = format!("block:{tag:08}");
        let value = vec![tag as u8; 100];
        packer
            .try_append(
                key.as_bytes(),
                &value,
                tag + 1,
                0,
                codec::key_fp64(key.as_bytes()),
                codec::mini_key(key.as_bytes()),
            )
            .unwrap();
        let mut out = Box::new([0u8; BLOCK_SIZE]);
        packer.end_block(&mut |block: &[u8; BLOCK_SIZE]| *out = *block);
        out
    }

    fn policy() -> StripePolicy {
        StripePolicy {
            max_blocks: 8,
            max_micros: 200,
            fast_mode: true,
        }
    }

    #[test]
    fn test_stripe_seals_every_k_blocks() {
        let tmp = TempDir::new().unwrap();
        let mut writer =
            StripeWriter::open(tmp.path(), ParityKind::Xor, 4, policy(), 0).unwrap();

        for i in 0..3 {
            assert!(writer.append_block(&test_block(i)).unwrap().is_none());
        }
        assert_eq!(writer.append_block(&test_block(3)).unwrap(), Some(0));
        assert_eq!(writer.next_stripe(), 1);

        for i in 4..8 {
            writer.append_block(&test_block(i)).unwrap();
        }
        assert_eq!(writer.next_stripe(), 2);
        writer.close().unwrap();
    }

    #[test]
    fn test_lane_files_grow_stripe_aligned() {
        let tmp = TempDir::new().unwrap();
        let mut writer =
            StripeWriter::open(tmp.path(), ParityKind::Xor, 2, policy(), 0).unwrap();

        for i in 0..6 {
            writer.append_block(&test_block(i)).unwrap();
        }
        writer.flush(FlushMode::Sync).unwrap();

        for lane in 0..2 {
            let len = std::fs::metadata(data_lane_path(tmp.path(), lane))
                .unwrap()
                .len();
            assert_eq!(len, 3 * BLOCK_SIZE as u64);
        }
        let parity_len = std::fs::metadata(parity_lane_path(tmp.path(), 0))
            .unwrap()
            .len();
        assert_eq!(parity_len, 3 * BLOCK_SIZE as u64);
        writer.close().unwrap();
    }

    #[test]
    fn test_sync_flush_pads_partial_stripe() {
        let tmp = TempDir::new().unwrap();
        let mut writer =
            StripeWriter::open(tmp.path(), ParityKind::Xor, 4, policy(), 0).unwrap();

        // One block of a 4-lane stripe, then flush: stripe is padded out.
        writer.append_block(&test_block(0)).unwrap();
        writer.flush(FlushMode::Sync).unwrap();
        assert_eq!(writer.next_stripe(), 1);
        assert_eq!(writer.last_durable(), 1);
        writer.close().unwrap();
    }

    #[test]
    fn test_async_flush_ticket_completes() {
        let tmp = TempDir::new().unwrap();
        let mut writer =
            StripeWriter::open(tmp.path(), ParityKind::DualXor, 2, policy(), 0).unwrap();

        for i in 0..4 {
            writer.append_block(&test_block(i)).unwrap();
        }
        let ticket = writer.flush(FlushMode::Async).unwrap().unwrap();
        ticket.wait().unwrap();
        assert_eq!(writer.last_durable(), 2);
        writer.close().unwrap();
    }

    #[test]
    fn test_durability_advances_without_explicit_flush() {
        let tmp = TempDir::new().unwrap();
        let mut writer = StripeWriter::open(
            tmp.path(),
            ParityKind::Xor,
            2,
            StripePolicy {
                max_blocks: 2,
                max_micros: 100,
                fast_mode: true,
            },
            0,
        )
        .unwrap();

        for i in 0..4 {
            writer.append_block(&test_block(i)).unwrap();
        }
        // Group-commit thresholds alone must drive durability forward.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while writer.last_durable() < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(writer.last_durable(), 2);
        writer.close().unwrap();
    }

    #[test]
    fn test_append_after_close_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut writer =
            StripeWriter::open(tmp.path(), ParityKind::None, 2, policy(), 0).unwrap();
        writer.close().unwrap();
        assert!(writer.append_block(&test_block(0)).is_err());
        // Close is idempotent.
        writer.close().unwrap();
    }

    #[test]
    fn test_no_parity_lane_files_for_m0() {
        let tmp = TempDir::new().unwrap();
        let mut writer =
            StripeWriter::open(tmp.path(), ParityKind::None, 2, policy(), 0).unwrap();
        writer.append_block(&test_block(0)).unwrap();
        writer.append_block(&test_block(1)).unwrap();
        writer.flush(FlushMode::Sync).unwrap();
        writer.close().unwrap();

        assert!(data_lane_path(tmp.path(), 0).exists());
        assert!(!parity_lane_path(tmp.path(), 0).exists());
    }
}
