#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;
    use std::io::Write;

    use tempfile::TempDir;

    use crate::block::{BLOCK_SIZE, RecordCursor};
    use crate::stripe::parity::ParityKind;
    use crate::stripe::tests::tests_writer::tests::test_block;
    use crate::stripe::{
        FlushMode, StripeError, StripePolicy, StripeReader, StripeWriter, data_lane_path,
        parity_lane_path,
    };

    fn write_stripes(dir: &std::path::Path, kind: ParityKind, k: usize, blocks: u64) {
        let mut writer =
            StripeWriter::open(dir, kind, k, StripePolicy::default(), 0).unwrap();
        for i in 0..blocks {
            writer.append_block(&test_block(i)).unwrap();
        }
        writer.flush(FlushMode::Sync).unwrap();
        writer.close().unwrap();
    }

    /// Zeroes an entire lane file, simulating device loss of one column.
    fn zero_lane(path: &std::path::Path) {
        let len = std::fs::metadata(path).unwrap().len();
        let mut file = OpenOptions::new().write(true).open(path).unwrap();
        file.write_all(&vec![0u8; len as usize]).unwrap();
        file.sync_all().unwrap();
    }

    #[test]
    fn test_round_trip_clean_lanes() {
        let tmp = TempDir::new().unwrap();
        write_stripes(tmp.path(), ParityKind::Xor, 4, 8);

        let reader = StripeReader::open(tmp.path(), ParityKind::Xor, 4);
        assert_eq!(reader.stripe_count(), 2);

        let stripe = reader.read_stripe(0).unwrap();
        assert_eq!(stripe.len(), 4);
        for (lane, block) in stripe.iter().enumerate() {
            let mut cursor = RecordCursor::new(block).unwrap();
            let rec = cursor.try_next().unwrap().unwrap();
            assert_eq!(rec.key, format!("block:{lane:08}").as_bytes());
        }
    }

    #[test]
    fn test_single_lane_loss_reconstructed_with_xor() {
        let tmp = TempDir::new().unwrap();
        write_stripes(tmp.path(), ParityKind::Xor, 4, 12);

        let reader = StripeReader::open(tmp.path(), ParityKind::Xor, 4);
        let before: Vec<_> = reader.stripes().collect::<Result<Vec<_>, _>>().unwrap();

        zero_lane(&data_lane_path(tmp.path(), 2));

        let after: Vec<_> = reader.stripes().collect::<Result<Vec<_>, _>>().unwrap();
        assert_eq!(before, after, "reconstruction must be bit-identical");
    }

    #[test]
    fn test_parity_lane_loss_tolerated() {
        let tmp = TempDir::new().unwrap();
        write_stripes(tmp.path(), ParityKind::Xor, 4, 8);

        zero_lane(&parity_lane_path(tmp.path(), 0));

        let reader = StripeReader::open(tmp.path(), ParityKind::Xor, 4);
        for stripe in reader.stripes() {
            stripe.unwrap();
        }
    }

    #[test]
    fn test_two_lane_loss_with_dual_parity() {
        let tmp = TempDir::new().unwrap();
        write_stripes(tmp.path(), ParityKind::DualXor, 4, 16);

        let reader = StripeReader::open(tmp.path(), ParityKind::DualXor, 4);
        let before: Vec<_> = reader.stripes().collect::<Result<Vec<_>, _>>().unwrap();

        zero_lane(&data_lane_path(tmp.path(), 0));
        zero_lane(&data_lane_path(tmp.path(), 3));

        let after: Vec<_> = reader.stripes().collect::<Result<Vec<_>, _>>().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_erasures_beyond_parity_surface_corrupt() {
        let tmp = TempDir::new().unwrap();
        write_stripes(tmp.path(), ParityKind::Xor, 4, 4);

        zero_lane(&data_lane_path(tmp.path(), 0));
        zero_lane(&data_lane_path(tmp.path(), 1));

        let reader = StripeReader::open(tmp.path(), ParityKind::Xor, 4);
        let err = reader.read_stripe(0).unwrap_err();
        assert!(matches!(err, StripeError::Corrupt { stripe: 0, .. }));
    }

    #[test]
    fn test_single_corrupt_block_repaired() {
        let tmp = TempDir::new().unwrap();
        write_stripes(tmp.path(), ParityKind::Xor, 2, 6);

        // Flip one byte inside lane 1, stripe 1.
        let path = data_lane_path(tmp.path(), 1);
        let mut contents = std::fs::read(&path).unwrap();
        contents[BLOCK_SIZE + 100] ^= 0xFF;
        std::fs::write(&path, &contents).unwrap();

        let reader = StripeReader::open(tmp.path(), ParityKind::Xor, 2);
        let stripe = reader.read_stripe(1).unwrap();
        let mut cursor = RecordCursor::new(&stripe[1]).unwrap();
        assert_eq!(
            cursor.try_next().unwrap().unwrap().key,
            format!("block:{:08}", 3).as_bytes()
        );
    }
}
