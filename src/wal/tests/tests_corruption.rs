#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};

    use tempfile::TempDir;

    use crate::wal::tests::helpers::{add, open_wal, replay_all, replay_until_error};
    use crate::wal::{WalError, WalReplay, segment_path};

    #[test]
    fn test_torn_tail_discarded_silently() {
        let tmp = TempDir::new().unwrap();
        let wal = open_wal(tmp.path());
        wal.append_durable(&add(b"a", b"1", 1)).unwrap();
        wal.append_durable(&add(b"b", b"2", 2)).unwrap();
        drop(wal);

        // Simulate a crash mid-write: chop the last 3 bytes off the tail.
        let path = segment_path(tmp.path(), "wal", 1);
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        let len = file.metadata().unwrap().len();
        file.set_len(len - 3).unwrap();

        let mut replay = WalReplay::open(tmp.path(), "wal").unwrap();
        let first = replay.next().unwrap().unwrap();
        assert_eq!(first.op, add(b"a", b"1", 1));
        assert!(replay.next().is_none(), "torn frame must be dropped");
        assert_eq!(replay.truncated_tails(), 1);
    }

    #[test]
    fn test_partial_length_prefix_discarded() {
        let tmp = TempDir::new().unwrap();
        let wal = open_wal(tmp.path());
        wal.append_durable(&add(b"a", b"1", 1)).unwrap();
        drop(wal);

        // Append 2 stray bytes — not even a whole length prefix.
        let path = segment_path(tmp.path(), "wal", 1);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0xAB, 0xCD]).unwrap();

        let entries = replay_all(tmp.path());
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_crc_mismatch_in_complete_frame_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let wal = open_wal(tmp.path());
        wal.append_durable(&add(b"a", b"1", 1)).unwrap();
        wal.append_durable(&add(b"b", b"2", 2)).unwrap();
        drop(wal);

        // Flip one payload byte of the FIRST frame (not the tail).
        let path = segment_path(tmp.path(), "wal", 1);
        let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(6)).unwrap();
        file.write_all(&[0xFF]).unwrap();
        file.sync_all().unwrap();

        let (entries, error) = replay_until_error(tmp.path());
        assert!(entries.is_empty());
        assert!(matches!(error, Some(WalError::Corrupt { .. })));
    }

    #[test]
    fn test_garbage_length_prefix_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        let wal = open_wal(tmp.path());
        wal.append_durable(&add(b"a", b"1", 1)).unwrap();
        drop(wal);

        // Overwrite the length prefix with an impossible value.
        let path = segment_path(tmp.path(), "wal", 1);
        let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.write_all(&u32::MAX.to_le_bytes()).unwrap();
        file.sync_all().unwrap();

        let (entries, error) = replay_until_error(tmp.path());
        assert!(entries.is_empty());
        assert!(matches!(
            error,
            Some(WalError::Corrupt {
                reason: "frame length out of range",
                ..
            })
        ));
    }

    #[test]
    fn test_zero_filled_tail_treated_as_clean_end() {
        let tmp = TempDir::new().unwrap();
        let wal = open_wal(tmp.path());
        wal.append_durable(&add(b"a", b"1", 1)).unwrap();
        drop(wal);

        let path = segment_path(tmp.path(), "wal", 1);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0u8; 64]).unwrap();

        let entries = replay_all(tmp.path());
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_reopen_after_torn_tail_keeps_new_writes_reachable() {
        let tmp = TempDir::new().unwrap();
        {
            let wal = open_wal(tmp.path());
            wal.append_durable(&add(b"before", b"1", 1)).unwrap();
            wal.append_durable(&add(b"torn", b"2", 2)).unwrap();
        }

        // Tear the last frame.
        let path = segment_path(tmp.path(), "wal", 1);
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        let len = file.metadata().unwrap().len();
        file.set_len(len - 5).unwrap();

        // Reopen and append: the torn bytes must be trimmed first so
        // the new frame is reachable by replay.
        {
            let wal = open_wal(tmp.path());
            wal.append_durable(&add(b"after", b"3", 3)).unwrap();
        }

        let entries = replay_all(tmp.path());
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].op, add(b"before", b"1", 1));
        assert_eq!(entries[1].op, add(b"after", b"3", 3));
    }

    #[test]
    fn test_replay_idempotent() {
        let tmp = TempDir::new().unwrap();
        let wal = open_wal(tmp.path());
        for i in 0..10u64 {
            wal.append_durable(&add(format!("k{i}").as_bytes(), b"v", i + 1))
                .unwrap();
        }
        drop(wal);

        let first: Vec<_> = replay_all(tmp.path())
            .into_iter()
            .map(|e| format!("{:?}", e.op))
            .collect();
        let second: Vec<_> = replay_all(tmp.path())
            .into_iter()
            .map(|e| format!("{:?}", e.op))
            .collect();
        assert_eq!(first, second, "two replays must observe identical streams");
    }
}
