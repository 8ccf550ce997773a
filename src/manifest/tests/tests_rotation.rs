#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::manifest::{MANIFEST_FILENAME, Manifest, ManifestEvent};

    fn seal(file: &str, level: u32, entries: u64) -> ManifestEvent {
        ManifestEvent::SstSeal {
            level,
            file: file.to_string(),
            entries,
            first_key_hex: None,
            last_key_hex: None,
        }
    }

    #[test]
    fn test_rotation_preserves_live_state() {
        let tmp = TempDir::new().unwrap();
        {
            // Tiny rotate threshold: every batch rotates.
            let manifest = Manifest::open(tmp.path(), 256).unwrap();
            for i in 0..50 {
                manifest.append_durable(seal(&format!("t{i:03}.sst"), 0, i)).unwrap();
            }
            manifest
                .append_durable(ManifestEvent::Checkpoint {
                    name: None,
                    stripe: Some(4),
                    last_seq: Some(123),
                })
                .unwrap();
        }

        // Archived generations exist.
        let archived = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                let name = e.file_name();
                let name = name.to_string_lossy();
                name.starts_with("manifest.") && name.as_ref() != MANIFEST_FILENAME
            })
            .count();
        assert!(archived >= 1, "rotation must archive old generations");

        // The fresh manifest alone reconstructs the full live set.
        let manifest = Manifest::open(tmp.path(), 1 << 20).unwrap();
        let state = manifest.state().unwrap();
        assert_eq!(state.live[&0].len(), 50);
        assert_eq!(state.last_checkpoint.last_seq, Some(123));
        // Seal order survives rotation.
        assert_eq!(state.live[&0][0].file, "t000.sst");
        assert_eq!(state.live[&0][49].file, "t049.sst");
    }

    #[test]
    fn test_live_file_shrinks_after_rotation() {
        let tmp = TempDir::new().unwrap();
        {
            let manifest = Manifest::open(tmp.path(), 512).unwrap();
            // Seal and delete repeatedly: the log grows, the state doesn't.
            for i in 0..100 {
                manifest.append_durable(seal(&format!("x{i}.sst"), 0, 1)).unwrap();
                if i > 0 {
                    manifest
                        .append_durable(ManifestEvent::SstDelete {
                            file: format!("x{}.sst", i - 1),
                        })
                        .unwrap();
                }
            }
        }

        let live_len = std::fs::metadata(tmp.path().join(MANIFEST_FILENAME))
            .unwrap()
            .len();
        assert!(
            live_len < 4096,
            "rotation must keep the live manifest near the state size, got {live_len}"
        );

        let manifest = Manifest::open(tmp.path(), 1 << 20).unwrap();
        let state = manifest.state().unwrap();
        assert_eq!(state.live_files().len(), 1);
        assert!(state.is_live("x99.sst"));
    }
}
