#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::compaction::tests::tests_select::tests::build_range_table;
    use crate::compaction::{CompactionConfig, CompactionTask, run_task};
    use crate::manifest::Manifest;
    use crate::sstable::{SstHandle, SstWriter};

    fn no_oracle(_seq: u64) -> Option<u64> {
        None
    }

    #[test]
    fn test_merge_output_sorted_unique_newest() {
        let tmp = TempDir::new().unwrap();
        let sst_dir = tmp.path().join("sst");
        std::fs::create_dir_all(&sst_dir).unwrap();
        let manifest = Manifest::open(tmp.path().join("manifest"), 1 << 20).unwrap();

        // Two overlapping tables; the second rewrites keys 5..=14 with
        // newer seqs.
        let old = build_range_table(&sst_dir, "old.sst", 0, 9, 1);
        let new = {
            let path = sst_dir.join("new.sst");
            let mut writer = SstWriter::create(&path, 10, 0.01).unwrap();
            for i in 5..15 {
                let key = format!("key:{i:06}");
                writer
                    .add(key.as_bytes(), b"NEW", 100 + i as u64, 0)
                    .unwrap();
            }
            writer.finish().unwrap();
            SstHandle::open(&path).unwrap()
        };
        // Register inputs as live so the manifest protocol validates.
        for (file, entries) in [("old.sst", 10u64), ("new.sst", 10)] {
            manifest
                .append_durable(crate::manifest::ManifestEvent::SstSeal {
                    level: 0,
                    file: file.into(),
                    entries,
                    first_key_hex: None,
                    last_key_hex: None,
                })
                .unwrap();
        }

        let task = CompactionTask {
            level: 0,
            inputs: vec![old, new],
            next_level_inputs: vec![],
            is_bottom: true,
        };
        let outcome = run_task(
            &task,
            &manifest,
            &sst_dir,
            &CompactionConfig::default(),
            &no_oracle,
            0,
        )
        .unwrap();

        let meta = outcome.output.unwrap();
        assert_eq!(meta.entries, 15, "keys 0..15, unique");

        let merged = SstHandle::open(&meta.path).unwrap();
        let records: Vec<_> = merged
            .range_iter(b"", b"")
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        // Sorted, unique.
        for window in records.windows(2) {
            assert!(window[0].key < window[1].key);
        }
        // Rewritten keys carry the newer version.
        let rec = records
            .iter()
            .find(|rec| rec.key == b"key:000007")
            .unwrap();
        assert_eq!(rec.value, b"NEW");
        assert_eq!(rec.seq, 107);
        // Untouched keys keep the old version.
        let rec = records
            .iter()
            .find(|rec| rec.key == b"key:000002")
            .unwrap();
        assert_eq!(rec.value, b"v");
    }

    #[test]
    fn test_manifest_protocol_recorded() {
        let tmp = TempDir::new().unwrap();
        let sst_dir = tmp.path().join("sst");
        std::fs::create_dir_all(&sst_dir).unwrap();
        let manifest_dir = tmp.path().join("manifest");
        {
            let manifest = Manifest::open(&manifest_dir, 1 << 20).unwrap();
            let input = build_range_table(&sst_dir, "in0.sst", 0, 20, 1);
            let input2 = build_range_table(&sst_dir, "in1.sst", 10, 30, 100);
            for file in ["in0.sst", "in1.sst"] {
                manifest
                    .append_durable(crate::manifest::ManifestEvent::SstSeal {
                        level: 0,
                        file: file.into(),
                        entries: 21,
                        first_key_hex: None,
                        last_key_hex: None,
                    })
                    .unwrap();
            }

            let task = CompactionTask {
                level: 0,
                inputs: vec![input, input2],
                next_level_inputs: vec![],
                is_bottom: true,
            };
            run_task(
                &task,
                &manifest,
                &sst_dir,
                &CompactionConfig::default(),
                &no_oracle,
                0,
            )
            .unwrap();
        }

        // Reopen: inputs deleted, output live at L1, nothing pending.
        let manifest = Manifest::open(&manifest_dir, 1 << 20).unwrap();
        let state = manifest.state().unwrap();
        assert!(!state.is_live("in0.sst"));
        assert!(!state.is_live("in1.sst"));
        assert_eq!(state.live[&1].len(), 1);
        assert!(state.live[&1][0].file.starts_with("L1_"));
        assert!(state.pending_compactions.is_empty());
    }
}
