#[cfg(test)]
mod tests {
    use crate::stripe::parity::{ParityError, ParityKind};

    fn lanes(k: usize, len: usize) -> Vec<Vec<u8>> {
        (0..k)
            .map(|lane| {
                (0..len)
                    .map(|i| (lane as u8).wrapping_mul(37).wrapping_add(i as u8))
                    .collect()
            })
            .collect()
    }

    fn refs(lanes: &[Vec<u8>]) -> Vec<&[u8]> {
        lanes.iter().map(|l| l.as_slice()).collect()
    }

    fn encode(kind: ParityKind, data: &[Vec<u8>]) -> Vec<Vec<u8>> {
        let coder = kind.coder(data.len());
        let mut parity = vec![Vec::new(); coder.parity_lanes()];
        coder.encode_into(&refs(data), &mut parity).unwrap();
        parity
    }

    #[test]
    fn test_xor_parity_is_plain_xor() {
        let data = lanes(4, 256);
        let parity = encode(ParityKind::Xor, &data);
        assert_eq!(parity.len(), 1);

        let mut expected = vec![0u8; 256];
        for lane in &data {
            for (e, b) in expected.iter_mut().zip(lane) {
                *e ^= b;
            }
        }
        assert_eq!(parity[0], expected);
    }

    #[test]
    fn test_rs_m1_identical_to_xor() {
        let data = lanes(4, 512);
        assert_eq!(
            encode(ParityKind::Xor, &data),
            encode(ParityKind::Rs(1), &data)
        );
    }

    #[test]
    fn test_dual_xor_first_lane_is_xor() {
        let data = lanes(5, 128);
        let dual = encode(ParityKind::DualXor, &data);
        let xor = encode(ParityKind::Xor, &data);
        assert_eq!(dual.len(), 2);
        assert_eq!(dual[0], xor[0]);
        assert_ne!(dual[1], dual[0], "second lane must be an independent equation");
    }

    #[test]
    fn test_verify_accepts_good_rejects_bad() {
        let data = lanes(4, 64);
        let coder = ParityKind::DualXor.coder(4);
        let mut parity = vec![Vec::new(); 2];
        coder.encode_into(&refs(&data), &mut parity).unwrap();

        let parity_refs: Vec<&[u8]> = parity.iter().map(|p| p.as_slice()).collect();
        assert!(coder.verify(&refs(&data), &parity_refs).unwrap());

        let mut bad = parity.clone();
        bad[1][10] ^= 0x55;
        let bad_refs: Vec<&[u8]> = bad.iter().map(|p| p.as_slice()).collect();
        assert!(!coder.verify(&refs(&data), &bad_refs).unwrap());
    }

    fn reconstruct_case(kind: ParityKind, k: usize, lost_data: &[usize], lost_parity: &[usize]) {
        let original = lanes(k, 300);
        let coder = kind.coder(k);
        let mut parity = vec![Vec::new(); coder.parity_lanes()];
        coder.encode_into(&refs(&original), &mut parity).unwrap();

        let mut data_opt: Vec<Option<Vec<u8>>> = original.iter().cloned().map(Some).collect();
        let mut parity_opt: Vec<Option<Vec<u8>>> = parity.iter().cloned().map(Some).collect();
        for &i in lost_data {
            data_opt[i] = None;
        }
        for &j in lost_parity {
            parity_opt[j] = None;
        }

        let rebuilt = coder
            .reconstruct(&mut data_opt, &mut parity_opt, 300)
            .unwrap();
        assert_eq!(rebuilt, lost_data.len() + lost_parity.len());

        // Every data lane must be bit-identical to the original.
        for (i, lane) in data_opt.iter().enumerate() {
            assert_eq!(lane.as_ref().unwrap(), &original[i], "data lane {i}");
        }
        // Rebuilt parity lanes must match a fresh encode.
        for (j, lane) in parity_opt.iter().enumerate() {
            assert_eq!(lane.as_ref().unwrap(), &parity[j], "parity lane {j}");
        }
    }

    #[test]
    fn test_xor_recovers_one_data_lane() {
        reconstruct_case(ParityKind::Xor, 4, &[2], &[]);
    }

    #[test]
    fn test_xor_recovers_parity_lane() {
        reconstruct_case(ParityKind::Xor, 4, &[], &[0]);
    }

    #[test]
    fn test_dual_xor_recovers_two_data_lanes() {
        reconstruct_case(ParityKind::DualXor, 4, &[0, 3], &[]);
        reconstruct_case(ParityKind::DualXor, 5, &[1, 2], &[]);
    }

    #[test]
    fn test_dual_xor_recovers_mixed_loss() {
        reconstruct_case(ParityKind::DualXor, 4, &[2], &[0]);
        reconstruct_case(ParityKind::DualXor, 4, &[], &[0, 1]);
    }

    #[test]
    fn test_rs3_recovers_three_lanes() {
        reconstruct_case(ParityKind::Rs(3), 6, &[0, 2, 5], &[]);
        reconstruct_case(ParityKind::Rs(3), 6, &[1, 4], &[2]);
    }

    #[test]
    fn test_erasures_beyond_m_rejected() {
        let original = lanes(4, 100);
        let coder = ParityKind::Xor.coder(4);
        let mut parity = vec![Vec::new(); 1];
        coder.encode_into(&refs(&original), &mut parity).unwrap();

        let mut data_opt: Vec<Option<Vec<u8>>> = original.into_iter().map(Some).collect();
        let mut parity_opt: Vec<Option<Vec<u8>>> = parity.into_iter().map(Some).collect();
        data_opt[0] = None;
        data_opt[1] = None;

        let err = coder
            .reconstruct(&mut data_opt, &mut parity_opt, 100)
            .unwrap_err();
        assert!(matches!(
            err,
            ParityError::TooManyErasures {
                erasures: 2,
                parity_lanes: 1
            }
        ));
    }

    #[test]
    fn test_no_erasures_is_noop() {
        let original = lanes(3, 50);
        let coder = ParityKind::Xor.coder(3);
        let mut parity = vec![Vec::new(); 1];
        coder.encode_into(&refs(&original), &mut parity).unwrap();

        let mut data_opt: Vec<Option<Vec<u8>>> = original.into_iter().map(Some).collect();
        let mut parity_opt: Vec<Option<Vec<u8>>> = parity.into_iter().map(Some).collect();
        assert_eq!(
            coder.reconstruct(&mut data_opt, &mut parity_opt, 50).unwrap(),
            0
        );
    }

    #[test]
    fn test_parity_lane_counts() {
        assert_eq!(ParityKind::None.parity_lanes(), 0);
        assert_eq!(ParityKind::Xor.parity_lanes(), 1);
        assert_eq!(ParityKind::DualXor.parity_lanes(), 2);
        assert_eq!(ParityKind::Rs(4).parity_lanes(), 4);
    }
}
