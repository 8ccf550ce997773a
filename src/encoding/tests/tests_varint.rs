#[cfg(test)]
mod tests {
    use crate::encoding::{EncodingError, decode_varint, encode_varint};

    fn round_trip(value: u64) -> usize {
        let mut buf = Vec::new();
        encode_varint(value, &mut buf);
        let (decoded, consumed) = decode_varint(&buf).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(consumed, buf.len());
        buf.len()
    }

    #[test]
    fn test_varint_widths() {
        assert_eq!(round_trip(0), 1);
        assert_eq!(round_trip(127), 1);
        assert_eq!(round_trip(128), 2);
        assert_eq!(round_trip(16_383), 2);
        assert_eq!(round_trip(16_384), 3);
        assert_eq!(round_trip(u32::MAX as u64), 5);
        assert_eq!(round_trip(u64::MAX), 10);
    }

    #[test]
    fn test_varint_boundary_values() {
        for shift in 0..64 {
            round_trip(1u64 << shift);
            round_trip((1u64 << shift) - 1);
        }
    }

    #[test]
    fn test_truncated_varint_rejected() {
        // Continuation bit set but no following byte.
        let err = decode_varint(&[0x80]).unwrap_err();
        assert!(matches!(err, EncodingError::InvalidVarint));
    }

    #[test]
    fn test_overlong_varint_rejected() {
        // Eleven continuation bytes can never be a valid u64.
        let bytes = [0xFFu8; 11];
        let err = decode_varint(&bytes).unwrap_err();
        assert!(matches!(err, EncodingError::InvalidVarint));
    }

    #[test]
    fn test_tenth_byte_overflow_rejected() {
        // 9 continuation bytes + a tenth byte carrying more than 1 bit
        // would overflow 64 bits.
        let mut bytes = [0x80u8; 10];
        bytes[9] = 0x02;
        let err = decode_varint(&bytes).unwrap_err();
        assert!(matches!(err, EncodingError::InvalidVarint));
    }
}
