#[cfg(test)]
mod tests {
    use crate::encoding::{self, Decode, EncodingError, MAX_BYTE_LEN, MAX_VEC_ELEMENTS};

    #[test]
    fn test_byte_len_limit_rejected() {
        // Forge a length prefix just past the limit with no payload.
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_BYTE_LEN + 1).to_le_bytes());

        let err = Vec::<u8>::decode_from(&buf).unwrap_err();
        assert!(matches!(err, EncodingError::LengthOverflow(_)));
    }

    #[test]
    fn test_vec_element_limit_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_VEC_ELEMENTS + 1).to_le_bytes());

        let err = encoding::decode_vec::<u64>(&buf).unwrap_err();
        assert!(matches!(err, EncodingError::LengthOverflow(_)));
    }

    #[test]
    fn test_length_within_limit_but_truncated_payload() {
        // A plausible length with a short payload must report EOF, not panic.
        let mut buf = Vec::new();
        buf.extend_from_slice(&64u32.to_le_bytes());
        buf.extend_from_slice(b"short");

        let err = Vec::<u8>::decode_from(&buf).unwrap_err();
        assert!(matches!(err, EncodingError::UnexpectedEof { .. }));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&2u32.to_le_bytes());
        buf.extend_from_slice(&[0xFF, 0xFE]);

        let err = String::decode_from(&buf).unwrap_err();
        assert!(matches!(err, EncodingError::InvalidUtf8(_)));
    }
}
