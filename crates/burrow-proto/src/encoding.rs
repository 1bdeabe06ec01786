//! Body encoding: standard base64, produced over bounded input windows.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Encoder input window. 8 KiB rounded down to a multiple of three so
/// each window encodes to whole base64 quads and the window outputs
/// concatenate into one valid, padding-free-until-the-end string.
const WINDOW: usize = 8 * 1024 - (8 * 1024 % 3);

/// Base64-encode `bytes` one window at a time, so a large body never
/// materializes a second full-size intermediate buffer.
pub fn encode_chunked(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len().div_ceil(3) * 4);
    for window in bytes.chunks(WINDOW) {
        STANDARD.encode_string(window, &mut out);
    }
    out
}

/// Decode a base64 body produced by [`encode_chunked`] or any standard
/// encoder.
pub fn decode(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn window_is_a_multiple_of_three() {
        assert_eq!(WINDOW % 3, 0);
    }

    #[test]
    fn empty_input_encodes_to_empty_string() {
        assert_eq!(encode_chunked(&[]), "");
        assert_eq!(decode("").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn window_boundary_sizes_round_trip() {
        for size in [
            WINDOW - 1,
            WINDOW,
            WINDOW + 1,
            2 * WINDOW,
            2 * WINDOW + 17,
        ] {
            let bytes: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let encoded = encode_chunked(&bytes);
            assert!(!encoded.contains('\n'));
            assert!(!encoded.contains(' '));
            assert_eq!(decode(&encoded).unwrap(), bytes, "size {size}");
        }
    }

    proptest! {
        #[test]
        fn round_trips_arbitrary_bytes(bytes in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let encoded = encode_chunked(&bytes);
            prop_assert!(encoded.chars().all(|c| !c.is_whitespace()));
            prop_assert_eq!(decode(&encoded).unwrap(), bytes);
        }
    }
}
