//! Centralized hex-ASCII <-> byte-string conversion for injection rules.
//!
//! Rejects malformed hex at config-load time (odd length, non-hex digits)
//! rather than at match time, so a broken rule fails fast with a clear
//! error instead of silently mismatching or truncating during a transfer.

use crate::error::ProxyError;

pub fn decode(field: &str, hex_str: &str) -> Result<Vec<u8>, ProxyError> {
    hex::decode(hex_str).map_err(|e| ProxyError::InvalidConfig {
        field: field.to_string(),
        reason: format!("invalid hex string {hex_str:?}: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_even_length_hex() {
        assert_eq!(decode("replacement", "41").unwrap(), vec![0x41]);
        assert_eq!(decode("replacement", "4142").unwrap(), vec![0x41, 0x42]);
    }

    #[test]
    fn rejects_odd_length() {
        assert!(decode("content_pattern[0]", "414").is_err());
    }

    #[test]
    fn rejects_non_hex_characters() {
        assert!(decode("content_pattern[0]", "zz").is_err());
    }
}
