//! Formats raw keys and values for log output.

use itertools::Itertools as _;

/// Formats raw byte slices without any decoding.
pub struct Raw;

impl Raw {
    /// Formats raw bytes as escaped ASCII strings.
    pub fn bytes(bytes: &[u8]) -> String {
        let escaped = bytes
            .iter()
            .copied()
            .flat_map(std::ascii::escape_default)
            .collect_vec();
        format!("\"{}\"", String::from_utf8_lossy(&escaped))
    }

    /// Formats a key/value pair, where an empty value means the key is absent.
    pub fn key_value(key: &[u8], value: &[u8]) -> String {
        let fmtvalue = if value.is_empty() {
            "None".to_string()
        } else {
            Self::bytes(value)
        };
        format!("{} = {}", Self::bytes(key), fmtvalue)
    }
}
