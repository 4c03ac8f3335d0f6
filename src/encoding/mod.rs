//! Value and key encodings used outside the byte-level engine: bincode for
//! the typed transaction accessors and raw-byte formatting for log output.

pub mod bincode;
pub mod format;
