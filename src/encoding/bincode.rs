use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serializes a value into the bytes stored under a key.
pub fn serialize<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::Serialization(format!("encode failed: {}", e)))
}

/// Deserializes a stored value. An empty byte string is never passed here:
/// the engine reports it as an absent key.
pub fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::Serialization(format!("decode failed: {}", e)))
}
