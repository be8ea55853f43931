//! Payload encoding boundary. Entity rows store an opaque `payload` column;
//! swapping the marshaler changes the on-disk encoding without touching the
//! key codec.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Result;

pub trait PayloadMarshaler: Send + Sync {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

/// Default marshaler: compact JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonMarshaler;

impl PayloadMarshaler for JsonMarshaler {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
