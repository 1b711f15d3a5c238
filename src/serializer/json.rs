//! Default JSON codec.

use super::{CodecResult, SerializationError, Serializer};

/// `application/json` codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub const CONTENT_TYPE: &'static str = "application/json";
}

impl Serializer for JsonSerializer {
    fn content_type(&self) -> &str {
        Self::CONTENT_TYPE
    }

    fn encode_value(&self, value: &serde_json::Value) -> CodecResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| SerializationError::Encode(e.to_string()))
    }

    fn decode_value(&self, bytes: &[u8]) -> CodecResult<serde_json::Value> {
        serde_json::from_slice(bytes).map_err(|e| SerializationError::Decode(e.to_string()))
    }
}
