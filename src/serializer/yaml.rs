//! YAML codec.

use super::{CodecResult, SerializationError, Serializer};

/// `application/x-yaml` codec backed by `serde_yaml`.
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlSerializer;

impl YamlSerializer {
    pub const CONTENT_TYPE: &'static str = "application/x-yaml";
}

impl Serializer for YamlSerializer {
    fn content_type(&self) -> &str {
        Self::CONTENT_TYPE
    }

    fn encode_value(&self, value: &serde_json::Value) -> CodecResult<Vec<u8>> {
        serde_yaml::to_string(value)
            .map(String::into_bytes)
            .map_err(|e| SerializationError::Encode(e.to_string()))
    }

    fn decode_value(&self, bytes: &[u8]) -> CodecResult<serde_json::Value> {
        serde_yaml::from_slice(bytes).map_err(|e| SerializationError::Decode(e.to_string()))
    }
}
