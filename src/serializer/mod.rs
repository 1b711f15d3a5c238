//! Serializer contract and the content-type keyed codec table.
//!
//! Codecs only see the serde data model (`serde_json::Value`); the
//! [`ContractType`] of the payload moves typed values in and out of it. This
//! keeps [`Serializer`] object-safe so codecs can be selected by the
//! content-type header at runtime.

mod json;
mod yaml;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::contract::{ContractType, DataContractKey};
use crate::error::{BusError, Result};
use crate::message::MessageData;

pub use json::JsonSerializer;
pub use yaml::YamlSerializer;

/// Errors raised by codecs.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SerializationError {
    #[error("Failed to encode payload: {0}")]
    Encode(String),

    #[error("Failed to decode payload: {0}")]
    Decode(String),

    #[error("Payload is not a {expected}")]
    TypeMismatch { expected: &'static str },

    #[error("Type {0} does not go through a codec")]
    NotSerializable(&'static str),

    #[error("Unsupported content type: {0}")]
    UnsupportedContentType(String),
}

/// Result type for codec operations.
pub type CodecResult<T> = std::result::Result<T, SerializationError>;

/// A pluggable payload codec.
pub trait Serializer: Send + Sync {
    /// MIME type written to / matched against the content-type property.
    fn content_type(&self) -> &str;

    fn encode_value(&self, value: &serde_json::Value) -> CodecResult<Vec<u8>>;

    fn decode_value(&self, bytes: &[u8]) -> CodecResult<serde_json::Value>;

    /// Serialize a message body of the given contract.
    ///
    /// Byte bodies pass through untouched; binary-blob payloads are never
    /// transformed.
    fn serialize(&self, data: &MessageData, contract: &ContractType) -> CodecResult<Vec<u8>> {
        match data {
            MessageData::Empty => Ok(Vec::new()),
            MessageData::Bytes(bytes) => Ok(bytes.clone()),
            MessageData::Value(payload) if contract.is_blob() => payload
                .downcast_ref::<Vec<u8>>()
                .cloned()
                .ok_or(SerializationError::TypeMismatch { expected: "Vec<u8>" }),
            MessageData::Value(payload) => self.encode_value(&contract.to_value(payload)?),
        }
    }

    /// Deserialize `bytes` into `target`.
    fn deserialize(
        &self,
        key: &DataContractKey,
        target: &ContractType,
        bytes: &[u8],
    ) -> CodecResult<MessageData> {
        if key.is_binary_blob() || target.is_blob() {
            return Ok(MessageData::Bytes(bytes.to_vec()));
        }
        if key.is_void() {
            return Ok(MessageData::Empty);
        }
        let value = self.decode_value(bytes)?;
        Ok(MessageData::Value(target.from_value(value)?))
    }
}

/// Normalize a content-type header: drop parameters, lowercase.
fn normalize(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Registered codecs keyed by content type.
pub struct SerializerRegistry {
    serializers: RwLock<HashMap<String, Arc<dyn Serializer>>>,
    default: RwLock<String>,
}

impl SerializerRegistry {
    /// Registry with the JSON (default) and YAML codecs.
    pub fn new() -> Self {
        let registry = Self::empty(JsonSerializer::CONTENT_TYPE);
        registry.register(Arc::new(JsonSerializer));
        registry.register(Arc::new(YamlSerializer));
        registry
    }

    fn empty(default: &str) -> Self {
        Self {
            serializers: RwLock::new(HashMap::new()),
            default: RwLock::new(normalize(default)),
        }
    }

    /// Add or replace the codec for its content type.
    pub fn register(&self, serializer: Arc<dyn Serializer>) {
        let key = normalize(serializer.content_type());
        self.serializers.write().insert(key, serializer);
    }

    /// Codec for a content-type header value.
    pub fn get(&self, content_type: &str) -> Option<Arc<dyn Serializer>> {
        self.serializers.read().get(&normalize(content_type)).cloned()
    }

    /// Codec for an optional content-type header; absent means the default.
    pub fn resolve(&self, content_type: Option<&str>) -> CodecResult<Arc<dyn Serializer>> {
        match content_type {
            Some(ct) if !ct.trim().is_empty() => self
                .get(ct)
                .ok_or_else(|| SerializationError::UnsupportedContentType(ct.to_string())),
            _ => Ok(self.default_serializer()),
        }
    }

    /// The codec used for outgoing messages unless configured otherwise.
    pub fn default_serializer(&self) -> Arc<dyn Serializer> {
        let default = self.default.read().clone();
        self.serializers
            .read()
            .get(&default)
            .cloned()
            .unwrap_or_else(|| Arc::new(JsonSerializer))
    }

    /// Make a registered codec the default.
    pub fn set_default(&self, content_type: &str) -> Result<()> {
        let key = normalize(content_type);
        if !self.serializers.read().contains_key(&key) {
            return Err(BusError::UnsupportedContentType(content_type.to_string()));
        }
        *self.default.write() = key;
        Ok(())
    }

    pub fn content_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.serializers.read().keys().cloned().collect();
        types.sort();
        types
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
