//! Wire-neutral message envelopes.
//!
//! [`RawBusMessage`] is what the receive path builds from broker metadata and
//! what the send path turns back into broker metadata. [`BusMessage<T>`] is the
//! typed view handed to application handlers.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::contract::{payload_type_id, DataContract, DataContractKey, Payload};

/// Header carrying the contract name. Headers exchanges ignore `x-` binding
/// keys, so contract headers must not use that prefix.
pub const CONTRACT_NAME_HEADER: &str = "contract-name";
/// Header carrying the contract namespace.
pub const CONTRACT_NAMESPACE_HEADER: &str = "contract-namespace";
/// Marks a reply whose handler rejected the request.
pub const REJECTED_HEADER: &str = "x-rejected";
/// Carries the failure text of a handler that errored.
pub const EXCEPTION_HEADER: &str = "x-exception";
/// Broker dead-letter metadata.
pub const DEATH_HEADER: &str = "x-death";

/// Name/value header pair. Order is irrelevant for matching.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BusHeader {
    pub name: String,
    pub value: String,
}

impl BusHeader {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Message body, before or after contract resolution.
#[derive(Clone, Default)]
pub enum MessageData {
    /// No content (void replies).
    #[default]
    Empty,
    /// Raw bytes: either a binary-blob payload or a body not yet resolved.
    Bytes(Vec<u8>),
    /// Deserialized payload.
    Value(Payload),
}

impl MessageData {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Bytes(b) => b.is_empty(),
            Self::Value(_) => false,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        match self {
            Self::Value(p) => p.downcast_ref::<T>(),
            _ => None,
        }
    }
}

impl fmt::Debug for MessageData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Self::Value(p) => write!(f, "Value({:?})", payload_type_id(p)),
        }
    }
}

/// Parsed `x-death` metadata of a dead-lettered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterInfo {
    pub reason: String,
    pub queue: String,
    pub exchange: String,
    pub count: i64,
}

/// Broker-agnostic message envelope. Lives for one dispatch cycle.
#[derive(Debug, Clone)]
pub struct RawBusMessage {
    pub data: MessageData,
    pub name: String,
    pub namespace: String,
    /// Originating bus instance.
    pub bus_id: String,
    pub correlation_id: String,
    pub sent: DateTime<Utc>,
    pub headers: Vec<BusHeader>,
    /// Present when the broker dead-lettered this message.
    pub dead_letter: Option<DeadLetterInfo>,
}

impl RawBusMessage {
    pub fn new(key: &DataContractKey, data: MessageData) -> Self {
        Self {
            data,
            name: key.name().to_string(),
            namespace: key.namespace().to_string(),
            bus_id: String::new(),
            correlation_id: String::new(),
            sent: Utc::now(),
            headers: Vec::new(),
            dead_letter: None,
        }
    }

    /// A "no content" message.
    pub fn void() -> Self {
        Self::new(&DataContractKey::void(), MessageData::Empty)
    }

    /// A raw byte payload with no contract.
    pub fn blob(bytes: Vec<u8>) -> Self {
        Self::new(&DataContractKey::binary_blob(), MessageData::Bytes(bytes))
    }

    pub fn contract_key(&self) -> DataContractKey {
        DataContractKey::new(self.name.as_str(), self.namespace.as_str())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name == name)
            .map(|h| h.value.as_str())
    }

    /// Replace any header with the same name.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.headers.retain(|h| h.name != name);
        self.headers.push(BusHeader::new(name, value));
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn is_rejected(&self) -> bool {
        self.header(REJECTED_HEADER).is_some()
    }

    /// Failure text of a handler that errored, if this is an error reply.
    pub fn exception(&self) -> Option<&str> {
        self.header(EXCEPTION_HEADER)
    }
}

/// Typed view of a [`RawBusMessage`].
#[derive(Debug, Clone)]
pub struct BusMessage<T> {
    pub data: T,
    pub bus_id: String,
    pub correlation_id: String,
    pub sent: DateTime<Utc>,
    pub headers: Vec<BusHeader>,
    pub dead_letter: Option<DeadLetterInfo>,
}

impl<T> BusMessage<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            bus_id: String::new(),
            correlation_id: String::new(),
            sent: Utc::now(),
            headers: Vec::new(),
            dead_letter: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(BusHeader::new(name, value));
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name == name)
            .map(|h| h.value.as_str())
    }

    /// Same envelope, different payload.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> BusMessage<U> {
        BusMessage {
            data: f(self.data),
            bus_id: self.bus_id,
            correlation_id: self.correlation_id,
            sent: self.sent,
            headers: self.headers,
            dead_letter: self.dead_letter,
        }
    }

    /// Wrap the envelope around an already-erased payload.
    pub(crate) fn with_raw_envelope(data: T, raw: &RawBusMessage) -> Self {
        Self {
            data,
            bus_id: raw.bus_id.clone(),
            correlation_id: raw.correlation_id.clone(),
            sent: raw.sent,
            headers: raw.headers.clone(),
            dead_letter: raw.dead_letter.clone(),
        }
    }
}

impl<T: DataContract> BusMessage<T> {
    /// Erase into a raw envelope keyed by `T`'s contract.
    pub fn into_raw(self) -> RawBusMessage {
        let key = T::contract_key();
        RawBusMessage {
            data: MessageData::Value(Arc::new(self.data)),
            name: key.name().to_string(),
            namespace: key.namespace().to_string(),
            bus_id: self.bus_id,
            correlation_id: self.correlation_id,
            sent: self.sent,
            headers: self.headers,
            dead_letter: self.dead_letter,
        }
    }

    /// Typed view of `raw`, if its payload is a `T`.
    pub fn from_raw(raw: RawBusMessage) -> Option<Self> {
        let data = match &raw.data {
            MessageData::Value(payload) => payload.downcast_ref::<T>()?.clone(),
            _ => return None,
        };
        Some(Self::with_raw_envelope(data, &raw))
    }
}

impl BusMessage<Vec<u8>> {
    /// Erase a byte payload into a binary-blob envelope.
    pub fn into_raw_blob(self) -> RawBusMessage {
        let mut raw = RawBusMessage::blob(self.data);
        raw.bus_id = self.bus_id;
        raw.correlation_id = self.correlation_id;
        raw.sent = self.sent;
        raw.headers = self.headers;
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Greeting {
        text: String,
    }

    impl DataContract for Greeting {
        const NAME: &'static str = "Greeting";
    }

    #[test]
    fn test_typed_raw_typed() {
        let msg = BusMessage::new(Greeting {
            text: "hi".into(),
        })
        .with_header("tenant", "acme")
        .with_correlation_id("c-1");

        let raw = msg.into_raw();
        assert_eq!(raw.contract_key(), Greeting::contract_key());
        assert_eq!(raw.header("tenant"), Some("acme"));

        let back = BusMessage::<Greeting>::from_raw(raw).unwrap();
        assert_eq!(back.data.text, "hi");
        assert_eq!(back.correlation_id, "c-1");
    }

    #[test]
    fn test_from_raw_wrong_type() {
        let raw = RawBusMessage::blob(vec![1, 2, 3]);
        assert!(BusMessage::<Greeting>::from_raw(raw).is_none());
    }

    #[test]
    fn test_set_header_replaces() {
        let mut raw = RawBusMessage::void();
        raw.set_header("a", "1");
        raw.set_header("a", "2");
        assert_eq!(raw.headers.len(), 1);
        assert_eq!(raw.header("a"), Some("2"));
    }

    #[test]
    fn test_reply_markers() {
        let mut raw = RawBusMessage::void();
        assert!(!raw.is_rejected());
        assert!(raw.exception().is_none());

        raw.set_header(REJECTED_HEADER, "true");
        raw.set_header(EXCEPTION_HEADER, "boom");
        assert!(raw.is_rejected());
        assert_eq!(raw.exception(), Some("boom"));
    }

    #[test]
    fn test_message_data_emptiness() {
        assert!(MessageData::Empty.is_empty());
        assert!(MessageData::Bytes(vec![]).is_empty());
        assert!(!MessageData::Bytes(vec![0]).is_empty());
        assert!(!MessageData::Value(Arc::new(1u8)).is_empty());
    }
}
