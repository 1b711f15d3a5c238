//! Broker collaborator contract.
//!
//! The engine talks to the broker only through [`BrokerConnection`] and
//! [`BrokerChannel`]. Implementations:
//! - `AmqpConnection`: RabbitMQ via lapin (feature `amqp`)
//! - `MemoryBroker`: in-process broker for tests and local development

mod address;
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::broadcast;

use crate::error::Result;

pub use address::{PublicationAddress, DIRECT_REPLY_QUEUE};
#[cfg(feature = "amqp")]
pub use amqp::{AmqpChannel, AmqpConnection};
pub use memory::MemoryBroker;

/// Header table value.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Str(String),
    Int(i64),
    Bool(bool),
    Bytes(Vec<u8>),
    Timestamp(u64),
    Array(Vec<HeaderValue>),
    Table(FieldMap),
}

/// Header / argument table.
pub type FieldMap = BTreeMap<String, HeaderValue>;

impl HeaderValue {
    /// String view; byte strings are accepted when valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            Self::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Timestamp(t) => i64::try_from(*t).ok(),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&FieldMap> {
        match self {
            Self::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[HeaderValue]> {
        match self {
            Self::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Equality as used by headers-exchange matching: strings compare by
    /// content regardless of string/bytes encoding.
    pub fn matches(&self, other: &HeaderValue) -> bool {
        match (self.as_str(), other.as_str()) {
            (Some(a), Some(b)) => a == b,
            _ => self == other,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for HeaderValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<bool> for HeaderValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Message metadata the engine reads and writes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub app_id: Option<String>,
    /// Seconds since the Unix epoch.
    pub timestamp: Option<u64>,
    pub content_type: Option<String>,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
    pub priority: Option<u8>,
    pub persistent: bool,
    pub headers: FieldMap,
}

impl MessageProperties {
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(HeaderValue::as_str)
    }
}

/// A message pushed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

/// A mandatory message the broker could not route.
#[derive(Debug, Clone)]
pub struct ReturnedMessage {
    pub reply_code: u16,
    pub reply_text: String,
    pub exchange: String,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

/// Asynchronous notifications raised on a channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// basic.return for a mandatory publish.
    Returned(ReturnedMessage),
    /// The channel was closed, by us or by the broker.
    Shutdown(String),
    /// connection.blocked: the broker paused publishing on this channel's
    /// connection, with its reason when one is known.
    Blocked(Option<String>),
    /// connection.unblocked.
    Unblocked,
}

/// Exchange types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
            Self::Topic => "topic",
            Self::Headers => "headers",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(Self::Direct),
            "fanout" => Some(Self::Fanout),
            "topic" => Some(Self::Topic),
            "headers" => Some(Self::Headers),
            _ => None,
        }
    }
}

/// queue.declare flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Exclusive, auto-delete, non-durable: private reply/subscriber queues.
    pub fn private() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }

    pub fn durable() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }
}

/// basic.consume flags.
#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    pub consumer_tag: String,
    pub no_ack: bool,
    pub exclusive: bool,
    pub arguments: FieldMap,
}

/// Stream of deliveries for one consumer. Ends when the consumer is cancelled
/// or the channel closes.
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// A broker connection (or pool of connections).
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a logical channel. Each publisher/subscriber owns one.
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    /// True while the broker has asked publishers to pause (connection.blocked).
    ///
    /// A pool answers for the connection it would hand out next; ask the
    /// channel for the connection a publisher actually uses.
    async fn is_blocked(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

/// A logical broker channel.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> Result<()>;

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<DeliveryStream>;

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<()>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    async fn qos(&self, prefetch_count: u16) -> Result<()>;

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()>;

    /// Declare a queue; an empty name asks the broker to generate one.
    /// Returns the queue's actual name.
    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
        arguments: FieldMap,
    ) -> Result<String>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldMap,
    ) -> Result<()>;

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldMap,
    ) -> Result<()>;

    /// Returns the number of messages deleted with the queue.
    async fn delete_queue(&self, name: &str) -> Result<u32>;

    /// Returns the number of messages purged.
    async fn purge_queue(&self, name: &str) -> Result<u32>;

    async fn tx_select(&self) -> Result<()>;

    async fn tx_commit(&self) -> Result<()>;

    async fn tx_rollback(&self) -> Result<()>;

    async fn confirm_select(&self) -> Result<()>;

    /// Wait until every publish so far is confirmed. `Ok(false)` means at
    /// least one was nacked by the broker.
    async fn wait_for_confirms(&self, timeout: Duration) -> Result<bool>;

    /// Subscribe to returns, blocking and shutdown notifications.
    fn events(&self) -> broadcast::Receiver<ChannelEvent>;

    /// True while the connection carrying this channel is blocked.
    fn is_blocked(&self) -> bool;

    async fn close(&self) -> Result<()>;
}
