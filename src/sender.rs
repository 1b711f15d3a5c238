//! Send path: envelope -> broker metadata + bytes, and the reverse for
//! deliveries and returned messages.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::broker::{BrokerChannel, FieldMap, HeaderValue, MessageProperties, ReturnedMessage};
use crate::contract::{payload_type_id, ContractRegistry, DataContract, DataContractKey};
use crate::error::{BusError, Result};
use crate::message::{
    BusHeader, BusMessage, DeadLetterInfo, MessageData, RawBusMessage, CONTRACT_NAMESPACE_HEADER,
    CONTRACT_NAME_HEADER, DEATH_HEADER,
};
use crate::serializer::{Serializer, SerializerRegistry};

/// Where and how a message is published.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Destination {
    pub exchange: String,
    pub routing_key: String,
    /// Ask the broker to return the message if no queue receives it.
    pub mandatory: bool,
    pub persistent: bool,
    pub priority: Option<u8>,
    pub reply_to: Option<String>,
}

impl Destination {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            ..Default::default()
        }
    }

    /// Straight to a queue through the default exchange.
    pub fn queue(queue: impl Into<String>) -> Self {
        Self::new("", queue)
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }
}

/// Serializes envelopes and publishes them on one channel.
#[derive(Clone)]
pub struct MessageSender {
    channel: Arc<dyn BrokerChannel>,
    bus_id: String,
    contracts: Arc<ContractRegistry>,
    serializer: Arc<dyn Serializer>,
}

impl MessageSender {
    pub fn new(
        channel: Arc<dyn BrokerChannel>,
        bus_id: impl Into<String>,
        contracts: Arc<ContractRegistry>,
        serializer: Arc<dyn Serializer>,
    ) -> Self {
        Self {
            channel,
            bus_id: bus_id.into(),
            contracts,
            serializer,
        }
    }

    pub fn channel(&self) -> &Arc<dyn BrokerChannel> {
        &self.channel
    }

    pub fn bus_id(&self) -> &str {
        &self.bus_id
    }

    pub fn contracts(&self) -> &Arc<ContractRegistry> {
        &self.contracts
    }

    pub fn content_type(&self) -> &str {
        self.serializer.content_type()
    }

    /// Publish a typed message, registering its contract on first use.
    pub async fn send<T: DataContract>(
        &self,
        message: BusMessage<T>,
        destination: &Destination,
    ) -> Result<()> {
        self.contracts.register::<T>()?;
        self.send_raw(message.into_raw(), destination).await
    }

    /// Publish raw bytes under the binary-blob contract.
    pub async fn send_blob(
        &self,
        message: BusMessage<Vec<u8>>,
        destination: &Destination,
    ) -> Result<()> {
        self.send_raw(message.into_raw_blob(), destination).await
    }

    /// Publish an already-erased envelope.
    pub async fn send_raw(&self, message: RawBusMessage, destination: &Destination) -> Result<()> {
        let body = self.encode(&message)?;
        let properties = self.properties(&message, destination);

        debug!(
            exchange = %destination.exchange,
            routing_key = %destination.routing_key,
            contract = %message.contract_key(),
            correlation_id = %message.correlation_id,
            "Publishing message"
        );

        self.channel
            .publish(
                &destination.exchange,
                &destination.routing_key,
                destination.mandatory,
                properties,
                body,
            )
            .await
    }

    fn encode(&self, message: &RawBusMessage) -> Result<Vec<u8>> {
        let key = message.contract_key();
        match &message.data {
            MessageData::Empty => Ok(Vec::new()),
            MessageData::Bytes(bytes) => Ok(bytes.clone()),
            MessageData::Value(payload) => {
                let contract = self
                    .contracts
                    .by_key(&key)
                    .or_else(|| self.contracts.by_type_id(payload_type_id(payload)))
                    .ok_or_else(|| BusError::UnknownContract(key.to_string()))?;
                Ok(self.serializer.serialize(&message.data, &contract)?)
            }
        }
    }

    /// Broker metadata for an envelope: content type, app id, send time,
    /// correlation id, user headers plus the contract headers.
    pub fn properties(&self, message: &RawBusMessage, destination: &Destination) -> MessageProperties {
        let mut headers: FieldMap = message
            .headers
            .iter()
            .map(|h| (h.name.clone(), HeaderValue::from(h.value.as_str())))
            .collect();
        headers.insert(
            CONTRACT_NAME_HEADER.to_string(),
            HeaderValue::from(message.name.as_str()),
        );
        headers.insert(
            CONTRACT_NAMESPACE_HEADER.to_string(),
            HeaderValue::from(message.namespace.as_str()),
        );

        MessageProperties {
            app_id: Some(self.bus_id.clone()),
            timestamp: u64::try_from(Utc::now().timestamp()).ok(),
            content_type: Some(self.serializer.content_type().to_string()),
            reply_to: destination.reply_to.clone(),
            correlation_id: (!message.correlation_id.is_empty())
                .then(|| message.correlation_id.clone()),
            message_id: Some(uuid::Uuid::new_v4().to_string()),
            priority: destination.priority,
            persistent: destination.persistent,
            headers,
        }
    }
}

/// Contract key carried in broker headers. Messages without contract headers
/// are treated as binary blobs.
pub fn contract_key_from_properties(properties: &MessageProperties) -> DataContractKey {
    match (
        properties.header_str(CONTRACT_NAME_HEADER),
        properties.header_str(CONTRACT_NAMESPACE_HEADER),
    ) {
        (Some(name), Some(namespace)) => DataContractKey::new(name, namespace),
        _ => DataContractKey::binary_blob(),
    }
}

/// Best-effort envelope from broker metadata; the body stays undecoded.
pub fn envelope_from_properties(properties: &MessageProperties, body: Vec<u8>) -> RawBusMessage {
    let key = contract_key_from_properties(properties);
    let mut message = RawBusMessage::new(&key, MessageData::Bytes(body));
    message.bus_id = properties.app_id.clone().unwrap_or_default();
    message.correlation_id = properties.correlation_id.clone().unwrap_or_default();
    message.sent = properties
        .timestamp
        .and_then(|secs| i64::try_from(secs).ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now);
    message.headers = properties
        .headers
        .iter()
        .filter(|(name, _)| {
            name.as_str() != CONTRACT_NAME_HEADER && name.as_str() != CONTRACT_NAMESPACE_HEADER
        })
        .filter_map(|(name, value)| value.as_str().map(|v| BusHeader::new(name.as_str(), v)))
        .collect();
    message.dead_letter = dead_letter_info(&properties.headers);
    message
}

/// Parse the most recent `x-death` entry.
pub fn dead_letter_info(headers: &FieldMap) -> Option<DeadLetterInfo> {
    let entry = headers.get(DEATH_HEADER)?.as_array()?.first()?.as_table()?;
    let text = |key: &str| {
        entry
            .get(key)
            .and_then(HeaderValue::as_str)
            .unwrap_or_default()
            .to_string()
    };
    Some(DeadLetterInfo {
        reason: text("reason"),
        queue: text("queue"),
        exchange: text("exchange"),
        count: entry
            .get("count")
            .and_then(HeaderValue::as_i64)
            .unwrap_or(1),
    })
}

/// Rebuild an envelope from a basic.return.
///
/// The payload type comes from the reverse contract map; unknown contracts
/// and undecodable bodies fall back to raw bytes under the binary-blob key.
pub fn envelope_from_return(
    returned: &ReturnedMessage,
    contracts: &ContractRegistry,
    serializers: &SerializerRegistry,
) -> RawBusMessage {
    let mut message = envelope_from_properties(&returned.properties, returned.body.clone());
    let key = message.contract_key();

    let Some(contract) = contracts.by_key(&key) else {
        if !key.is_binary_blob() {
            debug!(contract = %key, "Returned message has an unknown contract");
            let blob = DataContractKey::binary_blob();
            message.name = blob.name().to_string();
            message.namespace = blob.namespace().to_string();
        }
        return message;
    };

    let decoded = serializers
        .resolve(returned.properties.content_type.as_deref())
        .and_then(|s| s.deserialize(&key, &contract, &returned.body));
    match decoded {
        Ok(data) => message.data = data,
        Err(e) => warn!(contract = %key, error = %e, "Failed to decode returned message"),
    }
    message
}
