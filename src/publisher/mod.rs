//! Publisher variants.
//!
//! - [`Publisher`]: plain publishing; broker returns go to a
//!   [`DeliveryFailureHandler`]
//! - [`TransactionalPublisher`]: publishes buffered until commit
//! - [`ConfirmPublisher`]: broker acknowledgements via `wait_for_confirms`
//!
//! The RPC publisher lives in [`crate::rpc`].

mod confirm;
mod transactional;

use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::{BrokerChannel, BrokerConnection, ChannelEvent};
use crate::bus::BusContext;
use crate::contract::DataContract;
use crate::error::Result;
use crate::message::{BusMessage, RawBusMessage};
use crate::sender::{envelope_from_return, Destination, MessageSender};

pub use confirm::ConfirmPublisher;
pub use transactional::TransactionalPublisher;

/// Receives mandatory messages the broker could not route.
pub trait DeliveryFailureHandler: Send + Sync {
    fn delivery_failed(&self, reply_code: u16, reply_text: &str, message: &RawBusMessage);
}

/// Logs every returned message.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDeliveryFailureHandler;

impl DeliveryFailureHandler for TracingDeliveryFailureHandler {
    fn delivery_failed(&self, reply_code: u16, reply_text: &str, message: &RawBusMessage) {
        warn!(
            reply_code,
            reply_text = %reply_text,
            contract = %message.contract_key(),
            correlation_id = %message.correlation_id,
            "Message returned by broker"
        );
    }
}

/// Default destination and delivery flags for a publisher.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublisherOptions {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub persistent: bool,
    pub priority: Option<u8>,
}

impl Default for PublisherOptions {
    fn default() -> Self {
        Self {
            exchange: crate::subscriber::DEFAULT_EXCHANGE.to_string(),
            routing_key: String::new(),
            mandatory: false,
            persistent: false,
            priority: None,
        }
    }
}

impl PublisherOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    pub fn mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = mandatory;
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Destination every publish uses unless given another.
    pub fn destination(&self) -> Destination {
        Destination {
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            mandatory: self.mandatory,
            persistent: self.persistent,
            priority: self.priority,
            reply_to: None,
        }
    }
}

/// Forward returned messages on `channel` to `handler` until the channel
/// shuts down.
fn spawn_return_listener(
    channel: &dyn BrokerChannel,
    context: &BusContext,
    handler: Arc<dyn DeliveryFailureHandler>,
) -> JoinHandle<()> {
    let mut events = channel.events();
    let contracts = Arc::clone(&context.contracts);
    let serializers = Arc::clone(&context.serializers);
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ChannelEvent::Returned(returned)) => {
                    let message = envelope_from_return(&returned, &contracts, &serializers);
                    handler.delivery_failed(returned.reply_code, &returned.reply_text, &message);
                }
                Ok(ChannelEvent::Shutdown(reason)) => {
                    debug!(reason = %reason, "Publisher channel shut down");
                    break;
                }
                Ok(ChannelEvent::Blocked(reason)) => {
                    let reason = reason.as_deref().unwrap_or("unknown");
                    warn!(reason, "Broker blocked publishing");
                }
                Ok(ChannelEvent::Unblocked) => info!("Broker unblocked publishing"),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Return listener lagged; returns were dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Plain publisher on its own channel.
pub struct Publisher {
    sender: MessageSender,
    options: PublisherOptions,
    return_listener: JoinHandle<()>,
}

impl Publisher {
    pub async fn open(
        connection: Arc<dyn BrokerConnection>,
        context: &BusContext,
        options: PublisherOptions,
        failures: Arc<dyn DeliveryFailureHandler>,
    ) -> Result<Self> {
        let channel = connection.open_channel().await?;
        let return_listener = spawn_return_listener(channel.as_ref(), context, failures);
        let sender = MessageSender::new(
            channel,
            context.bus_id.as_str(),
            Arc::clone(&context.contracts),
            context.serializers.default_serializer(),
        );
        debug!(exchange = %options.exchange, "Publisher opened");
        Ok(Self {
            sender,
            options,
            return_listener,
        })
    }

    pub fn options(&self) -> &PublisherOptions {
        &self.options
    }

    pub fn sender(&self) -> &MessageSender {
        &self.sender
    }

    pub(crate) fn channel(&self) -> &Arc<dyn BrokerChannel> {
        self.sender.channel()
    }

    /// Publish to the default destination.
    pub async fn publish<T: DataContract>(&self, message: BusMessage<T>) -> Result<()> {
        self.sender.send(message, &self.options.destination()).await
    }

    pub async fn publish_to<T: DataContract>(
        &self,
        message: BusMessage<T>,
        destination: &Destination,
    ) -> Result<()> {
        self.sender.send(message, destination).await
    }

    /// Publish raw bytes to the default destination.
    pub async fn publish_blob(&self, message: BusMessage<Vec<u8>>) -> Result<()> {
        self.sender
            .send_blob(message, &self.options.destination())
            .await
    }

    /// True while the broker has paused publishers.
    pub async fn is_blocked(&self) -> bool {
        self.sender.channel().is_blocked()
    }

    /// Release the channel. While the connection is blocked the channel is
    /// left for the broker to release.
    pub async fn close(self) -> Result<()> {
        self.return_listener.abort();
        if self.sender.channel().is_blocked() {
            info!("Connection blocked; leaving publisher channel open");
            return Ok(());
        }
        self.sender.channel().close().await
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.return_listener.abort();
    }
}

#[cfg(test)]
mod tests;
