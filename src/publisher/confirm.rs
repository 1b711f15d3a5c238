use std::sync::Arc;
use std::time::Duration;

use super::{DeliveryFailureHandler, Publisher, PublisherOptions};
use crate::broker::BrokerConnection;
use crate::bus::BusContext;
use crate::contract::DataContract;
use crate::error::Result;
use crate::message::BusMessage;
use crate::sender::Destination;

/// Publisher with broker publisher-confirms enabled.
pub struct ConfirmPublisher {
    inner: Publisher,
}

impl ConfirmPublisher {
    pub async fn open(
        connection: Arc<dyn BrokerConnection>,
        context: &BusContext,
        options: PublisherOptions,
        failures: Arc<dyn DeliveryFailureHandler>,
    ) -> Result<Self> {
        let inner = Publisher::open(connection, context, options, failures).await?;
        inner.channel().confirm_select().await?;
        Ok(Self { inner })
    }

    pub fn options(&self) -> &PublisherOptions {
        self.inner.options()
    }

    pub async fn publish<T: DataContract>(&self, message: BusMessage<T>) -> Result<()> {
        self.inner.publish(message).await
    }

    pub async fn publish_to<T: DataContract>(
        &self,
        message: BusMessage<T>,
        destination: &Destination,
    ) -> Result<()> {
        self.inner.publish_to(message, destination).await
    }

    pub async fn publish_blob(&self, message: BusMessage<Vec<u8>>) -> Result<()> {
        self.inner.publish_blob(message).await
    }

    /// Wait until the broker has confirmed every publish so far. Returns
    /// `false` if any was nacked; times out with [`BusError::Timeout`].
    ///
    /// [`BusError::Timeout`]: crate::error::BusError::Timeout
    pub async fn wait_for_confirms(&self, timeout: Duration) -> Result<bool> {
        self.inner.channel().wait_for_confirms(timeout).await
    }

    pub async fn is_blocked(&self) -> bool {
        self.inner.is_blocked().await
    }

    pub async fn close(self) -> Result<()> {
        self.inner.close().await
    }
}
