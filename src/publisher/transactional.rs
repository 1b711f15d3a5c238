use std::sync::Arc;

use tracing::debug;

use super::{DeliveryFailureHandler, Publisher, PublisherOptions};
use crate::broker::BrokerConnection;
use crate::bus::BusContext;
use crate::contract::DataContract;
use crate::error::Result;
use crate::message::BusMessage;
use crate::sender::Destination;

/// Publisher on a transacted channel.
///
/// Publishes are held by the broker until [`commit`](Self::commit) and
/// discarded by [`rollback`](Self::rollback) or by closing without a commit.
pub struct TransactionalPublisher {
    inner: Publisher,
}

impl TransactionalPublisher {
    pub async fn open(
        connection: Arc<dyn BrokerConnection>,
        context: &BusContext,
        options: PublisherOptions,
        failures: Arc<dyn DeliveryFailureHandler>,
    ) -> Result<Self> {
        let inner = Publisher::open(connection, context, options, failures).await?;
        inner.channel().tx_select().await?;
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

    pub async fn commit(&self) -> Result<()> {
        self.inner.channel().tx_commit().await?;
        debug!("Transaction committed");
        Ok(())
    }

    pub async fn rollback(&self) -> Result<()> {
        self.inner.channel().tx_rollback().await?;
        debug!("Transaction rolled back");
        Ok(())
    }

    pub async fn is_blocked(&self) -> bool {
        self.inner.is_blocked().await
    }

    pub async fn close(self) -> Result<()> {
        self.inner.close().await
    }
}
