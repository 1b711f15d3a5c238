//! Explicit topology management.

use std::sync::Arc;

use tracing::info;

use crate::broker::{BrokerChannel, ExchangeKind, FieldMap, QueueOptions};
use crate::contract::DataContract;
use crate::error::Result;
use crate::subscription::Filter;

/// Declares and tears down queues, exchanges and bindings on its own
/// channel.
pub struct RouteManager {
    channel: Arc<dyn BrokerChannel>,
}

impl RouteManager {
    pub fn new(channel: Arc<dyn BrokerChannel>) -> Self {
        Self { channel }
    }

    /// Declare a queue; an empty name lets the broker pick one. Returns the
    /// queue's name.
    pub async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
        arguments: FieldMap,
    ) -> Result<String> {
        let queue = self.channel.declare_queue(name, options, arguments).await?;
        info!(queue = %queue, durable = options.durable, "Declared queue");
        Ok(queue)
    }

    /// Returns the number of messages deleted with the queue.
    pub async fn delete_queue(&self, name: &str) -> Result<u32> {
        let count = self.channel.delete_queue(name).await?;
        info!(queue = %name, messages = count, "Deleted queue");
        Ok(count)
    }

    /// Returns the number of messages purged.
    pub async fn purge_queue(&self, name: &str) -> Result<u32> {
        self.channel.purge_queue(name).await
    }

    pub async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()> {
        self.channel.declare_exchange(name, kind, durable).await?;
        info!(exchange = %name, kind = kind.as_str(), "Declared exchange");
        Ok(())
    }

    pub async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldMap,
    ) -> Result<()> {
        self.channel
            .bind_queue(queue, exchange, routing_key, arguments)
            .await
    }

    pub async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldMap,
    ) -> Result<()> {
        self.channel
            .unbind_queue(queue, exchange, routing_key, arguments)
            .await
    }

    /// Bind `queue` to a headers `exchange` for contract `T` with the given
    /// header filter, the same binding a subscriber makes.
    pub async fn bind_contract<T: DataContract>(
        &self,
        queue: &str,
        exchange: &str,
        filter: Filter,
    ) -> Result<()> {
        let info = filter.into_info(T::contract_key(), true);
        self.channel
            .bind_queue(queue, exchange, "", info.binding_arguments())
            .await
    }

    pub async fn close(self) -> Result<()> {
        self.channel.close().await
    }
}
