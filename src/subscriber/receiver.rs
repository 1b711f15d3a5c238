//! Pull-mode consumption.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{declare_consumer_queue, SubscriberOptions};
use crate::broker::{BrokerChannel, ConsumeOptions, Delivery};
use crate::bus::BusContext;
use crate::contract::DataContract;
use crate::dispatch::decode_delivery;
use crate::error::{BusError, Result};
use crate::message::BusMessage;
use crate::sender::envelope_from_properties;
use crate::subscription::Filter;

/// Pulls messages of a requested contract from one queue.
///
/// A push consumer feeds a bounded buffer; [`Receiver::receive`] waits on
/// that buffer, so no time is spent polling the broker.
pub struct Receiver {
    channel: Arc<dyn BrokerChannel>,
    queue: String,
    options: SubscriberOptions,
    context: BusContext,
    buffer: Mutex<mpsc::Receiver<Delivery>>,
    consumer_tag: String,
    feeder: JoinHandle<()>,
}

impl Receiver {
    /// Declare the queue and start buffering deliveries.
    pub async fn open(
        channel: Arc<dyn BrokerChannel>,
        context: BusContext,
        options: SubscriberOptions,
    ) -> Result<Self> {
        let queue = declare_consumer_queue(channel.as_ref(), &options).await?;
        let consumer_tag = format!("courier-receiver-{}", uuid::Uuid::new_v4());
        let mut deliveries = channel
            .consume(
                &queue,
                ConsumeOptions {
                    consumer_tag: consumer_tag.clone(),
                    no_ack: true,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        let (tx, rx) = mpsc::channel(usize::from(options.prefetch.max(1)));
        let feeder = tokio::spawn(async move {
            while let Some(delivery) = deliveries.next().await {
                if tx.send(delivery).await.is_err() {
                    break;
                }
            }
        });

        info!(queue = %queue, "Receiver opened");
        Ok(Self {
            channel,
            queue,
            options,
            context,
            buffer: Mutex::new(rx),
            consumer_tag,
            feeder,
        })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Bind the queue so messages of `T` matching `filter` reach it.
    pub async fn bind<T: DataContract>(&self, filter: Filter) -> Result<()> {
        let contract = self.context.contracts.register::<T>()?;
        let info = filter.into_info(contract.key().clone(), self.options.receive_self_publish);
        self.channel
            .bind_queue(&self.queue, &self.options.exchange, "", info.binding_arguments())
            .await
    }

    /// Next message of contract `T`, waiting at most `timeout`.
    ///
    /// Messages of other contracts are reported as unregistered and
    /// discarded; own publications are skipped unless the receiver accepts
    /// self-publish. Returns `Ok(None)` on timeout.
    pub async fn receive<T: DataContract>(&self, timeout: Duration) -> Result<Option<BusMessage<T>>> {
        let contract = self.context.contracts.register::<T>()?;
        let deadline = tokio::time::Instant::now() + timeout;
        let mut buffer = self.buffer.lock().await;
        let errors = &self.context.errors;

        loop {
            let delivery = match tokio::time::timeout_at(deadline, buffer.recv()).await {
                Err(_) => return Ok(None),
                Ok(None) => return Err(BusError::Closed),
                Ok(Some(delivery)) => delivery,
            };

            let mut envelope = envelope_from_properties(&delivery.properties, delivery.body.clone());
            if envelope.contract_key() != *contract.key() {
                errors.unregistered_message_arrived(&envelope);
                continue;
            }

            match decode_delivery(&self.context.serializers, &contract, &delivery) {
                Ok(data) => envelope.data = data,
                Err(e) => {
                    errors.message_deserialize_failed(&envelope, &e);
                    continue;
                }
            }

            if !self.options.receive_self_publish && envelope.bus_id == self.context.bus_id {
                errors.message_filtered_out(&envelope);
                continue;
            }

            match BusMessage::<T>::from_raw(envelope) {
                Some(message) => return Ok(Some(message)),
                None => debug!(contract = %contract.key(), "Decoded payload has the wrong type"),
            }
        }
    }

    /// Cancel the consumer and close the channel.
    pub async fn close(&self) -> Result<()> {
        self.channel.cancel_consumer(&self.consumer_tag).await?;
        self.feeder.abort();
        self.channel.close().await
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.feeder.abort();
    }
}
