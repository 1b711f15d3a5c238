//! Consumers: push-mode [`Subscriber`] and pull-mode [`Receiver`].
//!
//! A subscriber owns one channel and one queue. Each subscription binds the
//! queue to the subscriber's exchange with headers-match arguments, so the
//! broker only delivers what some subscription asked for. Deliveries are
//! dispatched on a bounded-concurrency scheduler: with the default
//! concurrency of 1, handlers see messages in broker delivery order; higher
//! levels give up ordering for throughput.

mod receiver;

use std::any::TypeId;
use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use crate::broker::{BrokerChannel, ConsumeOptions, FieldMap, HeaderValue, QueueOptions};
use crate::bus::BusContext;
use crate::contract::{ContractType, DataContract, DataContractKey};
use crate::dispatch::{Acknowledgement, Dispatcher};
use crate::error::{BusError, Result};
use crate::message::BusMessage;
use crate::sender::MessageSender;
use crate::subscription::{
    blob_fn, handler_fn, reply_fn, Filter, HandlerError, MessageHandler, MessageSubscriptions,
    Subscription, SubscriptionRegistry, SubscriptionSet, VariantHandler,
};

pub use receiver::Receiver;

/// Exchange subscribers bind to unless configured otherwise.
pub const DEFAULT_EXCHANGE: &str = "amq.headers";

/// Subscriber settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubscriberOptions {
    /// Queue to consume. `None` declares a broker-named exclusive
    /// auto-delete queue.
    pub queue: Option<String>,
    pub durable: bool,
    pub exchange: String,
    /// Unacknowledged deliveries allowed in flight (transactional mode).
    pub prefetch: u16,
    /// Handlers running at once. 1 preserves delivery order.
    pub concurrency: usize,
    /// Default for subscriptions that do not override it.
    pub receive_self_publish: bool,
    /// Never send replies, even when a delivery carries reply-to.
    pub never_reply: bool,
    /// Ack after the handler, nack on failure (requeue) or reject (drop).
    pub transactional: bool,
    #[serde(skip)]
    pub queue_arguments: FieldMap,
}

impl Default for SubscriberOptions {
    fn default() -> Self {
        Self {
            queue: None,
            durable: false,
            exchange: DEFAULT_EXCHANGE.to_string(),
            prefetch: 50,
            concurrency: 1,
            receive_self_publish: false,
            never_reply: false,
            transactional: false,
            queue_arguments: FieldMap::new(),
        }
    }
}

impl SubscriberOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(mut self, name: impl Into<String>) -> Self {
        self.queue = Some(name.into());
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn receive_self_publish(mut self, receive: bool) -> Self {
        self.receive_self_publish = receive;
        self
    }

    pub fn never_reply(mut self) -> Self {
        self.never_reply = true;
        self
    }

    pub fn transactional(mut self) -> Self {
        self.transactional = true;
        self
    }

    pub fn queue_argument(mut self, name: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.queue_arguments.insert(name.into(), value.into());
        self
    }

    /// Dead-letter messages rejected without requeue.
    pub fn dead_letter_exchange(self, exchange: impl Into<String>) -> Self {
        let exchange: String = exchange.into();
        self.queue_argument("x-dead-letter-exchange", exchange)
    }

    pub fn dead_letter_routing_key(self, routing_key: impl Into<String>) -> Self {
        let routing_key: String = routing_key.into();
        self.queue_argument("x-dead-letter-routing-key", routing_key)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(BusError::Configuration(
                "Subscriber concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn queue_options(&self) -> QueueOptions {
        match self.queue {
            Some(_) => QueueOptions {
                durable: self.durable,
                exclusive: false,
                auto_delete: false,
            },
            None => QueueOptions::private(),
        }
    }
}

/// Declare the consumer queue described by `options`; returns its name.
pub(crate) async fn declare_consumer_queue(
    channel: &dyn BrokerChannel,
    options: &SubscriberOptions,
) -> Result<String> {
    let name = options.queue.as_deref().unwrap_or_default();
    channel
        .declare_queue(name, options.queue_options(), options.queue_arguments.clone())
        .await
}

struct ConsumerHandle {
    consumer_tag: String,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Push-mode consumer of one queue.
pub struct Subscriber {
    channel: Arc<dyn BrokerChannel>,
    queue: String,
    options: SubscriberOptions,
    context: BusContext,
    subscriptions: Arc<SubscriptionRegistry>,
    consumer: Mutex<Option<ConsumerHandle>>,
    /// Held across start/stop so only one consumer is ever registered.
    lifecycle: tokio::sync::Mutex<()>,
}

impl Subscriber {
    /// Declare the queue and prepare a subscriber on `channel`. Consumption
    /// starts with [`Subscriber::start`].
    pub async fn open(
        channel: Arc<dyn BrokerChannel>,
        context: BusContext,
        options: SubscriberOptions,
    ) -> Result<Self> {
        options.validate()?;
        let queue = declare_consumer_queue(channel.as_ref(), &options).await?;
        if options.transactional && options.prefetch > 0 {
            channel.qos(options.prefetch).await?;
        }

        info!(
            queue = %queue,
            exchange = %options.exchange,
            transactional = options.transactional,
            concurrency = options.concurrency,
            "Subscriber opened"
        );

        Ok(Self {
            channel,
            queue,
            options,
            context,
            subscriptions: Arc::new(SubscriptionRegistry::new()),
            consumer: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn options(&self) -> &SubscriberOptions {
        &self.options
    }

    pub fn is_running(&self) -> bool {
        self.consumer.lock().is_some()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Subscribe a handler for `T`. Returns `false` if `T` already has one.
    pub async fn subscribe<T, F, Fut>(&self, filter: Filter, f: F) -> Result<bool>
    where
        T: DataContract,
        F: Fn(BusMessage<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        let contract = self.context.contracts.register::<T>()?;
        self.add(contract, handler_fn(f), filter).await
    }

    /// Subscribe a handler for `T` that replies with an `R`.
    pub async fn subscribe_reply<T, R, F, Fut>(&self, filter: Filter, f: F) -> Result<bool>
    where
        T: DataContract,
        R: DataContract,
        F: Fn(BusMessage<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, HandlerError>> + Send + 'static,
    {
        let contract = self.context.contracts.register::<T>()?;
        self.context.contracts.register::<R>()?;
        self.add(contract, reply_fn(f), filter).await
    }

    /// Subscribe to raw byte payloads published without a contract.
    pub async fn subscribe_blob<F, Fut>(&self, filter: Filter, f: F) -> Result<bool>
    where
        F: Fn(BusMessage<Vec<u8>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        let contract = self
            .context
            .contracts
            .by_key(&DataContractKey::binary_blob())
            .ok_or_else(|| BusError::UnknownContract("BinaryBlob".to_string()))?;
        self.add(contract, blob_fn(f), filter).await
    }

    /// Subscribe one handler to every registered variant of the family `B`.
    /// Returns true if at least one variant was subscribed.
    pub async fn subscribe_hierarchy<B, F, Fut>(&self, filter: Filter, f: F) -> Result<bool>
    where
        B: Send + Sync + 'static,
        F: Fn(BusMessage<B>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        let f = Arc::new(f);
        let mut any = false;
        for variant in self.context.contracts.variants::<B>() {
            let contract = Arc::clone(variant.contract());
            let handler: Arc<dyn MessageHandler> =
                Arc::new(VariantHandler::new(variant, Arc::clone(&f)));
            any |= self.add(contract, handler, filter.clone()).await?;
        }
        if !any {
            debug!(family = std::any::type_name::<B>(), "No variant subscribed");
        }
        Ok(any)
    }

    /// Apply every handler an object declares. Returns how many were newly
    /// subscribed.
    ///
    /// The object's declarations are validated before anything is bound.
    pub async fn register_subscriptions<S: MessageSubscriptions>(
        &self,
        instance: Arc<S>,
    ) -> Result<usize> {
        let mut set = SubscriptionSet::new(Arc::clone(&self.context.contracts));
        instance.subscriptions(&mut set)?;

        let mut added = 0;
        for request in set.into_requests() {
            if self
                .add(request.contract, request.handler, request.filter)
                .await?
            {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Remove the subscription for `T` and its queue binding.
    pub async fn unsubscribe<T: DataContract>(&self) -> Result<bool> {
        let Some(subscription) = self.subscriptions.remove(TypeId::of::<T>()) else {
            return Ok(false);
        };
        self.channel
            .unbind_queue(
                &self.queue,
                &self.options.exchange,
                "",
                subscription.filter.binding_arguments(),
            )
            .await?;
        debug!(queue = %self.queue, contract = %subscription.contract.key(), "Unsubscribed");
        Ok(true)
    }

    async fn add(
        &self,
        contract: Arc<ContractType>,
        handler: Arc<dyn MessageHandler>,
        filter: Filter,
    ) -> Result<bool> {
        let type_id = contract.rust_type();
        let key = contract.key().clone();
        let filter = filter.into_info(key.clone(), self.options.receive_self_publish);
        let arguments = filter.binding_arguments();

        if !self.subscriptions.insert(Subscription {
            contract,
            handler,
            filter,
        }) {
            debug!(queue = %self.queue, contract = %key, "Already subscribed");
            return Ok(false);
        }

        if let Err(e) = self
            .channel
            .bind_queue(&self.queue, &self.options.exchange, "", arguments)
            .await
        {
            self.subscriptions.remove(type_id);
            return Err(e);
        }

        debug!(
            queue = %self.queue,
            exchange = %self.options.exchange,
            contract = %key,
            "Subscribed"
        );
        Ok(true)
    }

    fn dispatcher(&self) -> Dispatcher {
        let replies = (!self.options.never_reply).then(|| {
            MessageSender::new(
                Arc::clone(&self.channel),
                self.context.bus_id.as_str(),
                Arc::clone(&self.context.contracts),
                self.context.serializers.default_serializer(),
            )
        });
        Dispatcher::new(
            self.context.bus_id.as_str(),
            Arc::clone(&self.subscriptions),
            Arc::clone(&self.context.serializers),
            Arc::clone(&self.context.errors),
            replies,
        )
    }

    /// Start consuming. Calling it on a running subscriber does nothing.
    pub async fn start(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_running() {
            return Ok(());
        }

        let consumer_tag = format!("courier-{}", uuid::Uuid::new_v4());
        let transactional = self.options.transactional;
        let deliveries = self
            .channel
            .consume(
                &self.queue,
                ConsumeOptions {
                    consumer_tag: consumer_tag.clone(),
                    no_ack: !transactional,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let dispatcher = Arc::new(self.dispatcher());
        let channel = Arc::clone(&self.channel);
        let concurrency = self.options.concurrency;
        let queue = self.queue.clone();

        let span = tracing::info_span!("bus.consume", queue = %queue);
        let task = tokio::spawn(
            async move {
                // Cancelling the consumer ends the stream once buffered
                // deliveries are drained. The signal only forces an exit
                // when the cancel could not be sent.
                let abandon = async move {
                    let _ = shutdown_rx.wait_for(|stopped| *stopped).await;
                };
                deliveries
                    .take_until(abandon)
                    .for_each_concurrent(concurrency, |delivery| {
                        let dispatcher = Arc::clone(&dispatcher);
                        let channel = Arc::clone(&channel);
                        async move {
                            let outcome = dispatcher.dispatch(&delivery).await;
                            if !transactional {
                                return;
                            }
                            let tag = delivery.delivery_tag;
                            let result = match outcome.acknowledgement() {
                                Acknowledgement::Ack => channel.ack(tag).await,
                                Acknowledgement::Reject => channel.nack(tag, false).await,
                                Acknowledgement::Requeue => channel.nack(tag, true).await,
                            };
                            if let Err(e) = result {
                                error!(delivery_tag = tag, error = %e, "Failed to acknowledge delivery");
                            }
                        }
                    })
                    .await;
                info!("Consumer stopped");
            }
            .instrument(span),
        );

        *self.consumer.lock() = Some(ConsumerHandle {
            consumer_tag,
            shutdown,
            task,
        });
        info!(queue = %self.queue, "Subscriber started");
        Ok(())
    }

    /// Stop consuming and wait for in-flight handlers to finish.
    ///
    /// Deliveries the broker already pushed to this consumer are dispatched
    /// before the call returns.
    pub async fn stop(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let handle = self.consumer.lock().take();
        let Some(handle) = handle else {
            return Ok(());
        };
        if let Err(e) = self.channel.cancel_consumer(&handle.consumer_tag).await {
            warn!(queue = %self.queue, error = %e, "Failed to cancel consumer");
            let _ = handle.shutdown.send(true);
        }
        if let Err(e) = handle.task.await {
            error!(queue = %self.queue, error = %e, "Consumer task failed");
        }
        Ok(())
    }

    /// Stop consuming and close the channel.
    pub async fn close(&self) -> Result<()> {
        self.stop().await?;
        self.channel.close().await
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if let Some(handle) = self.consumer.get_mut().take() {
            let _ = handle.shutdown.send(true);
        }
    }
}

#[cfg(test)]
mod tests;
