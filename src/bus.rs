//! Bus facade: one broker connection plus the shared registries, handing out
//! publishers, subscribers and route managers.

use std::sync::Arc;

use tracing::info;

use crate::broker::{BrokerConnection, MemoryBroker};
use crate::config::{BrokerType, BusConfig};
use crate::contract::ContractRegistry;
use crate::dispatch::{ErrorSubscriber, TracingErrorSubscriber};
use crate::error::{BusError, Result};
use crate::publisher::{
    ConfirmPublisher, DeliveryFailureHandler, Publisher, PublisherOptions,
    TracingDeliveryFailureHandler, TransactionalPublisher,
};
use crate::route::RouteManager;
use crate::rpc::{RpcOptions, RpcPublisher};
use crate::serializer::{Serializer, SerializerRegistry};
use crate::subscriber::{Receiver, Subscriber, SubscriberOptions};

/// State shared by every publisher and subscriber of one bus.
#[derive(Clone)]
pub struct BusContext {
    /// Stamped as app-id on every outgoing message.
    pub bus_id: String,
    pub contracts: Arc<ContractRegistry>,
    pub serializers: Arc<SerializerRegistry>,
    pub errors: Arc<dyn ErrorSubscriber>,
}

impl BusContext {
    /// Fresh registries, JSON as default codec, errors reported via tracing.
    pub fn new(bus_id: impl Into<String>) -> Self {
        Self {
            bus_id: bus_id.into(),
            contracts: Arc::new(ContractRegistry::new()),
            serializers: Arc::new(SerializerRegistry::new()),
            errors: Arc::new(TracingErrorSubscriber),
        }
    }
}

/// A message bus bound to one broker connection.
pub struct Bus {
    connection: Arc<dyn BrokerConnection>,
    context: BusContext,
    publisher_defaults: PublisherOptions,
    subscriber_defaults: SubscriberOptions,
    rpc_defaults: RpcOptions,
}

impl Bus {
    pub fn builder() -> BusBuilder {
        BusBuilder::default()
    }

    /// Connect according to `config`. Option sections become the defaults
    /// returned by [`publisher_options`](Self::publisher_options) and friends.
    pub async fn from_config(config: &BusConfig) -> Result<Self> {
        let connection: Arc<dyn BrokerConnection> = match config.broker.broker_type {
            BrokerType::Memory => Arc::new(MemoryBroker::new()),
            #[cfg(feature = "amqp")]
            BrokerType::Amqp => Arc::new(
                crate::broker::AmqpConnection::connect_with_pool_size(
                    config.broker.url.as_str(),
                    config.broker.pool_size,
                )
                .await?,
            ),
            #[cfg(not(feature = "amqp"))]
            BrokerType::Amqp => {
                return Err(BusError::Configuration(
                    "AMQP broker requested but the amqp feature is disabled".to_string(),
                ))
            }
        };

        let mut builder = BusBuilder::default()
            .connection(connection)
            .content_type(config.content_type.as_str());
        if let Some(bus_id) = &config.bus_id {
            builder = builder.bus_id(bus_id.as_str());
        }

        let mut defaults = config.clone();
        defaults.apply_exchange();

        let mut bus = builder.build()?;
        bus.publisher_defaults = defaults.publisher;
        bus.subscriber_defaults = defaults.subscriber;
        bus.rpc_defaults = defaults.rpc;
        Ok(bus)
    }

    pub fn bus_id(&self) -> &str {
        &self.context.bus_id
    }

    pub fn context(&self) -> &BusContext {
        &self.context
    }

    pub fn connection(&self) -> &Arc<dyn BrokerConnection> {
        &self.connection
    }

    pub fn publisher_options(&self) -> PublisherOptions {
        self.publisher_defaults.clone()
    }

    pub fn subscriber_options(&self) -> SubscriberOptions {
        self.subscriber_defaults.clone()
    }

    pub fn rpc_options(&self) -> RpcOptions {
        self.rpc_defaults.clone()
    }

    /// Publisher whose unroutable mandatory messages are logged.
    pub async fn publisher(&self, options: PublisherOptions) -> Result<Publisher> {
        self.publisher_with_failures(options, Arc::new(TracingDeliveryFailureHandler))
            .await
    }

    pub async fn publisher_with_failures(
        &self,
        options: PublisherOptions,
        failures: Arc<dyn DeliveryFailureHandler>,
    ) -> Result<Publisher> {
        Publisher::open(Arc::clone(&self.connection), &self.context, options, failures).await
    }

    pub async fn transactional_publisher(
        &self,
        options: PublisherOptions,
    ) -> Result<TransactionalPublisher> {
        TransactionalPublisher::open(
            Arc::clone(&self.connection),
            &self.context,
            options,
            Arc::new(TracingDeliveryFailureHandler),
        )
        .await
    }

    pub async fn confirm_publisher(&self, options: PublisherOptions) -> Result<ConfirmPublisher> {
        ConfirmPublisher::open(
            Arc::clone(&self.connection),
            &self.context,
            options,
            Arc::new(TracingDeliveryFailureHandler),
        )
        .await
    }

    pub async fn rpc_publisher(&self, options: RpcOptions) -> Result<RpcPublisher> {
        RpcPublisher::open(Arc::clone(&self.connection), &self.context, options).await
    }

    /// Push-style subscriber on its own channel. Call
    /// [`Subscriber::start`] after registering handlers.
    pub async fn subscriber(&self, options: SubscriberOptions) -> Result<Subscriber> {
        let channel = self.connection.open_channel().await?;
        Subscriber::open(channel, self.context.clone(), options).await
    }

    /// Pull-style receiver on its own channel.
    pub async fn receiver(&self, options: SubscriberOptions) -> Result<Receiver> {
        let channel = self.connection.open_channel().await?;
        Receiver::open(channel, self.context.clone(), options).await
    }

    pub async fn route_manager(&self) -> Result<RouteManager> {
        Ok(RouteManager::new(self.connection.open_channel().await?))
    }

    pub async fn is_blocked(&self) -> bool {
        self.connection.is_blocked().await
    }

    pub async fn close(self) -> Result<()> {
        info!(bus_id = %self.context.bus_id, "Closing bus");
        self.connection.close().await
    }
}

/// Assembles a [`Bus`].
#[derive(Default)]
pub struct BusBuilder {
    bus_id: Option<String>,
    connection: Option<Arc<dyn BrokerConnection>>,
    errors: Option<Arc<dyn ErrorSubscriber>>,
    serializers: Vec<Arc<dyn Serializer>>,
    content_type: Option<String>,
}

impl BusBuilder {
    /// Defaults to a random UUID.
    pub fn bus_id(mut self, bus_id: impl Into<String>) -> Self {
        self.bus_id = Some(bus_id.into());
        self
    }

    pub fn connection(mut self, connection: Arc<dyn BrokerConnection>) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn error_subscriber(mut self, errors: Arc<dyn ErrorSubscriber>) -> Self {
        self.errors = Some(errors);
        self
    }

    /// Register an additional codec.
    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializers.push(serializer);
        self
    }

    /// Content type used for outgoing messages. Must name a registered codec.
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn build(self) -> Result<Bus> {
        let connection = self.connection.ok_or_else(|| {
            BusError::Configuration("Bus requires a broker connection".to_string())
        })?;
        let bus_id = self
            .bus_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut context = BusContext::new(bus_id);
        if let Some(errors) = self.errors {
            context.errors = errors;
        }
        for serializer in self.serializers {
            context.serializers.register(serializer);
        }
        if let Some(content_type) = &self.content_type {
            context.serializers.set_default(content_type)?;
        }

        info!(
            bus_id = %context.bus_id,
            content_type = %context.serializers.default_serializer().content_type(),
            "Bus ready"
        );

        Ok(Bus {
            connection,
            context,
            publisher_defaults: PublisherOptions::default(),
            subscriber_defaults: SubscriberOptions::default(),
            rpc_defaults: RpcOptions::default(),
        })
    }
}
