use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::reply::{start_reply_consumer, ReplyEndpoint};
use super::{CorrelationEngine, ReplyRouting, RpcCallError, RpcResult};
use crate::broker::{BrokerConnection, ChannelEvent};
use crate::bus::BusContext;
use crate::contract::{ContractType, DataContract};
use crate::error::{BusError, Result};
use crate::message::{BusMessage, MessageData, RawBusMessage};
use crate::sender::{envelope_from_return, Destination, MessageSender};

/// RPC publisher settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcOptions {
    pub exchange: String,
    pub routing_key: String,
    pub persistent: bool,
    pub priority: Option<u8>,
    /// Default per-call timeout. Required.
    #[serde(with = "millis", rename = "timeout_ms")]
    pub timeout: Option<Duration>,
    pub reply_routing: ReplyRouting,
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self {
            exchange: crate::subscriber::DEFAULT_EXCHANGE.to_string(),
            routing_key: String::new(),
            persistent: false,
            priority: None,
            timeout: None,
            reply_routing: ReplyRouting::default(),
        }
    }
}

impl RpcOptions {
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

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn reply_routing(mut self, routing: ReplyRouting) -> Self {
        self.reply_routing = routing;
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    fn validated_timeout(&self) -> Result<Duration> {
        match self.timeout {
            Some(t) if !t.is_zero() => Ok(t),
            _ => Err(BusError::Configuration(
                "RPC publisher requires a positive timeout".to_string(),
            )),
        }
    }
}

type Convert<O> = fn(RawBusMessage) -> std::result::Result<O, RpcCallError>;

fn typed_reply<R: DataContract>(
    reply: RawBusMessage,
) -> std::result::Result<Option<BusMessage<R>>, RpcCallError> {
    match reply.data {
        MessageData::Empty => Ok(None),
        _ => BusMessage::<R>::from_raw(reply).map(Some).ok_or_else(|| {
            RpcCallError::SerializationError(format!(
                "Reply is not a {}",
                std::any::type_name::<R>()
            ))
        }),
    }
}

fn void_reply(_: RawBusMessage) -> std::result::Result<(), RpcCallError> {
    Ok(())
}

/// An outstanding call. Await it for the result; dropping it cancels the
/// call.
pub struct RpcCall<O> {
    receiver: oneshot::Receiver<RpcResult>,
    engine: CorrelationEngine,
    correlation_id: String,
    finished: bool,
    convert: Convert<O>,
}

impl<O> RpcCall<O> {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Cancel the call. Returns false if it already resolved.
    pub fn cancel(&self) -> bool {
        self.engine.cancel(&self.correlation_id)
    }
}

impl<O> Future for RpcCall<O> {
    type Output = std::result::Result<O, RpcCallError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(result) => {
                this.finished = true;
                let result = result.unwrap_or(Err(RpcCallError::Cancelled));
                Poll::Ready(result.and_then(this.convert))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<O> Drop for RpcCall<O> {
    fn drop(&mut self) {
        if !self.finished {
            self.engine.cancel(&self.correlation_id);
        }
    }
}

/// Request/reply publisher.
///
/// Owns one channel, one reply consumer and one correlation engine. The
/// async facade ([`call`](Self::call)) and the blocking one
/// ([`call_blocking`](Self::call_blocking)) share that engine.
pub struct RpcPublisher {
    sender: MessageSender,
    options: RpcOptions,
    timeout: Duration,
    engine: CorrelationEngine,
    reply: ReplyEndpoint,
    return_listener: JoinHandle<()>,
    runtime: tokio::runtime::Handle,
}

impl RpcPublisher {
    /// Open a channel and start reply routing. Fails with a configuration
    /// error when no positive timeout is set.
    pub async fn open(
        connection: Arc<dyn BrokerConnection>,
        context: &BusContext,
        options: RpcOptions,
    ) -> Result<Self> {
        let timeout = options.validated_timeout()?;
        let channel = connection.open_channel().await?;
        let engine = CorrelationEngine::new(Arc::clone(&context.serializers));

        let mut events = channel.events();
        let reply = start_reply_consumer(&channel, &options.reply_routing, engine.clone()).await?;

        let return_engine = engine.clone();
        let contracts = Arc::clone(&context.contracts);
        let serializers = Arc::clone(&context.serializers);
        let return_listener = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ChannelEvent::Returned(returned)) => {
                        let message = envelope_from_return(&returned, &contracts, &serializers);
                        if !return_engine.on_returned(returned.reply_code, &returned.reply_text, &message) {
                            debug!(
                                correlation_id = %message.correlation_id,
                                "Returned request has no pending call"
                            );
                        }
                    }
                    Ok(ChannelEvent::Shutdown(reason)) => {
                        let cancelled = return_engine.cancel_all();
                        debug!(reason = %reason, cancelled, "RPC channel shut down");
                        break;
                    }
                    Ok(ChannelEvent::Blocked(_) | ChannelEvent::Unblocked) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "RPC return listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let sender = MessageSender::new(
            channel,
            context.bus_id.as_str(),
            Arc::clone(&context.contracts),
            context.serializers.default_serializer(),
        );

        info!(
            exchange = %options.exchange,
            reply_to = %reply.reply_to,
            timeout_ms = timeout.as_millis() as u64,
            "RPC publisher opened"
        );

        Ok(Self {
            sender,
            options,
            timeout,
            engine,
            reply,
            return_listener,
            runtime: tokio::runtime::Handle::current(),
        })
    }

    /// Reply-to value advertised on requests.
    pub fn reply_to(&self) -> &str {
        &self.reply.reply_to
    }

    pub fn options(&self) -> &RpcOptions {
        &self.options
    }

    pub fn engine(&self) -> &CorrelationEngine {
        &self.engine
    }

    pub fn pending_calls(&self) -> usize {
        self.engine.pending_count()
    }

    fn destination(&self) -> Destination {
        let mut destination = Destination::new(
            self.options.exchange.as_str(),
            self.options.routing_key.as_str(),
        )
        .mandatory()
        .with_reply_to(self.reply.reply_to.as_str());
        destination.persistent = self.options.persistent;
        destination.priority = self.options.priority;
        destination
    }

    async fn send_request<O>(
        &self,
        mut message: RawBusMessage,
        reply: Option<Arc<ContractType>>,
        timeout: Duration,
        convert: Convert<O>,
    ) -> std::result::Result<RpcCall<O>, RpcCallError> {
        if message.correlation_id.is_empty() {
            message.correlation_id = uuid::Uuid::new_v4().to_string();
        }
        let correlation_id = message.correlation_id.clone();

        let receiver = self
            .engine
            .register(&correlation_id, reply, timeout)
            .map_err(|e| RpcCallError::Publish(e.to_string()))?;

        if let Err(e) = self.sender.send_raw(message, &self.destination()).await {
            self.engine.forget(&correlation_id);
            return Err(RpcCallError::Publish(e.to_string()));
        }

        Ok(RpcCall {
            receiver,
            engine: self.engine.clone(),
            correlation_id,
            finished: false,
            convert,
        })
    }

    /// Send a request expecting an `R` and return the pending call.
    pub async fn request<T, R>(
        &self,
        message: BusMessage<T>,
        timeout: Option<Duration>,
    ) -> std::result::Result<RpcCall<Option<BusMessage<R>>>, RpcCallError>
    where
        T: DataContract,
        R: DataContract,
    {
        let contracts = self.sender.contracts();
        contracts
            .register::<T>()
            .map_err(|e| RpcCallError::Publish(e.to_string()))?;
        let reply = contracts
            .register::<R>()
            .map_err(|e| RpcCallError::Publish(e.to_string()))?;
        self.send_request(
            message.into_raw(),
            Some(reply),
            timeout.unwrap_or(self.timeout),
            typed_reply::<R>,
        )
        .await
    }

    /// Call and wait for an `R`.
    ///
    /// `Ok(None)` is a void reply: the handler produced no content or an
    /// empty body. The two cases are indistinguishable.
    pub async fn call<T, R>(
        &self,
        message: BusMessage<T>,
    ) -> std::result::Result<Option<BusMessage<R>>, RpcCallError>
    where
        T: DataContract,
        R: DataContract,
    {
        self.request::<T, R>(message, None).await?.await
    }

    /// Call a handler that sends no reply content.
    pub async fn call_void<T: DataContract>(
        &self,
        message: BusMessage<T>,
    ) -> std::result::Result<(), RpcCallError> {
        self.sender
            .contracts()
            .register::<T>()
            .map_err(|e| RpcCallError::Publish(e.to_string()))?;
        self.send_request(message.into_raw(), None, self.timeout, void_reply)
            .await?
            .await
    }

    /// Blocking facade over [`call`](Self::call).
    ///
    /// Must not be called from inside the async runtime. The publisher must
    /// have been opened on a multi-threaded runtime: the reply consumer and
    /// the timeout timer run on its workers while this thread blocks.
    pub fn call_blocking<T, R>(
        &self,
        message: BusMessage<T>,
    ) -> std::result::Result<Option<BusMessage<R>>, RpcCallError>
    where
        T: DataContract,
        R: DataContract,
    {
        if self.runtime.runtime_flavor() == tokio::runtime::RuntimeFlavor::CurrentThread {
            return Err(RpcCallError::Publish(
                "Blocking calls require a multi-threaded runtime".to_string(),
            ));
        }
        self.runtime.block_on(self.call::<T, R>(message))
    }

    pub async fn is_blocked(&self) -> bool {
        self.sender.channel().is_blocked()
    }

    /// Cancel outstanding calls, stop the reply consumer and release the
    /// channel. The channel is left open while the connection is blocked.
    pub async fn close(self) -> Result<()> {
        let cancelled = self.engine.cancel_all();
        if cancelled > 0 {
            debug!(cancelled, "Cancelled outstanding RPC calls");
        }
        self.return_listener.abort();
        let channel = self.sender.channel();
        if channel.is_blocked() {
            self.reply.task.abort();
            info!("Connection blocked; leaving RPC channel open");
            return Ok(());
        }
        if let Err(e) = channel.cancel_consumer(&self.reply.consumer_tag).await {
            debug!(error = %e, "Reply consumer already gone");
        }
        self.reply.task.abort();
        channel.close().await
    }
}

impl Drop for RpcPublisher {
    fn drop(&mut self) {
        self.return_listener.abort();
        self.reply.task.abort();
    }
}
