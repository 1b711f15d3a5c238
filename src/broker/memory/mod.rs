//! In-memory AMQP broker.
//!
//! Implements the broker collaborator contract inside the process so the whole
//! engine can run without RabbitMQ: default/direct/fanout/topic/headers
//! exchanges, mandatory returns, manual ack with requeue, dead-lettering with
//! `x-death`, transactions, publisher confirms, the fast-reply pseudo queue and
//! the connection blocked flag.
//!
//! All state lives behind one mutex that is never held across an await.
//! Clones of a [`MemoryBroker`] share the connection; [`MemoryBroker::connect`]
//! opens a second connection to the same broker.

mod routing;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

use super::{
    BrokerChannel, BrokerConnection, ChannelEvent, ConsumeOptions, Delivery, DeliveryStream,
    ExchangeKind, FieldMap, HeaderValue, MessageProperties, QueueOptions, ReturnedMessage,
    DIRECT_REPLY_QUEUE,
};
use crate::error::{BusError, Result};
use crate::message::DEATH_HEADER;
use routing::{headers_match, topic_matches};

const EVENT_CAPACITY: usize = 256;
const NO_ROUTE: u16 = 312;

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    body: Vec<u8>,
    redelivered: bool,
}

struct Binding {
    queue: String,
    routing_key: String,
    arguments: FieldMap,
}

struct Exchange {
    kind: ExchangeKind,
    bindings: Vec<Binding>,
}

struct Consumer {
    tag: String,
    channel_id: u64,
    no_ack: bool,
    prefetch: u16,
    sender: mpsc::UnboundedSender<Delivery>,
}

struct Queue {
    options: QueueOptions,
    arguments: FieldMap,
    /// Owning connection of an exclusive queue.
    owner: Option<u64>,
    messages: VecDeque<StoredMessage>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
}

struct Unacked {
    queue: String,
    consumer_tag: String,
    message: StoredMessage,
}

struct Publish {
    exchange: String,
    routing_key: String,
    mandatory: bool,
    properties: MessageProperties,
    body: Vec<u8>,
}

struct ChannelState {
    connection_id: u64,
    next_delivery_tag: u64,
    next_consumer_tag: u64,
    prefetch: u16,
    unacked: HashMap<u64, Unacked>,
    tx: Option<Vec<Publish>>,
    confirm: bool,
    direct_reply: Option<(String, mpsc::UnboundedSender<Delivery>)>,
    events: broadcast::Sender<ChannelEvent>,
}

impl ChannelState {
    fn unacked_for(&self, consumer_tag: &str) -> usize {
        self.unacked
            .values()
            .filter(|u| u.consumer_tag == consumer_tag)
            .count()
    }
}

struct State {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    channels: HashMap<u64, ChannelState>,
    next_id: u64,
    blocked: bool,
}

impl State {
    fn new() -> Self {
        let mut exchanges = HashMap::new();
        for (name, kind) in [
            ("", ExchangeKind::Direct),
            ("amq.direct", ExchangeKind::Direct),
            ("amq.fanout", ExchangeKind::Fanout),
            ("amq.topic", ExchangeKind::Topic),
            ("amq.headers", ExchangeKind::Headers),
        ] {
            exchanges.insert(
                name.to_string(),
                Exchange {
                    kind,
                    bindings: Vec::new(),
                },
            );
        }
        Self {
            exchanges,
            queues: HashMap::new(),
            channels: HashMap::new(),
            next_id: 0,
            blocked: false,
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_mut(&mut self, id: u64) -> Result<&mut ChannelState> {
        self.channels.get_mut(&id).ok_or(BusError::Closed)
    }

    fn queue_mut(&mut self, name: &str) -> Result<&mut Queue> {
        self.queues
            .get_mut(name)
            .ok_or_else(|| BusError::Channel(format!("NOT_FOUND - no queue '{}'", name)))
    }

    /// Queues a message published to `exchange` with `routing_key` reaches.
    fn route(&self, exchange: &str, routing_key: &str, headers: &FieldMap) -> Vec<String> {
        if exchange.is_empty() {
            return if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            };
        }
        let Some(exchange) = self.exchanges.get(exchange) else {
            return Vec::new();
        };
        let mut targets: Vec<String> = Vec::new();
        for binding in &exchange.bindings {
            let hit = match exchange.kind {
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
                ExchangeKind::Headers => headers_match(&binding.arguments, headers),
            };
            if hit && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        targets
    }

    /// Route a publish, returning it to the publishing channel when mandatory
    /// and unroutable.
    fn publish(&mut self, channel_id: u64, publish: Publish) {
        if publish.exchange.is_empty() {
            if let Some(target) = publish.routing_key.strip_prefix(DIRECT_REPLY_PREFIX) {
                if self.deliver_direct_reply(target, &publish) || !publish.mandatory {
                    return;
                }
                self.return_message(channel_id, publish);
                return;
            }
        }

        let queues = self.route(
            &publish.exchange,
            &publish.routing_key,
            &publish.properties.headers,
        );
        if queues.is_empty() {
            debug!(
                exchange = %publish.exchange,
                routing_key = %publish.routing_key,
                mandatory = publish.mandatory,
                "Message unroutable"
            );
            if publish.mandatory {
                self.return_message(channel_id, publish);
            }
            return;
        }

        let message = StoredMessage {
            exchange: publish.exchange,
            routing_key: publish.routing_key,
            properties: publish.properties,
            body: publish.body,
            redelivered: false,
        };
        for queue in queues {
            self.enqueue(&queue, message.clone());
        }
    }

    fn return_message(&mut self, channel_id: u64, publish: Publish) {
        if let Some(channel) = self.channels.get(&channel_id) {
            let _ = channel.events.send(ChannelEvent::Returned(ReturnedMessage {
                reply_code: NO_ROUTE,
                reply_text: "NO_ROUTE".to_string(),
                exchange: publish.exchange,
                routing_key: publish.routing_key,
                properties: publish.properties,
                body: publish.body,
            }));
        }
    }

    fn deliver_direct_reply(&mut self, target: &str, publish: &Publish) -> bool {
        let Some(channel_id) = target.strip_prefix('g').and_then(|id| id.parse::<u64>().ok())
        else {
            return false;
        };
        let Some(channel) = self.channels.get_mut(&channel_id) else {
            return false;
        };
        let Some((tag, sender)) = &channel.direct_reply else {
            return false;
        };
        channel.next_delivery_tag += 1;
        sender
            .send(Delivery {
                consumer_tag: tag.clone(),
                delivery_tag: channel.next_delivery_tag,
                redelivered: false,
                exchange: String::new(),
                routing_key: publish.routing_key.clone(),
                properties: publish.properties.clone(),
                body: publish.body.clone(),
            })
            .is_ok()
    }

    fn enqueue(&mut self, queue: &str, message: StoredMessage) {
        if let Some(q) = self.queues.get_mut(queue) {
            q.messages.push_back(message);
            self.dispatch(queue);
        }
    }

    fn requeue(&mut self, queue: &str, mut message: StoredMessage) {
        message.redelivered = true;
        if let Some(q) = self.queues.get_mut(queue) {
            q.messages.push_front(message);
            self.dispatch(queue);
        }
    }

    /// Push ready messages to consumers with spare prefetch, round robin.
    fn dispatch(&mut self, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            if queue.messages.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let count = queue.consumers.len();
            let channels = &self.channels;
            let picked = (0..count)
                .map(|i| (queue.next_consumer + i) % count)
                .find(|&idx| {
                    let c = &queue.consumers[idx];
                    c.no_ack
                        || c.prefetch == 0
                        || channels
                            .get(&c.channel_id)
                            .is_some_and(|ch| ch.unacked_for(&c.tag) < usize::from(c.prefetch))
                });
            let Some(idx) = picked else {
                return;
            };
            queue.next_consumer = (idx + 1) % count;

            let Some(message) = queue.messages.pop_front() else {
                return;
            };
            let consumer = &queue.consumers[idx];
            let Some(channel) = self.channels.get_mut(&consumer.channel_id) else {
                queue.messages.push_front(message);
                queue.consumers.remove(idx);
                continue;
            };
            channel.next_delivery_tag += 1;
            let delivery_tag = channel.next_delivery_tag;

            let delivery = Delivery {
                consumer_tag: consumer.tag.clone(),
                delivery_tag,
                redelivered: message.redelivered,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                properties: message.properties.clone(),
                body: message.body.clone(),
            };
            if consumer.sender.send(delivery).is_err() {
                // Consumer stream dropped without a cancel
                queue.messages.push_front(message);
                queue.consumers.remove(idx);
                continue;
            }
            if !consumer.no_ack {
                channel.unacked.insert(
                    delivery_tag,
                    Unacked {
                        queue: queue_name.to_string(),
                        consumer_tag: consumer.tag.clone(),
                        message,
                    },
                );
            }
        }
    }

    fn dead_letter(&mut self, queue_name: &str, mut message: StoredMessage, reason: &str) {
        let Some(queue) = self.queues.get(queue_name) else {
            return;
        };
        let Some(dlx) = queue
            .arguments
            .get("x-dead-letter-exchange")
            .and_then(HeaderValue::as_str)
            .map(str::to_string)
        else {
            debug!(queue = %queue_name, reason, "Message dropped");
            return;
        };
        let routing_key = queue
            .arguments
            .get("x-dead-letter-routing-key")
            .and_then(HeaderValue::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| message.routing_key.clone());

        record_death(&mut message, queue_name, reason);
        debug!(queue = %queue_name, exchange = %dlx, reason, "Message dead-lettered");

        let queues = self.route(&dlx, &routing_key, &message.properties.headers);
        message.exchange = dlx;
        message.routing_key = routing_key;
        message.redelivered = false;
        for queue in queues {
            self.enqueue(&queue, message.clone());
        }
    }

    fn remove_consumer(&mut self, channel_id: u64, consumer_tag: &str) {
        self.drop_consumers(|c| c.channel_id == channel_id && c.tag == consumer_tag);
    }

    /// Remove matching consumers, auto-deleting queues left without any.
    fn drop_consumers(&mut self, matches: impl Fn(&Consumer) -> bool) {
        let mut emptied = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| !matches(c));
            if queue.consumers.len() != before {
                queue.next_consumer = 0;
                if queue.consumers.is_empty() && queue.options.auto_delete {
                    emptied.push(name.clone());
                }
            }
        }
        for name in emptied {
            debug!(queue = %name, "Auto-deleting queue");
            self.delete_queue(&name);
        }
    }

    fn delete_queue(&mut self, name: &str) -> u32 {
        let Some(queue) = self.queues.remove(name) else {
            return 0;
        };
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|b| b.queue != name);
        }
        u32::try_from(queue.messages.len()).unwrap_or(u32::MAX)
    }

    fn close_channel(&mut self, id: u64, reason: &str) {
        let Some(mut channel) = self.channels.remove(&id) else {
            return;
        };

        // Unacked messages go back in delivery order
        let mut unacked: Vec<_> = channel.unacked.drain().collect();
        unacked.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
        for (_, u) in unacked {
            let mut message = u.message;
            message.redelivered = true;
            if let Some(q) = self.queues.get_mut(&u.queue) {
                q.messages.push_front(message);
            }
        }

        self.drop_consumers(|c| c.channel_id == id);

        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            self.dispatch(&name);
        }

        let _ = channel
            .events
            .send(ChannelEvent::Shutdown(reason.to_string()));
    }
}

const DIRECT_REPLY_PREFIX: &str = "amq.rabbitmq.reply-to.";

/// Add or bump the `x-death` entry for (queue, reason), most recent first.
fn record_death(message: &mut StoredMessage, queue: &str, reason: &str) {
    let mut deaths: Vec<HeaderValue> = message
        .properties
        .headers
        .remove(DEATH_HEADER)
        .and_then(|v| match v {
            HeaderValue::Array(a) => Some(a),
            _ => None,
        })
        .unwrap_or_default();

    let existing = deaths.iter().position(|d| {
        d.as_table().is_some_and(|t| {
            t.get("queue").and_then(HeaderValue::as_str) == Some(queue)
                && t.get("reason").and_then(HeaderValue::as_str) == Some(reason)
        })
    });

    let entry = match existing {
        Some(pos) => {
            let mut entry = deaths.remove(pos);
            if let HeaderValue::Table(t) = &mut entry {
                let count = t.get("count").and_then(HeaderValue::as_i64).unwrap_or(0);
                t.insert("count".into(), HeaderValue::Int(count + 1));
            }
            entry
        }
        None => {
            let mut t = FieldMap::new();
            t.insert("reason".into(), reason.into());
            t.insert("queue".into(), queue.into());
            t.insert("exchange".into(), message.exchange.as_str().into());
            t.insert(
                "routing-keys".into(),
                HeaderValue::Array(vec![message.routing_key.as_str().into()]),
            );
            t.insert("count".into(), HeaderValue::Int(1));
            t.insert(
                "time".into(),
                HeaderValue::Timestamp(u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)),
            );
            HeaderValue::Table(t)
        }
    };
    deaths.insert(0, entry);
    message
        .properties
        .headers
        .insert(DEATH_HEADER.to_string(), HeaderValue::Array(deaths));
}

/// In-process broker connection.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
    connection_id: u64,
}

impl MemoryBroker {
    /// Start an empty broker and return a connection to it.
    pub fn new() -> Self {
        let mut state = State::new();
        let connection_id = state.next_id();
        info!("In-memory broker started");
        Self {
            state: Arc::new(Mutex::new(state)),
            connection_id,
        }
    }

    /// A second connection to the same broker.
    pub fn connect(&self) -> Self {
        let connection_id = self.state.lock().next_id();
        Self {
            state: Arc::clone(&self.state),
            connection_id,
        }
    }

    /// Simulate connection.blocked / connection.unblocked.
    pub fn set_blocked(&self, blocked: bool) {
        let mut state = self.state.lock();
        if state.blocked == blocked {
            return;
        }
        state.blocked = blocked;
        let event = if blocked {
            ChannelEvent::Blocked(None)
        } else {
            ChannelEvent::Unblocked
        };
        for channel in state.channels.values() {
            let _ = channel.events.send(event.clone());
        }
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.state.lock().queues.contains_key(name)
    }

    /// Ready (not yet delivered) messages in a queue.
    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        self.state.lock().queues.get(name).map(|q| q.messages.len())
    }

    /// Open channels across all connections.
    pub fn channel_count(&self) -> usize {
        self.state.lock().channels.len()
    }

    pub fn consumer_count(&self, name: &str) -> Option<usize> {
        self.state.lock().queues.get(name).map(|q| q.consumers.len())
    }

    /// Delivered but unacknowledged messages from a queue.
    pub fn unacked_count(&self, name: &str) -> usize {
        self.state
            .lock()
            .channels
            .values()
            .flat_map(|c| c.unacked.values())
            .filter(|u| u.queue == name)
            .count()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerConnection for MemoryBroker {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let mut state = self.state.lock();
        let id = state.next_id();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        state.channels.insert(
            id,
            ChannelState {
                connection_id: self.connection_id,
                next_delivery_tag: 0,
                next_consumer_tag: 0,
                prefetch: 0,
                unacked: HashMap::new(),
                tx: None,
                confirm: false,
                direct_reply: None,
                events: events.clone(),
            },
        );
        debug!(channel_id = id, "Opened in-memory channel");
        Ok(Arc::new(MemoryChannel {
            id,
            state: Arc::clone(&self.state),
            events,
        }))
    }

    async fn is_blocked(&self) -> bool {
        self.state.lock().blocked
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        let channels: Vec<u64> = state
            .channels
            .iter()
            .filter(|(_, c)| c.connection_id == self.connection_id)
            .map(|(id, _)| *id)
            .collect();
        for id in channels {
            state.close_channel(id, "connection closed");
        }
        let exclusive: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(self.connection_id))
            .map(|(name, _)| name.clone())
            .collect();
        for name in exclusive {
            state.delete_queue(&name);
        }
        Ok(())
    }
}

/// Channel on a [`MemoryBroker`].
pub struct MemoryChannel {
    id: u64,
    state: Arc<Mutex<State>>,
    events: broadcast::Sender<ChannelEvent>,
}

impl MemoryChannel {
    fn check_exclusive(queue: &Queue, connection_id: u64, name: &str) -> Result<()> {
        match queue.owner {
            Some(owner) if owner != connection_id => Err(BusError::Channel(format!(
                "RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{}'",
                name
            ))),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        mut properties: MessageProperties,
        body: Vec<u8>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let channel = state.channel_mut(self.id)?;

        if properties.reply_to.as_deref() == Some(DIRECT_REPLY_QUEUE) {
            if channel.direct_reply.is_none() {
                return Err(BusError::Channel(
                    "PRECONDITION_FAILED - fast reply consumer does not exist".to_string(),
                ));
            }
            properties.reply_to = Some(format!("{}g{}", DIRECT_REPLY_PREFIX, self.id));
        }

        let publish = Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            mandatory,
            properties,
            body,
        };

        if let Some(buffer) = channel.tx.as_mut() {
            buffer.push(publish);
            return Ok(());
        }

        if !exchange.is_empty() && !state.exchanges.contains_key(exchange) {
            return Err(BusError::Channel(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange
            )));
        }
        state.publish(self.id, publish);
        Ok(())
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<DeliveryStream> {
        let mut state = self.state.lock();
        let channel = state.channel_mut(self.id)?;
        let tag = if options.consumer_tag.is_empty() {
            channel.next_consumer_tag += 1;
            format!("ctag-{}.{}", self.id, channel.next_consumer_tag)
        } else {
            options.consumer_tag.clone()
        };
        let prefetch = channel.prefetch;
        let connection_id = channel.connection_id;
        let (sender, receiver) = mpsc::unbounded_channel();

        if queue == DIRECT_REPLY_QUEUE {
            if !options.no_ack {
                return Err(BusError::Channel(
                    "PRECONDITION_FAILED - fast reply consumer must be in no-ack mode".to_string(),
                ));
            }
            channel.direct_reply = Some((tag, sender));
            return Ok(UnboundedReceiverStream::new(receiver).boxed());
        }

        let q = state.queue_mut(queue)?;
        Self::check_exclusive(q, connection_id, queue)?;
        if q.consumers.iter().any(|c| c.tag == tag && c.channel_id == self.id) {
            return Err(BusError::Channel(format!(
                "NOT_ALLOWED - attempt to reuse consumer tag '{}'",
                tag
            )));
        }
        if options.exclusive && !q.consumers.is_empty() {
            return Err(BusError::Channel(format!(
                "ACCESS_REFUSED - queue '{}' in exclusive use",
                queue
            )));
        }
        q.consumers.push(Consumer {
            tag: tag.clone(),
            channel_id: self.id,
            no_ack: options.no_ack,
            prefetch,
            sender,
        });
        debug!(queue = %queue, consumer_tag = %tag, "Consumer registered");
        state.dispatch(queue);

        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<()> {
        let mut state = self.state.lock();
        let channel = state.channel_mut(self.id)?;
        if channel
            .direct_reply
            .as_ref()
            .is_some_and(|(tag, _)| tag == consumer_tag)
        {
            channel.direct_reply = None;
            return Ok(());
        }
        state.remove_consumer(self.id, consumer_tag);
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        let mut state = self.state.lock();
        let unacked = state
            .channel_mut(self.id)?
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| {
                BusError::Channel(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {}",
                    delivery_tag
                ))
            })?;
        state.dispatch(&unacked.queue);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let mut state = self.state.lock();
        let unacked = state
            .channel_mut(self.id)?
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| {
                BusError::Channel(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {}",
                    delivery_tag
                ))
            })?;
        if requeue {
            state.requeue(&unacked.queue, unacked.message);
        } else {
            state.dead_letter(&unacked.queue, unacked.message, "rejected");
            state.dispatch(&unacked.queue);
        }
        Ok(())
    }

    async fn qos(&self, prefetch_count: u16) -> Result<()> {
        self.state.lock().channel_mut(self.id)?.prefetch = prefetch_count;
        Ok(())
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, _durable: bool) -> Result<()> {
        let mut state = self.state.lock();
        state.channel_mut(self.id)?;
        if let Some(existing) = state.exchanges.get(name) {
            if existing.kind != kind {
                return Err(BusError::Channel(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{}'",
                    name
                )));
            }
            return Ok(());
        }
        state.exchanges.insert(
            name.to_string(),
            Exchange {
                kind,
                bindings: Vec::new(),
            },
        );
        Ok(())
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
        arguments: FieldMap,
    ) -> Result<String> {
        let mut state = self.state.lock();
        let connection_id = state.channel_mut(self.id)?.connection_id;
        let name = if name.is_empty() {
            format!("amq.gen-{}", uuid::Uuid::new_v4().simple())
        } else {
            name.to_string()
        };

        if let Some(existing) = state.queues.get(&name) {
            Self::check_exclusive(existing, connection_id, &name)?;
            return Ok(name);
        }

        state.queues.insert(
            name.clone(),
            Queue {
                options,
                arguments,
                owner: options.exclusive.then_some(connection_id),
                messages: VecDeque::new(),
                consumers: Vec::new(),
                next_consumer: 0,
            },
        );
        debug!(queue = %name, exclusive = options.exclusive, "Declared queue");
        Ok(name)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldMap,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.channel_mut(self.id)?;
        if !state.queues.contains_key(queue) {
            return Err(BusError::Channel(format!("NOT_FOUND - no queue '{}'", queue)));
        }
        if exchange.is_empty() {
            return Err(BusError::Channel(
                "ACCESS_REFUSED - operation not permitted on the default exchange".to_string(),
            ));
        }
        let ex = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BusError::Channel(format!("NOT_FOUND - no exchange '{}'", exchange)))?;
        let duplicate = ex.bindings.iter().any(|b| {
            b.queue == queue && b.routing_key == routing_key && b.arguments == arguments
        });
        if !duplicate {
            ex.bindings.push(Binding {
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
                arguments,
            });
        }
        Ok(())
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldMap,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.channel_mut(self.id)?;
        if let Some(ex) = state.exchanges.get_mut(exchange) {
            ex.bindings.retain(|b| {
                !(b.queue == queue && b.routing_key == routing_key && b.arguments == arguments)
            });
        }
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<u32> {
        let mut state = self.state.lock();
        let connection_id = state.channel_mut(self.id)?.connection_id;
        if let Some(queue) = state.queues.get(name) {
            Self::check_exclusive(queue, connection_id, name)?;
        }
        Ok(state.delete_queue(name))
    }

    async fn purge_queue(&self, name: &str) -> Result<u32> {
        let mut state = self.state.lock();
        state.channel_mut(self.id)?;
        let queue = state.queue_mut(name)?;
        let purged = queue.messages.len();
        queue.messages.clear();
        Ok(u32::try_from(purged).unwrap_or(u32::MAX))
    }

    async fn tx_select(&self) -> Result<()> {
        let mut state = self.state.lock();
        let channel = state.channel_mut(self.id)?;
        if channel.confirm {
            return Err(BusError::Channel(
                "PRECONDITION_FAILED - cannot switch from confirm to tx mode".to_string(),
            ));
        }
        if channel.tx.is_none() {
            channel.tx = Some(Vec::new());
        }
        Ok(())
    }

    async fn tx_commit(&self) -> Result<()> {
        let mut state = self.state.lock();
        let channel = state.channel_mut(self.id)?;
        let buffered = match channel.tx.as_mut() {
            Some(buffer) => std::mem::take(buffer),
            None => {
                return Err(BusError::Channel(
                    "PRECONDITION_FAILED - channel is not transactional".to_string(),
                ))
            }
        };
        for publish in buffered {
            state.publish(self.id, publish);
        }
        Ok(())
    }

    async fn tx_rollback(&self) -> Result<()> {
        let mut state = self.state.lock();
        let channel = state.channel_mut(self.id)?;
        match channel.tx.as_mut() {
            Some(buffer) => {
                buffer.clear();
                Ok(())
            }
            None => Err(BusError::Channel(
                "PRECONDITION_FAILED - channel is not transactional".to_string(),
            )),
        }
    }

    async fn confirm_select(&self) -> Result<()> {
        let mut state = self.state.lock();
        let channel = state.channel_mut(self.id)?;
        if channel.tx.is_some() {
            return Err(BusError::Channel(
                "PRECONDITION_FAILED - cannot switch from tx to confirm mode".to_string(),
            ));
        }
        channel.confirm = true;
        Ok(())
    }

    async fn wait_for_confirms(&self, _timeout: Duration) -> Result<bool> {
        // Publishes are routed synchronously, so every one is already confirmed
        let mut state = self.state.lock();
        if state.channel_mut(self.id)?.confirm {
            Ok(true)
        } else {
            Err(BusError::Channel(
                "PRECONDITION_FAILED - channel is not in confirm mode".to_string(),
            ))
        }
    }

    fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    fn is_blocked(&self) -> bool {
        self.state.lock().blocked
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().close_channel(self.id, "closed by application");
        Ok(())
    }
}
