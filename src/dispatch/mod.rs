//! Inbound dispatch pipeline.
//!
//! Turns one broker delivery into at most one handler invocation and an
//! optional reply:
//!
//! 1. contract key from headers
//! 2. subscription lookup
//! 3. serializer by content type
//! 4. deserialize
//! 5. full envelope
//! 6. self-publish and header filters
//! 7. handler (reject / failure classification)
//! 8. reply to `reply-to` with the inbound correlation id
//!
//! Every failure is reported to the [`ErrorSubscriber`] and folded into a
//! [`DispatchOutcome`]; nothing escapes into the consumer loop.

mod errors;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, warn, Instrument};

use crate::broker::{Delivery, PublicationAddress};
use crate::contract::ContractType;
use crate::message::{MessageData, RawBusMessage, EXCEPTION_HEADER, REJECTED_HEADER};
use crate::sender::{contract_key_from_properties, envelope_from_properties, Destination, MessageSender};
use crate::serializer::{CodecResult, SerializerRegistry};
use crate::subscription::{HandlerError, SubscriptionRegistry};

pub use errors::{ErrorSubscriber, TracingErrorSubscriber};

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handler completed.
    Handled,
    /// No subscription for the contract.
    Unregistered,
    /// Excluded by the self-publish rule or a header filter.
    FilteredOut,
    /// Unsupported content type or undecodable payload.
    DeserializeFailed,
    /// Handler rejected the message.
    Rejected,
    /// Handler failed or panicked.
    Failed,
}

/// Broker acknowledgement for a manually-acked delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    Ack,
    /// Negative acknowledgement without requeue: dropped or dead-lettered.
    Reject,
    /// Negative acknowledgement with requeue: redelivered.
    Requeue,
}

impl DispatchOutcome {
    /// Returns true if the delivery should be removed from the queue.
    ///
    /// Undecodable messages are acked; redelivering them cannot help.
    pub fn should_ack(&self) -> bool {
        matches!(self.acknowledgement(), Acknowledgement::Ack)
    }

    pub fn acknowledgement(&self) -> Acknowledgement {
        match self {
            Self::Handled | Self::Unregistered | Self::FilteredOut | Self::DeserializeFailed => {
                Acknowledgement::Ack
            }
            Self::Rejected => Acknowledgement::Reject,
            Self::Failed => Acknowledgement::Requeue,
        }
    }
}

/// Decode a delivery body into `contract` using the serializer its content
/// type selects.
pub fn decode_delivery(
    serializers: &SerializerRegistry,
    contract: &ContractType,
    delivery: &Delivery,
) -> CodecResult<MessageData> {
    let key = contract_key_from_properties(&delivery.properties);
    serializers
        .resolve(delivery.properties.content_type.as_deref())?
        .deserialize(&key, contract, &delivery.body)
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("Handler panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("Handler panicked: {}", s)
    } else {
        "Handler panicked".to_string()
    }
}

/// Dispatch pipeline shared by a subscriber's consumer tasks.
pub struct Dispatcher {
    bus_id: String,
    subscriptions: Arc<SubscriptionRegistry>,
    serializers: Arc<SerializerRegistry>,
    errors: Arc<dyn ErrorSubscriber>,
    /// `None` when the subscriber never replies.
    replies: Option<MessageSender>,
}

impl Dispatcher {
    pub fn new(
        bus_id: impl Into<String>,
        subscriptions: Arc<SubscriptionRegistry>,
        serializers: Arc<SerializerRegistry>,
        errors: Arc<dyn ErrorSubscriber>,
        replies: Option<MessageSender>,
    ) -> Self {
        Self {
            bus_id: bus_id.into(),
            subscriptions,
            serializers,
            errors,
            replies,
        }
    }

    pub fn bus_id(&self) -> &str {
        &self.bus_id
    }

    /// Run the pipeline for one delivery.
    pub async fn dispatch(&self, delivery: &Delivery) -> DispatchOutcome {
        let span = tracing::debug_span!(
            "bus.dispatch",
            routing_key = %delivery.routing_key,
            delivery_tag = delivery.delivery_tag,
            redelivered = delivery.redelivered,
        );
        self.dispatch_inner(delivery).instrument(span).await
    }

    async fn dispatch_inner(&self, delivery: &Delivery) -> DispatchOutcome {
        let mut envelope = envelope_from_properties(&delivery.properties, delivery.body.clone());
        let key = envelope.contract_key();

        let Some(subscription) = self.subscriptions.by_key(&key) else {
            self.errors.unregistered_message_arrived(&envelope);
            return DispatchOutcome::Unregistered;
        };

        match decode_delivery(&self.serializers, &subscription.contract, delivery) {
            Ok(data) => envelope.data = data,
            Err(e) => {
                self.errors.message_deserialize_failed(&envelope, &e);
                return DispatchOutcome::DeserializeFailed;
            }
        }

        if subscription
            .filter
            .excludes_self_publish(&envelope.bus_id, &self.bus_id)
            || !subscription.filter.matches_headers(&envelope.headers)
        {
            self.errors.message_filtered_out(&envelope);
            return DispatchOutcome::FilteredOut;
        }

        debug!(contract = %key, correlation_id = %envelope.correlation_id, "Dispatching message");

        let handler = Arc::clone(&subscription.handler);
        let message = envelope.clone();
        let result = AssertUnwindSafe(async move { handler.handle(message).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(HandlerError::failed(panic_message(panic))));

        let (outcome, reply) = match result {
            Ok(reply) => (
                DispatchOutcome::Handled,
                reply.unwrap_or_else(RawBusMessage::void),
            ),
            Err(HandlerError::Reject(reason)) => {
                debug!(contract = %key, reason = %reason, "Message rejected by handler");
                let mut reply = RawBusMessage::void();
                reply.set_header(REJECTED_HEADER, reason);
                (DispatchOutcome::Rejected, reply)
            }
            Err(e) => {
                self.errors.message_dispatch_failed(&envelope, &e);
                let mut reply = RawBusMessage::void();
                reply.set_header(EXCEPTION_HEADER, e.to_string());
                (DispatchOutcome::Failed, reply)
            }
        };

        if let Some(reply_to) = delivery.properties.reply_to.as_deref() {
            if !reply_to.is_empty() {
                self.send_reply(reply_to, &envelope.correlation_id, reply)
                    .await;
            }
        }

        outcome
    }

    async fn send_reply(&self, reply_to: &str, correlation_id: &str, reply: RawBusMessage) {
        let Some(sender) = &self.replies else {
            return;
        };
        let address = PublicationAddress::resolve(reply_to);
        let destination = Destination::new(address.exchange, address.routing_key);
        let reply = reply.with_correlation_id(correlation_id);

        if let Err(e) = sender.send_raw(reply, &destination).await {
            warn!(
                reply_to = %reply_to,
                correlation_id = %correlation_id,
                error = %e,
                "Failed to send reply"
            );
        }
    }
}
