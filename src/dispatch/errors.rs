//! Dispatch-time error reporting.
//!
//! Nothing that goes wrong while dispatching a delivery is returned to the
//! consumer loop; it is reported here instead.

use tracing::{debug, error, info, warn};

use crate::message::RawBusMessage;
use crate::serializer::SerializationError;
use crate::subscription::HandlerError;

/// Sink for dispatch-time failures and routine drops.
pub trait ErrorSubscriber: Send + Sync {
    /// No subscription matches the delivery's contract. The envelope payload
    /// is left as raw bytes.
    fn unregistered_message_arrived(&self, message: &RawBusMessage);

    /// The delivery matched a subscription but its filter excluded it.
    fn message_filtered_out(&self, message: &RawBusMessage);

    /// Unsupported content type or a codec failure.
    fn message_deserialize_failed(&self, message: &RawBusMessage, error: &SerializationError);

    /// The handler failed with something other than a reject.
    fn message_dispatch_failed(&self, message: &RawBusMessage, error: &HandlerError);
}

/// Reports every dispatch problem as a tracing event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSubscriber;

impl ErrorSubscriber for TracingErrorSubscriber {
    fn unregistered_message_arrived(&self, message: &RawBusMessage) {
        info!(
            contract = %message.contract_key(),
            correlation_id = %message.correlation_id,
            bus_id = %message.bus_id,
            "Unregistered message arrived"
        );
    }

    fn message_filtered_out(&self, message: &RawBusMessage) {
        debug!(
            contract = %message.contract_key(),
            correlation_id = %message.correlation_id,
            bus_id = %message.bus_id,
            "Message filtered out"
        );
    }

    fn message_deserialize_failed(&self, message: &RawBusMessage, error: &SerializationError) {
        warn!(
            contract = %message.contract_key(),
            correlation_id = %message.correlation_id,
            error = %error,
            "Failed to deserialize message"
        );
    }

    fn message_dispatch_failed(&self, message: &RawBusMessage, error: &HandlerError) {
        error!(
            contract = %message.contract_key(),
            correlation_id = %message.correlation_id,
            error = %error,
            "Handler failed"
        );
    }
}
