//! Request/reply over the bus.
//!
//! [`RpcPublisher`] sends requests carrying a fresh correlation id and a
//! reply-to, and the [`CorrelationEngine`] matches replies, broker returns,
//! timeouts and cancellations back to the waiting caller.

mod correlation;
mod publisher;
mod reply;

use crate::message::RawBusMessage;

pub use correlation::{CorrelationEngine, RpcStats};
pub use publisher::{RpcCall, RpcOptions, RpcPublisher};
pub use reply::ReplyRouting;

/// Why an RPC call failed. Returned to the caller only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcCallError {
    #[error("RPC call timed out")]
    TimeOut,

    #[error("Remote handler failed: {0}")]
    HandlerError(String),

    #[error("Request rejected: {0}")]
    Reject(String),

    #[error("Failed to deserialize reply: {0}")]
    SerializationError(String),

    #[error("Request not routed: {code} {text}")]
    NotRouted { code: u16, text: String },

    #[error("RPC call cancelled")]
    Cancelled,

    #[error("Failed to send request: {0}")]
    Publish(String),
}

/// Resolution of one call: the reply envelope (with empty data for a void
/// reply) or the failure.
pub type RpcResult = std::result::Result<RawBusMessage, RpcCallError>;
