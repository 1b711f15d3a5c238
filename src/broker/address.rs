//! Reply-to publication addresses.

use std::fmt;
use std::str::FromStr;

use super::ExchangeKind;
use crate::error::BusError;

/// Pseudo-queue that routes replies straight back to the consuming channel.
pub const DIRECT_REPLY_QUEUE: &str = "amq.rabbitmq.reply-to";

/// `kind://exchange/routing-key` destination carried in a reply-to property.
///
/// A reply-to that does not parse as an address is a bare queue name reached
/// through the default exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicationAddress {
    pub exchange_kind: ExchangeKind,
    pub exchange: String,
    pub routing_key: String,
}

impl PublicationAddress {
    pub fn new(
        exchange_kind: ExchangeKind,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            exchange_kind,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }

    /// Address reaching `queue` through the default exchange.
    pub fn queue(queue: impl Into<String>) -> Self {
        Self::new(ExchangeKind::Direct, "", queue)
    }

    /// Parse `kind://exchange/routing-key`. Returns `None` for anything else.
    pub fn parse(reply_to: &str) -> Option<Self> {
        let (kind, rest) = reply_to.split_once("://")?;
        let exchange_kind = ExchangeKind::parse(kind)?;
        let (exchange, routing_key) = rest.split_once('/')?;
        Some(Self::new(exchange_kind, exchange, routing_key))
    }

    /// Where to publish a reply for the given reply-to value.
    pub fn resolve(reply_to: &str) -> Self {
        Self::parse(reply_to).unwrap_or_else(|| Self::queue(reply_to))
    }
}

impl fmt::Display for PublicationAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}/{}",
            self.exchange_kind.as_str(),
            self.exchange,
            self.routing_key
        )
    }
}

impl FromStr for PublicationAddress {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
            .ok_or_else(|| BusError::Configuration(format!("Invalid publication address: {}", s)))
    }
}
