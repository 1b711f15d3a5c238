//! Broker connection configuration.

use serde::Deserialize;

/// Broker type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerType {
    /// RabbitMQ over AMQP 0-9-1.
    #[default]
    Amqp,
    /// In-process broker (tests, local development).
    Memory,
}

/// Broker configuration (discriminated union).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    #[serde(rename = "type")]
    pub broker_type: BrokerType,
    /// AMQP connection URL.
    pub url: String,
    /// Maximum pooled AMQP connections.
    pub pool_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            broker_type: BrokerType::Amqp,
            url: "amqp://localhost:5672".to_string(),
            pool_size: 10,
        }
    }
}
