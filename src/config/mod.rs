//! Configuration types for the bus.
//!
//! Loaded in layers, later sources overriding earlier ones:
//! 1. `courier.yaml` in the current directory (optional)
//! 2. an explicit path passed to [`BusConfig::load`]
//! 3. the file named by `COURIER_CONFIG`
//! 4. `COURIER__*` environment variables (`__` separates levels, e.g.
//!    `COURIER__BROKER__URL`)

mod broker;

use serde::Deserialize;

use crate::error::{BusError, Result};
use crate::publisher::PublisherOptions;
use crate::rpc::RpcOptions;
use crate::serializer::JsonSerializer;
use crate::subscriber::{SubscriberOptions, DEFAULT_EXCHANGE};

pub use broker::{BrokerConfig, BrokerType};

/// Default configuration file name (without extension lookup).
pub const DEFAULT_CONFIG_FILE: &str = "courier.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "COURIER_CONFIG";
/// Environment variable prefix for configuration overrides.
pub const CONFIG_ENV_PREFIX: &str = "COURIER";

/// Top-level bus configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Bus instance id stamped on every message. Generated when absent.
    pub bus_id: Option<String>,
    pub broker: BrokerConfig,
    /// Exchange for every publisher and subscriber section that does not
    /// name its own.
    pub exchange: Option<String>,
    /// Content type of outgoing messages.
    pub content_type: String,
    pub publisher: PublisherOptions,
    pub subscriber: SubscriberOptions,
    pub rpc: RpcOptions,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bus_id: None,
            broker: BrokerConfig::default(),
            exchange: None,
            content_type: JsonSerializer::CONTENT_TYPE.to_string(),
            publisher: PublisherOptions::default(),
            subscriber: SubscriberOptions::default(),
            rpc: RpcOptions::default(),
        }
    }
}

impl BusConfig {
    /// Load configuration from file(s) and environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| BusError::Configuration(format!("Failed to load configuration: {}", e)))?;

        let mut config: Self = config
            .try_deserialize()
            .map_err(|e| BusError::Configuration(format!("Invalid configuration: {}", e)))?;
        config.apply_exchange();
        Ok(config)
    }

    /// Push the top-level exchange into sections still on the default.
    pub fn apply_exchange(&mut self) {
        let Some(exchange) = self.exchange.clone() else {
            return;
        };
        if self.publisher.exchange == DEFAULT_EXCHANGE {
            self.publisher.exchange = exchange.clone();
        }
        if self.subscriber.exchange == DEFAULT_EXCHANGE {
            self.subscriber.exchange = exchange.clone();
        }
        if self.rpc.exchange == DEFAULT_EXCHANGE {
            self.rpc.exchange = exchange;
        }
    }
}
