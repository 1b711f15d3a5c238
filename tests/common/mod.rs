//! Shared contracts and helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use courier::broker::MemoryBroker;
use courier::{Bus, DataContract};
use serde::{Deserialize, Serialize};

pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: String,
    pub total_cents: u64,
}

impl DataContract for OrderPlaced {
    const NAME: &'static str = "OrderPlaced";
    const NAMESPACE: &'static str = "urn:shop:orders";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuery {
    pub sku: String,
    pub quantity: u32,
}

impl DataContract for PriceQuery {
    const NAME: &'static str = "PriceQuery";
    const NAMESPACE: &'static str = "urn:shop:pricing";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub sku: String,
    pub total_cents: u64,
}

impl DataContract for PriceQuote {
    const NAME: &'static str = "PriceQuote";
    const NAMESPACE: &'static str = "urn:shop:pricing";
}

pub fn order(order_id: &str, total_cents: u64) -> OrderPlaced {
    OrderPlaced {
        order_id: order_id.to_string(),
        total_cents,
    }
}

/// Two buses sharing one in-memory broker, so self-publish filtering does
/// not hide traffic between them.
pub fn bus_pair(broker: &MemoryBroker) -> (Bus, Bus) {
    let client = Bus::builder()
        .bus_id("client")
        .connection(Arc::new(broker.connect()))
        .build()
        .expect("Failed to build client bus");
    let server = Bus::builder()
        .bus_id("server")
        .connection(Arc::new(broker.connect()))
        .build()
        .expect("Failed to build server bus");
    (client, server)
}

/// Poll `condition` until it holds or [`WAIT`] passes.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Condition not reached in time");
}
