//! Reply routing: where RPC replies are sent and who drains them.

use std::sync::Arc;

use futures::StreamExt;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::CorrelationEngine;
use crate::broker::{
    BrokerChannel, ConsumeOptions, ExchangeKind, FieldMap, PublicationAddress, QueueOptions,
    DIRECT_REPLY_QUEUE,
};
use crate::error::{BusError, Result};

/// How replies find their way back to the publisher. Chosen once per
/// publisher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ReplyRouting {
    /// The broker's direct reply-to pseudo queue. No queue is declared.
    /// Unusable when requests cross federated brokers.
    #[default]
    FastReply,
    /// An exclusive, auto-delete queue declared for this publisher.
    ///
    /// With a non-empty `exchange` the queue is bound there under
    /// `routing_key` (generated when absent) and the reply-to is a
    /// publication address; otherwise the reply-to is the bare queue name.
    DedicatedQueue {
        #[serde(default)]
        exchange: String,
        #[serde(default = "default_reply_exchange_kind")]
        exchange_kind: ExchangeKind,
        #[serde(default)]
        routing_key: Option<String>,
    },
}

fn default_reply_exchange_kind() -> ExchangeKind {
    ExchangeKind::Direct
}

impl ReplyRouting {
    /// Dedicated queue reached through the default exchange.
    pub fn dedicated() -> Self {
        Self::DedicatedQueue {
            exchange: String::new(),
            exchange_kind: ExchangeKind::Direct,
            routing_key: None,
        }
    }

    /// Dedicated queue bound to `exchange`.
    pub fn dedicated_on(
        exchange: impl Into<String>,
        exchange_kind: ExchangeKind,
        routing_key: Option<String>,
    ) -> Self {
        Self::DedicatedQueue {
            exchange: exchange.into(),
            exchange_kind,
            routing_key,
        }
    }
}

/// A running reply consumer.
pub(crate) struct ReplyEndpoint {
    /// Value advertised in the reply-to property.
    pub reply_to: String,
    pub consumer_tag: String,
    pub task: JoinHandle<()>,
}

/// Set up reply routing on `channel` and start feeding replies to `engine`.
pub(crate) async fn start_reply_consumer(
    channel: &Arc<dyn BrokerChannel>,
    routing: &ReplyRouting,
    engine: CorrelationEngine,
) -> Result<ReplyEndpoint> {
    let (queue, reply_to, exclusive) = match routing {
        ReplyRouting::FastReply => (
            DIRECT_REPLY_QUEUE.to_string(),
            DIRECT_REPLY_QUEUE.to_string(),
            false,
        ),
        ReplyRouting::DedicatedQueue {
            exchange,
            exchange_kind,
            routing_key,
        } => {
            let queue = channel
                .declare_queue("", QueueOptions::private(), FieldMap::new())
                .await?;
            let reply_to = if exchange.is_empty() {
                queue.clone()
            } else {
                let routing_key = routing_key
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                channel
                    .bind_queue(&queue, exchange, &routing_key, FieldMap::new())
                    .await?;
                PublicationAddress::new(*exchange_kind, exchange.as_str(), routing_key).to_string()
            };
            (queue, reply_to, true)
        }
    };

    let consumer_tag = format!("courier-rpc-{}", uuid::Uuid::new_v4());
    let mut replies = channel
        .consume(
            &queue,
            ConsumeOptions {
                consumer_tag: consumer_tag.clone(),
                no_ack: true,
                exclusive,
                arguments: FieldMap::new(),
            },
        )
        .await
        .map_err(|e| BusError::Subscribe(format!("Failed to consume replies: {}", e)))?;

    let task = tokio::spawn(async move {
        while let Some(delivery) = replies.next().await {
            engine.on_reply(&delivery);
        }
        debug!("Reply consumer stopped");
    });

    info!(queue = %queue, reply_to = %reply_to, "Reply consumer started");
    Ok(ReplyEndpoint {
        reply_to,
        consumer_tag,
        task,
    })
}
