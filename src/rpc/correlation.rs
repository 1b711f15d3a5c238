//! Correlation map for outstanding RPC calls.
//!
//! Each call is resolved exactly once by whichever comes first: reply,
//! broker return, timeout or cancellation. Removal from the map is the only
//! synchronisation point; the path that removes the entry completes it, every
//! other path finds nothing and does nothing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{RpcCallError, RpcResult};
use crate::broker::Delivery;
use crate::contract::ContractType;
use crate::error::{BusError, Result};
use crate::message::{MessageData, RawBusMessage};
use crate::sender::{contract_key_from_properties, envelope_from_properties};
use crate::serializer::SerializerRegistry;

struct PendingCall {
    /// `None` when the caller expects no reply content.
    reply: Option<Arc<ContractType>>,
    sender: oneshot::Sender<RpcResult>,
    created_at: Instant,
    timer: Option<JoinHandle<()>>,
}

/// Call counters.
#[derive(Debug, Default)]
pub struct RpcStats {
    pub registered: AtomicU64,
    pub completed: AtomicU64,
    pub timeouts: AtomicU64,
    pub cancelled: AtomicU64,
    pub not_routed: AtomicU64,
}

struct Inner {
    pending: DashMap<String, PendingCall>,
    serializers: Arc<SerializerRegistry>,
    stats: RpcStats,
}

/// Client-side correlation engine shared by every facade of one RPC
/// publisher.
#[derive(Clone)]
pub struct CorrelationEngine {
    inner: Arc<Inner>,
}

impl CorrelationEngine {
    pub fn new(serializers: Arc<SerializerRegistry>) -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: DashMap::new(),
                serializers,
                stats: RpcStats::default(),
            }),
        }
    }

    /// Register a pending call and arm its timer.
    ///
    /// The receiver yields the call's single resolution. Fails if
    /// `correlation_id` is already pending or `timeout` is zero.
    pub fn register(
        &self,
        correlation_id: &str,
        reply: Option<Arc<ContractType>>,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<RpcResult>> {
        if timeout.is_zero() {
            return Err(BusError::Configuration(
                "RPC calls require a non-zero timeout".to_string(),
            ));
        }

        let (sender, receiver) = oneshot::channel();
        match self.inner.pending.entry(correlation_id.to_string()) {
            Entry::Occupied(_) => {
                return Err(BusError::Configuration(format!(
                    "Correlation id {} is already pending",
                    correlation_id
                )));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(PendingCall {
                    reply,
                    sender,
                    created_at: Instant::now(),
                    timer: None,
                });
            }
        }
        self.inner.stats.registered.fetch_add(1, Ordering::Relaxed);

        let timer = tokio::spawn(expire(
            Arc::downgrade(&self.inner),
            correlation_id.to_string(),
            timeout,
        ));
        match self.inner.pending.get_mut(correlation_id) {
            Some(mut call) => call.timer = Some(timer),
            // Resolved before the timer was attached
            None => timer.abort(),
        }

        debug!(correlation_id = %correlation_id, timeout_ms = timeout.as_millis() as u64, "Registered RPC call");
        Ok(receiver)
    }

    /// Resolve the call a reply delivery belongs to. Returns false if no call
    /// with its correlation id is pending.
    pub fn on_reply(&self, delivery: &Delivery) -> bool {
        let Some(correlation_id) = delivery.properties.correlation_id.as_deref() else {
            debug!("Reply without correlation id ignored");
            return false;
        };
        let Some(call) = self.inner.take(correlation_id) else {
            debug!(correlation_id = %correlation_id, "Reply for unknown or expired call");
            return false;
        };
        let result = self.reply_result(delivery, call.reply.as_deref());
        self.inner.stats.completed.fetch_add(1, Ordering::Relaxed);
        complete(correlation_id, call, result);
        true
    }

    fn reply_result(&self, delivery: &Delivery, reply: Option<&ContractType>) -> RpcResult {
        let mut envelope = envelope_from_properties(&delivery.properties, delivery.body.clone());

        if let Some(reason) = envelope.header(crate::message::REJECTED_HEADER) {
            return Err(RpcCallError::Reject(reason.to_string()));
        }
        if let Some(text) = envelope.exception() {
            return Err(RpcCallError::HandlerError(text.to_string()));
        }

        // An empty body and a call without a reply type are the same void
        // success.
        let Some(contract) = reply.filter(|_| !delivery.body.is_empty()) else {
            envelope.data = MessageData::Empty;
            return Ok(envelope);
        };

        let key = contract_key_from_properties(&delivery.properties);
        let data = self
            .inner
            .serializers
            .resolve(delivery.properties.content_type.as_deref())
            .and_then(|s| s.deserialize(&key, contract, &delivery.body))
            .map_err(|e| RpcCallError::SerializationError(e.to_string()))?;
        envelope.data = data;
        Ok(envelope)
    }

    /// Resolve the call a returned request belongs to with `NotRouted`.
    pub fn on_returned(&self, reply_code: u16, reply_text: &str, message: &RawBusMessage) -> bool {
        let Some(call) = self.inner.take(&message.correlation_id) else {
            return false;
        };
        self.inner.stats.not_routed.fetch_add(1, Ordering::Relaxed);
        complete(
            &message.correlation_id,
            call,
            Err(RpcCallError::NotRouted {
                code: reply_code,
                text: reply_text.to_string(),
            }),
        );
        true
    }

    /// Cancel a pending call. Returns false if it already resolved.
    pub fn cancel(&self, correlation_id: &str) -> bool {
        let Some(call) = self.inner.take(correlation_id) else {
            return false;
        };
        self.inner.stats.cancelled.fetch_add(1, Ordering::Relaxed);
        complete(correlation_id, call, Err(RpcCallError::Cancelled));
        true
    }

    /// Cancel every pending call.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<String> = self
            .inner
            .pending
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.iter().filter(|id| self.cancel(id)).count()
    }

    /// Drop a pending call without resolving it.
    pub(crate) fn forget(&self, correlation_id: &str) {
        if let Some(call) = self.inner.take(correlation_id) {
            if let Some(timer) = call.timer {
                timer.abort();
            }
        }
    }

    pub fn is_pending(&self, correlation_id: &str) -> bool {
        self.inner.pending.contains_key(correlation_id)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn stats(&self) -> &RpcStats {
        &self.inner.stats
    }
}

impl Inner {
    fn take(&self, correlation_id: &str) -> Option<PendingCall> {
        self.pending.remove(correlation_id).map(|(_, call)| call)
    }
}

fn complete(correlation_id: &str, mut call: PendingCall, result: RpcResult) {
    if let Some(timer) = call.timer.take() {
        timer.abort();
    }
    let elapsed_ms = call.created_at.elapsed().as_millis() as u64;
    match &result {
        Ok(_) => debug!(correlation_id = %correlation_id, elapsed_ms, "RPC call completed"),
        Err(e) => debug!(correlation_id = %correlation_id, elapsed_ms, error = %e, "RPC call failed"),
    }
    if call.sender.send(result).is_err() {
        debug!(correlation_id = %correlation_id, "RPC caller went away before resolution");
    }
}

async fn expire(inner: Weak<Inner>, correlation_id: String, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let Some(mut call) = inner.take(&correlation_id) else {
        return;
    };
    inner.stats.timeouts.fetch_add(1, Ordering::Relaxed);
    warn!(correlation_id = %correlation_id, timeout_ms = timeout.as_millis() as u64, "RPC call timed out");
    // This task is the timer; nothing left to abort.
    call.timer = None;
    complete(&correlation_id, call, Err(RpcCallError::TimeOut));
}
