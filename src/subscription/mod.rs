//! Subscription registry.
//!
//! A subscription ties one payload type to one handler and a
//! [`MessageFilterInfo`]. Subscribers keep at most one subscription per exact
//! type; the first registration wins.
//!
//! Handlers are registered explicitly, either one at a time on a
//! [`Subscriber`](crate::subscriber::Subscriber) or as a batch through
//! [`MessageSubscriptions`] and a [`SubscriptionSet`].

mod handler;

use std::any::TypeId;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::broker::{FieldMap, HeaderValue};
use crate::contract::{ContractRegistry, ContractType, DataContract, DataContractKey};
use crate::error::{BusError, Result};
use crate::message::{BusHeader, BusMessage, CONTRACT_NAMESPACE_HEADER, CONTRACT_NAME_HEADER};

pub use handler::{
    blob_fn, handler_fn, reply_fn, HandlerError, HandlerResult, MessageHandler,
};
pub(crate) use handler::VariantHandler;

/// Per-subscription filter options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    headers: Vec<BusHeader>,
    receive_self_publish: Option<bool>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only receive messages carrying `name = value`.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(BusHeader::new(name, value));
        self
    }

    /// Override the subscriber's default self-publish setting.
    pub fn receive_self_publish(mut self, receive: bool) -> Self {
        self.receive_self_publish = Some(receive);
        self
    }

    /// Resolve against the subscriber default.
    pub fn into_info(self, key: DataContractKey, default_self_publish: bool) -> MessageFilterInfo {
        MessageFilterInfo {
            contract_key: key,
            receive_self_publish: self.receive_self_publish.unwrap_or(default_self_publish),
            filter_headers: self.headers,
        }
    }
}

/// Filter of one registered subscription. Drives both the local dispatch
/// filter and the broker binding arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFilterInfo {
    pub contract_key: DataContractKey,
    pub receive_self_publish: bool,
    pub filter_headers: Vec<BusHeader>,
}

impl MessageFilterInfo {
    /// Headers-exchange binding arguments: all of the contract headers and
    /// every filter header must match.
    pub fn binding_arguments(&self) -> FieldMap {
        let mut args = FieldMap::new();
        args.insert("x-match".to_string(), HeaderValue::from("all"));
        args.insert(
            CONTRACT_NAME_HEADER.to_string(),
            HeaderValue::from(self.contract_key.name()),
        );
        args.insert(
            CONTRACT_NAMESPACE_HEADER.to_string(),
            HeaderValue::from(self.contract_key.namespace()),
        );
        for header in &self.filter_headers {
            args.insert(header.name.clone(), HeaderValue::from(header.value.as_str()));
        }
        args
    }

    /// True when every filter header is present with an equal value.
    pub fn matches_headers(&self, headers: &[BusHeader]) -> bool {
        self.filter_headers
            .iter()
            .all(|f| headers.iter().any(|h| h.name == f.name && h.value == f.value))
    }

    /// True when a message from `sender_bus_id` must be skipped by a
    /// subscriber living on `own_bus_id`.
    pub fn excludes_self_publish(&self, sender_bus_id: &str, own_bus_id: &str) -> bool {
        !self.receive_self_publish && sender_bus_id == own_bus_id
    }
}

/// One registered subscription.
pub struct Subscription {
    pub contract: Arc<ContractType>,
    pub handler: Arc<dyn MessageHandler>,
    pub filter: MessageFilterInfo,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("contract", &self.contract)
            .field("filter", &self.filter)
            .finish()
    }
}

/// Concurrent type -> subscription map with a contract-key index.
#[derive(Default)]
pub struct SubscriptionRegistry {
    by_type: DashMap<TypeId, Arc<Subscription>>,
    by_key: DashMap<DataContractKey, Arc<Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless the type is already subscribed. Returns whether the
    /// subscription was added.
    pub fn insert(&self, subscription: Subscription) -> bool {
        match self.by_type.entry(subscription.contract.rust_type()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                let subscription = Arc::new(subscription);
                self.by_key.insert(
                    subscription.contract.key().clone(),
                    Arc::clone(&subscription),
                );
                vacant.insert(subscription);
                true
            }
        }
    }

    pub fn remove(&self, type_id: TypeId) -> Option<Arc<Subscription>> {
        let (_, subscription) = self.by_type.remove(&type_id)?;
        self.by_key.remove(subscription.contract.key());
        Some(subscription)
    }

    /// Subscription whose type maps to `key`.
    pub fn by_key(&self, key: &DataContractKey) -> Option<Arc<Subscription>> {
        self.by_key.get(key).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, type_id: TypeId) -> bool {
        self.by_type.contains_key(&type_id)
    }

    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}

/// A subscription waiting to be applied by a subscriber.
pub struct SubscriptionRequest {
    pub contract: Arc<ContractType>,
    pub handler: Arc<dyn MessageHandler>,
    pub filter: Filter,
}

/// Batch of handler registrations collected from one object.
///
/// Registering the same payload type twice in one set is a configuration
/// error and fails immediately.
pub struct SubscriptionSet {
    contracts: Arc<ContractRegistry>,
    requests: Vec<SubscriptionRequest>,
    types: HashSet<TypeId>,
}

impl SubscriptionSet {
    pub fn new(contracts: Arc<ContractRegistry>) -> Self {
        Self {
            contracts,
            requests: Vec::new(),
            types: HashSet::new(),
        }
    }

    fn push(
        &mut self,
        contract: Arc<ContractType>,
        handler: Arc<dyn MessageHandler>,
        filter: Filter,
    ) -> Result<()> {
        if !self.types.insert(contract.rust_type()) {
            return Err(BusError::Configuration(format!(
                "{} has more than one handler",
                contract.type_name()
            )));
        }
        self.requests.push(SubscriptionRequest {
            contract,
            handler,
            filter,
        });
        Ok(())
    }

    /// Handle `T` without reply content.
    pub fn on<T, F, Fut>(&mut self, filter: Filter, f: F) -> Result<()>
    where
        T: DataContract,
        F: Fn(BusMessage<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        let contract = self.contracts.register::<T>()?;
        self.push(contract, handler_fn(f), filter)
    }

    /// Handle `T`, replying with an `R`.
    pub fn reply<T, R, F, Fut>(&mut self, filter: Filter, f: F) -> Result<()>
    where
        T: DataContract,
        R: DataContract,
        F: Fn(BusMessage<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, HandlerError>> + Send + 'static,
    {
        let contract = self.contracts.register::<T>()?;
        self.contracts.register::<R>()?;
        self.push(contract, reply_fn(f), filter)
    }

    /// Handle raw binary-blob payloads.
    pub fn blob<F, Fut>(&mut self, filter: Filter, f: F) -> Result<()>
    where
        F: Fn(BusMessage<Vec<u8>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        let contract = self
            .contracts
            .by_key(&DataContractKey::binary_blob())
            .ok_or_else(|| BusError::UnknownContract("BinaryBlob".to_string()))?;
        self.push(contract, blob_fn(f), filter)
    }

    /// Handle every registered variant of the family `B`.
    pub fn family<B, F, Fut>(&mut self, filter: Filter, f: F) -> Result<()>
    where
        B: Send + Sync + 'static,
        F: Fn(BusMessage<B>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        let variants = self.contracts.variants::<B>();
        if variants.is_empty() {
            return Err(BusError::Configuration(format!(
                "No variants registered for {}",
                std::any::type_name::<B>()
            )));
        }
        let f = Arc::new(f);
        for variant in variants {
            let contract = Arc::clone(variant.contract());
            let handler: Arc<dyn MessageHandler> =
                Arc::new(VariantHandler::new(variant, Arc::clone(&f)));
            self.push(contract, handler, filter.clone())?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn into_requests(self) -> Vec<SubscriptionRequest> {
        self.requests
    }
}

/// An object that declares its own message handlers.
///
/// ```ignore
/// impl MessageSubscriptions for Billing {
///     fn subscriptions(self: Arc<Self>, set: &mut SubscriptionSet) -> Result<()> {
///         let this = Arc::clone(&self);
///         set.on(Filter::new().header("region", "eu"), move |msg: BusMessage<OrderPlaced>| {
///             let this = Arc::clone(&this);
///             async move { this.charge(msg.data).await }
///         })
///     }
/// }
/// ```
pub trait MessageSubscriptions: Send + Sync + 'static {
    fn subscriptions(self: Arc<Self>, set: &mut SubscriptionSet) -> Result<()>;
}
