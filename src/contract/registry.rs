//! Process-wide type <-> contract key cache and the explicit variant table.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::{ContractType, DataContract, DataContractKey, Payload};
use crate::error::{BusError, Result};

/// One concrete member of a closed type family `B`.
///
/// Subscribing to `B` expands to one subscription per registered variant;
/// `upcast` turns the variant's decoded payload into the family type.
pub struct Variant<B> {
    contract: Arc<ContractType>,
    upcast: fn(&Payload) -> Option<B>,
}

impl<B> Variant<B> {
    pub fn contract(&self) -> &Arc<ContractType> {
        &self.contract
    }

    pub fn upcast(&self, payload: &Payload) -> Option<B> {
        (self.upcast)(payload)
    }
}

impl<B> Clone for Variant<B> {
    fn clone(&self) -> Self {
        Self {
            contract: Arc::clone(&self.contract),
            upcast: self.upcast,
        }
    }
}

fn upcast_variant<B, T>(payload: &Payload) -> Option<B>
where
    T: DataContract + Into<B>,
{
    payload.downcast_ref::<T>().cloned().map(Into::into)
}

#[derive(Default)]
struct Inner {
    by_type: HashMap<TypeId, Arc<ContractType>>,
    by_key: HashMap<DataContractKey, Arc<ContractType>>,
    /// Family type id -> `Vec<Variant<B>>`.
    variants: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

/// Registry of payload types known to a bus.
///
/// Mapping a type to its key happens once; the reverse lookup is used when the
/// broker hands back a message with only wire metadata available.
pub struct ContractRegistry {
    inner: RwLock<Inner>,
}

impl ContractRegistry {
    /// Create a registry with the binary-blob contract pre-registered.
    pub fn new() -> Self {
        let blob = Arc::new(ContractType::blob());
        let mut inner = Inner::default();
        inner.by_type.insert(blob.rust_type(), Arc::clone(&blob));
        inner.by_key.insert(blob.key().clone(), blob);
        Self {
            inner: RwLock::new(inner),
        }
    }

    /// Register `T`, returning its cached descriptor.
    ///
    /// Registering the same type twice is a no-op. Mapping a key that is
    /// already owned by a different type is a configuration error.
    pub fn register<T: DataContract>(&self) -> Result<Arc<ContractType>> {
        if let Some(existing) = self.inner.read().by_type.get(&TypeId::of::<T>()) {
            return Ok(Arc::clone(existing));
        }
        self.insert(ContractType::of::<T>())
    }

    fn insert(&self, contract: ContractType) -> Result<Arc<ContractType>> {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.by_type.get(&contract.rust_type()) {
            return Ok(Arc::clone(existing));
        }
        if contract.key().is_void() || contract.key().is_binary_blob() {
            return Err(BusError::Configuration(format!(
                "Contract key {} is reserved",
                contract.key()
            )));
        }
        if let Some(owner) = inner.by_key.get(contract.key()) {
            return Err(BusError::Configuration(format!(
                "Contract key {} is mapped to both {} and {}",
                contract.key(),
                owner.type_name(),
                contract.type_name()
            )));
        }

        debug!(
            type_name = contract.type_name(),
            contract = %contract.key(),
            "Registered data contract"
        );

        let contract = Arc::new(contract);
        inner
            .by_type
            .insert(contract.rust_type(), Arc::clone(&contract));
        inner
            .by_key
            .insert(contract.key().clone(), Arc::clone(&contract));
        Ok(contract)
    }

    /// Register `T` as a concrete variant of the family `B`.
    pub fn register_variant<B, T>(&self) -> Result<()>
    where
        B: 'static,
        T: DataContract + Into<B>,
    {
        let contract = self.register::<T>()?;
        let mut inner = self.inner.write();
        let entry = inner
            .variants
            .entry(TypeId::of::<B>())
            .or_insert_with(|| Box::new(Vec::<Variant<B>>::new()));
        let list = entry.downcast_mut::<Vec<Variant<B>>>().ok_or_else(|| {
            BusError::Configuration(format!(
                "Variant table for {} is corrupted",
                std::any::type_name::<B>()
            ))
        })?;
        if list.iter().all(|v| v.contract.rust_type() != contract.rust_type()) {
            list.push(Variant {
                contract,
                upcast: upcast_variant::<B, T>,
            });
        }
        Ok(())
    }

    /// All registered variants of the family `B`, in registration order.
    pub fn variants<B: 'static>(&self) -> Vec<Variant<B>> {
        self.inner
            .read()
            .variants
            .get(&TypeId::of::<B>())
            .and_then(|entry| entry.downcast_ref::<Vec<Variant<B>>>())
            .cloned()
            .unwrap_or_default()
    }

    pub fn by_type_id(&self, type_id: TypeId) -> Option<Arc<ContractType>> {
        self.inner.read().by_type.get(&type_id).cloned()
    }

    /// Reverse lookup: key -> type.
    pub fn by_key(&self, key: &DataContractKey) -> Option<Arc<ContractType>> {
        self.inner.read().by_key.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ContractRegistry {
    fn default() -> Self {
        Self::new()
    }
}
