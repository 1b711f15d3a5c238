//! Data contracts: the wire identity of payload types.
//!
//! A payload type is identified on the wire by a (name, namespace) pair, its
//! [`DataContractKey`], rather than by its Rust type. Types opt in by
//! implementing [`DataContract`]; the [`ContractRegistry`] caches the mapping
//! in both directions so returned messages carrying only wire metadata can be
//! reconstructed.

mod registry;

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::serializer::SerializationError;

pub use registry::{ContractRegistry, Variant};

/// Type-erased deserialized payload.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// Namespace used by [`DataContract`] implementations that don't set one.
pub const DEFAULT_NAMESPACE: &str = "urn:courier:contracts";

/// Namespace of the reserved built-in contracts.
const BUILTIN_NAMESPACE: &str = "urn:courier:builtin";

/// Wire identity of a payload type. Equality is structural.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataContractKey {
    name: String,
    namespace: String,
}

impl DataContractKey {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Reserved key for raw byte payloads with no contract.
    pub fn binary_blob() -> Self {
        Self::new("BinaryBlob", BUILTIN_NAMESPACE)
    }

    /// Reserved key for "no content" replies.
    pub fn void() -> Self {
        Self::new("Void", BUILTIN_NAMESPACE)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn is_binary_blob(&self) -> bool {
        self.namespace == BUILTIN_NAMESPACE && self.name == "BinaryBlob"
    }

    pub fn is_void(&self) -> bool {
        self.namespace == BUILTIN_NAMESPACE && self.name == "Void"
    }
}

impl fmt::Display for DataContractKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

/// A payload type that can travel over the bus.
///
/// ```ignore
/// #[derive(Clone, Serialize, Deserialize)]
/// struct OrderPlaced { id: u64 }
///
/// impl DataContract for OrderPlaced {
///     const NAME: &'static str = "OrderPlaced";
///     const NAMESPACE: &'static str = "urn:shop:orders";
/// }
/// ```
pub trait DataContract: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const NAME: &'static str;
    const NAMESPACE: &'static str = DEFAULT_NAMESPACE;

    fn contract_key() -> DataContractKey {
        DataContractKey::new(Self::NAME, Self::NAMESPACE)
    }
}

type EncodeFn = fn(&(dyn Any + Send + Sync)) -> Result<serde_json::Value, SerializationError>;
type DecodeFn = fn(serde_json::Value) -> Result<Payload, SerializationError>;

#[derive(Clone, Copy)]
enum Codec {
    /// Raw bytes, never transformed.
    Blob,
    /// Bridged through the serde data model.
    Serde { encode: EncodeFn, decode: DecodeFn },
}

/// Runtime descriptor of a registered payload type.
///
/// Holds the type's identity, its contract key, and the functions that move
/// it in and out of the serde data model so codecs stay object-safe.
#[derive(Clone)]
pub struct ContractType {
    type_id: TypeId,
    type_name: &'static str,
    key: DataContractKey,
    codec: Codec,
}

impl ContractType {
    /// Descriptor for a [`DataContract`] type.
    pub fn of<T: DataContract>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            key: T::contract_key(),
            codec: Codec::Serde {
                encode: encode_value::<T>,
                decode: decode_value::<T>,
            },
        }
    }

    /// Descriptor for raw byte payloads (`Vec<u8>`).
    pub fn blob() -> Self {
        Self {
            type_id: TypeId::of::<Vec<u8>>(),
            type_name: std::any::type_name::<Vec<u8>>(),
            key: DataContractKey::binary_blob(),
            codec: Codec::Blob,
        }
    }

    pub fn rust_type(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn key(&self) -> &DataContractKey {
        &self.key
    }

    pub fn is_blob(&self) -> bool {
        matches!(self.codec, Codec::Blob)
    }

    /// Move a payload of this type into the serde data model.
    pub fn to_value(&self, payload: &Payload) -> Result<serde_json::Value, SerializationError> {
        match self.codec {
            Codec::Serde { encode, .. } => encode(&**payload),
            Codec::Blob => Err(SerializationError::NotSerializable(self.type_name)),
        }
    }

    /// Build a payload of this type from the serde data model.
    pub fn from_value(&self, value: serde_json::Value) -> Result<Payload, SerializationError> {
        match self.codec {
            Codec::Serde { decode, .. } => decode(value),
            Codec::Blob => Err(SerializationError::NotSerializable(self.type_name)),
        }
    }
}

impl fmt::Debug for ContractType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContractType")
            .field("type_name", &self.type_name)
            .field("key", &self.key)
            .field("blob", &self.is_blob())
            .finish()
    }
}

fn encode_value<T: DataContract>(
    data: &(dyn Any + Send + Sync),
) -> Result<serde_json::Value, SerializationError> {
    let typed = data
        .downcast_ref::<T>()
        .ok_or(SerializationError::TypeMismatch {
            expected: std::any::type_name::<T>(),
        })?;
    serde_json::to_value(typed).map_err(|e| SerializationError::Encode(e.to_string()))
}

fn decode_value<T: DataContract>(value: serde_json::Value) -> Result<Payload, SerializationError> {
    let typed: T =
        serde_json::from_value(value).map_err(|e| SerializationError::Decode(e.to_string()))?;
    Ok(Arc::new(typed))
}

/// Runtime type id of an erased payload (not of its `Arc`).
pub fn payload_type_id(payload: &Payload) -> TypeId {
    let any: &dyn Any = &**payload;
    any.type_id()
}
