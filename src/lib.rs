//! Courier - AMQP message bus runtime
//!
//! Typed publish/subscribe, request/reply and transactional delivery over
//! RabbitMQ, with an in-process broker for tests and local development.
//!
//! Messages carry their data contract (name and namespace) in headers;
//! subscribers bind a headers exchange per contract and dispatch each
//! delivery to the handler registered for it.

pub mod broker;
pub mod bus;
pub mod config;
pub mod contract;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod publisher;
pub mod route;
pub mod rpc;
pub mod sender;
pub mod serializer;
pub mod subscriber;
pub mod subscription;
pub mod utils;

pub use bus::{Bus, BusBuilder, BusContext};
pub use config::BusConfig;
pub use contract::{ContractRegistry, DataContract, DataContractKey};
pub use dispatch::{DispatchOutcome, Dispatcher, ErrorSubscriber};
pub use error::{BusError, Result};
pub use message::{BusHeader, BusMessage, MessageData, RawBusMessage};
pub use publisher::{
    ConfirmPublisher, DeliveryFailureHandler, Publisher, PublisherOptions, TransactionalPublisher,
};
pub use route::RouteManager;
pub use rpc::{ReplyRouting, RpcCallError, RpcOptions, RpcPublisher};
pub use serializer::{SerializationError, Serializer, SerializerRegistry};
pub use subscriber::{Receiver, Subscriber, SubscriberOptions};
pub use subscription::{
    blob_fn, handler_fn, reply_fn, Filter, HandlerError, HandlerResult, MessageSubscriptions,
    SubscriptionSet,
};
