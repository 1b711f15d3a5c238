//! Handler contract and typed adapters.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};

use crate::contract::{DataContract, Variant};
use crate::message::{BusMessage, MessageData, RawBusMessage};

/// How a handler refused or failed a message.
///
/// `?` converts any error into [`HandlerError::Failed`]; return
/// [`HandlerError::Reject`] to drop a message without redelivery.
pub enum HandlerError {
    /// Drop this message; never redeliver.
    Reject(String),
    /// Unexpected failure; transactional subscribers redeliver.
    Failed(Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn reject(reason: impl Into<String>) -> Self {
        Self::Reject(reason.into())
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into().into())
    }

    pub fn is_reject(&self) -> bool {
        matches!(self, Self::Reject(_))
    }
}

impl<E> From<E> for HandlerError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(e: E) -> Self {
        Self::Failed(Box::new(e))
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reject(reason) => write!(f, "Message rejected: {}", reason),
            Self::Failed(e) => write!(f, "{}", e),
        }
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reject(reason) => f.debug_tuple("Reject").field(reason).finish(),
            Self::Failed(e) => f.debug_tuple("Failed").field(&e.to_string()).finish(),
        }
    }
}

/// Handler outcome: an optional reply envelope.
pub type HandlerResult = Result<Option<RawBusMessage>, HandlerError>;

/// Type-erased message handler.
///
/// The returned future must cover all work the handler does; the dispatcher
/// acknowledges and replies only once it completes.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: RawBusMessage) -> BoxFuture<'static, HandlerResult>;
}

fn wrong_payload<T>() -> BoxFuture<'static, HandlerResult> {
    future::ready(Err(HandlerError::failed(format!(
        "Payload is not a {}",
        std::any::type_name::<T>()
    ))))
    .boxed()
}

struct FnHandler<T, F> {
    f: F,
    _marker: PhantomData<fn(T)>,
}

impl<T, F, Fut> MessageHandler for FnHandler<T, F>
where
    T: DataContract,
    F: Fn(BusMessage<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle(&self, message: RawBusMessage) -> BoxFuture<'static, HandlerResult> {
        match BusMessage::<T>::from_raw(message) {
            Some(typed) => (self.f)(typed).map(|r| r.map(|()| None)).boxed(),
            None => wrong_payload::<T>(),
        }
    }
}

/// Handler for `T` that sends no reply content.
pub fn handler_fn<T, F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    T: DataContract,
    F: Fn(BusMessage<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler {
        f,
        _marker: PhantomData,
    })
}

struct ReplyHandler<T, R, F> {
    f: F,
    _marker: PhantomData<fn(T) -> R>,
}

impl<T, R, F, Fut> MessageHandler for ReplyHandler<T, R, F>
where
    T: DataContract,
    R: DataContract,
    F: Fn(BusMessage<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
{
    fn handle(&self, message: RawBusMessage) -> BoxFuture<'static, HandlerResult> {
        match BusMessage::<T>::from_raw(message) {
            Some(typed) => (self.f)(typed)
                .map(|r| r.map(|reply| Some(BusMessage::new(reply).into_raw())))
                .boxed(),
            None => wrong_payload::<T>(),
        }
    }
}

/// Handler for `T` answering with an `R`.
pub fn reply_fn<T, R, F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    T: DataContract,
    R: DataContract,
    F: Fn(BusMessage<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
{
    Arc::new(ReplyHandler {
        f,
        _marker: PhantomData,
    })
}

struct BlobHandler<F> {
    f: F,
}

impl<F, Fut> MessageHandler for BlobHandler<F>
where
    F: Fn(BusMessage<Vec<u8>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle(&self, message: RawBusMessage) -> BoxFuture<'static, HandlerResult> {
        let bytes = match &message.data {
            MessageData::Bytes(b) => b.clone(),
            MessageData::Value(p) => match p.downcast_ref::<Vec<u8>>() {
                Some(b) => b.clone(),
                None => return wrong_payload::<Vec<u8>>(),
            },
            MessageData::Empty => Vec::new(),
        };
        let typed = BusMessage::with_raw_envelope(bytes, &message);
        (self.f)(typed).map(|r| r.map(|()| None)).boxed()
    }
}

/// Handler for raw binary-blob payloads.
pub fn blob_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(BusMessage<Vec<u8>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(BlobHandler { f })
}

/// Adapter for one variant of a type family: upcasts the decoded variant to
/// `B` and calls the shared family handler.
pub(crate) struct VariantHandler<B, F> {
    variant: Variant<B>,
    f: Arc<F>,
}

impl<B, F> VariantHandler<B, F> {
    pub(crate) fn new(variant: Variant<B>, f: Arc<F>) -> Self {
        Self { variant, f }
    }
}

impl<B, F, Fut> MessageHandler for VariantHandler<B, F>
where
    B: Send + Sync + 'static,
    F: Fn(BusMessage<B>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle(&self, message: RawBusMessage) -> BoxFuture<'static, HandlerResult> {
        let upcast = match &message.data {
            MessageData::Value(p) => self.variant.upcast(p),
            _ => None,
        };
        match upcast {
            Some(data) => {
                let typed = BusMessage::with_raw_envelope(data, &message);
                (self.f)(typed).map(|r| r.map(|()| None)).boxed()
            }
            None => wrong_payload::<B>(),
        }
    }
}
