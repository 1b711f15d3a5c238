//! Process-level helpers.

pub mod bootstrap;
#[cfg(feature = "amqp")]
pub mod retry;
