//! Publish/subscribe bus abstraction.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

use super::BusError;

/// A message received from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Bytes,
}

/// Stream of messages for one subscription. Ends when the bus goes away.
pub type BusSubscription = BoxStream<'static, BusMessage>;

/// External publish/subscribe transport
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Fire-and-forget publish
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError>;

    /// Subscribe to a subject or wildcard pattern
    async fn subscribe(&self, pattern: &str) -> Result<BusSubscription, BusError>;
}
