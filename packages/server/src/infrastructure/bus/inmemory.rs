//! In-process bus for single-instance runs and tests.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

use crate::domain::{
    BusError, BusMessage, BusSubscription, MessageBus, subject::matches_subject,
};

/// Default number of in-flight messages a slow subscriber may lag behind.
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Bus backed by a tokio broadcast channel; subscribers filter by pattern.
pub struct InMemoryBus {
    tx: broadcast::Sender<BusMessage>,
}

impl InMemoryBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        // no subscribers is not an error on a pub/sub bus
        let _ = self.tx.send(BusMessage {
            subject: subject.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<BusSubscription, BusError> {
        let rx = self.tx.subscribe();
        let pattern = pattern.to_string();

        let messages = stream::unfold((rx, pattern), |(mut rx, pattern)| async move {
            loop {
                match rx.recv().await {
                    Ok(msg) if matches_subject(&pattern, &msg.subject) => {
                        return Some((msg, (rx, pattern)));
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Subscriber for '{}' lagged, {} messages dropped", pattern, skipped);
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });

        Ok(Box::pin(messages))
    }
}
