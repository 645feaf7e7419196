//! Ordered stage queues.
//!
//! FIFO per ordering key, deduplicated per queue by dedup token. Receives are
//! non-destructive: a received message turns invisible for the visibility timeout and comes
//! back unless it is deleted through its receipt handle. While any message of an ordering key
//! is in flight, no other message of that key is handed out.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::QueueError;
use crate::types::DeleteOutcome;

mod memory;
mod pg;

pub use memory::MockQueueService;
pub use pg::PgQueueService;

/// Largest number of messages accepted by one `send_batch` call.
pub const MAX_SEND_BATCH: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub body: String,
    pub ordering_key: String,
    pub dedup_token: String,
}

impl OutgoingMessage {
    /// A message with a fresh dedup token, so re-sends of the same body are not suppressed.
    pub fn new(body: String, ordering_key: &str) -> Self {
        Self {
            body,
            ordering_key: ordering_key.to_owned(),
            dedup_token: Uuid::now_v7().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub id: i64,
    pub body: String,
    pub ordering_key: String,
    pub receipt_handle: Uuid,
    pub receive_count: i32,
}

#[async_trait]
pub trait QueueService: Send + Sync {
    async fn send(&self, queue: &str, message: OutgoingMessage) -> Result<(), QueueError>;

    /// At most `MAX_SEND_BATCH` messages, all or nothing.
    async fn send_batch(&self, queue: &str, messages: Vec<OutgoingMessage>)
        -> Result<(), QueueError>;

    /// Up to `max` visible messages, oldest first, optionally restricted to one ordering key.
    async fn receive(
        &self,
        queue: &str,
        ordering_key: Option<&str>,
        max: usize,
    ) -> Result<Vec<ReceivedMessage>, QueueError>;

    async fn delete(&self, queue: &str, receipt_handle: &Uuid) -> Result<DeleteOutcome, QueueError>;

    /// Number of messages held by the queue, in flight or not.
    async fn depth(&self, queue: &str) -> Result<u64, QueueError>;
}

pub(crate) fn check_batch_size(messages: &[OutgoingMessage]) -> Result<(), QueueError> {
    if messages.len() > MAX_SEND_BATCH {
        return Err(QueueError::BatchTooLarge(messages.len()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outgoing_messages_get_distinct_tokens() {
        let a = OutgoingMessage::new("{}".to_string(), "adtech-datasetA");
        let b = OutgoingMessage::new("{}".to_string(), "adtech-datasetA");
        assert_ne!(a.dedup_token, b.dedup_token);
        assert_eq!(a.ordering_key, "adtech-datasetA");
    }

    #[test]
    fn batch_size_is_checked() {
        let messages: Vec<_> = (0..11)
            .map(|i| OutgoingMessage::new(i.to_string(), "g"))
            .collect();
        assert!(matches!(
            check_batch_size(&messages),
            Err(QueueError::BatchTooLarge(11))
        ));
        assert!(check_batch_size(&messages[..10]).is_ok());
    }
}
