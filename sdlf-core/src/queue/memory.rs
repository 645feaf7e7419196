use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::{check_batch_size, OutgoingMessage, QueueService, ReceivedMessage};
use crate::error::QueueError;
use crate::types::DeleteOutcome;

#[derive(Debug, Clone)]
struct StoredMessage {
    id: i64,
    body: String,
    ordering_key: String,
    dedup_token: String,
    visible_at: Duration,
    receive_count: i32,
    receipt_handle: Option<Uuid>,
}

impl StoredMessage {
    fn in_flight(&self, now: Duration) -> bool {
        self.receive_count > 0 && self.visible_at > now
    }
}

#[derive(Default)]
struct State {
    // Time is manual: only `advance` moves it
    now: Duration,
    next_id: i64,
    queues: BTreeMap<String, Vec<StoredMessage>>,
    sent: BTreeMap<String, Vec<OutgoingMessage>>,
    send_calls: usize,
    receive_calls: usize,
    delete_calls: usize,
    unavailable: HashSet<String>,
}

/// In-memory queue service with the same visibility and ordering semantics as the postgres
/// one, a manual clock, and call counters for assertions.
#[derive(Clone)]
pub struct MockQueueService {
    visibility_timeout: Duration,
    state: Arc<Mutex<State>>,
}

impl Default for MockQueueService {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl MockQueueService {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            visibility_timeout,
            state: Default::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.lock().now += by;
    }

    /// Makes every call against `queue` fail with `QueueError::Unavailable`.
    pub fn make_unavailable(&self, queue: &str) {
        self.lock().unavailable.insert(queue.to_owned());
    }

    /// Every message successfully sent to `queue`, in send order.
    pub fn sent(&self, queue: &str) -> Vec<OutgoingMessage> {
        self.lock().sent.get(queue).cloned().unwrap_or_default()
    }

    /// Bodies currently held by `queue`, in flight or not.
    pub fn bodies(&self, queue: &str) -> Vec<String> {
        self.lock()
            .queues
            .get(queue)
            .map(|messages| messages.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn send_calls(&self) -> usize {
        self.lock().send_calls
    }

    pub fn receive_calls(&self) -> usize {
        self.lock().receive_calls
    }

    pub fn delete_calls(&self) -> usize {
        self.lock().delete_calls
    }

    fn check_available(state: &State, queue: &str) -> Result<(), QueueError> {
        if state.unavailable.contains(queue) {
            return Err(QueueError::Unavailable(queue.to_owned()));
        }
        Ok(())
    }

    fn push(state: &mut State, queue: &str, message: OutgoingMessage) {
        let stored = state.queues.entry(queue.to_owned()).or_default();
        if stored.iter().any(|m| m.dedup_token == message.dedup_token) {
            return;
        }
        state.next_id += 1;
        stored.push(StoredMessage {
            id: state.next_id,
            body: message.body.clone(),
            ordering_key: message.ordering_key.clone(),
            dedup_token: message.dedup_token.clone(),
            visible_at: state.now,
            receive_count: 0,
            receipt_handle: None,
        });
        state.sent.entry(queue.to_owned()).or_default().push(message);
    }
}

#[async_trait]
impl QueueService for MockQueueService {
    async fn send(&self, queue: &str, message: OutgoingMessage) -> Result<(), QueueError> {
        let mut state = self.lock();
        state.send_calls += 1;
        Self::check_available(&state, queue)?;
        Self::push(&mut state, queue, message);
        Ok(())
    }

    async fn send_batch(
        &self,
        queue: &str,
        messages: Vec<OutgoingMessage>,
    ) -> Result<(), QueueError> {
        let mut state = self.lock();
        state.send_calls += 1;
        Self::check_available(&state, queue)?;
        check_batch_size(&messages)?;
        for message in messages {
            Self::push(&mut state, queue, message);
        }
        Ok(())
    }

    async fn receive(
        &self,
        queue: &str,
        ordering_key: Option<&str>,
        max: usize,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let mut state = self.lock();
        state.receive_calls += 1;
        Self::check_available(&state, queue)?;

        let now = state.now;
        let visible_until = now + self.visibility_timeout;
        let Some(messages) = state.queues.get_mut(queue) else {
            return Ok(vec![]);
        };

        let blocked: HashSet<String> = messages
            .iter()
            .filter(|m| m.in_flight(now))
            .map(|m| m.ordering_key.clone())
            .collect();

        let mut received = Vec::new();
        for message in messages.iter_mut() {
            if received.len() >= max {
                break;
            }
            if message.visible_at > now || blocked.contains(&message.ordering_key) {
                continue;
            }
            if ordering_key.is_some_and(|key| key != message.ordering_key) {
                continue;
            }
            let receipt_handle = Uuid::new_v4();
            message.visible_at = visible_until;
            message.receive_count += 1;
            message.receipt_handle = Some(receipt_handle);
            received.push(ReceivedMessage {
                id: message.id,
                body: message.body.clone(),
                ordering_key: message.ordering_key.clone(),
                receipt_handle,
                receive_count: message.receive_count,
            });
        }
        Ok(received)
    }

    async fn delete(&self, queue: &str, receipt_handle: &Uuid) -> Result<DeleteOutcome, QueueError> {
        let mut state = self.lock();
        state.delete_calls += 1;
        Self::check_available(&state, queue)?;

        let Some(messages) = state.queues.get_mut(queue) else {
            return Ok(DeleteOutcome::NotFound);
        };
        let before = messages.len();
        messages.retain(|m| m.receipt_handle.as_ref() != Some(receipt_handle));
        if messages.len() < before {
            Ok(DeleteOutcome::Deleted)
        } else {
            Ok(DeleteOutcome::NotFound)
        }
    }

    async fn depth(&self, queue: &str) -> Result<u64, QueueError> {
        let state = self.lock();
        Self::check_available(&state, queue)?;
        Ok(state.queues.get(queue).map_or(0, |m| m.len() as u64))
    }
}
