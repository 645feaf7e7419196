use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::{check_batch_size, OutgoingMessage, QueueService, ReceivedMessage};
use crate::error::QueueError;
use crate::types::DeleteOutcome;

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: i64,
    body: String,
    message_group: String,
    receipt_handle: Uuid,
    receive_count: i32,
}

impl From<MessageRow> for ReceivedMessage {
    fn from(row: MessageRow) -> Self {
        ReceivedMessage {
            id: row.id,
            body: row.body,
            ordering_key: row.message_group,
            receipt_handle: row.receipt_handle,
            receive_count: row.receive_count,
        }
    }
}

/// Stage queues stored in `sdlf_queue_messages`.
#[derive(Clone)]
pub struct PgQueueService {
    pool: PgPool,
    visibility_timeout: Duration,
}

impl PgQueueService {
    pub fn new(pool: PgPool, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            visibility_timeout,
        }
    }

    fn query_error(command: &'static str, queue: &str) -> impl FnOnce(sqlx::Error) -> QueueError {
        let queue = queue.to_owned();
        move |error| QueueError::QueryError {
            command,
            queue,
            error,
        }
    }
}

#[async_trait]
impl QueueService for PgQueueService {
    async fn send(&self, queue: &str, message: OutgoingMessage) -> Result<(), QueueError> {
        sqlx::query(
            r#"
INSERT INTO sdlf_queue_messages (queue_name, message_group, dedup_token, body)
VALUES ($1, $2, $3, $4)
ON CONFLICT (queue_name, dedup_token) DO NOTHING
            "#,
        )
        .bind(queue)
        .bind(&message.ordering_key)
        .bind(&message.dedup_token)
        .bind(&message.body)
        .execute(&self.pool)
        .await
        .map_err(Self::query_error("send", queue))?;

        Ok(())
    }

    async fn send_batch(
        &self,
        queue: &str,
        messages: Vec<OutgoingMessage>,
    ) -> Result<(), QueueError> {
        check_batch_size(&messages)?;
        if messages.is_empty() {
            return Ok(());
        }

        let mut groups = Vec::with_capacity(messages.len());
        let mut tokens = Vec::with_capacity(messages.len());
        let mut bodies = Vec::with_capacity(messages.len());
        for message in messages {
            groups.push(message.ordering_key);
            tokens.push(message.dedup_token);
            bodies.push(message.body);
        }

        // Single statement, so the batch lands atomically and keeps its order within the group
        sqlx::query(
            r#"
INSERT INTO sdlf_queue_messages (queue_name, message_group, dedup_token, body)
SELECT $1, m.message_group, m.dedup_token, m.body
FROM UNNEST($2::text[], $3::text[], $4::text[]) WITH ORDINALITY
    AS m(message_group, dedup_token, body, position)
ORDER BY m.position
ON CONFLICT (queue_name, dedup_token) DO NOTHING
            "#,
        )
        .bind(queue)
        .bind(&groups)
        .bind(&tokens)
        .bind(&bodies)
        .execute(&self.pool)
        .await
        .map_err(Self::query_error("send_batch", queue))?;

        Ok(())
    }

    async fn receive(
        &self,
        queue: &str,
        ordering_key: Option<&str>,
        max: usize,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        if max == 0 {
            return Ok(vec![]);
        }

        let visibility_ms = self.visibility_timeout.as_millis() as i64;
        let mut rows: Vec<MessageRow> = sqlx::query_as(
            r#"
WITH available AS (
    SELECT m.id
    FROM sdlf_queue_messages m
    WHERE
        m.queue_name = $1
        AND ($2::text IS NULL OR m.message_group = $2)
        AND m.visible_at <= NOW()
        AND NOT EXISTS (
            SELECT 1 FROM sdlf_queue_messages f
            WHERE
                f.queue_name = m.queue_name
                AND f.message_group = m.message_group
                AND f.receive_count > 0
                AND f.visible_at > NOW()
        )
    ORDER BY m.id ASC
    LIMIT $3
    FOR UPDATE SKIP LOCKED
)
UPDATE sdlf_queue_messages
SET
    visible_at = NOW() + ($4 * INTERVAL '1 millisecond'),
    receive_count = sdlf_queue_messages.receive_count + 1,
    receipt_handle = gen_random_uuid()
FROM available
WHERE sdlf_queue_messages.id = available.id
RETURNING
    sdlf_queue_messages.id,
    sdlf_queue_messages.body,
    sdlf_queue_messages.message_group,
    sdlf_queue_messages.receipt_handle,
    sdlf_queue_messages.receive_count
            "#,
        )
        .bind(queue)
        .bind(ordering_key)
        .bind(max as i64)
        .bind(visibility_ms)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::query_error("receive", queue))?;

        // RETURNING gives no ordering guarantee
        rows.sort_by_key(|row| row.id);
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn delete(&self, queue: &str, receipt_handle: &Uuid) -> Result<DeleteOutcome, QueueError> {
        let result = sqlx::query(
            "DELETE FROM sdlf_queue_messages WHERE queue_name = $1 AND receipt_handle = $2",
        )
        .bind(queue)
        .bind(receipt_handle)
        .execute(&self.pool)
        .await
        .map_err(Self::query_error("delete", queue))?;

        if result.rows_affected() == 0 {
            Ok(DeleteOutcome::NotFound)
        } else {
            Ok(DeleteOutcome::Deleted)
        }
    }

    async fn depth(&self, queue: &str) -> Result<u64, QueueError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sdlf_queue_messages WHERE queue_name = $1")
                .bind(queue)
                .fetch_one(&self.pool)
                .await
                .map_err(Self::query_error("depth", queue))?;

        Ok(count as u64)
    }
}
