//! Repository for message publication and router fan-out.
//!
//! `publish` is the router: the message insert and the creation of one
//! pending delivery row per matching queue happen in a single transaction,
//! so either the message and its full fan-out exist, or nothing does.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::debug;

use crate::{
    error::Result,
    models::{Message, MessageId, NewMessage, Queue},
    pattern,
};

/// Repository for message database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Persists a message and fans it out onto every matching queue.
    ///
    /// The matching queue set is the snapshot visible inside the publish
    /// transaction; queues created afterwards do not receive the message.
    /// Zero matches is success: the message is persisted and never
    /// delivered.
    ///
    /// # Errors
    ///
    /// Returns `ConstraintViolation` for a duplicate message ID, or a
    /// database error if any insert fails. Failures roll the entire
    /// publish back.
    pub async fn publish(&self, message: &NewMessage, now: DateTime<Utc>) -> Result<MessageId> {
        let visible_at = message.visibility.resolve(now);

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r"
            INSERT INTO messages (id, routing_key, body, headers, visible_at, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(message.id)
        .bind(&message.routing_key)
        .bind(&message.body)
        .bind(&message.headers)
        .bind(visible_at)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let queues = sqlx::query_as::<_, Queue>(
            r"
            SELECT id, name, binding_pattern, worker_id, max_retries, created_at
            FROM queues
            ",
        )
        .fetch_all(&mut *tx)
        .await?;

        let mut matched = 0usize;
        for queue in
            queues.iter().filter(|q| pattern::matches(&message.routing_key, &q.binding_pattern))
        {
            sqlx::query(
                r"
                INSERT INTO deliveries (queue_id, message_id, enqueued_at)
                VALUES ($1, $2, $3)
                ",
            )
            .bind(queue.id)
            .bind(message.id)
            .bind(visible_at)
            .execute(&mut *tx)
            .await?;

            matched += 1;
        }

        tx.commit().await?;

        debug!(
            message_id = %message.id,
            routing_key = %message.routing_key,
            matched_queues = matched,
            "message published"
        );

        Ok(message.id)
    }

    /// Finds a message by ID.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, message_id: MessageId) -> Result<Option<Message>> {
        let message = sqlx::query_as::<_, Message>(
            r"
            SELECT id, routing_key, body, headers, visible_at, occurred_at
            FROM messages
            WHERE id = $1
            ",
        )
        .bind(message_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(message)
    }
}
