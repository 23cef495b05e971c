//! Repository for delivery leasing, resolution, and dead letters.
//!
//! The lease primitive combines selection, lock-skip, and the lock update
//! in one transaction using `FOR UPDATE SKIP LOCKED`, so concurrent
//! dispatchers, in this process or another, can never observe the same
//! row as leasable. Resolutions are guarded updates: re-running one with
//! the same outcome affects zero rows.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{DeadLetter, Delivery, LeasedDelivery, MessageId, QueueId},
};

/// Pending / leased / acknowledged / dead-lettered counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    /// Rows waiting to be leased (including not-yet-visible ones).
    pub pending: i64,
    /// Rows currently held under a lease.
    pub leased: i64,
    /// Terminally acknowledged rows.
    pub acknowledged: i64,
    /// Rows moved to the dead-letter table.
    pub dead_lettered: i64,
}

/// Result of one abandoned-lease sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Expired leases returned to pending with an incremented retry count.
    pub retried: u64,
    /// Expired leases whose budget was already exhausted, moved to the
    /// dead-letter table.
    pub dead_lettered: u64,
}

/// Repository for delivery database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Atomically leases up to `limit` visible pending rows for a queue.
    ///
    /// Rows are selected in `enqueued_at` order (delivery id as the
    /// tie-break), skipping rows locked by concurrent transactions, and
    /// marked locked with the lease stamp before the transaction commits.
    /// A separate select-then-update would allow another dispatcher to
    /// observe a selected row as unlocked; the single transaction with
    /// `FOR UPDATE SKIP LOCKED` closes that window.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn lease_batch(
        &self,
        queue_id: QueueId,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<LeasedDelivery>> {
        let mut tx = self.pool.begin().await?;

        let ids: Vec<i64> = sqlx::query_scalar(
            r"
            SELECT id FROM deliveries
            WHERE queue_id = $1
              AND NOT acknowledged
              AND NOT locked
              AND enqueued_at <= $2
            ORDER BY enqueued_at ASC, id ASC
            LIMIT $3
            FOR UPDATE SKIP LOCKED
            ",
        )
        .bind(queue_id)
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let mut leased = sqlx::query_as::<_, LeasedDelivery>(
            r"
            UPDATE deliveries d
            SET locked = TRUE, locked_at = $2
            FROM messages m
            WHERE d.id = ANY($1) AND m.id = d.message_id
            RETURNING d.id, d.message_id, d.retries, d.enqueued_at, m.body
            ",
        )
        .bind(&ids)
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        // RETURNING does not preserve the selection order.
        leased.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at).then(a.id.cmp(&b.id)));

        Ok(leased)
    }

    /// Acknowledges a leased delivery after a 2xx response. Terminal.
    ///
    /// Returns false when the row was already acknowledged or no longer
    /// exists, making re-resolution a no-op.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn ack(&self, delivery_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE deliveries
            SET acknowledged = TRUE, locked = FALSE, locked_at = NULL, acknowledged_at = $2
            WHERE id = $1 AND NOT acknowledged
            ",
        )
        .bind(delivery_id)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Returns a leased delivery to pending with one more recorded failure.
    ///
    /// The row keeps its original `enqueued_at`, so it re-enters the lease
    /// order at its original position. Returns false when the row is not
    /// currently leased.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn retry(&self, delivery_id: i64) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE deliveries
            SET retries = retries + 1, locked = FALSE, locked_at = NULL
            WHERE id = $1 AND locked AND NOT acknowledged
            ",
        )
        .bind(delivery_id)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Moves a delivery whose budget is exhausted to the dead-letter table.
    ///
    /// The dead-letter row freezes the message id and final retry count
    /// with `enqueued_at` set to the move time; the delivery row is
    /// deleted in the same transaction. Returns false when the row no
    /// longer exists.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn dead_letter(&self, delivery_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let moved = sqlx::query(
            r"
            INSERT INTO dead_letters (queue_id, message_id, retries, enqueued_at)
            SELECT queue_id, message_id, retries, $2
            FROM deliveries
            WHERE id = $1
            ",
        )
        .bind(delivery_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM deliveries WHERE id = $1")
            .bind(delivery_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(moved.rows_affected() > 0)
    }

    /// Recovers leases held longer than the timeout.
    ///
    /// Each expired lease counts as one failed attempt: rows with budget
    /// remaining return to pending with `retries + 1`, the rest move to
    /// the dead-letter table. Runs before the lease phase of every tick.
    /// Expired rows are claimed with `FOR UPDATE SKIP LOCKED` so two
    /// engines sweeping concurrently cannot double-resolve a row.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn release_abandoned(
        &self,
        queue_id: QueueId,
        max_retries: i32,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<SweepOutcome> {
        let mut tx = self.pool.begin().await?;

        let expired: Vec<(i64, i32)> = sqlx::query_as(
            r"
            SELECT id, retries FROM deliveries
            WHERE queue_id = $1
              AND locked
              AND NOT acknowledged
              AND locked_at <= $2
            FOR UPDATE SKIP LOCKED
            ",
        )
        .bind(queue_id)
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;

        if expired.is_empty() {
            tx.rollback().await?;
            return Ok(SweepOutcome::default());
        }

        let (exhausted, retryable): (Vec<i64>, Vec<i64>) = {
            let mut exhausted = Vec::new();
            let mut retryable = Vec::new();
            for (id, retries) in expired {
                if retries >= max_retries {
                    exhausted.push(id);
                } else {
                    retryable.push(id);
                }
            }
            (exhausted, retryable)
        };

        let mut outcome = SweepOutcome::default();

        if !exhausted.is_empty() {
            sqlx::query(
                r"
                INSERT INTO dead_letters (queue_id, message_id, retries, enqueued_at)
                SELECT queue_id, message_id, retries, $2
                FROM deliveries
                WHERE id = ANY($1)
                ",
            )
            .bind(&exhausted)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            let deleted = sqlx::query("DELETE FROM deliveries WHERE id = ANY($1)")
                .bind(&exhausted)
                .execute(&mut *tx)
                .await?;

            outcome.dead_lettered = deleted.rows_affected();
        }

        if !retryable.is_empty() {
            let released = sqlx::query(
                r"
                UPDATE deliveries
                SET retries = retries + 1, locked = FALSE, locked_at = NULL
                WHERE id = ANY($1)
                ",
            )
            .bind(&retryable)
            .execute(&mut *tx)
            .await?;

            outcome.retried = released.rows_affected();
        }

        tx.commit().await?;

        Ok(outcome)
    }

    /// Finds a delivery row by its local id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, delivery_id: i64) -> Result<Option<Delivery>> {
        let delivery = sqlx::query_as::<_, Delivery>(
            r"
            SELECT id, queue_id, message_id, acknowledged, retries, locked, locked_at,
                   enqueued_at, acknowledged_at
            FROM deliveries
            WHERE id = $1
            ",
        )
        .bind(delivery_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(delivery)
    }

    /// Lists a queue's delivery rows in lease order.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_for_queue(&self, queue_id: QueueId) -> Result<Vec<Delivery>> {
        let deliveries = sqlx::query_as::<_, Delivery>(
            r"
            SELECT id, queue_id, message_id, acknowledged, retries, locked, locked_at,
                   enqueued_at, acknowledged_at
            FROM deliveries
            WHERE queue_id = $1
            ORDER BY enqueued_at ASC, id ASC
            ",
        )
        .bind(queue_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(deliveries)
    }

    /// Finds the delivery row for a message on a specific queue.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_for_message(
        &self,
        queue_id: QueueId,
        message_id: MessageId,
    ) -> Result<Option<Delivery>> {
        let delivery = sqlx::query_as::<_, Delivery>(
            r"
            SELECT id, queue_id, message_id, acknowledged, retries, locked, locked_at,
                   enqueued_at, acknowledged_at
            FROM deliveries
            WHERE queue_id = $1 AND message_id = $2
            ORDER BY id ASC
            LIMIT 1
            ",
        )
        .bind(queue_id)
        .bind(message_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(delivery)
    }

    /// Counts a queue's rows by state for operational visibility.
    ///
    /// # Errors
    ///
    /// Returns error if a query fails.
    pub async fn queue_depth(&self, queue_id: QueueId) -> Result<QueueDepth> {
        let (pending, leased, acknowledged): (i64, i64, i64) = sqlx::query_as(
            r"
            SELECT
                COUNT(*) FILTER (WHERE NOT locked AND NOT acknowledged),
                COUNT(*) FILTER (WHERE locked AND NOT acknowledged),
                COUNT(*) FILTER (WHERE acknowledged)
            FROM deliveries
            WHERE queue_id = $1
            ",
        )
        .bind(queue_id)
        .fetch_one(&*self.pool)
        .await?;

        let dead_lettered: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters WHERE queue_id = $1")
                .bind(queue_id)
                .fetch_one(&*self.pool)
                .await?;

        Ok(QueueDepth { pending, leased, acknowledged, dead_lettered })
    }

    /// Lists a queue's dead-letter rows, most recent first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list_dead_letters(
        &self,
        queue_id: QueueId,
        limit: i64,
    ) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query_as::<_, DeadLetter>(
            r"
            SELECT id, queue_id, message_id, acknowledged, retries, locked,
                   enqueued_at, acknowledged_at
            FROM dead_letters
            WHERE queue_id = $1
            ORDER BY enqueued_at DESC, id DESC
            LIMIT $2
            ",
        )
        .bind(queue_id)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows)
    }

    /// Requeues a dead-letter row as a fresh pending delivery.
    ///
    /// The new delivery starts with a zeroed retry budget and
    /// `enqueued_at = now`; the dead-letter row is removed in the same
    /// transaction. Returns the new delivery id, or `None` when the
    /// dead-letter row no longer exists.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn requeue_dead_letter(
        &self,
        dead_letter_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        let mut tx = self.pool.begin().await?;

        let origin: Option<(QueueId, MessageId)> = sqlx::query_as(
            r"
            SELECT queue_id, message_id FROM dead_letters
            WHERE id = $1
            FOR UPDATE
            ",
        )
        .bind(dead_letter_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((queue_id, message_id)) = origin else {
            tx.rollback().await?;
            return Ok(None);
        };

        let delivery_id: i64 = sqlx::query_scalar(
            r"
            INSERT INTO deliveries (queue_id, message_id, enqueued_at)
            VALUES ($1, $2, $3)
            RETURNING id
            ",
        )
        .bind(queue_id)
        .bind(message_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM dead_letters WHERE id = $1")
            .bind(dead_letter_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Some(delivery_id))
    }
}
