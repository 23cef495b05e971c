//! Repository for queue configuration.
//!
//! Queue names are validated as strict identifiers before they are
//! persisted. The unified delivery schema no longer interpolates names into
//! DDL, but names remain operator-facing handles and keep the historical
//! character-class restriction.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::{CoreError, Result},
    models::{Queue, QueueId, WorkerId},
};

/// Validates a queue name as a safe identifier.
///
/// Names must be non-empty, consist only of ASCII letters, digits, and
/// underscores, and must not start with a digit.
///
/// # Errors
///
/// Returns `InvalidInput` describing the offending name.
pub fn validate_queue_name(name: &str) -> Result<()> {
    let mut chars = name.chars();

    let valid = match chars.next() {
        None => false,
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        },
    };

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidInput(format!(
            "queue name {name:?} must be a non-empty identifier of letters, digits, and \
             underscores, not starting with a digit"
        )))
    }
}

/// Repository for queue database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Creates a queue bound to an existing worker.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for an unsafe name or negative retry budget,
    /// `ConstraintViolation` for a duplicate name or unknown worker, or a
    /// database error otherwise. A failed create leaves no partial state.
    pub async fn create(
        &self,
        name: &str,
        binding_pattern: &str,
        max_retries: i32,
        worker_id: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<QueueId> {
        validate_queue_name(name)?;

        if max_retries < 0 {
            return Err(CoreError::InvalidInput(format!(
                "max_retries must be non-negative, got {max_retries}"
            )));
        }

        let id = QueueId::new();

        sqlx::query(
            r"
            INSERT INTO queues (id, name, binding_pattern, worker_id, max_retries, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(id)
        .bind(name)
        .bind(binding_pattern)
        .bind(worker_id)
        .bind(max_retries)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(id)
    }

    /// Finds a queue by ID.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, queue_id: QueueId) -> Result<Option<Queue>> {
        let queue = sqlx::query_as::<_, Queue>(
            r"
            SELECT id, name, binding_pattern, worker_id, max_retries, created_at
            FROM queues
            WHERE id = $1
            ",
        )
        .bind(queue_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(queue)
    }

    /// Finds a queue by its unique name.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_name(&self, name: &str) -> Result<Option<Queue>> {
        let queue = sqlx::query_as::<_, Queue>(
            r"
            SELECT id, name, binding_pattern, worker_id, max_retries, created_at
            FROM queues
            WHERE name = $1
            ",
        )
        .bind(name)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(queue)
    }

    /// Lists all queues, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list(&self) -> Result<Vec<Queue>> {
        let queues = sqlx::query_as::<_, Queue>(
            r"
            SELECT id, name, binding_pattern, worker_id, max_retries, created_at
            FROM queues
            ORDER BY created_at ASC
            ",
        )
        .fetch_all(&*self.pool)
        .await?;

        Ok(queues)
    }

    /// Lists the queues bound to a worker.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list_for_worker(&self, worker_id: WorkerId) -> Result<Vec<Queue>> {
        let queues = sqlx::query_as::<_, Queue>(
            r"
            SELECT id, name, binding_pattern, worker_id, max_retries, created_at
            FROM queues
            WHERE worker_id = $1
            ORDER BY created_at ASC
            ",
        )
        .bind(worker_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(queues)
    }

    /// Deletes a queue and, via cascade, its delivery and dead-letter rows.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn delete(&self, queue_id: QueueId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM queues WHERE id = $1")
            .bind(queue_id)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
