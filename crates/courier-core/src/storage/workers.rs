//! Repository for worker registration and lifecycle.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::{CoreError, Result},
    models::{Worker, WorkerId},
};

/// Repository for worker database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Registers a new worker endpoint.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if `rps` is not positive, or a database error
    /// if the insert fails.
    pub async fn create(
        &self,
        name: &str,
        endpoint: &str,
        rps: i32,
        now: DateTime<Utc>,
    ) -> Result<WorkerId> {
        if rps <= 0 {
            return Err(CoreError::InvalidInput(format!(
                "worker rps must be positive, got {rps}"
            )));
        }

        let id = WorkerId::new();

        sqlx::query(
            r"
            INSERT INTO workers (id, name, endpoint, rps, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ",
        )
        .bind(id)
        .bind(name)
        .bind(endpoint)
        .bind(rps)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(id)
    }

    /// Finds a worker by ID.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, worker_id: WorkerId) -> Result<Option<Worker>> {
        let worker = sqlx::query_as::<_, Worker>(
            r"
            SELECT id, name, endpoint, rps, created_at, last_heartbeat_at
            FROM workers
            WHERE id = $1
            ",
        )
        .bind(worker_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(worker)
    }

    /// Lists all registered workers, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list(&self) -> Result<Vec<Worker>> {
        let workers = sqlx::query_as::<_, Worker>(
            r"
            SELECT id, name, endpoint, rps, created_at, last_heartbeat_at
            FROM workers
            ORDER BY created_at ASC
            ",
        )
        .fetch_all(&*self.pool)
        .await?;

        Ok(workers)
    }

    /// Records a heartbeat for the worker.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn record_heartbeat(&self, worker_id: WorkerId, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE workers SET last_heartbeat_at = $1 WHERE id = $2")
            .bind(now)
            .bind(worker_id)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }

    /// Deletes a worker.
    ///
    /// Every queue referencing this worker cascades away with it, along
    /// with those queues' delivery and dead-letter rows.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn delete(&self, worker_id: WorkerId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM workers WHERE id = $1")
            .bind(worker_id)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
