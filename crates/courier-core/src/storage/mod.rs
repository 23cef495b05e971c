//! Database access layer implementing the repository pattern.
//!
//! The repository layer translates between domain models and the PostgreSQL
//! schema. All SQL lives in this module tree; the dispatcher and admin
//! surfaces never issue queries directly.

use std::sync::Arc;

use sqlx::PgPool;

pub mod deliveries;
pub mod messages;
pub mod queues;
pub mod workers;

use crate::error::Result;

/// Container for all repository instances providing unified database access.
#[derive(Clone)]
pub struct Storage {
    /// Repository for worker registration and heartbeats.
    pub workers: Arc<workers::Repository>,

    /// Repository for queue configuration.
    pub queues: Arc<queues::Repository>,

    /// Repository for message publication and fan-out.
    pub messages: Arc<messages::Repository>,

    /// Repository for delivery leasing, resolution, and dead letters.
    pub deliveries: Arc<deliveries::Repository>,
}

impl Storage {
    /// Creates a new storage instance over a shared connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            workers: Arc::new(workers::Repository::new(pool.clone())),
            queues: Arc::new(queues::Repository::new(pool.clone())),
            messages: Arc::new(messages::Repository::new(pool.clone())),
            deliveries: Arc::new(deliveries::Repository::new(pool)),
        }
    }

    /// Performs a health check on the database connection.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.workers.pool()).await?;

        Ok(())
    }
}

/// Creates the broker schema if it does not exist.
///
/// Idempotent; both the service binary and the test harness run this on
/// startup.
///
/// # Errors
///
/// Returns error if any DDL statement fails.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS workers (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL,
            endpoint TEXT NOT NULL,
            rps INTEGER NOT NULL CHECK (rps > 0),
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            last_heartbeat_at TIMESTAMPTZ
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS queues (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            binding_pattern TEXT NOT NULL,
            worker_id UUID NOT NULL REFERENCES workers(id) ON DELETE CASCADE,
            max_retries INTEGER NOT NULL DEFAULT 5 CHECK (max_retries >= 0),
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS messages (
            id UUID PRIMARY KEY,
            routing_key TEXT NOT NULL,
            body JSONB NOT NULL,
            headers JSONB,
            visible_at TIMESTAMPTZ NOT NULL,
            occurred_at TIMESTAMPTZ NOT NULL
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS deliveries (
            id BIGSERIAL PRIMARY KEY,
            queue_id UUID NOT NULL REFERENCES queues(id) ON DELETE CASCADE,
            message_id UUID NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            acknowledged BOOLEAN NOT NULL DEFAULT FALSE,
            retries INTEGER NOT NULL DEFAULT 0 CHECK (retries >= 0),
            locked BOOLEAN NOT NULL DEFAULT FALSE,
            locked_at TIMESTAMPTZ,
            enqueued_at TIMESTAMPTZ NOT NULL,
            acknowledged_at TIMESTAMPTZ
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS dead_letters (
            id BIGSERIAL PRIMARY KEY,
            queue_id UUID NOT NULL REFERENCES queues(id) ON DELETE CASCADE,
            message_id UUID NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            acknowledged BOOLEAN NOT NULL DEFAULT FALSE,
            retries INTEGER NOT NULL,
            locked BOOLEAN NOT NULL DEFAULT FALSE,
            enqueued_at TIMESTAMPTZ NOT NULL,
            acknowledged_at TIMESTAMPTZ
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE INDEX IF NOT EXISTS idx_deliveries_leasable
        ON deliveries (queue_id, enqueued_at, id)
        WHERE NOT locked AND NOT acknowledged
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_deliveries_message ON deliveries (message_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_dead_letters_queue
         ON dead_letters (queue_id, enqueued_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
