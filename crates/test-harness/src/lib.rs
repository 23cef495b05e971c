//! Test harness for courier integration and unit tests.
//!
//! Provides per-test database isolation, a deterministic clock, and
//! fixture builders. Every test gets its own PostgreSQL database, so data
//! is visible across connections (the dispatcher and scheduler manage
//! their own) without leaking between tests.

pub mod database;
pub mod time;

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use courier_core::{
    storage::Storage, Clock, MessageId, NewMessage, QueueId, Visibility, WorkerId,
};
use database::TestDatabase;
use sqlx::PgPool;
pub use time::TestClock;
use tracing_subscriber::EnvFilter;

/// Test environment bundling an isolated database, a deterministic clock,
/// and the storage layer under test.
pub struct TestEnv {
    /// Deterministic clock; advance it to cross visibility windows and
    /// lease timeouts.
    pub clock: TestClock,
    db: TestDatabase,
    storage: Storage,
}

impl TestEnv {
    /// Creates a new test environment with its own database.
    pub async fn new() -> Result<Self> {
        // Initialize tracing once per process.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new("warn,courier=debug")),
            )
            .with_test_writer()
            .try_init();

        let db = TestDatabase::new().await?;
        let storage = Storage::new(db.pool().clone());
        let clock = TestClock::new();

        Ok(Self { clock, db, storage })
    }

    /// Returns the connection pool for this test's database.
    pub fn pool(&self) -> &PgPool {
        self.db.pool()
    }

    /// Returns the storage layer over this test's database.
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Current virtual time as a UTC timestamp.
    pub fn now(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.clock.now_system())
    }

    /// Advances the virtual clock.
    pub fn advance_time(&self, duration: Duration) {
        self.clock.advance(duration);
    }

    /// Registers a worker endpoint.
    pub async fn create_worker(&self, name: &str, endpoint: &str, rps: i32) -> Result<WorkerId> {
        self.storage
            .workers
            .create(name, endpoint, rps, self.now())
            .await
            .context("failed to create test worker")
    }

    /// Creates a queue bound to a worker.
    pub async fn create_queue(
        &self,
        name: &str,
        binding_pattern: &str,
        max_retries: i32,
        worker_id: WorkerId,
    ) -> Result<QueueId> {
        self.storage
            .queues
            .create(name, binding_pattern, max_retries, worker_id, self.now())
            .await
            .context("failed to create test queue")
    }

    /// Publishes an immediately-visible JSON message with a fresh id.
    pub async fn publish_json(
        &self,
        routing_key: &str,
        body: serde_json::Value,
    ) -> Result<MessageId> {
        self.publish(NewMessage::new(MessageId::new(), routing_key, body)).await
    }

    /// Publishes a message with full control over id, headers, and
    /// visibility.
    pub async fn publish(&self, message: NewMessage) -> Result<MessageId> {
        self.storage
            .messages
            .publish(&message, self.now())
            .await
            .context("failed to publish test message")
    }

    /// Publishes a message visible only after the given delay.
    pub async fn publish_delayed(
        &self,
        routing_key: &str,
        body: serde_json::Value,
        delay_seconds: u32,
    ) -> Result<MessageId> {
        self.publish(
            NewMessage::new(MessageId::new(), routing_key, body)
                .with_visibility(Visibility::After(delay_seconds)),
        )
        .await
    }
}
