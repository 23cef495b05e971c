//! Administrative surface: worker and queue lifecycle, publication.
//!
//! Queue creation and destruction are paired with scheduler registration
//! so a queue starts ticking the moment it exists and stops before its
//! rows are dropped.

use std::sync::Arc;

use courier_core::{
    storage::Storage, time::utc_now, Clock, MessageId, NewMessage, QueueId, WorkerId,
};
use tracing::info;

use crate::{error::Result, scheduler::Scheduler};

/// Administrative facade over the storage layer and scheduler.
pub struct Admin {
    storage: Storage,
    scheduler: Scheduler,
    clock: Arc<dyn Clock>,
}

impl Admin {
    /// Creates a new admin surface.
    pub fn new(storage: Storage, scheduler: Scheduler, clock: Arc<dyn Clock>) -> Self {
        Self { storage, scheduler, clock }
    }

    /// Registers a worker endpoint with a requests-per-second ceiling.
    ///
    /// # Errors
    ///
    /// Returns error for a non-positive `rps` or a storage failure.
    pub async fn create_worker(&self, name: &str, endpoint: &str, rps: i32) -> Result<WorkerId> {
        let now = utc_now(&*self.clock);
        let worker_id = self.storage.workers.create(name, endpoint, rps, now).await?;

        info!(worker_id = %worker_id, name, endpoint, rps, "worker created");
        Ok(worker_id)
    }

    /// Destroys a worker and every queue bound to it.
    ///
    /// Tickers for the affected queues are stopped before the cascade
    /// drops their rows.
    ///
    /// # Errors
    ///
    /// Returns error if the storage operations fail.
    pub async fn delete_worker(&self, worker_id: WorkerId) -> Result<()> {
        let queues = self.storage.queues.list_for_worker(worker_id).await?;
        for queue in &queues {
            self.scheduler.deregister(queue.id).await;
        }

        self.storage.workers.delete(worker_id).await?;

        info!(worker_id = %worker_id, cascaded_queues = queues.len(), "worker deleted");
        Ok(())
    }

    /// Creates a queue and registers its periodic dispatch tick.
    ///
    /// The name is validated as a strict identifier and the worker must
    /// exist; on any failure no partial state remains.
    ///
    /// # Errors
    ///
    /// Returns error for an unsafe name, a negative retry budget, a
    /// duplicate name, or an unknown worker.
    pub async fn create_queue(
        &self,
        name: &str,
        binding_pattern: &str,
        max_retries: i32,
        worker_id: WorkerId,
    ) -> Result<QueueId> {
        let now = utc_now(&*self.clock);
        let queue_id = self
            .storage
            .queues
            .create(name, binding_pattern, max_retries, worker_id, now)
            .await?;

        self.scheduler.register(queue_id).await;

        info!(
            queue_id = %queue_id,
            name,
            binding_pattern,
            max_retries,
            worker_id = %worker_id,
            "queue created"
        );
        Ok(queue_id)
    }

    /// Destroys a queue: stops its ticker, then drops the queue row and,
    /// via cascade, its delivery and dead-letter rows.
    ///
    /// # Errors
    ///
    /// Returns error if the storage delete fails.
    pub async fn delete_queue(&self, queue_id: QueueId) -> Result<()> {
        self.scheduler.deregister(queue_id).await;
        self.storage.queues.delete(queue_id).await?;

        info!(queue_id = %queue_id, "queue deleted");
        Ok(())
    }

    /// Publishes a message: persists it and fans it out onto every queue
    /// whose binding pattern matches the routing key.
    ///
    /// Zero matching queues is success: the message is persisted and
    /// never delivered.
    ///
    /// # Errors
    ///
    /// Returns error for a duplicate message id or a storage failure;
    /// failures leave no side effects.
    pub async fn publish(&self, message: NewMessage) -> Result<MessageId> {
        let now = utc_now(&*self.clock);
        let message_id = self.storage.messages.publish(&message, now).await?;

        Ok(message_id)
    }
}
