//! Per-queue dispatch: the lease / deliver / resolve state machine.
//!
//! One tick drives a queue through four phases:
//!
//! 1. recover leases abandoned longer than the lease timeout,
//! 2. lease up to `worker.rps` visible pending rows,
//! 3. POST each leased message to the worker endpoint concurrently,
//! 4. resolve every row independently: 2xx acknowledges, an exhausted
//!    budget dead-letters, anything else returns the row to pending with
//!    one more recorded failure.
//!
//! The lease transaction is short and the HTTP round-trip happens outside
//! it, so no database locks are held across network I/O. Resolution
//! failures are logged and never abort the tick; every other leased row
//! still resolves on its own.

use std::{sync::Arc, time::Duration};

use courier_core::{
    storage::{deliveries::SweepOutcome, Storage},
    time::utc_now,
    Clock, LeasedDelivery, Queue, QueueId, Worker,
};
use tokio::{sync::RwLock, task::JoinSet};
use tracing::{debug, error, info, warn};

use crate::{
    client::{ClientConfig, WorkerClient},
    error::{DispatchError, Result},
};

/// Configuration for the dispatch engine.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// How long a lease may be held before it is considered abandoned.
    pub lease_timeout: Duration,

    /// Nominal interval between ticks for each queue.
    pub tick_interval: Duration,

    /// How often the scheduler reconciles its tickers with the queue
    /// table.
    pub sync_interval: Duration,

    /// HTTP client configuration. The request timeout must stay below the
    /// lease timeout.
    pub client: ClientConfig,

    /// Maximum time to wait for tickers to stop during shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(crate::DEFAULT_LEASE_TIMEOUT_SECONDS),
            tick_interval: Duration::from_millis(crate::DEFAULT_TICK_INTERVAL_MS),
            sync_interval: Duration::from_secs(5),
            client: ClientConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl DispatchConfig {
    /// Validates cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the HTTP timeout is not strictly below
    /// the lease timeout.
    pub fn validate(&self) -> Result<()> {
        if self.client.timeout >= self.lease_timeout {
            return Err(DispatchError::configuration(format!(
                "HTTP timeout ({:?}) must be below the lease timeout ({:?})",
                self.client.timeout, self.lease_timeout
            )));
        }
        Ok(())
    }
}

/// Statistics for engine monitoring.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Queues with an active ticker.
    pub active_queues: usize,
    /// Total delivery attempts made since startup.
    pub deliveries_attempted: u64,
    /// Attempts acknowledged by the worker.
    pub deliveries_acknowledged: u64,
    /// Attempts returned to pending for another try.
    pub deliveries_retried: u64,
    /// Deliveries moved to the dead-letter table.
    pub deliveries_dead_lettered: u64,
    /// Abandoned leases recovered by the sweep.
    pub leases_recovered: u64,
    /// Deliveries currently in flight.
    pub in_flight: u64,
}

/// Counts for one tick of one queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickSummary {
    /// Outcome of the abandoned-lease sweep.
    pub recovered: SweepOutcome,
    /// Rows leased this tick.
    pub leased: usize,
    /// Rows acknowledged.
    pub acknowledged: usize,
    /// Rows returned to pending.
    pub retried: usize,
    /// Rows moved to the dead-letter table.
    pub dead_lettered: usize,
}

impl TickSummary {
    /// True when the tick did any work worth logging.
    pub fn had_activity(&self) -> bool {
        self.leased > 0 || self.recovered.retried > 0 || self.recovered.dead_lettered > 0
    }
}

/// How a single leased row was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Worker returned 2xx; the row is terminally acknowledged.
    Acknowledged,
    /// Attempt failed with budget remaining; the row returns to pending.
    Retried,
    /// Attempt failed at `retries == max_retries`; the row moves to the
    /// dead-letter table.
    DeadLettered,
}

/// Decides how an attempt outcome resolves a leased row.
///
/// `retries` is the count of failed attempts already recorded before this
/// one, so a row is dead-lettered when the attempt made at
/// `retries == max_retries` fails, for `max_retries + 1` attempts in total.
pub fn decide(success: bool, retries: i32, max_retries: i32) -> Resolution {
    if success {
        Resolution::Acknowledged
    } else if retries >= max_retries {
        Resolution::DeadLettered
    } else {
        Resolution::Retried
    }
}

/// Per-queue dispatcher.
///
/// Stateless between ticks: all state lives in the store, so any number of
/// dispatchers (in this process or others) can tick the same queue, and
/// the skip-locked lease keeps them from ever sharing a row.
pub struct Dispatcher {
    storage: Storage,
    client: Arc<WorkerClient>,
    config: DispatchConfig,
    stats: Arc<RwLock<EngineStats>>,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    /// Creates a new dispatcher.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is inconsistent or the HTTP
    /// client cannot be built.
    pub fn new(storage: Storage, config: DispatchConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let client = Arc::new(WorkerClient::new(config.client.clone())?);

        Ok(Self {
            storage,
            client,
            config,
            stats: Arc::new(RwLock::new(EngineStats::default())),
            clock,
        })
    }

    /// Returns the shared statistics handle.
    pub fn stats_handle(&self) -> Arc<RwLock<EngineStats>> {
        self.stats.clone()
    }

    /// Returns a snapshot of the engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// Runs one tick for a queue.
    ///
    /// # Errors
    ///
    /// Returns `QueueNotFound` when the queue has been deleted,
    /// `WorkerNotFound` for a dangling worker reference, or a storage
    /// error if the sweep or lease phase fails. Failures while resolving
    /// individual rows are logged, counted as neither acknowledged nor
    /// retried, and do not fail the tick; the affected leases are
    /// recovered by a later sweep.
    pub async fn tick(&self, queue_id: QueueId) -> Result<TickSummary> {
        let queue = self
            .storage
            .queues
            .find_by_id(queue_id)
            .await?
            .ok_or(DispatchError::QueueNotFound(queue_id))?;

        let worker = self
            .storage
            .workers
            .find_by_id(queue.worker_id)
            .await?
            .ok_or(DispatchError::WorkerNotFound { worker_id: queue.worker_id, queue_id })?;

        let mut summary = TickSummary::default();

        summary.recovered = self.sweep_abandoned(&queue).await?;

        let now = utc_now(&*self.clock);
        let leased =
            self.storage.deliveries.lease_batch(queue.id, i64::from(worker.rps), now).await?;
        summary.leased = leased.len();

        if leased.is_empty() {
            return Ok(summary);
        }

        debug!(
            queue = %queue.name,
            worker = %worker.name,
            batch = leased.len(),
            "dispatching leased deliveries"
        );

        let mut attempts = JoinSet::new();
        for delivery in leased {
            attempts.spawn(self.deliver_and_resolve(&queue, &worker, delivery));
        }

        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok(Ok(resolution)) => match resolution {
                    Resolution::Acknowledged => summary.acknowledged += 1,
                    Resolution::Retried => summary.retried += 1,
                    Resolution::DeadLettered => summary.dead_lettered += 1,
                },
                Ok(Err(error)) => {
                    error!(queue = %queue.name, error = %error, "delivery resolution failed");
                },
                Err(join_error) => {
                    error!(queue = %queue.name, error = %join_error, "delivery task panicked");
                },
            }
        }

        if summary.acknowledged > 0 {
            // A 2xx is proof of life for the worker.
            let now = utc_now(&*self.clock);
            if let Err(error) = self.storage.workers.record_heartbeat(worker.id, now).await {
                warn!(worker = %worker.name, error = %error, "failed to record worker heartbeat");
            }
        }

        Ok(summary)
    }

    /// Recovers leases held past the timeout, charging each one failed
    /// attempt.
    async fn sweep_abandoned(&self, queue: &Queue) -> Result<SweepOutcome> {
        let now = utc_now(&*self.clock);
        let Ok(lease_timeout) = chrono::Duration::from_std(self.config.lease_timeout) else {
            return Err(DispatchError::configuration("lease timeout out of range".to_string()));
        };

        let outcome = self
            .storage
            .deliveries
            .release_abandoned(queue.id, queue.max_retries, now - lease_timeout, now)
            .await?;

        if outcome.retried > 0 || outcome.dead_lettered > 0 {
            warn!(
                queue = %queue.name,
                retried = outcome.retried,
                dead_lettered = outcome.dead_lettered,
                "recovered abandoned leases"
            );

            let mut stats = self.stats.write().await;
            stats.leases_recovered += outcome.retried + outcome.dead_lettered;
        }

        Ok(outcome)
    }

    /// Builds the future for one delivery attempt plus its resolution.
    fn deliver_and_resolve(
        &self,
        queue: &Queue,
        worker: &Worker,
        delivery: LeasedDelivery,
    ) -> impl std::future::Future<Output = Result<Resolution>> + Send + 'static {
        let storage = self.storage.clone();
        let client = self.client.clone();
        let stats = self.stats.clone();
        let clock = self.clock.clone();
        let endpoint = worker.endpoint.clone();
        let queue_name = queue.name.clone();
        let max_retries = queue.max_retries;

        async move {
            {
                let mut stats = stats.write().await;
                stats.in_flight += 1;
                stats.deliveries_attempted += 1;
            }

            let outcome = client.deliver(&endpoint, &delivery.body).await;

            {
                let mut stats = stats.write().await;
                stats.in_flight -= 1;
            }

            let now = utc_now(&*clock);
            let resolution = decide(outcome.is_success(), delivery.retries, max_retries);
            match resolution {
                Resolution::Acknowledged => {
                    storage.deliveries.ack(delivery.id, now).await?;

                    info!(
                        queue = %queue_name,
                        message_id = %delivery.message_id,
                        status = outcome.status,
                        duration_ms = outcome.duration.as_millis(),
                        "delivery acknowledged"
                    );
                },
                Resolution::DeadLettered => {
                    storage.deliveries.dead_letter(delivery.id, now).await?;

                    error!(
                        queue = %queue_name,
                        message_id = %delivery.message_id,
                        status = outcome.status,
                        retries = delivery.retries,
                        "retry budget exhausted, delivery dead-lettered"
                    );
                },
                Resolution::Retried => {
                    storage.deliveries.retry(delivery.id).await?;

                    warn!(
                        queue = %queue_name,
                        message_id = %delivery.message_id,
                        status = outcome.status,
                        attempt = delivery.retries + 1,
                        "delivery failed, will retry"
                    );
                },
            }

            {
                let mut stats = stats.write().await;
                match resolution {
                    Resolution::Acknowledged => stats.deliveries_acknowledged += 1,
                    Resolution::Retried => stats.deliveries_retried += 1,
                    Resolution::DeadLettered => stats.deliveries_dead_lettered += 1,
                }
            }

            Ok(resolution)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_always_acknowledges() {
        assert_eq!(decide(true, 0, 5), Resolution::Acknowledged);
        assert_eq!(decide(true, 5, 5), Resolution::Acknowledged);
        assert_eq!(decide(true, 99, 0), Resolution::Acknowledged);
    }

    #[test]
    fn budget_boundary_is_exact() {
        // max_retries = 2 allows attempts at retries 0, 1, and 2.
        assert_eq!(decide(false, 0, 2), Resolution::Retried);
        assert_eq!(decide(false, 1, 2), Resolution::Retried);
        assert_eq!(decide(false, 2, 2), Resolution::DeadLettered);
    }

    #[test]
    fn zero_budget_dead_letters_on_first_failure() {
        assert_eq!(decide(false, 0, 0), Resolution::DeadLettered);
    }

    #[test]
    fn http_timeout_must_stay_below_lease_timeout() {
        let config = DispatchConfig {
            lease_timeout: Duration::from_secs(30),
            client: ClientConfig { timeout: Duration::from_secs(30), ..Default::default() },
            ..Default::default()
        };
        assert!(config.validate().is_err());

        assert!(DispatchConfig::default().validate().is_ok());
    }
}
