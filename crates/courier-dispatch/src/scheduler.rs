//! In-process periodic scheduling of per-queue ticks.
//!
//! Replaces the external cron of database-embedded brokers with one ticker
//! task per queue at a nominal one-second cadence, plus a refresh loop
//! that reconciles the ticker set against the queue table so queues
//! created by other processes get tickers too. Overlapping ticks for the
//! same queue are harmless (leasing is atomic and row-scoped), so the
//! cadence is best-effort, never load-bearing.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use courier_core::{storage::Storage, QueueId};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    dispatcher::{DispatchConfig, Dispatcher},
    error::{DispatchError, Result},
};

struct QueueTicker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct SchedulerInner {
    storage: Storage,
    dispatcher: Arc<Dispatcher>,
    config: DispatchConfig,
    tickers: Mutex<HashMap<QueueId, QueueTicker>>,
    refresh: Mutex<Option<JoinHandle<()>>>,
    cancellation_token: CancellationToken,
}

/// Periodic tick scheduler supervising one ticker task per queue.
///
/// Cheaply cloneable; clones share the ticker set. Call
/// [`Scheduler::shutdown`] for a graceful stop; dropping the last clone
/// only cancels outstanding tickers without waiting for them.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Creates a new scheduler over the given dispatcher.
    pub fn new(storage: Storage, dispatcher: Arc<Dispatcher>, config: DispatchConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                storage,
                dispatcher,
                config,
                tickers: Mutex::new(HashMap::new()),
                refresh: Mutex::new(None),
                cancellation_token: CancellationToken::new(),
            }),
        }
    }

    /// Registers tickers for all existing queues and starts the refresh
    /// loop.
    ///
    /// # Errors
    ///
    /// Returns error if the initial queue listing fails.
    pub async fn start(&self) -> Result<()> {
        self.sync().await?;

        let scheduler = self.clone();
        let token = self.inner.cancellation_token.clone();
        let sync_interval = self.inner.config.sync_interval;

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(sync_interval) => {
                        if let Err(error) = scheduler.sync().await {
                            error!(error = %error, "queue ticker sync failed");
                        }
                    }
                }
            }
        });

        *self.inner.refresh.lock().expect("refresh lock poisoned") = Some(handle);

        info!(
            active_queues = self.active_queue_count(),
            tick_interval_ms = self.inner.config.tick_interval.as_millis(),
            "scheduler started"
        );

        Ok(())
    }

    /// Starts a ticker for a queue. Returns false when one is already
    /// running.
    pub async fn register(&self, queue_id: QueueId) -> bool {
        let registered = {
            let mut tickers = self.inner.tickers.lock().expect("ticker lock poisoned");
            if tickers.contains_key(&queue_id) {
                false
            } else {
                let token = self.inner.cancellation_token.child_token();
                let handle = tokio::spawn(run_ticker(
                    self.inner.dispatcher.clone(),
                    queue_id,
                    self.inner.config.tick_interval,
                    token.clone(),
                ));
                tickers.insert(queue_id, QueueTicker { token, handle });
                true
            }
        };

        if registered {
            debug!(queue_id = %queue_id, "queue ticker registered");
            self.update_active_count().await;
        }

        registered
    }

    /// Stops a queue's ticker and waits for it to finish. Returns false
    /// when no ticker was running.
    pub async fn deregister(&self, queue_id: QueueId) -> bool {
        let ticker = {
            let mut tickers = self.inner.tickers.lock().expect("ticker lock poisoned");
            tickers.remove(&queue_id)
        };

        let Some(ticker) = ticker else {
            return false;
        };

        ticker.token.cancel();
        if let Err(join_error) = ticker.handle.await {
            warn!(queue_id = %queue_id, error = %join_error, "queue ticker ended abnormally");
        }

        debug!(queue_id = %queue_id, "queue ticker deregistered");
        self.update_active_count().await;
        true
    }

    /// Reconciles the ticker set with the queue table: queues without a
    /// ticker get one, tickers for deleted queues are stopped.
    ///
    /// # Errors
    ///
    /// Returns error if the queue listing fails.
    pub async fn sync(&self) -> Result<()> {
        let queues = self.inner.storage.queues.list().await?;
        let current: Vec<QueueId> = queues.iter().map(|q| q.id).collect();

        let stale: Vec<QueueId> = {
            let tickers = self.inner.tickers.lock().expect("ticker lock poisoned");
            tickers.keys().filter(|id| !current.contains(id)).copied().collect()
        };

        for queue_id in stale {
            self.deregister(queue_id).await;
        }

        for queue_id in current {
            self.register(queue_id).await;
        }

        Ok(())
    }

    /// Number of queues with an active ticker.
    pub fn active_queue_count(&self) -> usize {
        self.inner.tickers.lock().expect("ticker lock poisoned").len()
    }

    /// Gracefully stops the refresh loop and every queue ticker.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if tickers do not stop within the
    /// configured shutdown timeout.
    pub async fn shutdown(self) -> Result<()> {
        info!(active_queues = self.active_queue_count(), "shutting down scheduler");

        self.inner.cancellation_token.cancel();

        let refresh = self.inner.refresh.lock().expect("refresh lock poisoned").take();
        if let Some(handle) = refresh {
            let _ = handle.await;
        }

        let tickers: Vec<(QueueId, QueueTicker)> = {
            let mut map = self.inner.tickers.lock().expect("ticker lock poisoned");
            map.drain().collect()
        };

        let drain = async {
            for (queue_id, ticker) in tickers {
                if let Err(join_error) = ticker.handle.await {
                    warn!(
                        queue_id = %queue_id,
                        error = %join_error,
                        "queue ticker ended abnormally during shutdown"
                    );
                }
            }
        };

        let timeout = self.inner.config.shutdown_timeout;
        match tokio::time::timeout(timeout, drain).await {
            Ok(()) => {
                self.update_active_count().await;
                info!("scheduler shutdown complete");
                Ok(())
            },
            Err(_elapsed) => Err(DispatchError::ShutdownTimeout { timeout }),
        }
    }

    async fn update_active_count(&self) {
        let count = self.active_queue_count();
        let stats = self.inner.dispatcher.stats_handle();
        stats.write().await.active_queues = count;
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        if !self.cancellation_token.is_cancelled() {
            let active = self.tickers.lock().map(|t| t.len()).unwrap_or(0);
            if active > 0 {
                warn!(
                    active_queues = active,
                    "scheduler dropped without shutdown, cancelling queue tickers"
                );
            }
            self.cancellation_token.cancel();
        }
    }
}

/// Body of one queue's ticker task.
async fn run_ticker(
    dispatcher: Arc<Dispatcher>,
    queue_id: QueueId,
    tick_interval: std::time::Duration,
    token: CancellationToken,
) {
    let mut interval = tokio::time::interval(tick_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = interval.tick() => {
                match dispatcher.tick(queue_id).await {
                    Ok(summary) if summary.had_activity() => {
                        debug!(
                            queue_id = %queue_id,
                            leased = summary.leased,
                            acknowledged = summary.acknowledged,
                            retried = summary.retried,
                            dead_lettered = summary.dead_lettered,
                            "tick completed"
                        );
                    },
                    Ok(_) => {},
                    Err(DispatchError::QueueNotFound(_)) => {
                        info!(queue_id = %queue_id, "queue deleted, stopping ticker");
                        break;
                    },
                    Err(error) => {
                        // The store may be briefly unavailable; the next
                        // tick retries.
                        error!(queue_id = %queue_id, error = %error, "tick failed");
                    },
                }
            }
        }
    }
}
