//! Cron-style trigger: enqueues a synthetic job on a fixed interval.
//!
//! Every process may run a scheduler for the same queue. Each tick is claimed
//! in the shared store first (`set_nx` on queue + tick index), so a tick
//! produces one job no matter how many schedulers saw it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::kv::KvStore;

use super::queue::JobQueue;
use super::types::QueueName;

/// Handle for a running schedule (shutdown + manual trigger).
#[derive(Debug)]
pub struct CronHandle {
    queue: QueueName,
    shutdown: watch::Sender<bool>,
    trigger: mpsc::Sender<()>,
    join: JoinHandle<()>,
}

impl CronHandle {
    pub fn queue(&self) -> QueueName {
        self.queue
    }

    /// Enqueue an off-schedule run now.
    ///
    /// Triggers are coalesced: if one is already pending this is a no-op.
    pub fn trigger(&self) {
        let _ = self.trigger.try_send(());
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(queue = %self.queue, error = %e, "cron task ended abnormally");
        }
    }
}

#[derive(Clone)]
pub struct CronScheduler {
    queue: JobQueue,
    claims: Arc<dyn KvStore>,
}

impl std::fmt::Debug for CronScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CronScheduler").finish_non_exhaustive()
    }
}

impl CronScheduler {
    pub fn new(queue: JobQueue, claims: Arc<dyn KvStore>) -> Self {
        Self { queue, claims }
    }

    /// Start enqueueing into `queue` every `interval`, first tick immediately.
    pub fn spawn(&self, queue: QueueName, interval: Duration) -> CronHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let this = self.clone();
        let interval = interval.max(Duration::from_millis(1));
        let join = tokio::spawn(async move {
            this.run(queue, interval, shutdown_rx, trigger_rx).await;
        });

        CronHandle {
            queue,
            shutdown: shutdown_tx,
            trigger: trigger_tx,
            join,
        }
    }

    async fn run(
        &self,
        queue: QueueName,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
        mut trigger: mpsc::Receiver<()>,
    ) {
        info!(queue = %queue, interval_ms = interval.as_millis() as u64, "cron scheduler started");

        // Wall clock advanced by the runtime clock, so tick indices agree
        // across processes and follow a paused clock in tests.
        let origin_wall = Utc::now();
        let origin = Instant::now();
        let now = move || origin_wall + chrono::Duration::from_std(origin.elapsed()).unwrap_or_default();

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.fire_tick(queue, interval, now()).await,
                Some(()) = trigger.recv() => self.fire_manual(queue, now()).await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(queue = %queue, "cron scheduler stopped");
    }

    async fn fire_tick(&self, queue: QueueName, interval: Duration, at: DateTime<Utc>) {
        let tick = at.timestamp_millis().max(0) as u128 / interval.as_millis().max(1);
        let claim_key = format!("scribe:cron:{queue}:{tick}");
        let ttl = (interval * 2).max(Duration::from_secs(1));

        match self.claims.set_nx(&claim_key, "1", ttl).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(queue = %queue, tick = %tick, "tick already claimed by another scheduler");
                return;
            }
            Err(e) => {
                warn!(queue = %queue, tick = %tick, error = %e, "could not claim tick; skipping");
                return;
            }
        }

        let payload = serde_json::json!({
            "trigger": "cron",
            "tick": tick.to_string(),
            "scheduledAt": at.to_rfc3339(),
        });
        match self.queue.enqueue(queue, payload).await {
            Ok(job_id) => debug!(queue = %queue, tick = %tick, job_id = %job_id, "cron job enqueued"),
            Err(e) => error!(queue = %queue, tick = %tick, error = %e, "failed to enqueue cron job"),
        }
    }

    async fn fire_manual(&self, queue: QueueName, at: DateTime<Utc>) {
        let payload = serde_json::json!({
            "trigger": "manual",
            "scheduledAt": at.to_rfc3339(),
        });
        if let Err(e) = self.queue.enqueue(queue, payload).await {
            error!(queue = %queue, error = %e, "failed to enqueue triggered job");
        }
    }
}
