//! The top-level entry point: binds a queue name to one pool, one
//! notification subscription, and one completion tracker, and exposes
//! send/receive/statistics as a single handle.

use std::time::Duration;

use chrono::Duration as ChronoDuration;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::completion::CompletionTracker;
use crate::config::{PoolConfig, QueueConfig, DEFAULT_POLL_INTERVAL_MILLIS};
use crate::error::QueueError;
use crate::notify::NotificationHub;
use crate::ops::data_access;
use crate::receive::{ReceiveSession, ReceivedBatch, ReceivedJob};
use crate::send::{self, SendHandle};
use crate::types::{QueueRecord, QueueStatistics};

/// A connected handle to one named queue. Cheap to clone: every clone shares
/// the same pool, notification hub, and completion tracker.
#[derive(Clone)]
pub struct QueueHandle {
    pool: PgPool,
    record: QueueRecord,
    hub: NotificationHub,
    tracker: CompletionTracker,
    receive: ReceiveSession,
    shutdown: CancellationToken,
    poll_interval: Duration,
}

impl QueueHandle {
    /// Build a pool from `pool_config`, then delegate to
    /// [`QueueHandle::connect_to_queue_with_pool`].
    pub async fn connect_to_queue(
        pool_config: &PoolConfig,
        queue_name: &str,
        config: QueueConfig,
        fifo: bool,
    ) -> Result<Self, QueueError> {
        let pool = pool_config.connect().await?;
        Self::connect_to_queue_with_pool(pool, queue_name, config, fifo).await
    }

    /// Ensure `queue_name` exists with the given config (idempotent - a
    /// second call with the same name is a no-op, even if `config` differs),
    /// then connect a listener and completion tracker to it. Useful when a
    /// pool already exists (shared with other callers, or provided by a test
    /// harness) and reconnecting from a URL would be wasteful.
    pub async fn connect_to_queue_with_pool(
        pool: PgPool,
        queue_name: &str,
        config: QueueConfig,
        fifo: bool,
    ) -> Result<Self, QueueError> {
        data_access::create_queue(
            &pool,
            queue_name,
            config.ack_deadline,
            config.retention_period,
            config.max_delivery_attempts,
        )
        .await?;

        let shutdown = CancellationToken::new();
        let hub = NotificationHub::connect(&pool, shutdown.clone()).await?;

        let record = QueueRecord {
            name: queue_name.to_owned(),
            ack_deadline: config.ack_deadline,
            retention_period: config.retention_period,
            max_delivery_attempts: config.max_delivery_attempts,
        };

        let tracker = CompletionTracker::new(hub.subscribe(), queue_name.to_owned());
        let poll_interval = Duration::from_millis(DEFAULT_POLL_INTERVAL_MILLIS);
        let receive = ReceiveSession::new(pool.clone(), &record, fifo, poll_interval);

        Ok(QueueHandle {
            pool,
            record,
            hub,
            tracker,
            receive,
            shutdown,
            poll_interval,
        })
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub async fn send(&self, body: &[u8]) -> Result<SendHandle, QueueError> {
        send::send_one(&self.pool, &self.tracker, &self.record.name, body, None).await
    }

    pub async fn send_with_delay(&self, body: &[u8], delay: ChronoDuration) -> Result<SendHandle, QueueError> {
        send::send_one(&self.pool, &self.tracker, &self.record.name, body, Some(delay)).await
    }

    pub async fn send_batch(&self, bodies: &[Vec<u8>]) -> Result<Vec<SendHandle>, QueueError> {
        send::send_batch(&self.pool, &self.tracker, &self.record.name, bodies, None).await
    }

    /// Receive up to `batch_size` messages, blocking until at least one is
    /// available or `cancel` fires. The returned [`ReceivedBatch`] is the
    /// receive session's scope: keep it alive for as long as you're working
    /// the delivered handles, since dropping it nacks any handle you never
    /// `acquire`d.
    pub async fn receive(&self, batch_size: i64, cancel: CancellationToken) -> Result<ReceivedBatch, QueueError> {
        self.receive.receive(batch_size, self.hub.subscribe(), cancel).await
    }

    /// Receive exactly one message, blocking until available or `cancel`
    /// fires. A convenience over [`QueueHandle::receive`] with
    /// `batch_size = 1`; the returned [`ReceivedJob`] derefs to
    /// [`crate::handle::Job`] and keeps its session open for as long as it's
    /// held.
    pub async fn receive_one(&self, cancel: CancellationToken) -> Result<Option<ReceivedJob>, QueueError> {
        let batch = self.receive(1, cancel).await?;
        Ok(ReceivedJob::from_batch(batch))
    }

    pub async fn wait_for_completion(&self, job_id: Uuid, poll_interval: Option<Duration>) -> Result<(), QueueError> {
        self.tracker
            .wait_for(&self.pool, &self.record.name, job_id, poll_interval)
            .await
    }

    pub async fn statistics(&self) -> Result<QueueStatistics, QueueError> {
        data_access::statistics(&self.pool, &self.record.name).await
    }

    /// The interval receive polls at between notification-driven wakeups.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Stop this handle's notification pump. Other clones keep their own
    /// reference to the same hub but share this cancellation token, so this
    /// affects every clone - call it only when done with the queue entirely.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
