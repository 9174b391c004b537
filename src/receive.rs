//! The consume-side façade: poll for a batch, wrap each row in a [`Job`],
//! and wake up early off a `NewJob` notification instead of sleeping out a
//! full poll interval every time.
//!
//! The batch returned by [`ReceiveSession::receive`] is itself the receive
//! session's scope: it owns every handle it delivered, and when it is
//! dropped it nacks any handle that was never `acquire`d, so a message the
//! caller never got around to processing is redelivered immediately rather
//! than waiting out the full ack deadline. A handle that *was* acquired but
//! never finished is left alone - its lease expires naturally, since the
//! caller may already have applied partial side effects before being
//! interrupted.

use std::ops::{Deref, Index};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::QueueError;
use crate::handle::{self, Job};
use crate::ops::data_access;
use crate::types::{NotificationEvent, QueueRecord};

/// A bound set of receive-side tunables, captured once per `QueueHandle` and
/// reused by every `receive` call.
#[derive(Clone)]
pub struct ReceiveSession {
    pool: PgPool,
    queue_name: String,
    fifo: bool,
    poll_interval: Duration,
    ack_deadline: ChronoDuration,
}

impl ReceiveSession {
    pub(crate) fn new(pool: PgPool, queue: &QueueRecord, fifo: bool, poll_interval: Duration) -> Self {
        ReceiveSession {
            pool,
            queue_name: queue.name.clone(),
            fifo,
            poll_interval,
            ack_deadline: queue.ack_deadline,
        }
    }

    /// Block until at least one message is available (or `cancel` fires),
    /// then return up to `batch_size` of them. Polls immediately, then
    /// sleeps `poll_interval`, waking early on any `NewJob` notification for
    /// this queue. The returned [`ReceivedBatch`] owns the delivered
    /// handles for the rest of its scope - see the module docs.
    pub async fn receive(
        &self,
        batch_size: i64,
        mut notifications: broadcast::Receiver<NotificationEvent>,
        cancel: CancellationToken,
    ) -> Result<ReceivedBatch, QueueError> {
        loop {
            let rows = data_access::poll(&self.pool, &self.queue_name, batch_size, self.fifo).await?;
            if !rows.is_empty() {
                let session_open = handle::new_session_guard();
                let jobs = rows
                    .into_iter()
                    .map(|row| {
                        Arc::new(Job::new(
                            self.pool.clone(),
                            self.queue_name.clone(),
                            row.id,
                            row.body,
                            self.ack_deadline,
                            session_open.clone(),
                        ))
                    })
                    .collect();
                return Ok(ReceivedBatch { jobs, session_open });
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(ReceivedBatch::empty()),
                _ = tokio::time::sleep(self.poll_interval) => {}
                result = wait_for_new_job(&mut notifications, &self.queue_name) => {
                    result?;
                }
            }
        }
    }
}

async fn wait_for_new_job(
    notifications: &mut broadcast::Receiver<NotificationEvent>,
    queue_name: &str,
) -> Result<(), QueueError> {
    loop {
        match notifications.recv().await {
            Ok(NotificationEvent::NewJob { queue_name: name }) if name == queue_name => return Ok(()),
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => return Ok(()),
            Err(broadcast::error::RecvError::Closed) => {
                // No listener left to wake us; fall back to the poll-interval sleep.
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

/// The scope owning every handle delivered by one `receive()` call. Holding
/// this alive keeps the underlying "receive session" open; dropping it (or
/// consuming it with `into_iter()`) ends that session and nacks whichever
/// handles are still `Pending` (delivered, never acquired).
pub struct ReceivedBatch {
    jobs: Vec<Arc<Job>>,
    session_open: handle::SessionGuard,
}

impl ReceivedBatch {
    fn empty() -> Self {
        ReceivedBatch {
            jobs: Vec::new(),
            session_open: handle::new_session_guard(),
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<Job>> {
        self.jobs.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Arc<Job>> {
        self.jobs.iter()
    }
}

impl Index<usize> for ReceivedBatch {
    type Output = Arc<Job>;

    fn index(&self, index: usize) -> &Arc<Job> {
        &self.jobs[index]
    }
}

impl<'a> IntoIterator for &'a ReceivedBatch {
    type Item = &'a Arc<Job>;
    type IntoIter = std::slice::Iter<'a, Arc<Job>>;

    fn into_iter(self) -> Self::IntoIter {
        self.jobs.iter()
    }
}

impl IntoIterator for ReceivedBatch {
    type Item = Arc<Job>;
    type IntoIter = std::vec::IntoIter<Arc<Job>>;

    /// Consumes the batch and, since that ends its session immediately,
    /// nacks any handle in the returned iterator that the caller hasn't
    /// already acquired by the time this batch's `Drop` runs.
    fn into_iter(mut self) -> Self::IntoIter {
        std::mem::take(&mut self.jobs).into_iter()
    }
}

impl Drop for ReceivedBatch {
    fn drop(&mut self) {
        self.session_open.store(false, Ordering::SeqCst);

        if self.jobs.is_empty() {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("receive session dropped outside a tokio runtime, skipping nack-on-exit");
            return;
        };

        for job in self.jobs.drain(..) {
            runtime.spawn(async move {
                job.nack_if_never_acquired().await;
            });
        }
    }
}

/// A single delivered handle whose owning receive session stays open for as
/// long as this value is alive. Returned by [`crate::QueueHandle::receive_one`]
/// so the common "receive exactly one message" path doesn't require the
/// caller to juggle a batch of size one. Derefs to [`Job`].
pub struct ReceivedJob {
    batch: ReceivedBatch,
}

impl ReceivedJob {
    pub(crate) fn from_batch(batch: ReceivedBatch) -> Option<Self> {
        if batch.is_empty() {
            None
        } else {
            Some(ReceivedJob { batch })
        }
    }
}

impl Deref for ReceivedJob {
    type Target = Job;

    fn deref(&self) -> &Job {
        &self.batch[0]
    }
}
