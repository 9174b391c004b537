//! Correlates `JobCompleted` notifications with the send side waiting on
//! them. Notifications are best-effort, so every waiter also has a periodic
//! poll fallback against `pgjobq.messages` (absence of the row means done).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::{broadcast, Mutex, Notify};
use uuid::Uuid;

use crate::error::QueueError;
use crate::types::NotificationEvent;

/// Default interval for the poll fallback when `poll_interval` isn't given
/// explicitly. A `poll_interval` of zero means "poll exactly once, right
/// away, and trust the notification for everything after".
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

struct Inner {
    done: Mutex<HashMap<Uuid, Arc<Notify>>>,
}

/// Tracks job IDs a send side cares about completion for. One tracker is
/// shared by every `SendHandle` produced from the same queue connection.
#[derive(Clone)]
pub struct CompletionTracker {
    inner: Arc<Inner>,
}

impl CompletionTracker {
    pub fn new(mut notifications: broadcast::Receiver<NotificationEvent>, queue_name: String) -> Self {
        let tracker = CompletionTracker {
            inner: Arc::new(Inner {
                done: Mutex::new(HashMap::new()),
            }),
        };

        let inner = tracker.inner.clone();
        tokio::spawn(async move {
            loop {
                let event = match notifications.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Closed) => return,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                };

                let NotificationEvent::JobCompleted { queue_name: event_queue, job_id } = event else {
                    continue;
                };
                if event_queue != queue_name {
                    continue;
                }

                let mut done = inner.done.lock().await;
                if let Some(notify) = done.remove(&job_id) {
                    notify.notify_waiters();
                }
            }
        });

        tracker
    }

    /// Register interest in `job_id` before publishing it, so a completion
    /// notification that races the publish is never missed.
    pub async fn register(&self, job_id: Uuid) {
        self.inner
            .done
            .lock()
            .await
            .entry(job_id)
            .or_insert_with(|| Arc::new(Notify::new()));
    }

    /// Wait until `job_id` completes, checking the database every
    /// `poll_interval` as a fallback for missed notifications.
    /// `poll_interval = Duration::ZERO` polls once immediately and returns
    /// as soon as that poll (or a notification) resolves it.
    pub async fn wait_for(
        &self,
        pool: &PgPool,
        queue_name: &str,
        job_id: Uuid,
        poll_interval: Option<Duration>,
    ) -> Result<(), QueueError> {
        let notify = {
            let mut done = self.inner.done.lock().await;
            done.entry(job_id).or_insert_with(|| Arc::new(Notify::new())).clone()
        };

        if !message_still_exists(pool, queue_name, job_id).await? {
            self.inner.done.lock().await.remove(&job_id);
            return Ok(());
        }

        // poll_interval = 0 means "that one check was the only poll" -
        // everything after this relies solely on the notification.
        match poll_interval {
            Some(Duration::ZERO) => {
                notify.notified().await;
                Ok(())
            }
            other => {
                let poll_interval = other.unwrap_or(DEFAULT_POLL_INTERVAL);
                loop {
                    tokio::select! {
                        _ = notify.notified() => return Ok(()),
                        _ = tokio::time::sleep(poll_interval) => {
                            if !message_still_exists(pool, queue_name, job_id).await? {
                                self.inner.done.lock().await.remove(&job_id);
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
    }
}

async fn message_still_exists(pool: &PgPool, queue_name: &str, job_id: Uuid) -> Result<bool, QueueError> {
    let row: Option<(i32,)> = sqlx::query_as(
        r#"
SELECT 1
FROM pgjobq.messages
WHERE queue_id = (SELECT id FROM pgjobq.queues WHERE name = $1) AND id = $2
        "#,
    )
    .bind(queue_name)
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.is_some())
}
