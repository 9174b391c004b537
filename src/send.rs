//! The publish-side façade: generate an opaque id, publish the body, and
//! hand back a handle the caller can await for completion.

use chrono::Duration as ChronoDuration;
use sqlx::PgPool;
use uuid::Uuid;

use crate::completion::CompletionTracker;
use crate::error::QueueError;
use crate::ops::data_access;

/// One published message. Await [`SendHandle::wait_for_completion`] to block
/// until the receiving side acks it.
pub struct SendHandle {
    pool: PgPool,
    queue_name: String,
    tracker: CompletionTracker,
    id: Uuid,
}

impl SendHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn wait_for_completion(
        &self,
        poll_interval: Option<std::time::Duration>,
    ) -> Result<(), QueueError> {
        self.tracker
            .wait_for(&self.pool, &self.queue_name, self.id, poll_interval)
            .await
    }
}

pub(crate) async fn send_one(
    pool: &PgPool,
    tracker: &CompletionTracker,
    queue_name: &str,
    body: &[u8],
    delay: Option<ChronoDuration>,
) -> Result<SendHandle, QueueError> {
    let id = Uuid::new_v4();
    tracker.register(id).await;

    if let Err(err) = data_access::publish(pool, queue_name, id, body, delay).await {
        return Err(err);
    }

    Ok(SendHandle {
        pool: pool.clone(),
        queue_name: queue_name.to_owned(),
        tracker: tracker.clone(),
        id,
    })
}

/// Publish a batch. Each message gets an independent id and handle; the
/// original implementation does not make batched sends atomic with one
/// another, only each publish statement atomic with its own NOTIFY.
pub(crate) async fn send_batch(
    pool: &PgPool,
    tracker: &CompletionTracker,
    queue_name: &str,
    bodies: &[Vec<u8>],
    delay: Option<ChronoDuration>,
) -> Result<Vec<SendHandle>, QueueError> {
    let mut handles = Vec::with_capacity(bodies.len());
    for body in bodies {
        handles.push(send_one(pool, tracker, queue_name, body, delay).await?);
    }
    Ok(handles)
}
