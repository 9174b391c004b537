use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A message body. Opaque to the queue - the caller chooses the encoding.
pub type Bytes = Vec<u8>;

/// A queue's tunables, as stored in `pgjobq.queues`. Read-only to everything
/// but `create_queue`.
#[derive(Debug, Clone)]
pub struct QueueRecord {
    pub name: String,
    pub ack_deadline: chrono::Duration,
    pub retention_period: chrono::Duration,
    pub max_delivery_attempts: i32,
}

/// One row returned by a successful poll. `delivery_attempts_remaining` is
/// intentionally not surfaced here - the original queries never return it to
/// callers, only the id, body, and the deadline the poll just set.
#[derive(Debug, Clone)]
pub struct PolledMessage {
    pub id: Uuid,
    pub body: Bytes,
    pub next_ack_deadline: DateTime<Utc>,
}

/// Returned by `statistics`. Field names match the original implementation's
/// `QueueStatistics`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatistics {
    pub total_messages_in_queue: i64,
    pub undelivered_messages: i64,
}

/// An asynchronous, best-effort event fanned out by the notification
/// subscriber. Consumers must never assume delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationEvent {
    NewJob { queue_name: String },
    JobCompleted { queue_name: String, job_id: Uuid },
}

pub(crate) const NEW_JOB_CHANNEL: &str = "pgjobq.new_job";
pub(crate) const JOB_COMPLETED_CHANNEL: &str = "pgjobq.job_completed";

/// A [`NotificationEvent`]'s variant, without its payload - what
/// [`crate::NotificationHub::wait_for_any`] filters on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    NewJob,
    JobCompleted,
}

impl NotificationEvent {
    pub(crate) fn kind(&self) -> NotificationKind {
        match self {
            NotificationEvent::NewJob { .. } => NotificationKind::NewJob,
            NotificationEvent::JobCompleted { .. } => NotificationKind::JobCompleted,
        }
    }
}

impl NotificationEvent {
    /// Parse a raw LISTEN payload for `pgjobq.new_job`.
    pub(crate) fn new_job(payload: &str) -> Self {
        NotificationEvent::NewJob {
            queue_name: payload.to_owned(),
        }
    }

    /// Parse a raw LISTEN payload for `pgjobq.job_completed`, which is
    /// `"<queue_name>,<job_id>"`.
    pub(crate) fn job_completed(payload: &str) -> Option<Self> {
        let (queue_name, job_id) = payload.rsplit_once(',')?;
        let job_id = Uuid::parse_str(job_id).ok()?;
        Some(NotificationEvent::JobCompleted {
            queue_name: queue_name.to_owned(),
            job_id,
        })
    }

    pub(crate) fn queue_name(&self) -> &str {
        match self {
            NotificationEvent::NewJob { queue_name } => queue_name,
            NotificationEvent::JobCompleted { queue_name, .. } => queue_name,
        }
    }
}
