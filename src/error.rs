use thiserror::Error;
use uuid::Uuid;

/// Errors about the queue itself - missing queues, driver/connection
/// failures, timeouts. Returned by every data-access and façade-level
/// operation.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("no queue named {0}")]
    QueueNotFound(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Errors about a specific delivery's handle - lock already held, already
/// finished, or its owning receive session has gone away.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("job {0} is already being processed")]
    AlreadyProcessing(Uuid),
    #[error("job {0} has already completed")]
    AlreadyCompleted(Uuid),
    #[error("job {0} is no longer available: its receive session has exited")]
    NoLongerAvailable(Uuid),
    #[error("job {0} must be acquired before it can be acked or nacked")]
    NotAcquired(Uuid),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("operation cancelled")]
    Cancelled,
}
