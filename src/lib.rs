// We do this pattern (privately use a module, then re-export parts of it) so we can refactor/rename or generally futz around with the internals without breaking the public API

mod ops;

// Types
mod types;
pub use types::Bytes;
pub use types::NotificationEvent;
pub use types::NotificationKind;
pub use types::PolledMessage;
pub use types::QueueRecord;
pub use types::QueueStatistics;

// Errors
mod error;
// Errors about a specific delivery's handle - lock already held, already finished, etc
pub use error::JobError;
// Errors about the queue itself - missing queues, timeouts, postgres/network errors
pub use error::QueueError;

// Config
mod config;
pub use config::PoolConfig;
pub use config::QueueConfig;

// Notification fan-out
mod notify;
pub use notify::NotificationHub;

// A single delivered message's lifecycle
mod handle;
pub use handle::Job;

// Consume side
mod receive;
pub use receive::{ReceivedBatch, ReceivedJob, ReceiveSession};

// Publish side
mod send;
pub use send::SendHandle;

// Correlates completions with the publish side
mod completion;
pub use completion::CompletionTracker;

// The top-level façade
mod queue;
pub use queue::QueueHandle;

#[doc(hidden)]
pub mod test_support {
    pub use crate::ops::data_access;
}
