//! Wraps `sqlx::postgres::PgListener`, which already implements
//! reconnect-and-relisten, and fans the two channels out to any number of
//! in-process subscribers as bounded, lossy broadcast streams.

use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use std::time::Duration;

use crate::error::QueueError;
use crate::types::{NotificationEvent, NotificationKind, JOB_COMPLETED_CHANNEL, NEW_JOB_CHANNEL};

/// Subscribers that fall behind by more than this many events lose the
/// oldest ones rather than block the listener loop.
const CHANNEL_CAPACITY: usize = 1024;

/// Owns the single `LISTEN` connection for a pool and republishes every
/// notification to subscribers. Cloning a `NotificationHub` is cheap and
/// shares the same underlying broadcast channel.
#[derive(Clone)]
pub struct NotificationHub {
    sender: broadcast::Sender<NotificationEvent>,
}

impl NotificationHub {
    /// Open a dedicated `PgListener` against `pool` and start its pump task.
    /// The pump runs until `shutdown` is cancelled or the listener's recv
    /// loop errors out.
    pub async fn connect(pool: &PgPool, shutdown: CancellationToken) -> Result<Self, QueueError> {
        let mut listener = PgListener::connect_with(pool).await?;
        listener
            .listen_all([NEW_JOB_CHANNEL, JOB_COMPLETED_CHANNEL])
            .await?;

        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        let hub = NotificationHub { sender };

        tokio::spawn(pump(listener, hub.sender.clone(), shutdown));

        Ok(hub)
    }

    /// Subscribe to every event the hub sees. Events published before this
    /// call are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.sender.subscribe()
    }

    /// Wait for the next event of `kind`, ignoring any other kind seen in
    /// the meantime, up to `timeout`. Returns `None` on timeout. A one-shot
    /// counterpart to [`NotificationHub::subscribe`] for callers that only
    /// care about a single upcoming event rather than a running stream.
    pub async fn wait_for_any(&self, kind: NotificationKind, timeout: Duration) -> Option<NotificationEvent> {
        let mut receiver = self.subscribe();
        tokio::time::timeout(timeout, async move {
            loop {
                match receiver.recv().await {
                    Ok(event) if event.kind() == kind => return Some(event),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .await
        .unwrap_or(None)
    }
}

async fn pump(
    mut listener: PgListener,
    sender: broadcast::Sender<NotificationEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let notification = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("notification pump shutting down");
                return;
            }
            result = listener.recv() => result,
        };

        let notification = match notification {
            Ok(notification) => notification,
            Err(err) => {
                // PgListener::recv already retries transient connection
                // failures internally; an error here means the listener
                // itself gave up.
                warn!(error = %err, "notification listener recv failed, stopping pump");
                return;
            }
        };

        let event = match notification.channel() {
            NEW_JOB_CHANNEL => Some(NotificationEvent::new_job(notification.payload())),
            JOB_COMPLETED_CHANNEL => NotificationEvent::job_completed(notification.payload()),
            other => {
                warn!(channel = other, "notification on unexpected channel");
                None
            }
        };

        if let Some(event) = event {
            // No receivers is a normal, common state - not an error.
            let _ = sender.send(event);
        }
    }
}
