//! A single delivered message's lifecycle: `Pending` until the caller enters
//! its scope, `Acquired` while in scope (with a background task extending
//! the lease), `Done` once acked or nacked. Mirrors the teacher's
//! `pending: Mutex<HashMap<Uuid, JobUpdate>>` idea of holding per-job state
//! until a single flush, but here the "flush" is ack/nack against a row that
//! may vanish out from under a lost lease.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::JobError;
use crate::ops::data_access;
use crate::types::Bytes;

#[derive(Debug, PartialEq, Eq)]
enum HandleState {
    Pending,
    Acquired,
    Done,
}

/// Shared between a `ReceivedBatch` and every `Job` it handed out, so a
/// `Job` can tell whether the receive session that delivered it is still
/// open. Flipped synchronously when the batch exits scope, ahead of the
/// (async, best-effort) nacks that follow - so a racing `acquire()` always
/// observes the session as gone rather than sometimes winning the race.
pub(crate) type SessionGuard = Arc<AtomicBool>;

pub(crate) fn new_session_guard() -> SessionGuard {
    Arc::new(AtomicBool::new(true))
}

/// One message, checked out for processing. Acquire it with [`Job::acquire`],
/// do the work, then call [`Job::ack`] on success or [`Job::nack`] to put it
/// back for redelivery. A handle still outstanding when its owning receive
/// session exits is nacked by that session (see `ReceivedBatch`), not by
/// `Job`'s own `Drop` - by the time an individual `Job` is dropped in
/// isolation there is no session left to coordinate with.
pub struct Job {
    pool: PgPool,
    queue_name: String,
    id: Uuid,
    body: Bytes,
    ack_deadline: ChronoDuration,
    state: Mutex<HandleState>,
    renewer: Mutex<Option<JoinHandle<()>>>,
    session_open: SessionGuard,
}

impl Job {
    pub(crate) fn new(
        pool: PgPool,
        queue_name: String,
        id: Uuid,
        body: Bytes,
        ack_deadline: ChronoDuration,
        session_open: SessionGuard,
    ) -> Self {
        Job {
            pool,
            queue_name,
            id,
            body,
            ack_deadline,
            state: Mutex::new(HandleState::Pending),
            renewer: Mutex::new(None),
            session_open,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Enter the handle's scope: starts the background lease renewer. Fails
    /// with [`JobError::AlreadyProcessing`] if already acquired,
    /// [`JobError::AlreadyCompleted`] if already acked or nacked, or
    /// [`JobError::NoLongerAvailable`] if the owning receive session has
    /// already exited (and so has nacked, or is about to nack, this handle).
    pub async fn acquire(&self) -> Result<(), JobError> {
        let mut state = self.state.lock().await;
        match *state {
            HandleState::Pending => {}
            HandleState::Acquired => return Err(JobError::AlreadyProcessing(self.id)),
            HandleState::Done => return Err(JobError::AlreadyCompleted(self.id)),
        }

        if !self.session_open.load(Ordering::SeqCst) {
            return Err(JobError::NoLongerAvailable(self.id));
        }

        *state = HandleState::Acquired;
        drop(state);

        let renewer = tokio::spawn(renew_loop(
            self.pool.clone(),
            self.queue_name.clone(),
            self.id,
            self.ack_deadline,
        ));
        *self.renewer.lock().await = Some(renewer);

        Ok(())
    }

    /// Mark the message done and delete it. Stops the renewer first so it
    /// can't race an extend against the delete. Requires a prior successful
    /// `acquire()`.
    pub async fn ack(&self) -> Result<(), JobError> {
        self.finish(HandleState::Done).await?;
        data_access::ack(&self.pool, &self.queue_name, self.id)
            .await
            .map_err(JobError::from)
    }

    /// Put the message back for immediate redelivery. Requires a prior
    /// successful `acquire()`.
    pub async fn nack(&self) -> Result<(), JobError> {
        self.finish(HandleState::Done).await?;
        data_access::nack(&self.pool, &self.queue_name, self.id)
            .await
            .map_err(JobError::from)
    }

    async fn finish(&self, to: HandleState) -> Result<(), JobError> {
        let mut state = self.state.lock().await;
        match *state {
            HandleState::Pending => return Err(JobError::NotAcquired(self.id)),
            HandleState::Done => return Err(JobError::AlreadyCompleted(self.id)),
            HandleState::Acquired => {}
        }
        *state = to;
        drop(state);

        if let Some(renewer) = self.renewer.lock().await.take() {
            renewer.abort();
        }

        Ok(())
    }

    /// Best-effort: nack this handle if the receive session that delivered
    /// it exited before the caller ever `acquire`d it - the spec's "yielded
    /// but not yet acquired" edge case. A handle that was acquired and then
    /// abandoned mid-flight is left alone: the caller may already have
    /// applied partial side effects, so its lease is left to expire
    /// naturally rather than being force-nacked. Not public: callers use
    /// `ack`/`nack` directly, this only exists for session teardown.
    pub(crate) async fn nack_if_never_acquired(&self) {
        {
            let mut state = self.state.lock().await;
            if *state != HandleState::Pending {
                return;
            }
            *state = HandleState::Done;
        }

        if let Err(err) = data_access::nack(&self.pool, &self.queue_name, self.id).await {
            warn!(job_id = %self.id, error = %err, "failed to nack on receive session exit");
        }
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        if let Ok(mut renewer) = self.renewer.try_lock() {
            if let Some(renewer) = renewer.take() {
                renewer.abort();
            }
        }
    }
}

/// Extends the lease at a fraction of the ack deadline, so a slow caller
/// never loses the row mid-flight. Stops silently once `extend_deadline`
/// reports the row is gone (it was acked, or another poller reclaimed it
/// after this lease expired).
async fn renew_loop(pool: PgPool, queue_name: String, id: Uuid, ack_deadline: ChronoDuration) {
    let margin = ack_deadline
        * (crate::config::DEFAULT_RENEWAL_MARGIN_NUM as i32)
        / (crate::config::DEFAULT_RENEWAL_MARGIN_DEN as i32);
    let interval = margin.to_std().unwrap_or(std::time::Duration::from_secs(1));

    loop {
        tokio::time::sleep(interval).await;

        match data_access::extend_deadline(&pool, &queue_name, id).await {
            Ok(Some(_)) => {
                debug!(job_id = %id, "extended lease");
            }
            Ok(None) => {
                debug!(job_id = %id, "lease row gone, stopping renewer");
                return;
            }
            Err(err) => {
                warn!(job_id = %id, error = %err, "failed to extend lease, retrying");
            }
        }
    }
}

