//! Admission control: at most one active generation per application.
//!
//! Every decision is a conditional write against the shared session store,
//! so two nodes racing on the same application cannot both win. Nothing here
//! holds node-local state that admission depends on.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::CoordinatorConfig;
use crate::models::event::StreamEventKind;
use crate::models::session::{EndReason, Session, SessionState};
use crate::models::transcript::{Role, TranscriptMessage};
use crate::persistence::cancel_repo::CancelRepo;
use crate::persistence::db::Database;
use crate::persistence::retry::RetryPolicy;
use crate::persistence::session_repo::SessionRepo;
use crate::persistence::transcript_repo::TranscriptRepo;
use crate::stream::StreamTransport;
use crate::{AppError, Result};

use super::registry::DriverRegistry;

/// Lost CAS races tolerated before a stop request reports failure.
const MAX_STOP_RACES: usize = 8;

/// Result of an admission attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    /// A new attempt was admitted in `Starting`.
    Accepted(Session),
    /// Another attempt is active; retry shortly.
    Busy,
}

impl StartOutcome {
    /// Stream id of the admitted attempt.
    #[must_use]
    pub fn stream_id(&self) -> Option<&str> {
        match self {
            Self::Accepted(session) => Some(&session.stream_id),
            Self::Busy => None,
        }
    }
}

/// Decides which generation may run for each application.
#[derive(Clone)]
pub struct SessionCoordinator {
    sessions: SessionRepo,
    cancels: CancelRepo,
    transcripts: TranscriptRepo,
    transport: StreamTransport,
    registry: DriverRegistry,
    poll_interval: Duration,
}

impl SessionCoordinator {
    /// Build a coordinator over the shared store.
    #[must_use]
    pub fn new(
        db: Arc<Database>,
        retry: RetryPolicy,
        transport: StreamTransport,
        registry: DriverRegistry,
        config: &CoordinatorConfig,
    ) -> Self {
        Self {
            sessions: SessionRepo::with_retry(Arc::clone(&db), retry),
            cancels: CancelRepo::with_retry(Arc::clone(&db), retry),
            transcripts: TranscriptRepo::with_retry(db, retry),
            transport,
            registry,
            poll_interval: config.poll_interval(),
        }
    }

    /// Current session record of an application.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` or `AppError::Unavailable` on store failure.
    pub async fn current(&self, application_id: &str) -> Result<Option<Session>> {
        self.sessions.get(application_id).await
    }

    /// Admit a new attempt if no other one is active.
    ///
    /// On success the stream buffer is open and the instruction is in the
    /// transcript before this returns. If either step fails after admission,
    /// the admitted record is moved to `failed` so it does not block the
    /// application.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unavailable` if the store stays unreachable.
    pub async fn try_start(
        &self,
        application_id: &str,
        instruction: &str,
        notify_to: Option<String>,
    ) -> Result<StartOutcome> {
        let candidate = Session::starting(
            application_id.to_owned(),
            instruction.to_owned(),
            notify_to,
        );

        let admitted = match self.sessions.get(application_id).await? {
            None => self
                .sessions
                .insert(&candidate)
                .await?
                .then(|| candidate.clone()),
            Some(existing) if existing.state.is_terminal() => {
                self.sessions.compare_and_swap(&existing, &candidate).await?
            }
            Some(existing) => {
                debug!(
                    application_id,
                    active_stream = %existing.stream_id,
                    state = existing.state.as_str(),
                    "start refused; attempt already active"
                );
                None
            }
        };

        let Some(session) = admitted else {
            return Ok(StartOutcome::Busy);
        };

        if let Err(err) = self.prepare(&session).await {
            self.abandon(&session, &err).await;
            return Err(err);
        }

        info!(application_id, stream_id = %session.stream_id, "generation admitted");
        Ok(StartOutcome::Accepted(session))
    }

    /// Open the attempt's buffer and record its instruction.
    async fn prepare(&self, session: &Session) -> Result<()> {
        self.transport
            .open(&session.stream_id, &session.application_id)
            .await?;
        self.transcripts
            .append(&TranscriptMessage::new(
                session.application_id.clone(),
                Some(session.stream_id.clone()),
                Role::User,
                session.instruction.clone(),
            ))
            .await
    }

    /// Release an admission whose preparation failed.
    async fn abandon(&self, session: &Session, err: &AppError) {
        let cause = err.to_string();
        let failed = session.finished(EndReason::Failed, Some(cause.clone()));
        match self.sessions.compare_and_swap(session, &failed).await {
            Ok(Some(_)) => warn!(
                application_id = %session.application_id,
                stream_id = %session.stream_id,
                %err,
                "admission rolled back"
            ),
            Ok(None) => debug!(
                application_id = %session.application_id,
                "admitted record changed before rollback"
            ),
            Err(undo) => error!(
                application_id = %session.application_id,
                %undo,
                "failed to roll back admission"
            ),
        }
        if let Err(close) = self
            .transport
            .close(&session.stream_id, StreamEventKind::failed(cause))
            .await
        {
            debug!(stream_id = %session.stream_id, %close, "no buffer to close after rollback");
        }
    }

    /// Ask the active attempt to stop.
    ///
    /// Returns `true` if an attempt is (now or already) stopping, `false` if
    /// nothing was running. Does not wait.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unavailable` if the store stays unreachable.
    pub async fn request_stop(&self, application_id: &str) -> Result<bool> {
        for _ in 0..MAX_STOP_RACES {
            let Some(observed) = self.sessions.get(application_id).await? else {
                return Ok(false);
            };
            if observed.state.is_terminal() {
                return Ok(false);
            }

            let stopping = if observed.state == SessionState::Stopping {
                Some(observed)
            } else {
                let next = Session {
                    state: SessionState::Stopping,
                    cancel_requested_at: Some(Utc::now()),
                    ..observed.clone()
                };
                self.sessions.compare_and_swap(&observed, &next).await?
            };

            if let Some(session) = stopping {
                self.cancels
                    .request(application_id, &session.stream_id)
                    .await?;
                let local = self.registry.cancel(&session.stream_id);
                info!(application_id, stream_id = %session.stream_id, local, "stop requested");
                return Ok(true);
            }
            debug!(application_id, "stop raced with another writer; re-reading");
        }
        warn!(application_id, "stop request kept losing races");
        Ok(false)
    }

    /// Poll until the application has no active attempt or `timeout` elapses.
    ///
    /// Never mutates state.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unavailable` if the store stays unreachable.
    pub async fn await_stopped(&self, application_id: &str, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let stopped = self
                .sessions
                .get(application_id)
                .await?
                .is_none_or(|session| session.state.is_terminal());
            if stopped {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Unconditionally remove the session record.
    ///
    /// The abandoned stream is closed with a cancelled marker so its
    /// subscribers end and the buffer becomes collectable.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unavailable` if the store stays unreachable.
    pub async fn force_clear(&self, application_id: &str) -> Result<()> {
        let previous = self.sessions.get(application_id).await?;
        let removed = self.sessions.delete(application_id).await?;
        if let Some(previous) = previous {
            warn!(
                application_id,
                stream_id = %previous.stream_id,
                state = previous.state.as_str(),
                removed,
                "force-cleared session that did not stop in time"
            );
            self.registry.cancel(&previous.stream_id);
            self.transport
                .close(&previous.stream_id, StreamEventKind::cancelled())
                .await?;
        }
        Ok(())
    }

    /// Start a new attempt, preempting the active one if needed.
    ///
    /// Busy means the active attempt did not stop within `timeout`; its record
    /// has been cleared and the caller should retry.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unavailable` if the store stays unreachable.
    pub async fn start_or_preempt(
        &self,
        application_id: &str,
        instruction: &str,
        notify_to: Option<String>,
        timeout: Duration,
    ) -> Result<StartOutcome> {
        let first = self
            .try_start(application_id, instruction, notify_to.clone())
            .await?;
        if matches!(first, StartOutcome::Accepted(_)) {
            return Ok(first);
        }

        self.request_stop(application_id).await?;
        if self.await_stopped(application_id, timeout).await? {
            return self.try_start(application_id, instruction, notify_to).await;
        }

        self.force_clear(application_id).await?;
        Ok(StartOutcome::Busy)
    }
}
