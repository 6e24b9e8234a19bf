//! Generation driver: runs one admitted attempt from `Starting` to a terminal state.
//!
//! The driver acquires the execution environment, runs the agent and relays
//! every output unit into the attempt's stream. Between outputs, and on every
//! tick while the agent is silent, it checkpoints: refreshes the heartbeat
//! and looks for a stop request in the store or on its local token.
//!
//! Every session write is conditional. When a write reveals that the record
//! was force-cleared or now belongs to a newer attempt, the driver stops
//! without touching it and closes only its own stream.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::driver::{AgentOutput, AgentRequest, AgentRuntime, ExecutionEnvironment};
use crate::models::event::StreamEventKind;
use crate::models::session::{EndReason, Session, SessionState};
use crate::persistence::cancel_repo::CancelRepo;
use crate::persistence::db::Database;
use crate::persistence::retry::RetryPolicy;
use crate::persistence::session_repo::SessionRepo;
use crate::persistence::transcript_repo::TranscriptRepo;
use crate::stream::StreamTransport;
use crate::{AppError, Result};

use super::completion::HookRunner;
use super::coordinator::{SessionCoordinator, StartOutcome};
use super::registry::DriverRegistry;

/// Failure cause recorded for attempts interrupted by node shutdown.
pub const SHUTDOWN_CAUSE: &str = "server shutdown";

/// Lost CAS races tolerated while finalizing.
const MAX_FINALIZE_RACES: usize = 8;

/// Collaborators shared by every driver on this node.
pub struct DriverDeps {
    sessions: SessionRepo,
    cancels: CancelRepo,
    transcripts: TranscriptRepo,
    transport: StreamTransport,
    hooks: HookRunner,
    agent: Arc<dyn AgentRuntime>,
    environment: Arc<dyn ExecutionEnvironment>,
    checkpoint_interval: Duration,
}

impl DriverDeps {
    /// Bundle driver collaborators.
    #[must_use]
    pub fn new(
        db: Arc<Database>,
        retry: RetryPolicy,
        transport: StreamTransport,
        hooks: HookRunner,
        agent: Arc<dyn AgentRuntime>,
        environment: Arc<dyn ExecutionEnvironment>,
        checkpoint_interval: Duration,
    ) -> Self {
        Self {
            sessions: SessionRepo::with_retry(Arc::clone(&db), retry),
            cancels: CancelRepo::with_retry(Arc::clone(&db), retry),
            transcripts: TranscriptRepo::with_retry(db, retry),
            transport,
            hooks,
            agent,
            environment,
            checkpoint_interval,
        }
    }
}

/// How an attempt ended, before the terminal writes.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Finished(String),
    Cancelled,
    Shutdown,
    Failed(String),
    Superseded,
}

/// Drives one admitted session.
pub struct GenerationDriver {
    deps: Arc<DriverDeps>,
    session: Session,
    cancel: CancellationToken,
    shutdown: CancellationToken,
}

impl GenerationDriver {
    /// Build a driver for an admitted session.
    #[must_use]
    pub fn new(
        deps: Arc<DriverDeps>,
        session: Session,
        cancel: CancellationToken,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            deps,
            session,
            cancel,
            shutdown,
        }
    }

    /// Run the attempt to completion. Never panics on collaborator failure;
    /// every failure ends in a terminal stream marker.
    pub async fn run(mut self) {
        let outcome = match self.drive().await {
            Ok(outcome) | Err(outcome) => outcome,
        };
        debug!(?outcome, "generation finished driving");
        if let Err(err) = self.finalize(outcome).await {
            error!(%err, "failed to finalize generation");
            let cause = err.to_string();
            self.record_failure(&cause).await;
            // Best effort so subscribers do not wait forever.
            if let Err(err) = self
                .deps
                .transport
                .close(&self.session.stream_id, StreamEventKind::failed(cause))
                .await
            {
                warn!(%err, "failed to close stream after finalize error");
            }
        }
    }

    /// Move this attempt's record to `failed` after the regular terminal
    /// writes gave up, so the application does not stay blocked behind a
    /// session with no driver.
    async fn record_failure(&mut self, cause: &str) {
        for _ in 0..MAX_FINALIZE_RACES {
            let current = match self.deps.sessions.get(&self.session.application_id).await {
                Ok(Some(current))
                    if current.stream_id == self.session.stream_id
                        && !current.state.is_terminal() =>
                {
                    current
                }
                Ok(_) => return,
                Err(err) => {
                    warn!(%err, "could not re-read session to record failure");
                    return;
                }
            };
            let next = current.finished(EndReason::Failed, Some(cause.to_owned()));
            match self.deps.sessions.compare_and_swap(&current, &next).await {
                Ok(Some(stored)) => {
                    self.session = stored;
                    info!(state = self.session.state.as_str(), "generation ended");
                    return;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(%err, "could not record generation failure");
                    return;
                }
            }
        }
        warn!("recording generation failure kept losing races");
    }

    async fn drive(&mut self) -> std::result::Result<Outcome, Outcome> {
        let deps = Arc::clone(&self.deps);
        let application_id = self.session.application_id.clone();
        let stream_id = self.session.stream_id.clone();

        let environment = self
            .guarded(deps.environment.request_environment(&application_id))
            .await?;
        self.session.preview_url = Some(environment.preview_url.clone());
        self.publish(StreamEventKind::Status {
            message: format!("environment ready: {}", environment.preview_url),
        })
        .await?;

        let running = Session {
            state: SessionState::Running,
            ..self.session.clone()
        };
        self.transition(running).await?;
        info!(preview_url = %environment.preview_url, "generation running");

        let prior_conversation = self
            .guarded(deps.transcripts.list(&application_id))
            .await?
            .into_iter()
            .filter(|message| message.stream_id.as_deref() != Some(stream_id.as_str()))
            .collect();
        let request = AgentRequest {
            application_id,
            prior_conversation,
            instruction: self.session.instruction.clone(),
            tool_endpoint: environment.tool_endpoint,
        };
        let mut run = self.guarded(deps.agent.run(request)).await?;

        let outcome = self.relay(&mut run.events).await;
        if matches!(outcome, Outcome::Cancelled | Outcome::Shutdown | Outcome::Superseded) {
            if let Some(abort) = run.abort {
                abort.cancel();
            }
        }
        Ok(outcome)
    }

    async fn relay(
        &mut self,
        events: &mut futures_util::stream::BoxStream<'static, Result<AgentOutput>>,
    ) -> Outcome {
        let cancel = self.cancel.clone();
        let shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(self.deps.checkpoint_interval);
        ticker.tick().await;
        let mut text = String::new();

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Outcome::Cancelled,
                () = shutdown.cancelled() => return Outcome::Shutdown,
                item = events.next() => {
                    let output = match item {
                        None => return Outcome::Finished(text),
                        Some(Err(err)) => return Outcome::Failed(err.to_string()),
                        Some(Ok(output)) => output,
                    };
                    let kind = match output {
                        AgentOutput::Finish { message } => {
                            return Outcome::Finished(message.unwrap_or(text));
                        }
                        AgentOutput::TextDelta { text: delta } => {
                            text.push_str(&delta);
                            StreamEventKind::TextDelta { text: delta }
                        }
                        AgentOutput::ToolCall { name, input } => StreamEventKind::ToolCall { name, input },
                        AgentOutput::ToolResult { name, output } => {
                            StreamEventKind::ToolResult { name, output }
                        }
                    };
                    if let Err(outcome) = self.publish(kind).await {
                        return outcome;
                    }
                    if let Some(outcome) = self.checkpoint().await {
                        return outcome;
                    }
                    ticker.reset();
                }
                _ = ticker.tick() => {
                    if let Some(outcome) = self.checkpoint().await {
                        return outcome;
                    }
                }
            }
        }
    }

    /// Await a collaborator call while still honoring stop requests.
    async fn guarded<T, F>(&mut self, call: F) -> std::result::Result<T, Outcome>
    where
        F: Future<Output = Result<T>>,
    {
        let cancel = self.cancel.clone();
        let shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(self.deps.checkpoint_interval);
        ticker.tick().await;
        tokio::pin!(call);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Outcome::Cancelled),
                () = shutdown.cancelled() => return Err(Outcome::Shutdown),
                result = &mut call => return result.map_err(classify),
                _ = ticker.tick() => {
                    if let Some(outcome) = self.checkpoint().await {
                        return Err(outcome);
                    }
                }
            }
        }
    }

    async fn publish(&self, kind: StreamEventKind) -> std::result::Result<(), Outcome> {
        self.deps
            .transport
            .publish(&self.session.stream_id, kind)
            .await
            .map(|_| ())
            .map_err(classify)
    }

    /// Refresh the heartbeat and look for a stop request.
    async fn checkpoint(&mut self) -> Option<Outcome> {
        let application_id = self.session.application_id.clone();
        let stream_id = self.session.stream_id.clone();

        match self.deps.sessions.touch_heartbeat(&application_id, &stream_id).await {
            Ok(true) => {}
            Ok(false) => {
                if let Err(outcome) = self.reconcile().await {
                    return Some(outcome);
                }
            }
            Err(err) => warn!(%err, "heartbeat refresh failed"),
        }

        match self.deps.cancels.is_requested(&stream_id).await {
            Ok(true) => Some(Outcome::Cancelled),
            Ok(false) => None,
            Err(err) => {
                warn!(%err, "cancellation check failed");
                None
            }
        }
    }

    /// Re-read the record after a failed conditional write.
    ///
    /// `Ok` carries the fresh record when it still belongs to this attempt and
    /// is active; otherwise the outcome that ends the attempt.
    async fn reconcile(&mut self) -> std::result::Result<Session, Outcome> {
        let fresh = self
            .deps
            .sessions
            .get(&self.session.application_id)
            .await
            .map_err(|err| Outcome::Failed(err.to_string()))?;
        match fresh {
            Some(fresh) if fresh.stream_id == self.session.stream_id && !fresh.state.is_terminal() => {
                let stopping = fresh.state == SessionState::Stopping;
                self.session = Session {
                    preview_url: self.session.preview_url.clone().or(fresh.preview_url.clone()),
                    ..fresh.clone()
                };
                if stopping {
                    Err(Outcome::Cancelled)
                } else {
                    Ok(fresh)
                }
            }
            _ => {
                warn!("session record no longer belongs to this attempt");
                Err(Outcome::Superseded)
            }
        }
    }

    /// Conditionally move to a non-terminal state.
    async fn transition(&mut self, next: Session) -> std::result::Result<(), Outcome> {
        let stored = self
            .deps
            .sessions
            .compare_and_swap(&self.session, &next)
            .await
            .map_err(classify)?;
        match stored {
            Some(stored) => {
                self.session = stored;
                Ok(())
            }
            None => {
                // Same attempt, still active, but changed underneath: retry once.
                let fresh = self.reconcile().await?;
                let stored = self
                    .deps
                    .sessions
                    .compare_and_swap(&fresh, &next)
                    .await
                    .map_err(classify)?;
                self.session = stored.ok_or(Outcome::Superseded)?;
                Ok(())
            }
        }
    }

    async fn finalize(&mut self, mut outcome: Outcome) -> Result<()> {
        let stream_id = self.session.stream_id.clone();

        if outcome == Outcome::Superseded {
            info!("attempt superseded; closing own stream only");
            self.deps
                .transport
                .close(&stream_id, StreamEventKind::cancelled())
                .await?;
            return Ok(());
        }

        for _ in 0..MAX_FINALIZE_RACES {
            if self.session.state == SessionState::Stopping
                && matches!(outcome, Outcome::Finished(_))
            {
                outcome = Outcome::Cancelled;
            }

            let applied = match &outcome {
                Outcome::Finished(message) => {
                    let next = self.session.finished(EndReason::Completed, None);
                    let summary = (!message.is_empty()).then_some(message.as_str());
                    self.deps
                        .sessions
                        .complete_with_hook(&self.session, &next, summary)
                        .await?
                }
                Outcome::Cancelled => {
                    let next = self.session.finished(EndReason::Cancelled, None);
                    self.deps.sessions.compare_and_swap(&self.session, &next).await?
                }
                Outcome::Shutdown => {
                    let next = self
                        .session
                        .finished(EndReason::Failed, Some(SHUTDOWN_CAUSE.to_owned()));
                    self.deps.sessions.compare_and_swap(&self.session, &next).await?
                }
                Outcome::Failed(cause) => {
                    let next = self.session.finished(EndReason::Failed, Some(cause.clone()));
                    self.deps.sessions.compare_and_swap(&self.session, &next).await?
                }
                Outcome::Superseded => None,
            };

            if let Some(stored) = applied {
                self.session = stored;
                return self.close_terminal(outcome).await;
            }

            match self.reconcile().await {
                Ok(_) => {}
                // A stop request landed while finishing; the outcome becomes cancelled.
                Err(Outcome::Cancelled) => {}
                Err(Outcome::Superseded) => {
                    self.deps
                        .transport
                        .close(&stream_id, StreamEventKind::cancelled())
                        .await?;
                    return Ok(());
                }
                Err(other) => {
                    return Err(AppError::Db(format!("finalize re-read failed: {other:?}")));
                }
            }
        }

        Err(AppError::Db("finalize kept losing races".into()))
    }

    async fn close_terminal(&self, outcome: Outcome) -> Result<()> {
        let stream_id = &self.session.stream_id;
        let marker = match &outcome {
            Outcome::Finished(message) => StreamEventKind::Finish {
                reason: EndReason::Completed,
                message: (!message.is_empty()).then(|| message.clone()),
                cause: None,
            },
            Outcome::Cancelled | Outcome::Superseded => StreamEventKind::cancelled(),
            Outcome::Shutdown => StreamEventKind::failed(SHUTDOWN_CAUSE),
            Outcome::Failed(cause) => StreamEventKind::failed(cause.clone()),
        };
        self.deps.transport.close(stream_id, marker).await?;
        info!(state = self.session.state.as_str(), "generation ended");

        if matches!(outcome, Outcome::Finished(_)) {
            if let Err(err) = self.deps.hooks.run_for(stream_id).await {
                warn!(%err, "completion hooks deferred to sweep");
            }
        }
        Ok(())
    }
}

fn classify(err: AppError) -> Outcome {
    match err {
        AppError::StreamClosed(_) | AppError::Superseded(_) => Outcome::Superseded,
        other => Outcome::Failed(other.to_string()),
    }
}

/// Admits generations and runs their drivers on this node.
#[derive(Clone)]
pub struct Generations {
    coordinator: SessionCoordinator,
    deps: Arc<DriverDeps>,
    registry: DriverRegistry,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    stop_timeout: Duration,
}

impl Generations {
    /// Build the launcher.
    #[must_use]
    pub fn new(
        coordinator: SessionCoordinator,
        deps: DriverDeps,
        registry: DriverRegistry,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            coordinator,
            deps: Arc::new(deps),
            registry,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            stop_timeout,
        }
    }

    /// Session coordinator used for admission.
    #[must_use]
    pub fn coordinator(&self) -> &SessionCoordinator {
        &self.coordinator
    }

    /// Start a generation, preempting the active one, and spawn its driver.
    ///
    /// # Errors
    ///
    /// Returns `AppError::BadRequest` for an empty instruction and
    /// `AppError::Unavailable` if the store stays unreachable.
    pub async fn start(
        &self,
        application_id: &str,
        instruction: &str,
        notify_to: Option<String>,
    ) -> Result<StartOutcome> {
        if application_id.trim().is_empty() || instruction.trim().is_empty() {
            return Err(AppError::BadRequest(
                "application id and instruction are required".into(),
            ));
        }
        let outcome = self
            .coordinator
            .start_or_preempt(application_id, instruction, notify_to, self.stop_timeout)
            .await?;
        if let StartOutcome::Accepted(ref session) = outcome {
            self.spawn(session.clone());
        }
        Ok(outcome)
    }

    /// Spawn the driver of an admitted session.
    pub fn spawn(&self, session: Session) {
        let span = info_span!(
            "generation",
            application_id = %session.application_id,
            stream_id = %session.stream_id
        );
        let stream_id = session.stream_id.clone();
        let cancel = self.registry.register(&stream_id);
        let driver = GenerationDriver::new(
            Arc::clone(&self.deps),
            session,
            cancel,
            self.shutdown.child_token(),
        );
        let registry = self.registry.clone();
        self.tracker.spawn(
            async move {
                driver.run().await;
                registry.remove(&stream_id);
            }
            .instrument(span),
        );
    }

    /// Number of drivers running on this node.
    #[must_use]
    pub fn running(&self) -> usize {
        self.registry.len()
    }

    /// Interrupt local drivers and wait up to `grace` for them to finish.
    ///
    /// Returns `false` if some drivers were still running at the deadline.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.shutdown.cancel();
        self.tracker.close();
        let drained = tokio::time::timeout(grace, self.tracker.wait()).await.is_ok();
        if drained {
            info!("generation drivers drained");
        } else {
            warn!(remaining = self.registry.len(), "generation drivers still running at shutdown deadline");
        }
        drained
    }
}
