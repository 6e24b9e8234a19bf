//! Completion hooks: side effects that fire once per normally completed attempt.
//!
//! The `completion_hook` row written together with the Completed transition
//! is the one-time flag. A runner claims it (`pending → claimed`) before any
//! hook runs, so hooks fire at most once per stream id even when several
//! runners race or a runner is retried. Rows left pending by a runner that
//! died before claiming are picked up by the sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::driver::BoxFuture;
use crate::models::hook::CompletionRecord;
use crate::notify::{Notification, NotificationSink};
use crate::persistence::hook_repo::HookRepo;
use crate::Result;

/// Interval between sweeps for unclaimed records.
pub const HOOK_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Records younger than this are left to the runner that wrote them.
pub const HOOK_SWEEP_MIN_AGE: Duration = Duration::from_secs(30);

/// A side effect of a normally completed generation.
pub trait CompletionHook: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Run the hook for a claimed record.
    ///
    /// # Errors
    ///
    /// Any error is logged by the runner and otherwise ignored.
    fn on_completed<'a>(&'a self, record: &'a CompletionRecord) -> BoxFuture<'a, ()>;
}

/// Texts the preview link to the requester.
pub struct NotifyPreviewHook {
    sink: Arc<dyn NotificationSink>,
    preview_domain: Option<String>,
}

impl NotifyPreviewHook {
    /// Build the hook over a notification sink.
    #[must_use]
    pub fn new(sink: Arc<dyn NotificationSink>, preview_domain: Option<String>) -> Self {
        Self {
            sink,
            preview_domain,
        }
    }

    /// Preview link for a record: the environment's URL, else the configured domain.
    #[must_use]
    pub fn preview_link(&self, record: &CompletionRecord) -> Option<String> {
        record.preview_url.clone().or_else(|| {
            self.preview_domain
                .as_deref()
                .map(|domain| format!("https://{}.{domain}", record.application_id))
        })
    }

    async fn notify(&self, record: &CompletionRecord) -> Result<()> {
        let Some(recipient) = record.notify_to.clone() else {
            return Ok(());
        };
        let Some(link) = self.preview_link(record) else {
            debug!(stream_id = %record.stream_id, "no preview link; skipping notification");
            return Ok(());
        };
        let notification = Notification {
            recipient,
            message: format!("Your app is ready! Preview: {link}"),
        };
        self.sink.send(&notification).await
    }
}

impl CompletionHook for NotifyPreviewHook {
    fn name(&self) -> &'static str {
        "notify_preview"
    }

    fn on_completed<'a>(&'a self, record: &'a CompletionRecord) -> BoxFuture<'a, ()> {
        Box::pin(self.notify(record))
    }
}

/// Claims completion records and runs the registered hooks.
#[derive(Clone)]
pub struct HookRunner {
    records: HookRepo,
    hooks: Arc<Vec<Arc<dyn CompletionHook>>>,
}

impl HookRunner {
    /// Build a runner.
    #[must_use]
    pub fn new(records: HookRepo, hooks: Vec<Arc<dyn CompletionHook>>) -> Self {
        Self {
            records,
            hooks: Arc::new(hooks),
        }
    }

    /// Claim the record of `stream_id` and run every hook.
    ///
    /// Returns `false` if the record was already claimed or does not exist.
    /// Hook failures are logged, never returned.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unavailable` if the claim cannot reach the store.
    pub async fn run_for(&self, stream_id: &str) -> Result<bool> {
        let Some(record) = self.records.claim(stream_id).await? else {
            debug!(stream_id, "completion record already claimed");
            return Ok(false);
        };

        for hook in self.hooks.iter() {
            match hook.on_completed(&record).await {
                Ok(()) => info!(stream_id, hook = hook.name(), "completion hook ran"),
                Err(err) => warn!(stream_id, hook = hook.name(), %err, "completion hook failed"),
            }
        }
        Ok(true)
    }

    /// Claim and run records still pending after `min_age`.
    ///
    /// Returns how many records this call fired.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unavailable` if the store stays unreachable.
    pub async fn sweep(&self, min_age: Duration) -> Result<usize> {
        let age = chrono::Duration::from_std(min_age).unwrap_or_else(|_| chrono::Duration::zero());
        let pending = self.records.list_pending_before(Utc::now() - age).await?;
        let mut fired = 0;
        for record in pending {
            if self.run_for(&record.stream_id).await? {
                fired += 1;
            }
        }
        Ok(fired)
    }
}

/// Spawn the periodic sweep; the first pass runs immediately.
#[must_use]
pub fn spawn_hook_sweep(
    runner: HookRunner,
    interval: Duration,
    min_age: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("hook sweep shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        match runner.sweep(min_age).await {
                            Ok(0) => debug!("hook sweep found nothing pending"),
                            Ok(fired) => info!(fired, "hook sweep fired pending hooks"),
                            Err(err) => error!(%err, "hook sweep failed"),
                        }
                    }
                }
            }
        }
        .instrument(info_span!("hook_sweep")),
    )
}
