//! Outbound user notifications.
//!
//! Delivery is fire-and-forget: [`NotificationService`] buffers messages in a
//! bounded queue and a background worker hands them to the configured
//! [`NotificationSink`], retrying with capped exponential backoff. A message
//! that still fails after the configured attempts is logged and dropped.

pub mod sms;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::driver::BoxFuture;
use crate::{AppError, Result};

pub use sms::SmsSink;

const QUEUE_CAPACITY: usize = 256;
/// First retry delay; doubles per attempt.
pub const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// A message for one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Recipient address (phone number for SMS).
    pub recipient: String,
    /// Message text.
    pub message: String,
}

/// Delivers notifications.
pub trait NotificationSink: Send + Sync {
    /// Deliver one notification.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Notify` on delivery failure.
    fn send<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, ()>;
}

/// Queue in front of a [`NotificationSink`].
#[derive(Clone)]
pub struct NotificationService {
    queue_tx: mpsc::Sender<Notification>,
}

impl NotificationService {
    /// Start the delivery worker with the default retry delay.
    #[must_use]
    pub fn start(sink: Arc<dyn NotificationSink>, max_attempts: u32) -> (Self, JoinHandle<()>) {
        Self::start_with_delay(sink, max_attempts, INITIAL_RETRY_DELAY)
    }

    /// Start the delivery worker with an explicit first retry delay.
    #[must_use]
    pub fn start_with_delay(
        sink: Arc<dyn NotificationSink>,
        max_attempts: u32,
        initial_delay: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
        let worker = spawn_worker(sink, queue_rx, max_attempts.max(1), initial_delay);
        info!(max_attempts, "notification service started");
        (Self { queue_tx }, worker)
    }

    /// Queue a notification without waiting for delivery.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Notify` if the queue is full or the worker stopped.
    pub fn enqueue(&self, notification: Notification) -> Result<()> {
        self.queue_tx
            .try_send(notification)
            .map_err(|err| AppError::Notify(format!("failed to enqueue notification: {err}")))
    }
}

impl NotificationSink for NotificationService {
    fn send<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, ()> {
        let queued = self.enqueue(notification.clone());
        Box::pin(async move { queued })
    }
}

fn spawn_worker(
    sink: Arc<dyn NotificationSink>,
    mut queue_rx: mpsc::Receiver<Notification>,
    max_attempts: u32,
    initial_delay: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notification) = queue_rx.recv().await {
            let mut backoff = initial_delay;
            let mut attempt = 1;
            loop {
                match sink.send(&notification).await {
                    Ok(()) => {
                        info!(recipient = %notification.recipient, "notification sent");
                        break;
                    }
                    Err(err) if attempt >= max_attempts => {
                        error!(%err, recipient = %notification.recipient, attempt, "notification dropped");
                        break;
                    }
                    Err(err) => {
                        warn!(%err, delay = ?backoff, attempt, "notification failed; retrying");
                        sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_RETRY_DELAY);
                        attempt += 1;
                    }
                }
            }
        }
        info!("notification worker exiting");
    })
}
