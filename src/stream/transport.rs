//! Resumable fan-out of one producer's events to any number of subscribers.
//!
//! Events live in the shared store, so a subscriber attached through any node
//! sees the same total order. Subscribers on the publishing node are woken
//! through a per-stream [`Notify`]; every subscriber also re-polls the store,
//! which is what serves subscribers attached through other nodes.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::config::{StreamConfig, MAX_GRACE_PERIOD_SECONDS};
use crate::models::event::{StartAt, StreamEvent, StreamEventKind};
use crate::persistence::db::Database;
use crate::persistence::retry::RetryPolicy;
use crate::persistence::session_repo::SessionRepo;
use crate::persistence::stream_repo::StreamRepo;
use crate::{AppError, Result};

/// Events fetched from the store per round trip.
const READ_BATCH: u32 = 256;
/// How long a terminal session may lack its terminal marker before
/// subscribers give up waiting for it.
const MARKER_WAIT_SECONDS: i64 = 10;

/// Finite, ordered stream of events for one subscription.
pub type EventStream = BoxStream<'static, Result<StreamEvent>>;

type NotifierMap = Arc<Mutex<HashMap<String, Weak<Notify>>>>;

/// Multiplexes one producer's events to N consumers with replay.
#[derive(Clone)]
pub struct StreamTransport {
    streams: StreamRepo,
    sessions: SessionRepo,
    notifiers: NotifierMap,
    poll_interval: Duration,
    grace_period: chrono::Duration,
}

impl StreamTransport {
    /// Build a transport over the shared store.
    #[must_use]
    pub fn new(db: Arc<Database>, retry: RetryPolicy, config: &StreamConfig) -> Self {
        Self {
            streams: StreamRepo::with_retry(Arc::clone(&db), retry),
            sessions: SessionRepo::with_retry(db, retry),
            notifiers: NotifierMap::default(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            grace_period: chrono::Duration::seconds(
                i64::try_from(config.grace_period_seconds.min(MAX_GRACE_PERIOD_SECONDS))
                    .unwrap_or_default(),
            ),
        }
    }

    /// Create the empty buffer for a new attempt so subscribers can attach
    /// before the first event.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` or `AppError::Unavailable` on store failure.
    pub async fn open(&self, stream_id: &str, application_id: &str) -> Result<()> {
        self.streams.open(stream_id, application_id).await?;
        debug!(stream_id, application_id, "stream buffer opened");
        Ok(())
    }

    /// Append a non-terminal event with the next sequence number.
    ///
    /// Never waits for consumers.
    ///
    /// # Errors
    ///
    /// Returns `AppError::BadRequest` for a terminal event (use
    /// [`close`](Self::close)), `AppError::StreamClosed` if the buffer is
    /// frozen or unknown.
    pub async fn publish(&self, stream_id: &str, kind: StreamEventKind) -> Result<StreamEvent> {
        if kind.is_terminal() {
            return Err(AppError::BadRequest(
                "terminal events must be published through close".into(),
            ));
        }
        let event = self
            .streams
            .append(stream_id, &kind)
            .await?
            .ok_or_else(|| AppError::StreamClosed(format!("stream {stream_id} is not open")))?;
        self.wake(stream_id);
        Ok(event)
    }

    /// Publish the terminal marker and freeze the buffer.
    ///
    /// Returns `None` if the buffer was already frozen, so closing twice is
    /// harmless.
    ///
    /// # Errors
    ///
    /// Returns `AppError::BadRequest` if `final_event` is not terminal.
    pub async fn close(
        &self,
        stream_id: &str,
        final_event: StreamEventKind,
    ) -> Result<Option<StreamEvent>> {
        if !final_event.is_terminal() {
            return Err(AppError::BadRequest(
                "close requires a terminal event".into(),
            ));
        }
        let expires_at = Utc::now() + self.grace_period;
        let closed = self.streams.close(stream_id, &final_event, expires_at).await?;
        self.wake(stream_id);
        if let Some(ref event) = closed {
            info!(stream_id, sequence = event.sequence, "stream closed");
        }
        Ok(closed)
    }

    /// Attach to a stream, replaying from `from`.
    ///
    /// The returned stream ends after the terminal marker, when the frozen
    /// buffer is drained, or when the owning session no longer references this
    /// stream (force-cleared or superseded).
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the buffer never existed or has expired.
    pub async fn subscribe(&self, stream_id: &str, from: StartAt) -> Result<EventStream> {
        let buffer = self
            .streams
            .buffer(stream_id)
            .await?
            .filter(|info| !info.is_expired(Utc::now()))
            .ok_or_else(|| AppError::NotFound(format!("stream {stream_id} not found")))?;

        let next = match from {
            StartAt::Sequence(sequence) => sequence,
            StartAt::Tail => self.streams.next_sequence(stream_id).await?,
        };

        let cursor = Cursor {
            streams: self.streams.clone(),
            sessions: self.sessions.clone(),
            stream_id: buffer.stream_id,
            application_id: buffer.application_id,
            next,
            pending: VecDeque::new(),
            notify: self.notifier(stream_id),
            poll_interval: self.poll_interval,
            done: false,
        };

        Ok(stream::unfold(cursor, Cursor::advance).boxed())
    }

    fn notifier(&self, stream_id: &str) -> Arc<Notify> {
        let mut map = self
            .notifiers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        map.retain(|_, weak| weak.strong_count() > 0);
        if let Some(existing) = map.get(stream_id).and_then(Weak::upgrade) {
            return existing;
        }
        let notify = Arc::new(Notify::new());
        map.insert(stream_id.to_owned(), Arc::downgrade(&notify));
        notify
    }

    fn wake(&self, stream_id: &str) {
        let notify = self
            .notifiers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(stream_id)
            .and_then(Weak::upgrade);
        if let Some(notify) = notify {
            notify.notify_waiters();
        }
    }
}

/// Read position of one subscription.
struct Cursor {
    streams: StreamRepo,
    sessions: SessionRepo,
    stream_id: String,
    application_id: String,
    next: u64,
    pending: VecDeque<StreamEvent>,
    notify: Arc<Notify>,
    poll_interval: Duration,
    done: bool,
}

impl Cursor {
    async fn advance(mut self) -> Option<(Result<StreamEvent>, Self)> {
        if self.done {
            return None;
        }
        loop {
            if let Some(event) = self.pending.pop_front() {
                self.next = event.sequence + 1;
                if event.kind.is_terminal() {
                    self.done = true;
                }
                return Some((Ok(event), self));
            }

            let notify = Arc::clone(&self.notify);
            let notified = notify.notified();
            tokio::pin!(notified);
            // Register before reading so a publish between the read and the
            // wait is not missed.
            notified.as_mut().enable();

            match self.poll_once().await {
                Ok(Poll::Events) => continue,
                Ok(Poll::Finished) => return None,
                Ok(Poll::Idle) => {}
                Err(err) => {
                    self.done = true;
                    return Some((Err(err), self));
                }
            }

            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn poll_once(&mut self) -> Result<Poll> {
        let buffer = self.streams.buffer(&self.stream_id).await?;
        let Some(buffer) = buffer else {
            debug!(stream_id = %self.stream_id, "buffer collected while subscribed");
            return Ok(Poll::Finished);
        };
        let closed_before_read = buffer.is_closed();

        let batch = self
            .streams
            .read_from(&self.stream_id, self.next, READ_BATCH)
            .await?;
        if !batch.is_empty() {
            self.pending.extend(batch);
            return Ok(Poll::Events);
        }
        if closed_before_read {
            return Ok(Poll::Finished);
        }

        match self.sessions.get(&self.application_id).await? {
            Some(session) if session.stream_id == self.stream_id => {
                // The driver closes its stream right after the terminal write.
                let marker_overdue = session
                    .ended_at
                    .is_some_and(|ended| {
                        Utc::now() - ended > chrono::Duration::seconds(MARKER_WAIT_SECONDS)
                    });
                if session.state.is_terminal() && marker_overdue {
                    debug!(stream_id = %self.stream_id, "session terminal without terminal marker");
                    Ok(Poll::Finished)
                } else {
                    Ok(Poll::Idle)
                }
            }
            _ => {
                debug!(stream_id = %self.stream_id, "stream superseded; ending subscription");
                Ok(Poll::Finished)
            }
        }
    }
}

enum Poll {
    Events,
    Idle,
    Finished,
}
