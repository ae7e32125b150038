use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::adapter::EventStream;
use crate::errors::StreamError;
use crate::event::StreamEvent;

/// Observable queue lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueState {
    /// Created, nothing consumed yet.
    Idle,
    /// Consumption has started and no sequence has failed.
    Processing,
    /// Closed and fully drained without sequence failures.
    Closed,
    /// At least one sequence failed. Sticky: later clean sequences and the
    /// final close never clear it. Completion is signalled by `next_event`
    /// returning `Ok(None)`, not by this state.
    Error,
}

/// Wakeups are edge-triggered; the interval bounds the wait when a
/// notification races the lock hand-off.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(25);

struct QueueInner {
    pending: VecDeque<EventStream>,
    closed: bool,
    state: QueueState,
}

impl QueueInner {
    /// State changes respect stickiness of `Error`.
    fn advance_state(&mut self, next: QueueState) {
        if self.state != QueueState::Error {
            self.state = next;
        }
    }
}

struct QueueShared {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

/// Producer half: appends sequences and closes the queue. Cheap to clone.
#[derive(Clone)]
pub struct QueueHandle {
    shared: Arc<QueueShared>,
}

impl QueueHandle {
    /// Appends a pending adapter sequence.
    ///
    /// Fails with `StreamError::QueueClosed` once `close` was called; a late
    /// push is a caller bug and is never silently dropped.
    pub async fn push(&self, sequence: EventStream) -> Result<(), StreamError> {
        {
            let mut inner = self.shared.inner.lock().await;
            if inner.closed {
                return Err(StreamError::QueueClosed);
            }
            inner.pending.push_back(sequence);
        }
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Forbids further pushes. Already-pushed sequences still drain.
    /// Idempotent.
    pub async fn close(&self) {
        {
            let mut inner = self.shared.inner.lock().await;
            if inner.closed {
                return;
            }
            inner.closed = true;
        }
        debug!("stream queue closed");
        self.shared.notify.notify_one();
    }

    pub async fn is_closed(&self) -> bool {
        self.shared.inner.lock().await.closed
    }
}

/// Sequential multiplexer: N pushed adapter sequences drained as one ordered
/// event sequence, in push order, one sequence fully drained before the next
/// starts.
///
/// Single consumer (`next_event` takes `&mut self`); producers push through
/// the cloned [`QueueHandle`]. A failed sequence surfaces one in-band
/// `StreamEvent::Error` and the queue moves on to the next sequence, so one
/// bad follow-up turn cannot poison the whole multiplexed stream.
pub struct StreamQueue {
    shared: Arc<QueueShared>,
    active: Option<EventStream>,
    cancel: CancellationToken,
}

impl StreamQueue {
    /// Creates the consumer/producer pair sharing `cancel`.
    pub fn new(cancel: CancellationToken) -> (Self, QueueHandle) {
        let shared = Arc::new(QueueShared {
            inner: Mutex::new(QueueInner {
                pending: VecDeque::new(),
                closed: false,
                state: QueueState::Idle,
            }),
            notify: Notify::new(),
        });
        let queue = Self {
            shared: Arc::clone(&shared),
            active: None,
            cancel,
        };
        (queue, QueueHandle { shared })
    }

    pub async fn state(&self) -> QueueState {
        self.shared.inner.lock().await.state
    }

    /// Yields the next multiplexed event.
    ///
    /// `Ok(None)` means closed and fully drained. Suspends while the queue is
    /// empty and open; the wait resolves on push, close, or cancellation. The
    /// cancellation token is checked before draining each item, before
    /// waiting, and during the idle-wait.
    pub async fn next_event(&mut self) -> Result<Option<StreamEvent>, StreamError> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(StreamError::Cancelled);
            }

            if let Some(active) = self.active.as_mut() {
                // Item arm first: a sequence that fails *because* it
                // cancelled the shared token (abort-on-timeout) still gets
                // its terminal error surfaced instead of a bare Cancelled.
                let item = tokio::select! {
                    biased;
                    item = active.next() => item,
                    _ = self.cancel.cancelled() => return Err(StreamError::Cancelled),
                };
                match item {
                    Some(Ok(event)) => return Ok(Some(event)),
                    Some(Err(error)) => {
                        warn!(%error, "adapter sequence failed mid-drain; continuing with next sequence");
                        self.active = None;
                        self.shared.inner.lock().await.state = QueueState::Error;
                        return Ok(Some(StreamEvent::Error { error }));
                    }
                    None => {
                        self.active = None;
                        continue;
                    }
                }
            }

            let next = {
                let mut inner = self.shared.inner.lock().await;
                if let Some(sequence) = inner.pending.pop_front() {
                    inner.advance_state(QueueState::Processing);
                    Some(sequence)
                } else if inner.closed {
                    inner.advance_state(QueueState::Closed);
                    return Ok(None);
                } else {
                    None
                }
            };
            if let Some(sequence) = next {
                self.active = Some(sequence);
                continue;
            }

            // Empty and open: suspend until a push, a close, or cancellation.
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(StreamError::Cancelled),
                _ = self.shared.notify.notified() => {}
                _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
            }
        }
    }
}
