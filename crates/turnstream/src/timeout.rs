use std::time::Duration;

use futures::{StreamExt, stream};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::adapter::EventStream;
use crate::errors::StreamError;

/// Inactivity window applied per received item, never to the whole sequence.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct TimeoutConfig {
    /// Window measured from the previous item (or from sequence start).
    /// `None` disables the guard.
    pub inactivity_timeout_ms: Option<u64>,
    /// When true, a fired timeout also cancels the shared token so the
    /// underlying adapter stops its own work.
    pub abort_underlying_on_timeout: bool,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_ms: None,
            abort_underlying_on_timeout: true,
        }
    }
}

impl TimeoutConfig {
    /// Guard with the given window, aborting the underlying stream on fire.
    pub fn after_ms(ms: u64) -> Self {
        Self {
            inactivity_timeout_ms: Some(ms),
            abort_underlying_on_timeout: true,
        }
    }

    pub fn inactivity_timeout_ms(mut self, ms: u64) -> Self {
        self.inactivity_timeout_ms = Some(ms);
        self
    }

    pub fn abort_underlying_on_timeout(mut self, abort: bool) -> Self {
        self.abort_underlying_on_timeout = abort;
        self
    }

    pub fn window(&self) -> Option<Duration> {
        self.inactivity_timeout_ms.map(Duration::from_millis)
    }
}

struct GuardState {
    events: EventStream,
    window: Duration,
    abort_underlying: bool,
    cancel: CancellationToken,
    fired: bool,
}

/// Wraps a sequence so a gap longer than the configured window between items
/// ends it with one `StreamError::Timeout` item.
///
/// The timer resets on every received item. With no window configured the
/// sequence is returned unchanged.
pub fn with_inactivity_timeout(
    events: EventStream,
    config: &TimeoutConfig,
    cancel: CancellationToken,
) -> EventStream {
    let Some(window) = config.window() else {
        return events;
    };
    let state = GuardState {
        events,
        window,
        abort_underlying: config.abort_underlying_on_timeout,
        cancel,
        fired: false,
    };
    Box::pin(stream::unfold(state, |mut state| async move {
        if state.fired {
            return None;
        }
        match tokio::time::timeout(state.window, state.events.next()).await {
            Ok(Some(item)) => Some((item, state)),
            Ok(None) => None,
            Err(_) => {
                state.fired = true;
                warn!(
                    window_ms = state.window.as_millis() as u64,
                    "no stream activity within inactivity window"
                );
                if state.abort_underlying {
                    state.cancel.cancel();
                }
                Some((Err(StreamError::timeout(state.window)), state))
            }
        }
    }))
}
