use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, stream};
use tracing::{debug, warn};

use crate::event::{ToolCall, ToolDefinition, ToolResponse};

/// Failure raised by a tool handler body. Converted into a failed
/// `ToolResponse` by the registry, never propagated further.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ToolError {
    pub message: String,
}

impl ToolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for ToolError {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for ToolError {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Handler for one registered tool.
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    /// Declaration advertised to the model; `name` keys the registry.
    fn definition(&self) -> ToolDefinition;

    /// Answers one call.
    async fn handle(&self, call: &ToolCall) -> Result<ToolResponse, ToolError>;
}

/// Dispatch behavior knobs.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct DispatchConfig {
    /// Per-call budget; a handler exceeding it yields a failed response.
    /// `None` waits indefinitely.
    pub call_timeout_ms: Option<u64>,
    /// Run calls concurrently instead of in input order.
    pub parallel: bool,
    /// Concurrency bound for parallel mode.
    pub max_parallel: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: Some(30_000),
            parallel: false,
            max_parallel: 4,
        }
    }
}

impl DispatchConfig {
    pub fn call_timeout_ms(mut self, ms: u64) -> Self {
        self.call_timeout_ms = Some(ms);
        self
    }

    pub fn no_call_timeout(mut self) -> Self {
        self.call_timeout_ms = None;
        self
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }
}

/// Side-channel observation of failed calls, for telemetry.
pub type ToolFailureObserver = Arc<dyn Fn(&ToolCall, &str) + Send + Sync>;

/// Tool name → handler registry.
///
/// `dispatch` never fails: missing handlers, handler errors, and per-call
/// timeouts all become failed `ToolResponse`s tied to the call id, so a bad
/// tool cannot break the conversation. The handler map is read-mostly;
/// registration happens between turns.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
    config: DispatchConfig,
    failure_observer: Option<ToolFailureObserver>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("ToolRegistry")
            .field("tools", &names)
            .field("config", &self.config)
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: DispatchConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Registers a handler under its declared name, replacing any previous
    /// registration for that name.
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        let name = handler.definition().name;
        if self.handlers.insert(name.clone(), handler).is_some() {
            debug!(tool = %name, "replaced existing tool handler");
        }
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.handlers.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Declarations of every registered tool, name-sorted for stable
    /// request payloads.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> = self
            .handlers
            .values()
            .map(|handler| handler.definition())
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    pub fn set_failure_observer<F>(&mut self, observer: F)
    where
        F: Fn(&ToolCall, &str) + Send + Sync + 'static,
    {
        self.failure_observer = Some(Arc::new(observer));
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Dispatches one call; always returns a response for `call.id`.
    pub async fn dispatch(&self, call: &ToolCall) -> ToolResponse {
        let Some(handler) = self.handlers.get(&call.name) else {
            let message = format!("no handler registered for '{}'", call.name);
            self.observe_failure(call, &message);
            return ToolResponse::failure(call.id.clone(), message);
        };

        let outcome = match self.config.call_timeout() {
            Some(budget) => match tokio::time::timeout(budget, handler.handle(call)).await {
                Ok(result) => result,
                Err(_) => Err(ToolError::new(format!(
                    "tool '{}' timed out after {} ms",
                    call.name,
                    budget.as_millis()
                ))),
            },
            None => handler.handle(call).await,
        };

        match outcome {
            Ok(response) => response,
            Err(error) => {
                self.observe_failure(call, &error.message);
                ToolResponse::failure(call.id.clone(), error.message)
            }
        }
    }

    /// Dispatches a batch. Sequential mode (default) preserves input order;
    /// parallel mode runs up to `max_parallel` calls at once, starting the
    /// next pending call as soon as one finishes, and collects responses in
    /// completion order. Either way exactly one response exists per call.
    pub async fn dispatch_many(&self, calls: &[ToolCall]) -> Vec<ToolResponse> {
        if calls.is_empty() {
            return Vec::new();
        }
        if self.config.parallel && calls.len() > 1 {
            // Boxed so the mapping closure's opaque future type stays out of
            // callers' `Send` proofs; rustc otherwise demands an impossible
            // higher-ranked `FnOnce` impl when this future sits inside a
            // spawned task.
            stream::iter(calls)
                .map(|call| self.dispatch(call))
                .buffer_unordered(self.config.max_parallel.max(1))
                .boxed()
                .collect()
                .await
        } else {
            let mut responses = Vec::with_capacity(calls.len());
            for call in calls {
                responses.push(self.dispatch(call).await);
            }
            responses
        }
    }

    fn observe_failure(&self, call: &ToolCall, message: &str) {
        warn!(tool = %call.name, call_id = %call.id, error = message, "tool call failed");
        if let Some(observer) = &self.failure_observer {
            observer(call, message);
        }
    }
}
