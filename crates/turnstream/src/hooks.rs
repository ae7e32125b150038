use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tracing::warn;

use crate::dispatch::ToolRegistry;
use crate::errors::StreamError;
use crate::event::{ToolCall, ToolDefinition, ToolResponse};
use crate::message::Message;
use crate::model::{ModelRef, ProviderId};

/// Failure raised from inside a hook body.
///
/// Hooks are best-effort: the engine logs the failure and continues with the
/// default behavior for that stage. Only the before-start cancel and the
/// error hook's retry decision change control flow, and both fall back to
/// the safe default (proceed / do not retry) when the hook itself fails.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HookError(pub String);

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for HookError {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for HookError {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Input to the tool-provider hook.
#[derive(Clone, Debug)]
pub struct ToolProviderContext {
    pub model: ModelRef,
    pub messages: Vec<Message>,
}

/// Tools (and optionally an executor) supplied for one turn.
#[derive(Clone, Debug, Default)]
pub struct ToolProvision {
    pub tools: Vec<ToolDefinition>,
    /// Registry used to answer tool calls this turn. Falls back to the
    /// orchestrator-wide registry when absent.
    pub executor: Option<Arc<ToolRegistry>>,
}

/// Input to the before-start hook.
#[derive(Clone, Debug)]
pub struct BeforeStartContext {
    pub model: ModelRef,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub provider_options: HashMap<ProviderId, serde_json::Value>,
}

/// Replacements applied when the before-start hook proceeds.
#[derive(Clone, Debug, Default)]
pub struct StartOverrides {
    pub messages: Option<Vec<Message>>,
    pub tools: Option<Vec<ToolDefinition>>,
    pub provider_options: Option<HashMap<ProviderId, serde_json::Value>>,
}

/// Before-start verdict. `Cancel` ends the turn with no content and no
/// error: a deliberate no-op exit, not a failure.
#[derive(Clone, Debug)]
pub enum BeforeStartOutcome {
    Proceed(StartOverrides),
    Cancel,
}

impl BeforeStartOutcome {
    /// Proceed with the request unchanged.
    pub fn proceed() -> Self {
        Self::Proceed(StartOverrides::default())
    }
}

/// Payload of the stream-started observation.
#[derive(Clone, Debug)]
pub struct StreamStartedContext {
    pub model: ModelRef,
    pub message_count: usize,
    pub has_tools: bool,
    pub timestamp: DateTime<Utc>,
}

/// One raw chunk offered to the before-chunk hook.
#[derive(Clone, Debug)]
pub struct ChunkContext {
    pub text: String,
    /// 0-based position among emitted chunks this turn.
    pub index: u64,
}

/// Before-chunk verdict.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkDisposition {
    /// Emit this (possibly rewritten) text.
    Emit(String),
    /// Drop the chunk entirely.
    Skip,
}

/// Payload of the after-chunk observation.
#[derive(Clone, Debug)]
pub struct ChunkTiming {
    /// Text as emitted to the caller.
    pub text: String,
    pub index: u64,
    /// Elapsed time since the turn started.
    pub elapsed: Duration,
}

/// Input to the tool-call hook.
#[derive(Clone, Debug)]
pub struct ToolCallContext {
    pub model: ModelRef,
    pub calls: Vec<ToolCall>,
    pub messages: Vec<Message>,
}

/// Result of the tool-call hook: the responses to append and whether a
/// follow-up sequence should be pushed.
#[derive(Clone, Debug)]
pub struct ToolHookOutcome {
    pub responses: Vec<ToolResponse>,
    pub continue_streaming: bool,
}

impl ToolHookOutcome {
    pub fn new(responses: Vec<ToolResponse>, continue_streaming: bool) -> Self {
        Self {
            responses,
            continue_streaming,
        }
    }

    /// Responses plus a follow-up sequence.
    pub fn respond(responses: Vec<ToolResponse>) -> Self {
        Self::new(responses, true)
    }
}

/// Input to the error hook.
#[derive(Clone, Debug)]
pub struct ErrorContext {
    pub error: StreamError,
    /// In-stream retries already spent this turn.
    pub attempt: u32,
}

/// Error-hook verdict.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorDecision {
    /// Rebuild the adapter sequence from the current conversation and keep
    /// streaming.
    Retry,
    /// Let the error terminate the turn.
    Fail,
}

/// Payload of the end-of-turn observation.
#[derive(Clone, Debug)]
pub struct TurnEndContext {
    pub total_chunks: u64,
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
}

pub type ToolProviderHook =
    Arc<dyn Fn(ToolProviderContext) -> BoxFuture<'static, Result<ToolProvision, HookError>> + Send + Sync>;
pub type BeforeStartHook = Arc<
    dyn Fn(BeforeStartContext) -> BoxFuture<'static, Result<BeforeStartOutcome, HookError>>
        + Send
        + Sync,
>;
pub type StreamStartedHook = Arc<dyn Fn(StreamStartedContext) + Send + Sync>;
pub type BeforeChunkHook =
    Arc<dyn Fn(ChunkContext) -> BoxFuture<'static, Result<ChunkDisposition, HookError>> + Send + Sync>;
pub type AfterChunkHook = Arc<dyn Fn(ChunkTiming) + Send + Sync>;
pub type ToolCallHook =
    Arc<dyn Fn(ToolCallContext) -> BoxFuture<'static, Result<ToolHookOutcome, HookError>> + Send + Sync>;
pub type ErrorHook =
    Arc<dyn Fn(ErrorContext) -> BoxFuture<'static, Result<ErrorDecision, HookError>> + Send + Sync>;
pub type TurnEndHook = Arc<dyn Fn(TurnEndContext) + Send + Sync>;

/// Pure per-chunk transform: `None` drops the chunk.
pub type ChunkTransform = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;
/// Pure transform over the final accumulated text.
pub type TextTransform = Arc<dyn Fn(String) -> String + Send + Sync>;

/// Synchronous text processing applied outside the hook pipeline: the
/// preprocessor runs on each chunk before the before-chunk hook, the
/// postprocessor runs once over the accumulated turn text.
#[derive(Clone, Default)]
pub struct Processing {
    pub preprocessor: Option<ChunkTransform>,
    pub postprocessor: Option<TextTransform>,
}

impl Processing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn preprocessor<F>(mut self, transform: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.preprocessor = Some(Arc::new(transform));
        self
    }

    pub fn postprocessor<F>(mut self, transform: F) -> Self
    where
        F: Fn(String) -> String + Send + Sync + 'static,
    {
        self.postprocessor = Some(Arc::new(transform));
        self
    }
}

impl fmt::Debug for Processing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Processing")
            .field("preprocessor", &self.preprocessor.is_some())
            .field("postprocessor", &self.postprocessor.is_some())
            .finish()
    }
}

/// Fixed bag of optional per-turn callbacks, invoked by capability check.
///
/// Decision hooks (tool-provider, before-start, before-chunk, tool-call,
/// error) are async; observation hooks (stream-started, after-chunk,
/// turn-end) are plain functions.
#[derive(Clone, Default)]
pub struct TurnHooks {
    pub tool_provider: Option<ToolProviderHook>,
    pub before_start: Option<BeforeStartHook>,
    pub stream_started: Option<StreamStartedHook>,
    pub before_chunk: Option<BeforeChunkHook>,
    pub after_chunk: Option<AfterChunkHook>,
    pub tool_call: Option<ToolCallHook>,
    pub error: Option<ErrorHook>,
    pub turn_end: Option<TurnEndHook>,
}

impl fmt::Debug for TurnHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TurnHooks")
            .field("tool_provider", &self.tool_provider.is_some())
            .field("before_start", &self.before_start.is_some())
            .field("stream_started", &self.stream_started.is_some())
            .field("before_chunk", &self.before_chunk.is_some())
            .field("after_chunk", &self.after_chunk.is_some())
            .field("tool_call", &self.tool_call.is_some())
            .field("error", &self.error.is_some())
            .field("turn_end", &self.turn_end.is_some())
            .finish()
    }
}

impl TurnHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_tool_provider<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(ToolProviderContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolProvision, HookError>> + Send + 'static,
    {
        self.tool_provider = Some(Arc::new(move |ctx| Box::pin(hook(ctx))));
        self
    }

    pub fn on_before_start<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(BeforeStartContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<BeforeStartOutcome, HookError>> + Send + 'static,
    {
        self.before_start = Some(Arc::new(move |ctx| Box::pin(hook(ctx))));
        self
    }

    pub fn on_stream_started<F>(mut self, hook: F) -> Self
    where
        F: Fn(StreamStartedContext) + Send + Sync + 'static,
    {
        self.stream_started = Some(Arc::new(hook));
        self
    }

    pub fn on_before_chunk<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(ChunkContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ChunkDisposition, HookError>> + Send + 'static,
    {
        self.before_chunk = Some(Arc::new(move |ctx| Box::pin(hook(ctx))));
        self
    }

    pub fn on_after_chunk<F>(mut self, hook: F) -> Self
    where
        F: Fn(ChunkTiming) + Send + Sync + 'static,
    {
        self.after_chunk = Some(Arc::new(hook));
        self
    }

    pub fn on_tool_call<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(ToolCallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolHookOutcome, HookError>> + Send + 'static,
    {
        self.tool_call = Some(Arc::new(move |ctx| Box::pin(hook(ctx))));
        self
    }

    pub fn on_error<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(ErrorContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ErrorDecision, HookError>> + Send + 'static,
    {
        self.error = Some(Arc::new(move |ctx| Box::pin(hook(ctx))));
        self
    }

    pub fn on_turn_end<F>(mut self, hook: F) -> Self
    where
        F: Fn(TurnEndContext) + Send + Sync + 'static,
    {
        self.turn_end = Some(Arc::new(hook));
        self
    }

    pub(crate) async fn run_tool_provider(&self, ctx: ToolProviderContext) -> Option<ToolProvision> {
        let hook = self.tool_provider.as_ref()?;
        match hook(ctx).await {
            Ok(provision) => Some(provision),
            Err(error) => {
                warn!(%error, "tool-provider hook failed; continuing without hook-supplied tools");
                None
            }
        }
    }

    pub(crate) async fn run_before_start(&self, ctx: BeforeStartContext) -> BeforeStartOutcome {
        match &self.before_start {
            None => BeforeStartOutcome::proceed(),
            Some(hook) => match hook(ctx).await {
                Ok(outcome) => outcome,
                Err(error) => {
                    warn!(%error, "before-start hook failed; starting unchanged");
                    BeforeStartOutcome::proceed()
                }
            },
        }
    }

    pub(crate) fn run_stream_started(&self, ctx: StreamStartedContext) {
        if let Some(hook) = &self.stream_started {
            hook(ctx);
        }
    }

    pub(crate) async fn run_before_chunk(&self, ctx: ChunkContext) -> ChunkDisposition {
        match &self.before_chunk {
            None => ChunkDisposition::Emit(ctx.text),
            Some(hook) => {
                let original = ctx.text.clone();
                match hook(ctx).await {
                    Ok(disposition) => disposition,
                    Err(error) => {
                        warn!(%error, "before-chunk hook failed; emitting chunk unchanged");
                        ChunkDisposition::Emit(original)
                    }
                }
            }
        }
    }

    pub(crate) fn run_after_chunk(&self, timing: ChunkTiming) {
        if let Some(hook) = &self.after_chunk {
            hook(timing);
        }
    }

    /// `None` means no hook is configured and the built-in registry path
    /// should be used instead.
    pub(crate) async fn run_tool_call(&self, ctx: ToolCallContext) -> Option<ToolHookOutcome> {
        let hook = self.tool_call.as_ref()?;
        match hook(ctx).await {
            Ok(outcome) => Some(outcome),
            Err(error) => {
                warn!(%error, "tool-call hook failed; ending streaming without responses");
                Some(ToolHookOutcome::new(Vec::new(), false))
            }
        }
    }

    pub(crate) async fn run_error(&self, ctx: ErrorContext) -> ErrorDecision {
        match &self.error {
            None => ErrorDecision::Fail,
            Some(hook) => match hook(ctx).await {
                Ok(decision) => decision,
                Err(error) => {
                    warn!(%error, "error hook failed; not retrying");
                    ErrorDecision::Fail
                }
            },
        }
    }

    pub(crate) fn run_turn_end(&self, ctx: TurnEndContext) {
        if let Some(hook) = &self.turn_end {
            hook(ctx);
        }
    }
}
