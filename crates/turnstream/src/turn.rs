use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::adapter::{AdapterRequest, EventStream, VendorAdapter};
use crate::dispatch::ToolRegistry;
use crate::errors::{OrchestratorError, StreamError};
use crate::event::{StreamEvent, ToolCall, ToolDefinition};
use crate::hooks::{
    BeforeStartContext, BeforeStartOutcome, ChunkContext, ChunkDisposition, ChunkTiming,
    ErrorContext, ErrorDecision, Processing, StreamStartedContext, ToolCallContext,
    ToolHookOutcome, ToolProviderContext, TurnEndContext, TurnHooks,
};
use crate::message::Message;
use crate::model::{ModelRef, ProviderId, TurnOptions};
use crate::orchestrator::OrchestratorInner;
use crate::queue::{QueueHandle, StreamQueue};
use crate::retry::{RetryConfig, with_retry};
use crate::timeout::{TimeoutConfig, with_inactivity_timeout};

/// Handle used to request cancellation of a running turn.
///
/// The same token flows through the queue, the retry guard, and the adapter
/// request, so one `abort()` stops every layer.
#[derive(Clone, Debug)]
pub struct AbortHandle {
    token: CancellationToken,
}

impl AbortHandle {
    /// Requests cancellation.
    ///
    /// Cancellation is best-effort and surfaces as a terminal
    /// `StreamError::Cancelled` failure. It never runs the error hook.
    pub fn abort(&self) {
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Builder for configuring and starting a single streamed turn.
///
/// Created via `Orchestrator::turn`. Per-turn hooks, retry, timeout,
/// processing, and options default to the orchestrator-wide configuration
/// when not set here.
pub struct TurnBuilder {
    orchestrator: Arc<OrchestratorInner>,
    model: ModelRef,
    system_prompt: Option<String>,
    messages: Vec<Message>,
    provider_options: HashMap<ProviderId, serde_json::Value>,
    cancel: Option<CancellationToken>,
    hooks: Option<TurnHooks>,
    retry: Option<RetryConfig>,
    timeout: Option<TimeoutConfig>,
    options: Option<TurnOptions>,
    processing: Option<Processing>,
}

impl TurnBuilder {
    pub(crate) fn new(orchestrator: Arc<OrchestratorInner>, model: ModelRef) -> Self {
        Self {
            orchestrator,
            model,
            system_prompt: None,
            messages: Vec::new(),
            provider_options: HashMap::new(),
            cancel: None,
            hooks: None,
            retry: None,
            timeout: None,
            options: None,
            processing: None,
        }
    }

    /// Sets the system prompt, inserted before all other messages.
    pub fn system_prompt(mut self, text: impl Into<String>) -> Self {
        self.system_prompt = Some(text.into());
        self
    }

    /// Appends a plain user message.
    pub fn user_text(mut self, text: impl Into<String>) -> Self {
        self.messages.push(Message::user(text));
        self
    }

    /// Appends one message.
    pub fn message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    /// Replaces the whole conversation with the provided list.
    pub fn messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self
    }

    /// Sets a vendor-specific options payload passed through to the adapter.
    pub fn provider_options(
        mut self,
        provider: impl Into<ProviderId>,
        value: serde_json::Value,
    ) -> Self {
        self.provider_options.insert(provider.into(), value);
        self
    }

    /// Uses an externally owned cancellation token instead of a fresh one.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Replaces the orchestrator-wide hooks for this turn.
    pub fn hooks(mut self, hooks: TurnHooks) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Replaces the retry configuration for this turn.
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Replaces the inactivity-timeout configuration for this turn.
    pub fn timeout(mut self, timeout: TimeoutConfig) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Replaces the turn options wholesale.
    pub fn options(mut self, options: TurnOptions) -> Self {
        self.options = Some(options);
        self
    }

    /// Replaces the chunk pre/postprocessing for this turn.
    pub fn processing(mut self, processing: Processing) -> Self {
        self.processing = Some(processing);
        self
    }

    /// Sets the bounded chunk buffer size between the turn task and the
    /// consumer.
    pub fn stream_buffer_capacity(mut self, capacity: usize) -> Self {
        self.options_mut().stream_buffer_capacity = capacity;
        self
    }

    /// Caps tool-call follow-up rounds for this turn.
    pub fn max_tool_rounds(mut self, rounds: u32) -> Self {
        self.options_mut().max_tool_rounds = rounds;
        self
    }

    /// Toggles accumulation of chunk text into the final output.
    pub fn accumulate_content(mut self, accumulate: bool) -> Self {
        self.options_mut().accumulate_content = accumulate;
        self
    }

    fn options_mut(&mut self) -> &mut TurnOptions {
        self.options
            .get_or_insert_with(|| self.orchestrator.options.clone())
    }

    /// Validates the builder state and starts the turn.
    ///
    /// The returned `TurnStream` yields processed content chunks; tool calls
    /// are handled inside the engine and only their streamed answers appear
    /// as chunks.
    pub async fn start(self) -> Result<TurnStream, OrchestratorError> {
        let orchestrator = self.orchestrator.clone();
        let turn = self.validate_and_build()?;
        let adapter = orchestrator.adapter(&turn.model.provider).ok_or_else(|| {
            OrchestratorError::ProviderNotFound {
                provider: turn.model.provider.clone(),
            }
        })?;

        let (chunk_tx, chunk_rx) = mpsc::channel(turn.options.stream_buffer_capacity);
        let (final_tx, final_rx) = oneshot::channel();
        let abort_handle = AbortHandle {
            token: turn.cancel.clone(),
        };
        let turn_id = turn.turn_id;
        let model = turn.model.clone();
        tokio::spawn(turn_task(adapter, turn, chunk_tx, final_tx));

        Ok(TurnStream {
            turn_id,
            provider: model.provider,
            model: model.model,
            chunk_rx,
            final_rx,
            abort_handle,
        })
    }

    /// Runs to completion and returns the final aggregate.
    pub async fn collect_output(self) -> Result<TurnOutput, OrchestratorError> {
        let stream = self.start().await?;
        stream.finish().await
    }

    /// Runs to completion and returns the accumulated text.
    ///
    /// Empty when content accumulation is disabled in the options.
    pub async fn collect_text(self) -> Result<String, OrchestratorError> {
        Ok(self.collect_output().await?.text)
    }

    fn validate_and_build(self) -> Result<ValidatedTurn, OrchestratorError> {
        if self.model.provider.as_str().trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "model provider must not be empty".into(),
            ));
        }
        if self.model.model.trim().is_empty() {
            return Err(OrchestratorError::Validation("model must not be empty".into()));
        }

        let options = self
            .options
            .unwrap_or_else(|| self.orchestrator.options.clone());
        if options.stream_buffer_capacity == 0 {
            return Err(OrchestratorError::Validation(
                "stream_buffer_capacity must be greater than 0".into(),
            ));
        }

        let mut messages = self.messages;
        if let Some(system) = self.system_prompt.filter(|text| !text.trim().is_empty()) {
            messages.insert(0, Message::system(system));
        }
        if messages.is_empty() {
            return Err(OrchestratorError::Validation(
                "at least one message is required".into(),
            ));
        }
        for message in &messages {
            if message.content.trim().is_empty()
                && message.tool_calls.is_empty()
                && message.tool_call_id.is_none()
            {
                return Err(OrchestratorError::Validation(
                    "message content must not be empty".into(),
                ));
            }
        }

        Ok(ValidatedTurn {
            turn_id: uuid::Uuid::new_v4(),
            model: self.model,
            messages,
            provider_options: self.provider_options,
            options,
            cancel: self.cancel.unwrap_or_default(),
            hooks: self.hooks.unwrap_or_else(|| self.orchestrator.hooks.clone()),
            retry: self.retry.unwrap_or_else(|| self.orchestrator.retry.clone()),
            timeout: self
                .timeout
                .unwrap_or_else(|| self.orchestrator.timeout.clone()),
            processing: self
                .processing
                .unwrap_or_else(|| self.orchestrator.processing.clone()),
            registry: self.orchestrator.tools.clone(),
        })
    }
}

struct ValidatedTurn {
    turn_id: uuid::Uuid,
    model: ModelRef,
    messages: Vec<Message>,
    provider_options: HashMap<ProviderId, serde_json::Value>,
    options: TurnOptions,
    cancel: CancellationToken,
    hooks: TurnHooks,
    retry: RetryConfig,
    timeout: TimeoutConfig,
    processing: Processing,
    registry: Option<Arc<ToolRegistry>>,
}

/// Final aggregate of a completed turn.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TurnOutput {
    /// Concatenated chunk text; empty when accumulation is disabled.
    pub text: String,
    /// Chunks delivered to the consumer (post skip/rewrite).
    pub total_chunks: u64,
    pub duration_ms: u64,
    /// Completed tool-call follow-up rounds.
    pub tool_rounds: u32,
    /// Tool calls nobody could answer (no hook and no registry handler
    /// path); streaming stopped instead of looping.
    pub pending_tool_calls: Vec<ToolCall>,
}

/// Streaming handle returned by `TurnBuilder::start`.
///
/// Use `next_chunk()` to consume content as it arrives and `finish()` for
/// the terminal aggregate after the last chunk.
pub struct TurnStream {
    turn_id: uuid::Uuid,
    provider: ProviderId,
    model: String,
    chunk_rx: mpsc::Receiver<Result<String, StreamError>>,
    final_rx: oneshot::Receiver<Result<TurnOutput, OrchestratorError>>,
    abort_handle: AbortHandle,
}

impl TurnStream {
    pub fn turn_id(&self) -> uuid::Uuid {
        self.turn_id
    }

    /// Returns a handle that can cancel the turn.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort_handle.clone()
    }

    /// Waits for the next content chunk.
    ///
    /// `Ok(None)` means no further chunks will arrive; call `finish()` for
    /// the aggregate result. An unrecovered stream failure surfaces here as
    /// one `Err` (when error reporting is enabled) before the channel ends.
    pub async fn next_chunk(&mut self) -> Result<Option<String>, OrchestratorError> {
        match self.chunk_rx.recv().await {
            Some(Ok(text)) => Ok(Some(text)),
            Some(Err(error)) => Err(OrchestratorError::TurnFailed(error)),
            None => Ok(None),
        }
    }

    /// Drains any remaining chunks and returns the terminal turn result.
    ///
    /// Safe to call after consuming chunks manually with `next_chunk()`.
    pub async fn finish(mut self) -> Result<TurnOutput, OrchestratorError> {
        while self.chunk_rx.recv().await.is_some() {}
        match self.final_rx.await {
            Ok(result) => result,
            Err(_) => Err(OrchestratorError::protocol_msg(format!(
                "turn task ended without final result (provider={}, model={})",
                self.provider, self.model
            ))),
        }
    }
}

async fn turn_task(
    adapter: Arc<dyn VendorAdapter>,
    turn: ValidatedTurn,
    chunk_tx: mpsc::Sender<Result<String, StreamError>>,
    final_tx: oneshot::Sender<Result<TurnOutput, OrchestratorError>>,
) {
    let report_errors = turn.options.report_errors;
    let result = drive_turn(adapter, turn, &chunk_tx).await;
    if report_errors && let Err(OrchestratorError::TurnFailed(error)) = &result {
        let _ = chunk_tx.send(Err(error.clone())).await;
    }
    let _ = final_tx.send(result);
}

async fn drive_turn(
    adapter: Arc<dyn VendorAdapter>,
    turn: ValidatedTurn,
    chunk_tx: &mpsc::Sender<Result<String, StreamError>>,
) -> Result<TurnOutput, OrchestratorError> {
    let started_at = Instant::now();
    let (mut queue, handle) = StreamQueue::new(turn.cancel.clone());
    let result = stream_turn(&adapter, &turn, chunk_tx, &mut queue, &handle, started_at).await;
    // The queue never outlives the turn, on success or failure.
    handle.close().await;
    result
}

async fn stream_turn(
    adapter: &Arc<dyn VendorAdapter>,
    turn: &ValidatedTurn,
    chunk_tx: &mpsc::Sender<Result<String, StreamError>>,
    queue: &mut StreamQueue,
    handle: &QueueHandle,
    started_at: Instant,
) -> Result<TurnOutput, OrchestratorError> {
    let turn_id = turn.turn_id;

    // Tool provisioning: the hook wins, the registered tools are the
    // fallback for both the advertised definitions and the executor.
    debug!(%turn_id, "requesting tools");
    let provision = turn
        .hooks
        .run_tool_provider(ToolProviderContext {
            model: turn.model.clone(),
            messages: turn.messages.clone(),
        })
        .await;
    let (mut tools, executor) = match provision {
        Some(provision) => {
            let executor = provision.executor.or_else(|| turn.registry.clone());
            (provision.tools, executor)
        }
        None => {
            let tools = turn
                .registry
                .as_ref()
                .map(|registry| registry.definitions())
                .unwrap_or_default();
            (tools, turn.registry.clone())
        }
    };

    let mut messages = turn.messages.clone();
    let mut provider_options = turn.provider_options.clone();

    // Last chance to rewrite the request, or exit as a deliberate no-op.
    match turn
        .hooks
        .run_before_start(BeforeStartContext {
            model: turn.model.clone(),
            messages: messages.clone(),
            tools: tools.clone(),
            provider_options: provider_options.clone(),
        })
        .await
    {
        BeforeStartOutcome::Cancel => {
            debug!(%turn_id, "turn ended by before-start hook");
            return Ok(TurnOutput {
                duration_ms: started_at.elapsed().as_millis() as u64,
                ..TurnOutput::default()
            });
        }
        BeforeStartOutcome::Proceed(overrides) => {
            if let Some(replacement) = overrides.messages {
                messages = replacement;
            }
            if let Some(replacement) = overrides.tools {
                tools = replacement;
            }
            if let Some(replacement) = overrides.provider_options {
                provider_options = replacement;
            }
        }
    }

    let mut attempts_used: u32 = 0;

    // First sequence. An open failure runs through the error hook exactly
    // like a later mid-stream failure.
    let request = SequenceRequest {
        adapter,
        turn,
        messages: &messages,
        tools: &tools,
        provider_options: &provider_options,
    };
    match open_sequence(&request).await {
        Ok(events) => handle.push(events).await?,
        Err(error) => recover_sequence(&request, handle, error, &mut attempts_used).await?,
    }

    turn.hooks.run_stream_started(StreamStartedContext {
        model: turn.model.clone(),
        message_count: messages.len(),
        has_tools: !tools.is_empty(),
        timestamp: Utc::now(),
    });
    debug!(
        %turn_id,
        provider = %turn.model.provider,
        model = %turn.model.model,
        messages = messages.len(),
        tools = tools.len(),
        "stream started"
    );

    let mut total_chunks: u64 = 0;
    let mut chunk_index: u64 = 0;
    let mut accumulated = String::new();
    let mut tool_rounds: u32 = 0;
    let mut pending_tool_calls: Vec<ToolCall> = Vec::new();
    let mut follow_up_ready = false;

    loop {
        let event = match queue.next_event().await {
            Ok(Some(event)) => event,
            Ok(None) => break,
            // Cancellation or a queue-level fault: terminal, never offered
            // to the error hook.
            Err(error) => {
                warn!(%turn_id, %error, "turn stream aborted");
                return Err(OrchestratorError::TurnFailed(error));
            }
        };

        match event {
            StreamEvent::Content { text } => {
                let text = match &turn.processing.preprocessor {
                    Some(transform) => match transform(&text) {
                        Some(text) => text,
                        None => continue,
                    },
                    None => text,
                };
                if text.is_empty() {
                    continue;
                }
                let text = match turn
                    .hooks
                    .run_before_chunk(ChunkContext {
                        text,
                        index: chunk_index,
                    })
                    .await
                {
                    ChunkDisposition::Emit(text) => text,
                    ChunkDisposition::Skip => {
                        debug!(%turn_id, index = chunk_index, "chunk skipped by hook");
                        continue;
                    }
                };
                if chunk_tx.send(Ok(text.clone())).await.is_err() {
                    return Err(OrchestratorError::protocol_msg(
                        "turn stream receiver dropped during output",
                    ));
                }
                if turn.options.accumulate_content {
                    accumulated.push_str(&text);
                }
                total_chunks = total_chunks.saturating_add(1);
                turn.hooks.run_after_chunk(ChunkTiming {
                    text,
                    index: chunk_index,
                    elapsed: started_at.elapsed(),
                });
                chunk_index = chunk_index.saturating_add(1);
            }
            StreamEvent::ToolCalls { calls } => {
                debug!(%turn_id, count = calls.len(), "tool calls requested");
                let outcome = turn
                    .hooks
                    .run_tool_call(ToolCallContext {
                        model: turn.model.clone(),
                        calls: calls.clone(),
                        messages: messages.clone(),
                    })
                    .await;
                let resolved = match outcome {
                    Some(outcome) => Some(outcome),
                    None => match &executor {
                        Some(registry) => Some(ToolHookOutcome::respond(
                            registry.dispatch_many(&calls).await,
                        )),
                        None => None,
                    },
                };
                match resolved {
                    Some(outcome) => {
                        messages.push(Message::assistant_tool_calls(calls));
                        for response in &outcome.responses {
                            messages.push(Message::tool_response(response));
                        }
                        if !outcome.continue_streaming {
                            follow_up_ready = false;
                        } else if tool_rounds >= turn.options.max_tool_rounds {
                            warn!(
                                %turn_id,
                                limit = turn.options.max_tool_rounds,
                                "tool round limit reached; not continuing"
                            );
                            follow_up_ready = false;
                        } else {
                            follow_up_ready = true;
                        }
                    }
                    None => {
                        warn!(
                            %turn_id,
                            count = calls.len(),
                            "tool calls without hook or registry; left pending"
                        );
                        pending_tool_calls.extend(calls);
                        follow_up_ready = false;
                    }
                }
            }
            StreamEvent::StreamEnd => {
                if follow_up_ready {
                    follow_up_ready = false;
                    tool_rounds += 1;
                    let request = SequenceRequest {
                        adapter,
                        turn,
                        messages: &messages,
                        tools: &tools,
                        provider_options: &provider_options,
                    };
                    match open_sequence(&request).await {
                        Ok(events) => handle.push(events).await?,
                        Err(error) => {
                            recover_sequence(&request, handle, error, &mut attempts_used).await?;
                        }
                    }
                    debug!(%turn_id, tool_rounds, "follow-up sequence pushed");
                } else {
                    handle.close().await;
                }
            }
            StreamEvent::Error { error } => {
                let request = SequenceRequest {
                    adapter,
                    turn,
                    messages: &messages,
                    tools: &tools,
                    provider_options: &provider_options,
                };
                recover_sequence(&request, handle, error, &mut attempts_used).await?;
            }
        }
    }

    let duration = started_at.elapsed();
    turn.hooks.run_turn_end(TurnEndContext {
        total_chunks,
        duration,
        timestamp: Utc::now(),
    });

    let text = if turn.options.accumulate_content {
        match &turn.processing.postprocessor {
            Some(transform) => transform(accumulated),
            None => accumulated,
        }
    } else {
        String::new()
    };
    debug!(
        %turn_id,
        total_chunks,
        tool_rounds,
        duration_ms = duration.as_millis() as u64,
        "turn ended"
    );

    Ok(TurnOutput {
        text,
        total_chunks,
        duration_ms: duration.as_millis() as u64,
        tool_rounds,
        pending_tool_calls,
    })
}

/// Everything needed to open (or re-open) one adapter sequence from the
/// turn's current conversation state.
struct SequenceRequest<'a> {
    adapter: &'a Arc<dyn VendorAdapter>,
    turn: &'a ValidatedTurn,
    messages: &'a [Message],
    tools: &'a [ToolDefinition],
    provider_options: &'a HashMap<ProviderId, serde_json::Value>,
}

/// Opens one adapter sequence with transport retries and wraps it in the
/// inactivity guard.
async fn open_sequence(request: &SequenceRequest<'_>) -> Result<EventStream, StreamError> {
    let turn = request.turn;
    let adapter_request = AdapterRequest {
        turn_id: turn.turn_id,
        model: turn.model.clone(),
        messages: request.messages.to_vec(),
        tools: request.tools.to_vec(),
        provider_options: request.provider_options.clone(),
        cancel: turn.cancel.clone(),
    };
    let events = with_retry(&turn.retry, &turn.cancel, || {
        let adapter_request = adapter_request.clone();
        async move { request.adapter.open_stream(adapter_request).await }
    })
    .await?;
    Ok(with_inactivity_timeout(events, &turn.timeout, turn.cancel.clone()))
}

/// Offers a failed sequence to the error hook and, when allowed, pushes a
/// replacement built from the current conversation. The hook sees each
/// distinct failure exactly once; `Err` means the failure is final.
async fn recover_sequence(
    request: &SequenceRequest<'_>,
    handle: &QueueHandle,
    error: StreamError,
    attempts_used: &mut u32,
) -> Result<(), OrchestratorError> {
    let turn = request.turn;
    let mut current = error;
    loop {
        if current.is_cancelled() {
            return Err(OrchestratorError::TurnFailed(current));
        }
        let decision = turn
            .hooks
            .run_error(ErrorContext {
                error: current.clone(),
                attempt: *attempts_used,
            })
            .await;
        if decision != ErrorDecision::Retry || !turn.retry.can_retry(*attempts_used) {
            warn!(
                turn_id = %turn.turn_id,
                error = %current,
                attempts = *attempts_used,
                "turn failed"
            );
            return Err(OrchestratorError::TurnFailed(current));
        }
        *attempts_used += 1;
        debug!(
            turn_id = %turn.turn_id,
            attempt = *attempts_used,
            error = %current,
            "error hook requested a replacement sequence"
        );
        match open_sequence(request).await {
            Ok(events) => {
                handle.push(events).await?;
                return Ok(());
            }
            Err(next) => current = next,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::stream;

    use super::*;
    use crate::dispatch::{ToolError, ToolHandler};
    use crate::event::{ToolDefinition, ToolResponse};
    use crate::message::Role;

    struct ScriptedAdapter {
        id: ProviderId,
        calls: Arc<AtomicUsize>,
        requests: Arc<StdMutex<Vec<AdapterRequest>>>,
        behavior: Behavior,
    }

    enum Behavior {
        /// One scripted sequence per open, in order; the last repeats.
        Sequences(Vec<Vec<Result<StreamEvent, StreamError>>>),
        /// Fail the first N opens, then stream the sequence.
        FailThenStream(usize, StreamError, Vec<Result<StreamEvent, StreamError>>),
        /// A stream that never produces anything.
        Pending,
    }

    impl ScriptedAdapter {
        fn new(behavior: Behavior) -> Self {
            Self {
                id: ProviderId::new("fake"),
                calls: Arc::new(AtomicUsize::new(0)),
                requests: Arc::new(StdMutex::new(Vec::new())),
                behavior,
            }
        }
    }

    #[async_trait::async_trait]
    impl VendorAdapter for ScriptedAdapter {
        fn id(&self) -> ProviderId {
            self.id.clone()
        }

        async fn open_stream(&self, request: AdapterRequest) -> Result<EventStream, StreamError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request);
            match &self.behavior {
                Behavior::Sequences(sequences) => {
                    let index = call.min(sequences.len().saturating_sub(1));
                    Ok(Box::pin(stream::iter(sequences[index].clone())))
                }
                Behavior::FailThenStream(failures, error, sequence) => {
                    if call < *failures {
                        Err(error.clone())
                    } else {
                        Ok(Box::pin(stream::iter(sequence.clone())))
                    }
                }
                Behavior::Pending => Ok(Box::pin(stream::pending())),
            }
        }
    }

    struct WeatherTool;

    #[async_trait::async_trait]
    impl ToolHandler for WeatherTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new(
                "get_weather",
                "current weather for a location",
                serde_json::json!({"type": "object", "properties": {"location": {"type": "string"}}}),
            )
        }

        async fn handle(&self, call: &ToolCall) -> Result<ToolResponse, ToolError> {
            Ok(ToolResponse::success(call.id.clone(), "72F and sunny"))
        }
    }

    fn orchestrator_with(adapter: ScriptedAdapter) -> crate::Orchestrator {
        crate::Orchestrator::builder()
            .register_adapter(Arc::new(adapter))
            .build()
            .expect("build orchestrator")
    }

    fn simple_turn(events: Vec<Result<StreamEvent, StreamError>>) -> TurnBuilder {
        orchestrator_with(ScriptedAdapter::new(Behavior::Sequences(vec![events])))
            .turn(ModelRef::new("fake", "model-a"))
            .user_text("hello")
    }

    #[tokio::test]
    async fn streams_chunks_in_order_and_aggregates() {
        let mut stream = simple_turn(vec![
            Ok(StreamEvent::content("Hi")),
            Ok(StreamEvent::content(" there")),
            Ok(StreamEvent::StreamEnd),
        ])
        .start()
        .await
        .expect("start");

        assert_eq!(stream.next_chunk().await.expect("chunk"), Some("Hi".into()));
        assert_eq!(
            stream.next_chunk().await.expect("chunk"),
            Some(" there".into())
        );
        assert_eq!(stream.next_chunk().await.expect("chunk"), None);

        let output = stream.finish().await.expect("finish");
        assert_eq!(output.text, "Hi there");
        assert_eq!(output.total_chunks, 2);
        assert_eq!(output.tool_rounds, 0);
        assert!(output.pending_tool_calls.is_empty());
    }

    #[tokio::test]
    async fn validation_rejects_missing_messages() {
        let orchestrator = orchestrator_with(ScriptedAdapter::new(Behavior::Sequences(vec![
            vec![Ok(StreamEvent::StreamEnd)],
        ])));
        let result = orchestrator
            .turn(ModelRef::new("fake", "model-a"))
            .start()
            .await;
        assert!(matches!(
            result,
            Err(OrchestratorError::Validation(message)) if message.contains("at least one message")
        ));
    }

    #[tokio::test]
    async fn unknown_provider_is_a_start_time_error() {
        let orchestrator = orchestrator_with(ScriptedAdapter::new(Behavior::Pending));
        let result = orchestrator
            .turn(ModelRef::new("missing", "model-a"))
            .user_text("hello")
            .start()
            .await;
        assert!(matches!(
            result,
            Err(OrchestratorError::ProviderNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn weather_round_trip_appends_tool_messages_and_streams_follow_up() {
        let first = vec![
            Ok(StreamEvent::content("Let me check. ")),
            Ok(StreamEvent::ToolCalls {
                calls: vec![ToolCall::new(
                    "call-1",
                    "get_weather",
                    r#"{"location":"Boston"}"#,
                )],
            }),
            Ok(StreamEvent::StreamEnd),
        ];
        let second = vec![
            Ok(StreamEvent::content("It is 72F in Boston.")),
            Ok(StreamEvent::StreamEnd),
        ];
        let adapter = ScriptedAdapter::new(Behavior::Sequences(vec![first, second]));
        let calls = Arc::clone(&adapter.calls);
        let requests = Arc::clone(&adapter.requests);

        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(WeatherTool));
        let orchestrator = crate::Orchestrator::builder()
            .register_adapter(Arc::new(adapter))
            .tools(tools)
            .build()
            .expect("build orchestrator");

        let output = orchestrator
            .turn(ModelRef::new("fake", "model-a"))
            .user_text("weather in Boston?")
            .collect_output()
            .await
            .expect("turn");

        assert_eq!(output.text, "Let me check. It is 72F in Boston.");
        assert_eq!(output.tool_rounds, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let requests = requests.lock().unwrap();
        let follow_up = &requests[1];
        assert!(
            follow_up
                .messages
                .iter()
                .any(|m| m.role == Role::Assistant && m.tool_calls.len() == 1)
        );
        assert!(
            follow_up
                .messages
                .iter()
                .any(|m| m.role == Role::Tool
                    && m.content == "72F and sunny"
                    && m.tool_call_id.as_deref() == Some("call-1"))
        );
        // The advertised tool definitions ride along on both requests.
        assert_eq!(requests[0].tools.len(), 1);
        assert_eq!(requests[0].tools[0].name, "get_weather");
    }

    #[tokio::test]
    async fn open_failures_are_retried_until_the_stream_starts() {
        let adapter = ScriptedAdapter::new(Behavior::FailThenStream(
            2,
            StreamError::transport("fake", "connection reset"),
            vec![Ok(StreamEvent::content("ok")), Ok(StreamEvent::StreamEnd)],
        ));
        let calls = Arc::clone(&adapter.calls);

        let text = orchestrator_with(adapter)
            .turn(ModelRef::new("fake", "model-a"))
            .user_text("hello")
            .retry(RetryConfig::default().max_retries(3).base_delay_ms(1).max_delay_ms(2))
            .collect_text()
            .await
            .expect("turn");

        assert_eq!(text, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn error_hook_retry_replaces_the_failed_sequence() {
        let adapter = ScriptedAdapter::new(Behavior::Sequences(vec![
            vec![
                Ok(StreamEvent::content("a")),
                Err(StreamError::protocol("mid-stream fault")),
            ],
            vec![Ok(StreamEvent::content("b")), Ok(StreamEvent::StreamEnd)],
        ]));
        let hook_runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hook_runs);

        let output = orchestrator_with(adapter)
            .turn(ModelRef::new("fake", "model-a"))
            .user_text("hello")
            .hooks(TurnHooks::new().on_error(move |ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                assert_eq!(ctx.attempt, 0);
                async { Ok(ErrorDecision::Retry) }
            }))
            .collect_output()
            .await
            .expect("turn");

        assert_eq!(output.text, "ab");
        assert_eq!(hook_runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unrecovered_failure_surfaces_once_and_fails_finish() {
        let mut stream = simple_turn(vec![
            Ok(StreamEvent::content("partial")),
            Err(StreamError::provider("fake", "boom", Some(500))),
        ])
        .start()
        .await
        .expect("start");

        assert_eq!(
            stream.next_chunk().await.expect("chunk"),
            Some("partial".into())
        );
        let err = stream.next_chunk().await.expect_err("failure chunk");
        assert!(matches!(
            err,
            OrchestratorError::TurnFailed(StreamError::Provider {
                status_code: Some(500),
                ..
            })
        ));
        assert!(matches!(
            stream.finish().await,
            Err(OrchestratorError::TurnFailed(StreamError::Provider { .. }))
        ));
    }

    #[tokio::test]
    async fn error_hook_runs_once_for_a_final_failure() {
        let adapter = ScriptedAdapter::new(Behavior::Sequences(vec![vec![Err(
            StreamError::provider("fake", "boom", Some(500)),
        )]]));
        let hook_runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hook_runs);

        let result = orchestrator_with(adapter)
            .turn(ModelRef::new("fake", "model-a"))
            .user_text("hello")
            .hooks(TurnHooks::new().on_error(move |_ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(ErrorDecision::Fail) }
            }))
            .collect_output()
            .await;

        assert!(matches!(result, Err(OrchestratorError::TurnFailed(_))));
        assert_eq!(hook_runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn abort_fails_the_turn_without_running_the_error_hook() {
        let hook_runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hook_runs);

        let mut stream = orchestrator_with(ScriptedAdapter::new(Behavior::Pending))
            .turn(ModelRef::new("fake", "model-a"))
            .user_text("hello")
            .hooks(TurnHooks::new().on_error(move |_ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(ErrorDecision::Retry) }
            }))
            .start()
            .await
            .expect("start");

        let abort = stream.abort_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            abort.abort();
        });

        let err = stream.next_chunk().await.expect_err("cancelled");
        assert!(matches!(
            err,
            OrchestratorError::TurnFailed(StreamError::Cancelled)
        ));
        assert!(matches!(
            stream.finish().await,
            Err(OrchestratorError::TurnFailed(StreamError::Cancelled))
        ));
        assert_eq!(hook_runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn before_start_cancel_is_an_empty_success() {
        let adapter = ScriptedAdapter::new(Behavior::Pending);
        let calls = Arc::clone(&adapter.calls);
        let started = Arc::new(AtomicUsize::new(0));
        let started_counter = Arc::clone(&started);

        let mut stream = orchestrator_with(adapter)
            .turn(ModelRef::new("fake", "model-a"))
            .user_text("hello")
            .hooks(
                TurnHooks::new()
                    .on_before_start(|_ctx| async { Ok(BeforeStartOutcome::Cancel) })
                    .on_stream_started(move |_ctx| {
                        started_counter.fetch_add(1, Ordering::SeqCst);
                    }),
            )
            .start()
            .await
            .expect("start");

        assert_eq!(stream.next_chunk().await.expect("no chunks"), None);
        let output = stream.finish().await.expect("finish");
        assert_eq!(output.total_chunks, 0);
        assert_eq!(output.text, "");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unanswerable_tool_calls_stop_streaming_and_are_surfaced() {
        let adapter = ScriptedAdapter::new(Behavior::Sequences(vec![vec![
            Ok(StreamEvent::ToolCalls {
                calls: vec![ToolCall::new("call-9", "unknown_tool", "{}")],
            }),
            Ok(StreamEvent::StreamEnd),
        ]]));
        let calls = Arc::clone(&adapter.calls);

        let output = orchestrator_with(adapter)
            .turn(ModelRef::new("fake", "model-a"))
            .user_text("hello")
            .collect_output()
            .await
            .expect("turn");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(output.tool_rounds, 0);
        assert_eq!(output.pending_tool_calls.len(), 1);
        assert_eq!(output.pending_tool_calls[0].name, "unknown_tool");
    }

    #[tokio::test]
    async fn tool_round_limit_stops_follow_ups() {
        let looping = vec![
            Ok(StreamEvent::ToolCalls {
                calls: vec![ToolCall::new("call-1", "get_weather", "{}")],
            }),
            Ok(StreamEvent::StreamEnd),
        ];
        let adapter = ScriptedAdapter::new(Behavior::Sequences(vec![looping]));
        let calls = Arc::clone(&adapter.calls);

        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(WeatherTool));
        let orchestrator = crate::Orchestrator::builder()
            .register_adapter(Arc::new(adapter))
            .tools(tools)
            .build()
            .expect("build orchestrator");

        let output = orchestrator
            .turn(ModelRef::new("fake", "model-a"))
            .user_text("hello")
            .max_tool_rounds(2)
            .collect_output()
            .await
            .expect("turn");

        // Initial sequence plus two follow-up rounds; the limit stops the loop.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(output.tool_rounds, 2);
    }

    #[tokio::test]
    async fn hook_skip_and_rewrite_shape_the_chunks() {
        let output = simple_turn(vec![
            Ok(StreamEvent::content("hi")),
            Ok(StreamEvent::content("drop me")),
            Ok(StreamEvent::content("yo")),
            Ok(StreamEvent::StreamEnd),
        ])
        .hooks(TurnHooks::new().on_before_chunk(|ctx| async move {
            if ctx.text.contains("drop") {
                Ok(ChunkDisposition::Skip)
            } else {
                Ok(ChunkDisposition::Emit(ctx.text.to_uppercase()))
            }
        }))
        .collect_output()
        .await
        .expect("turn");

        assert_eq!(output.text, "HIYO");
        assert_eq!(output.total_chunks, 2);
    }

    #[tokio::test]
    async fn processing_transforms_run_outside_the_hook_pipeline() {
        let output = simple_turn(vec![
            Ok(StreamEvent::content("  hello ")),
            Ok(StreamEvent::content("   ")),
            Ok(StreamEvent::content("world  ")),
            Ok(StreamEvent::StreamEnd),
        ])
        .processing(
            Processing::new()
                .preprocessor(|text| {
                    let trimmed = text.trim();
                    if trimmed.is_empty() {
                        None
                    } else {
                        Some(format!("{trimmed} "))
                    }
                })
                .postprocessor(|text| text.trim_end().to_owned()),
        )
        .collect_output()
        .await
        .expect("turn");

        assert_eq!(output.text, "hello world");
        assert_eq!(output.total_chunks, 2);
    }

    #[tokio::test]
    async fn end_hook_reports_delivered_chunk_totals() {
        let seen: Arc<StdMutex<Option<TurnEndContext>>> = Arc::new(StdMutex::new(None));
        let sink = Arc::clone(&seen);
        let after_chunks = Arc::new(AtomicUsize::new(0));
        let after_counter = Arc::clone(&after_chunks);

        simple_turn(vec![
            Ok(StreamEvent::content("a")),
            Ok(StreamEvent::content("b")),
            Ok(StreamEvent::StreamEnd),
        ])
        .hooks(
            TurnHooks::new()
                .on_after_chunk(move |_timing| {
                    after_counter.fetch_add(1, Ordering::SeqCst);
                })
                .on_turn_end(move |ctx| {
                    *sink.lock().unwrap() = Some(ctx);
                }),
        )
        .collect_output()
        .await
        .expect("turn");

        assert_eq!(after_chunks.load(Ordering::SeqCst), 2);
        let ctx = seen.lock().unwrap().clone().expect("end hook fired");
        assert_eq!(ctx.total_chunks, 2);
    }
}
