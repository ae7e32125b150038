use crate::errors::StreamError;

/// Normalized event emitted by vendor adapter sequences and the stream queue.
///
/// Adapters yield `Content`/`ToolCalls` items and finish with exactly one
/// `StreamEnd`; a failed sequence ends with an `Err` item instead, which the
/// queue converts into a single in-band `Error` event so consumption can
/// continue with the next pushed sequence.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// Incremental text output chunk.
    Content { text: String },
    /// Completed tool-call requests for this turn (non-empty).
    ToolCalls { calls: Vec<ToolCall> },
    /// Terminal success marker, exactly once per adapter sequence.
    StreamEnd,
    /// Terminal failure for one adapter sequence.
    Error { error: StreamError },
}

impl StreamEvent {
    /// Creates a content event.
    pub fn content(text: impl Into<String>) -> Self {
        Self::Content { text: text.into() }
    }

    /// Returns true for the two terminal variants.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::StreamEnd | Self::Error { .. })
    }
}

/// One fully assembled tool-call request from the model.
///
/// Adapters build these from partial fragments; `arguments` is the raw JSON
/// string exactly as the vendor streamed it.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ToolCall {
    /// Vendor-assigned id, unique within a turn.
    pub id: String,
    /// Registered tool name.
    pub name: String,
    /// Raw JSON arguments, accumulated append-only from fragments.
    pub arguments: String,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// Parses the accumulated arguments as JSON.
    pub fn parsed_arguments(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_str(&self.arguments)
    }
}

/// Result of dispatching one `ToolCall`. Exactly one exists per dispatched
/// call; failures are carried here, never raised.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ToolResponse {
    /// Id of the call this response answers.
    pub tool_call_id: String,
    /// Payload handed back to the model.
    pub content: String,
    /// False when the handler failed, timed out, or was missing.
    pub success: bool,
    /// Failure detail when `success` is false.
    pub error: Option<String>,
}

impl ToolResponse {
    /// Creates a successful response.
    pub fn success(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            success: true,
            error: None,
        }
    }

    /// Creates a failed response; the message doubles as model-visible content.
    pub fn failure(tool_call_id: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            tool_call_id: tool_call_id.into(),
            content: message.clone(),
            success: false,
            error: Some(message),
        }
    }
}

/// Declaration of a callable tool, advertised to the model.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema for the tool's arguments object.
    pub input_schema: serde_json::Value,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}
