//! Streaming turn orchestration over pluggable vendor adapters.
//!
//! A vendor adapter translates one request into an ordered event sequence.
//! The engine multiplexes those sequences through a stream queue, guards
//! them with retries and an inactivity timeout, answers tool calls through
//! hooks or a registry, and hands the caller a plain chunk stream.
//!
//! # Builder-first usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use turnstream::prelude::*;
//!
//! # struct ScriptedAdapter;
//! # #[async_trait::async_trait]
//! # impl VendorAdapter for ScriptedAdapter {
//! #     fn id(&self) -> ProviderId {
//! #         ProviderId::new("scripted")
//! #     }
//! #     async fn open_stream(
//! #         &self,
//! #         _request: turnstream::adapter::AdapterRequest,
//! #     ) -> Result<turnstream::adapter::EventStream, StreamError> {
//! #         Ok(Box::pin(futures::stream::iter(vec![
//! #             Ok(StreamEvent::content("hello")),
//! #             Ok(StreamEvent::StreamEnd),
//! #         ])))
//! #     }
//! # }
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), OrchestratorError> {
//! let orchestrator = Orchestrator::builder()
//!     .register_adapter(Arc::new(ScriptedAdapter))
//!     .build()?;
//!
//! let mut stream = orchestrator
//!     .turn(ModelRef::new("scripted", "model-a"))
//!     .system_prompt("Answer briefly.")
//!     .user_text("Say hello")
//!     .start()
//!     .await?;
//!
//! while let Some(chunk) = stream.next_chunk().await? {
//!     print!("{chunk}");
//! }
//! # Ok(())
//! # }
//! ```

/// Vendor adapter contract and tool-call fragment assembly.
pub mod adapter;
/// Tool handler registry and never-failing dispatch.
pub mod dispatch;
/// Public error types used by the orchestrator API.
pub mod errors;
/// Normalized stream events, tool calls, and tool responses.
pub mod event;
/// Fixed per-turn hook set and chunk processing transforms.
pub mod hooks;
/// Conversation roles and messages.
pub mod message;
/// Model and provider identifiers plus generic turn options.
pub mod model;
/// Process-wide tracing setup.
pub mod observability;
/// Orchestrator entry point and builder.
pub mod orchestrator;
/// Common imports for typical usage.
pub mod prelude;
/// Sequential multiplexing of adapter event sequences.
pub mod queue;
/// Retry classification, backoff, and the retry driver.
pub mod retry;
/// Per-item inactivity guard for adapter sequences.
pub mod timeout;
/// Turn builder, streaming handle, and cancellation handle.
pub mod turn;

pub use adapter::{
    AdapterRequest, EventStream, ToolCallAccumulator, ToolCallFragment, VendorAdapter,
};
pub use dispatch::{DispatchConfig, ToolError, ToolHandler, ToolRegistry};
pub use errors::{OrchestratorError, StreamError};
pub use event::{StreamEvent, ToolCall, ToolDefinition, ToolResponse};
pub use hooks::{
    BeforeStartOutcome, ChunkDisposition, ErrorDecision, HookError, Processing, StartOverrides,
    ToolHookOutcome, ToolProvision, TurnHooks,
};
pub use message::{Message, Role};
pub use model::{ModelRef, ProviderId, TurnOptions};
pub use observability::init_observability;
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use queue::{QueueHandle, QueueState, StreamQueue};
pub use retry::RetryConfig;
pub use timeout::TimeoutConfig;
pub use turn::{AbortHandle, TurnBuilder, TurnOutput, TurnStream};
