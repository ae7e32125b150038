//! Common imports for typical orchestrator usage.
//!
//! This module intentionally exports the most frequently used builder and
//! runtime types so examples and application code need fewer import lines.
pub use crate::{
    AbortHandle, Message, ModelRef, Orchestrator, OrchestratorBuilder, OrchestratorError,
    ProviderId, RetryConfig, Role, StreamError, StreamEvent, TimeoutConfig, ToolCall,
    ToolDefinition, ToolError, ToolHandler, ToolRegistry, ToolResponse, TurnBuilder, TurnHooks,
    TurnOptions, TurnOutput, TurnStream, VendorAdapter,
};
