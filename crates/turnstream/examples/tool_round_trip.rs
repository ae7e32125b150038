use std::sync::Arc;

use futures::stream;
use turnstream::adapter::{AdapterRequest, EventStream};
use turnstream::prelude::*;

/// Scripted model behavior: ask for the weather tool first, then answer from
/// the tool message the engine appended to the conversation.
struct WeatherAdapter;

#[async_trait::async_trait]
impl VendorAdapter for WeatherAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::new("scripted")
    }

    async fn open_stream(&self, request: AdapterRequest) -> Result<EventStream, StreamError> {
        let weather = request
            .messages
            .iter()
            .find(|message| message.role == Role::Tool)
            .map(|message| message.content.clone());
        let events: Vec<Result<StreamEvent, StreamError>> = match weather {
            None => vec![
                Ok(StreamEvent::content("Checking the weather... ")),
                Ok(StreamEvent::ToolCalls {
                    calls: vec![ToolCall::new(
                        "call-1",
                        "get_weather",
                        r#"{"location":"Boston"}"#,
                    )],
                }),
                Ok(StreamEvent::StreamEnd),
            ],
            Some(report) => vec![
                Ok(StreamEvent::content(format!("Boston right now: {report}"))),
                Ok(StreamEvent::StreamEnd),
            ],
        };
        Ok(Box::pin(stream::iter(events)))
    }
}

struct WeatherTool;

#[async_trait::async_trait]
impl ToolHandler for WeatherTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "get_weather",
            "Current weather for a location",
            serde_json::json!({
                "type": "object",
                "properties": {"location": {"type": "string"}},
                "required": ["location"]
            }),
        )
    }

    async fn handle(&self, call: &ToolCall) -> Result<ToolResponse, ToolError> {
        let args = call
            .parsed_arguments()
            .map_err(|err| ToolError::new(err.to_string()))?;
        let location = args["location"].as_str().unwrap_or("somewhere");
        Ok(ToolResponse::success(
            call.id.clone(),
            format!("72F and sunny in {location}"),
        ))
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), OrchestratorError> {
    turnstream::init_observability();

    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(WeatherTool));

    let orchestrator = Orchestrator::builder()
        .register_adapter(Arc::new(WeatherAdapter))
        .tools(tools)
        .build()?;

    let output = orchestrator
        .turn(ModelRef::new("scripted", "demo-model"))
        .user_text("What's the weather in Boston?")
        .collect_output()
        .await?;

    println!("{}", output.text);
    println!("tool rounds: {}", output.tool_rounds);
    Ok(())
}
