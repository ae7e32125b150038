use std::sync::Arc;

use futures::stream;
use turnstream::adapter::{AdapterRequest, EventStream};
use turnstream::prelude::*;

struct ScriptedAdapter;

#[async_trait::async_trait]
impl VendorAdapter for ScriptedAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::new("scripted")
    }

    async fn open_stream(&self, _request: AdapterRequest) -> Result<EventStream, StreamError> {
        let mut events: Vec<Result<StreamEvent, StreamError>> = Vec::new();
        for chunk in ["Hello", " from", " a", " scripted", " stream."] {
            events.push(Ok(StreamEvent::content(chunk)));
        }
        events.push(Ok(StreamEvent::StreamEnd));
        Ok(Box::pin(stream::iter(events)))
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), OrchestratorError> {
    turnstream::init_observability();

    let orchestrator = Orchestrator::builder()
        .register_adapter(Arc::new(ScriptedAdapter))
        .build()?;

    let mut stream = orchestrator
        .turn(ModelRef::new("scripted", "demo-model"))
        .system_prompt("Reply to test streaming.")
        .user_text("Stream a greeting.")
        .timeout(TimeoutConfig::after_ms(2_000))
        .start()
        .await?;

    while let Some(chunk) = stream.next_chunk().await? {
        print!("{chunk}");
    }
    println!();

    let output = stream.finish().await?;
    println!(
        "chunks: {}, duration: {} ms",
        output.total_chunks, output.duration_ms
    );
    Ok(())
}
