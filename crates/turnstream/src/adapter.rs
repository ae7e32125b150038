use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;

use futures::Stream;
use tokio_util::sync::CancellationToken;

use crate::errors::StreamError;
use crate::event::{StreamEvent, ToolCall, ToolDefinition};
use crate::message::Message;
use crate::model::{ModelRef, ProviderId};

/// Boxed event sequence produced by one vendor streaming call.
///
/// Single consumption, finite. A conforming sequence yields any number of
/// `Content`/`ToolCalls` items and then exactly one terminal outcome: an
/// `Ok(StreamEnd)` item, or an `Err` item.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, StreamError>> + Send>>;

/// Everything an adapter needs to start one streaming call.
#[derive(Clone, Debug)]
pub struct AdapterRequest {
    pub turn_id: uuid::Uuid,
    pub model: ModelRef,
    /// Conversation so far, oldest first.
    pub messages: Vec<Message>,
    /// Tools advertised for this turn; empty when none were provisioned.
    pub tools: Vec<ToolDefinition>,
    /// Vendor-specific request options keyed by provider id.
    pub provider_options: HashMap<ProviderId, serde_json::Value>,
    /// Shared turn token. The adapter must observe it before each yield and
    /// stop producing once it fires.
    pub cancel: CancellationToken,
}

/// Contract implemented once per vendor, outside this crate.
///
/// `open_stream` performs the vendor call and returns the event sequence.
/// Partial tool-call chunks must be merged before emission so `ToolCalls`
/// events only ever carry whole calls; [`ToolCallAccumulator`] implements the
/// required merge.
#[async_trait::async_trait]
pub trait VendorAdapter: Send + Sync {
    /// Stable adapter identifier used for registration and routing.
    fn id(&self) -> ProviderId;

    /// Starts one streaming call for the given request.
    async fn open_stream(&self, request: AdapterRequest) -> Result<EventStream, StreamError>;
}

/// One partial tool-call chunk as streamed by a vendor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolCallFragment {
    /// Slot the fragment belongs to; vendors key fragments by position.
    pub index: u32,
    /// Call id, usually only present on the first fragment of a slot.
    pub id: Option<String>,
    /// Partial tool name.
    pub name: Option<String>,
    /// Partial JSON arguments text.
    pub arguments: Option<String>,
}

/// Merges tool-call fragments into whole `ToolCall`s.
///
/// Fragments sharing an index concatenate `name` and `arguments` in arrival
/// order; the id is taken from the first fragment that carries one. Slots
/// that never received an id get a synthetic `call_<index>` id.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    slots: BTreeMap<u32, PartialCall>,
}

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one fragment into its slot.
    pub fn apply(&mut self, fragment: ToolCallFragment) {
        let slot = self.slots.entry(fragment.index).or_default();
        if slot.id.is_none()
            && let Some(id) = fragment.id
        {
            slot.id = Some(id);
        }
        if let Some(name) = fragment.name {
            slot.name.push_str(&name);
        }
        if let Some(arguments) = fragment.arguments {
            slot.arguments.push_str(&arguments);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Finishes accumulation, yielding whole calls in slot order.
    pub fn finish(self) -> Vec<ToolCall> {
        self.slots
            .into_iter()
            .map(|(index, slot)| ToolCall {
                id: slot.id.unwrap_or_else(|| format!("call_{index}")),
                name: slot.name,
                arguments: slot.arguments,
            })
            .collect()
    }
}
