use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::adapter::VendorAdapter;
use crate::dispatch::ToolRegistry;
use crate::errors::OrchestratorError;
use crate::hooks::{Processing, TurnHooks};
use crate::model::{ModelRef, ProviderId, TurnOptions};
use crate::retry::RetryConfig;
use crate::timeout::TimeoutConfig;
use crate::turn::TurnBuilder;

pub(crate) struct OrchestratorInner {
    adapters: HashMap<ProviderId, Arc<dyn VendorAdapter>>,
    pub(crate) tools: Option<Arc<ToolRegistry>>,
    pub(crate) hooks: TurnHooks,
    pub(crate) retry: RetryConfig,
    pub(crate) timeout: TimeoutConfig,
    pub(crate) options: TurnOptions,
    pub(crate) processing: Processing,
}

impl OrchestratorInner {
    pub(crate) fn adapter(&self, id: &ProviderId) -> Option<Arc<dyn VendorAdapter>> {
        self.adapters.get(id).cloned()
    }
}

/// Entry point for registering vendor adapters and starting turns.
///
/// Hooks, retry, timeout, options, and processing configured here are the
/// defaults for every turn; `TurnBuilder` can replace any of them per turn.
#[derive(Clone)]
pub struct Orchestrator {
    pub(crate) inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    /// Starts a builder for registering adapters and shared configuration.
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    /// Starts configuring a streamed turn against `model`.
    pub fn turn(&self, model: ModelRef) -> TurnBuilder {
        TurnBuilder::new(self.inner.clone(), model)
    }
}

/// Builder used to register adapters and shared defaults before creating an
/// `Orchestrator`.
#[derive(Default)]
pub struct OrchestratorBuilder {
    adapters: Vec<Arc<dyn VendorAdapter>>,
    tools: Option<Arc<ToolRegistry>>,
    hooks: TurnHooks,
    retry: RetryConfig,
    timeout: TimeoutConfig,
    options: TurnOptions,
    processing: Processing,
}

impl OrchestratorBuilder {
    /// Registers a vendor adapter.
    ///
    /// Register one adapter per provider id (for example one `openai`
    /// adapter).
    pub fn register_adapter(mut self, adapter: Arc<dyn VendorAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    /// Sets the tool registry used when no tool-provider hook supplies
    /// tools for a turn.
    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Some(Arc::new(tools));
        self
    }

    /// Sets the orchestrator-wide hooks.
    pub fn hooks(mut self, hooks: TurnHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Sets the orchestrator-wide retry configuration.
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the orchestrator-wide inactivity-timeout configuration.
    pub fn timeout(mut self, timeout: TimeoutConfig) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the orchestrator-wide turn options.
    pub fn options(mut self, options: TurnOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the orchestrator-wide chunk pre/postprocessing.
    pub fn processing(mut self, processing: Processing) -> Self {
        self.processing = processing;
        self
    }

    /// Builds the orchestrator and validates adapter registration
    /// (including duplicates).
    pub fn build(self) -> Result<Orchestrator, OrchestratorError> {
        let mut map: HashMap<ProviderId, Arc<dyn VendorAdapter>> = HashMap::new();
        let mut seen: HashSet<ProviderId> = HashSet::new();
        for adapter in self.adapters {
            let id = adapter.id();
            if !seen.insert(id.clone()) {
                return Err(OrchestratorError::Config(format!(
                    "duplicate adapter registration: {id}"
                )));
            }
            map.insert(id, adapter);
        }
        Ok(Orchestrator {
            inner: Arc::new(OrchestratorInner {
                adapters: map,
                tools: self.tools,
                hooks: self.hooks,
                retry: self.retry,
                timeout: self.timeout,
                options: self.options,
                processing: self.processing,
            }),
        })
    }
}
