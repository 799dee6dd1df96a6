//! Custom agent handler.
//!
//! A custom agent is a user-authored execution unit with a single async
//! entry point. It receives the message history, the resolved tool set,
//! agent- and user-scoped valves, and the event sink — and may run
//! arbitrary logic, including recursive tool calls and agent-to-agent
//! invocation through the `call_agent` tool.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};

use super::{ExecutionContext, ExecutionHandler};
use crate::bridge::WorkerSink;
use crate::error::DispatchError;
use crate::model::ChatRequest;

/// A user-supplied execution unit.
#[async_trait]
pub trait CustomAgent: Send + Sync {
    fn id(&self) -> &str;

    /// Single entry point. Emits output through `ctx`; an error return
    /// becomes an in-conversation error message, never a broken
    /// connection.
    async fn run(&self, request: &ChatRequest, ctx: &ExecutionContext)
        -> Result<(), DispatchError>;
}

struct AgentEntry {
    agent: Arc<dyn CustomAgent>,
    valves: Map<String, Value>,
}

/// Registered custom agents plus their configuration values. Agent CRUD
/// lives outside the core; this is the read side the router resolves
/// against.
#[derive(Default)]
pub struct CustomAgentRegistry {
    agents: RwLock<HashMap<String, AgentEntry>>,
    /// (agent_id, user_id) → user-scoped valves.
    user_valves: RwLock<HashMap<(String, String), Map<String, Value>>>,
}

impl CustomAgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, agent: Arc<dyn CustomAgent>, valves: Map<String, Value>) {
        self.agents
            .write()
            .insert(agent.id().to_string(), AgentEntry { agent, valves });
    }

    pub fn get(&self, id: &str) -> Option<(Arc<dyn CustomAgent>, Map<String, Value>)> {
        self.agents
            .read()
            .get(id)
            .map(|entry| (entry.agent.clone(), entry.valves.clone()))
    }

    pub fn set_user_valves(&self, agent_id: &str, user_id: &str, valves: Map<String, Value>) {
        self.user_valves
            .write()
            .insert((agent_id.to_string(), user_id.to_string()), valves);
    }

    pub fn user_valves(&self, agent_id: &str, user_id: &str) -> Map<String, Value> {
        self.user_valves
            .read()
            .get(&(agent_id.to_string(), user_id.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}

pub struct CustomAgentHandler {
    agent: Arc<dyn CustomAgent>,
}

impl CustomAgentHandler {
    pub fn new(agent: Arc<dyn CustomAgent>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl ExecutionHandler for CustomAgentHandler {
    fn kind(&self) -> &'static str {
        "custom_agent"
    }

    async fn execute(
        &self,
        request: &ChatRequest,
        ctx: &ExecutionContext,
    ) -> Result<(), DispatchError> {
        tracing::info!(agent = self.agent.id(), "Executing custom agent");
        ctx.emit(crate::events::OutputEvent::status("Agent started..."))
            .await?;

        if let Err(e) = self.agent.run(request, ctx).await {
            return Err(match e {
                DispatchError::Cancelled(reason) => DispatchError::Cancelled(reason),
                other => DispatchError::handler(format!(
                    "Agent '{}' execution failed: {}",
                    self.agent.id(),
                    other
                )),
            });
        }

        ctx.emit(crate::events::OutputEvent::status("Agent finished."))
            .await?;
        Ok(())
    }
}

/// Adapter for execution units that must run outside the cooperative
/// scheduling domain — blocking SDKs or libraries that own their own event
/// loop. The unit runs on a dedicated worker thread and pushes through the
/// bridge's blocking handle; the bounded channel stalls the worker when
/// the consumer is slow, and the unit observes teardown as a failed push.
pub struct BlockingUnitAgent {
    id: String,
    #[allow(clippy::type_complexity)]
    unit: Arc<dyn Fn(ChatRequest, &WorkerSink) -> Result<(), String> + Send + Sync>,
}

impl BlockingUnitAgent {
    pub fn new<F>(id: impl Into<String>, unit: F) -> Self
    where
        F: Fn(ChatRequest, &WorkerSink) -> Result<(), String> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            unit: Arc::new(unit),
        }
    }
}

#[async_trait]
impl CustomAgent for BlockingUnitAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(
        &self,
        request: &ChatRequest,
        ctx: &ExecutionContext,
    ) -> Result<(), DispatchError> {
        let unit = self.unit.clone();
        let worker = ctx.sink.worker_handle();
        let request = request.clone();

        let result = tokio::task::spawn_blocking(move || unit(request, &worker))
            .await
            .map_err(|e| DispatchError::handler(format!("Worker unit panicked: {}", e)))?;

        result.map_err(DispatchError::HandlerInternal)
    }
}
