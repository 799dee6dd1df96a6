//! Router/dispatcher.
//!
//! Top-level entry point: classifies the request onto exactly one
//! execution handler, runs the inlet filter chain before dispatch and the
//! outlet chain over the terminal payload, drives the handler through the
//! streaming bridge, and persists the turn exactly once in a terminal
//! state. Handlers emit progress only — the router owns terminal events,
//! so every sequence ends with exactly one of completed/error/cancelled,
//! and persistence always precedes the caller-facing terminal event.
//!
//! Retry policy is deliberately absent: a failed handler invocation is
//! never re-run; the caller decides with a new request.

use std::path::PathBuf;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use rand::seq::SliceRandom;

use crate::bridge::{self, EventSink, EventStream};
use crate::cancel::{CancelReason, CancellationCoordinator, CancellationSignal};
use crate::config::GatewayConfig;
use crate::error::DispatchError;
use crate::events::{FinishKind, OutputEvent};
use crate::filters::FilterPipeline;
use crate::handlers::{
    CustomAgentHandler, CustomAgentRegistry, EmbeddedFunctionHandler, EmbeddedFunctionRegistry,
    ExecutionContext, ExecutionHandler, HandlerState, LocalRuntimeHandler, NodeCompletion,
    RemoteServerHandler, WorkflowAgentHandler, WorkflowAgentRegistry,
};
use crate::handlers::remote::CompletionClient;
use crate::model::{
    BackendKind, ChatMessage, ChatRequest, FilterRegistry, ModelDescriptor, ModelLookup,
    RequestMetadata, UserIdentity, Valves,
};
use crate::storage::{Database, TurnStatus, TurnStore};
use crate::tools::{AgentDispatch, ToolAdapter, ToolInvocation, CALL_AGENT_TOOL_ID};

/// Arena entries may point at other arenas; resolution is bounded to avoid
/// descriptor cycles.
const MAX_ARENA_DEPTH: usize = 4;

/// Shared services the dispatcher needs.
pub struct DispatcherServices {
    pub config: Arc<GatewayConfig>,
    pub models: Arc<dyn ModelLookup>,
    pub filters: Arc<FilterRegistry>,
    pub pipeline: Arc<FilterPipeline>,
    pub tool_adapter: ToolAdapter,
    pub embedded: Arc<EmbeddedFunctionRegistry>,
    pub custom_agents: Arc<CustomAgentRegistry>,
    pub workflows: Arc<WorkflowAgentRegistry>,
    /// Backend used by workflow llm nodes. Optional; llm nodes fail with
    /// an in-stream error when absent.
    pub workflow_completion: Option<Arc<dyn NodeCompletion>>,
    pub coordinator: Arc<CancellationCoordinator>,
    pub db_path: Arc<PathBuf>,
}

pub struct Dispatcher {
    services: DispatcherServices,
    /// Weak self-reference so `&self` methods can spawn owning tasks and
    /// hand the `call_agent` tool a dispatch seam.
    self_ref: Weak<Dispatcher>,
}

/// Outcome of classification: one handler instance bound to this request,
/// plus the configuration that travels with it.
struct ResolvedExecution {
    handler: Box<dyn ExecutionHandler>,
    valves: Valves,
    /// Public model id when the backend is an agent kind; joins the call
    /// chain (this is the id `call_agent` targets, so cycle detection
    /// compares like with like).
    agent_id: Option<String>,
}

impl Dispatcher {
    pub fn new(services: DispatcherServices) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            services,
            self_ref: weak.clone(),
        })
    }

    /// An owning handle to self. Infallible while any `&self` borrow
    /// exists, since that borrow keeps the strong count above zero.
    fn arc(&self) -> Arc<Self> {
        self.self_ref.upgrade().expect("dispatcher is alive")
    }

    /// Dispatch one request. Returns the canonical event sequence; the
    /// generation runs as a spawned task and survives slow consumption
    /// (bounded by the bridge capacity).
    pub fn dispatch(&self, request: ChatRequest, model: ModelDescriptor) -> EventStream {
        let (sink, stream) = bridge::channel(self.services.config.bridge_capacity);
        let signal = self
            .services
            .coordinator
            .register(&request.metadata.chat_id, &request.metadata.message_id);

        let this = self.arc();
        tokio::spawn(async move {
            this.run(request, model, signal, sink, Vec::new()).await;
        });
        stream
    }

    async fn run(
        self: Arc<Self>,
        request: ChatRequest,
        model: ModelDescriptor,
        signal: CancellationSignal,
        sink: EventSink,
        agent_chain: Vec<String>,
    ) {
        let meta = request.metadata.clone();
        self.persist(&meta, None, None, TurnStatus::Streaming);

        // Inlet filters run before classification; cancellation is
        // observed between filter invocations.
        let filters = self.services.filters.for_model(&model);
        let request = self
            .services
            .pipeline
            .apply_inlet(&request, filters.clone(), &signal)
            .await;

        let outcome = self
            .generate(request, &model, &signal, &sink, agent_chain)
            .await;

        match outcome {
            Ok(content) => {
                let content = self
                    .outlet_content(&model, content, filters, &signal)
                    .await;
                self.persist(&meta, Some(&content), None, TurnStatus::Complete);
                let _ = sink
                    .send(OutputEvent::Done {
                        finish: FinishKind::Complete,
                        content,
                    })
                    .await;
            }
            Err((content, DispatchError::Cancelled(reason))) => {
                tracing::info!(
                    chat_id = %meta.chat_id,
                    message_id = %meta.message_id,
                    reason = %reason,
                    "Generation cancelled; flushing partial content"
                );
                self.persist(&meta, Some(&content), None, TurnStatus::Cancelled);
                let _ = sink
                    .send(OutputEvent::Done {
                        finish: FinishKind::Cancelled,
                        content,
                    })
                    .await;
            }
            Err((content, e)) => {
                let detail = e.to_string();
                // Connection-class failures get a generic caller-facing
                // message; structured backend errors keep their detail.
                let message = if e.is_connection_class() {
                    "Connection to execution backend failed".to_string()
                } else {
                    detail.clone()
                };
                tracing::error!(
                    chat_id = %meta.chat_id,
                    message_id = %meta.message_id,
                    error = %detail,
                    "Generation failed"
                );
                self.persist(&meta, Some(&content), Some(&detail), TurnStatus::Error);
                let _ = sink.send(OutputEvent::Error { message }).await;
            }
        }

        sink.finish().await;
        self.services
            .coordinator
            .complete(&meta.chat_id, &meta.message_id);
    }

    /// Classify, build the execution context, and drive the handler.
    /// Returns accumulated content either way so partials survive every
    /// failure mode.
    async fn generate(
        &self,
        request: ChatRequest,
        model: &ModelDescriptor,
        signal: &CancellationSignal,
        sink: &EventSink,
        mut agent_chain: Vec<String>,
    ) -> Result<String, (String, DispatchError)> {
        let meta = request.metadata.clone();

        let resolved = match self.resolve(model, &request.user) {
            Ok(resolved) => resolved,
            Err(e) => return Err((String::new(), e)),
        };
        if let Some(agent_id) = &resolved.agent_id {
            agent_chain.push(agent_id.clone());
        }

        let mut invocation = ToolInvocation::for_user(request.user.clone());
        invocation.agent_chain = agent_chain.clone();
        let nested: Arc<dyn AgentDispatch> = Arc::new(NestedDispatch {
            dispatcher: self.arc(),
        });
        invocation.dispatch = Some(nested);

        // Agent backends can always reach other agents; everything else
        // only gets what the request selected.
        let mut tool_ids = request.tool_ids.clone();
        if resolved.agent_id.is_some() && !tool_ids.iter().any(|id| id == CALL_AGENT_TOOL_ID) {
            tool_ids.push(CALL_AGENT_TOOL_ID.to_string());
        }
        let tools = self.services.tool_adapter.convert(&tool_ids, &invocation).await;

        let (inner_sink, mut inner_stream) =
            bridge::channel(self.services.config.bridge_capacity);
        let ctx = ExecutionContext {
            user: request.user.clone(),
            metadata: meta.clone(),
            tools,
            valves: resolved.valves,
            signal: signal.clone(),
            sink: inner_sink,
            agent_chain,
        };

        let handler = resolved.handler;
        tracing::info!(
            kind = handler.kind(),
            model = %model.id,
            chat_id = %meta.chat_id,
            "Dispatching request"
        );

        let exec = tokio::spawn(async move {
            let result = handler.execute(&request, &ctx).await;
            ctx.sink.finish().await;
            result
        });

        let mut state = HandlerState::Idle;
        state.begin();
        let mut content = String::new();

        loop {
            let event = tokio::select! {
                reason = signal.cancelled() => {
                    // The handler observes the same signal at its next
                    // suspension point; an in-flight blocking external
                    // call is abandoned, not killed.
                    return Err((content, DispatchError::Cancelled(reason)));
                }
                event = inner_stream.next() => event,
            };

            let Some(event) = event else { break };

            if event.is_terminal() {
                tracing::warn!(
                    kind = ?event,
                    "Handler emitted a terminal event; suppressed (router owns terminal state)"
                );
                continue;
            }

            if let OutputEvent::PartialContent { delta } = &event {
                content.push_str(delta);
                if self.services.config.persist_each_chunk {
                    self.persist(&meta, Some(&content), None, TurnStatus::Streaming);
                }
            }
            state.observe(&event);

            if !sink.send(event).await {
                // Caller went away; fold into the cancellation path at the
                // next loop turn.
                self.services.coordinator.cancel(
                    &meta.chat_id,
                    &meta.message_id,
                    CancelReason::CallerAbort,
                );
            }
        }

        tracing::debug!(state = ?state, "Handler stream drained");

        match exec.await {
            Ok(Ok(())) => Ok(content),
            Ok(Err(e)) => Err((content, e)),
            Err(join_err) => Err((
                content,
                DispatchError::handler(format!("Handler panicked: {}", join_err)),
            )),
        }
    }

    /// Classification, evaluated on the closed backend enum; arena models
    /// resolve to one member uniformly at random and re-classify.
    fn resolve(
        &self,
        model: &ModelDescriptor,
        user: &UserIdentity,
    ) -> Result<ResolvedExecution, DispatchError> {
        let config = &self.services.config;
        let mut descriptor = model.clone();

        for _ in 0..MAX_ARENA_DEPTH {
            match descriptor.backend.clone() {
                BackendKind::Embedded { function_id } => {
                    let function = self.services.embedded.get(&function_id).ok_or_else(|| {
                        DispatchError::handler(format!(
                            "Embedded function '{}' is not registered",
                            function_id
                        ))
                    })?;
                    return Ok(ResolvedExecution {
                        handler: Box::new(EmbeddedFunctionHandler::new(function)),
                        valves: Valves::default(),
                        agent_id: None,
                    });
                }

                BackendKind::CustomAgent { agent_id } => {
                    let (agent, agent_valves) =
                        self.services.custom_agents.get(&agent_id).ok_or_else(|| {
                            DispatchError::handler(format!(
                                "Custom agent '{}' is not registered",
                                agent_id
                            ))
                        })?;
                    let user_valves = self
                        .services
                        .custom_agents
                        .user_valves(&agent_id, &user.id);
                    return Ok(ResolvedExecution {
                        handler: Box::new(CustomAgentHandler::new(agent)),
                        valves: Valves {
                            agent: agent_valves,
                            user: user_valves,
                        },
                        agent_id: Some(descriptor.id.clone()),
                    });
                }

                BackendKind::WorkflowAgent { agent_id } => {
                    let (definition, agent_valves) =
                        self.services.workflows.get(&agent_id).ok_or_else(|| {
                            DispatchError::handler(format!(
                                "Workflow agent '{}' is not registered",
                                agent_id
                            ))
                        })?;
                    return Ok(ResolvedExecution {
                        handler: Box::new(WorkflowAgentHandler::new(
                            definition,
                            self.services.workflow_completion.clone(),
                        )),
                        valves: Valves {
                            agent: agent_valves,
                            user: Default::default(),
                        },
                        agent_id: Some(descriptor.id.clone()),
                    });
                }

                BackendKind::Arena { members } => {
                    let member = members
                        .choose(&mut rand::thread_rng())
                        .ok_or_else(|| {
                            DispatchError::handler(format!(
                                "Arena '{}' has no members",
                                descriptor.id
                            ))
                        })?
                        .clone();
                    descriptor = self
                        .services
                        .models
                        .get(&member)
                        .ok_or(DispatchError::UnknownModel(member))?;
                    // Re-run classification on the resolved member.
                    continue;
                }

                BackendKind::LocalRuntime { base_url } => {
                    return Ok(ResolvedExecution {
                        handler: Box::new(
                            LocalRuntimeHandler::new(base_url, config)
                                .with_params(descriptor.params.clone()),
                        ),
                        valves: Valves::default(),
                        agent_id: None,
                    });
                }

                BackendKind::RemoteServer { base_url, key_ref } => {
                    let api_key = key_ref.as_deref().and_then(|name| {
                        let key = std::env::var(name).ok();
                        if key.is_none() {
                            tracing::warn!(
                                key_ref = name,
                                "Credential reference not set; calling backend unauthenticated"
                            );
                        }
                        key
                    });
                    let client = CompletionClient::new(base_url, api_key, config)
                        .with_params(descriptor.params.clone());
                    return Ok(ResolvedExecution {
                        handler: Box::new(RemoteServerHandler::new(client)),
                        valves: Valves::default(),
                        agent_id: None,
                    });
                }
            }
        }

        Err(DispatchError::handler(format!(
            "Arena resolution exceeded {} levels for model '{}'",
            MAX_ARENA_DEPTH, model.id
        )))
    }

    /// Outlet filters transform the terminal payload; the transformed
    /// content is what gets persisted and carried by the `Done` event.
    async fn outlet_content(
        &self,
        model: &ModelDescriptor,
        content: String,
        filters: Vec<crate::model::FilterDescriptor>,
        signal: &CancellationSignal,
    ) -> String {
        if filters.is_empty() {
            return content;
        }
        let payload = serde_json::json!({ "model": model.id, "content": content });
        let transformed = self
            .services
            .pipeline
            .apply_outlet(&payload, filters, signal)
            .await;
        match transformed["content"].as_str() {
            Some(text) => text.to_string(),
            None => content,
        }
    }

    fn persist(
        &self,
        meta: &RequestMetadata,
        content: Option<&str>,
        error: Option<&str>,
        status: TurnStatus,
    ) {
        match Database::new(&self.services.db_path) {
            Ok(db) => {
                let store = TurnStore::new(&db);
                if let Err(e) =
                    store.upsert_partial(&meta.chat_id, &meta.message_id, content, error, status)
                {
                    tracing::error!(
                        chat_id = %meta.chat_id,
                        message_id = %meta.message_id,
                        "Failed to persist turn: {}", e
                    );
                }
            }
            Err(e) => tracing::error!("Failed to open database while persisting turn: {}", e),
        }
    }
}

/// Nested agent dispatch used by the `call_agent` tool. Runs the full
/// dispatch pipeline (filters, classification, persistence) for the target
/// agent and returns its terminal content as the tool result.
struct NestedDispatch {
    dispatcher: Arc<Dispatcher>,
}

#[async_trait]
impl AgentDispatch for NestedDispatch {
    async fn dispatch_agent(
        &self,
        agent_id: &str,
        message: &str,
        user: &UserIdentity,
        chain: &[String],
    ) -> Result<String, DispatchError> {
        let model = self
            .dispatcher
            .services
            .models
            .get(agent_id)
            .ok_or_else(|| DispatchError::UnknownModel(agent_id.to_string()))?;

        // Nested turns persist under synthetic ids so agent-to-agent calls
        // stay auditable without touching the caller's chat.
        let metadata = RequestMetadata {
            chat_id: format!("agent-call-{}", agent_id),
            message_id: uuid::Uuid::new_v4().to_string(),
        };
        let request = ChatRequest {
            messages: vec![ChatMessage::user(message)],
            model: agent_id.to_string(),
            stream: false,
            tool_ids: Vec::new(),
            user: user.clone(),
            metadata,
        };

        let (sink, stream) =
            bridge::channel(self.dispatcher.services.config.bridge_capacity);
        let dispatcher = Arc::clone(&self.dispatcher);
        let chain = chain.to_vec();
        // A parent cancellation abandons the nested call rather than
        // interrupting it; its own terminal state is still persisted.
        let signal = CancellationSignal::never();
        tokio::spawn(async move {
            dispatcher.run(request, model, signal, sink, chain).await;
        });

        let events = stream.collect().await;
        match events.last() {
            Some(OutputEvent::Done {
                finish: FinishKind::Complete,
                content,
            }) => Ok(content.clone()),
            Some(OutputEvent::Done {
                finish: FinishKind::Cancelled,
                ..
            }) => Err(DispatchError::Cancelled(CancelReason::CallerAbort)),
            Some(OutputEvent::Error { message }) => {
                Err(DispatchError::handler(message.clone()))
            }
            _ => Err(DispatchError::handler(
                "Nested agent produced no terminal event".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{json, Map, Value};
    use tempfile::TempDir;

    use super::*;
    use crate::filters::{FilterStage, FilterTransport};
    use crate::handlers::workflow::{NodeKind, WorkflowDefinition, WorkflowEdge, WorkflowNode};
    use crate::handlers::{CustomAgent, EmbeddedFunction};
    use crate::model::{FilterDescriptor, FilterScope, ModelRegistry};
    use crate::tools::{CallAgentTool, ToolRegistry};

    struct HelloFunction;

    #[async_trait]
    impl EmbeddedFunction for HelloFunction {
        fn id(&self) -> &str {
            "hello"
        }
        async fn call(
            &self,
            _request: &ChatRequest,
            ctx: &ExecutionContext,
        ) -> Result<(), DispatchError> {
            ctx.emit(OutputEvent::PartialContent {
                delta: "Hello".to_string(),
            })
            .await?;
            ctx.emit(OutputEvent::PartialContent {
                delta: " world".to_string(),
            })
            .await
        }
    }

    struct FlakyFunction;

    #[async_trait]
    impl EmbeddedFunction for FlakyFunction {
        fn id(&self) -> &str {
            "flaky"
        }
        async fn call(
            &self,
            _request: &ChatRequest,
            ctx: &ExecutionContext,
        ) -> Result<(), DispatchError> {
            ctx.emit(OutputEvent::PartialContent {
                delta: "Hello".to_string(),
            })
            .await?;
            ctx.emit(OutputEvent::PartialContent {
                delta: " world".to_string(),
            })
            .await?;
            Err(DispatchError::BackendConnection(
                "connection dropped".to_string(),
            ))
        }
    }

    struct SlowFunction;

    #[async_trait]
    impl EmbeddedFunction for SlowFunction {
        fn id(&self) -> &str {
            "slow"
        }
        async fn call(
            &self,
            _request: &ChatRequest,
            ctx: &ExecutionContext,
        ) -> Result<(), DispatchError> {
            ctx.emit(OutputEvent::PartialContent {
                delta: "before-cancel".to_string(),
            })
            .await?;
            tokio::time::sleep(Duration::from_secs(30)).await;
            ctx.emit(OutputEvent::PartialContent {
                delta: "after-cancel".to_string(),
            })
            .await
        }
    }

    struct EchoFunction;

    #[async_trait]
    impl EmbeddedFunction for EchoFunction {
        fn id(&self) -> &str {
            "echo"
        }
        async fn call(
            &self,
            request: &ChatRequest,
            ctx: &ExecutionContext,
        ) -> Result<(), DispatchError> {
            ctx.emit(OutputEvent::PartialContent {
                delta: request.last_user_message().unwrap_or_default().to_string(),
            })
            .await
        }
    }

    struct RelayAgent;

    #[async_trait]
    impl CustomAgent for RelayAgent {
        fn id(&self) -> &str {
            "relay-agent"
        }
        async fn run(
            &self,
            request: &ChatRequest,
            ctx: &ExecutionContext,
        ) -> Result<(), DispatchError> {
            let target = ctx
                .valves
                .agent
                .get("target")
                .and_then(Value::as_str)
                .unwrap_or("hello-model")
                .to_string();
            let tool = ctx
                .tool(CALL_AGENT_TOOL_ID)
                .ok_or_else(|| DispatchError::handler("call_agent missing"))?;
            let outcome = tool
                .call(json!({
                    "agent_id": target,
                    "message": request.last_user_message().unwrap_or_default(),
                }))
                .await;
            let text = match &outcome.output {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            ctx.emit(OutputEvent::PartialContent {
                delta: if outcome.is_error {
                    format!("ERR: {}", text)
                } else {
                    text
                },
            })
            .await
        }
    }

    struct TestEnv {
        dispatcher: Arc<Dispatcher>,
        models: Arc<ModelRegistry>,
        coordinator: Arc<CancellationCoordinator>,
        db_path: std::path::PathBuf,
        _temp: TempDir,
    }

    async fn env_with_transport(transport: Option<Arc<dyn FilterTransport>>) -> TestEnv {
        let temp = TempDir::new().unwrap();
        let db_path = temp.path().join("skiff.db");
        Database::new(&db_path).unwrap();

        let config = Arc::new(GatewayConfig::default());
        let models = Arc::new(ModelRegistry::new());
        let filters = Arc::new(FilterRegistry::new());

        let pipeline = match transport {
            Some(transport) => Arc::new(FilterPipeline::new(transport)),
            None => Arc::new(FilterPipeline::http(config.filter_timeout)),
        };

        let tool_registry = Arc::new(ToolRegistry::new());
        tool_registry
            .register(Arc::new(CallAgentTool::new(config.agent_call_depth)))
            .await;

        let embedded = Arc::new(EmbeddedFunctionRegistry::new());
        embedded.register(Arc::new(HelloFunction));
        embedded.register(Arc::new(FlakyFunction));
        embedded.register(Arc::new(SlowFunction));
        embedded.register(Arc::new(EchoFunction));

        let custom_agents = Arc::new(CustomAgentRegistry::new());
        custom_agents.register(Arc::new(RelayAgent), Map::new());

        let workflows = Arc::new(WorkflowAgentRegistry::new());
        workflows.register(
            "echo-flow",
            WorkflowDefinition {
                nodes: vec![
                    WorkflowNode {
                        id: "start".to_string(),
                        kind: NodeKind::Start,
                    },
                    WorkflowNode {
                        id: "end".to_string(),
                        kind: NodeKind::End {
                            output: "start.message".to_string(),
                        },
                    },
                ],
                edges: vec![WorkflowEdge {
                    from: "start".to_string(),
                    to: "end".to_string(),
                }],
            },
            Map::new(),
        );

        for (id, backend) in [
            (
                "hello-model",
                BackendKind::Embedded {
                    function_id: "hello".to_string(),
                },
            ),
            (
                "flaky-model",
                BackendKind::Embedded {
                    function_id: "flaky".to_string(),
                },
            ),
            (
                "slow-model",
                BackendKind::Embedded {
                    function_id: "slow".to_string(),
                },
            ),
            (
                "echo-model",
                BackendKind::Embedded {
                    function_id: "echo".to_string(),
                },
            ),
            (
                "relay-model",
                BackendKind::CustomAgent {
                    agent_id: "relay-agent".to_string(),
                },
            ),
            (
                "flow-model",
                BackendKind::WorkflowAgent {
                    agent_id: "echo-flow".to_string(),
                },
            ),
            (
                "arena-model",
                BackendKind::Arena {
                    members: vec!["hello-model".to_string()],
                },
            ),
            (
                "ghost-model",
                BackendKind::Embedded {
                    function_id: "unregistered".to_string(),
                },
            ),
        ] {
            models.insert(ModelDescriptor::new(id, backend));
        }

        let coordinator = Arc::new(CancellationCoordinator::new());
        let dispatcher = Dispatcher::new(DispatcherServices {
            config,
            models: models.clone(),
            filters,
            pipeline,
            tool_adapter: ToolAdapter::new(tool_registry),
            embedded,
            custom_agents,
            workflows,
            workflow_completion: None,
            coordinator: coordinator.clone(),
            db_path: Arc::new(db_path.clone()),
        });

        TestEnv {
            dispatcher,
            models,
            coordinator,
            db_path,
            _temp: temp,
        }
    }

    async fn env() -> TestEnv {
        env_with_transport(None).await
    }

    fn request(model: &str, message: &str, chat_id: &str, message_id: &str) -> ChatRequest {
        ChatRequest {
            messages: vec![ChatMessage::user(message)],
            model: model.to_string(),
            stream: true,
            tool_ids: Vec::new(),
            user: UserIdentity::new("u1"),
            metadata: RequestMetadata {
                chat_id: chat_id.to_string(),
                message_id: message_id.to_string(),
            },
        }
    }

    fn turn(env: &TestEnv, chat_id: &str, message_id: &str) -> crate::storage::PersistedTurn {
        let db = Database::new(&env.db_path).unwrap();
        TurnStore::new(&db)
            .get(chat_id, message_id)
            .unwrap()
            .expect("turn not persisted")
    }

    fn assert_single_terminal(events: &[OutputEvent]) {
        let terminals = events.iter().filter(|e| e.is_terminal()).count();
        assert_eq!(terminals, 1, "expected exactly one terminal event");
        assert!(events.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_terminal_contract_holds_across_backend_kinds() {
        let env = env().await;

        for (model_id, expected) in [
            ("hello-model", "Hello world"),
            ("relay-model", "Hello world"),
            ("flow-model", "ping"),
        ] {
            let model = env.models.get(model_id).unwrap();
            let events = env
                .dispatcher
                .dispatch(request(model_id, "ping", "c", model_id), model)
                .collect()
                .await;

            assert_single_terminal(&events);
            match events.last().unwrap() {
                OutputEvent::Done {
                    finish: FinishKind::Complete,
                    content,
                } => assert_eq!(content, expected, "model {}", model_id),
                other => panic!("model {}: unexpected terminal {:?}", model_id, other),
            }
        }
    }

    #[tokio::test]
    async fn test_dropped_backend_persists_partials_with_error() {
        let env = env().await;
        let model = env.models.get("flaky-model").unwrap();

        let events = env
            .dispatcher
            .dispatch(request("flaky-model", "hi", "c1", "m1"), model)
            .collect()
            .await;

        assert_single_terminal(&events);
        match events.last().unwrap() {
            OutputEvent::Error { message } => {
                // Connection-class errors reach the caller generically.
                assert_eq!(message, "Connection to execution backend failed");
            }
            other => panic!("unexpected terminal {:?}", other),
        }

        let turn = turn(&env, "c1", "m1");
        assert_eq!(turn.content, "Hello world");
        assert_eq!(turn.status, TurnStatus::Error);
        assert!(turn.error.unwrap().contains("connection dropped"));
    }

    #[tokio::test]
    async fn test_cancellation_flushes_partials_before_teardown() {
        let env = env().await;
        let model = env.models.get("slow-model").unwrap();

        let mut stream = env
            .dispatcher
            .dispatch(request("slow-model", "hi", "c2", "m2"), model);

        // Wait for the first partial, then abort.
        let first = stream.next().await.unwrap();
        assert_eq!(
            first,
            OutputEvent::PartialContent {
                delta: "before-cancel".to_string()
            }
        );
        assert!(env
            .coordinator
            .cancel("c2", "m2", CancelReason::CallerAbort));

        let mut rest = Vec::new();
        while let Some(event) = stream.next().await {
            rest.push(event);
        }
        match rest.last().unwrap() {
            OutputEvent::Done {
                finish: FinishKind::Cancelled,
                content,
            } => assert_eq!(content, "before-cancel"),
            other => panic!("unexpected terminal {:?}", other),
        }

        let turn = turn(&env, "c2", "m2");
        assert_eq!(turn.status, TurnStatus::Cancelled);
        assert_eq!(turn.content, "before-cancel");
    }

    #[tokio::test]
    async fn test_concurrent_requests_do_not_cross_write() {
        let env = env().await;
        let model = env.models.get("hello-model").unwrap();

        let a = env
            .dispatcher
            .dispatch(request("hello-model", "a", "chat-a", "msg-a"), model.clone())
            .collect();
        let b = env
            .dispatcher
            .dispatch(request("hello-model", "b", "chat-b", "msg-b"), model)
            .collect();
        let (events_a, events_b) = tokio::join!(a, b);
        assert_single_terminal(&events_a);
        assert_single_terminal(&events_b);

        assert_eq!(turn(&env, "chat-a", "msg-a").content, "Hello world");
        assert_eq!(turn(&env, "chat-b", "msg-b").content, "Hello world");
    }

    #[tokio::test]
    async fn test_arena_resolves_member_and_reclassifies() {
        let env = env().await;
        let model = env.models.get("arena-model").unwrap();

        let events = env
            .dispatcher
            .dispatch(request("arena-model", "hi", "c3", "m3"), model)
            .collect()
            .await;

        match events.last().unwrap() {
            OutputEvent::Done { content, .. } => assert_eq!(content, "Hello world"),
            other => panic!("unexpected terminal {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unregistered_function_yields_error_turn() {
        let env = env().await;
        let model = env.models.get("ghost-model").unwrap();

        let events = env
            .dispatcher
            .dispatch(request("ghost-model", "hi", "c4", "m4"), model)
            .collect()
            .await;

        assert_single_terminal(&events);
        match events.last().unwrap() {
            OutputEvent::Error { message } => {
                assert!(message.contains("unregistered"));
            }
            other => panic!("unexpected terminal {:?}", other),
        }

        let turn = turn(&env, "c4", "m4");
        assert_eq!(turn.status, TurnStatus::Error);
    }

    #[tokio::test]
    async fn test_inlet_filter_transform_reaches_handler() {
        /// Rewrites the last user message.
        struct RewriteTransport;

        #[async_trait]
        impl FilterTransport for RewriteTransport {
            async fn call(
                &self,
                _filter: &FilterDescriptor,
                stage: FilterStage,
                payload: &Value,
            ) -> Result<Value, DispatchError> {
                let mut next = payload.clone();
                if stage == FilterStage::Inlet {
                    next["messages"][0]["content"] = json!("rewritten");
                }
                Ok(next)
            }
        }

        let env = env_with_transport(Some(Arc::new(RewriteTransport))).await;
        env.dispatcher.services.filters.insert(FilterDescriptor {
            id: "rewriter".to_string(),
            scope: FilterScope::Global,
            priority: 0,
            base_url: "http://filters".to_string(),
        });

        let model = env.models.get("echo-model").unwrap();
        let events = env
            .dispatcher
            .dispatch(request("echo-model", "original", "c5", "m5"), model)
            .collect()
            .await;

        match events.last().unwrap() {
            OutputEvent::Done { content, .. } => assert_eq!(content, "rewritten"),
            other => panic!("unexpected terminal {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_call_agent_reaches_other_agent() {
        let env = env().await;
        let model = env.models.get("relay-model").unwrap();

        let events = env
            .dispatcher
            .dispatch(request("relay-model", "hi", "c6", "m6"), model)
            .collect()
            .await;

        match events.last().unwrap() {
            // Relay calls hello-model and forwards its terminal content.
            OutputEvent::Done { content, .. } => assert_eq!(content, "Hello world"),
            other => panic!("unexpected terminal {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_call_agent_self_cycle_is_rejected() {
        let env = env().await;

        // Point the relay at its own model id.
        let mut valves = Map::new();
        valves.insert("target".to_string(), json!("relay-model"));
        // Re-register with the self-referential target valve.
        let custom_agents = &env.dispatcher.services.custom_agents;
        custom_agents.register(Arc::new(RelayAgent), valves);

        let model = env.models.get("relay-model").unwrap();
        let events = env
            .dispatcher
            .dispatch(request("relay-model", "hi", "c7", "m7"), model)
            .collect()
            .await;

        match events.last().unwrap() {
            OutputEvent::Done { content, .. } => {
                assert!(content.starts_with("ERR:"), "got: {}", content);
                assert!(content.contains("cycle"), "got: {}", content);
            }
            other => panic!("unexpected terminal {:?}", other),
        }
    }
}
