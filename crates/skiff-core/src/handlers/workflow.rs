//! Workflow agent handler.
//!
//! Interprets a declarative node/edge workflow: start/tool/llm/end nodes
//! connected by directed edges forming a DAG, walked in topological order
//! with single-predecessor execution per node (a source may fan out, but
//! merges are rejected because no merge semantics are defined). Inputs are
//! mapped from prior node outputs by dotted-path references
//! (`nodeId.fieldName`); llm prompts substitute the same references via
//! `{{nodeId.fieldName}}` templates. Failure of any node halts the
//! workflow with the failing node id in the error.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::remote::NodeCompletion;
use super::{ExecutionContext, ExecutionHandler};
use crate::error::DispatchError;
use crate::events::OutputEvent;
use crate::model::ChatRequest;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub nodes: Vec<WorkflowNode>,
    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: String,
    #[serde(flatten)]
    pub kind: NodeKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Entry point; exposes the incoming user message as `start.message`.
    Start,
    /// Invokes a tool through the adapter. `inputs` maps argument names to
    /// dotted-path references into prior node outputs.
    Tool {
        tool_id: String,
        #[serde(default)]
        inputs: HashMap<String, String>,
    },
    /// Renders the prompt template and calls the language-model backend.
    /// Output is exposed as `<id>.text`.
    Llm { prompt: String },
    /// Resolves `output` and emits it as the final content.
    End { output: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEdge {
    pub from: String,
    pub to: String,
}

/// Registered workflow definitions plus their agent-scoped valves.
#[derive(Default)]
pub struct WorkflowAgentRegistry {
    entries: RwLock<HashMap<String, (WorkflowDefinition, Map<String, Value>)>>,
}

impl WorkflowAgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        agent_id: impl Into<String>,
        definition: WorkflowDefinition,
        valves: Map<String, Value>,
    ) {
        self.entries
            .write()
            .insert(agent_id.into(), (definition, valves));
    }

    pub fn get(&self, agent_id: &str) -> Option<(WorkflowDefinition, Map<String, Value>)> {
        self.entries.read().get(agent_id).cloned()
    }
}

pub struct WorkflowAgentHandler {
    definition: WorkflowDefinition,
    completion: Option<Arc<dyn NodeCompletion>>,
}

impl WorkflowAgentHandler {
    pub fn new(definition: WorkflowDefinition, completion: Option<Arc<dyn NodeCompletion>>) -> Self {
        Self {
            definition,
            completion,
        }
    }
}

#[async_trait]
impl ExecutionHandler for WorkflowAgentHandler {
    fn kind(&self) -> &'static str {
        "workflow_agent"
    }

    async fn execute(
        &self,
        request: &ChatRequest,
        ctx: &ExecutionContext,
    ) -> Result<(), DispatchError> {
        let order = topological_order(&self.definition)
            .map_err(|e| DispatchError::handler(format!("Invalid workflow: {}", e)))?;

        let mut outputs: HashMap<String, Value> = HashMap::new();

        for index in order {
            let node = &self.definition.nodes[index];

            // Cancellation is observed between workflow nodes.
            if let Some(reason) = ctx.signal.reason() {
                return Err(DispatchError::Cancelled(reason));
            }

            match &node.kind {
                NodeKind::Start => {
                    outputs.insert(
                        node.id.clone(),
                        json!({ "message": request.last_user_message().unwrap_or_default() }),
                    );
                }

                NodeKind::Tool { tool_id, inputs } => {
                    let mut args = Map::new();
                    let mut params: Vec<_> = inputs.iter().collect();
                    params.sort_by(|a, b| a.0.cmp(b.0));
                    for (param, reference) in params {
                        let value = resolve_ref(&outputs, reference).ok_or_else(|| {
                            node_error(
                                &node.id,
                                format!("unresolved input reference '{}'", reference),
                            )
                        })?;
                        args.insert(param.clone(), value);
                    }

                    let tool = ctx.tool(tool_id).ok_or_else(|| {
                        node_error(&node.id, format!("tool '{}' not available", tool_id))
                    })?;

                    let call_id = uuid::Uuid::new_v4().to_string();
                    ctx.emit(OutputEvent::ToolCallRequested {
                        id: call_id.clone(),
                        name: tool_id.clone(),
                        arguments: Value::Object(args.clone()),
                    })
                    .await?;

                    let outcome = tool.call(Value::Object(args)).await;
                    ctx.emit(OutputEvent::ToolCallResult {
                        id: call_id,
                        output: outcome.output.clone(),
                        is_error: outcome.is_error,
                    })
                    .await?;

                    if outcome.is_error {
                        return Err(node_error(&node.id, value_to_text(&outcome.output)));
                    }
                    outputs.insert(node.id.clone(), normalize_output(outcome.output));
                }

                NodeKind::Llm { prompt } => {
                    let rendered = render_template(prompt, &outputs).map_err(|reference| {
                        node_error(&node.id, format!("unresolved reference '{}'", reference))
                    })?;

                    let completion = self.completion.as_ref().ok_or_else(|| {
                        node_error(&node.id, "no completion backend configured".to_string())
                    })?;

                    let text = match completion.complete(&rendered).await {
                        Ok(text) => text,
                        Err(DispatchError::Cancelled(reason)) => {
                            return Err(DispatchError::Cancelled(reason))
                        }
                        Err(e) => return Err(node_error(&node.id, e.to_string())),
                    };
                    outputs.insert(node.id.clone(), json!({ "text": text }));
                }

                NodeKind::End { output } => {
                    let value = resolve_ref(&outputs, output).ok_or_else(|| {
                        node_error(&node.id, format!("unresolved output reference '{}'", output))
                    })?;
                    ctx.emit(OutputEvent::PartialContent {
                        delta: value_to_text(&value),
                    })
                    .await?;
                }
            }

            ctx.emit(OutputEvent::status(format!("Node '{}' completed", node.id)))
                .await?;
        }

        Ok(())
    }
}

fn node_error(node_id: &str, reason: String) -> DispatchError {
    DispatchError::handler(format!("Workflow halted at node '{}': {}", node_id, reason))
}

/// Kahn's algorithm with definition-order tie-breaking. Rejects unknown
/// edge endpoints, nodes with more than one predecessor, and cycles.
fn topological_order(definition: &WorkflowDefinition) -> Result<Vec<usize>, String> {
    let mut index_of: HashMap<&str, usize> = HashMap::new();
    for (i, node) in definition.nodes.iter().enumerate() {
        if index_of.insert(node.id.as_str(), i).is_some() {
            return Err(format!("duplicate node id '{}'", node.id));
        }
    }

    let n = definition.nodes.len();
    let mut in_degree = vec![0usize; n];
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];

    for edge in &definition.edges {
        let from = *index_of
            .get(edge.from.as_str())
            .ok_or_else(|| format!("edge references unknown node '{}'", edge.from))?;
        let to = *index_of
            .get(edge.to.as_str())
            .ok_or_else(|| format!("edge references unknown node '{}'", edge.to))?;
        successors[from].push(to);
        in_degree[to] += 1;
        if in_degree[to] > 1 {
            return Err(format!(
                "node '{}' has multiple predecessors; merge semantics are not defined",
                edge.to
            ));
        }
    }

    let mut ready: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);

    while let Some(&next) = ready.first() {
        ready.remove(0);
        order.push(next);
        for &succ in &successors[next] {
            in_degree[succ] -= 1;
            if in_degree[succ] == 0 {
                // Keep definition order among simultaneously-ready nodes.
                let pos = ready
                    .iter()
                    .position(|&r| r > succ)
                    .unwrap_or(ready.len());
                ready.insert(pos, succ);
            }
        }
    }

    if order.len() != n {
        return Err("workflow contains a cycle".to_string());
    }
    Ok(order)
}

/// Resolve a `nodeId.fieldName` reference against accumulated outputs.
fn resolve_ref(outputs: &HashMap<String, Value>, reference: &str) -> Option<Value> {
    let (node_id, field) = reference.split_once('.')?;
    outputs.get(node_id)?.get(field).cloned()
}

/// Replace every `{{nodeId.fieldName}}` occurrence. Returns the first
/// unresolved reference on failure.
fn render_template(template: &str, outputs: &HashMap<String, Value>) -> Result<String, String> {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        rendered.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            rendered.push_str(&rest[start..]);
            return Ok(rendered);
        };
        let reference = after[..end].trim();
        let value =
            resolve_ref(outputs, reference).ok_or_else(|| reference.to_string())?;
        rendered.push_str(&value_to_text(&value));
        rest = &after[end + 2..];
    }
    rendered.push_str(rest);
    Ok(rendered)
}

/// Node outputs are objects so dotted references have fields to point at;
/// scalar tool results are wrapped under `result`.
fn normalize_output(value: Value) -> Value {
    match value {
        Value::Object(_) => value,
        other => json!({ "result": other }),
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::bridge;
    use crate::cancel::CancellationSignal;
    use crate::model::{ChatMessage, RequestMetadata, UserIdentity, Valves};
    use crate::tools::{
        Tool, ToolAccess, ToolAdapter, ToolInvocation, ToolOutcome, ToolRegistry,
    };

    struct UppercaseTool;

    #[async_trait]
    impl Tool for UppercaseTool {
        fn id(&self) -> &str {
            "uppercase"
        }
        fn name(&self) -> &str {
            "Uppercase"
        }
        fn description(&self) -> &str {
            "Uppercases the 'text' argument"
        }
        fn input_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn invoke(&self, args: Value, _inv: &ToolInvocation) -> ToolOutcome {
            match args.get("text").and_then(Value::as_str) {
                Some(text) => ToolOutcome::success(json!({ "value": text.to_uppercase() })),
                None => ToolOutcome::error("missing 'text'"),
            }
        }
    }

    struct BrokenTool;

    #[async_trait]
    impl Tool for BrokenTool {
        fn id(&self) -> &str {
            "broken"
        }
        fn name(&self) -> &str {
            "Broken"
        }
        fn description(&self) -> &str {
            "Always fails"
        }
        fn input_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        fn access(&self) -> ToolAccess {
            ToolAccess::Public
        }
        async fn invoke(&self, _args: Value, _inv: &ToolInvocation) -> ToolOutcome {
            ToolOutcome::error("tool exploded")
        }
    }

    struct RecordingCompletion {
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NodeCompletion for RecordingCompletion {
        async fn complete(&self, prompt: &str) -> Result<String, DispatchError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok(format!("LLM({})", prompt))
        }
    }

    async fn tools_for(user_tools: &[&str]) -> Vec<crate::tools::BackendTool> {
        let registry = std::sync::Arc::new(ToolRegistry::new());
        registry.register(std::sync::Arc::new(UppercaseTool)).await;
        registry.register(std::sync::Arc::new(BrokenTool)).await;
        let adapter = ToolAdapter::new(registry);
        let inv = ToolInvocation::for_user(UserIdentity::new("u1"));
        let ids: Vec<String> = user_tools.iter().map(|s| s.to_string()).collect();
        adapter.convert(&ids, &inv).await
    }

    fn context(sink: bridge::EventSink, tools: Vec<crate::tools::BackendTool>) -> ExecutionContext {
        ExecutionContext {
            user: UserIdentity::new("u1"),
            metadata: RequestMetadata {
                chat_id: "c1".to_string(),
                message_id: "m1".to_string(),
            },
            tools,
            valves: Valves::default(),
            signal: CancellationSignal::never(),
            sink,
            agent_chain: vec!["wf".to_string()],
        }
    }

    fn request(message: &str) -> ChatRequest {
        ChatRequest {
            messages: vec![ChatMessage::user(message)],
            model: "wf".to_string(),
            stream: true,
            tool_ids: vec!["uppercase".to_string(), "broken".to_string()],
            user: UserIdentity::new("u1"),
            metadata: RequestMetadata {
                chat_id: "c1".to_string(),
                message_id: "m1".to_string(),
            },
        }
    }

    fn linear_workflow(tool_id: &str) -> WorkflowDefinition {
        WorkflowDefinition {
            nodes: vec![
                WorkflowNode {
                    id: "start".to_string(),
                    kind: NodeKind::Start,
                },
                WorkflowNode {
                    id: "tool".to_string(),
                    kind: NodeKind::Tool {
                        tool_id: tool_id.to_string(),
                        inputs: HashMap::from([(
                            "text".to_string(),
                            "start.message".to_string(),
                        )]),
                    },
                },
                WorkflowNode {
                    id: "llm".to_string(),
                    kind: NodeKind::Llm {
                        prompt: "Summarize: {{tool.value}}".to_string(),
                    },
                },
                WorkflowNode {
                    id: "end".to_string(),
                    kind: NodeKind::End {
                        output: "llm.text".to_string(),
                    },
                },
            ],
            edges: vec![
                WorkflowEdge {
                    from: "start".to_string(),
                    to: "tool".to_string(),
                },
                WorkflowEdge {
                    from: "tool".to_string(),
                    to: "llm".to_string(),
                },
                WorkflowEdge {
                    from: "llm".to_string(),
                    to: "end".to_string(),
                },
            ],
        }
    }

    #[tokio::test]
    async fn test_linear_workflow_runs_in_topological_order() {
        let completion = std::sync::Arc::new(RecordingCompletion {
            prompts: Mutex::new(Vec::new()),
        });
        let handler =
            WorkflowAgentHandler::new(linear_workflow("uppercase"), Some(completion.clone()));

        let tools = tools_for(&["uppercase"]).await;
        let (sink, stream) = bridge::channel(32);
        let ctx = context(sink.clone(), tools);

        handler.execute(&request("hello"), &ctx).await.unwrap();
        sink.finish().await;

        // Tool saw the start message; llm saw the tool output.
        assert_eq!(
            *completion.prompts.lock().unwrap(),
            vec!["Summarize: HELLO".to_string()]
        );

        let events = stream.collect().await;
        let final_content: String = events
            .iter()
            .filter_map(|e| match e {
                OutputEvent::PartialContent { delta } => Some(delta.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(final_content, "LLM(Summarize: HELLO)");

        // Node completion statuses arrive in topological order.
        let statuses: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                OutputEvent::StatusUpdate { status } => Some(status.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(
            statuses,
            vec![
                "Node 'start' completed",
                "Node 'tool' completed",
                "Node 'llm' completed",
                "Node 'end' completed",
            ]
        );
    }

    #[tokio::test]
    async fn test_tool_failure_halts_before_llm_and_end() {
        let completion = std::sync::Arc::new(RecordingCompletion {
            prompts: Mutex::new(Vec::new()),
        });
        let handler =
            WorkflowAgentHandler::new(linear_workflow("broken"), Some(completion.clone()));

        let tools = tools_for(&["broken"]).await;
        let (sink, stream) = bridge::channel(32);
        let ctx = context(sink.clone(), tools);

        let err = handler.execute(&request("hello"), &ctx).await.unwrap_err();
        sink.finish().await;

        // The failing node id is in the error.
        let message = err.to_string();
        assert!(message.contains("node 'tool'"), "got: {}", message);

        // llm never ran, end never emitted content.
        assert!(completion.prompts.lock().unwrap().is_empty());
        let events = stream.collect().await;
        assert!(!events
            .iter()
            .any(|e| matches!(e, OutputEvent::PartialContent { .. })));
    }

    #[test]
    fn test_multiple_predecessors_rejected() {
        let definition = WorkflowDefinition {
            nodes: vec![
                WorkflowNode {
                    id: "a".to_string(),
                    kind: NodeKind::Start,
                },
                WorkflowNode {
                    id: "b".to_string(),
                    kind: NodeKind::Llm {
                        prompt: "x".to_string(),
                    },
                },
                WorkflowNode {
                    id: "c".to_string(),
                    kind: NodeKind::End {
                        output: "b.text".to_string(),
                    },
                },
            ],
            edges: vec![
                WorkflowEdge {
                    from: "a".to_string(),
                    to: "c".to_string(),
                },
                WorkflowEdge {
                    from: "b".to_string(),
                    to: "c".to_string(),
                },
            ],
        };

        let err = topological_order(&definition).unwrap_err();
        assert!(err.contains("multiple predecessors"));
    }

    #[test]
    fn test_cycle_rejected() {
        let definition = WorkflowDefinition {
            nodes: vec![
                WorkflowNode {
                    id: "a".to_string(),
                    kind: NodeKind::Llm {
                        prompt: "x".to_string(),
                    },
                },
                WorkflowNode {
                    id: "b".to_string(),
                    kind: NodeKind::Llm {
                        prompt: "y".to_string(),
                    },
                },
            ],
            edges: vec![
                WorkflowEdge {
                    from: "a".to_string(),
                    to: "b".to_string(),
                },
                WorkflowEdge {
                    from: "b".to_string(),
                    to: "a".to_string(),
                },
            ],
        };

        let err = topological_order(&definition).unwrap_err();
        assert!(err.contains("cycle"));
    }

    #[test]
    fn test_template_rendering_and_refs() {
        let outputs = HashMap::from([
            ("start".to_string(), json!({ "message": "hi" })),
            ("tool".to_string(), json!({ "value": 42 })),
        ]);

        assert_eq!(
            render_template("say {{start.message}} ({{ tool.value }})", &outputs).unwrap(),
            "say hi (42)"
        );
        assert_eq!(
            render_template("plain text", &outputs).unwrap(),
            "plain text"
        );
        assert_eq!(
            render_template("{{missing.ref}}", &outputs).unwrap_err(),
            "missing.ref"
        );
        assert!(resolve_ref(&outputs, "start.message").is_some());
        assert!(resolve_ref(&outputs, "start").is_none());
        assert!(resolve_ref(&outputs, "start.other").is_none());
    }
}
