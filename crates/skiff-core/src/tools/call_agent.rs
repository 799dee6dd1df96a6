//! Built-in `call_agent` tool.
//!
//! Lets an agent dispatch a message to another agent and use its terminal
//! output as the tool result. Recursion is bounded two ways: a configurable
//! depth limit on the call chain, and outright rejection of any agent id
//! already present in the chain (cycles fail fast instead of walking the
//! chain to the depth limit).

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{Tool, ToolAccess, ToolInvocation, ToolOutcome};
use crate::error::DispatchError;
use crate::model::UserIdentity;

pub const CALL_AGENT_TOOL_ID: &str = "call_agent";

/// Router seam for nested agent dispatch. Implemented by the dispatcher;
/// a trait here so the tool layer never depends on the router module.
#[async_trait]
pub trait AgentDispatch: Send + Sync {
    /// Dispatch a single-message request to `agent_id` on behalf of `user`
    /// and return the terminal text output. `chain` is the already-active
    /// agent call chain including the caller.
    async fn dispatch_agent(
        &self,
        agent_id: &str,
        message: &str,
        user: &UserIdentity,
        chain: &[String],
    ) -> Result<String, DispatchError>;
}

#[derive(Deserialize)]
struct CallAgentArgs {
    agent_id: String,
    message: String,
}

pub struct CallAgentTool {
    depth_limit: usize,
}

impl CallAgentTool {
    pub fn new(depth_limit: usize) -> Self {
        Self { depth_limit }
    }
}

#[async_trait]
impl Tool for CallAgentTool {
    fn id(&self) -> &str {
        CALL_AGENT_TOOL_ID
    }

    fn name(&self) -> &str {
        "Call agent"
    }

    fn description(&self) -> &str {
        "Send a message to another agent and return its final response"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "agent_id": { "type": "string", "description": "Target agent id" },
                "message": { "type": "string", "description": "Message for the target agent" }
            },
            "required": ["agent_id", "message"]
        })
    }

    fn access(&self) -> ToolAccess {
        ToolAccess::Public
    }

    async fn invoke(&self, args: Value, inv: &ToolInvocation) -> ToolOutcome {
        let args: CallAgentArgs = match serde_json::from_value(args) {
            Ok(args) => args,
            Err(e) => return ToolOutcome::error(format!("Invalid arguments: {}", e)),
        };

        if inv.agent_chain.iter().any(|id| id == &args.agent_id) {
            return ToolOutcome::error(format!(
                "Refusing agent call cycle: '{}' is already executing (chain: {})",
                args.agent_id,
                inv.agent_chain.join(" -> ")
            ));
        }

        if inv.agent_chain.len() >= self.depth_limit {
            return ToolOutcome::error(format!(
                "Agent call depth limit ({}) exceeded",
                self.depth_limit
            ));
        }

        let Some(dispatch) = inv.dispatch.as_ref() else {
            return ToolOutcome::error("Agent dispatch is not available in this context");
        };

        match dispatch
            .dispatch_agent(&args.agent_id, &args.message, &inv.user, &inv.agent_chain)
            .await
        {
            Ok(output) => ToolOutcome::success(Value::String(output)),
            Err(e) => ToolOutcome::error(format!(
                "Agent '{}' failed: {}",
                args.agent_id, e
            )),
        }
    }
}
