//! Callable tools.
//!
//! Tools are registered once and exposed to execution backends through the
//! permission-scoped adapter in [`adapter`]. The registry itself does no
//! permission checking; every invocation path goes through the adapter so
//! agent-initiated calls face exactly the same authorization as direct
//! user calls.

pub mod adapter;
pub mod call_agent;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::model::{UserIdentity, UserRole};

pub use adapter::{BackendTool, ToolAdapter};
pub use call_agent::{AgentDispatch, CallAgentTool, CALL_AGENT_TOOL_ID};

/// Default tool execution timeout (2 minutes)
const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// Who may invoke a tool.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolAccess {
    /// Every authenticated user.
    Public,
    /// Only the listed user ids (admins always pass).
    Restricted(Vec<String>),
}

impl ToolAccess {
    pub fn permits(&self, user: &UserIdentity) -> bool {
        if user.role == UserRole::Admin {
            return true;
        }
        match self {
            ToolAccess::Public => true,
            ToolAccess::Restricted(ids) => ids.contains(&user.id),
        }
    }
}

/// Static description of one callable tool.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Tool invocation result.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub output: Value,
    pub is_error: bool,
}

impl ToolOutcome {
    pub fn success(output: Value) -> Self {
        Self {
            output,
            is_error: false,
        }
    }

    pub fn error(msg: impl std::fmt::Display) -> Self {
        Self {
            output: Value::String(msg.to_string()),
            is_error: true,
        }
    }
}

/// Per-call context threaded into tool implementations.
#[derive(Clone)]
pub struct ToolInvocation {
    pub user: UserIdentity,
    /// Active agent→agent call chain, outermost first. Used by the
    /// `call_agent` tool to bound recursion and reject cycles.
    pub agent_chain: Vec<String>,
    /// Router-provided nested dispatch seam, when agents are reachable.
    pub dispatch: Option<Arc<dyn AgentDispatch>>,
    /// Optional per-call timeout override.
    pub timeout: Option<Duration>,
}

impl ToolInvocation {
    pub fn for_user(user: UserIdentity) -> Self {
        Self {
            user,
            agent_chain: Vec::new(),
            dispatch: None,
            timeout: None,
        }
    }
}

/// Trait for tool implementations
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool id (unique, stable)
    fn id(&self) -> &str;

    /// Display name
    fn name(&self) -> &str;

    /// Tool description for backends
    fn description(&self) -> &str;

    /// JSON schema for arguments
    fn input_schema(&self) -> Value;

    /// Authorization scope
    fn access(&self) -> ToolAccess {
        ToolAccess::Public
    }

    /// Execute the tool
    async fn invoke(&self, args: Value, inv: &ToolInvocation) -> ToolOutcome;
}

/// Registry for managing tools.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    default_timeout: Duration,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            default_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let id = tool.id().to_string();
        self.tools.write().await.insert(id, tool);
    }

    pub async fn get(&self, id: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(id).cloned()
    }

    /// Execute a tool by id with timeout. `None` when the tool is unknown.
    pub async fn execute(
        &self,
        id: &str,
        args: Value,
        inv: &ToolInvocation,
    ) -> Option<ToolOutcome> {
        let tool = self.get(id).await?;
        let timeout = inv.timeout.unwrap_or(self.default_timeout);

        let outcome = match tokio::time::timeout(timeout, tool.invoke(args, inv)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(
                    tool = id,
                    timeout_secs = timeout.as_secs(),
                    "Tool execution timed out"
                );
                ToolOutcome::error(format!(
                    "Tool '{}' timed out after {} seconds",
                    id,
                    timeout.as_secs()
                ))
            }
        };

        Some(outcome)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::EchoTool;
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_registry_unknown_tool_returns_none() {
        let registry = ToolRegistry::new();
        let inv = ToolInvocation::for_user(UserIdentity::new("u1"));

        let result = registry.execute("missing", json!({}), &inv).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_registry_executes_registered_tool() {
        let registry = ToolRegistry::new();
        registry
            .register(Arc::new(EchoTool {
                access: ToolAccess::Public,
            }))
            .await;

        let inv = ToolInvocation::for_user(UserIdentity::new("u1"));
        let outcome = registry
            .execute("echo", json!({"q": 1}), &inv)
            .await
            .unwrap();
        assert!(!outcome.is_error);
        assert_eq!(outcome.output, json!({"q": 1}));
    }

    #[tokio::test]
    async fn test_timeout_produces_error_outcome() {
        struct SlowTool;

        #[async_trait]
        impl Tool for SlowTool {
            fn id(&self) -> &str {
                "slow"
            }
            fn name(&self) -> &str {
                "Slow"
            }
            fn description(&self) -> &str {
                "Sleeps"
            }
            fn input_schema(&self) -> Value {
                json!({ "type": "object" })
            }
            async fn invoke(&self, _args: Value, _inv: &ToolInvocation) -> ToolOutcome {
                tokio::time::sleep(Duration::from_secs(60)).await;
                ToolOutcome::success(json!(null))
            }
        }

        let registry = ToolRegistry::new();
        registry.register(Arc::new(SlowTool)).await;

        let mut inv = ToolInvocation::for_user(UserIdentity::new("u1"));
        inv.timeout = Some(Duration::from_millis(20));

        let outcome = registry.execute("slow", json!({}), &inv).await.unwrap();
        assert!(outcome.is_error);
        assert!(outcome.output.as_str().unwrap().contains("timed out"));
    }

    #[test]
    fn test_admin_bypasses_restriction() {
        let access = ToolAccess::Restricted(vec!["alice".to_string()]);
        assert!(access.permits(&UserIdentity::new("alice")));
        assert!(!access.permits(&UserIdentity::new("bob")));
        assert!(access.permits(&UserIdentity::admin("root")));
    }
}
