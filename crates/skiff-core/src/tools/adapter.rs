//! Permission-scoped tool adapter.
//!
//! The only path from an execution backend to a tool. Discovery is scoped
//! to what the invoking user may access, conversion produces the concrete
//! callable set a backend consumes, and invocation re-runs the same
//! permission check used for direct calls — there is no privilege
//! escalation through agent indirection.

use std::sync::Arc;

use serde_json::Value;

use super::{ToolDescriptor, ToolInvocation, ToolOutcome, ToolRegistry};
use crate::model::UserIdentity;

#[derive(Clone)]
pub struct ToolAdapter {
    registry: Arc<ToolRegistry>,
}

impl ToolAdapter {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    /// Descriptors for every tool the user may invoke.
    pub async fn list_available(&self, user: &UserIdentity) -> Vec<ToolDescriptor> {
        let mut descriptors = Vec::new();
        for tool in self.registry.tools.read().await.values() {
            if tool.access().permits(user) {
                descriptors.push(ToolDescriptor {
                    id: tool.id().to_string(),
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    input_schema: tool.input_schema(),
                });
            }
        }
        descriptors.sort_by(|a, b| a.id.cmp(&b.id));
        descriptors
    }

    /// Convert the requested tool selection into the calling convention
    /// backends expect: descriptors plus a proxy that routes every call
    /// back through [`ToolAdapter::invoke`].
    ///
    /// Unknown ids and tools the user may not access are skipped (logged),
    /// never silently substituted.
    pub async fn convert(
        &self,
        tool_ids: &[String],
        invocation: &ToolInvocation,
    ) -> Vec<BackendTool> {
        let mut converted = Vec::new();
        for id in tool_ids {
            let Some(tool) = self.registry.get(id).await else {
                tracing::warn!(tool = %id, "Requested tool not registered; skipping");
                continue;
            };
            if !tool.access().permits(&invocation.user) {
                tracing::warn!(
                    tool = %id,
                    user = %invocation.user.id,
                    "User lacks access to requested tool; skipping"
                );
                continue;
            }
            converted.push(BackendTool {
                descriptor: ToolDescriptor {
                    id: tool.id().to_string(),
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    input_schema: tool.input_schema(),
                },
                adapter: self.clone(),
                invocation: invocation.clone(),
            });
        }
        converted
    }

    /// Invoke a tool on behalf of a user. The permission check here is the
    /// single authorization point for both direct and agent-proxied calls.
    pub async fn invoke(&self, tool_id: &str, args: Value, inv: &ToolInvocation) -> ToolOutcome {
        let Some(tool) = self.registry.get(tool_id).await else {
            return ToolOutcome::error(format!("Unknown tool: {}", tool_id));
        };

        if !tool.access().permits(&inv.user) {
            tracing::info!(
                tool = %tool_id,
                user = %inv.user.id,
                "Tool invocation denied"
            );
            return ToolOutcome::error(format!(
                "Permission denied for tool '{}'",
                tool_id
            ));
        }

        self.registry
            .execute(tool_id, args, inv)
            .await
            .unwrap_or_else(|| ToolOutcome::error(format!("Unknown tool: {}", tool_id)))
    }
}

/// A tool converted into the backend calling convention: descriptor plus
/// an invoke proxy bound to the requesting user.
#[derive(Clone)]
pub struct BackendTool {
    pub descriptor: ToolDescriptor,
    adapter: ToolAdapter,
    invocation: ToolInvocation,
}

impl BackendTool {
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    /// Invoke through the adapter — same permission path as a direct call.
    pub async fn call(&self, args: Value) -> ToolOutcome {
        self.adapter
            .invoke(&self.descriptor.id, args, &self.invocation)
            .await
    }
}
