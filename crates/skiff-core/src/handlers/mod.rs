//! Execution handlers.
//!
//! One handler per backend kind, all behind the same contract: the router
//! resolves a `BackendKind` to exactly one handler instance per request,
//! hands it the `ExecutionContext`, and consumes the event sequence it
//! produces through the streaming bridge. Handlers emit progress events
//! only — the router owns terminal events, so every request ends with
//! exactly one of completed/error/cancelled regardless of backend.

pub mod custom_agent;
pub mod embedded;
pub mod local;
pub mod remote;
pub mod workflow;

use async_trait::async_trait;

use crate::bridge::EventSink;
use crate::cancel::{CancelReason, CancellationSignal};
use crate::error::DispatchError;
use crate::events::OutputEvent;
use crate::model::{ChatRequest, RequestMetadata, UserIdentity, Valves};
use crate::tools::BackendTool;

pub use custom_agent::{BlockingUnitAgent, CustomAgent, CustomAgentHandler, CustomAgentRegistry};
pub use embedded::{EmbeddedFunction, EmbeddedFunctionHandler, EmbeddedFunctionRegistry};
pub use local::LocalRuntimeHandler;
pub use remote::{CompletionClient, NodeCompletion, RemoteServerHandler};
pub use workflow::{
    WorkflowAgentHandler, WorkflowAgentRegistry, WorkflowDefinition, WorkflowEdge, WorkflowNode,
};

/// Per-request bundle the router constructs and hands to exactly one
/// handler. Exclusively owned by that handler invocation.
pub struct ExecutionContext {
    pub user: UserIdentity,
    pub metadata: RequestMetadata,
    /// Tools resolved and permission-scoped for this user.
    pub tools: Vec<BackendTool>,
    /// Agent- and user-scoped configuration values.
    pub valves: Valves,
    pub signal: CancellationSignal,
    pub sink: EventSink,
    /// Active agent call chain (innermost last), for recursion guarding.
    pub agent_chain: Vec<String>,
}

impl ExecutionContext {
    pub fn tool(&self, id: &str) -> Option<&BackendTool> {
        self.tools.iter().find(|t| t.id() == id)
    }

    /// Emit one event, honoring cancellation and consumer liveness. The
    /// error return is how cooperative cancellation reaches handler code:
    /// `ctx.emit(...).await?` at every natural suspension point.
    pub async fn emit(&self, event: OutputEvent) -> Result<(), DispatchError> {
        if let Some(reason) = self.signal.reason() {
            return Err(DispatchError::Cancelled(reason));
        }
        if self.sink.send(event).await {
            Ok(())
        } else {
            // Consumer went away; nothing downstream will ever observe
            // more output.
            Err(DispatchError::Cancelled(CancelReason::CallerAbort))
        }
    }
}

/// Common contract for all execution strategies.
///
/// `execute` pushes progress events into the context sink and returns when
/// generation ends. Not restartable; finite unless the backend streams
/// indefinitely or the caller cancels.
#[async_trait]
pub trait ExecutionHandler: Send + Sync {
    /// Stable name for logging.
    fn kind(&self) -> &'static str;

    async fn execute(
        &self,
        request: &ChatRequest,
        ctx: &ExecutionContext,
    ) -> Result<(), DispatchError>;
}

/// Per-invocation lifecycle: `Idle → Running → Streaming* → terminal`.
/// Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Idle,
    Running,
    Streaming,
    Completed,
    Error,
    Cancelled,
}

impl HandlerState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            HandlerState::Completed | HandlerState::Error | HandlerState::Cancelled
        )
    }

    /// Transition on a produced event. Transitions out of a terminal state
    /// are ignored.
    pub fn observe(&mut self, event: &OutputEvent) {
        if self.is_terminal() {
            return;
        }
        *self = match event {
            OutputEvent::PartialContent { .. } => HandlerState::Streaming,
            OutputEvent::Error { .. } => HandlerState::Error,
            OutputEvent::Done { finish, .. } => match finish {
                crate::events::FinishKind::Complete => HandlerState::Completed,
                crate::events::FinishKind::Cancelled => HandlerState::Cancelled,
            },
            _ => *self,
        };
    }

    pub fn begin(&mut self) {
        if *self == HandlerState::Idle {
            *self = HandlerState::Running;
        }
    }
}
