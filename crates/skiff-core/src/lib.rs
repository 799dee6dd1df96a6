//! Skiff core
//!
//! Chat completion dispatch and execution: a router that classifies each
//! request onto one of several execution strategies (embedded function,
//! custom agent, declarative workflow agent, remote completion server,
//! local runtime), runs inlet/outlet transformation filters around it,
//! streams incremental output through a normalizing bridge, and persists
//! partial results, errors, and cancellations consistently.
//!
//! The HTTP surface lives in `skiff-server`; this crate is
//! transport-agnostic.

pub mod bridge;
pub mod cancel;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod filters;
pub mod handlers;
pub mod model;
pub mod storage;
pub mod tools;

pub use cancel::{CancelReason, CancellationCoordinator, CancellationSignal};
pub use config::GatewayConfig;
pub use dispatch::{Dispatcher, DispatcherServices};
pub use error::DispatchError;
pub use events::{FinishKind, OutputEvent};
pub use model::{
    BackendKind, ChatMessage, ChatRequest, FilterDescriptor, FilterRegistry, FilterScope,
    MessageRole, ModelDescriptor, ModelLookup, ModelRegistry, RequestMetadata, UserIdentity,
    UserRole, Valves,
};
