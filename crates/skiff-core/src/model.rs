//! Request, routing, and filter metadata types.
//!
//! `ChatRequest` is owned by the caller; the core only reads it (filters
//! replace it wholesale rather than mutating in place). `ModelDescriptor`
//! and `FilterDescriptor` come from the external registries and are
//! read-only for the lifetime of a request.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Message role in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Who is asking. Authentication happens upstream; the core only consumes
/// the already-established identity for permission scoping and header
/// forwarding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserIdentity {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub role: UserRole,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    #[default]
    User,
}

impl UserIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            role: UserRole::User,
        }
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            role: UserRole::Admin,
        }
    }
}

/// Persistence identity of the turn being generated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestMetadata {
    pub chat_id: String,
    pub message_id: String,
}

/// An authenticated, already-validated chat request. Immutable input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub tool_ids: Vec<String>,
    pub user: UserIdentity,
    pub metadata: RequestMetadata,
}

impl ChatRequest {
    /// Content of the most recent user message, if any. Handlers that take
    /// a single prompt (workflow start node, nested agent calls) use this.
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.as_str())
    }
}

/// Which execution strategy serves a model. Closed set: adding a backend
/// kind means adding a variant and a handler, not editing a conditional
/// chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendKind {
    /// In-process extension function, same concurrency domain as the router.
    Embedded { function_id: String },
    /// User-authored execution unit with a single async entry point.
    CustomAgent { agent_id: String },
    /// Declarative node/edge workflow interpreted by the gateway.
    WorkflowAgent { agent_id: String },
    /// Grouped selection set; resolved to one concrete member at dispatch.
    Arena { members: Vec<String> },
    /// Local model runtime speaking its native NDJSON streaming contract.
    LocalRuntime { base_url: String },
    /// OpenAI-compatible remote completion server.
    RemoteServer {
        base_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key_ref: Option<String>,
    },
}

/// Resolved routing metadata for one model. Produced by the external model
/// registry; read-only to the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub name: String,
    pub backend: BackendKind,
    /// Filters bound to this model in addition to global-scope ones.
    #[serde(default)]
    pub filter_ids: Vec<String>,
    /// Per-model default parameters merged into outgoing backend payloads.
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub priority: i32,
}

impl ModelDescriptor {
    pub fn new(id: impl Into<String>, backend: BackendKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            backend,
            filter_ids: Vec::new(),
            params: Map::new(),
            priority: 0,
        }
    }
}

/// Which models a filter applies to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "scope", rename_all = "snake_case", content = "models")]
pub enum FilterScope {
    Global,
    Models(Vec<String>),
}

/// One external transformation filter. Immutable per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterDescriptor {
    pub id: String,
    pub scope: FilterScope,
    /// Lower runs first; ties broken by id. Deterministic.
    pub priority: i32,
    pub base_url: String,
}

impl FilterDescriptor {
    pub fn applies_to(&self, model: &ModelDescriptor) -> bool {
        match &self.scope {
            FilterScope::Global => true,
            FilterScope::Models(ids) => {
                ids.contains(&model.id) || model.filter_ids.contains(&self.id)
            }
        }
    }
}

/// Agent- and user-scoped configuration values handed to custom and
/// workflow agents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Valves {
    #[serde(default)]
    pub agent: Map<String, Value>,
    #[serde(default)]
    pub user: Map<String, Value>,
}

// ── Registries ─────────────────────────────────────────────────────────
//
// CRUD for models and filters lives outside the core; these in-memory
// registries are the read-side the router resolves against.

/// Lookup seam the router uses to resolve arena members and nested agent
/// calls.
pub trait ModelLookup: Send + Sync {
    fn get(&self, id: &str) -> Option<ModelDescriptor>;
}

#[derive(Default)]
pub struct ModelRegistry {
    models: RwLock<HashMap<String, ModelDescriptor>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, descriptor: ModelDescriptor) {
        self.models.write().insert(descriptor.id.clone(), descriptor);
    }

    pub fn get(&self, id: &str) -> Option<ModelDescriptor> {
        self.models.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<ModelDescriptor> {
        let mut models: Vec<_> = self.models.read().values().cloned().collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }
}

impl ModelLookup for ModelRegistry {
    fn get(&self, id: &str) -> Option<ModelDescriptor> {
        ModelRegistry::get(self, id)
    }
}

#[derive(Default)]
pub struct FilterRegistry {
    filters: RwLock<HashMap<String, FilterDescriptor>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, descriptor: FilterDescriptor) {
        self.filters
            .write()
            .insert(descriptor.id.clone(), descriptor);
    }

    /// All filters applicable to a model. Unordered; the pipeline sorts
    /// deterministically at call time.
    pub fn for_model(&self, model: &ModelDescriptor) -> Vec<FilterDescriptor> {
        self.filters
            .read()
            .values()
            .filter(|f| f.applies_to(model))
            .cloned()
            .collect()
    }
}
