//! Request and response types for the API

use serde::{Deserialize, Serialize};

use skiff_core::{
    BackendKind, ChatMessage, ChatRequest, MessageRole, ModelDescriptor, RequestMetadata,
    UserIdentity,
};

use crate::error::AppError;

// ============================================================================
// Completion Types
// ============================================================================

#[derive(Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<WireMessage>,
    pub model: String,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub tool_ids: Vec<String>,
    /// Persistence identity. Ids are generated when absent so a one-shot
    /// caller still gets a durable turn record.
    #[serde(default)]
    pub metadata: Option<WireMetadata>,
}

#[derive(Deserialize)]
pub struct WireMessage {
    pub role: String,
    pub content: String,
}

#[derive(Deserialize, Default)]
pub struct WireMetadata {
    pub chat_id: Option<String>,
    pub message_id: Option<String>,
}

impl CompletionRequest {
    pub fn into_core(self, user: UserIdentity) -> Result<ChatRequest, AppError> {
        let mut messages = Vec::with_capacity(self.messages.len());
        for message in self.messages {
            let role = match message.role.as_str() {
                "system" => MessageRole::System,
                "user" => MessageRole::User,
                "assistant" => MessageRole::Assistant,
                other => {
                    return Err(AppError::BadRequest(format!(
                        "Unknown message role '{}'",
                        other
                    )))
                }
            };
            messages.push(ChatMessage {
                role,
                content: message.content,
            });
        }

        let metadata = self.metadata.unwrap_or_default();
        let metadata = RequestMetadata {
            chat_id: metadata
                .chat_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            message_id: metadata
                .message_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        };

        Ok(ChatRequest {
            messages,
            model: self.model,
            stream: self.stream,
            tool_ids: self.tool_ids,
            user,
            metadata,
        })
    }
}

#[derive(Serialize)]
pub struct CompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
}

#[derive(Serialize)]
pub struct CompletionChoice {
    pub index: usize,
    pub message: CompletionMessage,
    pub finish_reason: String,
}

#[derive(Serialize)]
pub struct CompletionMessage {
    pub role: &'static str,
    pub content: String,
}

impl CompletionResponse {
    pub fn assistant(message_id: &str, model: &str, content: String, finish: &str) -> Self {
        Self {
            id: message_id.to_string(),
            object: "chat.completion",
            model: model.to_string(),
            choices: vec![CompletionChoice {
                index: 0,
                message: CompletionMessage {
                    role: "assistant",
                    content,
                },
                finish_reason: finish.to_string(),
            }],
        }
    }
}

#[derive(Serialize)]
pub struct AbortResponse {
    pub cancelled: bool,
}

// ============================================================================
// Model Types
// ============================================================================

#[derive(Serialize)]
pub struct ModelsResponse {
    pub data: Vec<ModelSummary>,
}

#[derive(Serialize)]
pub struct ModelSummary {
    pub id: String,
    pub name: String,
    pub kind: &'static str,
}

impl From<ModelDescriptor> for ModelSummary {
    fn from(model: ModelDescriptor) -> Self {
        let kind = match &model.backend {
            BackendKind::Embedded { .. } => "embedded",
            BackendKind::CustomAgent { .. } => "custom_agent",
            BackendKind::WorkflowAgent { .. } => "workflow_agent",
            BackendKind::Arena { .. } => "arena",
            BackendKind::LocalRuntime { .. } => "local_runtime",
            BackendKind::RemoteServer { .. } => "remote_server",
        };
        Self {
            id: model.id,
            name: model.name,
            kind,
        }
    }
}
