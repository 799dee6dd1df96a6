//! Remote completion server handler.
//!
//! Forwards the (filter-transformed) request to an OpenAI-compatible
//! `POST {base}/chat/completions` endpoint and translates the response —
//! a single JSON object or an SSE stream of `data:` frames terminated by
//! `[DONE]` — into the canonical event sequence. A stream that ends
//! without the completion marker is reported as a connection error, with
//! everything received so far already emitted (and therefore persisted)
//! upstream.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Map, Value};

use super::{ExecutionContext, ExecutionHandler};
use crate::config::GatewayConfig;
use crate::error::DispatchError;
use crate::events::OutputEvent;
use crate::model::{ChatMessage, ChatRequest, UserIdentity};

/// Client for one OpenAI-compatible backend. Also used for the gateway's
/// own metadata calls (model listing) with the shorter metadata timeout.
pub struct CompletionClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    /// Model name to send when the caller does not supply one (workflow
    /// llm nodes, nested prompts).
    default_model: Option<String>,
    /// Per-model default parameters merged into every outgoing payload.
    params: Map<String, Value>,
    request_timeout: Duration,
    metadata_timeout: Duration,
    forward_user_headers: bool,
}

impl CompletionClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, config: &GatewayConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
            default_model: None,
            params: Map::new(),
            request_timeout: config.request_timeout,
            metadata_timeout: config.metadata_timeout,
            forward_user_headers: config.forward_user_headers,
        }
    }

    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn builder(
        &self,
        url: &str,
        user: Option<&UserIdentity>,
        timeout: Duration,
    ) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(url).timeout(timeout);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        if self.forward_user_headers {
            if let Some(user) = user {
                builder = builder.header("X-Skiff-User-Id", &user.id);
                if let Some(name) = &user.name {
                    builder = builder.header("X-Skiff-User-Name", name);
                }
            }
        }
        builder
    }

    /// Request body with per-model default params merged in. Explicit
    /// params win over the generated fields, so a registry entry can pin
    /// e.g. `temperature` or rewrite `model`.
    fn body(&self, model: &str, messages: &[ChatMessage], stream: bool) -> Value {
        let mut body = Map::new();
        let model = self
            .params
            .get("model")
            .and_then(Value::as_str)
            .or(self.default_model.as_deref())
            .unwrap_or(model);
        body.insert("model".to_string(), Value::String(model.to_string()));
        body.insert(
            "messages".to_string(),
            serde_json::to_value(messages).unwrap_or_else(|_| json!([])),
        );
        body.insert("stream".to_string(), Value::Bool(stream));
        for (key, value) in &self.params {
            if key != "model" {
                body.insert(key.clone(), value.clone());
            }
        }
        Value::Object(body)
    }

    fn classify_send_error(&self, err: reqwest::Error) -> DispatchError {
        if err.is_timeout() {
            DispatchError::BackendTimeout(self.request_timeout)
        } else {
            DispatchError::BackendConnection(err.to_string())
        }
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, DispatchError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(DispatchError::BackendProtocol {
            status: status.as_u16(),
            detail: extract_error_detail(&body),
        })
    }

    /// Non-streaming completion. Returns the assistant message content.
    pub async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        user: Option<&UserIdentity>,
    ) -> Result<String, DispatchError> {
        let url = self.endpoint("chat/completions");
        let response = self
            .builder(&url, user, self.request_timeout)
            .json(&self.body(model, messages, false))
            .send()
            .await
            .map_err(|e| self.classify_send_error(e))?;
        let response = Self::check_status(response).await?;

        let value: Value = response
            .json()
            .await
            .map_err(|e| DispatchError::BackendConnection(e.to_string()))?;

        value["choices"][0]["message"]["content"]
            .as_str()
            .map(ToString::to_string)
            .ok_or(DispatchError::BackendProtocol {
                status: 200,
                detail: "response has no message content".to_string(),
            })
    }

    /// Streaming completion, translated into `PartialContent` events.
    pub async fn stream_into(
        &self,
        model: &str,
        messages: &[ChatMessage],
        user: Option<&UserIdentity>,
        ctx: &ExecutionContext,
    ) -> Result<(), DispatchError> {
        let url = self.endpoint("chat/completions");
        let response = self
            .builder(&url, user, self.request_timeout)
            .json(&self.body(model, messages, true))
            .send()
            .await
            .map_err(|e| self.classify_send_error(e))?;
        let response = Self::check_status(response).await?;

        let stream = response.bytes_stream();
        tokio::pin!(stream);
        let mut buffer = String::new();

        loop {
            let chunk = tokio::select! {
                reason = ctx.signal.cancelled() => return Err(DispatchError::Cancelled(reason)),
                chunk = stream.next() => chunk,
            };

            match chunk {
                Some(Ok(bytes)) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    for data in drain_sse_data(&mut buffer) {
                        if data == "[DONE]" {
                            return Ok(());
                        }
                        match serde_json::from_str::<Value>(&data) {
                            Ok(frame) => {
                                if let Some(text) = delta_text(&frame) {
                                    if !text.is_empty() {
                                        ctx.emit(OutputEvent::PartialContent { delta: text })
                                            .await?;
                                    }
                                }
                            }
                            Err(e) => {
                                tracing::warn!("Skipping malformed stream frame: {}", e);
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    return Err(if e.is_timeout() {
                        DispatchError::BackendTimeout(self.request_timeout)
                    } else {
                        DispatchError::BackendConnection(e.to_string())
                    });
                }
                // Connection closed before the completion marker: partials
                // already emitted stand, the turn is marked errored.
                None => {
                    return Err(DispatchError::BackendConnection(
                        "stream ended before completion marker".to_string(),
                    ));
                }
            }
        }
    }

    /// Metadata-only call: list model ids the backend serves. Uses the
    /// short metadata timeout, not the generation timeout.
    pub async fn list_models(&self) -> Result<Vec<String>, DispatchError> {
        let url = self.endpoint("models");
        let mut builder = self.client.get(&url).timeout(self.metadata_timeout);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                DispatchError::BackendTimeout(self.metadata_timeout)
            } else {
                DispatchError::BackendConnection(e.to_string())
            }
        })?;
        let response = Self::check_status(response).await?;

        let value: Value = response
            .json()
            .await
            .map_err(|e| DispatchError::BackendConnection(e.to_string()))?;

        let models = value["data"]
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|m| m["id"].as_str().map(ToString::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok(models)
    }
}

/// Completion seam for workflow llm nodes.
#[async_trait]
pub trait NodeCompletion: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, DispatchError>;
}

#[async_trait]
impl NodeCompletion for CompletionClient {
    async fn complete(&self, prompt: &str) -> Result<String, DispatchError> {
        let messages = vec![ChatMessage::user(prompt)];
        let model = self.default_model.clone().unwrap_or_default();
        CompletionClient::complete(self, &model, &messages, None).await
    }
}

pub struct RemoteServerHandler {
    client: CompletionClient,
}

impl RemoteServerHandler {
    pub fn new(client: CompletionClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ExecutionHandler for RemoteServerHandler {
    fn kind(&self) -> &'static str {
        "remote_server"
    }

    async fn execute(
        &self,
        request: &ChatRequest,
        ctx: &ExecutionContext,
    ) -> Result<(), DispatchError> {
        if request.stream {
            self.client
                .stream_into(&request.model, &request.messages, Some(&request.user), ctx)
                .await
        } else {
            let content = self
                .client
                .complete(&request.model, &request.messages, Some(&request.user))
                .await?;
            ctx.emit(OutputEvent::PartialContent { delta: content })
                .await
        }
    }
}

/// Drain complete SSE lines from the buffer, returning `data:` payloads.
/// The trailing incomplete line stays buffered.
fn drain_sse_data(buffer: &mut String) -> Vec<String> {
    let mut payloads = Vec::new();
    while let Some(pos) = buffer.find('\n') {
        let line: String = buffer.drain(..=pos).collect();
        let line = line.trim_end_matches(['\n', '\r']);
        if let Some(data) = line.strip_prefix("data:") {
            payloads.push(data.trim_start().to_string());
        }
    }
    payloads
}

/// Content delta from one stream frame. Accepts both `delta.content`
/// (streaming) and `message.content` (servers that send whole messages).
fn delta_text(frame: &Value) -> Option<String> {
    let choice = frame["choices"].get(0)?;
    choice["delta"]["content"]
        .as_str()
        .or_else(|| choice["message"]["content"].as_str())
        .map(ToString::to_string)
}

fn extract_error_detail(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        if let Some(message) = value["error"]["message"].as_str() {
            return message.to_string();
        }
        if let Some(message) = value["error"].as_str() {
            return message.to_string();
        }
        if let Some(message) = value["detail"].as_str() {
            return message.to_string();
        }
    }
    if body.is_empty() {
        "no error detail".to_string()
    } else {
        body.chars().take(500).collect()
    }
}
