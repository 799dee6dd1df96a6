//! Local runtime handler.
//!
//! Speaks the local model runtime's native contract: `POST {base}/api/chat`
//! with newline-delimited JSON responses. Streaming responses are one JSON
//! object per line carrying `message.content`, terminated by an object with
//! `done: true`; a stream that closes without the terminal object is a
//! connection error, with everything received so far already emitted.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Map, Value};

use super::{ExecutionContext, ExecutionHandler};
use crate::config::GatewayConfig;
use crate::error::DispatchError;
use crate::events::OutputEvent;
use crate::model::{ChatMessage, ChatRequest};

pub struct LocalRuntimeHandler {
    client: reqwest::Client,
    base_url: String,
    params: Map<String, Value>,
    request_timeout: std::time::Duration,
}

impl LocalRuntimeHandler {
    pub fn new(base_url: impl Into<String>, config: &GatewayConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            params: Map::new(),
            request_timeout: config.request_timeout,
        }
    }

    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    fn body(&self, model: &str, messages: &[ChatMessage], stream: bool) -> Value {
        let model = self
            .params
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(model);
        let mut body = Map::new();
        body.insert("model".to_string(), Value::String(model.to_string()));
        body.insert(
            "messages".to_string(),
            serde_json::to_value(messages).unwrap_or_else(|_| json!([])),
        );
        body.insert("stream".to_string(), Value::Bool(stream));
        let options: Map<String, Value> = self
            .params
            .iter()
            .filter(|(k, _)| k.as_str() != "model")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if !options.is_empty() {
            body.insert("options".to_string(), Value::Object(options));
        }
        Value::Object(body)
    }
}

#[async_trait]
impl ExecutionHandler for LocalRuntimeHandler {
    fn kind(&self) -> &'static str {
        "local_runtime"
    }

    async fn execute(
        &self,
        request: &ChatRequest,
        ctx: &ExecutionContext,
    ) -> Result<(), DispatchError> {
        let url = format!("{}/api/chat", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .json(&self.body(&request.model, &request.messages, request.stream))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DispatchError::BackendTimeout(self.request_timeout)
                } else {
                    DispatchError::BackendConnection(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::BackendProtocol {
                status: status.as_u16(),
                detail: if body.is_empty() {
                    "no error detail".to_string()
                } else {
                    body.chars().take(500).collect()
                },
            });
        }

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
                    for line in drain_lines(&mut buffer) {
                        match serde_json::from_str::<Value>(&line) {
                            Ok(frame) => {
                                if let Some(text) = frame["message"]["content"].as_str() {
                                    if !text.is_empty() {
                                        ctx.emit(OutputEvent::PartialContent {
                                            delta: text.to_string(),
                                        })
                                        .await?;
                                    }
                                }
                                if frame["done"].as_bool() == Some(true) {
                                    return Ok(());
                                }
                            }
                            Err(e) => {
                                tracing::warn!("Skipping malformed runtime frame: {}", e);
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
                None => {
                    return Err(DispatchError::BackendConnection(
                        "runtime stream ended before terminal frame".to_string(),
                    ));
                }
            }
        }
    }
}

fn drain_lines(buffer: &mut String) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.find('\n') {
        let line: String = buffer.drain(..=pos).collect();
        let line = line.trim();
        if !line.is_empty() {
            lines.push(line.to_string());
        }
    }
    lines
}
