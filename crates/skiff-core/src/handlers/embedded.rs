//! Embedded function handler.
//!
//! Embedded functions are in-process extension entry points registered at
//! startup. They run synchronously within the router's scheduling domain —
//! no network hop, no worker thread. Errors surface as an in-stream error
//! event; there is no retry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{ExecutionContext, ExecutionHandler};
use crate::error::DispatchError;
use crate::model::ChatRequest;

/// An in-process extension function.
#[async_trait]
pub trait EmbeddedFunction: Send + Sync {
    fn id(&self) -> &str;

    /// Produce output by emitting events through `ctx`. Returning an error
    /// ends the request with an in-conversation error message.
    async fn call(&self, request: &ChatRequest, ctx: &ExecutionContext)
        -> Result<(), DispatchError>;
}

#[derive(Default)]
pub struct EmbeddedFunctionRegistry {
    functions: RwLock<HashMap<String, Arc<dyn EmbeddedFunction>>>,
}

impl EmbeddedFunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, function: Arc<dyn EmbeddedFunction>) {
        self.functions
            .write()
            .insert(function.id().to_string(), function);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn EmbeddedFunction>> {
        self.functions.read().get(id).cloned()
    }
}

pub struct EmbeddedFunctionHandler {
    function: Arc<dyn EmbeddedFunction>,
}

impl EmbeddedFunctionHandler {
    pub fn new(function: Arc<dyn EmbeddedFunction>) -> Self {
        Self { function }
    }
}

#[async_trait]
impl ExecutionHandler for EmbeddedFunctionHandler {
    fn kind(&self) -> &'static str {
        "embedded_function"
    }

    async fn execute(
        &self,
        request: &ChatRequest,
        ctx: &ExecutionContext,
    ) -> Result<(), DispatchError> {
        tracing::debug!(function = self.function.id(), "Invoking embedded function");
        self.function.call(request, ctx).await.map_err(|e| match e {
            DispatchError::Cancelled(reason) => DispatchError::Cancelled(reason),
            other => DispatchError::handler(format!(
                "Embedded function '{}' failed: {}",
                self.function.id(),
                other
            )),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge;
    use crate::cancel::CancellationSignal;
    use crate::events::OutputEvent;
    use crate::model::{RequestMetadata, UserIdentity, Valves};

    struct Greeter;

    #[async_trait]
    impl EmbeddedFunction for Greeter {
        fn id(&self) -> &str {
            "greeter"
        }

        async fn call(
            &self,
            request: &ChatRequest,
            ctx: &ExecutionContext,
        ) -> Result<(), DispatchError> {
            let name = request.last_user_message().unwrap_or("world");
            ctx.emit(OutputEvent::PartialContent {
                delta: format!("Hello, {}!", name),
            })
            .await
        }
    }

    fn context(sink: bridge::EventSink) -> ExecutionContext {
        ExecutionContext {
            user: UserIdentity::new("u1"),
            metadata: RequestMetadata {
                chat_id: "c1".to_string(),
                message_id: "m1".to_string(),
            },
            tools: Vec::new(),
            valves: Valves::default(),
            signal: CancellationSignal::never(),
            sink,
            agent_chain: Vec::new(),
        }
    }

    fn request(message: &str) -> ChatRequest {
        ChatRequest {
            messages: vec![crate::model::ChatMessage::user(message)],
            model: "greeter".to_string(),
            stream: false,
            tool_ids: vec![],
            user: UserIdentity::new("u1"),
            metadata: RequestMetadata {
                chat_id: "c1".to_string(),
                message_id: "m1".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_embedded_function_emits_into_sink() {
        let registry = EmbeddedFunctionRegistry::new();
        registry.register(Arc::new(Greeter));

        let handler = EmbeddedFunctionHandler::new(registry.get("greeter").unwrap());
        let (sink, mut stream) = bridge::channel(8);
        let ctx = context(sink.clone());

        handler.execute(&request("skiff"), &ctx).await.unwrap();
        sink.finish().await;

        let event = stream.next().await.unwrap();
        assert_eq!(
            event,
            OutputEvent::PartialContent {
                delta: "Hello, skiff!".to_string()
            }
        );
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_function_error_becomes_handler_internal() {
        struct Failing;

        #[async_trait]
        impl EmbeddedFunction for Failing {
            fn id(&self) -> &str {
                "failing"
            }
            async fn call(
                &self,
                _request: &ChatRequest,
                _ctx: &ExecutionContext,
            ) -> Result<(), DispatchError> {
                Err(DispatchError::handler("kaboom"))
            }
        }

        let handler = EmbeddedFunctionHandler::new(Arc::new(Failing));
        let (sink, _stream) = bridge::channel(8);
        let ctx = context(sink);

        let err = handler.execute(&request("x"), &ctx).await.unwrap_err();
        match err {
            DispatchError::HandlerInternal(msg) => {
                assert!(msg.contains("failing"));
                assert!(msg.contains("kaboom"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
