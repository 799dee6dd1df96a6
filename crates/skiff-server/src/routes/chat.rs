//! Completion endpoint with SSE streaming, plus in-flight abort.

use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use skiff_core::{CancelReason, FinishKind, OutputEvent};

use super::identity_from_headers;
use crate::error::AppError;
use crate::types::{AbortResponse, CompletionRequest, CompletionResponse};
use crate::AppState;

const SSE_CHANNEL_BUFFER: usize = 256;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/completions", post(completions))
        .route("/abort/:chat_id/:message_id", post(abort))
}

async fn completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CompletionRequest>,
) -> Result<Response, AppError> {
    let user = identity_from_headers(&headers);
    let request = req.into_core(user)?;

    let model = state
        .models
        .get(&request.model)
        .ok_or_else(|| AppError::NotFound(format!("Model {} not found", request.model)))?;

    let streaming = request.stream;
    let meta = request.metadata.clone();
    let model_id = model.id.clone();
    let mut events = state.dispatcher.dispatch(request, model);

    if !streaming {
        // Drain to the terminal event and answer with one JSON object.
        let mut content = String::new();
        let mut finish: Option<Result<&'static str, String>> = None;
        while let Some(event) = events.next().await {
            match event {
                OutputEvent::Done {
                    finish: FinishKind::Complete,
                    content: full,
                } => {
                    content = full;
                    finish = Some(Ok("stop"));
                }
                OutputEvent::Done {
                    finish: FinishKind::Cancelled,
                    content: full,
                } => {
                    content = full;
                    finish = Some(Ok("cancelled"));
                }
                OutputEvent::Error { message } => finish = Some(Err(message)),
                _ => {}
            }
        }
        return match finish {
            Some(Ok(reason)) => Ok(Json(CompletionResponse::assistant(
                &meta.message_id,
                &model_id,
                content,
                reason,
            ))
            .into_response()),
            Some(Err(message)) => Err(AppError::Internal(message)),
            None => Err(AppError::Internal(
                "Generation ended without a terminal event".to_string(),
            )),
        };
    }

    // Streaming: forward each event as an SSE data frame, then an explicit
    // completion marker. A dropped client connection aborts the upstream
    // generation.
    let (sse_tx, sse_rx) = mpsc::channel::<Result<Event, Infallible>>(SSE_CHANNEL_BUFFER);
    let coordinator = state.coordinator.clone();

    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let terminal = event.is_terminal();
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if sse_tx.send(Ok(Event::default().data(json))).await.is_err() {
                        tracing::info!(
                            chat_id = %meta.chat_id,
                            message_id = %meta.message_id,
                            "Client disconnected; aborting generation"
                        );
                        coordinator.cancel(
                            &meta.chat_id,
                            &meta.message_id,
                            CancelReason::CallerAbort,
                        );
                        return;
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize output event: {}", e);
                }
            }
            if terminal {
                break;
            }
        }
        let _ = sse_tx.send(Ok(Event::default().data("[DONE]"))).await;
    });

    let stream = ReceiverStream::new(sse_rx);
    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response())
}

/// Explicit caller-side abort for an in-flight generation. Partial content
/// is flushed to persistence by the dispatcher before teardown.
async fn abort(
    State(state): State<AppState>,
    Path((chat_id, message_id)): Path<(String, String)>,
) -> Json<AbortResponse> {
    let cancelled = state
        .coordinator
        .cancel(&chat_id, &message_id, CancelReason::CallerAbort);
    if !cancelled {
        tracing::debug!(
            chat_id = %chat_id,
            message_id = %message_id,
            "Abort requested for unknown or finished generation"
        );
    }
    Json(AbortResponse { cancelled })
}
