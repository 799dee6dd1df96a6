//! Model listing.
//!
//! Serves the registry contents, merged with whatever the default remote
//! backend reports. The remote probe is a metadata-only call on the short
//! metadata timeout and is fail-soft: an unreachable backend degrades the
//! listing, never the endpoint.

use axum::{extract::State, routing::get, Json, Router};

use crate::types::{ModelSummary, ModelsResponse};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(list_models))
}

async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    let mut data: Vec<ModelSummary> = state
        .models
        .list()
        .into_iter()
        .map(ModelSummary::from)
        .collect();

    if let Some(client) = &state.metadata_client {
        match client.list_models().await {
            Ok(remote) => {
                for id in remote {
                    if !data.iter().any(|m| m.id == id) {
                        data.push(ModelSummary {
                            name: id.clone(),
                            id,
                            kind: "remote_server",
                        });
                    }
                }
            }
            Err(e) => {
                tracing::warn!("Remote model listing unavailable: {}", e);
            }
        }
    }

    Json(ModelsResponse { data })
}
