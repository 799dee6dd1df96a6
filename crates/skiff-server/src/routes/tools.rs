//! Tool discovery, scoped to the calling user.

use axum::{extract::State, http::HeaderMap, routing::get, Json, Router};
use serde::Serialize;
use serde_json::Value;

use super::identity_from_headers;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(list_tools))
}

#[derive(Serialize)]
pub struct ToolSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

async fn list_tools(State(state): State<AppState>, headers: HeaderMap) -> Json<Vec<ToolSummary>> {
    let user = identity_from_headers(&headers);
    let tools = state
        .tool_adapter
        .list_available(&user)
        .await
        .into_iter()
        .map(|t| ToolSummary {
            id: t.id,
            name: t.name,
            description: t.description,
            input_schema: t.input_schema,
        })
        .collect();
    Json(tools)
}
