//! API route modules

use axum::http::HeaderMap;
use axum::Router;

use skiff_core::{UserIdentity, UserRole};

use crate::AppState;

pub mod chat;
pub mod models;
pub mod tools;

pub fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/chat", chat::router())
        .nest("/models", models::router())
        .nest("/tools", tools::router())
}

/// Caller identity established by the upstream auth layer and forwarded in
/// headers. Absent headers mean an anonymous caller.
pub(crate) fn identity_from_headers(headers: &HeaderMap) -> UserIdentity {
    let id = headers
        .get("x-skiff-user-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string();
    let name = headers
        .get("x-skiff-user-name")
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);
    let role = match headers
        .get("x-skiff-user-role")
        .and_then(|v| v.to_str().ok())
    {
        Some("admin") => UserRole::Admin,
        _ => UserRole::User,
    };
    UserIdentity { id, name, role }
}
