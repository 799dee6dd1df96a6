//! Skiff Server
//!
//! Self-hosted chat completion gateway: the HTTP surface over
//! `skiff-core`'s dispatch pipeline. This is a library crate — the server
//! is started via `start_server()`.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{http::Method, routing::get, Json, Router};
use serde::Serialize;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use skiff_core::cancel::CancellationCoordinator;
use skiff_core::dispatch::{Dispatcher, DispatcherServices};
use skiff_core::filters::FilterPipeline;
use skiff_core::handlers::{
    CompletionClient, CustomAgentRegistry, EmbeddedFunctionRegistry, NodeCompletion,
    WorkflowAgentRegistry,
};
use skiff_core::storage::Database;
use skiff_core::tools::{CallAgentTool, ToolAdapter, ToolRegistry};
use skiff_core::{BackendKind, FilterRegistry, GatewayConfig, ModelDescriptor, ModelRegistry};

pub mod error;
pub mod routes;
pub mod types;

/// Configuration for starting the server.
pub struct ServerConfig {
    /// Port to listen on (default: 3000, `SKIFF_PORT`).
    pub port: u16,
    /// SQLite database path (default: `<config dir>/skiff/skiff.db`,
    /// `SKIFF_DB`).
    pub db_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let port = std::env::var("SKIFF_PORT")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(3000);
        let db_path = std::env::var("SKIFF_DB").map(PathBuf::from).unwrap_or_else(|_| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("skiff")
                .join("skiff.db")
        });
        Self { port, db_path }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub models: Arc<ModelRegistry>,
    pub filters: Arc<FilterRegistry>,
    pub coordinator: Arc<CancellationCoordinator>,
    pub config: Arc<GatewayConfig>,
    pub embedded: Arc<EmbeddedFunctionRegistry>,
    pub custom_agents: Arc<CustomAgentRegistry>,
    pub workflows: Arc<WorkflowAgentRegistry>,
    pub tool_adapter: ToolAdapter,
    /// Client for metadata calls against the default remote backend.
    pub metadata_client: Option<Arc<CompletionClient>>,
}

/// Seed the model registry from the environment: a default remote backend
/// (`SKIFF_BACKEND_URL`, optional `SKIFF_BACKEND_KEY_REF` naming the env
/// var holding its credential, `SKIFF_MODEL`) and a local runtime
/// (`SKIFF_LOCAL_RUNTIME_URL`, `SKIFF_LOCAL_MODEL`). Model/agent CRUD
/// lives with the external registry; this is bootstrap wiring only.
fn seed_models_from_env(models: &ModelRegistry) {
    if let Ok(base_url) = std::env::var("SKIFF_BACKEND_URL") {
        let model = std::env::var("SKIFF_MODEL").unwrap_or_else(|_| "default".to_string());
        models.insert(ModelDescriptor::new(
            model,
            BackendKind::RemoteServer {
                base_url,
                key_ref: std::env::var("SKIFF_BACKEND_KEY_REF").ok(),
            },
        ));
    }

    if let Ok(base_url) = std::env::var("SKIFF_LOCAL_RUNTIME_URL") {
        let model = std::env::var("SKIFF_LOCAL_MODEL").unwrap_or_else(|_| "local".to_string());
        models.insert(ModelDescriptor::new(
            model,
            BackendKind::LocalRuntime { base_url },
        ));
    }
}

/// Build the default-backend client used for workflow llm nodes and
/// metadata probes. None when no remote backend is configured.
fn default_backend_client(config: &GatewayConfig) -> Option<Arc<CompletionClient>> {
    let base_url = std::env::var("SKIFF_BACKEND_URL").ok()?;
    let api_key = std::env::var("SKIFF_BACKEND_KEY_REF")
        .ok()
        .and_then(|name| std::env::var(name).ok());
    let model = std::env::var("SKIFF_MODEL").unwrap_or_else(|_| "default".to_string());
    Some(Arc::new(
        CompletionClient::new(base_url, api_key, config).with_default_model(model),
    ))
}

/// Build the Axum router with all routes.
pub async fn build_router(config: &ServerConfig) -> anyhow::Result<(Router, AppState)> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // Open once up front so schema problems fail at startup, not mid-turn.
    Database::new(&config.db_path)?;

    let gateway_config = Arc::new(GatewayConfig::from_env());

    let models = Arc::new(ModelRegistry::new());
    seed_models_from_env(&models);

    let filters = Arc::new(FilterRegistry::new());
    let pipeline = Arc::new(FilterPipeline::http(gateway_config.filter_timeout));

    let tool_registry = Arc::new(ToolRegistry::new());
    tool_registry
        .register(Arc::new(CallAgentTool::new(gateway_config.agent_call_depth)))
        .await;

    let embedded = Arc::new(EmbeddedFunctionRegistry::new());
    let custom_agents = Arc::new(CustomAgentRegistry::new());
    let workflows = Arc::new(WorkflowAgentRegistry::new());

    let backend_client = default_backend_client(&gateway_config);
    let workflow_completion: Option<Arc<dyn NodeCompletion>> = backend_client
        .clone()
        .map(|client| client as Arc<dyn NodeCompletion>);

    let coordinator = Arc::new(CancellationCoordinator::new());
    let tool_adapter = ToolAdapter::new(tool_registry);
    let dispatcher = Dispatcher::new(DispatcherServices {
        config: gateway_config.clone(),
        models: models.clone(),
        filters: filters.clone(),
        pipeline,
        tool_adapter: tool_adapter.clone(),
        embedded: embedded.clone(),
        custom_agents: custom_agents.clone(),
        workflows: workflows.clone(),
        workflow_completion,
        coordinator: coordinator.clone(),
        db_path: Arc::new(config.db_path.clone()),
    });

    let state = AppState {
        dispatcher,
        models,
        filters,
        coordinator,
        config: gateway_config,
        embedded,
        custom_agents,
        workflows,
        tool_adapter,
        metadata_client: backend_client,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health))
        .nest("/api", routes::api_router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    Ok((app, state))
}

/// Start the Skiff server and block until shutdown.
pub async fn start_server(config: ServerConfig) -> anyhow::Result<()> {
    let addr: std::net::SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    let (app, _state) = build_router(&config).await?;

    tracing::info!("Skiff gateway listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}
