use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("skiff=info,skiff_core=info,tower_http=info")),
        )
        .init();

    let config = skiff_server::ServerConfig::default();
    skiff_server::start_server(config).await
}
