use std::net::SocketAddr;

use tracing::info;

use sonet_server::{config, core, http, service};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sonet_server=info,sonet_hub=info,tower_http=warn".into()),
        )
        .init();

    // Config: explicit path via SONET_CONFIG > ./sonet.toml > defaults.
    let config_path = std::env::var("SONET_CONFIG").ok();
    let config = config::ServerConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("config load failed ({e}), using defaults");
        config::ServerConfig::default()
    });

    let bind = config.server.bind.clone();
    let port = config.server.port;

    let core = core::MessagingCore::build(config).await?;
    let maintenance = core.spawn_maintenance();
    let service = service::MessagingService::new(core.clone());
    let router = http::build_router(service);

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!("sonet messaging core listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    maintenance.abort();
    core.shutdown().await;
    Ok(())
}
