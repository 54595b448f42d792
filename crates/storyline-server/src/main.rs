// Storyline realtime server
// Decision: ctrl-c cancels every delivery session first so open SSE streams end and
// graceful shutdown can complete

use anyhow::{Context, Result};
use storyline_core::telemetry::{init_telemetry, TelemetryConfig};
use storyline_core::UpdateHub;
use storyline_server::config::ServerConfig;
use storyline_server::{build_app, Services};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before reading any configuration
    dotenvy::dotenv().ok();

    let telemetry = TelemetryConfig::from_env()
        .with_default_filter("storyline_server=debug,storyline_core=info,tower_http=debug")
        .with_service_version(env!("CARGO_PKG_VERSION"));
    init_telemetry(&telemetry).context("Failed to initialize telemetry")?;

    let config = ServerConfig::from_env().context("Invalid configuration")?;
    tracing::info!(
        broadcaster = ?config.broadcaster,
        use_broadcaster = config.session.use_broadcaster,
        poll_interval_ms = config.session.poll_interval.as_millis() as u64,
        "Starting storyline-server"
    );

    let services = Services::from_config(&config).await?;

    if !config.api_prefix.is_empty() {
        tracing::info!(prefix = %config.api_prefix, "API prefix configured");
    }
    if config.cors_allowed_origins.is_empty() {
        tracing::info!("CORS not configured (same-origin requests only)");
    } else {
        tracing::info!(origins = ?config.cors_allowed_origins, "CORS origins configured");
    }

    let app = build_app(&services, &config.api_prefix, &config.cors_allowed_origins);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;
    tracing::info!("HTTP server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(services.hub.clone()))
        .await
        .context("Server error")?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal(hub: UpdateHub) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        // Without a signal handler, run until killed
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
    hub.shutdown();
}
