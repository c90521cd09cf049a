#![deny(unused)]
//! gov-bridge - governance interception layer for tool-call backends.
//!
//! Loads layered configuration, connects every configured backend, and
//! serves the governed call surface plus dashboard endpoints over HTTP.

use std::sync::Arc;

use gov_bridge_core::config::AppConfig;
use gov_bridge_gateway::{Bridge, GatewayConfig, GatewayServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;

    // Initialize tracing
    gov_bridge_governance::configure_tracing(config.governance.json_logs)?;

    tracing::info!("Starting gov-bridge v{}", env!("CARGO_PKG_VERSION"));

    // =========================================================================
    // Observability (Metrics)
    // =========================================================================
    let metrics_handle = if config.governance.metrics_enabled {
        Some(gov_bridge_governance::setup_metrics_recorder()?)
    } else {
        None
    };

    // =========================================================================
    // Audit Store & Bridge
    // =========================================================================
    let store = gov_bridge_store::open_audit_store(&config.audit)?;
    let bridge = Arc::new(Bridge::from_config(&config, store).await?);

    for backend in bridge.router().backends() {
        tracing::info!(
            backend = %backend.id,
            transport = %backend.kind,
            tools = backend.tools.len(),
            "Backend ready"
        );
    }

    // =========================================================================
    // Start the server
    // =========================================================================
    let mut server = GatewayServer::new(GatewayConfig::from(&config.server), bridge.clone());
    if let Some(handle) = metrics_handle {
        server = server.with_metrics(handle);
    }

    server.run(shutdown_signal()).await?;

    bridge.shutdown().await;
    gov_bridge_governance::shutdown_tracing();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
