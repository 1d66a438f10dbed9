use std::sync::Arc;

use config_rs::GatewayConfig;
use error_handling_rs::{init_logging, LoggingConfig};
use query_gateway::{QueryGateway, SERVICE_NAME, START_TIME};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file
    config_rs::load_env_file();

    init_logging(Some(LoggingConfig::from_env(SERVICE_NAME)))?;

    let _ = *START_TIME;

    let config_path = GatewayConfig::config_path();
    let config = GatewayConfig::load_from_path(&config_path)?;
    info!(
        path = %config_path.display(),
        services = config.services.len(),
        "Configuration loaded"
    );

    let gateway = Arc::new(QueryGateway::from_config(config)?.with_config_path(config_path));

    // startup gate: only fatal when health.fail_if_unready is set
    let healthy = gateway.wait_until_ready().await?;
    info!(healthy, "Readiness check finished");

    let prober = gateway.start_health_prober();

    let addr = gateway.config().bind_address();
    let app = gateway.clone().create_router();
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(%addr, "Query gateway listening");

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
        info!("Shutdown signal received");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    prober.abort();
    info!("Query gateway stopped");
    Ok(())
}
