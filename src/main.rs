use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tower::limit::GlobalConcurrencyLimitLayer;
use tracing::info;

use medlipi::clinic::ClinicRegistry;
use medlipi::http::{self, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("MEDLIPI_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    medlipi::observability::init(metrics_port);

    let port = std::env::var("MEDLIPI_PORT").unwrap_or_else(|_| "8080".into());
    let bind = std::env::var("MEDLIPI_BIND").unwrap_or_else(|_| "0.0.0.0".into());
    let data_dir = std::env::var("MEDLIPI_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let api_token = std::env::var("MEDLIPI_API_TOKEN").unwrap_or_else(|_| "medlipi".into());
    let max_connections: usize = std::env::var("MEDLIPI_MAX_CONNECTIONS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(256);
    let compact_threshold: u64 = std::env::var("MEDLIPI_COMPACT_THRESHOLD")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1000);

    // Ensure data directory exists
    std::fs::create_dir_all(&data_dir)?;

    let clinics = Arc::new(ClinicRegistry::new(
        PathBuf::from(&data_dir),
        compact_threshold,
    ));
    let app = http::router(AppState::new(clinics, api_token))
        .layer(GlobalConcurrencyLimitLayer::new(max_connections));

    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("medlipi listening on {addr}");
    info!("  data_dir: {data_dir}");
    info!("  max_connections: {max_connections}");
    info!(
        "  metrics: {}",
        metrics_port.map_or("disabled".to_string(), |p| format!(
            "http://0.0.0.0:{p}/metrics"
        ))
    );

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight requests
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("medlipi stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    info!("shutdown signal received, draining requests");
}
