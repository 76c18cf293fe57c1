use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

/// Install the log subscriber and the Prometheus recorder. Called once at
/// process start, before anything emits.
pub fn init_observability() -> PrometheusHandle {
    // Configure logging from environment for easy local tweaking.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    PrometheusBuilder::new()
        .install_recorder()
        .expect("install metrics recorder")
}

/// Serve the Prometheus scrape endpoint on its own listener, away from the
/// client-facing port.
pub async fn serve_metrics(handle: PrometheusHandle, addr: SocketAddr) -> std::io::Result<()> {
    let app = axum::Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    );
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await
}
