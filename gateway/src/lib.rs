pub mod account;
pub mod api;
pub mod config;
pub mod errors;
pub mod metrics_defs;
pub mod service;

#[cfg(test)]
mod testutils;

use shared::shutdown::ShutdownHandle;
use std::sync::Arc;

/// Serves the SDK API until the listener fails or the process exits.
/// Collaborators are injected; the binary decides which drivers back them.
pub async fn run(
    config: config::Config,
    service: Arc<service::GatewayService>,
    shutdown: ShutdownHandle,
) -> Result<(), std::io::Error> {
    let api = api::ApiService::new(
        service,
        shutdown.clone(),
        std::time::Duration::from_secs(config.request_timeout_secs),
    );
    tracing::info!(
        host = %config.listener.host,
        port = config.listener.port,
        "Starting gateway"
    );
    shared::http::run_http_service(&config.listener.host, config.listener.port, api, shutdown)
        .await
}
