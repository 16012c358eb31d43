//! Mutating admission webhook
//!
//! Serves `POST /add-pod-scheduling-gate` over TLS. The handler never
//! rejects a pod; at worst it lets it through unchanged.

mod pod;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tracing::info;

use multiarch_common::events::EventDispatcher;
use multiarch_common::store::ConfigStore;
use multiarch_common::Error;

use crate::gate::GateSettings;

pub use pod::{admission_patch, admit_pod, mutate_handler};

/// Path the MutatingWebhookConfiguration points at
pub const ADD_GATE_PATH: &str = "/add-pod-scheduling-gate";

/// Shared state for admission handlers
pub struct WebhookState {
    /// Active ClusterPodPlacementConfig
    pub config: Arc<ConfigStore>,
    /// Gate decision settings
    pub settings: GateSettings,
    /// Off-path event publishing
    pub events: Arc<EventDispatcher>,
}

/// Webhook listener configuration
#[derive(Clone, Debug)]
pub struct WebhookServerConfig {
    /// Address to bind
    pub addr: SocketAddr,
    /// PEM certificate chain
    pub cert_path: PathBuf,
    /// PEM private key
    pub key_path: PathBuf,
}

/// Routes served by the webhook listener
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(ADD_GATE_PATH, post(mutate_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

/// Serve the webhook until the process exits
pub async fn serve_webhook(
    config: WebhookServerConfig,
    state: Arc<WebhookState>,
) -> Result<(), Error> {
    let tls_config = RustlsConfig::from_pem_file(&config.cert_path, &config.key_path)
        .await
        .map_err(|e| Error::internal_with_context("webhook", format!("TLS config error: {}", e)))?;

    info!(addr = %config.addr, "Starting admission webhook");

    axum_server::bind_rustls(config.addr, tls_config)
        .serve(webhook_router(state).into_make_service())
        .await
        .map_err(|e| Error::internal_with_context("webhook", format!("server error: {}", e)))
}
