//! Mutating admission webhook
//!
//! Serves `POST /mutate` for pod admission reviews and `GET /health/ready`
//! for the kubelet. Requests that cannot be decoded are rejected at the HTTP
//! level; everything past decoding is answered with an admission response
//! that allows the pod, with or without a patch.

pub mod pod;

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

use crate::config::ConfigSource;

/// Namespaces whose pods are never mutated
pub const PROTECTED_NAMESPACES: &[&str] = &["kube-system", "kube-public"];

/// Error type for requests rejected before admission handling
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// The request did not declare a JSON body
    #[error("only application/json is supported, got: {0:?}")]
    UnsupportedContentType(String),

    /// The admission review request was invalid or malformed
    #[error("invalid admission review: {0}")]
    InvalidReview(String),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": self.to_string()})),
        )
            .into_response()
    }
}

/// Shared state for webhook handlers
#[derive(Clone)]
pub struct WebhookState {
    /// Where agent configuration documents are read from
    pub config_source: Arc<dyn ConfigSource>,
    /// Certificate file whose presence marks the webhook ready
    pub cert_path: PathBuf,
}

impl WebhookState {
    /// Create webhook state
    pub fn new(config_source: Arc<dyn ConfigSource>, cert_path: impl Into<PathBuf>) -> Self {
        Self {
            config_source,
            cert_path: cert_path.into(),
        }
    }
}

/// Create the webhook router
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/mutate", post(pod::mutate_handler))
        .route("/health/ready", get(ready_handler))
        .with_state(state)
}

/// Ready once TLS material has been written
async fn ready_handler(State(state): State<Arc<WebhookState>>) -> StatusCode {
    match tokio::fs::try_exists(&state.cert_path).await {
        Ok(true) => StatusCode::NO_CONTENT,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    }
}
