//! Liveness endpoint.

use axum::response::IntoResponse;

/// Returns 200 `ok` while the process is serving requests.
#[tracing::instrument(name = "health.liveness")]
pub async fn health_check() -> impl IntoResponse {
    "ok"
}
