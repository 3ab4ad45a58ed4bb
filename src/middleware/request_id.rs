//! Request ID middleware for log correlation.
//!
//! Every request runs inside a span carrying its request ID, and JSON error
//! bodies are stamped with the same ID so a user-visible failure can be
//! matched to the logs of the login attempt that produced it.

use axum::{
    body::Body,
    extract::Request,
    http::header::CONTENT_TYPE,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::Instrument;
use uuid::Uuid;

/// Header name for the request ID.
pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// Longest inbound request ID that is propagated rather than replaced.
const MAX_REQUEST_ID_LEN: usize = 128;

/// Extension containing the request ID for the current request.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Use the caller's `X-Request-Id` when it is short and printable, otherwise
/// generate one.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty() && s.len() <= MAX_REQUEST_ID_LEN)
        .map(|s| RequestId(s.to_string()))
        .unwrap_or_default();

    req.extensions_mut().insert(request_id.clone());

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %req.method(),
        path = %req.uri().path(),
    );

    let response = next.run(req).instrument(span).await;
    let mut response = inject_request_id_into_error(response, &request_id).await;

    if let Ok(value) = request_id.0.parse() {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    response
}

/// Add `error.request_id` to JSON error bodies.
async fn inject_request_id_into_error(response: Response, request_id: &RequestId) -> Response {
    let status = response.status();
    if !status.is_client_error() && !status.is_server_error() {
        return response;
    }

    let is_json = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));
    if !is_json {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(_) => return (parts, Body::empty()).into_response(),
    };

    let modified = match serde_json::from_slice::<serde_json::Value>(&bytes) {
        Ok(mut json) => {
            if let Some(error) = json.get_mut("error").and_then(|e| e.as_object_mut()) {
                error.insert(
                    "request_id".to_string(),
                    serde_json::Value::String(request_id.0.clone()),
                );
            }
            serde_json::to_vec(&json).unwrap_or_else(|_| bytes.to_vec())
        }
        Err(_) => bytes.to_vec(),
    };

    // Body length changed
    parts.headers.remove(axum::http::header::CONTENT_LENGTH);
    Response::from_parts(parts, Body::from(modified))
}

#[cfg(test)]
mod tests {
    use axum::{Router, http::StatusCode, routing::get};
    use tower::ServiceExt;

    use super::*;
    use crate::auth::SsoError;

    fn app() -> Router {
        Router::new()
            .route("/ok", get(|| async { "ok" }))
            .route(
                "/fail",
                get(|| async { SsoError::State("state mismatch".into()) }),
            )
            .layer(axum::middleware::from_fn(request_id_middleware))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_request_id_generation() {
        assert_ne!(RequestId::new().0, RequestId::new().0);
    }

    #[tokio::test]
    async fn test_inbound_id_is_propagated() {
        let request = Request::builder()
            .uri("/ok")
            .header(REQUEST_ID_HEADER, "req-123")
            .body(Body::empty())
            .unwrap();
        let response = app().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[REQUEST_ID_HEADER], "req-123");
    }

    #[tokio::test]
    async fn test_oversized_inbound_id_is_replaced() {
        let request = Request::builder()
            .uri("/ok")
            .header(REQUEST_ID_HEADER, "x".repeat(MAX_REQUEST_ID_LEN + 1))
            .body(Body::empty())
            .unwrap();
        let response = app().oneshot(request).await.unwrap();

        let id = response.headers()[REQUEST_ID_HEADER].to_str().unwrap();
        assert!(Uuid::parse_str(id).is_ok());
    }

    #[tokio::test]
    async fn test_error_body_gets_request_id() {
        let request = Request::builder()
            .uri("/fail")
            .header(REQUEST_ID_HEADER, "req-err")
            .body(Body::empty())
            .unwrap();
        let response = app().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"]["request_id"], "req-err");
        assert_eq!(json["error"]["code"], "state_error");
    }

    #[tokio::test]
    async fn test_non_json_error_is_untouched() {
        let response = (StatusCode::BAD_REQUEST, "Bad Request").into_response();
        let modified = inject_request_id_into_error(response, &RequestId::new()).await;
        let bytes = axum::body::to_bytes(modified.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"Bad Request");
    }
}
