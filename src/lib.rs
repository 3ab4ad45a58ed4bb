//! SSO federation service.
//!
//! Lets users sign in through external identity providers (SAML 2.0, OAuth2,
//! OpenID Connect), provisions them on first login and issues local sessions.
//! Provider configurations live in SQLite and are managed over HTTP.

pub mod auth;
pub mod config;
pub mod db;
pub mod jobs;
pub mod middleware;
pub mod models;
pub mod observability;
pub mod routes;
pub mod services;

use std::sync::Arc;

use axum::{Router, routing::get};
use tower_cookies::CookieManagerLayer;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

use crate::{
    auth::{DiscoveryCache, ProviderFactory},
    config::SsoServiceConfig,
    db::{DbError, DbPool},
    services::Services,
};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<SsoServiceConfig>,
    pub db: Arc<DbPool>,
    pub services: Services,
    pub factory: ProviderFactory,
}

/// Errors that prevent the service from starting.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] DbError),
}

impl AppState {
    /// Connect to the configured database, run migrations when enabled and
    /// build the shared state.
    pub async fn new(config: SsoServiceConfig) -> Result<Self, StartupError> {
        let db = DbPool::from_config(&config.database).await?;
        if config.database.run_migrations() {
            db.run_migrations().await?;
        }
        Self::with_db(config, Arc::new(db))
    }

    /// Build the shared state over an existing database pool.
    pub fn with_db(config: SsoServiceConfig, db: Arc<DbPool>) -> Result<Self, StartupError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.server.http_timeout())
            .build()?;

        tracing::debug!(
            timeout_secs = config.server.http_timeout_secs,
            discovery_ttl_secs = config.oidc.discovery_ttl_secs,
            "Built identity provider HTTP client"
        );

        let discovery = Arc::new(DiscoveryCache::new(
            http_client.clone(),
            config.oidc.discovery_ttl(),
        ));
        let factory = ProviderFactory::new(http_client, config.base_url(), discovery);
        let services = Services::new(db.clone(), factory.clone(), config.session.duration());

        Ok(Self {
            config: Arc::new(config),
            db,
            services,
            factory,
        })
    }
}

/// Assemble the router with every route and the shared middleware stack.
pub fn build_app(config: &SsoServiceConfig, state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health::health_check))
        .merge(routes::sso_routes())
        .nest("/sso/providers", routes::provider_routes())
        .layer(axum::middleware::from_fn(middleware::request_id_middleware))
        .layer(CookieManagerLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(config.server.body_limit_bytes))
        .with_state(state)
}

/// State over a fresh in-memory database, for handler tests.
#[cfg(test)]
pub(crate) async fn test_state() -> AppState {
    let config = SsoServiceConfig::from_str(
        r#"
        [server]
        base_url = "https://sso.example.com"
    "#,
    )
    .expect("test config should parse");
    let db = Arc::new(DbPool::from_sqlite(db::sqlite::test_pool().await));
    AppState::with_db(config, db).expect("test state should build")
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    use super::*;

    #[tokio::test]
    async fn test_health() {
        let state = test_state().await;
        let app = build_app(&state.config.clone(), state);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(middleware::REQUEST_ID_HEADER));
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_body_limit() {
        let state = test_state().await;
        let mut config = (*state.config).clone();
        config.server.body_limit_bytes = 64;
        let app = build_app(&config, state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/sso/providers")
                    .header("content-type", "application/json")
                    .header("content-length", "1024")
                    .body(Body::from(vec![b' '; 1024]))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
