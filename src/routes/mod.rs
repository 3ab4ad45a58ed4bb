pub mod health;
pub mod providers;
pub mod sso;

use axum::{
    Router,
    http::{HeaderValue, header},
    routing::{get, post},
};
use tower_http::set_header::SetResponseHeaderLayer;

use crate::AppState;

/// Browser-facing login, callback, logout and metadata routes.
pub fn sso_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/sso/{provider}/login", get(sso::login))
        .route(
            "/auth/sso/{provider}/callback",
            get(sso::callback_query).post(sso::callback_form),
        )
        .route("/auth/sso/logout", get(sso::logout).post(sso::logout))
        .route("/sso/metadata/{provider}", get(sso::metadata))
        // Redirects carry one-time state and must never be replayed from a cache
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
}

/// Provider configuration management, mounted under `/sso/providers`.
pub fn provider_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(providers::list).post(providers::create))
        .route("/presets/{vendor}", post(providers::create_from_preset))
        .route(
            "/{name}",
            get(providers::get)
                .post(providers::update)
                .put(providers::update)
                .delete(providers::delete),
        )
}
