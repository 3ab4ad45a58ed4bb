//! Browser-facing SSO flow.
//!
//! - `GET /auth/sso/{provider}/login` - Starts a login and redirects to the IdP
//! - `GET|POST /auth/sso/{provider}/callback` - Verifies the IdP response,
//!   provisions the user and issues a session
//! - `GET|POST /auth/sso/logout` - Ends the local session and, where the IdP
//!   supports it, redirects to the IdP's logout endpoint
//! - `GET /sso/metadata/{provider}` - SAML service provider metadata
//!
//! The login step stores the CSRF state, the provider name and the return URL
//! in short-lived cookies. The callback checks the returned state against the
//! cookie before any provider code runs.

use axum::{
    Form,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tower_cookies::{
    Cookie, Cookies,
    cookie::{SameSite, time::Duration as CookieDuration},
};

use crate::{
    AppState,
    auth::{CallbackParams, ProviderContext, SamlProvider, SsoError, random_token},
    models::{ProviderType, SsoSession},
};

pub const STATE_COOKIE: &str = "sso_state";
pub const PROVIDER_COOKIE: &str = "sso_provider";
pub const RETURN_URL_COOKIE: &str = "sso_return_url";
pub const SESSION_COOKIE: &str = "sso_session";

/// `302 Found` to `location`.
///
/// axum's `Redirect::to` answers 303, which some IdP-initiated POST flows and
/// older clients treat differently.
fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

fn build_cookie(
    name: &'static str,
    value: String,
    max_age: std::time::Duration,
    secure: bool,
) -> Cookie<'static> {
    Cookie::build((name, value))
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .max_age(CookieDuration::seconds(
            i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX),
        ))
        .build()
}

/// Removal cookie with the same attributes as the one that set the value.
fn build_removal_cookie(name: &'static str, secure: bool) -> Cookie<'static> {
    Cookie::build(name)
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .max_age(CookieDuration::ZERO)
        .build()
}

/// Only same-origin relative paths are accepted as return URLs. Anything
/// else (absolute URLs, `//host`, `/\host`) is dropped.
pub(crate) fn safe_return_url(url: Option<&str>) -> Option<String> {
    url.filter(|u| u.starts_with('/') && !u.starts_with("//") && !u.starts_with("/\\"))
        .map(String::from)
}

fn states_match(expected: &str, returned: &str) -> bool {
    expected.as_bytes().ct_eq(returned.as_bytes()).into()
}

fn cookie_value(cookies: &Cookies, name: &str) -> Option<String> {
    cookies
        .get(name)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
}

/// Query parameters for the login endpoint.
#[derive(Debug, Deserialize)]
pub struct LoginQuery {
    /// Where to send the browser after a successful login.
    #[serde(default)]
    pub return_url: Option<String>,
}

/// Start a login: mint a state token, remember it in cookies and redirect to
/// the IdP.
#[tracing::instrument(name = "sso.login", skip(state, cookies, query), fields(%provider))]
pub async fn login(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<LoginQuery>,
    cookies: Cookies,
) -> Result<Response, SsoError> {
    let config = state.services.provider_configs.get(&provider).await?;
    if !config.enabled {
        return Err(SsoError::ProviderDisabled(config.name));
    }

    let sso = state.factory.create(&config).await?;
    let state_token = random_token();
    let auth_url = sso.initiate_login(&state_token).await?;

    let session_config = &state.config.session;
    let ttl = session_config.login_state();
    let secure = session_config.secure;

    cookies.add(build_cookie(STATE_COOKIE, state_token, ttl, secure));
    cookies.add(build_cookie(PROVIDER_COOKIE, config.name.clone(), ttl, secure));
    match safe_return_url(query.return_url.as_deref()) {
        Some(return_url) => cookies.add(build_cookie(RETURN_URL_COOKIE, return_url, ttl, secure)),
        // A stale return URL from an abandoned login must not be reused
        None => cookies.remove(build_removal_cookie(RETURN_URL_COOKIE, secure)),
    }

    tracing::info!(
        provider_type = %config.provider_type,
        "Redirecting to identity provider"
    );

    Ok(found(&auth_url))
}

/// Callback for IdPs that return parameters in the query string (OAuth2, OIDC).
pub async fn callback_query(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    cookies: Cookies,
    Query(params): Query<CallbackParams>,
) -> Result<Response, SsoError> {
    complete_login(state, provider, params, cookies).await
}

/// Callback for IdPs that POST a form (SAML HTTP-POST binding).
pub async fn callback_form(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    cookies: Cookies,
    Form(params): Form<CallbackParams>,
) -> Result<Response, SsoError> {
    complete_login(state, provider, params, cookies).await
}

/// Check the returned state against the login cookies. Runs before any
/// provider is loaded.
fn verify_state(cookies: &Cookies, provider: &str, params: &CallbackParams) -> Result<(), SsoError> {
    let expected = cookie_value(cookies, STATE_COOKIE)
        .ok_or_else(|| SsoError::State("missing state cookie".to_string()))?;
    let returned = params
        .returned_state()
        .ok_or_else(|| SsoError::State("missing state parameter".to_string()))?;

    if !states_match(&expected, returned) {
        tracing::warn!("SSO state mismatch");
        return Err(SsoError::State("state mismatch".to_string()));
    }

    if cookie_value(cookies, PROVIDER_COOKIE).as_deref() != Some(provider) {
        tracing::warn!("SSO callback provider does not match the login provider");
        return Err(SsoError::State("provider mismatch".to_string()));
    }

    Ok(())
}

#[tracing::instrument(name = "sso.callback", skip(state, params, cookies), fields(%provider))]
async fn complete_login(
    state: AppState,
    provider: String,
    params: CallbackParams,
    cookies: Cookies,
) -> Result<Response, SsoError> {
    let secure = state.config.session.secure;

    verify_state(&cookies, &provider, &params)?;

    // The state is single-use whatever happens next
    let return_url = cookie_value(&cookies, RETURN_URL_COOKIE)
        .and_then(|url| safe_return_url(Some(&url)));
    for name in [STATE_COOKIE, PROVIDER_COOKIE, RETURN_URL_COOKIE] {
        cookies.remove(build_removal_cookie(name, secure));
    }

    let config = state.services.provider_configs.get(&provider).await?;
    let sso = state.factory.create(&config).await?;
    let sso_user = sso.handle_callback(&params).await?;

    let user = state
        .services
        .provisioning
        .provision_user(&sso_user, &config)
        .await?;

    let session = state
        .services
        .sessions
        .create(
            config.id,
            user.id,
            &sso_user.external_id,
            sso_user.session_index.clone(),
        )
        .await
        .map_err(|e| SsoError::Internal(format!("failed to create session: {e}")))?;

    cookies.add(build_cookie(
        SESSION_COOKIE,
        session.id,
        state.config.session.duration(),
        secure,
    ));

    tracing::info!(
        user_id = %user.id,
        external_id = %sso_user.external_id,
        groups = sso_user.groups.len(),
        "SSO login completed"
    );

    Ok(found(return_url.as_deref().unwrap_or("/")))
}

/// End the local session and hand off to the IdP's logout, if it has one.
///
/// Never fails: storage and IdP errors are logged and the browser is sent to `/`.
#[tracing::instrument(name = "sso.logout", skip(state, cookies))]
pub async fn logout(State(state): State<AppState>, cookies: Cookies) -> Response {
    let session_id = cookie_value(&cookies, SESSION_COOKIE);
    cookies.remove(build_removal_cookie(SESSION_COOKIE, state.config.session.secure));

    let Some(session_id) = session_id else {
        return found("/");
    };

    let session = match state.services.sessions.get(&session_id).await {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to load session during logout");
            None
        }
    };

    if let Err(e) = state.services.sessions.delete(&session_id).await {
        tracing::warn!(error = %e, "Failed to delete session during logout");
    }

    let Some(session) = session else {
        return found("/");
    };

    tracing::info!(user_id = %session.user_id, "SSO session ended");

    match idp_logout_url(&state, &session).await {
        Some(url) => found(&url),
        None => found("/"),
    }
}

/// Best-effort IdP logout for the provider that issued `session`.
async fn idp_logout_url(state: &AppState, session: &SsoSession) -> Option<String> {
    let config = match state
        .services
        .provider_configs
        .get_by_id(session.provider_id)
        .await
    {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(provider_id = session.provider_id, error = %e, "Skipping IdP logout");
            return None;
        }
    };

    let sso = match state.factory.create(&config).await {
        Ok(sso) => sso,
        Err(e) => {
            tracing::warn!(provider = %config.name, error = %e, "Skipping IdP logout");
            return None;
        }
    };

    match sso
        .logout(&session.external_id, session.session_index.as_deref())
        .await
    {
        Ok(url) => url,
        Err(e) => {
            tracing::warn!(provider = %config.name, error = %e, "IdP logout failed");
            None
        }
    }
}

/// SAML service provider metadata for configuring the IdP side.
///
/// Served for disabled providers too, so the IdP can be set up before the
/// provider is switched on.
#[tracing::instrument(name = "sso.metadata", skip(state), fields(%provider))]
pub async fn metadata(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Result<Response, SsoError> {
    let config = state.services.provider_configs.get(&provider).await?;

    if config.provider_type != ProviderType::Saml {
        return Err(SsoError::Configuration(format!(
            "provider '{}' is not a SAML provider",
            config.name
        )));
    }
    let saml = config
        .saml
        .clone()
        .ok_or_else(|| SsoError::missing_field("saml"))?;

    let sp = SamlProvider::new(
        ProviderContext::from(&config),
        saml,
        state.factory.base_url(),
    );

    Ok((
        [(header::CONTENT_TYPE, "application/samlmetadata+xml")],
        sp.metadata(),
    )
        .into_response())
}
