//! OpenID Connect authorization-code login.
//!
//! Endpoints and signing keys come from the issuer's discovery document via
//! the shared [`DiscoveryCache`]. The nonce sent to the IdP is the state
//! token itself, so the flow needs no server-side storage: the state cookie
//! already binds the callback to the browser that started it.

use std::sync::Arc;

use serde_json::{Map, Value};
use subtle::ConstantTimeEq;
use url::Url;

use super::{
    CallbackParams, DiscoveryCache, ProviderContext, SsoError,
    jwt::verify_id_token,
    map_identity,
    oauth2::{exchange_code, fetch_userinfo},
};
use crate::models::{OidcConfig, SsoUser};

/// User-info claims that replace the ID token's values instead of only
/// filling gaps. IdPs often omit or truncate these in the ID token.
const USERINFO_OVERRIDES: &[&str] = &["email", "groups"];

fn validate_oidc_config(config: &OidcConfig) -> Result<(), SsoError> {
    if config.issuer_url.trim().is_empty() {
        return Err(SsoError::missing_field("oidc.issuer_url"));
    }
    Url::parse(&config.issuer_url)
        .map_err(|e| SsoError::Configuration(format!("invalid oidc.issuer_url: {e}")))?;
    if config.client_id.trim().is_empty() {
        return Err(SsoError::missing_field("oidc.client_id"));
    }
    if config.client_secret.trim().is_empty() {
        return Err(SsoError::missing_field("oidc.client_secret"));
    }
    if config.scopes.is_empty() {
        return Err(SsoError::Configuration(
            "at least one scope is required".to_string(),
        ));
    }
    if !config.scopes.iter().any(|s| s == "openid") {
        return Err(SsoError::Configuration(
            "scopes must include \"openid\"".to_string(),
        ));
    }
    Ok(())
}

/// Merge user-info claims into the ID token claims.
fn merge_userinfo(claims: &mut Map<String, Value>, userinfo: Map<String, Value>) {
    for (key, value) in userinfo {
        if USERINFO_OVERRIDES.contains(&key.as_str()) || !claims.contains_key(&key) {
            claims.insert(key, value);
        }
    }
}

pub struct OidcProvider {
    ctx: ProviderContext,
    config: OidcConfig,
    redirect_uri: String,
    http: reqwest::Client,
    discovery: Arc<DiscoveryCache>,
}

impl OidcProvider {
    pub fn new(
        ctx: ProviderContext,
        config: OidcConfig,
        base_url: &str,
        http: reqwest::Client,
        discovery: Arc<DiscoveryCache>,
    ) -> Self {
        let redirect_uri = config
            .redirect_url
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| {
                format!(
                    "{}/auth/sso/{}/callback",
                    base_url.trim_end_matches('/'),
                    ctx.name
                )
            });

        Self {
            ctx,
            config,
            redirect_uri,
            http,
            discovery,
        }
    }

    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    pub fn issuer_url(&self) -> &str {
        &self.config.issuer_url
    }

    pub fn validate_config(&self) -> Result<(), SsoError> {
        validate_oidc_config(&self.config)
    }

    pub async fn initiate_login(&self, state: &str) -> Result<String, SsoError> {
        let metadata = self.discovery.get(&self.config.issuer_url).await?;

        let mut url = Url::parse(&metadata.discovery.authorization_endpoint).map_err(|e| {
            SsoError::Protocol(format!("invalid authorization endpoint: {e}"))
        })?;

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("response_type", "code");
            query.append_pair("client_id", &self.config.client_id);
            query.append_pair("redirect_uri", &self.redirect_uri);
            query.append_pair("scope", &self.config.scopes.join(" "));
            query.append_pair("state", state);
            query.append_pair("nonce", state);
        }

        Ok(url.to_string())
    }

    pub async fn handle_callback(&self, params: &CallbackParams) -> Result<SsoUser, SsoError> {
        params.check_idp_error()?;
        let code = params.require_code()?;
        let state = params
            .returned_state()
            .ok_or_else(|| SsoError::State("missing state parameter".to_string()))?;

        let metadata = self.discovery.get(&self.config.issuer_url).await?;

        let tokens = exchange_code(
            &self.http,
            &metadata.discovery.token_endpoint,
            code,
            &self.redirect_uri,
            &self.config.client_id,
            &self.config.client_secret,
        )
        .await?;

        let id_token = tokens
            .id_token
            .as_deref()
            .ok_or_else(|| SsoError::Protocol("token response has no id_token".to_string()))?;

        let mut claims = verify_id_token(
            &self.discovery,
            &metadata.discovery.issuer,
            &self.config.client_id,
            id_token,
        )
        .await?;

        let nonce_matches = claims
            .get("nonce")
            .and_then(Value::as_str)
            .is_some_and(|nonce| bool::from(nonce.as_bytes().ct_eq(state.as_bytes())));
        if !nonce_matches {
            tracing::warn!(provider = %self.ctx.name, "ID token nonce does not match state");
            return Err(SsoError::Protocol("ID token nonce mismatch".to_string()));
        }

        let subject = claims
            .get("sub")
            .and_then(Value::as_str)
            .map(String::from);

        if let Some(userinfo_url) = self.config.userinfo_url.as_deref().filter(|s| !s.is_empty()) {
            let userinfo = fetch_userinfo(&self.http, userinfo_url, &tokens.access_token).await?;
            merge_userinfo(&mut claims, userinfo);
        }

        map_identity(&self.ctx, claims, subject.as_deref(), None)
    }

    /// The IdP's end-session endpoint, if discovery advertises one.
    pub async fn logout(&self) -> Option<String> {
        match self.discovery.get(&self.config.issuer_url).await {
            Ok(metadata) => metadata.discovery.end_session_endpoint.clone(),
            Err(e) => {
                tracing::warn!(provider = %self.ctx.name, error = %e, "OIDC logout discovery failed");
                None
            }
        }
    }
}
