//! OAuth2 authorization-code login against a provider that exposes a
//! user-info endpoint but no ID tokens.

use serde::Deserialize;
use serde_json::{Map, Value};
use url::Url;

use super::{CallbackParams, ProviderContext, SsoError, map_identity};
use crate::models::{OAuth2Config, SsoUser};

/// Token endpoint response. OIDC adds `id_token`.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
}

/// Exchange an authorization code at the token endpoint (form POST with
/// client credentials in the body).
pub(crate) async fn exchange_code(
    http: &reqwest::Client,
    token_url: &str,
    code: &str,
    redirect_uri: &str,
    client_id: &str,
    client_secret: &str,
) -> Result<TokenResponse, SsoError> {
    let response = http
        .post(token_url)
        .header(reqwest::header::ACCEPT, "application/json")
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", client_id),
            ("client_secret", client_secret),
        ])
        .send()
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to reach token endpoint");
            SsoError::Protocol(format!("token exchange failed: {e}"))
        })?;

    if !response.status().is_success() {
        let status = response.status();
        tracing::warn!(status = %status, "Token endpoint returned error");
        return Err(SsoError::Protocol(format!(
            "token exchange failed: {status}"
        )));
    }

    response
        .json()
        .await
        .map_err(|e| SsoError::Protocol(format!("invalid token response: {e}")))
}

/// Fetch the user-info document with a bearer token.
pub(crate) async fn fetch_userinfo(
    http: &reqwest::Client,
    userinfo_url: &str,
    access_token: &str,
) -> Result<Map<String, Value>, SsoError> {
    let response = http
        .get(userinfo_url)
        .bearer_auth(access_token)
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await
        .map_err(|e| SsoError::Protocol(format!("user-info request failed: {e}")))?;

    if !response.status().is_success() {
        return Err(SsoError::Protocol(format!(
            "user-info request failed: {}",
            response.status()
        )));
    }

    response
        .json()
        .await
        .map_err(|e| SsoError::Protocol(format!("invalid user-info response: {e}")))
}

/// Check every required OAuth2 field, naming the first one that is missing.
fn validate_oauth2_config(config: &OAuth2Config) -> Result<(), SsoError> {
    if config.client_id.trim().is_empty() {
        return Err(SsoError::missing_field("oauth2.client_id"));
    }
    if config.client_secret.trim().is_empty() {
        return Err(SsoError::missing_field("oauth2.client_secret"));
    }
    if config.authorization_url.trim().is_empty() {
        return Err(SsoError::missing_field("oauth2.authorization_url"));
    }
    Url::parse(&config.authorization_url)
        .map_err(|e| SsoError::Configuration(format!("invalid oauth2.authorization_url: {e}")))?;
    if config.token_url.trim().is_empty() {
        return Err(SsoError::missing_field("oauth2.token_url"));
    }
    Url::parse(&config.token_url)
        .map_err(|e| SsoError::Configuration(format!("invalid oauth2.token_url: {e}")))?;
    Ok(())
}

pub struct OAuth2Provider {
    ctx: ProviderContext,
    config: OAuth2Config,
    redirect_uri: String,
    http: reqwest::Client,
}

impl OAuth2Provider {
    pub fn new(
        ctx: ProviderContext,
        config: OAuth2Config,
        base_url: &str,
        http: reqwest::Client,
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
        }
    }

    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    pub fn validate_config(&self) -> Result<(), SsoError> {
        validate_oauth2_config(&self.config)
    }

    pub fn initiate_login(&self, state: &str) -> Result<String, SsoError> {
        let mut url = Url::parse(&self.config.authorization_url).map_err(|e| {
            SsoError::Configuration(format!("invalid oauth2.authorization_url: {e}"))
        })?;

        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("scope", &self.config.scopes.join(" "))
            .append_pair("state", state)
            .append_pair("access_type", "offline");

        Ok(url.to_string())
    }

    pub async fn handle_callback(&self, params: &CallbackParams) -> Result<SsoUser, SsoError> {
        params.check_idp_error()?;
        let code = params.require_code()?;

        // Without user-info there is no way to learn who logged in
        let userinfo_url = self
            .config
            .userinfo_url
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SsoError::missing_field("oauth2.userinfo_url"))?;

        let tokens = exchange_code(
            &self.http,
            &self.config.token_url,
            code,
            &self.redirect_uri,
            &self.config.client_id,
            &self.config.client_secret,
        )
        .await?;

        let attributes = fetch_userinfo(&self.http, userinfo_url, &tokens.access_token).await?;

        tracing::debug!(
            provider = %self.ctx.name,
            claims = attributes.len(),
            "Fetched OAuth2 user-info"
        );

        map_identity(&self.ctx, attributes, None, None)
    }
}
