//! Identity-provider protocols.
//!
//! Each supported protocol (SAML 2.0, OAuth2, OpenID Connect) is a concrete
//! provider type; [`SsoProvider`] is the closed set the orchestrator works
//! with. Providers never touch cookies or the database: they turn a state
//! token into an IdP redirect URL, and an IdP callback into an [`SsoUser`].

pub mod discovery;
mod error;
pub mod factory;
pub mod jwt;
pub mod oauth2;
pub mod oidc;
pub mod presets;
pub mod saml;
#[cfg(test)]
pub(crate) mod test_support;
mod xmldsig;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::{RngCore, rngs::OsRng};
use serde::Deserialize;
use serde_json::{Map, Value};

pub use discovery::{DiscoveryCache, IssuerMetadata, OidcDiscovery};
pub use error::{ErrorInfo, ErrorResponse, SsoError};
pub use factory::ProviderFactory;
pub use oauth2::OAuth2Provider;
pub use oidc::OidcProvider;
pub use presets::ProviderPreset;
pub use saml::SamlProvider;

use crate::models::{AttributeMap, ProviderConfig, ProviderType, SsoUser};

/// Generate an opaque, URL-safe random token from 32 bytes of OS entropy.
///
/// Used for both CSRF state tokens and session identifiers.
pub fn random_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

// ─────────────────────────────────────────────────────────────────────────────
// Callback parameters
// ─────────────────────────────────────────────────────────────────────────────

/// Parameters an IdP sends back to the callback endpoint, from either the
/// query string (OAuth2/OIDC) or an HTTP-POST form (SAML).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default, rename = "SAMLResponse")]
    pub saml_response: Option<String>,
    #[serde(default, rename = "RelayState")]
    pub relay_state: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl CallbackParams {
    /// The state token returned by the IdP: `state` for OAuth2/OIDC,
    /// `RelayState` for SAML.
    pub fn returned_state(&self) -> Option<&str> {
        self.state
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.relay_state.as_deref().filter(|s| !s.is_empty()))
    }

    /// Fail with a protocol error if the IdP reported one.
    pub(crate) fn check_idp_error(&self) -> Result<(), SsoError> {
        match &self.error {
            Some(error) => {
                let description = self.error_description.as_deref().unwrap_or_default();
                tracing::warn!(error = %error, description = %description, "IdP returned an error");
                if description.is_empty() {
                    Err(SsoError::Protocol(format!("identity provider error: {error}")))
                } else {
                    Err(SsoError::Protocol(format!(
                        "identity provider error: {error}: {description}"
                    )))
                }
            }
            None => Ok(()),
        }
    }

    /// The non-empty authorization code, or a protocol error.
    pub(crate) fn require_code(&self) -> Result<&str, SsoError> {
        self.code
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| SsoError::Protocol("missing authorization code".to_string()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Provider abstraction
// ─────────────────────────────────────────────────────────────────────────────

/// Identity of the configured provider a protocol handler is acting for.
#[derive(Debug, Clone)]
pub struct ProviderContext {
    pub provider_id: i64,
    pub name: String,
    pub attribute_map: AttributeMap,
}

impl From<&ProviderConfig> for ProviderContext {
    fn from(config: &ProviderConfig) -> Self {
        Self {
            provider_id: config.id,
            name: config.name.clone(),
            attribute_map: config.attribute_map.clone(),
        }
    }
}

/// A ready-to-use identity provider, selected by [`ProviderFactory::create`].
pub enum SsoProvider {
    Saml(SamlProvider),
    OAuth2(OAuth2Provider),
    Oidc(OidcProvider),
}

impl SsoProvider {
    pub fn provider_type(&self) -> ProviderType {
        match self {
            SsoProvider::Saml(_) => ProviderType::Saml,
            SsoProvider::OAuth2(_) => ProviderType::Oauth2,
            SsoProvider::Oidc(_) => ProviderType::Oidc,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            SsoProvider::Saml(p) => p.name(),
            SsoProvider::OAuth2(p) => p.name(),
            SsoProvider::Oidc(p) => p.name(),
        }
    }

    /// Build the IdP redirect URL that starts a login bound to `state`.
    ///
    /// OIDC may need to fetch the issuer's discovery document first.
    pub async fn initiate_login(&self, state: &str) -> Result<String, SsoError> {
        match self {
            SsoProvider::Saml(p) => p.initiate_login(state),
            SsoProvider::OAuth2(p) => p.initiate_login(state),
            SsoProvider::Oidc(p) => p.initiate_login(state).await,
        }
    }

    /// Verify an IdP callback and extract the authenticated identity.
    ///
    /// `params.state` must already have been checked against the state cookie.
    pub async fn handle_callback(&self, params: &CallbackParams) -> Result<SsoUser, SsoError> {
        match self {
            SsoProvider::Saml(p) => p.handle_callback(params),
            SsoProvider::OAuth2(p) => p.handle_callback(params).await,
            SsoProvider::Oidc(p) => p.handle_callback(params).await,
        }
    }

    /// Best-effort IdP logout. Returns a URL to redirect the browser to, if any.
    pub async fn logout(
        &self,
        name_id: &str,
        session_index: Option<&str>,
    ) -> Result<Option<String>, SsoError> {
        match self {
            SsoProvider::Saml(p) => p.logout(name_id, session_index),
            SsoProvider::OAuth2(_) => Ok(None),
            SsoProvider::Oidc(p) => Ok(p.logout().await),
        }
    }

    pub fn validate_config(&self) -> Result<(), SsoError> {
        match self {
            SsoProvider::Saml(p) => p.validate_config(),
            SsoProvider::OAuth2(p) => p.validate_config(),
            SsoProvider::Oidc(p) => p.validate_config(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Identity mapping
// ─────────────────────────────────────────────────────────────────────────────

/// Render a scalar attribute value as a string. Arrays yield their first
/// element; empty strings count as absent.
fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(values) => values.iter().find_map(scalar),
        _ => None,
    }
}

fn lookup(attrs: &Map<String, Value>, key: &str) -> Option<String> {
    if key.is_empty() {
        return None;
    }
    attrs.get(key).and_then(scalar)
}

/// Groups may arrive as an array or as a single string.
fn lookup_groups(attrs: &Map<String, Value>, key: &str) -> Vec<String> {
    if key.is_empty() {
        return Vec::new();
    }
    match attrs.get(key) {
        Some(Value::Array(values)) => values.iter().filter_map(scalar).collect(),
        Some(value) => scalar(value).into_iter().collect(),
        None => Vec::new(),
    }
}

/// Map a raw attribute/claim bag onto an [`SsoUser`] using the provider's
/// attribute map.
///
/// `fallback_id` is the protocol's intrinsic subject (SAML NameID, OIDC
/// `sub`) and is used when the mapped user-id attribute is absent.
pub fn map_identity(
    ctx: &ProviderContext,
    attributes: Map<String, Value>,
    fallback_id: Option<&str>,
    session_index: Option<String>,
) -> Result<SsoUser, SsoError> {
    let map = &ctx.attribute_map;

    let external_id = lookup(&attributes, &map.user_id)
        .or_else(|| fallback_id.filter(|s| !s.is_empty()).map(String::from))
        .ok_or_else(|| {
            SsoError::Protocol(format!("missing required attribute: {}", map.user_id))
        })?;

    let email = lookup(&attributes, &map.email).ok_or_else(|| {
        SsoError::Protocol(format!("missing required attribute: {}", map.email))
    })?;

    let username = lookup(&attributes, &map.username).unwrap_or_else(|| email.clone());

    Ok(SsoUser {
        provider_id: ctx.provider_id,
        provider_name: ctx.name.clone(),
        external_id,
        username,
        email,
        full_name: lookup(&attributes, &map.full_name),
        first_name: lookup(&attributes, &map.first_name),
        last_name: lookup(&attributes, &map.last_name),
        groups: lookup_groups(&attributes, &map.groups),
        attributes,
        session_index,
    })
}
