use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use super::Role;

/// Provider names appear in URLs (`/auth/sso/{name}/login`), so they are
/// restricted to lowercase slugs.
pub static PROVIDER_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]{0,63}$").unwrap());

pub fn validate_provider_name(name: &str) -> Result<(), ValidationError> {
    if PROVIDER_NAME_REGEX.is_match(name) {
        Ok(())
    } else {
        let mut err = ValidationError::new("invalid_provider_name");
        err.message = Some(
            "Provider names must be 1-64 lowercase letters, digits, '-' or '_'".into(),
        );
        Err(err)
    }
}

/// Federation protocol spoken by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// SAML 2.0 (HTTP-Redirect request, HTTP-POST response)
    Saml,
    /// OAuth2 authorization-code grant with a user-info endpoint
    Oauth2,
    /// OpenID Connect (OAuth2 + discovery + signed ID tokens)
    Oidc,
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderType::Saml => write!(f, "saml"),
            ProviderType::Oauth2 => write!(f, "oauth2"),
            ProviderType::Oidc => write!(f, "oidc"),
        }
    }
}

impl std::str::FromStr for ProviderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "saml" => Ok(ProviderType::Saml),
            "oauth2" => Ok(ProviderType::Oauth2),
            "oidc" => Ok(ProviderType::Oidc),
            _ => Err(format!("Invalid SSO provider type: {}", s)),
        }
    }
}

/// Identity vendor tag. Only used to drive UI presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderVendor {
    #[default]
    Generic,
    AzureAd,
    Okta,
    Google,
}

impl std::fmt::Display for ProviderVendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderVendor::Generic => write!(f, "generic"),
            ProviderVendor::AzureAd => write!(f, "azure_ad"),
            ProviderVendor::Okta => write!(f, "okta"),
            ProviderVendor::Google => write!(f, "google"),
        }
    }
}

impl std::str::FromStr for ProviderVendor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "generic" => Ok(ProviderVendor::Generic),
            "azure_ad" | "azuread" | "azure" => Ok(ProviderVendor::AzureAd),
            "okta" => Ok(ProviderVendor::Okta),
            "google" => Ok(ProviderVendor::Google),
            _ => Err(format!("Invalid SSO provider vendor: {}", s)),
        }
    }
}

/// Names of the external claims/attributes that carry each identity field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributeMap {
    /// Stable external user identifier (required)
    pub user_id: String,
    pub username: String,
    /// Email address (required)
    pub email: String,
    pub full_name: String,
    pub first_name: String,
    pub last_name: String,
    /// Multi-valued group membership attribute
    pub groups: String,
}

impl Default for AttributeMap {
    fn default() -> Self {
        Self {
            user_id: "sub".to_string(),
            username: "preferred_username".to_string(),
            email: "email".to_string(),
            full_name: "name".to_string(),
            first_name: "given_name".to_string(),
            last_name: "family_name".to_string(),
            groups: "groups".to_string(),
        }
    }
}

/// One IdP group to internal role mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMap {
    pub group: String,
    pub role: Role,
}

impl GroupMap {
    pub fn new(group: impl Into<String>, role: Role) -> Self {
        Self {
            group: group.into(),
            role,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Protocol-specific blocks
// ─────────────────────────────────────────────────────────────────────────────

/// SAML 2.0 identity provider settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamlConfig {
    /// IdP entity identifier (e.g., "https://idp.example.com/metadata")
    #[serde(default)]
    pub idp_entity_id: String,
    /// IdP Single Sign-On service URL (HTTP-Redirect binding)
    #[serde(default)]
    pub idp_sso_url: String,
    /// IdP Single Logout service URL. Without it logout is local only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idp_slo_url: Option<String>,
    /// Trusted IdP signing certificate(s), PEM. Several certificates may be
    /// concatenated to cover a rotation window.
    #[serde(default)]
    pub idp_certificate: String,
    /// SP entity ID override. Defaults to `{base_url}/sso/metadata/{name}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sp_entity_id: Option<String>,
    /// SP certificate published in metadata (PEM)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sp_certificate: Option<String>,
    /// SP private key used to sign requests (PEM). Secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sp_private_key: Option<String>,
    #[serde(default)]
    pub sign_requests: bool,
    #[serde(default)]
    pub force_authn: bool,
    /// NameID format to request (e.g., 'urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress')
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_id_format: Option<String>,
}

/// Plain OAuth2 authorization-code settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuth2Config {
    #[serde(default)]
    pub client_id: String,
    /// Secret. Never returned by the admin API.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_secret: String,
    #[serde(default)]
    pub authorization_url: String,
    #[serde(default)]
    pub token_url: String,
    /// Required at callback time; OAuth2 has no other source of identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userinfo_url: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Defaults to `{base_url}/auth/sso/{name}/callback`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
}

/// OpenID Connect settings. Endpoints come from discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OidcConfig {
    #[serde(default)]
    pub issuer_url: String,
    #[serde(default)]
    pub client_id: String,
    /// Secret. Never returned by the admin API.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_secret: String,
    #[serde(default = "default_oidc_scopes")]
    pub scopes: Vec<String>,
    /// Optional user-info endpoint whose claims are merged into the ID token claims.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userinfo_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
}

impl Default for OidcConfig {
    fn default() -> Self {
        Self {
            issuer_url: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            scopes: default_oidc_scopes(),
            userinfo_url: None,
            redirect_url: None,
        }
    }
}

pub fn default_oidc_scopes() -> Vec<String> {
    vec!["openid".into(), "email".into(), "profile".into()]
}

fn default_true() -> bool {
    true
}

// ─────────────────────────────────────────────────────────────────────────────
// Provider configuration
// ─────────────────────────────────────────────────────────────────────────────

/// A stored identity provider.
///
/// Exactly one of `saml`, `oauth2`, `oidc` is populated and it matches
/// `provider_type`. This type carries secrets and must not be returned by
/// the HTTP API directly; use [`ProviderConfigResponse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: i64,
    pub name: String,
    pub provider_type: ProviderType,
    pub vendor: ProviderVendor,
    pub enabled: bool,
    /// Create internal users on first login
    pub auto_provision: bool,
    /// Role granted when no group mapping matches
    pub default_role: Option<Role>,
    pub group_mappings: Vec<GroupMap>,
    pub attribute_map: AttributeMap,
    pub saml: Option<SamlConfig>,
    pub oauth2: Option<OAuth2Config>,
    pub oidc: Option<OidcConfig>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProviderConfig {
    /// Apply a partial update. `id` and `name` never change.
    ///
    /// A protocol block submitted without its secret keeps the stored secret,
    /// so that a read-modify-write cycle through the (redacted) API does not
    /// wipe credentials.
    pub fn apply_update(&mut self, update: UpdateProviderConfig) {
        if let Some(provider_type) = update.provider_type
            && provider_type != self.provider_type
        {
            // Stored blocks belong to the old protocol
            self.provider_type = provider_type;
            self.saml = None;
            self.oauth2 = None;
            self.oidc = None;
        }
        if let Some(vendor) = update.vendor {
            self.vendor = vendor;
        }
        if let Some(enabled) = update.enabled {
            self.enabled = enabled;
        }
        if let Some(auto_provision) = update.auto_provision {
            self.auto_provision = auto_provision;
        }
        if let Some(default_role) = update.default_role {
            self.default_role = default_role;
        }
        if let Some(group_mappings) = update.group_mappings {
            self.group_mappings = group_mappings;
        }
        if let Some(attribute_map) = update.attribute_map {
            self.attribute_map = attribute_map;
        }
        if let Some(mut saml) = update.saml {
            if saml.sp_private_key.is_none() {
                saml.sp_private_key = self.saml.as_ref().and_then(|s| s.sp_private_key.clone());
            }
            self.saml = Some(saml);
        }
        if let Some(mut oauth2) = update.oauth2 {
            if oauth2.client_secret.is_empty()
                && let Some(existing) = &self.oauth2
            {
                oauth2.client_secret = existing.client_secret.clone();
            }
            self.oauth2 = Some(oauth2);
        }
        if let Some(mut oidc) = update.oidc {
            if oidc.client_secret.is_empty()
                && let Some(existing) = &self.oidc
            {
                oidc.client_secret = existing.client_secret.clone();
            }
            self.oidc = Some(oidc);
        }
    }
}

/// Request to create a provider.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateProviderConfig {
    #[validate(custom(function = "validate_provider_name"))]
    pub name: String,
    pub provider_type: ProviderType,
    #[serde(default)]
    pub vendor: ProviderVendor,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub auto_provision: bool,
    #[serde(default)]
    pub default_role: Option<Role>,
    #[validate(length(max = 256))]
    #[serde(default)]
    pub group_mappings: Vec<GroupMap>,
    #[serde(default)]
    pub attribute_map: AttributeMap,
    #[serde(default)]
    pub saml: Option<SamlConfig>,
    #[serde(default)]
    pub oauth2: Option<OAuth2Config>,
    #[serde(default)]
    pub oidc: Option<OidcConfig>,
}

impl CreateProviderConfig {
    /// The config as it will look once stored, used for validation before insert.
    pub fn to_unsaved(&self) -> ProviderConfig {
        let now = Utc::now();
        ProviderConfig {
            id: 0,
            name: self.name.clone(),
            provider_type: self.provider_type,
            vendor: self.vendor,
            enabled: self.enabled,
            auto_provision: self.auto_provision,
            default_role: self.default_role,
            group_mappings: self.group_mappings.clone(),
            attribute_map: self.attribute_map.clone(),
            saml: self.saml.clone(),
            oauth2: self.oauth2.clone(),
            oidc: self.oidc.clone(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Request to update a provider. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct UpdateProviderConfig {
    #[serde(default)]
    pub provider_type: Option<ProviderType>,
    #[serde(default)]
    pub vendor: Option<ProviderVendor>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub auto_provision: Option<bool>,
    /// `null` clears the default role; absence leaves it unchanged.
    #[serde(default, deserialize_with = "deserialize_optional_role")]
    pub default_role: Option<Option<Role>>,
    #[validate(length(max = 256))]
    #[serde(default)]
    pub group_mappings: Option<Vec<GroupMap>>,
    #[serde(default)]
    pub attribute_map: Option<AttributeMap>,
    #[serde(default)]
    pub saml: Option<SamlConfig>,
    #[serde(default)]
    pub oauth2: Option<OAuth2Config>,
    #[serde(default)]
    pub oidc: Option<OidcConfig>,
}

/// Deserialize a double-option field for PATCH-like semantics.
/// - Field not present in JSON -> None (don't update)
/// - Field present as null -> Some(None) (clear)
/// - Field present with value -> Some(Some(role)) (set)
fn deserialize_optional_role<'de, D>(deserializer: D) -> Result<Option<Option<Role>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Some(Option::deserialize(deserializer)?))
}

/// Provider configuration as returned by the admin API, with every secret removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfigResponse {
    pub id: i64,
    pub name: String,
    pub provider_type: ProviderType,
    pub vendor: ProviderVendor,
    pub enabled: bool,
    pub auto_provision: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_role: Option<Role>,
    pub group_mappings: Vec<GroupMap>,
    pub attribute_map: AttributeMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saml: Option<SamlConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth2: Option<OAuth2Config>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oidc: Option<OidcConfig>,
    /// Whether an OAuth2/OIDC client secret is stored
    pub has_client_secret: bool,
    /// Whether a SAML SP private key is stored
    pub has_sp_private_key: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ProviderConfig> for ProviderConfigResponse {
    fn from(config: ProviderConfig) -> Self {
        let has_client_secret = config
            .oauth2
            .as_ref()
            .is_some_and(|c| !c.client_secret.is_empty())
            || config
                .oidc
                .as_ref()
                .is_some_and(|c| !c.client_secret.is_empty());
        let has_sp_private_key = config
            .saml
            .as_ref()
            .is_some_and(|c| c.sp_private_key.is_some());

        Self {
            id: config.id,
            name: config.name,
            provider_type: config.provider_type,
            vendor: config.vendor,
            enabled: config.enabled,
            auto_provision: config.auto_provision,
            default_role: config.default_role,
            group_mappings: config.group_mappings,
            attribute_map: config.attribute_map,
            saml: config.saml.map(|c| SamlConfig {
                sp_private_key: None,
                ..c
            }),
            oauth2: config.oauth2.map(|c| OAuth2Config {
                client_secret: String::new(),
                ..c
            }),
            oidc: config.oidc.map(|c| OidcConfig {
                client_secret: String::new(),
                ..c
            }),
            has_client_secret,
            has_sp_private_key,
            created_at: config.created_at,
            updated_at: config.updated_at,
        }
    }
}
