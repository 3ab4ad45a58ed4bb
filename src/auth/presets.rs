//! Ready-made OIDC configurations for common identity vendors.

use serde::Deserialize;

use crate::models::{
    AttributeMap, CreateProviderConfig, OidcConfig, ProviderType, ProviderVendor,
};

/// A vendor template. Only the vendor-specific identifier and client
/// credentials need to be supplied.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "vendor", rename_all = "snake_case")]
pub enum ProviderPreset {
    AzureAd { tenant_id: String },
    Okta { domain: String },
    Google,
}

impl ProviderPreset {
    pub fn vendor(&self) -> ProviderVendor {
        match self {
            ProviderPreset::AzureAd { .. } => ProviderVendor::AzureAd,
            ProviderPreset::Okta { .. } => ProviderVendor::Okta,
            ProviderPreset::Google => ProviderVendor::Google,
        }
    }

    pub fn issuer_url(&self) -> String {
        match self {
            ProviderPreset::AzureAd { tenant_id } => {
                format!("https://login.microsoftonline.com/{tenant_id}/v2.0")
            }
            ProviderPreset::Okta { domain } => {
                let domain = domain
                    .trim_start_matches("https://")
                    .trim_end_matches('/');
                format!("https://{domain}/oauth2/default")
            }
            ProviderPreset::Google => "https://accounts.google.com".to_string(),
        }
    }

    fn scopes(&self) -> Vec<String> {
        let scopes: &[&str] = match self {
            ProviderPreset::AzureAd { .. } => &["openid", "profile", "email"],
            ProviderPreset::Okta { .. } => &["openid", "profile", "email", "groups"],
            ProviderPreset::Google => &["openid", "email", "profile"],
        };
        scopes.iter().map(|s| s.to_string()).collect()
    }

    fn attribute_map(&self) -> AttributeMap {
        match self {
            // Azure's `sub` is pairwise per application; `oid` is the stable object id
            ProviderPreset::AzureAd { .. } => AttributeMap {
                user_id: "oid".to_string(),
                ..AttributeMap::default()
            },
            ProviderPreset::Okta { .. } => AttributeMap::default(),
            ProviderPreset::Google => AttributeMap {
                username: "email".to_string(),
                groups: String::new(),
                ..AttributeMap::default()
            },
        }
    }

    /// Build a create request. Secrets are the caller's; empty ones fail
    /// validation on create.
    pub fn build(
        &self,
        name: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> CreateProviderConfig {
        CreateProviderConfig {
            name: name.into(),
            provider_type: ProviderType::Oidc,
            vendor: self.vendor(),
            enabled: true,
            auto_provision: true,
            default_role: None,
            group_mappings: Vec::new(),
            attribute_map: self.attribute_map(),
            saml: None,
            oauth2: None,
            oidc: Some(OidcConfig {
                issuer_url: self.issuer_url(),
                client_id: client_id.into(),
                client_secret: client_secret.into(),
                scopes: self.scopes(),
                userinfo_url: None,
                redirect_url: None,
            }),
        }
    }
}
