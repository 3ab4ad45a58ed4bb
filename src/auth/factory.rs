//! Turns a stored [`ProviderConfig`] into a ready [`SsoProvider`].

use std::sync::Arc;

use super::{
    DiscoveryCache, OAuth2Provider, OidcProvider, ProviderContext, SamlProvider, SsoError,
    SsoProvider,
};
use crate::models::{ProviderConfig, ProviderType, validate_provider_name};

#[derive(Clone)]
pub struct ProviderFactory {
    http: reqwest::Client,
    base_url: String,
    discovery: Arc<DiscoveryCache>,
}

impl ProviderFactory {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, discovery: Arc<DiscoveryCache>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            discovery,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Check a configuration without touching the network. The error names
    /// the first offending field.
    pub fn validate_config(&self, config: &ProviderConfig) -> Result<(), SsoError> {
        self.build(config)?.validate_config()
    }

    /// Build the provider for an enabled, valid configuration.
    ///
    /// OIDC providers resolve discovery and signing keys here, so an
    /// unreachable issuer fails at construction.
    pub async fn create(&self, config: &ProviderConfig) -> Result<SsoProvider, SsoError> {
        if !config.enabled {
            return Err(SsoError::ProviderDisabled(config.name.clone()));
        }

        let provider = self.build(config)?;
        provider.validate_config()?;

        if let SsoProvider::Oidc(oidc) = &provider {
            self.discovery.get(oidc.issuer_url()).await?;
        }

        tracing::debug!(
            provider = %config.name,
            provider_type = %config.provider_type,
            "Created SSO provider"
        );

        Ok(provider)
    }

    /// Construct the provider after the checks shared by every protocol.
    /// Protocol fields are left to [`SsoProvider::validate_config`].
    fn build(&self, config: &ProviderConfig) -> Result<SsoProvider, SsoError> {
        validate_provider_name(&config.name).map_err(|e| {
            SsoError::Configuration(
                e.message
                    .map(|m| format!("invalid name: {m}"))
                    .unwrap_or_else(|| "invalid name".to_string()),
            )
        })?;

        if config.attribute_map.user_id.trim().is_empty() {
            return Err(SsoError::missing_field("attribute_map.user_id"));
        }
        if config.attribute_map.email.trim().is_empty() {
            return Err(SsoError::missing_field("attribute_map.email"));
        }

        let blocks = [
            (ProviderType::Saml, config.saml.is_some()),
            (ProviderType::Oauth2, config.oauth2.is_some()),
            (ProviderType::Oidc, config.oidc.is_some()),
        ];
        if let Some((block, _)) = blocks
            .iter()
            .find(|(block, present)| *present && *block != config.provider_type)
        {
            return Err(SsoError::Configuration(format!(
                "{block} block not allowed for provider_type {}",
                config.provider_type
            )));
        }

        let ctx = ProviderContext::from(config);

        let provider = match config.provider_type {
            ProviderType::Saml => {
                let saml = config
                    .saml
                    .clone()
                    .ok_or_else(|| SsoError::missing_field("saml"))?;
                SsoProvider::Saml(SamlProvider::new(ctx, saml, &self.base_url))
            }
            ProviderType::Oauth2 => {
                let oauth2 = config
                    .oauth2
                    .clone()
                    .ok_or_else(|| SsoError::missing_field("oauth2"))?;
                SsoProvider::OAuth2(OAuth2Provider::new(
                    ctx,
                    oauth2,
                    &self.base_url,
                    self.http.clone(),
                ))
            }
            ProviderType::Oidc => {
                let oidc = config
                    .oidc
                    .clone()
                    .ok_or_else(|| SsoError::missing_field("oidc"))?;
                SsoProvider::Oidc(OidcProvider::new(
                    ctx,
                    oidc,
                    &self.base_url,
                    self.http.clone(),
                    self.discovery.clone(),
                ))
            }
        };
        Ok(provider)
    }
}
