use std::sync::Arc;

use validator::Validate;

use crate::{
    auth::{ProviderFactory, SsoError},
    db::{DbError, DbPool},
    models::{CreateProviderConfig, ProviderConfig, UpdateProviderConfig},
};

/// Service layer for identity provider configuration.
///
/// Every write is validated with the same rules the factory applies at login
/// time, so a stored configuration can always be turned into a provider.
#[derive(Clone)]
pub struct ProviderConfigService {
    db: Arc<DbPool>,
    factory: ProviderFactory,
}

impl ProviderConfigService {
    pub fn new(db: Arc<DbPool>, factory: ProviderFactory) -> Self {
        Self { db, factory }
    }

    /// Get a provider by name.
    pub async fn get(&self, name: &str) -> Result<ProviderConfig, SsoError> {
        self.db
            .provider_configs()
            .get_by_name(name)
            .await?
            .ok_or_else(|| SsoError::ProviderNotFound(name.to_string()))
    }

    /// Get a provider by its numeric ID.
    pub async fn get_by_id(&self, id: i64) -> Result<ProviderConfig, SsoError> {
        self.db
            .provider_configs()
            .get_by_id(id)
            .await?
            .ok_or_else(|| SsoError::ProviderNotFound(id.to_string()))
    }

    pub async fn list(&self, enabled_only: bool) -> Result<Vec<ProviderConfig>, SsoError> {
        Ok(self.db.provider_configs().list(enabled_only).await?)
    }

    /// Validate and store a new provider.
    pub async fn create(&self, input: CreateProviderConfig) -> Result<ProviderConfig, SsoError> {
        input
            .validate()
            .map_err(|e| SsoError::Configuration(e.to_string()))?;
        self.factory.validate_config(&input.to_unsaved())?;

        let config = self
            .db
            .provider_configs()
            .create(input)
            .await
            .map_err(|e| match e {
                DbError::Conflict(msg) => SsoError::Conflict(msg),
                other => SsoError::from(other),
            })?;

        tracing::info!(
            provider = %config.name,
            provider_type = %config.provider_type,
            "Created SSO provider configuration"
        );
        Ok(config)
    }

    /// Apply a partial update. Omitted secrets keep their stored values and
    /// the merged result is validated before it is written.
    pub async fn update(
        &self,
        name: &str,
        input: UpdateProviderConfig,
    ) -> Result<ProviderConfig, SsoError> {
        input
            .validate()
            .map_err(|e| SsoError::Configuration(e.to_string()))?;

        let mut config = self.get(name).await?;
        config.apply_update(input);
        self.factory.validate_config(&config)?;

        let updated = self
            .db
            .provider_configs()
            .update(&config)
            .await
            .map_err(|e| match e {
                DbError::NotFound => SsoError::ProviderNotFound(name.to_string()),
                other => SsoError::from(other),
            })?;

        tracing::info!(provider = %name, "Updated SSO provider configuration");
        Ok(updated)
    }

    /// Delete a provider. Succeeds whether or not it exists.
    pub async fn delete(&self, name: &str) -> Result<(), SsoError> {
        self.db.provider_configs().delete(name).await?;
        tracing::info!(provider = %name, "Deleted SSO provider configuration");
        Ok(())
    }
}
