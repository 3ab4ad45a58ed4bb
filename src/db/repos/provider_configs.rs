use async_trait::async_trait;

use crate::{
    db::error::DbResult,
    models::{CreateProviderConfig, ProviderConfig},
};

/// Repository for identity provider configurations.
///
/// Protocol blocks and mapping lists are stored as JSON and reconstituted on
/// read. A missing block means the provider is not configured for that
/// protocol.
#[async_trait]
pub trait ProviderConfigRepo: Send + Sync {
    /// Create a provider.
    ///
    /// # Errors
    /// Returns `DbError::Conflict` if a provider with the same name exists.
    async fn create(&self, input: CreateProviderConfig) -> DbResult<ProviderConfig>;

    async fn get_by_id(&self, id: i64) -> DbResult<Option<ProviderConfig>>;

    async fn get_by_name(&self, name: &str) -> DbResult<Option<ProviderConfig>>;

    /// List providers ordered by name.
    async fn list(&self, enabled_only: bool) -> DbResult<Vec<ProviderConfig>>;

    /// Persist every mutable field of `config`. The row is located by name;
    /// `id` and `name` are never rewritten.
    ///
    /// # Errors
    /// Returns `DbError::NotFound` if no provider has that name.
    async fn update(&self, config: &ProviderConfig) -> DbResult<ProviderConfig>;

    /// Delete a provider by name. Deleting a missing provider is not an error.
    async fn delete(&self, name: &str) -> DbResult<()>;
}
