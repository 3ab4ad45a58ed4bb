use async_trait::async_trait;

use crate::{
    db::error::DbResult,
    models::{Role, SsoUserMapping, User},
};

/// Everything the provisioning transaction needs to reconcile one login.
#[derive(Debug, Clone)]
pub struct ProvisionIdentity {
    pub provider_id: i64,
    pub external_id: String,
    pub username: String,
    pub email: String,
    pub full_name: Option<String>,
    /// Role to upsert in the default organization; `None` leaves memberships untouched
    pub role: Option<Role>,
    /// Slug of the organization memberships are written to (created lazily)
    pub org_slug: String,
}

/// Result of a provisioning transaction.
#[derive(Debug, Clone)]
pub struct ProvisionOutcome {
    pub user: User,
    /// True when this login created the internal user
    pub created: bool,
}

/// Repository for external identity to internal user links.
#[async_trait]
pub trait SsoIdentityRepo: Send + Sync {
    /// Create or update the internal user linked to `(provider_id, external_id)`
    /// in a single transaction.
    ///
    /// Concurrent first logins for the same identity converge on one user:
    /// the mapping insert is guarded by the unique constraint and the loser
    /// retries through the update path.
    async fn provision(&self, identity: ProvisionIdentity) -> DbResult<ProvisionOutcome>;

    async fn get_mapping(
        &self,
        provider_id: i64,
        external_id: &str,
    ) -> DbResult<Option<SsoUserMapping>>;
}
