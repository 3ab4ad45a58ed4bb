use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    db::error::DbResult,
    models::{OrgMembership, User},
};

/// Read access to the internal user and organization-membership store.
///
/// Writes happen inside the provisioning transaction of
/// [`super::SsoIdentityRepo`].
#[async_trait]
pub trait UserRepo: Send + Sync {
    async fn get_by_id(&self, id: Uuid) -> DbResult<Option<User>>;

    /// Get a user's membership in the organization with the given slug.
    async fn get_membership(&self, user_id: Uuid, org_slug: &str)
    -> DbResult<Option<OrgMembership>>;
}
