use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{db::error::DbResult, models::SsoSession};

/// Repository for local SSO sessions.
#[async_trait]
pub trait SsoSessionRepo: Send + Sync {
    async fn create(&self, session: &SsoSession) -> DbResult<()>;

    /// Get a session that has not expired as of `now`.
    ///
    /// Expired rows are reported as `None`, exactly like missing ones.
    async fn get_active(&self, id: &str, now: DateTime<Utc>) -> DbResult<Option<SsoSession>>;

    /// Delete a session. Deleting a missing session is not an error.
    async fn delete(&self, id: &str) -> DbResult<()>;

    /// Delete every session whose expiry is at or before `now`.
    ///
    /// Returns the number of rows removed.
    async fn delete_expired(&self, now: DateTime<Utc>) -> DbResult<u64>;
}
