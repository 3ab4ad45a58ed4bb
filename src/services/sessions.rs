use std::sync::Arc;

use chrono::{Duration, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    auth::random_token,
    db::{DbError, DbPool},
    models::SsoSession,
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session storage error: {0}")]
    Database(#[from] DbError),
}

/// Local sessions issued after a successful SSO login.
#[derive(Clone)]
pub struct SessionService {
    db: Arc<DbPool>,
    ttl: Duration,
}

impl SessionService {
    pub fn new(db: Arc<DbPool>, ttl: std::time::Duration) -> Self {
        Self {
            db,
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::hours(24)),
        }
    }

    /// Create a session with a fresh random ID.
    pub async fn create(
        &self,
        provider_id: i64,
        user_id: Uuid,
        external_id: &str,
        session_index: Option<String>,
    ) -> Result<SsoSession, SessionError> {
        let now = Utc::now();
        let session = SsoSession {
            id: random_token(),
            provider_id,
            user_id,
            external_id: external_id.to_string(),
            session_index,
            created_at: now,
            expires_at: now + self.ttl,
        };

        self.db.sso_sessions().create(&session).await?;
        tracing::debug!(user_id = %user_id, provider_id, "Created SSO session");
        Ok(session)
    }

    /// An unexpired session. Expired sessions are reported as absent.
    pub async fn get(&self, id: &str) -> Result<Option<SsoSession>, SessionError> {
        Ok(self.db.sso_sessions().get_active(id, Utc::now()).await?)
    }

    pub async fn delete(&self, id: &str) -> Result<(), SessionError> {
        Ok(self.db.sso_sessions().delete(id).await?)
    }

    /// Remove every expired session, returning how many were deleted.
    pub async fn cleanup_expired(&self) -> Result<u64, SessionError> {
        Ok(self.db.sso_sessions().delete_expired(Utc::now()).await?)
    }
}
