use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A local session issued after a successful SSO login.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SsoSession {
    /// Opaque random identifier, also the `sso_session` cookie value
    pub id: String,
    pub provider_id: i64,
    pub user_id: Uuid,
    pub external_id: String,
    /// SAML SessionIndex for single logout
    pub session_index: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SsoSession {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}
