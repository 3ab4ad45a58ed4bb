use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Protocol-neutral identity produced by a successful IdP callback.
///
/// Never persisted: handed straight to the provisioner and dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SsoUser {
    pub provider_id: i64,
    pub provider_name: String,
    pub external_id: String,
    pub username: String,
    pub email: String,
    pub full_name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub groups: Vec<String>,
    /// Every attribute/claim the IdP sent, unmapped
    pub attributes: serde_json::Map<String, serde_json::Value>,
    /// SAML SessionIndex, needed to target single logout
    pub session_index: Option<String>,
}

impl SsoUser {
    /// Full name, or "first last" when only the parts are known.
    pub fn display_name(&self) -> Option<String> {
        if let Some(full) = self.full_name.as_deref().filter(|s| !s.trim().is_empty()) {
            return Some(full.to_string());
        }
        let parts: Vec<&str> = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .filter(|s| !s.trim().is_empty())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }
}

/// Durable link between an external identity and an internal user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SsoUserMapping {
    pub provider_id: i64,
    pub external_id: String,
    pub user_id: Uuid,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub last_login_at: DateTime<Utc>,
}
