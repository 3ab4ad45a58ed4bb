use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Role;

/// Source of an organization membership.
///
/// SSO-created memberships are re-synchronised from IdP groups on every
/// login; manual memberships are left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipSource {
    /// Created manually via admin tooling
    #[default]
    Manual,
    /// Created by SSO just-in-time provisioning
    Sso,
}

impl MembershipSource {
    /// Convert to string for database storage
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Sso => "sso",
        }
    }
}

impl fmt::Display for MembershipSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for MembershipSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "sso" => Ok(Self::Sso),
            _ => Err(format!("Invalid membership source: {}", s)),
        }
    }
}

/// Internal user record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub full_name: Option<String>,
    pub is_active: bool,
    pub is_bot: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Slug of the organization SSO-provisioned users are placed in.
pub const DEFAULT_SSO_ORG_SLUG: &str = "sso-users";

/// A user's role in an organization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrgMembership {
    pub org_id: Uuid,
    pub org_slug: String,
    pub user_id: Uuid,
    pub role: Role,
    pub source: MembershipSource,
    pub updated_at: DateTime<Utc>,
}
