use serde::{Deserialize, Serialize};

use super::GroupMap;

/// Internal role granted through SSO group mapping.
///
/// Variants are ordered by privilege: `Admin` outranks `Developer`, which
/// outranks `Viewer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Developer,
    Viewer,
}

impl Role {
    /// Numeric precedence, higher wins.
    pub fn precedence(self) -> u8 {
        match self {
            Role::Admin => 3,
            Role::Developer => 2,
            Role::Viewer => 1,
        }
    }

    /// Resolve the highest-privilege role among all mappings whose group the
    /// user belongs to. Returns `None` when no group matches.
    pub fn resolve(groups: &[String], mappings: &[GroupMap]) -> Option<Role> {
        mappings
            .iter()
            .filter(|m| groups.iter().any(|g| g == &m.group))
            .map(|m| m.role)
            .max_by_key(|role| role.precedence())
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Admin => write!(f, "admin"),
            Role::Developer => write!(f, "developer"),
            Role::Viewer => write!(f, "viewer"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "developer" => Ok(Role::Developer),
            "viewer" => Ok(Role::Viewer),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}
