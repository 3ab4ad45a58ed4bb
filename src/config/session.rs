use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Login state and session cookie settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Lifetime of a session after a successful login.
    #[serde(default = "default_duration")]
    pub duration_secs: u64,

    /// Lifetime of the state, provider and return-URL cookies set at login.
    #[serde(default = "default_login_state")]
    pub login_state_secs: u64,

    /// Mark cookies `Secure`. Disable only for plain-HTTP local development.
    #[serde(default = "default_true")]
    pub secure: bool,

    /// How often expired sessions are purged.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            duration_secs: default_duration(),
            login_state_secs: default_login_state(),
            secure: true,
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl SessionConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn login_state(&self) -> Duration {
        Duration::from_secs(self.login_state_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.duration_secs == 0 {
            return Err(ConfigError::Validation(
                "session.duration_secs must be greater than zero".into(),
            ));
        }
        if self.login_state_secs == 0 {
            return Err(ConfigError::Validation(
                "session.login_state_secs must be greater than zero".into(),
            ));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "session.cleanup_interval_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// OpenID Connect client settings shared by all OIDC providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OidcClientConfig {
    /// How long discovery documents and signing keys are cached.
    #[serde(default = "default_discovery_ttl")]
    pub discovery_ttl_secs: u64,
}

impl Default for OidcClientConfig {
    fn default() -> Self {
        Self {
            discovery_ttl_secs: default_discovery_ttl(),
        }
    }
}

impl OidcClientConfig {
    pub fn discovery_ttl(&self) -> Duration {
        Duration::from_secs(self.discovery_ttl_secs)
    }
}

fn default_duration() -> u64 {
    24 * 60 * 60
}

fn default_login_state() -> u64 {
    10 * 60
}

fn default_cleanup_interval() -> u64 {
    300
}

fn default_discovery_ttl() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}
