//! Service configuration.
//!
//! Loaded from a TOML file. `${VAR}` references are replaced with the value
//! of the environment variable before parsing, except inside comments.

mod database;
mod observability;
mod server;
mod session;

use std::{path::Path, sync::LazyLock};

pub use database::*;
pub use observability::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
pub use server::*;
pub use session::*;

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SsoServiceConfig {
    /// HTTP server settings.
    pub server: ServerConfig,

    /// Persistent store for providers, users and sessions.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Session and login cookie settings.
    #[serde(default)]
    pub session: SessionConfig,

    /// Shared OIDC client settings.
    #[serde(default)]
    pub oidc: OidcClientConfig,

    /// Logging.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl SsoServiceConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e, path.as_ref().to_path_buf()))?;

        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(contents)?;
        let config: SsoServiceConfig = toml::from_str(&expanded).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency and completeness.
    fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.database.validate()?;
        self.session.validate()?;
        Ok(())
    }

    /// `server.base_url` without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.server.base_url.trim_end_matches('/')
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {1}: {0}")]
    Io(std::io::Error, std::path::PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

static ENV_VAR: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"\$\{([^}]+)\}").unwrap()
});

/// Expand `${VAR}` references. Anything after a `#` on a line is left as is.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut result = String::with_capacity(input.len());

    for line in input.lines() {
        let comment_pos = line.find('#');
        let mut last_end = 0;

        for cap in ENV_VAR.captures_iter(line) {
            let (Some(whole), Some(name)) = (cap.get(0), cap.get(1)) else {
                continue;
            };

            if let Some(pos) = comment_pos
                && whole.start() >= pos
            {
                break;
            }

            result.push_str(&line[last_end..whole.start()]);
            let value = std::env::var(name.as_str())
                .map_err(|_| ConfigError::EnvVarNotFound(name.as_str().to_string()))?;
            result.push_str(&value);
            last_end = whole.end();
        }

        result.push_str(&line[last_end..]);
        result.push('\n');
    }

    // Remove trailing newline if input didn't have one
    if !input.ends_with('\n') && result.ends_with('\n') {
        result.pop();
    }

    Ok(result)
}
