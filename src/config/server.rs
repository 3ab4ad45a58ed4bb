use std::{net::IpAddr, time::Duration};

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// External URL of this service, e.g. `https://sso.example.com`.
    /// Assertion consumer, redirect and metadata URLs are derived from it.
    pub base_url: String,

    /// Timeout for outbound calls to identity providers, in seconds.
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    /// Request body size limit in bytes.
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

impl ServerConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        let url = url::Url::parse(&self.base_url).map_err(|e| {
            ConfigError::Validation(format!("server.base_url is not a valid URL: {e}"))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::Validation(
                "server.base_url must use http or https".into(),
            ));
        }
        if self.http_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "server.http_timeout_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn default_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    8080
}

fn default_http_timeout() -> u64 {
    10
}

fn default_body_limit() -> usize {
    // SAML HTTP-POST responses with embedded certificates can be large
    1024 * 1024
}
