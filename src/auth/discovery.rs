//! OpenID Connect discovery and JWKS caching.
//!
//! Discovery documents and signing keys are cached per issuer for a fixed
//! TTL. A token signed with an unknown `kid` forces one key refresh, which
//! covers IdP key rotation without waiting for the TTL.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use jsonwebtoken::{
    DecodingKey,
    jwk::{AlgorithmParameters, Jwk, JwkSet, KeyAlgorithm},
};
use serde::Deserialize;
use tokio::sync::RwLock;

use super::SsoError;

/// The subset of `/.well-known/openid-configuration` the OIDC flow uses.
#[derive(Debug, Clone, Deserialize)]
pub struct OidcDiscovery {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
    pub jwks_uri: String,
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
}

/// Discovery document plus the issuer's current signing keys, by `kid`.
pub struct IssuerMetadata {
    pub discovery: OidcDiscovery,
    pub keys: HashMap<String, DecodingKey>,
}

impl std::fmt::Debug for IssuerMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuerMetadata")
            .field("discovery", &self.discovery)
            .field("keys", &self.keys.keys().collect::<Vec<_>>())
            .finish()
    }
}

struct CachedIssuer {
    metadata: Arc<IssuerMetadata>,
    fetched_at: Instant,
}

/// Per-issuer cache of discovery documents and JWKS.
pub struct DiscoveryCache {
    http_client: reqwest::Client,
    ttl: Duration,
    entries: RwLock<HashMap<String, CachedIssuer>>,
}

impl DiscoveryCache {
    pub fn new(http_client: reqwest::Client, ttl: Duration) -> Self {
        Self {
            http_client,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Metadata for `issuer`, fetched on first use or after the TTL expires.
    pub async fn get(&self, issuer: &str) -> Result<Arc<IssuerMetadata>, SsoError> {
        let key = normalize_issuer(issuer);
        {
            let entries = self.entries.read().await;
            if let Some(cached) = entries.get(key)
                && cached.fetched_at.elapsed() < self.ttl
            {
                return Ok(cached.metadata.clone());
            }
        }

        let discovery = self.fetch_discovery(issuer).await?;
        let keys = self.fetch_keys(&discovery.jwks_uri).await?;
        Ok(self.store(key, discovery, keys).await)
    }

    /// Re-fetch the JWKS for `issuer`, keeping the cached discovery document
    /// when there is one.
    pub async fn refresh_keys(&self, issuer: &str) -> Result<Arc<IssuerMetadata>, SsoError> {
        let key = normalize_issuer(issuer);
        let cached = {
            let entries = self.entries.read().await;
            entries.get(key).map(|c| c.metadata.discovery.clone())
        };

        let discovery = match cached {
            Some(discovery) => discovery,
            None => self.fetch_discovery(issuer).await?,
        };
        let keys = self.fetch_keys(&discovery.jwks_uri).await?;
        Ok(self.store(key, discovery, keys).await)
    }

    async fn store(
        &self,
        key: &str,
        discovery: OidcDiscovery,
        keys: HashMap<String, DecodingKey>,
    ) -> Arc<IssuerMetadata> {
        let metadata = Arc::new(IssuerMetadata { discovery, keys });
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            CachedIssuer {
                metadata: metadata.clone(),
                fetched_at: Instant::now(),
            },
        );
        metadata
    }

    async fn fetch_discovery(&self, issuer: &str) -> Result<OidcDiscovery, SsoError> {
        let url = format!(
            "{}/.well-known/openid-configuration",
            normalize_issuer(issuer)
        );

        tracing::debug!(url = %url, "Fetching OIDC discovery document");

        let response = self.http_client.get(&url).send().await.map_err(|e| {
            tracing::error!(error = %e, url = %url, "Failed to fetch OIDC discovery");
            SsoError::Protocol(format!("OIDC discovery failed: {e}"))
        })?;

        if !response.status().is_success() {
            return Err(SsoError::Protocol(format!(
                "OIDC discovery returned {}",
                response.status()
            )));
        }

        let discovery: OidcDiscovery = response
            .json()
            .await
            .map_err(|e| SsoError::Protocol(format!("invalid OIDC discovery document: {e}")))?;

        // A document for a different issuer would let that issuer mint our tokens
        if normalize_issuer(&discovery.issuer) != normalize_issuer(issuer) {
            tracing::warn!(
                expected = %issuer,
                actual = %discovery.issuer,
                "OIDC discovery issuer mismatch"
            );
            return Err(SsoError::Protocol(format!(
                "discovery issuer mismatch: expected {issuer}, got {}",
                discovery.issuer
            )));
        }

        Ok(discovery)
    }

    async fn fetch_keys(&self, jwks_uri: &str) -> Result<HashMap<String, DecodingKey>, SsoError> {
        tracing::debug!(url = %jwks_uri, "Fetching JWKS");

        let response = self.http_client.get(jwks_uri).send().await.map_err(|e| {
            tracing::error!(error = %e, url = %jwks_uri, "Failed to fetch JWKS");
            SsoError::Protocol(format!("failed to fetch JWKS: {e}"))
        })?;

        if !response.status().is_success() {
            let status = response.status();
            tracing::error!(status = %status, url = %jwks_uri, "JWKS endpoint returned error");
            return Err(SsoError::Protocol(format!("JWKS endpoint returned {status}")));
        }

        let jwks: JwkSet = response
            .json()
            .await
            .map_err(|e| SsoError::Protocol(format!("failed to parse JWKS: {e}")))?;

        let mut keys = HashMap::new();
        for jwk in jwks.keys {
            if let Some(kid) = &jwk.common.key_id {
                match jwk_to_decoding_key(&jwk) {
                    Ok(key) => {
                        keys.insert(kid.clone(), key);
                    }
                    Err(e) => {
                        tracing::warn!(kid = kid, error = %e, "Skipping unusable JWK");
                    }
                }
            }
        }

        tracing::info!(keys_count = keys.len(), "JWKS refreshed");
        Ok(keys)
    }
}

fn normalize_issuer(issuer: &str) -> &str {
    issuer.trim_end_matches('/')
}

/// Convert a signing JWK to a DecodingKey. Symmetric keys are refused:
/// an IdP never shares its HMAC secret with us.
fn jwk_to_decoding_key(jwk: &Jwk) -> Result<DecodingKey, SsoError> {
    match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e)
            .map_err(|e| SsoError::Protocol(format!("invalid RSA key: {e}"))),
        AlgorithmParameters::EllipticCurve(ec) => match jwk.common.key_algorithm {
            Some(KeyAlgorithm::ES256) | Some(KeyAlgorithm::ES384) | None => {
                DecodingKey::from_ec_components(&ec.x, &ec.y)
                    .map_err(|e| SsoError::Protocol(format!("invalid EC key: {e}")))
            }
            Some(alg) => Err(SsoError::Protocol(format!(
                "unsupported EC algorithm: {alg:?}"
            ))),
        },
        _ => Err(SsoError::Protocol("unsupported JWK key type".to_string())),
    }
}
