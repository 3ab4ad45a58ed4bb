//! ID token verification against an issuer's cached JWKS.

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde_json::{Map, Value};

use super::{DiscoveryCache, SsoError};

/// Asymmetric algorithms accepted for ID tokens. `none` and HMAC are never
/// accepted, which rules out algorithm-confusion attacks.
const ALLOWED_ALGORITHMS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::ES256,
    Algorithm::ES384,
];

fn is_algorithm_allowed(alg: Algorithm) -> bool {
    ALLOWED_ALGORITHMS.contains(&alg)
}

/// Verify an ID token's signature, issuer, audience and expiry and return
/// its claims.
///
/// The nonce is not checked here; it is bound to the login flow, not the key.
pub async fn verify_id_token(
    discovery: &DiscoveryCache,
    issuer: &str,
    client_id: &str,
    token: &str,
) -> Result<Map<String, Value>, SsoError> {
    let header = decode_header(token).map_err(|e| {
        tracing::debug!(error = %e, "Failed to decode ID token header");
        SsoError::Protocol("malformed ID token".to_string())
    })?;

    if !is_algorithm_allowed(header.alg) {
        tracing::warn!(
            algorithm = ?header.alg,
            allowed = ?ALLOWED_ALGORITHMS,
            "ID token algorithm not in allowlist"
        );
        return Err(SsoError::Protocol(format!(
            "ID token algorithm {:?} is not allowed",
            header.alg
        )));
    }

    let kid = header
        .kid
        .as_deref()
        .ok_or_else(|| SsoError::Protocol("ID token has no key ID".to_string()))?;

    let key = decoding_key(discovery, issuer, kid).await?;

    let mut validation = Validation::new(header.alg);
    validation.set_issuer(&[issuer, issuer.trim_end_matches('/')]);
    validation.set_audience(&[client_id]);

    let data = decode::<Map<String, Value>>(token, &key, &validation).map_err(|e| {
        tracing::debug!(error = %e, "ID token validation failed");
        match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                SsoError::Protocol("ID token has expired".to_string())
            }
            jsonwebtoken::errors::ErrorKind::InvalidIssuer => {
                SsoError::Protocol("ID token issuer mismatch".to_string())
            }
            jsonwebtoken::errors::ErrorKind::InvalidAudience => {
                SsoError::Protocol("ID token audience mismatch".to_string())
            }
            _ => SsoError::Protocol(format!("invalid ID token: {e}")),
        }
    })?;

    Ok(data.claims)
}

/// Look up `kid`, refreshing the issuer's JWKS once if it is unknown.
async fn decoding_key(
    discovery: &DiscoveryCache,
    issuer: &str,
    kid: &str,
) -> Result<DecodingKey, SsoError> {
    let metadata = discovery.get(issuer).await?;
    if let Some(key) = metadata.keys.get(kid) {
        return Ok(key.clone());
    }

    tracing::info!(kid = kid, issuer = issuer, "Unknown key ID, refreshing JWKS");
    let metadata = discovery.refresh_keys(issuer).await?;
    metadata.keys.get(kid).cloned().ok_or_else(|| {
        tracing::warn!(kid = kid, "Key ID not found in JWKS");
        SsoError::Protocol(format!("unknown signing key: {kid}"))
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use jsonwebtoken::{EncodingKey, Header, encode};
    use rstest::rstest;
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    use super::*;
    use crate::auth::test_support::{
        TEST_CLIENT_ID, TEST_RSA_PRIVATE_KEY, jwks_response, mount_oidc_issuer, sign_id_token,
    };

    fn cache() -> DiscoveryCache {
        DiscoveryCache::new(reqwest::Client::new(), Duration::from_secs(300))
    }

    #[rstest]
    #[case(Algorithm::RS256, true)]
    #[case(Algorithm::RS512, true)]
    #[case(Algorithm::ES256, true)]
    #[case(Algorithm::ES384, true)]
    #[case(Algorithm::HS256, false)]
    #[case(Algorithm::HS512, false)]
    #[case(Algorithm::PS256, false)]
    fn test_algorithm_allowlist(#[case] alg: Algorithm, #[case] allowed: bool) {
        assert_eq!(is_algorithm_allowed(alg), allowed);
    }

    #[tokio::test]
    async fn test_valid_token_returns_claims() {
        let server = MockServer::start().await;
        mount_oidc_issuer(&server).await;

        let token = sign_id_token(&server.uri(), json!({"sub": "u1", "email": "u1@example.com"}));
        let claims = verify_id_token(&cache(), &server.uri(), TEST_CLIENT_ID, &token)
            .await
            .unwrap();

        assert_eq!(claims["sub"], "u1");
        assert_eq!(claims["email"], "u1@example.com");
    }

    #[tokio::test]
    async fn test_wrong_audience_rejected() {
        let server = MockServer::start().await;
        mount_oidc_issuer(&server).await;

        let token = sign_id_token(&server.uri(), json!({"sub": "u1", "aud": "someone-else"}));
        let err = verify_id_token(&cache(), &server.uri(), TEST_CLIENT_ID, &token)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("audience"));
    }

    #[tokio::test]
    async fn test_wrong_issuer_rejected() {
        let server = MockServer::start().await;
        mount_oidc_issuer(&server).await;

        let token = sign_id_token("https://other.example.com", json!({"sub": "u1"}));
        let err = verify_id_token(&cache(), &server.uri(), TEST_CLIENT_ID, &token)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("issuer"));
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let server = MockServer::start().await;
        mount_oidc_issuer(&server).await;

        let past = chrono::Utc::now().timestamp() - 7200;
        let token = sign_id_token(&server.uri(), json!({"sub": "u1", "exp": past, "iat": past - 60}));
        let err = verify_id_token(&cache(), &server.uri(), TEST_CLIENT_ID, &token)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[tokio::test]
    async fn test_hmac_token_rejected_before_key_lookup() {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some("k".to_string());
        let token = encode(
            &header,
            &json!({"sub": "x"}),
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();

        // No issuer is mounted: the allowlist must reject before any fetch
        let err = verify_id_token(&cache(), "http://127.0.0.1:9", TEST_CLIENT_ID, &token)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not allowed"));
    }

    #[tokio::test]
    async fn test_missing_kid_rejected() {
        let token = encode(
            &Header::new(Algorithm::RS256),
            &json!({"sub": "x"}),
            &EncodingKey::from_rsa_pem(TEST_RSA_PRIVATE_KEY.as_bytes()).unwrap(),
        )
        .unwrap();

        let err = verify_id_token(&cache(), "http://127.0.0.1:9", TEST_CLIENT_ID, &token)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("key ID"));
    }

    #[tokio::test]
    async fn test_unknown_kid_forces_one_refresh() {
        let server = MockServer::start().await;
        let uri = server.uri();

        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "issuer": uri,
                "authorization_endpoint": format!("{uri}/authorize"),
                "token_endpoint": format!("{uri}/token"),
                "jwks_uri": format!("{uri}/jwks")
            })))
            .mount(&server)
            .await;

        // First JWKS fetch has no keys (pre-rotation); the refresh has the key
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"keys": []})))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(jwks_response()))
            .expect(1)
            .mount(&server)
            .await;

        let token = sign_id_token(&uri, json!({"sub": "rotated"}));
        let claims = verify_id_token(&cache(), &uri, TEST_CLIENT_ID, &token)
            .await
            .unwrap();
        assert_eq!(claims["sub"], "rotated");
    }

    #[tokio::test]
    async fn test_kid_missing_after_refresh_is_error() {
        let server = MockServer::start().await;
        let uri = server.uri();

        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "issuer": uri,
                "authorization_endpoint": format!("{uri}/authorize"),
                "token_endpoint": format!("{uri}/token"),
                "jwks_uri": format!("{uri}/jwks")
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"keys": []})))
            .expect(2)
            .mount(&server)
            .await;

        let token = sign_id_token(&uri, json!({"sub": "x"}));
        let err = verify_id_token(&cache(), &uri, TEST_CLIENT_ID, &token)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown signing key"));
    }
}
