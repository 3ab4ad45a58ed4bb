//! SAML 2.0 service-provider side.
//!
//! SP-initiated SSO over the HTTP-Redirect binding (AuthnRequest) and the
//! HTTP-POST binding (Response). The AuthnRequest ID is derived from the
//! login state, so the response's `InResponseTo` can be checked without
//! keeping per-login server state.

use std::io::Write;

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{Duration, Utc};
use flate2::{Compression, write::DeflateEncoder};
use openssl::{
    pkey::{PKey, Private},
    x509::X509,
};
use samael::{
    metadata::EntityDescriptor,
    schema::{Assertion, Issuer, LogoutRequest, NameID},
    service_provider::{ServiceProvider, ServiceProviderBuilder},
    traits::ToXml,
};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::{CallbackParams, ProviderContext, SsoError, map_identity, xmldsig};
use crate::models::{SamlConfig, SsoUser};

const DEFAULT_NAME_ID_FORMAT: &str = "urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress";

/// Tolerated clock difference with the IdP when checking conditions.
const CLOCK_SKEW_SECS: i64 = 60;

/// SAML 2.0 identity provider bound to one configured IdP.
pub struct SamlProvider {
    ctx: ProviderContext,
    config: SamlConfig,
    sp_entity_id: String,
    acs_url: String,
}

impl SamlProvider {
    /// `base_url` is this service's external URL; the SP entity ID and ACS
    /// URL are derived from it unless configured explicitly.
    pub fn new(ctx: ProviderContext, config: SamlConfig, base_url: &str) -> Self {
        let base_url = base_url.trim_end_matches('/');
        let sp_entity_id = config
            .sp_entity_id
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format!("{}/sso/metadata/{}", base_url, ctx.name));
        let acs_url = format!("{}/auth/sso/{}/callback", base_url, ctx.name);

        Self {
            ctx,
            config,
            sp_entity_id,
            acs_url,
        }
    }

    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    pub fn sp_entity_id(&self) -> &str {
        &self.sp_entity_id
    }

    pub fn acs_url(&self) -> &str {
        &self.acs_url
    }

    pub fn validate_config(&self) -> Result<(), SsoError> {
        validate_saml_config(&self.config)
    }

    /// Build the redirect URL carrying a (possibly signed) AuthnRequest, with
    /// `RelayState` set to `state`.
    pub fn initiate_login(&self, state: &str) -> Result<String, SsoError> {
        let sp = ServiceProviderBuilder::default()
            .entity_id(self.sp_entity_id.clone())
            .acs_url(self.acs_url.clone())
            .idp_metadata(self.build_idp_metadata()?)
            .authn_name_id_format(self.name_id_format().to_string())
            .force_authn(self.config.force_authn)
            .build()
            .map_err(|e| SsoError::Configuration(format!("invalid SAML configuration: {e}")))?;

        let mut authn_request = sp
            .make_authentication_request(&self.config.idp_sso_url)
            .map_err(|e| SsoError::Internal(format!("failed to create AuthnRequest: {e}")))?;
        authn_request.id = request_id_for_state(state);

        let url = if self.config.sign_requests {
            let private_key = self.load_private_key()?;
            authn_request
                .signed_redirect(state, private_key)
                .map_err(|e| SsoError::Internal(format!("failed to sign AuthnRequest: {e}")))?
        } else {
            authn_request
                .redirect(state)
                .map_err(|e| SsoError::Internal(format!("failed to encode AuthnRequest: {e}")))?
        }
        .ok_or_else(|| SsoError::Configuration("AuthnRequest has no destination".to_string()))?;

        tracing::debug!(
            provider = %self.ctx.name,
            signed = self.config.sign_requests,
            "Built SAML AuthnRequest"
        );

        Ok(url.to_string())
    }

    /// Validate a posted SAML Response and extract the user.
    pub fn handle_callback(&self, params: &CallbackParams) -> Result<SsoUser, SsoError> {
        let encoded = params
            .saml_response
            .as_deref()
            .map(|s| s.split_whitespace().collect::<String>())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SsoError::Protocol("missing SAMLResponse".to_string()))?;

        let state = params
            .returned_state()
            .ok_or_else(|| SsoError::State("missing RelayState".to_string()))?;

        let decoded = STANDARD
            .decode(&encoded)
            .map_err(|e| SsoError::Protocol(format!("SAMLResponse is not valid base64: {e}")))?;
        let xml = String::from_utf8(decoded)
            .map_err(|e| SsoError::Protocol(format!("SAMLResponse is not valid UTF-8: {e}")))?;

        // Nothing from the document is trusted before this passes
        let certificates = trusted_certificates(&self.config)?;
        xmldsig::verify_response(&xml, &certificates).map_err(|e| {
            tracing::warn!(provider = %self.ctx.name, error = %e, "SAML signature verification failed");
            SsoError::Protocol(format!("SAML signature verification failed: {e}"))
        })?;

        let sp = ServiceProviderBuilder::default()
            .entity_id(self.sp_entity_id.clone())
            .acs_url(self.acs_url.clone())
            .idp_metadata(self.build_idp_metadata()?)
            .build()
            .map_err(|e| SsoError::Configuration(format!("invalid SAML configuration: {e}")))?;

        let expected_id = request_id_for_state(state);
        let assertion = sp
            .parse_xml_response(&xml, Some(&[expected_id.as_str()]))
            .map_err(|e| {
                tracing::warn!(provider = %self.ctx.name, error = %e, "SAML response validation failed");
                SsoError::Protocol(format!("SAML response validation failed: {e}"))
            })?;

        self.check_issuer(&assertion)?;
        self.check_conditions(&assertion)?;

        let name_id = assertion
            .subject
            .as_ref()
            .and_then(|s| s.name_id.as_ref())
            .map(|n| n.value.clone());

        let session_index = assertion
            .authn_statements
            .as_ref()
            .and_then(|stmts| stmts.first())
            .and_then(|stmt| stmt.session_index.clone());

        let attributes = attribute_bag(assertion_attributes(&assertion));

        map_identity(&self.ctx, attributes, name_id.as_deref(), session_index)
    }

    /// Build a LogoutRequest redirect to the IdP's SLO endpoint.
    ///
    /// Returns `Ok(None)` when the IdP has no SLO endpoint configured.
    pub fn logout(
        &self,
        name_id: &str,
        session_index: Option<&str>,
    ) -> Result<Option<String>, SsoError> {
        let Some(slo_url) = self.config.idp_slo_url.as_deref().filter(|s| !s.is_empty()) else {
            return Ok(None);
        };

        let request = LogoutRequest {
            id: Some(format!("_logout_{}", Uuid::new_v4())),
            version: Some("2.0".to_string()),
            issue_instant: Some(Utc::now()),
            destination: Some(slo_url.to_string()),
            issuer: Some(Issuer {
                value: Some(self.sp_entity_id.clone()),
                ..Default::default()
            }),
            name_id: Some(NameID {
                value: name_id.to_string(),
                format: Some(self.name_id_format().to_string()),
            }),
            session_index: session_index.map(String::from),
            signature: None,
        };

        let xml = request
            .to_string()
            .map_err(|e| SsoError::Internal(format!("failed to serialize LogoutRequest: {e:?}")))?;

        let mut compressed = vec![];
        {
            let mut encoder = DeflateEncoder::new(&mut compressed, Compression::default());
            encoder
                .write_all(xml.as_bytes())
                .map_err(|e| SsoError::Internal(format!("failed to compress LogoutRequest: {e}")))?;
        }

        let mut url = url::Url::parse(slo_url)
            .map_err(|e| SsoError::Configuration(format!("invalid saml.idp_slo_url: {e}")))?;
        url.query_pairs_mut()
            .append_pair("SAMLRequest", &STANDARD.encode(&compressed));

        let url = if self.config.sign_requests {
            self.sign_redirect_url(url)?
        } else {
            url
        };

        tracing::debug!(provider = %self.ctx.name, "Built SAML LogoutRequest");

        Ok(Some(url.to_string()))
    }

    /// SP metadata document for configuring the IdP side.
    pub fn metadata(&self) -> String {
        let mut xml = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" entityID="{}">
  <md:SPSSODescriptor AuthnRequestsSigned="{}" WantAssertionsSigned="true" protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">"#,
            xml_escape(&self.sp_entity_id),
            self.config.sign_requests,
        );

        if let Some(cert) = self.config.sp_certificate.as_deref().filter(|c| !c.is_empty()) {
            xml.push_str(&format!(
                r#"
    <md:KeyDescriptor use="signing">
      <ds:KeyInfo xmlns:ds="http://www.w3.org/2000/09/xmldsig#">
        <ds:X509Data>
          <ds:X509Certificate>{}</ds:X509Certificate>
        </ds:X509Data>
      </ds:KeyInfo>
    </md:KeyDescriptor>"#,
                strip_pem_headers(cert)
            ));
        }

        xml.push_str(&format!(
            r#"
    <md:NameIDFormat>{}</md:NameIDFormat>
    <md:AssertionConsumerService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="{}" index="0"/>
  </md:SPSSODescriptor>
</md:EntityDescriptor>"#,
            xml_escape(self.name_id_format()),
            xml_escape(&self.acs_url),
        ));

        xml
    }

    fn name_id_format(&self) -> &str {
        self.config
            .name_id_format
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_NAME_ID_FORMAT)
    }

    fn check_issuer(&self, assertion: &Assertion) -> Result<(), SsoError> {
        match assertion.issuer.value.as_deref() {
            Some(issuer) if issuer == self.config.idp_entity_id => Ok(()),
            other => Err(SsoError::Protocol(format!(
                "unexpected assertion issuer: {}",
                other.unwrap_or("<none>")
            ))),
        }
    }

    /// Time window and audience. Assertions without conditions pass.
    fn check_conditions(&self, assertion: &Assertion) -> Result<(), SsoError> {
        let Some(conditions) = assertion.conditions.as_ref() else {
            return Ok(());
        };

        let now = Utc::now();
        let skew = Duration::seconds(CLOCK_SKEW_SECS);
        if conditions.not_before.is_some_and(|not_before| now + skew < not_before) {
            return Err(SsoError::Protocol("assertion is not yet valid".to_string()));
        }
        if conditions
            .not_on_or_after
            .is_some_and(|not_on_or_after| not_on_or_after + skew <= now)
        {
            return Err(SsoError::Protocol("assertion has expired".to_string()));
        }

        for restriction in conditions.audience_restrictions.iter().flatten() {
            if !restriction.audience.iter().any(|a| *a == self.sp_entity_id) {
                return Err(SsoError::Protocol(format!(
                    "assertion audience does not include {}",
                    self.sp_entity_id
                )));
            }
        }
        Ok(())
    }

    /// Load the SP private key (PKCS#8 or PKCS#1 PEM).
    fn load_private_key(&self) -> Result<PKey<Private>, SsoError> {
        let pem = self
            .config
            .sp_private_key
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SsoError::missing_field("saml.sp_private_key"))?;

        PKey::private_key_from_pem(pem.as_bytes()).map_err(|e| {
            SsoError::Configuration(format!("saml.sp_private_key is not a valid PEM key: {e}"))
        })
    }

    /// Sign a redirect-binding URL: `SigAlg` is appended, then the whole
    /// query string is signed.
    fn sign_redirect_url(&self, mut url: url::Url) -> Result<url::Url, SsoError> {
        use openssl::{hash::MessageDigest, sign::Signer};

        let private_key = self.load_private_key()?;
        let sig_alg = if private_key.ec_key().is_ok() {
            "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha256"
        } else {
            "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256"
        };
        url.query_pairs_mut().append_pair("SigAlg", sig_alg);

        let query = url
            .query()
            .ok_or_else(|| SsoError::Internal("no query string to sign".to_string()))?
            .to_string();

        let signature = Signer::new(MessageDigest::sha256(), &private_key)
            .and_then(|mut signer| {
                signer.update(query.as_bytes())?;
                signer.sign_to_vec()
            })
            .map_err(|e| SsoError::Internal(format!("failed to sign LogoutRequest: {e}")))?;

        url.query_pairs_mut()
            .append_pair("Signature", &STANDARD.encode(signature));

        Ok(url)
    }

    /// IdP metadata built from configuration. Each trusted certificate gets
    /// its own signing KeyDescriptor so rotations can overlap.
    fn build_idp_metadata(&self) -> Result<EntityDescriptor, SsoError> {
        let certificates = split_certificates(&self.config.idp_certificate);
        if certificates.is_empty() {
            return Err(SsoError::missing_field("saml.idp_certificate"));
        }

        let key_descriptors: String = certificates
            .iter()
            .map(|cert| {
                format!(
                    r#"
        <md:KeyDescriptor use="signing">
            <ds:KeyInfo xmlns:ds="http://www.w3.org/2000/09/xmldsig#">
                <ds:X509Data>
                    <ds:X509Certificate>{cert}</ds:X509Certificate>
                </ds:X509Data>
            </ds:KeyInfo>
        </md:KeyDescriptor>"#
                )
            })
            .collect();

        let slo = self
            .config
            .idp_slo_url
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|url| {
                format!(
                    r#"<md:SingleLogoutService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" Location="{}"/>"#,
                    xml_escape(url)
                )
            })
            .unwrap_or_default();

        let xml = format!(
            r#"<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" entityID="{}">
    <md:IDPSSODescriptor protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">{}
        <md:SingleSignOnService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" Location="{}"/>
        {}
    </md:IDPSSODescriptor>
</md:EntityDescriptor>"#,
            xml_escape(&self.config.idp_entity_id),
            key_descriptors,
            xml_escape(&self.config.idp_sso_url),
            slo,
        );

        samael::metadata::de::from_str(&xml)
            .map_err(|e| SsoError::Configuration(format!("invalid IdP metadata: {e}")))
    }
}

/// Check every required SAML field, naming the first one that is missing.
fn validate_saml_config(config: &SamlConfig) -> Result<(), SsoError> {
    if config.idp_entity_id.trim().is_empty() {
        return Err(SsoError::missing_field("saml.idp_entity_id"));
    }
    if config.idp_sso_url.trim().is_empty() {
        return Err(SsoError::missing_field("saml.idp_sso_url"));
    }
    url::Url::parse(&config.idp_sso_url)
        .map_err(|e| SsoError::Configuration(format!("invalid saml.idp_sso_url: {e}")))?;
    trusted_certificates(config)?;
    if config.sign_requests
        && config
            .sp_private_key
            .as_deref()
            .is_none_or(|k| k.trim().is_empty())
    {
        return Err(SsoError::missing_field("saml.sp_private_key"));
    }
    Ok(())
}

/// AuthnRequest ID for a login state. XML IDs must not start with a digit,
/// hence the underscore.
fn request_id_for_state(state: &str) -> String {
    format!("_{state}")
}

/// Split one or more concatenated PEM certificates into bare base64 bodies.
/// Input without PEM armor is treated as a single bare certificate.
fn split_certificates(pem: &str) -> Vec<String> {
    let mut certs = Vec::new();
    let mut current: Option<String> = None;

    for line in pem.lines().map(str::trim) {
        if line.starts_with("-----BEGIN") {
            current = Some(String::new());
        } else if line.starts_with("-----END") {
            if let Some(body) = current.take().filter(|b| !b.is_empty()) {
                certs.push(body);
            }
        } else if let Some(body) = current.as_mut() {
            body.push_str(line);
        }
    }

    if certs.is_empty() && !pem.contains("-----BEGIN") {
        let bare: String = pem.split_whitespace().collect();
        if !bare.is_empty() {
            certs.push(bare);
        }
    }

    certs
}

/// Decode the configured IdP certificates.
fn trusted_certificates(config: &SamlConfig) -> Result<Vec<X509>, SsoError> {
    let bodies = split_certificates(&config.idp_certificate);
    if bodies.is_empty() {
        return Err(SsoError::missing_field("saml.idp_certificate"));
    }

    bodies
        .iter()
        .map(|body| {
            let der = STANDARD.decode(body).map_err(|e| {
                SsoError::Configuration(format!("saml.idp_certificate is not valid base64: {e}"))
            })?;
            X509::from_der(&der).map_err(|e| {
                SsoError::Configuration(format!(
                    "saml.idp_certificate is not a valid X.509 certificate: {e}"
                ))
            })
        })
        .collect()
}

fn strip_pem_headers(pem: &str) -> String {
    pem.lines()
        .filter(|line| !line.starts_with("-----BEGIN") && !line.starts_with("-----END"))
        .collect::<Vec<_>>()
        .join("")
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// One SAML attribute, detached from the samael schema types.
#[derive(Debug, Clone)]
struct RawAttribute<'a> {
    name: Option<&'a str>,
    friendly_name: Option<&'a str>,
    values: Vec<&'a str>,
}

fn assertion_attributes(assertion: &Assertion) -> Vec<RawAttribute<'_>> {
    assertion
        .attribute_statements
        .iter()
        .flatten()
        .flat_map(|statement| statement.attributes.iter())
        .map(|attr| RawAttribute {
            name: attr.name.as_deref(),
            friendly_name: attr.friendly_name.as_deref(),
            values: attr
                .values
                .iter()
                .filter_map(|v| v.value.as_deref())
                .collect(),
        })
        .collect()
}

/// Flatten attributes into a JSON bag keyed by Name and FriendlyName.
/// Single values become strings, multiple values arrays.
fn attribute_bag(attributes: Vec<RawAttribute<'_>>) -> Map<String, Value> {
    let mut bag = Map::new();

    for attr in attributes {
        let value = match attr.values.as_slice() {
            [] => continue,
            [single] => Value::String(single.to_string()),
            many => Value::Array(many.iter().map(|v| Value::String(v.to_string())).collect()),
        };

        for key in [attr.name, attr.friendly_name].into_iter().flatten() {
            if !key.is_empty() {
                bag.insert(key.to_string(), value.clone());
            }
        }
    }

    bag
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::DeflateDecoder;

    use chrono::{DateTime, SecondsFormat};

    use super::*;
    use crate::{
        auth::{test_support::generate_test_certificate, xmldsig::sign_enveloped},
        models::AttributeMap,
    };

    const ACS_URL: &str = "https://sso.example.com/auth/sso/corp-saml/callback";
    const SP_ENTITY_ID: &str = "https://sso.example.com/sso/metadata/corp-saml";

    /// Knobs for a well-formed IdP response to a login started with state
    /// `st-1`.
    struct ResponseParts {
        issuer: String,
        audience: String,
        in_response_to: String,
        not_on_or_after: DateTime<Utc>,
        uid: Option<&'static str>,
    }

    impl Default for ResponseParts {
        fn default() -> Self {
            Self {
                issuer: "https://idp.example.com".to_string(),
                audience: SP_ENTITY_ID.to_string(),
                in_response_to: request_id_for_state("st-1"),
                not_on_or_after: Utc::now() + Duration::minutes(5),
                uid: None,
            }
        }
    }

    fn response_xml(parts: &ResponseParts) -> String {
        let now = Utc::now();
        let instant = |t: DateTime<Utc>| t.to_rfc3339_opts(SecondsFormat::Secs, true);
        let uid = parts
            .uid
            .map(|uid| {
                format!(
                    r#"<saml:Attribute Name="uid"><saml:AttributeValue>{uid}</saml:AttributeValue></saml:Attribute>"#
                )
            })
            .unwrap_or_default();

        format!(
            r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_response-1" Version="2.0" IssueInstant="{now}" Destination="{ACS_URL}" InResponseTo="{irt}">
  <saml:Issuer>{issuer}</saml:Issuer>
  <samlp:Status><samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:Success"/></samlp:Status>
  <saml:Assertion ID="_assertion-1" Version="2.0" IssueInstant="{now}">
    <saml:Issuer>{issuer}</saml:Issuer>
    <saml:Subject>
      <saml:NameID Format="{DEFAULT_NAME_ID_FORMAT}">nid-7f3a</saml:NameID>
      <saml:SubjectConfirmation Method="urn:oasis:names:tc:SAML:2.0:cm:bearer">
        <saml:SubjectConfirmationData InResponseTo="{irt}" NotOnOrAfter="{expiry}" Recipient="{ACS_URL}"/>
      </saml:SubjectConfirmation>
    </saml:Subject>
    <saml:Conditions NotBefore="{not_before}" NotOnOrAfter="{expiry}">
      <saml:AudienceRestriction><saml:Audience>{audience}</saml:Audience></saml:AudienceRestriction>
    </saml:Conditions>
    <saml:AuthnStatement AuthnInstant="{now}" SessionIndex="_session-42">
      <saml:AuthnContext><saml:AuthnContextClassRef>urn:oasis:names:tc:SAML:2.0:ac:classes:PasswordProtectedTransport</saml:AuthnContextClassRef></saml:AuthnContext>
    </saml:AuthnStatement>
    <saml:AttributeStatement>
      <saml:Attribute Name="urn:oid:0.9.2342.19200300.100.1.3" FriendlyName="mail"><saml:AttributeValue>jdoe@example.com</saml:AttributeValue></saml:Attribute>
      <saml:Attribute Name="displayName"><saml:AttributeValue>Jane Doe</saml:AttributeValue></saml:Attribute>
      <saml:Attribute Name="memberOf"><saml:AttributeValue>Spoke-Admins</saml:AttributeValue><saml:AttributeValue>Everyone</saml:AttributeValue></saml:Attribute>
      {uid}
    </saml:AttributeStatement>
  </saml:Assertion>
</samlp:Response>"#,
            now = instant(now),
            not_before = instant(now - Duration::minutes(5)),
            expiry = instant(parts.not_on_or_after),
            irt = parts.in_response_to,
            issuer = parts.issuer,
            audience = parts.audience,
        )
    }

    /// Provider trusting a fresh certificate, plus the matching signing key.
    fn trusting_provider() -> (SamlProvider, String) {
        let (cert, key) = generate_test_certificate();
        let mut config = create_test_config();
        config.idp_certificate = cert;
        (provider(config), key)
    }

    fn posted(xml: &str) -> CallbackParams {
        CallbackParams {
            saml_response: Some(STANDARD.encode(xml)),
            relay_state: Some("st-1".to_string()),
            ..Default::default()
        }
    }

    fn signed(parts: &ResponseParts, key: &str) -> CallbackParams {
        posted(&sign_enveloped(&response_xml(parts), "_assertion-1", key))
    }

    fn protocol_error(p: &SamlProvider, params: &CallbackParams) -> String {
        match p.handle_callback(params) {
            Err(SsoError::Protocol(msg)) => msg,
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    fn create_test_config() -> SamlConfig {
        let (cert_pem, _) = generate_test_certificate();

        SamlConfig {
            idp_entity_id: "https://idp.example.com".to_string(),
            idp_sso_url: "https://idp.example.com/sso".to_string(),
            idp_slo_url: Some("https://idp.example.com/slo".to_string()),
            idp_certificate: cert_pem,
            name_id_format: Some(DEFAULT_NAME_ID_FORMAT.to_string()),
            ..Default::default()
        }
    }

    fn provider(config: SamlConfig) -> SamlProvider {
        let ctx = ProviderContext {
            provider_id: 1,
            name: "corp-saml".to_string(),
            attribute_map: AttributeMap {
                user_id: "uid".to_string(),
                username: "uid".to_string(),
                email: "mail".to_string(),
                full_name: "displayName".to_string(),
                first_name: String::new(),
                last_name: String::new(),
                groups: "memberOf".to_string(),
            },
        };
        SamlProvider::new(ctx, config, "https://sso.example.com/")
    }

    fn query_param(url: &str, key: &str) -> Option<String> {
        url::Url::parse(url)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.to_string())
    }

    fn inflate(encoded: &str) -> String {
        let compressed = STANDARD.decode(encoded).unwrap();
        let mut xml = String::new();
        DeflateDecoder::new(compressed.as_slice())
            .read_to_string(&mut xml)
            .unwrap();
        xml
    }

    #[test]
    fn test_derived_urls() {
        let p = provider(create_test_config());
        assert_eq!(p.sp_entity_id(), "https://sso.example.com/sso/metadata/corp-saml");
        assert_eq!(p.acs_url(), "https://sso.example.com/auth/sso/corp-saml/callback");

        let mut config = create_test_config();
        config.sp_entity_id = Some("urn:example:sp".to_string());
        assert_eq!(provider(config).sp_entity_id(), "urn:example:sp");
    }

    #[test]
    fn test_login_url_binds_request_to_state() {
        let p = provider(create_test_config());
        let url = p.initiate_login("state-123").unwrap();

        assert!(url.starts_with("https://idp.example.com/sso?"));
        assert_eq!(query_param(&url, "RelayState").as_deref(), Some("state-123"));

        let xml = inflate(&query_param(&url, "SAMLRequest").unwrap());
        assert!(xml.contains(r#"ID="_state-123""#));
        assert!(xml.contains("https://sso.example.com/auth/sso/corp-saml/callback"));
    }

    #[test]
    fn test_signed_login_url() {
        let (_, key_pem) = generate_test_certificate();
        let mut config = create_test_config();
        config.sign_requests = true;
        config.sp_private_key = Some(key_pem);

        let url = provider(config).initiate_login("abc").unwrap();
        assert!(url.contains("SigAlg="));
        assert!(url.contains("Signature="));
    }

    #[test]
    fn test_signed_login_without_key_is_configuration_error() {
        let mut config = create_test_config();
        config.sign_requests = true;

        let err = provider(config).initiate_login("abc").unwrap_err();
        assert!(matches!(err, SsoError::Configuration(_)));
        assert!(err.to_string().contains("saml.sp_private_key"));
    }

    #[test]
    fn test_callback_without_saml_response() {
        let p = provider(create_test_config());
        let params = CallbackParams {
            state: Some("abc".to_string()),
            ..Default::default()
        };

        let err = p.handle_callback(&params).unwrap_err();
        assert!(matches!(err, SsoError::Protocol(_)));
        assert!(err.to_string().contains("missing SAMLResponse"));

        let params = CallbackParams {
            state: Some("abc".to_string()),
            saml_response: Some("   ".to_string()),
            ..Default::default()
        };
        assert!(
            p.handle_callback(&params)
                .unwrap_err()
                .to_string()
                .contains("missing SAMLResponse")
        );
    }

    #[test]
    fn test_callback_with_invalid_base64() {
        let p = provider(create_test_config());
        let params = CallbackParams {
            state: Some("abc".to_string()),
            saml_response: Some("!!not base64!!".to_string()),
            ..Default::default()
        };
        let err = p.handle_callback(&params).unwrap_err();
        assert!(matches!(err, SsoError::Protocol(_)));
        assert!(err.to_string().contains("base64"));
    }

    #[test]
    fn test_callback_with_garbage_xml() {
        let p = provider(create_test_config());
        let params = CallbackParams {
            state: Some("abc".to_string()),
            saml_response: Some(STANDARD.encode("<not-a-response/>")),
            ..Default::default()
        };
        assert!(matches!(
            p.handle_callback(&params),
            Err(SsoError::Protocol(_))
        ));
    }

    #[test]
    fn test_signed_response_yields_user() {
        let (p, key) = trusting_provider();
        let user = p.handle_callback(&signed(&ResponseParts::default(), &key)).unwrap();

        // No uid attribute, so the NameID is the external id
        assert_eq!(user.external_id, "nid-7f3a");
        assert_eq!(user.email, "jdoe@example.com");
        assert_eq!(user.username, "jdoe@example.com");
        assert_eq!(user.full_name.as_deref(), Some("Jane Doe"));
        assert_eq!(user.groups, vec!["Spoke-Admins", "Everyone"]);
        assert_eq!(user.session_index.as_deref(), Some("_session-42"));
        assert_eq!(user.attributes["mail"], "jdoe@example.com");
        assert_eq!(
            user.attributes["urn:oid:0.9.2342.19200300.100.1.3"],
            "jdoe@example.com"
        );
    }

    #[test]
    fn test_signed_response_prefers_mapped_user_id() {
        let (p, key) = trusting_provider();
        let parts = ResponseParts {
            uid: Some("jdoe"),
            ..Default::default()
        };
        let user = p.handle_callback(&signed(&parts, &key)).unwrap();
        assert_eq!(user.external_id, "jdoe");
        assert_eq!(user.username, "jdoe");
    }

    #[test]
    fn test_unsigned_response_is_rejected() {
        let (p, _) = trusting_provider();
        let msg = protocol_error(&p, &posted(&response_xml(&ResponseParts::default())));
        assert!(msg.contains("not signed"));
    }

    #[test]
    fn test_tampered_response_is_rejected() {
        let (p, key) = trusting_provider();
        let xml = sign_enveloped(&response_xml(&ResponseParts::default()), "_assertion-1", &key)
            .replace("Spoke-Admins", "Domain-Admins");
        let msg = protocol_error(&p, &posted(&xml));
        assert!(msg.contains("digest mismatch"));
    }

    #[test]
    fn test_response_signed_by_other_key_is_rejected() {
        let (p, _) = trusting_provider();
        let (_, other_key) = generate_test_certificate();
        let msg = protocol_error(&p, &signed(&ResponseParts::default(), &other_key));
        assert!(msg.contains("trusted certificate"));
    }

    #[test]
    fn test_expired_assertion_is_rejected() {
        let (p, key) = trusting_provider();
        let parts = ResponseParts {
            not_on_or_after: Utc::now() - Duration::hours(1),
            ..Default::default()
        };
        protocol_error(&p, &signed(&parts, &key));
    }

    #[test]
    fn test_wrong_audience_is_rejected() {
        let (p, key) = trusting_provider();
        let parts = ResponseParts {
            audience: "https://other-sp.example.com".to_string(),
            ..Default::default()
        };
        protocol_error(&p, &signed(&parts, &key));
    }

    #[test]
    fn test_wrong_in_response_to_is_rejected() {
        let (p, key) = trusting_provider();
        let parts = ResponseParts {
            in_response_to: request_id_for_state("some-other-login"),
            ..Default::default()
        };
        protocol_error(&p, &signed(&parts, &key));
    }

    #[test]
    fn test_wrong_issuer_is_rejected() {
        let (p, key) = trusting_provider();
        let parts = ResponseParts {
            issuer: "https://evil.example.com".to_string(),
            ..Default::default()
        };
        protocol_error(&p, &signed(&parts, &key));
    }

    #[test]
    fn test_logout_without_slo_is_noop() {
        let mut config = create_test_config();
        config.idp_slo_url = None;
        assert_eq!(provider(config).logout("jdoe", Some("_idx")).unwrap(), None);
    }

    #[test]
    fn test_logout_request_url() {
        let p = provider(create_test_config());
        let url = p.logout("jdoe@example.com", Some("_idx-1")).unwrap().unwrap();

        assert!(url.starts_with("https://idp.example.com/slo?"));
        let xml = inflate(&query_param(&url, "SAMLRequest").unwrap());
        assert!(xml.contains("jdoe@example.com"));
        assert!(xml.contains("_idx-1"));
        assert!(!url.contains("Signature="));
    }

    #[test]
    fn test_signed_logout_request_url() {
        let (_, key_pem) = generate_test_certificate();
        let mut config = create_test_config();
        config.sign_requests = true;
        config.sp_private_key = Some(key_pem);

        let url = provider(config).logout("jdoe", None).unwrap().unwrap();
        assert!(url.contains("SigAlg=http%3A%2F%2Fwww.w3.org%2F2001%2F04%2Fxmldsig-more%23rsa-sha256"));
        assert!(url.contains("Signature="));
    }

    #[test]
    fn test_metadata() {
        let (cert_pem, _) = generate_test_certificate();
        let mut config = create_test_config();
        config.sp_certificate = Some(cert_pem.clone());
        let metadata = provider(config).metadata();

        assert!(metadata.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(metadata.contains(r#"entityID="https://sso.example.com/sso/metadata/corp-saml""#));
        assert!(metadata.contains(r#"Location="https://sso.example.com/auth/sso/corp-saml/callback""#));
        assert!(metadata.contains("urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST"));
        assert!(metadata.contains(DEFAULT_NAME_ID_FORMAT));
        assert!(metadata.contains("<md:KeyDescriptor use=\"signing\">"));
        assert!(!metadata.contains("-----BEGIN CERTIFICATE-----"));
    }

    #[test]
    fn test_metadata_without_certificate() {
        let metadata = provider(create_test_config()).metadata();
        assert!(!metadata.contains("<md:KeyDescriptor"));
        assert!(metadata.contains("<md:AssertionConsumerService"));
    }

    #[test]
    fn test_split_certificates() {
        let (a, _) = generate_test_certificate();
        let (b, _) = generate_test_certificate();

        let both = format!("{a}\n{b}");
        let certs = split_certificates(&both);
        assert_eq!(certs.len(), 2);
        assert!(certs.iter().all(|c| !c.contains("BEGIN")));
        assert_ne!(certs[0], certs[1]);

        assert_eq!(split_certificates("MIIBbare\nCERT").len(), 1);
        assert!(split_certificates("  ").is_empty());
    }

    #[test]
    fn test_idp_metadata_accepts_multiple_certificates() {
        let (a, _) = generate_test_certificate();
        let (b, _) = generate_test_certificate();
        let mut config = create_test_config();
        config.idp_certificate = format!("{a}{b}");

        assert!(provider(config).build_idp_metadata().is_ok());
    }

    #[test]
    fn test_attribute_bag_keys_and_multiplicity() {
        let bag = attribute_bag(vec![
            RawAttribute {
                name: Some("urn:oid:0.9.2342.19200300.100.1.3"),
                friendly_name: Some("mail"),
                values: vec!["jdoe@example.com"],
            },
            RawAttribute {
                name: Some("memberOf"),
                friendly_name: None,
                values: vec!["Spoke-Admins", "Everyone"],
            },
            RawAttribute {
                name: Some("empty"),
                friendly_name: None,
                values: vec![],
            },
        ]);

        assert_eq!(bag["mail"], "jdoe@example.com");
        assert_eq!(bag["urn:oid:0.9.2342.19200300.100.1.3"], "jdoe@example.com");
        assert_eq!(bag["memberOf"], serde_json::json!(["Spoke-Admins", "Everyone"]));
        assert!(!bag.contains_key("empty"));
    }

    #[test]
    fn test_attribute_bag_maps_to_user_with_name_id_fallback() {
        let p = provider(create_test_config());
        let bag = attribute_bag(vec![
            RawAttribute {
                name: Some("mail"),
                friendly_name: None,
                values: vec!["jdoe@example.com"],
            },
            RawAttribute {
                name: Some("memberOf"),
                friendly_name: None,
                values: vec!["Spoke-Admins"],
            },
        ]);

        let user = map_identity(&p.ctx, bag, Some("name-id"), Some("_s1".into())).unwrap();
        assert_eq!(user.external_id, "name-id");
        assert_eq!(user.username, "jdoe@example.com");
        assert_eq!(user.groups, vec!["Spoke-Admins"]);
        assert_eq!(user.session_index.as_deref(), Some("_s1"));
    }

    #[test]
    fn test_validate_config_names_missing_field() {
        let mut config = create_test_config();
        config.idp_sso_url = String::new();
        assert!(
            validate_saml_config(&config)
                .unwrap_err()
                .to_string()
                .contains("saml.idp_sso_url")
        );

        let mut config = create_test_config();
        config.idp_certificate = String::new();
        assert!(
            validate_saml_config(&config)
                .unwrap_err()
                .to_string()
                .contains("saml.idp_certificate")
        );

        let mut config = create_test_config();
        config.idp_certificate = "MIIBbareButNotACertificate".to_string();
        assert!(matches!(
            validate_saml_config(&config),
            Err(SsoError::Configuration(msg)) if msg.contains("saml.idp_certificate")
        ));

        assert!(validate_saml_config(&create_test_config()).is_ok());
    }
}
