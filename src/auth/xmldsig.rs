//! Enveloped XML signature verification for SAML responses.
//!
//! Supports what SAML IdPs emit in practice: exclusive canonicalization
//! (optionally with an `InclusiveNamespaces` prefix list), the
//! enveloped-signature transform, RSA with SHA-256/384/512 and a single
//! same-document reference. SHA-1 is rejected.
//!
//! The signature is always checked against the configured IdP certificates;
//! any `KeyInfo` carried in the document is ignored.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use base64::{Engine, engine::general_purpose::STANDARD};
use openssl::{
    hash::{MessageDigest, hash},
    sign::Verifier,
    x509::X509,
};
use quick_xml::{Reader, events::BytesStart, events::Event};
use subtle::ConstantTimeEq;

pub(crate) const DSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub(crate) const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
pub(crate) const ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";
pub(crate) const RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
const RSA_SHA384: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha384";
const RSA_SHA512: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512";
pub(crate) const DIGEST_SHA256: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
const DIGEST_SHA384: &str = "http://www.w3.org/2001/04/xmldsig-more#sha384";
const DIGEST_SHA512: &str = "http://www.w3.org/2001/04/xmlenc#sha512";

const SAMLP_NS: &str = "urn:oasis:names:tc:SAML:2.0:protocol";
const SAML_NS: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("malformed XML: {0}")]
    Malformed(String),

    #[error("response is not signed")]
    Unsigned,

    #[error("unsupported {0}")]
    Unsupported(String),

    #[error("{0}")]
    Invalid(String),

    #[error("digest mismatch")]
    DigestMismatch,

    #[error("signature does not match any trusted certificate")]
    BadSignature,

    #[error("crypto error: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),
}

/// Verify that a SAML Response is signed by one of `certificates`.
///
/// Either the Response or its single Assertion must carry a valid enveloped
/// signature; every signature present must verify. Documents with more than
/// one assertion, duplicate IDs, comments, processing instructions or a DTD
/// are rejected outright so the element that was verified is the element
/// that gets read.
pub fn verify_response(xml: &str, certificates: &[X509]) -> Result<(), SignatureError> {
    let root = parse(xml)?;
    if !root.is(SAMLP_NS, "Response") {
        return Err(SignatureError::Invalid("document is not a SAML Response".to_string()));
    }

    let mut ids: HashMap<&str, usize> = HashMap::new();
    let mut assertions = 0;
    root.walk(&mut |el| {
        if let Some(id) = el.attr("ID") {
            *ids.entry(id).or_default() += 1;
        }
        if el.is(SAML_NS, "Assertion") {
            assertions += 1;
        }
    });
    if ids.values().any(|&count| count > 1) {
        return Err(SignatureError::Invalid("duplicate ID attribute".to_string()));
    }
    if assertions != 1 {
        return Err(SignatureError::Invalid(format!(
            "expected exactly one assertion, found {assertions}"
        )));
    }
    let assertion = root.child(SAML_NS, "Assertion").ok_or_else(|| {
        SignatureError::Invalid("assertion must be a direct child of the Response".to_string())
    })?;

    let mut verified = false;
    for element in [&root, assertion] {
        if let Some(signature) = element.child(DSIG_NS, "Signature") {
            verify_enveloped(element, signature, certificates)?;
            verified = true;
        }
    }

    if verified {
        Ok(())
    } else {
        Err(SignatureError::Unsigned)
    }
}

fn verify_enveloped(
    element: &Element,
    signature: &Element,
    certificates: &[X509],
) -> Result<(), SignatureError> {
    let id = element
        .attr("ID")
        .ok_or_else(|| SignatureError::Invalid("signed element has no ID".to_string()))?;

    let signed_info = signature
        .child(DSIG_NS, "SignedInfo")
        .ok_or_else(|| SignatureError::Invalid("missing SignedInfo".to_string()))?;

    let c14n = signed_info
        .child(DSIG_NS, "CanonicalizationMethod")
        .ok_or_else(|| SignatureError::Invalid("missing CanonicalizationMethod".to_string()))?;
    match c14n.attr("Algorithm") {
        Some(EXC_C14N) => {}
        other => {
            return Err(SignatureError::Unsupported(format!(
                "canonicalization method: {}",
                other.unwrap_or("<none>")
            )));
        }
    }

    let signature_digest = match signed_info
        .child(DSIG_NS, "SignatureMethod")
        .and_then(|m| m.attr("Algorithm"))
    {
        Some(RSA_SHA256) => MessageDigest::sha256(),
        Some(RSA_SHA384) => MessageDigest::sha384(),
        Some(RSA_SHA512) => MessageDigest::sha512(),
        other => {
            return Err(SignatureError::Unsupported(format!(
                "signature method: {}",
                other.unwrap_or("<none>")
            )));
        }
    };

    let references: Vec<&Element> = signed_info.children(DSIG_NS, "Reference").collect();
    let [reference] = references.as_slice() else {
        return Err(SignatureError::Invalid(format!(
            "expected exactly one Reference, found {}",
            references.len()
        )));
    };
    if reference.attr("URI") != Some(format!("#{id}").as_str()) {
        return Err(SignatureError::Invalid(
            "signature reference does not point at the signed element".to_string(),
        ));
    }

    let mut enveloped = false;
    let mut prefixes = Vec::new();
    if let Some(transforms) = reference.child(DSIG_NS, "Transforms") {
        for transform in transforms.children(DSIG_NS, "Transform") {
            match transform.attr("Algorithm") {
                Some(ENVELOPED_SIGNATURE) => enveloped = true,
                Some(EXC_C14N) => prefixes = inclusive_prefixes(transform),
                other => {
                    return Err(SignatureError::Unsupported(format!(
                        "transform: {}",
                        other.unwrap_or("<none>")
                    )));
                }
            }
        }
    }
    if !enveloped {
        return Err(SignatureError::Invalid("signature is not enveloped".to_string()));
    }

    let digest = match reference
        .child(DSIG_NS, "DigestMethod")
        .and_then(|m| m.attr("Algorithm"))
    {
        Some(DIGEST_SHA256) => MessageDigest::sha256(),
        Some(DIGEST_SHA384) => MessageDigest::sha384(),
        Some(DIGEST_SHA512) => MessageDigest::sha512(),
        other => {
            return Err(SignatureError::Unsupported(format!(
                "digest method: {}",
                other.unwrap_or("<none>")
            )));
        }
    };

    let expected = decode_base64(reference.child(DSIG_NS, "DigestValue"), "DigestValue")?;
    let canonical = canonicalize(element, Some(signature), &prefixes);
    let actual = hash(digest, canonical.as_bytes())?;
    if !bool::from(actual[..].ct_eq(&expected[..])) {
        return Err(SignatureError::DigestMismatch);
    }

    let signature_value =
        decode_base64(signature.child(DSIG_NS, "SignatureValue"), "SignatureValue")?;
    let canonical_signed_info = canonicalize(signed_info, None, &inclusive_prefixes(c14n));

    for certificate in certificates {
        let key = certificate.public_key()?;
        let mut verifier = Verifier::new(signature_digest, &key)?;
        verifier.update(canonical_signed_info.as_bytes())?;
        if verifier.verify(&signature_value).unwrap_or(false) {
            return Ok(());
        }
    }

    Err(SignatureError::BadSignature)
}

fn decode_base64(element: Option<&Element>, name: &str) -> Result<Vec<u8>, SignatureError> {
    let text: String = element
        .ok_or_else(|| SignatureError::Invalid(format!("missing {name}")))?
        .text()
        .split_whitespace()
        .collect();
    STANDARD
        .decode(text)
        .map_err(|e| SignatureError::Invalid(format!("{name} is not valid base64: {e}")))
}

fn inclusive_prefixes(method: &Element) -> Vec<String> {
    method
        .child(EXC_C14N, "InclusiveNamespaces")
        .and_then(|el| el.attr("PrefixList"))
        .map(|list| list.split_whitespace().map(String::from).collect())
        .unwrap_or_default()
}

#[derive(Debug)]
pub(crate) struct Element {
    name: String,
    prefix: String,
    local: String,
    attrs: Vec<Attr>,
    in_scope: BTreeMap<String, String>,
    children: Vec<Node>,
}

#[derive(Debug)]
struct Attr {
    name: String,
    prefix: String,
    local: String,
    value: String,
}

#[derive(Debug)]
enum Node {
    Element(Element),
    Text(String),
}

impl Element {
    fn namespace(&self) -> &str {
        self.in_scope.get(&self.prefix).map(String::as_str).unwrap_or("")
    }

    fn is(&self, namespace: &str, local: &str) -> bool {
        self.local == local && self.namespace() == namespace
    }

    /// Unprefixed attribute by name.
    pub(crate) fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|a| a.prefix.is_empty() && a.local == name)
            .map(|a| a.value.as_str())
    }

    fn children<'a>(&'a self, namespace: &str, local: &str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter_map(move |node| match node {
            Node::Element(el) if el.is(namespace, local) => Some(el),
            _ => None,
        })
    }

    pub(crate) fn child(&self, namespace: &str, local: &str) -> Option<&Element> {
        self.children(namespace, local).next()
    }

    fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(text) => Some(text.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Element)) {
        f(self);
        for node in &self.children {
            if let Node::Element(el) = node {
                el.walk(f);
            }
        }
    }
}

fn split_qname(name: &str) -> (String, String) {
    match name.split_once(':') {
        Some((prefix, local)) => (prefix.to_string(), local.to_string()),
        None => (String::new(), name.to_string()),
    }
}

fn utf8(bytes: &[u8]) -> Result<&str, SignatureError> {
    std::str::from_utf8(bytes).map_err(|e| SignatureError::Malformed(e.to_string()))
}

fn open_element(
    start: &BytesStart<'_>,
    parent_scope: Option<&BTreeMap<String, String>>,
) -> Result<Element, SignatureError> {
    let name = utf8(start.name().as_ref())?.to_string();
    let (prefix, local) = split_qname(&name);
    let mut in_scope = parent_scope.cloned().unwrap_or_default();
    let mut attrs = Vec::new();

    for attr in start.attributes() {
        let attr = attr.map_err(|e| SignatureError::Malformed(e.to_string()))?;
        let key = utf8(attr.key.as_ref())?.to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| SignatureError::Malformed(e.to_string()))?
            .into_owned();

        if key == "xmlns" {
            in_scope.insert(String::new(), value);
        } else if let Some(declared) = key.strip_prefix("xmlns:") {
            in_scope.insert(declared.to_string(), value);
        } else {
            let (prefix, local) = split_qname(&key);
            attrs.push(Attr {
                name: key,
                prefix,
                local,
                value,
            });
        }
    }

    Ok(Element {
        name,
        prefix,
        local,
        attrs,
        in_scope,
        children: Vec::new(),
    })
}

fn attach(
    element: Element,
    stack: &mut [Element],
    root: &mut Option<Element>,
) -> Result<(), SignatureError> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(Node::Element(element)),
        None if root.is_none() => *root = Some(element),
        None => return Err(SignatureError::Malformed("multiple root elements".to_string())),
    }
    Ok(())
}

fn push_text(text: String, stack: &mut [Element]) -> Result<(), SignatureError> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(Node::Text(text)),
        None if text.trim().is_empty() => {}
        None => return Err(SignatureError::Malformed("text outside the root element".to_string())),
    }
    Ok(())
}

/// Parse into a namespace-aware tree.
pub(crate) fn parse(xml: &str) -> Result<Element, SignatureError> {
    let normalized = xml.replace("\r\n", "\n").replace('\r', "\n");
    let mut reader = Reader::from_str(&normalized);
    let mut stack: Vec<Element> = Vec::new();
    let mut root = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| SignatureError::Malformed(e.to_string()))?;
        match event {
            Event::Start(start) => {
                let element = open_element(&start, stack.last().map(|p| &p.in_scope))?;
                stack.push(element);
            }
            Event::Empty(start) => {
                let element = open_element(&start, stack.last().map(|p| &p.in_scope))?;
                attach(element, &mut stack, &mut root)?;
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| SignatureError::Malformed("unbalanced end tag".to_string()))?;
                attach(element, &mut stack, &mut root)?;
            }
            Event::Text(text) => {
                let text = text
                    .unescape()
                    .map_err(|e| SignatureError::Malformed(e.to_string()))?
                    .into_owned();
                push_text(text, &mut stack)?;
            }
            Event::CData(data) => {
                let text = utf8(&data.into_inner())?.to_string();
                push_text(text, &mut stack)?;
            }
            Event::Comment(_) | Event::PI(_) | Event::DocType(_) => {
                return Err(SignatureError::Malformed(
                    "comments, processing instructions and DTDs are not accepted".to_string(),
                ));
            }
            Event::Decl(_) => {}
            Event::Eof => break,
        }
    }

    if !stack.is_empty() {
        return Err(SignatureError::Malformed("unclosed element".to_string()));
    }
    root.ok_or_else(|| SignatureError::Malformed("empty document".to_string()))
}

/// Exclusive XML canonicalization of `element`, leaving out `exclude`
/// (the enveloped signature) wherever it appears among the descendants.
pub(crate) fn canonicalize(element: &Element, exclude: Option<&Element>, prefixes: &[String]) -> String {
    let mut out = String::new();
    write_canonical(element, &BTreeMap::new(), exclude, prefixes, &mut out);
    out
}

fn write_canonical(
    element: &Element,
    rendered: &BTreeMap<String, String>,
    exclude: Option<&Element>,
    prefixes: &[String],
    out: &mut String,
) {
    let mut utilized = BTreeSet::new();
    utilized.insert(element.prefix.clone());
    for attr in &element.attrs {
        if !attr.prefix.is_empty() && attr.prefix != "xml" {
            utilized.insert(attr.prefix.clone());
        }
    }
    for prefix in prefixes {
        utilized.insert(if prefix == "#default" { String::new() } else { prefix.clone() });
    }

    let mut in_output = rendered.clone();
    let mut declarations = Vec::new();
    for prefix in utilized {
        let uri = element.in_scope.get(&prefix).cloned().unwrap_or_default();
        if prefix.is_empty() {
            if uri != rendered.get("").map(String::as_str).unwrap_or("") {
                declarations.push(("xmlns".to_string(), uri.clone()));
                in_output.insert(prefix, uri);
            }
        } else if !uri.is_empty() && rendered.get(&prefix) != Some(&uri) {
            declarations.push((format!("xmlns:{prefix}"), uri.clone()));
            in_output.insert(prefix, uri);
        }
    }

    let mut attrs: Vec<(&str, &Attr)> = element
        .attrs
        .iter()
        .map(|attr| {
            let namespace = match attr.prefix.as_str() {
                "" => "",
                "xml" => XML_NS,
                prefix => element.in_scope.get(prefix).map(String::as_str).unwrap_or(""),
            };
            (namespace, attr)
        })
        .collect();
    attrs.sort_by(|(ns_a, a), (ns_b, b)| (*ns_a, a.local.as_str()).cmp(&(*ns_b, b.local.as_str())));

    out.push('<');
    out.push_str(&element.name);
    for (name, value) in &declarations {
        push_attr(out, name, value);
    }
    for (_, attr) in attrs {
        push_attr(out, &attr.name, &attr.value);
    }
    out.push('>');

    for node in &element.children {
        match node {
            Node::Text(text) => push_escaped_text(out, text),
            Node::Element(child) => {
                if exclude.is_some_and(|skip| std::ptr::eq(skip, child)) {
                    continue;
                }
                write_canonical(child, &in_output, exclude, prefixes, out);
            }
        }
    }

    out.push_str("</");
    out.push_str(&element.name);
    out.push('>');
}

fn push_attr(out: &mut String, name: &str, value: &str) {
    out.push(' ');
    out.push_str(name);
    out.push_str("=\"");
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            c => out.push(c),
        }
    }
    out.push('"');
}

fn push_escaped_text(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            c => out.push(c),
        }
    }
}

/// Sign the element carrying `id` with an enveloped RSA-SHA256 signature,
/// placed right after that element's Issuer.
#[cfg(test)]
pub(crate) fn sign_enveloped(xml: &str, id: &str, key_pem: &str) -> String {
    use openssl::{pkey::PKey, sign::Signer};

    let root = parse(xml).unwrap();
    let mut target = None;
    root.walk(&mut |el| {
        if el.attr("ID") == Some(id) {
            target = Some(el);
        }
    });
    let digest = hash(
        MessageDigest::sha256(),
        canonicalize(target.unwrap(), None, &[]).as_bytes(),
    )
    .unwrap();

    let signed_info = format!(
        r##"<ds:SignedInfo><ds:CanonicalizationMethod Algorithm="{EXC_C14N}"/><ds:SignatureMethod Algorithm="{RSA_SHA256}"/><ds:Reference URI="#{id}"><ds:Transforms><ds:Transform Algorithm="{ENVELOPED_SIGNATURE}"/><ds:Transform Algorithm="{EXC_C14N}"/></ds:Transforms><ds:DigestMethod Algorithm="{DIGEST_SHA256}"/><ds:DigestValue>{}</ds:DigestValue></ds:Reference></ds:SignedInfo>"##,
        STANDARD.encode(digest)
    );
    let wrapper = parse(&format!(r#"<ds:Signature xmlns:ds="{DSIG_NS}">{signed_info}</ds:Signature>"#)).unwrap();
    let canonical = canonicalize(wrapper.child(DSIG_NS, "SignedInfo").unwrap(), None, &[]);

    let key = PKey::private_key_from_pem(key_pem.as_bytes()).unwrap();
    let mut signer = Signer::new(MessageDigest::sha256(), &key).unwrap();
    signer.update(canonical.as_bytes()).unwrap();
    let signature = format!(
        r#"<ds:Signature xmlns:ds="{DSIG_NS}">{signed_info}<ds:SignatureValue>{}</ds:SignatureValue></ds:Signature>"#,
        STANDARD.encode(signer.sign_to_vec().unwrap())
    );

    let start = xml.find(&format!(r#"ID="{id}""#)).unwrap();
    let issuer_end = start + xml[start..].find("</saml:Issuer>").unwrap() + "</saml:Issuer>".len();
    format!("{}{}{}", &xml[..issuer_end], signature, &xml[issuer_end..])
}
