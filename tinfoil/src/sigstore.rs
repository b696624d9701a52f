//! Sigstore bundle verification for code provenance.
//!
//! Verifies a DSSE-enveloped in-toto statement against a compiled-in
//! Sigstore trust root (no TUF network fetch): the signing certificate
//! must chain to a trusted Fulcio CA and satisfy the GitHub Actions
//! identity policy, the Rekor log entry's signed timestamp must verify
//! under a trusted log key, and the statement's subject digest must bind
//! the bundle to the expected release artifact. The statement's
//! measurement predicate is the output.

use std::sync::OnceLock;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use der::asn1::{ObjectIdentifier, Utf8StringRef};
use der::{Decode, Encode};
use serde::Deserialize;

use crate::attestation::{Measurement, PredicateType};
use crate::error::{Result, TinfoilError};
use crate::x509::Certificate;

/// The OIDC issuer GitHub Actions workflows authenticate through.
pub const GITHUB_OIDC_ISSUER: &str = "https://token.actions.githubusercontent.com";

/// DSSE payload type for in-toto statements.
const INTOTO_PAYLOAD_TYPE: &str = "application/vnd.in-toto+json";

/// Fulcio certificate extension: OIDC issuer (deprecated raw encoding).
const OID_FULCIO_ISSUER_V1: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.1");
/// Fulcio certificate extension: GitHub workflow repository (raw).
const OID_FULCIO_WORKFLOW_REPOSITORY: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.5");
/// Fulcio certificate extension: GitHub workflow ref (raw).
const OID_FULCIO_WORKFLOW_REF: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.6");
/// Fulcio certificate extension: OIDC issuer (DER UTF8String).
const OID_FULCIO_ISSUER_V2: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.8");
/// Fulcio certificate extension: source repository URI (DER UTF8String).
const OID_FULCIO_SOURCE_REPOSITORY_URI: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.12");
/// Fulcio certificate extension: source repository ref (DER UTF8String).
const OID_FULCIO_SOURCE_REPOSITORY_REF: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.14");

/// Compiled-in Sigstore trust root, in the `trusted_root.json` schema.
const TRUSTED_ROOT_JSON: &str = include_str!("../assets/trusted_root.json");

// ---------------------------------------------------------------------------
// Trust root
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrustedRootFile {
    #[serde(default)]
    tlogs: Vec<TlogConfig>,
    #[serde(default)]
    certificate_authorities: Vec<CaConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TlogConfig {
    public_key: TlogKey,
    log_id: LogIdConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TlogKey {
    raw_bytes: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogIdConfig {
    key_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CaConfig {
    cert_chain: CertChainConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CertChainConfig {
    certificates: Vec<RawCertConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCertConfig {
    raw_bytes: String,
}

/// A Rekor transparency-log key from the trust root.
#[derive(Debug, Clone)]
struct RekorKey {
    key_id: Vec<u8>,
    sec1_public_key: Vec<u8>,
}

/// The Sigstore trust root: Fulcio CA chains and Rekor log keys.
#[derive(Debug, Clone)]
pub struct TrustRoot {
    ca_certs: Vec<Certificate>,
    rekor_keys: Vec<RekorKey>,
}

impl TrustRoot {
    /// The compiled-in trust root.
    pub fn bundled() -> &'static TrustRoot {
        static ROOT: OnceLock<TrustRoot> = OnceLock::new();
        ROOT.get_or_init(|| {
            TrustRoot::from_json(TRUSTED_ROOT_JSON)
                .expect("compiled-in Sigstore trust root is valid")
        })
    }

    /// Parse a trust root from `trusted_root.json` contents.
    pub fn from_json(json: &str) -> Result<Self> {
        let file: TrustedRootFile = serde_json::from_str(json)
            .map_err(|e| TinfoilError::attestation_with("invalid Sigstore trust root", e))?;

        let mut ca_certs = Vec::new();
        for ca in &file.certificate_authorities {
            for raw in &ca.cert_chain.certificates {
                let der = BASE64.decode(&raw.raw_bytes).map_err(|e| {
                    TinfoilError::attestation_with("trust root certificate is not base64", e)
                })?;
                ca_certs.push(Certificate::from_der(&der)?);
            }
        }

        let mut rekor_keys = Vec::new();
        for tlog in &file.tlogs {
            let spki_der = BASE64.decode(&tlog.public_key.raw_bytes).map_err(|e| {
                TinfoilError::attestation_with("trust root log key is not base64", e)
            })?;
            let spki = spki::SubjectPublicKeyInfoRef::from_der(&spki_der)
                .map_err(|e| TinfoilError::attestation_with("trust root log key is not SPKI", e))?;
            let sec1 = spki
                .subject_public_key
                .as_bytes()
                .ok_or_else(|| TinfoilError::attestation("trust root log key has unused bits"))?
                .to_vec();
            let key_id = BASE64.decode(&tlog.log_id.key_id).map_err(|e| {
                TinfoilError::attestation_with("trust root log ID is not base64", e)
            })?;
            rekor_keys.push(RekorKey {
                key_id,
                sec1_public_key: sec1,
            });
        }

        if ca_certs.is_empty() {
            return Err(TinfoilError::attestation(
                "Sigstore trust root has no certificate authorities",
            ));
        }
        Ok(Self {
            ca_certs,
            rekor_keys,
        })
    }

    fn rekor_key(&self, key_id: &[u8]) -> Option<&RekorKey> {
        self.rekor_keys.iter().find(|key| key.key_id == key_id)
    }
}

// ---------------------------------------------------------------------------
// Bundle model
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Bundle {
    verification_material: VerificationMaterial,
    dsse_envelope: Option<DsseEnvelope>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerificationMaterial {
    #[serde(default)]
    certificate: Option<RawCertConfig>,
    #[serde(default)]
    x509_certificate_chain: Option<CertChainConfig>,
    #[serde(default)]
    tlog_entries: Vec<TlogEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TlogEntry {
    #[serde(deserialize_with = "string_or_number")]
    log_index: i64,
    log_id: LogIdConfig,
    #[serde(deserialize_with = "string_or_number")]
    integrated_time: i64,
    #[serde(default)]
    inclusion_promise: Option<InclusionPromise>,
    #[serde(default)]
    canonicalized_body: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InclusionPromise {
    signed_entry_timestamp: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DsseEnvelope {
    payload: String,
    payload_type: String,
    signatures: Vec<DsseSignature>,
}

#[derive(Debug, Deserialize)]
struct DsseSignature {
    sig: String,
}

/// Protobuf JSON renders 64-bit integers as strings; accept both.
fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        String(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::String(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Deserialize)]
struct InTotoStatement {
    #[serde(default)]
    subject: Vec<Subject>,
    #[serde(rename = "predicateType")]
    predicate_type: String,
    predicate: Predicate,
}

#[derive(Debug, Deserialize)]
struct Subject {
    digest: SubjectDigest,
}

#[derive(Debug, Deserialize)]
struct SubjectDigest {
    sha256: String,
}

#[derive(Debug, Deserialize)]
struct Predicate {
    snp_measurement: String,
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Verify a Sigstore bundle against the compiled-in trust root.
///
/// Binds the bundle to `expected_digest` (hex SHA-256 of the release
/// artifact, case-insensitive) and enforces the identity policy: OIDC
/// issuer is GitHub Actions, the workflow repository is `repo`, and the
/// workflow ref is a tag. Returns the measurement from the statement's
/// predicate.
pub fn verify_sigstore_bundle(
    bundle_json: &serde_json::Value,
    expected_digest: &str,
    repo: &str,
) -> Result<Measurement> {
    verify_sigstore_bundle_with(bundle_json, expected_digest, repo, TrustRoot::bundled())
}

/// Verify a Sigstore bundle against an explicit trust root.
pub fn verify_sigstore_bundle_with(
    bundle_json: &serde_json::Value,
    expected_digest: &str,
    repo: &str,
    trust_root: &TrustRoot,
) -> Result<Measurement> {
    let bundle: Bundle = serde_json::from_value(bundle_json.clone())
        .map_err(|e| TinfoilError::attestation_with("malformed Sigstore bundle", e))?;

    let envelope = bundle
        .dsse_envelope
        .as_ref()
        .ok_or_else(|| TinfoilError::attestation("Sigstore bundle has no DSSE envelope"))?;

    let leaf = leaf_certificate(&bundle.verification_material)?;

    // Rekor log consistency: a trusted log must have promised inclusion.
    let entry = bundle
        .verification_material
        .tlog_entries
        .first()
        .ok_or_else(|| TinfoilError::attestation("Sigstore bundle has no transparency log entry"))?;
    verify_log_entry(entry, trust_root)?;

    // The short-lived Fulcio certificate must have been valid when the
    // log integrated the entry, and must chain to a trusted CA.
    if !leaf.valid_at(entry.integrated_time) {
        return Err(TinfoilError::attestation(
            "signing certificate not valid at log integration time",
        ));
    }
    verify_chain_to_trust_root(&leaf, trust_root)?;

    verify_identity_policy(&leaf, repo)?;

    // DSSE envelope signature over the pre-authentication encoding.
    let payload = BASE64
        .decode(&envelope.payload)
        .map_err(|e| TinfoilError::attestation_with("DSSE payload is not base64", e))?;
    let signature = envelope
        .signatures
        .first()
        .ok_or_else(|| TinfoilError::attestation("DSSE envelope has no signatures"))?;
    let sig_der = BASE64
        .decode(&signature.sig)
        .map_err(|e| TinfoilError::attestation_with("DSSE signature is not base64", e))?;
    let pae = pre_authentication_encoding(&envelope.payload_type, &payload);
    crate::x509::verify_ecdsa_p256_der(leaf.public_key_bits()?, &pae, &sig_der)
        .map_err(|e| TinfoilError::attestation_with("DSSE envelope signature invalid", e))?;

    if envelope.payload_type != INTOTO_PAYLOAD_TYPE {
        return Err(TinfoilError::attestation(format!(
            "unsupported DSSE payload type: {}",
            envelope.payload_type
        )));
    }

    // Bind the statement to the release artifact.
    let statement: InTotoStatement = serde_json::from_slice(&payload)
        .map_err(|e| TinfoilError::attestation_with("malformed in-toto statement", e))?;
    let subject = statement
        .subject
        .first()
        .ok_or_else(|| TinfoilError::attestation("in-toto statement has no subject"))?;
    if !subject.digest.sha256.eq_ignore_ascii_case(expected_digest) {
        return Err(TinfoilError::attestation(format!(
            "statement subject digest {} does not match release digest {expected_digest}",
            subject.digest.sha256
        )));
    }

    let predicate_type = PredicateType::from_uri(&statement.predicate_type)?;
    if predicate_type != PredicateType::SnpTdxMultiplatformV1 {
        return Err(TinfoilError::attestation(format!(
            "unsupported statement predicate type: {}",
            statement.predicate_type
        )));
    }

    tracing::debug!(repo, "Sigstore bundle verified");
    Ok(Measurement {
        predicate_type: PredicateType::SnpTdxMultiplatformV1,
        registers: vec![statement.predicate.snp_measurement],
    })
}

fn leaf_certificate(material: &VerificationMaterial) -> Result<Certificate> {
    let raw = if let Some(cert) = &material.certificate {
        &cert.raw_bytes
    } else if let Some(first) = material
        .x509_certificate_chain
        .as_ref()
        .and_then(|chain| chain.certificates.first())
    {
        &first.raw_bytes
    } else {
        return Err(TinfoilError::attestation(
            "Sigstore bundle has no signing certificate",
        ));
    };
    let der = BASE64
        .decode(raw)
        .map_err(|e| TinfoilError::attestation_with("signing certificate is not base64", e))?;
    Certificate::from_der(&der)
}

/// Walk issuer links from the leaf up to a self-signed trust-root CA,
/// verifying each signature.
fn verify_chain_to_trust_root(leaf: &Certificate, trust_root: &TrustRoot) -> Result<()> {
    let mut current = leaf.clone();
    // Bounded walk; Fulcio chains are at most a few certificates deep.
    for _ in 0..4 {
        let issuer_der = name_der(&current, NameSide::Issuer)?;
        let issuer = trust_root
            .ca_certs
            .iter()
            .find(|ca| {
                name_der(ca, NameSide::Subject)
                    .map(|der| der == issuer_der)
                    .unwrap_or(false)
            })
            .ok_or_else(|| {
                TinfoilError::attestation("signing certificate does not chain to the trust root")
            })?;
        current
            .verify_signed_by(issuer)
            .map_err(|e| TinfoilError::attestation_with("certificate chain signature invalid", e))?;

        let self_signed = name_der(issuer, NameSide::Issuer)? == name_der(issuer, NameSide::Subject)?;
        if self_signed {
            issuer
                .verify_signed_by(issuer)
                .map_err(|e| TinfoilError::attestation_with("trust root self-signature invalid", e))?;
            return Ok(());
        }
        current = issuer.clone();
    }
    Err(TinfoilError::attestation(
        "certificate chain too deep for trust root",
    ))
}

enum NameSide {
    Subject,
    Issuer,
}

fn name_der(cert: &Certificate, side: NameSide) -> Result<Vec<u8>> {
    let name = match side {
        NameSide::Subject => cert.subject(),
        NameSide::Issuer => cert.issuer(),
    };
    name.to_der()
        .map_err(|e| TinfoilError::attestation_with("failed to encode distinguished name", e))
}

/// Enforce the certificate identity policy: GitHub's OIDC issuer, the
/// expected workflow repository, and a tag ref.
fn verify_identity_policy(leaf: &Certificate, repo: &str) -> Result<()> {
    let issuer = fulcio_utf8_extension(leaf, OID_FULCIO_ISSUER_V2)?
        .or_else(|| fulcio_raw_extension(leaf, OID_FULCIO_ISSUER_V1))
        .ok_or_else(|| TinfoilError::attestation("signing certificate has no OIDC issuer"))?;
    if issuer != GITHUB_OIDC_ISSUER {
        return Err(TinfoilError::attestation(format!(
            "unexpected OIDC issuer: {issuer}"
        )));
    }

    let repository = fulcio_raw_extension(leaf, OID_FULCIO_WORKFLOW_REPOSITORY)
        .or_else(|| {
            fulcio_utf8_extension(leaf, OID_FULCIO_SOURCE_REPOSITORY_URI)
                .ok()
                .flatten()
                .and_then(|uri| uri.strip_prefix("https://github.com/").map(str::to_string))
        })
        .ok_or_else(|| TinfoilError::attestation("signing certificate has no workflow repository"))?;
    if repository != repo {
        return Err(TinfoilError::attestation(format!(
            "certificate workflow repository {repository} does not match {repo}"
        )));
    }

    let workflow_ref = fulcio_raw_extension(leaf, OID_FULCIO_WORKFLOW_REF)
        .or_else(|| {
            fulcio_utf8_extension(leaf, OID_FULCIO_SOURCE_REPOSITORY_REF)
                .ok()
                .flatten()
        })
        .ok_or_else(|| TinfoilError::attestation("signing certificate has no workflow ref"))?;
    if !workflow_ref.starts_with("refs/tags/") {
        return Err(TinfoilError::attestation(format!(
            "certificate workflow ref {workflow_ref} is not a release tag"
        )));
    }

    Ok(())
}

/// Read a legacy Fulcio extension whose value is the raw string bytes.
fn fulcio_raw_extension(cert: &Certificate, oid: ObjectIdentifier) -> Option<String> {
    cert.extension(oid)
        .map(|(_, value)| String::from_utf8_lossy(value).into_owned())
}

/// Read a Fulcio extension whose value is a DER UTF8String.
fn fulcio_utf8_extension(cert: &Certificate, oid: ObjectIdentifier) -> Result<Option<String>> {
    let Some((_, value)) = cert.extension(oid) else {
        return Ok(None);
    };
    let utf8 = Utf8StringRef::from_der(value).map_err(|e| {
        TinfoilError::attestation_with(format!("Fulcio extension {oid} is not a UTF8String"), e)
    })?;
    Ok(Some(utf8.as_str().to_string()))
}

/// Verify a transparency log entry's signed entry timestamp under a
/// trusted Rekor key.
fn verify_log_entry(entry: &TlogEntry, trust_root: &TrustRoot) -> Result<()> {
    let key_id = BASE64
        .decode(&entry.log_id.key_id)
        .map_err(|e| TinfoilError::attestation_with("log entry key ID is not base64", e))?;
    let rekor_key = trust_root.rekor_key(&key_id).ok_or_else(|| {
        TinfoilError::attestation("log entry signed by an unknown transparency log")
    })?;

    let promise = entry.inclusion_promise.as_ref().ok_or_else(|| {
        TinfoilError::attestation("log entry has no inclusion promise")
    })?;
    let set = BASE64
        .decode(&promise.signed_entry_timestamp)
        .map_err(|e| TinfoilError::attestation_with("signed entry timestamp is not base64", e))?;
    let body = entry.canonicalized_body.as_deref().ok_or_else(|| {
        TinfoilError::attestation("log entry has no canonicalized body")
    })?;

    let payload = set_payload(body, entry.integrated_time, &key_id, entry.log_index);
    crate::x509::verify_ecdsa_p256_der(&rekor_key.sec1_public_key, payload.as_bytes(), &set)
        .map_err(|e| TinfoilError::attestation_with("signed entry timestamp invalid", e))
}

/// Canonical JSON the Rekor signed entry timestamp covers. Keys are in
/// lexicographic order with no whitespace.
fn set_payload(body_b64: &str, integrated_time: i64, key_id: &[u8], log_index: i64) -> String {
    format!(
        "{{\"body\":\"{body_b64}\",\"integratedTime\":{integrated_time},\"logID\":\"{}\",\"logIndex\":{log_index}}}",
        hex::encode(key_id)
    )
}

/// DSSE pre-authentication encoding: `DSSEv1 <len> <type> <len> <body>`.
fn pre_authentication_encoding(payload_type: &str, payload: &[u8]) -> Vec<u8> {
    let mut pae = Vec::with_capacity(payload.len() + payload_type.len() + 32);
    pae.extend_from_slice(b"DSSEv1 ");
    pae.extend_from_slice(payload_type.len().to_string().as_bytes());
    pae.push(b' ');
    pae.extend_from_slice(payload_type.as_bytes());
    pae.push(b' ');
    pae.extend_from_slice(payload.len().to_string().as_bytes());
    pae.push(b' ');
    pae.extend_from_slice(payload);
    pae
}
