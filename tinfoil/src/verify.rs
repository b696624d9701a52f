//! Verification orchestrator.
//!
//! Sequences the full proof over an [`AttestationBundle`]: hardware
//! attestation (enclave), code provenance (Sigstore), measurement
//! comparison, and certificate binding. Progress is recorded step by
//! step in a [`VerificationDocument`], the canonical audit record of
//! what passed and what failed; the document is populated on both
//! success and failure and stays readable afterwards.

use serde::{Deserialize, Serialize};

use crate::attestation::{
    compare_measurements, verify_attestation_with, AttestationDocument, AttestationResponse,
    Measurement,
};
use crate::bundle::AttestationBundle;
use crate::chain::AmdRoots;
use crate::codec::{decode_san_payload, SAN_PREFIX_HATT, SAN_PREFIX_HPKE};
use crate::error::{Result, TinfoilError};
use crate::policy::ValidationOptions;
use crate::sigstore::{verify_sigstore_bundle_with, TrustRoot};
use crate::x509::{domain_matches_sans, Certificate};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// State of one verification step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Success,
    Failed,
}

/// One verification step with its outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationStep {
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Default for VerificationStep {
    fn default() -> Self {
        Self {
            status: StepStatus::Pending,
            error: None,
        }
    }
}

/// The five steps of a verification pass, in execution order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationSteps {
    pub fetch_digest: VerificationStep,
    pub verify_code: VerificationStep,
    pub verify_enclave: VerificationStep,
    pub compare_measurements: VerificationStep,
    pub verify_certificate: VerificationStep,
}

/// Audit record of one verification pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationDocument {
    pub config_repo: String,
    pub enclave_host: String,
    pub release_digest: String,
    pub code_measurement: Option<Measurement>,
    pub enclave_measurement: Option<Measurement>,
    pub tls_public_key: String,
    pub hpke_public_key: String,
    pub code_fingerprint: String,
    pub enclave_fingerprint: String,
    pub selected_router_endpoint: Option<String>,
    pub security_verified: bool,
    pub steps: VerificationSteps,
}

impl VerificationDocument {
    /// A fresh document: every step pending, nothing verified.
    pub fn new(config_repo: &str, enclave_host: &str) -> Self {
        Self {
            config_repo: config_repo.to_string(),
            enclave_host: enclave_host.to_string(),
            release_digest: String::new(),
            code_measurement: None,
            enclave_measurement: None,
            tls_public_key: String::new(),
            hpke_public_key: String::new(),
            code_fingerprint: String::new(),
            enclave_fingerprint: String::new(),
            selected_router_endpoint: None,
            security_verified: false,
            steps: VerificationSteps::default(),
        }
    }
}

/// Verifies attestation bundles against AMD and Sigstore trust anchors.
pub struct Verifier {
    config_repo: String,
    roots: AmdRoots,
    trust_root: TrustRoot,
    options: ValidationOptions,
}

impl Verifier {
    /// Verifier with the compiled-in trust anchors and default policy.
    pub fn new(config_repo: &str) -> Self {
        Self {
            config_repo: config_repo.to_string(),
            roots: AmdRoots::bundled(),
            trust_root: TrustRoot::bundled().clone(),
            options: ValidationOptions::default(),
        }
    }

    /// Verifier with explicit trust anchors and policy.
    pub fn with_trust(
        config_repo: &str,
        roots: AmdRoots,
        trust_root: TrustRoot,
        options: ValidationOptions,
    ) -> Self {
        Self {
            config_repo: config_repo.to_string(),
            roots,
            trust_root,
            options,
        }
    }

    /// Verify a bundle, mutating `doc` as steps progress.
    ///
    /// Steps run strictly in order; the first failure finalizes the
    /// document with `security_verified = false` and returns the error.
    pub fn verify_bundle(
        &self,
        bundle: &AttestationBundle,
        doc: &mut VerificationDocument,
    ) -> Result<AttestationResponse> {
        doc.release_digest = bundle.digest.clone();
        if doc.enclave_host.is_empty() {
            doc.enclave_host = bundle.domain.clone();
        }
        // The assembler already resolved the digest.
        doc.steps.fetch_digest.status = StepStatus::Success;

        let enclave = run_step(&mut doc.steps.verify_enclave, || {
            let vcek = BASE64.decode(&bundle.vcek).map_err(|e| {
                TinfoilError::attestation_with("bundle VCEK is not valid base64", e)
            })?;
            verify_attestation_with(
                &bundle.enclave_attestation_report,
                &vcek,
                &self.roots,
                &self.options,
            )
        })?;

        let code_measurement = run_step(&mut doc.steps.verify_code, || {
            verify_sigstore_bundle_with(
                &bundle.sigstore_bundle,
                &bundle.digest,
                &self.config_repo,
                &self.trust_root,
            )
        })?;

        run_step(&mut doc.steps.compare_measurements, || {
            compare_measurements(&enclave.measurement, &code_measurement)
        })?;

        run_step(&mut doc.steps.verify_certificate, || {
            verify_certificate_binding(
                &bundle.enclave_cert,
                &bundle.domain,
                &enclave.hpke_public_key,
                &bundle.enclave_attestation_report,
            )
        })?;

        doc.tls_public_key = enclave.tls_public_key_fingerprint.clone();
        doc.hpke_public_key = enclave.hpke_public_key.clone();
        doc.code_fingerprint = code_measurement.fingerprint();
        doc.enclave_fingerprint = enclave.measurement.fingerprint();
        doc.code_measurement = Some(code_measurement);
        doc.enclave_measurement = Some(enclave.measurement.clone());
        doc.security_verified = true;

        tracing::info!(
            host = %doc.enclave_host,
            measurement = %doc.enclave_fingerprint,
            "bundle verification succeeded"
        );
        Ok(enclave)
    }
}

fn run_step<T>(
    step: &mut VerificationStep,
    op: impl FnOnce() -> Result<T>,
) -> Result<T> {
    match op() {
        Ok(value) => {
            step.status = StepStatus::Success;
            Ok(value)
        }
        Err(error) => {
            step.status = StepStatus::Failed;
            step.error = Some(error.to_string());
            Err(error)
        }
    }
}

/// Bind the enclave's TLS certificate to the verified attestation:
/// the served domain must match a SAN, the `hpke` SAN payload must be
/// the attested HPKE public key, and the `hatt` SAN payload must be the
/// hex hash of the attestation document.
pub fn verify_certificate_binding(
    cert_pem: &str,
    domain: &str,
    hpke_public_key_hex: &str,
    attestation: &AttestationDocument,
) -> Result<()> {
    let cert = Certificate::from_pem(cert_pem)?;
    let sans = cert.dns_sans()?;

    if !domain_matches_sans(&sans, domain) {
        return Err(TinfoilError::attestation(format!(
            "Certificate domain mismatch: {domain} not covered by certificate SANs"
        )));
    }

    let hpke_payload = decode_san_payload(&sans, SAN_PREFIX_HPKE)?;
    if hex::encode(&hpke_payload) != hpke_public_key_hex {
        return Err(TinfoilError::attestation(
            "HPKE key mismatch: certificate SAN key differs from attested key",
        ));
    }

    let hatt_payload = decode_san_payload(&sans, SAN_PREFIX_HATT)?;
    let hatt_hex = String::from_utf8(hatt_payload).map_err(|e| {
        TinfoilError::attestation_with("certificate attestation hash is not ASCII hex", e)
    })?;
    if hatt_hex != attestation.hash() {
        return Err(TinfoilError::attestation(
            "attestation document hash mismatch in certificate SAN",
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::PredicateType;

    fn minimal_bundle() -> AttestationBundle {
        AttestationBundle {
            domain: "inference.example.com".to_string(),
            enclave_attestation_report: AttestationDocument {
                format: PredicateType::SevGuestV2,
                body: "!!garbage!!".to_string(),
            },
            digest: "aa".repeat(32),
            sigstore_bundle: serde_json::json!({}),
            vcek: "AQID".to_string(),
            enclave_cert: String::new(),
        }
    }

    #[test]
    fn test_document_initial_state() {
        let doc = VerificationDocument::new("org/repo", "e.example.com");
        assert!(!doc.security_verified);
        assert_eq!(doc.steps.fetch_digest.status, StepStatus::Pending);
        assert_eq!(doc.steps.verify_certificate.status, StepStatus::Pending);
        assert!(doc.code_measurement.is_none());
    }

    #[test]
    fn test_step_status_serializes_lowercase() {
        let step = VerificationStep {
            status: StepStatus::Failed,
            error: Some("boom".to_string()),
        };
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"], "boom");
    }

    #[test]
    fn test_pending_step_omits_error() {
        let json = serde_json::to_value(VerificationStep::default()).unwrap();
        assert_eq!(json["status"], "pending");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_tampered_report_body_fails_verify_enclave() {
        let verifier = Verifier::new("org/repo");
        let bundle = minimal_bundle();
        let mut doc = VerificationDocument::new("org/repo", &bundle.domain);

        let err = verifier.verify_bundle(&bundle, &mut doc).unwrap_err();
        assert!(matches!(err, TinfoilError::Attestation { .. }));
        assert!(!doc.security_verified);
        assert_eq!(doc.steps.fetch_digest.status, StepStatus::Success);
        assert_eq!(doc.steps.verify_enclave.status, StepStatus::Failed);
        assert!(doc.steps.verify_enclave.error.is_some());
        // Later steps were skipped.
        assert_eq!(doc.steps.verify_code.status, StepStatus::Pending);
        assert_eq!(doc.steps.compare_measurements.status, StepStatus::Pending);
    }

    #[test]
    fn test_document_records_digest_on_failure() {
        let verifier = Verifier::new("org/repo");
        let bundle = minimal_bundle();
        let mut doc = VerificationDocument::new("org/repo", "");
        let _ = verifier.verify_bundle(&bundle, &mut doc);
        assert_eq!(doc.release_digest, bundle.digest);
        assert_eq!(doc.enclave_host, bundle.domain);
    }
}
