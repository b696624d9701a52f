//! End-to-end verification against a recorded attestation bundle.
//!
//! `fixtures/bundle.json` is a complete bundle whose AMD chain, report
//! signature, Sigstore bundle, and certificate SANs all verify under the
//! compiled-in trust anchors (regenerate with `fixtures/generate.py`).
//! The tampering scenarios each flip one field and assert the exact step
//! that fails.

use async_trait::async_trait;
use std::sync::Arc;

use tinfoil::bundle::{HttpClient, HttpResponse};
use tinfoil::verify::{StepStatus, VerificationDocument};
use tinfoil::{
    AttestationBundle, BundleAssembler, PredicateType, TinfoilError, Verifier, DEFAULT_CONFIG_REPO,
};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

fn golden_bundle() -> AttestationBundle {
    serde_json::from_str(include_str!("fixtures/bundle.json"))
        .expect("fixture bundle parses")
}

fn verify(bundle: &AttestationBundle) -> (VerificationDocument, tinfoil::Result<tinfoil::AttestationResponse>) {
    let verifier = Verifier::new(DEFAULT_CONFIG_REPO);
    let mut doc = VerificationDocument::new(DEFAULT_CONFIG_REPO, &bundle.domain);
    let result = verifier.verify_bundle(bundle, &mut doc);
    (doc, result)
}

#[test]
fn golden_bundle_verifies() {
    let bundle = golden_bundle();
    let (doc, result) = verify(&bundle);
    let response = result.expect("golden bundle verifies");

    assert_eq!(
        response.measurement.predicate_type,
        PredicateType::SnpTdxMultiplatformV1
    );
    assert!(!response.measurement.registers.is_empty());
    assert!(!response.hpke_public_key.is_empty());
    assert_eq!(response.tls_public_key_fingerprint.len(), 64);

    assert!(doc.security_verified);
    for step in [
        &doc.steps.fetch_digest,
        &doc.steps.verify_code,
        &doc.steps.verify_enclave,
        &doc.steps.compare_measurements,
        &doc.steps.verify_certificate,
    ] {
        assert_eq!(step.status, StepStatus::Success);
        assert!(step.error.is_none());
    }
    assert_eq!(doc.hpke_public_key, response.hpke_public_key);
    assert_eq!(doc.code_fingerprint, doc.enclave_fingerprint);
    assert_eq!(doc.release_digest, bundle.digest);
}

#[test]
fn golden_verification_is_deterministic() {
    let bundle = golden_bundle();
    let (_, first) = verify(&bundle);
    let (_, second) = verify(&bundle);
    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(first.hpke_public_key, second.hpke_public_key);
    assert_eq!(first.measurement, second.measurement);
}

#[test]
fn tampered_digest_fails_verify_code() {
    let mut bundle = golden_bundle();
    bundle.digest = "aa".repeat(32);

    let (doc, result) = verify(&bundle);
    let err = result.unwrap_err();
    assert!(matches!(err, TinfoilError::Attestation { .. }));
    assert!(!doc.security_verified);
    assert_eq!(doc.steps.verify_enclave.status, StepStatus::Success);
    assert_eq!(doc.steps.verify_code.status, StepStatus::Failed);
    assert!(doc
        .steps
        .verify_code
        .error
        .as_deref()
        .unwrap()
        .contains("digest"));
    // Verification stopped there.
    assert_eq!(doc.steps.compare_measurements.status, StepStatus::Pending);
    assert_eq!(doc.steps.verify_certificate.status, StepStatus::Pending);
}

#[test]
fn tampered_report_body_fails_verify_enclave() {
    let mut bundle = golden_bundle();
    bundle.enclave_attestation_report.body = "!!!garbage!!!".to_string();

    let (doc, result) = verify(&bundle);
    assert!(matches!(result.unwrap_err(), TinfoilError::Attestation { .. }));
    assert_eq!(doc.steps.verify_enclave.status, StepStatus::Failed);
    assert!(!doc.security_verified);
}

#[test]
fn tampered_report_signature_fails_verify_enclave() {
    let mut bundle = golden_bundle();
    // Flip one bit inside the measurement: the VCEK signature no longer
    // covers the report.
    let mut raw = tinfoil::codec::decode_report_body(&bundle.enclave_attestation_report.body)
        .unwrap();
    raw[0x90] ^= 1;
    bundle.enclave_attestation_report.body = tinfoil::codec::encode_report_body(&raw).unwrap();

    let (doc, result) = verify(&bundle);
    assert!(result.is_err());
    assert_eq!(doc.steps.verify_enclave.status, StepStatus::Failed);
}

#[test]
fn certificate_domain_mismatch() {
    let mut bundle = golden_bundle();
    bundle.domain = "wrong.example.com".to_string();

    let (doc, result) = verify(&bundle);
    let err = result.unwrap_err();
    assert!(err.to_string().contains("Certificate domain mismatch"));
    assert_eq!(doc.steps.verify_certificate.status, StepStatus::Failed);
    // Everything before the certificate step had already passed.
    assert_eq!(doc.steps.verify_enclave.status, StepStatus::Success);
    assert_eq!(doc.steps.verify_code.status, StepStatus::Success);
    assert_eq!(doc.steps.compare_measurements.status, StepStatus::Success);
}

#[test]
fn certificate_hpke_key_mismatch() {
    let mut bundle = golden_bundle();
    bundle.enclave_cert = include_str!("fixtures/enclave_cert_zero_hpke.pem").to_string();

    let (doc, result) = verify(&bundle);
    let err = result.unwrap_err();
    assert!(err.to_string().contains("HPKE key mismatch"));
    assert_eq!(doc.steps.verify_certificate.status, StepStatus::Failed);
}

#[test]
fn wrong_repo_fails_identity_policy() {
    let bundle = golden_bundle();
    let verifier = Verifier::new("someone-else/other-repo");
    let mut doc = VerificationDocument::new("someone-else/other-repo", &bundle.domain);
    let err = verifier.verify_bundle(&bundle, &mut doc).unwrap_err();
    assert!(err.to_string().contains("repository"));
    assert_eq!(doc.steps.verify_code.status, StepStatus::Failed);
}

/// Serves the five fixture endpoints the assembler fetches.
struct FixtureEndpoints {
    bundle: AttestationBundle,
}

#[async_trait]
impl HttpClient for FixtureEndpoints {
    async fn get(&self, url: &str) -> tinfoil::Result<HttpResponse> {
        let json = |value: serde_json::Value| HttpResponse {
            status: 200,
            body: serde_json::to_vec(&value).unwrap(),
            content_type: Some("application/json".to_string()),
        };

        if url.contains("/.well-known/tinfoil-attestation") {
            Ok(json(serde_json::to_value(&self.bundle.enclave_attestation_report).unwrap()))
        } else if url.contains("/.well-known/tinfoil-certificate") {
            Ok(json(serde_json::json!({"certificate": self.bundle.enclave_cert})))
        } else if url.contains("/releases/latest") {
            Ok(json(serde_json::json!({
                "tag_name": "v0.9.2",
                "body": format!("EIF hash: {}", self.bundle.digest),
            })))
        } else if url.contains("/attestations/sha256:") {
            Ok(json(serde_json::json!({
                "attestations": [{"bundle": self.bundle.sigstore_bundle}]
            })))
        } else if url.contains("/vcek/v1/Genoa/") {
            Ok(HttpResponse {
                status: 200,
                body: BASE64.decode(&self.bundle.vcek).unwrap(),
                content_type: Some("application/octet-stream".to_string()),
            })
        } else {
            Err(TinfoilError::fetch(url, "unexpected fixture URL"))
        }
    }

    async fn post_json(
        &self,
        url: &str,
        _body: serde_json::Value,
    ) -> tinfoil::Result<HttpResponse> {
        Err(TinfoilError::fetch(url, "unexpected POST"))
    }

    async fn send_bytes(
        &self,
        _method: &str,
        url: &str,
        _content_type: &str,
        _body: Vec<u8>,
    ) -> tinfoil::Result<HttpResponse> {
        Err(TinfoilError::fetch(url, "unexpected raw request"))
    }
}

#[tokio::test]
async fn assembled_bundle_matches_recorded_and_verifies() {
    let golden = golden_bundle();
    let assembler = BundleAssembler::with_http(Arc::new(FixtureEndpoints {
        bundle: golden.clone(),
    }));

    let assembled = assembler
        .assemble(&golden.domain, DEFAULT_CONFIG_REPO)
        .await
        .expect("assembly from fixture endpoints succeeds");

    assert_eq!(assembled.domain, golden.domain);
    assert_eq!(assembled.digest, golden.digest);
    assert_eq!(assembled.vcek, golden.vcek);
    assert_eq!(
        assembled.enclave_attestation_report.body,
        golden.enclave_attestation_report.body
    );

    let (doc, result) = verify(&assembled);
    assert!(result.is_ok());
    assert!(doc.security_verified);
}

#[tokio::test]
async fn vcek_cache_serves_identical_bytes() {
    let golden = golden_bundle();
    let assembler = BundleAssembler::with_http(Arc::new(FixtureEndpoints {
        bundle: golden.clone(),
    }));

    let first = assembler
        .assemble(&golden.domain, DEFAULT_CONFIG_REPO)
        .await
        .unwrap();
    let second = assembler
        .assemble(&golden.domain, DEFAULT_CONFIG_REPO)
        .await
        .unwrap();
    assert_eq!(first.vcek, second.vcek);
}
