//! Attestation documents, measurements, and the enclave verification
//! entry point.
//!
//! [`verify_attestation`] is the high-level operation: decompress the
//! report body, parse it, build and verify the AMD certificate chain,
//! check the report signature and policy, then derive the attested TLS
//! key fingerprint, HPKE public key, and measurement.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::chain::{AmdRoots, CertificateChain};
use crate::codec;
use crate::error::{Result, TinfoilError};
use crate::policy::{validate_report, ValidationOptions};
use crate::report::Report;

/// Attestation document formats, by predicate URI.
///
/// The format distinguishes the register layout of the measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredicateType {
    /// Deprecated single-register SEV-SNP format.
    #[serde(rename = "https://tinfoil.sh/predicate/sev-snp-guest/v1")]
    SevGuestV1,
    /// Single-register SEV-SNP format.
    #[serde(rename = "https://tinfoil.sh/predicate/sev-snp-guest/v2")]
    SevGuestV2,
    /// Multi-platform format: the first register is the SNP measurement.
    #[serde(rename = "https://tinfoil.sh/predicate/snp-tdx-multiplatform/v1")]
    SnpTdxMultiplatformV1,
}

impl PredicateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredicateType::SevGuestV1 => "https://tinfoil.sh/predicate/sev-snp-guest/v1",
            PredicateType::SevGuestV2 => "https://tinfoil.sh/predicate/sev-snp-guest/v2",
            PredicateType::SnpTdxMultiplatformV1 => {
                "https://tinfoil.sh/predicate/snp-tdx-multiplatform/v1"
            }
        }
    }

    pub fn from_uri(uri: &str) -> Result<Self> {
        match uri {
            "https://tinfoil.sh/predicate/sev-snp-guest/v1" => Ok(PredicateType::SevGuestV1),
            "https://tinfoil.sh/predicate/sev-snp-guest/v2" => Ok(PredicateType::SevGuestV2),
            "https://tinfoil.sh/predicate/snp-tdx-multiplatform/v1" => {
                Ok(PredicateType::SnpTdxMultiplatformV1)
            }
            other => Err(TinfoilError::attestation(format!(
                "unknown predicate type: {other}"
            ))),
        }
    }
}

impl fmt::Display for PredicateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An attestation document as served by the enclave: the predicate URI
/// and a base64-encoded, gzip-compressed raw SNP report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationDocument {
    pub format: PredicateType,
    pub body: String,
}

impl AttestationDocument {
    /// Hex SHA-256 over `format || body`; the value bound into the
    /// enclave certificate's `hatt` SANs.
    pub fn hash(&self) -> String {
        codec::hash_attestation_document(self.format.as_str(), &self.body)
    }
}

/// A measurement: an ordered sequence of hex register values under a
/// given format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measurement {
    #[serde(rename = "type")]
    pub predicate_type: PredicateType,
    pub registers: Vec<String>,
}

impl Measurement {
    /// Stable fingerprint: the sole register when there is exactly one,
    /// otherwise hex SHA-256 over `type || join(registers, "")`.
    pub fn fingerprint(&self) -> String {
        if self.registers.len() == 1 {
            return self.registers[0].clone();
        }
        let mut hasher = Sha256::new();
        hasher.update(self.predicate_type.as_str().as_bytes());
        for register in &self.registers {
            hasher.update(register.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Compare two measurements for equality.
///
/// Same-format measurements must agree on every register. Across the
/// `SevGuestV2` / `SnpTdxMultiplatformV1` pair only the first register
/// of each is compared (the SNP measurement). Any other format pairing
/// fails.
pub fn compare_measurements(a: &Measurement, b: &Measurement) -> Result<()> {
    use PredicateType::*;

    match (a.predicate_type, b.predicate_type) {
        (x, y) if x == y => {
            if a.registers != b.registers {
                return Err(TinfoilError::attestation("measurement registers mismatch"));
            }
            Ok(())
        }
        (SevGuestV2, SnpTdxMultiplatformV1) | (SnpTdxMultiplatformV1, SevGuestV2) => {
            match (a.registers.first(), b.registers.first()) {
                (Some(x), Some(y)) if x == y => Ok(()),
                _ => Err(TinfoilError::attestation(
                    "SNP measurement register mismatch",
                )),
            }
        }
        (x, y) => Err(TinfoilError::attestation(format!(
            "incomparable measurement types: {x} vs {y}"
        ))),
    }
}

/// Result of verifying an attestation document against AMD hardware
/// trust: the attested transport bindings and the hardware measurement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationResponse {
    /// Hex SHA-256 of the enclave's TLS public key, from the first half
    /// of report data.
    pub tls_public_key_fingerprint: String,
    /// Hex of the enclave's HPKE public key, from the second half of
    /// report data.
    pub hpke_public_key: String,
    /// Launch measurement under the document's format.
    pub measurement: Measurement,
}

/// Verify an attestation document with the compiled-in AMD roots and the
/// default validation policy.
pub fn verify_attestation(doc: &AttestationDocument, vcek_der: &[u8]) -> Result<AttestationResponse> {
    verify_attestation_with(doc, vcek_der, &AmdRoots::bundled(), &ValidationOptions::default())
}

/// Verify an attestation document against explicit roots and policy.
pub fn verify_attestation_with(
    doc: &AttestationDocument,
    vcek_der: &[u8],
    roots: &AmdRoots,
    options: &ValidationOptions,
) -> Result<AttestationResponse> {
    let raw = codec::decode_report_body(&doc.body)?;
    let report = Report::parse(&raw)?;

    let chain = CertificateChain::from_report_with_roots(&report, vcek_der, roots)?;
    chain.verify()?;
    chain.verify_report_signature(&report)?;
    validate_report(&report, &chain, options)?;

    let report_data = report.report_data();
    let response = AttestationResponse {
        tls_public_key_fingerprint: hex::encode(&report_data[..32]),
        hpke_public_key: hex::encode(&report_data[32..]),
        measurement: Measurement {
            predicate_type: doc.format,
            registers: vec![hex::encode(report.measurement())],
        },
    };

    tracing::debug!(
        measurement = %response.measurement.fingerprint(),
        "attestation report verified"
    );
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn measurement(predicate_type: PredicateType, registers: &[&str]) -> Measurement {
        Measurement {
            predicate_type,
            registers: registers.iter().map(|r| r.to_string()).collect(),
        }
    }

    #[test]
    fn test_predicate_uri_round_trip() {
        for predicate in [
            PredicateType::SevGuestV1,
            PredicateType::SevGuestV2,
            PredicateType::SnpTdxMultiplatformV1,
        ] {
            assert_eq!(PredicateType::from_uri(predicate.as_str()).unwrap(), predicate);
        }
        assert!(PredicateType::from_uri("https://example.com/predicate").is_err());
    }

    #[test]
    fn test_document_serde_shape() {
        let doc = AttestationDocument {
            format: PredicateType::SevGuestV2,
            body: "aGVsbG8=".to_string(),
        };
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(
            json["format"],
            "https://tinfoil.sh/predicate/sev-snp-guest/v2"
        );
        assert_eq!(json["body"], "aGVsbG8=");
    }

    #[test]
    fn test_compare_reflexive() {
        let m = measurement(PredicateType::SnpTdxMultiplatformV1, &["aa", "bb", "cc"]);
        assert!(compare_measurements(&m, &m).is_ok());
    }

    #[test]
    fn test_compare_same_type_register_mismatch() {
        let a = measurement(PredicateType::SevGuestV2, &["aa"]);
        let b = measurement(PredicateType::SevGuestV2, &["bb"]);
        assert!(compare_measurements(&a, &b).is_err());
    }

    #[test]
    fn test_compare_cross_type_first_register() {
        let snp = measurement(PredicateType::SevGuestV2, &["aa"]);
        let multi = measurement(PredicateType::SnpTdxMultiplatformV1, &["aa", "r1", "r2"]);
        assert!(compare_measurements(&snp, &multi).is_ok());
        assert!(compare_measurements(&multi, &snp).is_ok());

        let other = measurement(PredicateType::SnpTdxMultiplatformV1, &["zz", "r1", "r2"]);
        assert!(compare_measurements(&snp, &other).is_err());
    }

    #[test]
    fn test_compare_v1_never_crosses() {
        let v1 = measurement(PredicateType::SevGuestV1, &["aa"]);
        let multi = measurement(PredicateType::SnpTdxMultiplatformV1, &["aa"]);
        let v2 = measurement(PredicateType::SevGuestV2, &["aa"]);
        assert!(compare_measurements(&v1, &multi).is_err());
        assert!(compare_measurements(&v1, &v2).is_err());
    }

    #[test]
    fn test_fingerprint_single_register() {
        let m = measurement(PredicateType::SevGuestV2, &["deadbeef"]);
        assert_eq!(m.fingerprint(), "deadbeef");
    }

    #[test]
    fn test_fingerprint_multi_register() {
        use sha2::{Digest, Sha256};
        let m = measurement(PredicateType::SnpTdxMultiplatformV1, &["aa", "bb"]);
        let mut hasher = Sha256::new();
        hasher.update(m.predicate_type.as_str().as_bytes());
        hasher.update(b"aa");
        hasher.update(b"bb");
        assert_eq!(m.fingerprint(), hex::encode(hasher.finalize()));
    }

    #[test]
    fn test_document_hash_matches_codec() {
        let doc = AttestationDocument {
            format: PredicateType::SnpTdxMultiplatformV1,
            body: "Ym9keQ==".to_string(),
        };
        assert_eq!(
            doc.hash(),
            crate::codec::hash_attestation_document(doc.format.as_str(), &doc.body)
        );
    }

    #[test]
    fn test_verify_attestation_rejects_garbage_body() {
        let doc = AttestationDocument {
            format: PredicateType::SevGuestV2,
            body: "!!not-base64!!".to_string(),
        };
        let err = verify_attestation(&doc, &[0u8; 4]).unwrap_err();
        assert!(matches!(err, TinfoilError::Attestation { .. }));
    }
}
