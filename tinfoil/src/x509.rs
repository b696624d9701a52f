//! X.509 and ASN.1 utilities.
//!
//! Thin wrapper over `x509-cert` exposing what attestation verification
//! needs: ordered distinguished-name access, extension lookup by OID,
//! inclusive validity checks, SAN extraction with RFC 6125 wildcard
//! matching, and signature verification over the raw `tbsCertificate`
//! (RSASSA-PSS with SHA-384 via `ring`, ECDSA P-384/P-256 via the
//! RustCrypto signature stack).

use der::asn1::ObjectIdentifier;
use der::{Decode, Encode, Tag, Tagged};
use sha2::{Digest, Sha256};
use x509_cert::certificate::Version;
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::SubjectAltName;
use x509_cert::name::Name;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::error::{Result, TinfoilError};

pub const OID_COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");
pub const OID_COUNTRY: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.6");
pub const OID_LOCALITY: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.7");
pub const OID_STATE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.8");
pub const OID_ORGANIZATION: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.10");
pub const OID_ORG_UNIT: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.11");

pub const OID_SUBJECT_ALT_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.17");

pub const OID_RSASSA_PSS: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.10");
pub const OID_ECDSA_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");
pub const OID_ECDSA_SHA384: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.3");
pub const OID_EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
pub const OID_SECP384R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.132.0.34");

/// A parsed X.509 certificate with its raw and to-be-signed encodings.
#[derive(Debug, Clone)]
pub struct Certificate {
    inner: x509_cert::Certificate,
    raw: Vec<u8>,
    tbs_raw: Vec<u8>,
}

impl Certificate {
    /// Parse a DER-encoded certificate.
    pub fn from_der(raw: &[u8]) -> Result<Self> {
        let inner = x509_cert::Certificate::from_der(raw)
            .map_err(|e| TinfoilError::attestation_with("failed to parse certificate", e))?;
        let tbs_raw = inner
            .tbs_certificate
            .to_der()
            .map_err(|e| TinfoilError::attestation_with("failed to re-encode tbsCertificate", e))?;
        Ok(Self {
            inner,
            raw: raw.to_vec(),
            tbs_raw,
        })
    }

    /// Parse a PEM-encoded certificate.
    pub fn from_pem(pem: &str) -> Result<Self> {
        Self::from_der(&pem_to_der(pem)?)
    }

    /// The DER bytes this certificate was parsed from.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// The DER bytes of the signed `tbsCertificate` region.
    pub fn tbs_raw(&self) -> &[u8] {
        &self.tbs_raw
    }

    pub fn is_v3(&self) -> bool {
        self.inner.tbs_certificate.version == Version::V3
    }

    pub fn subject(&self) -> &Name {
        &self.inner.tbs_certificate.subject
    }

    pub fn issuer(&self) -> &Name {
        &self.inner.tbs_certificate.issuer
    }

    /// Last value of the given attribute in the subject DN.
    ///
    /// X.509 semantics: with multiple values for one attribute type, the
    /// last one wins.
    pub fn subject_get(&self, oid: ObjectIdentifier) -> Option<String> {
        dn_get_last(self.subject(), oid)
    }

    /// Last value of the given attribute in the issuer DN.
    pub fn issuer_get(&self, oid: ObjectIdentifier) -> Option<String> {
        dn_get_last(self.issuer(), oid)
    }

    /// Whether `unix_secs` falls within the validity period. Both bounds
    /// are inclusive.
    pub fn valid_at(&self, unix_secs: i64) -> bool {
        let validity = &self.inner.tbs_certificate.validity;
        let not_before = validity.not_before.to_unix_duration().as_secs() as i64;
        let not_after = validity.not_after.to_unix_duration().as_secs() as i64;
        not_before <= unix_secs && unix_secs <= not_after
    }

    /// Look up an extension by OID, returning `(critical, value)`.
    pub fn extension(&self, oid: ObjectIdentifier) -> Option<(bool, &[u8])> {
        self.inner
            .tbs_certificate
            .extensions
            .as_ref()?
            .iter()
            .find(|ext| ext.extn_id == oid)
            .map(|ext| (ext.critical, ext.extn_value.as_bytes()))
    }

    /// OID of the outer signature algorithm.
    pub fn signature_algorithm_oid(&self) -> ObjectIdentifier {
        self.inner.signature_algorithm.oid
    }

    /// OID of the subject public key algorithm.
    pub fn public_key_algorithm_oid(&self) -> ObjectIdentifier {
        self.inner.tbs_certificate.subject_public_key_info.algorithm.oid
    }

    /// OID of the subject public key algorithm parameters, if they are
    /// themselves an OID (the named-curve case).
    pub fn public_key_curve_oid(&self) -> Option<ObjectIdentifier> {
        let params = self
            .inner
            .tbs_certificate
            .subject_public_key_info
            .algorithm
            .parameters
            .as_ref()?;
        if params.tag() != Tag::ObjectIdentifier {
            return None;
        }
        ObjectIdentifier::from_bytes(params.value()).ok()
    }

    /// The subject public key bit string contents.
    pub fn public_key_bits(&self) -> Result<&[u8]> {
        self.inner
            .tbs_certificate
            .subject_public_key_info
            .subject_public_key
            .as_bytes()
            .ok_or_else(|| TinfoilError::attestation("certificate public key has unused bits"))
    }

    /// DER encoding of the full SubjectPublicKeyInfo.
    pub fn spki_der(&self) -> Result<Vec<u8>> {
        self.inner
            .tbs_certificate
            .subject_public_key_info
            .to_der()
            .map_err(|e| TinfoilError::attestation_with("failed to encode SPKI", e))
    }

    /// Hex SHA-256 of the DER SubjectPublicKeyInfo.
    pub fn spki_sha256_hex(&self) -> Result<String> {
        Ok(hex::encode(Sha256::digest(self.spki_der()?)))
    }

    /// DNS names from the SubjectAltName extension. Empty when the
    /// extension is absent.
    pub fn dns_sans(&self) -> Result<Vec<String>> {
        let Some((_, value)) = self.extension(OID_SUBJECT_ALT_NAME) else {
            return Ok(Vec::new());
        };
        let san = SubjectAltName::from_der(value)
            .map_err(|e| TinfoilError::attestation_with("failed to parse SubjectAltName", e))?;
        Ok(san
            .0
            .iter()
            .filter_map(|name| match name {
                GeneralName::DnsName(dns) => Some(dns.to_string()),
                _ => None,
            })
            .collect())
    }

    /// Raw certificate signature bytes.
    pub fn signature_bytes(&self) -> Result<&[u8]> {
        self.inner
            .signature
            .as_bytes()
            .ok_or_else(|| TinfoilError::attestation("certificate signature has unused bits"))
    }

    /// Verify this certificate's signature using the issuer's public key,
    /// dispatching on the declared signature algorithm.
    pub fn verify_signed_by(&self, issuer: &Certificate) -> Result<()> {
        let signature = self.signature_bytes()?;
        let algorithm = self.signature_algorithm_oid();

        if algorithm == OID_RSASSA_PSS {
            verify_rsa_pss_sha384(issuer.public_key_bits()?, &self.tbs_raw, signature)
        } else if algorithm == OID_ECDSA_SHA384 {
            verify_ecdsa_p384_der(issuer.public_key_bits()?, &self.tbs_raw, signature)
        } else if algorithm == OID_ECDSA_SHA256 {
            verify_ecdsa_p256_der(issuer.public_key_bits()?, &self.tbs_raw, signature)
        } else {
            Err(TinfoilError::attestation(format!(
                "unsupported certificate signature algorithm: {algorithm}"
            )))
        }
    }
}

/// Last value of a DN attribute across all RDNs, in encoding order.
pub fn dn_get_last(name: &Name, oid: ObjectIdentifier) -> Option<String> {
    let mut found = None;
    for rdn in name.0.iter() {
        for atv in rdn.0.iter() {
            if atv.oid == oid {
                found = attribute_value_string(&atv.value);
            }
        }
    }
    found
}

/// Decode a DN attribute value if it is a known string type.
fn attribute_value_string(value: &der::Any) -> Option<String> {
    match value.tag() {
        Tag::Utf8String | Tag::PrintableString | Tag::Ia5String | Tag::TeletexString => {
            Some(String::from_utf8_lossy(value.value()).into_owned())
        }
        _ => None,
    }
}

/// Strip PEM armor and decode the base64 body to DER.
pub fn pem_to_der(pem: &str) -> Result<Vec<u8>> {
    let body: String = pem
        .lines()
        .filter(|line| !line.starts_with("-----") && !line.trim().is_empty())
        .collect();
    BASE64
        .decode(body.trim())
        .map_err(|e| TinfoilError::attestation_with("failed to decode PEM body", e))
}

/// Verify an RSASSA-PSS signature (SHA-384, MGF1-SHA384, salt length 48).
///
/// `rsa_public_key_der` is the DER `RSAPublicKey` — the bit string
/// contents of an RSA SubjectPublicKeyInfo.
pub fn verify_rsa_pss_sha384(
    rsa_public_key_der: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<()> {
    let key = ring::signature::UnparsedPublicKey::new(
        &ring::signature::RSA_PSS_2048_8192_SHA384,
        rsa_public_key_der,
    );
    key.verify(message, signature)
        .map_err(|_| TinfoilError::attestation("RSASSA-PSS signature verification failed"))
}

/// Verify a DER-encoded ECDSA-P384 signature over `message` (SHA-384).
pub fn verify_ecdsa_p384_der(
    sec1_public_key: &[u8],
    message: &[u8],
    signature_der: &[u8],
) -> Result<()> {
    use p384::ecdsa::signature::Verifier;
    use p384::ecdsa::{Signature, VerifyingKey};

    let key = VerifyingKey::from_sec1_bytes(sec1_public_key)
        .map_err(|e| TinfoilError::attestation_with("invalid P-384 public key", e))?;
    let signature = Signature::from_der(signature_der)
        .map_err(|e| TinfoilError::attestation_with("invalid ECDSA-P384 signature", e))?;
    key.verify(message, &signature)
        .map_err(|_| TinfoilError::attestation("ECDSA-P384 signature verification failed"))
}

/// Verify an ECDSA-P384 signature given as raw big-endian `(r, s)`
/// scalars, as stored in an SNP report.
pub fn verify_ecdsa_p384_rs(
    sec1_public_key: &[u8],
    message: &[u8],
    r: &[u8; 48],
    s: &[u8; 48],
) -> Result<()> {
    use p384::ecdsa::signature::Verifier;
    use p384::ecdsa::{Signature, VerifyingKey};

    let key = VerifyingKey::from_sec1_bytes(sec1_public_key)
        .map_err(|e| TinfoilError::attestation_with("invalid P-384 public key", e))?;
    let mut sig_bytes = [0u8; 96];
    sig_bytes[..48].copy_from_slice(r);
    sig_bytes[48..].copy_from_slice(s);
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|e| TinfoilError::attestation_with("invalid ECDSA signature scalars", e))?;
    key.verify(message, &signature)
        .map_err(|_| TinfoilError::attestation("report signature verification failed"))
}

/// Verify a DER-encoded ECDSA-P256 signature over `message` (SHA-256).
pub fn verify_ecdsa_p256_der(
    sec1_public_key: &[u8],
    message: &[u8],
    signature_der: &[u8],
) -> Result<()> {
    use p256::ecdsa::signature::Verifier;
    use p256::ecdsa::{Signature, VerifyingKey};

    let key = VerifyingKey::from_sec1_bytes(sec1_public_key)
        .map_err(|e| TinfoilError::attestation_with("invalid P-256 public key", e))?;
    let signature = Signature::from_der(signature_der)
        .map_err(|e| TinfoilError::attestation_with("invalid ECDSA-P256 signature", e))?;
    key.verify(message, &signature)
        .map_err(|_| TinfoilError::attestation("ECDSA-P256 signature verification failed"))
}

/// Whether `domain` matches at least one SAN, with RFC 6125 wildcard
/// semantics: `*` covers exactly one left-most label, so
/// `*.example.com` matches `sub.example.com` but not `example.com`.
pub fn domain_matches_sans(sans: &[String], domain: &str) -> bool {
    let domain = domain.to_ascii_lowercase();
    sans.iter().any(|san| {
        let san = san.to_ascii_lowercase();
        if let Some(suffix) = san.strip_prefix("*.") {
            match domain.split_once('.') {
                Some((label, rest)) => !label.is_empty() && rest == suffix,
                None => false,
            }
        } else {
            san == domain
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_matches_single_label() {
        let sans = vec!["*.example.com".to_string()];
        assert!(domain_matches_sans(&sans, "sub.example.com"));
        assert!(!domain_matches_sans(&sans, "example.com"));
        assert!(!domain_matches_sans(&sans, "a.b.example.com"));
    }

    #[test]
    fn test_exact_san_match() {
        let sans = vec!["enclave.example.com".to_string()];
        assert!(domain_matches_sans(&sans, "enclave.example.com"));
        assert!(domain_matches_sans(&sans, "ENCLAVE.example.COM"));
        assert!(!domain_matches_sans(&sans, "other.example.com"));
    }

    #[test]
    fn test_no_sans_never_matches() {
        assert!(!domain_matches_sans(&[], "example.com"));
    }

    #[test]
    fn test_pem_to_der() {
        let pem = "-----BEGIN CERTIFICATE-----\nAQID\n-----END CERTIFICATE-----\n";
        assert_eq!(pem_to_der(pem).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_pem_to_der_rejects_garbage() {
        assert!(pem_to_der("-----BEGIN CERTIFICATE-----\n!!!\n-----END CERTIFICATE-----").is_err());
    }

    #[test]
    fn test_verify_rsa_pss_rejects_garbage() {
        let err = verify_rsa_pss_sha384(&[1, 2, 3], b"message", &[4, 5, 6]).unwrap_err();
        assert!(matches!(err, TinfoilError::Attestation { .. }));
    }

    #[test]
    fn test_verify_p384_rejects_bad_key() {
        assert!(verify_ecdsa_p384_der(&[0u8; 10], b"m", &[0u8; 8]).is_err());
        assert!(verify_ecdsa_p384_rs(&[0u8; 10], b"m", &[0u8; 48], &[0u8; 48]).is_err());
    }

    #[test]
    fn test_verify_p256_signature_round_trip() {
        use p256::ecdsa::signature::Signer;
        use p256::ecdsa::{Signature, SigningKey};

        let signing = SigningKey::from_slice(&[7u8; 32]).unwrap();
        let verifying = signing.verifying_key();
        let signature: Signature = signing.sign(b"attested payload");
        let sec1 = verifying.to_encoded_point(false);

        assert!(verify_ecdsa_p256_der(
            sec1.as_bytes(),
            b"attested payload",
            signature.to_der().as_bytes()
        )
        .is_ok());
        assert!(verify_ecdsa_p256_der(
            sec1.as_bytes(),
            b"tampered payload",
            signature.to_der().as_bytes()
        )
        .is_err());
    }

    #[test]
    fn test_verify_p384_signature_round_trip() {
        use p384::ecdsa::signature::Signer;
        use p384::ecdsa::{Signature, SigningKey};

        let signing = SigningKey::from_slice(&[9u8; 48]).unwrap();
        let verifying = signing.verifying_key();
        let signature: Signature = signing.sign(b"snp report bytes");
        let sec1 = verifying.to_encoded_point(false);

        let bytes = signature.to_bytes();
        let r: [u8; 48] = bytes[..48].try_into().unwrap();
        let s: [u8; 48] = bytes[48..].try_into().unwrap();

        assert!(verify_ecdsa_p384_rs(sec1.as_bytes(), b"snp report bytes", &r, &s).is_ok());
        assert!(verify_ecdsa_p384_rs(sec1.as_bytes(), b"other bytes", &r, &s).is_err());
    }
}
