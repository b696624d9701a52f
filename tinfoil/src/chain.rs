//! AMD SEV-SNP endorsement certificate chain.
//!
//! Builds and verifies the ARK → ASK → VCEK chain for Genoa parts. The
//! ARK and ASK are compiled-in AMD certificates; the VCEK is per-chip and
//! arrives with the attestation bundle (or from the AMD Key Distribution
//! Service). Beyond the signature walk, the VCEK must satisfy AMD's
//! format invariants and bind to the report's TCB and chip ID.

use der::asn1::{ObjectIdentifier, UintRef};
use der::Decode;

use crate::error::{Result, TinfoilError};
use crate::report::{Report, SigningKey, TcbParts};
use crate::x509::{
    Certificate, OID_COMMON_NAME, OID_COUNTRY, OID_EC_PUBLIC_KEY, OID_LOCALITY, OID_ORGANIZATION,
    OID_ORG_UNIT, OID_RSASSA_PSS, OID_SECP384R1, OID_STATE,
};

/// AMD KDS VCEK extension: bootloader SPL.
pub const OID_BL_SPL: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.3704.1.3.1");
/// AMD KDS VCEK extension: TEE (PSP OS) SPL.
pub const OID_TEE_SPL: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.3704.1.3.2");
/// AMD KDS VCEK extension: SNP firmware SPL.
pub const OID_SNP_SPL: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.3704.1.3.3");
/// AMD KDS VCEK extension: microcode SPL.
pub const OID_UCODE_SPL: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.3704.1.3.8");
/// AMD KDS extension: product name (IA5String).
pub const OID_PRODUCT_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.3704.1.2");
/// AMD KDS extension: 64-byte hardware ID.
pub const OID_HWID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.3704.1.4");
/// AMD KDS extension: cloud service provider ID. Present on VLEKs only.
pub const OID_CSP_ID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.3704.1.5");

/// The only product family the compiled-in chain endorses.
pub const PRODUCT_GENOA: &str = "Genoa";

/// DER encoding of IA5String "Genoa", the required PRODUCT_NAME value.
const PRODUCT_GENOA_DER: &[u8] = &[0x16, 0x05, b'G', b'e', b'n', b'o', b'a'];

/// Compiled-in AMD ARK certificate for Genoa.
const ARK_GENOA_PEM: &str = include_str!("../assets/ark_genoa.pem");

/// Compiled-in AMD ASK (SEV intermediate) certificate for Genoa.
const ASK_GENOA_PEM: &str = include_str!("../assets/ask_genoa.pem");

/// The AMD root certificates the chain is anchored to.
///
/// [`AmdRoots::bundled`] returns the compiled-in production
/// certificates; tests and air-gapped deployments may substitute their
/// own PEM pair.
#[derive(Debug, Clone)]
pub struct AmdRoots {
    pub ark_pem: String,
    pub ask_pem: String,
}

impl AmdRoots {
    pub fn bundled() -> Self {
        Self {
            ark_pem: ARK_GENOA_PEM.to_string(),
            ask_pem: ASK_GENOA_PEM.to_string(),
        }
    }
}

impl Default for AmdRoots {
    fn default() -> Self {
        Self::bundled()
    }
}

/// The ARK → ASK → VCEK chain for one attestation report.
#[derive(Debug, Clone)]
pub struct CertificateChain {
    ark: Certificate,
    ask: Certificate,
    vcek: Certificate,
}

impl CertificateChain {
    /// Build the chain for a report using the compiled-in AMD roots.
    ///
    /// Rejects non-Genoa products and reports not signed by a VCEK.
    pub fn from_report(report: &Report, vcek_der: &[u8]) -> Result<Self> {
        Self::from_report_with_roots(report, vcek_der, &AmdRoots::bundled())
    }

    /// Build the chain for a report against explicit AMD roots.
    pub fn from_report_with_roots(
        report: &Report,
        vcek_der: &[u8],
        roots: &AmdRoots,
    ) -> Result<Self> {
        if report.product_name() != PRODUCT_GENOA {
            return Err(TinfoilError::attestation(format!(
                "unsupported product: {}",
                report.product_name()
            )));
        }
        let signer = report.signer_info()?;
        if signer.signing_key != SigningKey::VcekReportSigner {
            return Err(TinfoilError::attestation(format!(
                "report not signed by VCEK: {:?}",
                signer.signing_key
            )));
        }

        Ok(Self {
            ark: Certificate::from_pem(&roots.ark_pem)?,
            ask: Certificate::from_pem(&roots.ask_pem)?,
            vcek: Certificate::from_der(vcek_der)?,
        })
    }

    pub fn ark(&self) -> &Certificate {
        &self.ark
    }

    pub fn ask(&self) -> &Certificate {
        &self.ask
    }

    pub fn vcek(&self) -> &Certificate {
        &self.vcek
    }

    /// Verify the full chain: structure, AMD distinguished names, common
    /// names, validity windows, the three signatures (ARK self-signed,
    /// ASK under ARK, VCEK under ASK), and the VCEK format invariants.
    ///
    /// Pure in its inputs: repeated invocations return the same result.
    pub fn verify(&self) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        for (label, cert, subject_cn, issuer_cn) in [
            ("ARK", &self.ark, "ARK-Genoa", "ARK-Genoa"),
            ("ASK", &self.ask, "SEV-Genoa", "ARK-Genoa"),
            ("VCEK", &self.vcek, "SEV-VCEK", "SEV-Genoa"),
        ] {
            if !cert.is_v3() {
                return Err(TinfoilError::attestation(format!(
                    "{label} certificate is not X.509 v3"
                )));
            }
            check_amd_location(cert, label)?;
            check_cn(cert.subject_get(OID_COMMON_NAME), subject_cn, label, "subject")?;
            check_cn(cert.issuer_get(OID_COMMON_NAME), issuer_cn, label, "issuer")?;
            if !cert.valid_at(now) {
                return Err(TinfoilError::attestation(format!(
                    "{label} certificate is outside its validity period"
                )));
            }
        }

        self.ark
            .verify_signed_by(&self.ark)
            .map_err(|e| TinfoilError::attestation_with("ARK self-signature invalid", e))?;
        self.ask
            .verify_signed_by(&self.ark)
            .map_err(|e| TinfoilError::attestation_with("ASK not signed by ARK", e))?;
        self.vcek
            .verify_signed_by(&self.ask)
            .map_err(|e| TinfoilError::attestation_with("VCEK not signed by ASK", e))?;

        self.verify_vcek_format()?;

        tracing::debug!("AMD certificate chain verified");
        Ok(())
    }

    /// VCEK format invariants beyond the signature walk.
    fn verify_vcek_format(&self) -> Result<()> {
        if self.vcek.signature_algorithm_oid() != OID_RSASSA_PSS {
            return Err(TinfoilError::attestation(
                "VCEK signature algorithm is not RSASSA-PSS",
            ));
        }
        if self.vcek.public_key_algorithm_oid() != OID_EC_PUBLIC_KEY
            || self.vcek.public_key_curve_oid() != Some(OID_SECP384R1)
        {
            return Err(TinfoilError::attestation(
                "VCEK public key is not ECDSA on secp384r1",
            ));
        }
        if self.vcek.extension(OID_CSP_ID).is_some() {
            // A CSP_ID marks a VLEK, which endorses a different trust model.
            return Err(TinfoilError::attestation(
                "certificate carries CSP_ID: VLEK presented where VCEK required",
            ));
        }
        let (_, hwid) = self
            .vcek
            .extension(OID_HWID)
            .ok_or_else(|| TinfoilError::attestation("VCEK missing HWID extension"))?;
        if hwid.len() != 64 {
            return Err(TinfoilError::attestation(format!(
                "VCEK HWID extension has invalid length: {}",
                hwid.len()
            )));
        }
        let (_, product) = self
            .vcek
            .extension(OID_PRODUCT_NAME)
            .ok_or_else(|| TinfoilError::attestation("VCEK missing PRODUCT_NAME extension"))?;
        if product != PRODUCT_GENOA_DER {
            return Err(TinfoilError::attestation(
                "VCEK PRODUCT_NAME is not IA5String \"Genoa\"",
            ));
        }
        Ok(())
    }

    /// Decoded TCB parts from the VCEK's SPL extensions.
    pub fn vcek_tcb(&self) -> Result<TcbParts> {
        Ok(TcbParts {
            bl_spl: self.vcek_spl(OID_BL_SPL, "BL_SPL")?,
            tee_spl: self.vcek_spl(OID_TEE_SPL, "TEE_SPL")?,
            snp_spl: self.vcek_spl(OID_SNP_SPL, "SNP_SPL")?,
            ucode_spl: self.vcek_spl(OID_UCODE_SPL, "UCODE")?,
        })
    }

    fn vcek_spl(&self, oid: ObjectIdentifier, label: &str) -> Result<u8> {
        let (_, value) = self
            .vcek
            .extension(oid)
            .ok_or_else(|| TinfoilError::attestation(format!("VCEK missing {label} extension")))?;
        let integer = UintRef::from_der(value).map_err(|e| {
            TinfoilError::attestation_with(format!("VCEK {label} extension is not an INTEGER"), e)
        })?;
        let bytes = integer.as_bytes();
        match bytes {
            [] => Ok(0),
            [b] => Ok(*b),
            _ => Err(TinfoilError::attestation(format!(
                "VCEK {label} value out of range"
            ))),
        }
    }

    /// Bind the VCEK to the report: the SPL extensions must equal the
    /// reported TCB parts, and the HWID must match the chip ID (which
    /// must be all zero when `mask_chip_key` is set).
    pub fn verify_vcek_binding(&self, report: &Report) -> Result<()> {
        let vcek_tcb = self.vcek_tcb()?;
        let reported = report.reported_tcb();
        if vcek_tcb != reported {
            return Err(TinfoilError::attestation(format!(
                "VCEK TCB {vcek_tcb:?} does not match reported TCB {reported:?}"
            )));
        }

        let signer = report.signer_info()?;
        if signer.mask_chip_key {
            if report.chip_id().iter().any(|&b| b != 0) {
                return Err(TinfoilError::attestation(
                    "chip ID must be zero when MASK_CHIP_KEY is set",
                ));
            }
        } else {
            let (_, hwid) = self
                .vcek
                .extension(OID_HWID)
                .ok_or_else(|| TinfoilError::attestation("VCEK missing HWID extension"))?;
            if hwid != report.chip_id() {
                return Err(TinfoilError::attestation(
                    "VCEK HWID does not match report chip ID",
                ));
            }
        }
        Ok(())
    }

    /// Verify the report's ECDSA-P384 signature with the VCEK subject key.
    pub fn verify_report_signature(&self, report: &Report) -> Result<()> {
        let (r, s) = report.signature_rs();
        crate::x509::verify_ecdsa_p384_rs(
            self.vcek.public_key_bits()?,
            report.signed_bytes(),
            &r,
            &s,
        )
    }
}

fn check_amd_location(cert: &Certificate, label: &str) -> Result<()> {
    for (name, oid, expected) in [
        ("C", OID_COUNTRY, "US"),
        ("L", OID_LOCALITY, "Santa Clara"),
        ("ST", OID_STATE, "CA"),
        ("O", OID_ORGANIZATION, "Advanced Micro Devices"),
        ("OU", OID_ORG_UNIT, "Engineering"),
    ] {
        for (side, value) in [
            ("subject", cert.subject_get(oid)),
            ("issuer", cert.issuer_get(oid)),
        ] {
            if value.as_deref() != Some(expected) {
                return Err(TinfoilError::attestation(format!(
                    "{label} {side} {name} is {value:?}, expected {expected:?}"
                )));
            }
        }
    }
    Ok(())
}

fn check_cn(actual: Option<String>, expected: &str, label: &str, side: &str) -> Result<()> {
    if actual.as_deref() != Some(expected) {
        return Err(TinfoilError::attestation(format!(
            "{label} {side} CN is {actual:?}, expected {expected:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::SNP_REPORT_SIZE;

    fn report_with_signer(signer_info: u32) -> Report {
        let mut raw = vec![0u8; SNP_REPORT_SIZE];
        raw[0] = 2;
        raw[0x48..0x4C].copy_from_slice(&signer_info.to_le_bytes());
        Report::parse(&raw).unwrap()
    }

    #[test]
    fn test_from_report_rejects_vlek_signer() {
        let report = report_with_signer(1 << 2);
        let err = CertificateChain::from_report_with_roots(
            &report,
            &[0u8; 4],
            &AmdRoots {
                ark_pem: String::new(),
                ask_pem: String::new(),
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("not signed by VCEK"));
    }

    #[test]
    fn test_from_report_rejects_no_signing_key() {
        let report = report_with_signer(7 << 2);
        assert!(CertificateChain::from_report(&report, &[0u8; 4]).is_err());
    }

    #[test]
    fn test_product_genoa_der_spelling() {
        assert_eq!(PRODUCT_GENOA_DER[0], 0x16); // IA5String tag
        assert_eq!(PRODUCT_GENOA_DER[1] as usize, PRODUCT_GENOA.len());
        assert_eq!(&PRODUCT_GENOA_DER[2..], PRODUCT_GENOA.as_bytes());
    }

    #[test]
    fn test_bundled_roots_are_pem() {
        let roots = AmdRoots::bundled();
        assert!(roots.ark_pem.contains("BEGIN CERTIFICATE"));
        assert!(roots.ask_pem.contains("BEGIN CERTIFICATE"));
    }
}
