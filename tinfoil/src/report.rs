//! AMD SEV-SNP attestation report parser.
//!
//! Parses the raw report produced by the SNP firmware (`SNP_GUEST_REQUEST`
//! MSG_REPORT_REQ) at fixed byte offsets. Bit-packed fields — guest
//! policy, platform info, signer info — are unpacked lazily through
//! accessor methods; the raw bytes stay canonical.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TinfoilError};

/// Size of a version 2/3 SNP attestation report in bytes.
pub const SNP_REPORT_SIZE: usize = 1184;

/// Offset of the signature within the report; everything before it is
/// the signed region.
const SIGNATURE_OFFSET: usize = 0x2A0;

/// TCB (Trusted Computing Base) version split into its four SPL parts.
///
/// Packed into a u64 with byte positions `blSpl=0, teeSpl=1, snpSpl=6,
/// ucodeSpl=7`; the intermediate bytes are reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcbParts {
    pub bl_spl: u8,
    pub tee_spl: u8,
    pub snp_spl: u8,
    pub ucode_spl: u8,
}

impl TcbParts {
    /// Split a packed TCB u64 into its parts.
    pub fn from_u64(value: u64) -> Self {
        let bytes = value.to_le_bytes();
        Self {
            bl_spl: bytes[0],
            tee_spl: bytes[1],
            snp_spl: bytes[6],
            ucode_spl: bytes[7],
        }
    }

    /// Pack the parts back into a u64. Inverse of [`TcbParts::from_u64`].
    pub fn to_u64(self) -> u64 {
        u64::from(self.bl_spl)
            | (u64::from(self.tee_spl) << 8)
            | (u64::from(self.snp_spl) << 48)
            | (u64::from(self.ucode_spl) << 56)
    }

    /// A TCB meets a minimum iff every part satisfies `>=`.
    pub fn meets_minimum(&self, minimum: &TcbParts) -> bool {
        self.bl_spl >= minimum.bl_spl
            && self.tee_spl >= minimum.tee_spl
            && self.snp_spl >= minimum.snp_spl
            && self.ucode_spl >= minimum.ucode_spl
    }
}

/// Guest policy, unpacked from the report's bit-packed `policy` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnpPolicy {
    pub abi_minor: u8,
    pub abi_major: u8,
    pub smt: bool,
    pub migrate_ma: bool,
    pub debug: bool,
    pub single_socket: bool,
    pub cxl_allowed: bool,
    pub mem_aes_256_xts: bool,
    pub rapl_dis: bool,
    pub ciphertext_hiding_dram: bool,
    pub page_swap_disabled: bool,
}

impl SnpPolicy {
    /// Unpack from the report's `policy` u64 (AMD SEV-SNP ABI bit layout).
    pub fn from_u64(value: u64) -> Self {
        let bit = |n: u64| (value >> n) & 1 == 1;
        Self {
            abi_minor: (value & 0xFF) as u8,
            abi_major: ((value >> 8) & 0xFF) as u8,
            smt: bit(16),
            migrate_ma: bit(18),
            debug: bit(19),
            single_socket: bit(20),
            cxl_allowed: bit(21),
            mem_aes_256_xts: bit(22),
            rapl_dis: bit(23),
            ciphertext_hiding_dram: bit(24),
            page_swap_disabled: bit(25),
        }
    }
}

/// Platform info, unpacked from the report's `platform_info` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnpPlatformInfo {
    pub smt_enabled: bool,
    pub tsme_enabled: bool,
    pub ecc_enabled: bool,
    pub rapl_disabled: bool,
    pub ciphertext_hiding_dram_enabled: bool,
    pub alias_check_complete: bool,
    pub tio_enabled: bool,
}

impl SnpPlatformInfo {
    pub fn from_u64(value: u64) -> Self {
        let bit = |n: u64| (value >> n) & 1 == 1;
        Self {
            smt_enabled: bit(0),
            tsme_enabled: bit(1),
            ecc_enabled: bit(2),
            rapl_disabled: bit(3),
            ciphertext_hiding_dram_enabled: bit(4),
            alias_check_complete: bit(5),
            tio_enabled: bit(6),
        }
    }
}

/// The key that signed an attestation report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningKey {
    /// Versioned Chip Endorsement Key (the only key this library accepts).
    VcekReportSigner,
    /// Versioned Loaded Endorsement Key.
    VlekReportSigner,
    /// No signing key.
    None,
}

/// Signer info, unpacked from the report's `signer_info` field.
///
/// `mask_chip_key` is bit 0, `author_key_en` is bit 1, and the signing
/// key occupies bits 2..4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignerInfo {
    pub signing_key: SigningKey,
    pub mask_chip_key: bool,
    pub author_key_en: bool,
}

impl SignerInfo {
    pub fn from_u32(value: u32) -> Result<Self> {
        let signing_key = match (value >> 2) & 0x7 {
            0 => SigningKey::VcekReportSigner,
            1 => SigningKey::VlekReportSigner,
            7 => SigningKey::None,
            other => {
                return Err(TinfoilError::attestation(format!(
                    "undefined report signing key: {other}"
                )))
            }
        };
        Ok(Self {
            signing_key,
            mask_chip_key: value & 1 == 1,
            author_key_en: (value >> 1) & 1 == 1,
        })
    }
}

/// A parsed SEV-SNP attestation report.
///
/// Holds the raw bytes and exposes the fields as typed accessors at
/// their fixed offsets. Only the 1184-byte version 2/3 layout is
/// accepted; unknown versions fail at parse time.
#[derive(Debug, Clone)]
pub struct Report {
    raw: Vec<u8>,
}

impl Report {
    /// Parse raw report bytes, validating version and length.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < 4 {
            return Err(TinfoilError::attestation(format!(
                "attestation report truncated: {} bytes",
                raw.len()
            )));
        }
        let version = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        if !(2..=3).contains(&version) {
            return Err(TinfoilError::attestation(format!(
                "unsupported attestation report version: {version}"
            )));
        }
        if raw.len() != SNP_REPORT_SIZE {
            return Err(TinfoilError::attestation(format!(
                "invalid report length for version {version}: expected {SNP_REPORT_SIZE} bytes, got {}",
                raw.len()
            )));
        }
        Ok(Self { raw: raw.to_vec() })
    }

    /// The raw report bytes.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    fn u32_at(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.raw[offset..offset + 4].try_into().unwrap())
    }

    fn u64_at(&self, offset: usize) -> u64 {
        u64::from_le_bytes(self.raw[offset..offset + 8].try_into().unwrap())
    }

    pub fn version(&self) -> u32 {
        self.u32_at(0x00)
    }

    pub fn guest_svn(&self) -> u32 {
        self.u32_at(0x04)
    }

    /// Raw bit-packed guest policy.
    pub fn policy_raw(&self) -> u64 {
        self.u64_at(0x08)
    }

    /// Unpacked guest policy.
    pub fn policy(&self) -> SnpPolicy {
        SnpPolicy::from_u64(self.policy_raw())
    }

    pub fn family_id(&self) -> &[u8] {
        &self.raw[0x10..0x20]
    }

    pub fn image_id(&self) -> &[u8] {
        &self.raw[0x20..0x30]
    }

    pub fn vmpl(&self) -> u32 {
        self.u32_at(0x30)
    }

    pub fn signature_algo(&self) -> u32 {
        self.u32_at(0x34)
    }

    pub fn current_tcb(&self) -> TcbParts {
        TcbParts::from_u64(self.u64_at(0x38))
    }

    /// Raw bit-packed platform info.
    pub fn platform_info_raw(&self) -> u64 {
        self.u64_at(0x40)
    }

    /// Unpacked platform info.
    pub fn platform_info(&self) -> SnpPlatformInfo {
        SnpPlatformInfo::from_u64(self.platform_info_raw())
    }

    /// Unpacked signer info; fails on an undefined signing-key value.
    pub fn signer_info(&self) -> Result<SignerInfo> {
        SignerInfo::from_u32(self.u32_at(0x48))
    }

    /// 64 bytes of guest-supplied report data. The first half binds the
    /// enclave's TLS key, the second half its HPKE public key.
    pub fn report_data(&self) -> &[u8] {
        &self.raw[0x50..0x90]
    }

    /// SHA-384 launch measurement (48 bytes).
    pub fn measurement(&self) -> &[u8] {
        &self.raw[0x90..0xC0]
    }

    pub fn host_data(&self) -> &[u8] {
        &self.raw[0xC0..0xE0]
    }

    pub fn id_key_digest(&self) -> &[u8] {
        &self.raw[0xE0..0x110]
    }

    pub fn author_key_digest(&self) -> &[u8] {
        &self.raw[0x110..0x140]
    }

    pub fn report_id(&self) -> &[u8] {
        &self.raw[0x140..0x160]
    }

    pub fn report_id_ma(&self) -> &[u8] {
        &self.raw[0x160..0x180]
    }

    pub fn reported_tcb(&self) -> TcbParts {
        TcbParts::from_u64(self.u64_at(0x180))
    }

    /// 64-byte chip-unique ID; all zero when `mask_chip_key` is set.
    pub fn chip_id(&self) -> &[u8] {
        &self.raw[0x1A0..0x1E0]
    }

    pub fn committed_tcb(&self) -> TcbParts {
        TcbParts::from_u64(self.u64_at(0x1E0))
    }

    pub fn current_build(&self) -> u8 {
        self.raw[0x1E8]
    }

    pub fn current_minor(&self) -> u8 {
        self.raw[0x1E9]
    }

    pub fn current_major(&self) -> u8 {
        self.raw[0x1EA]
    }

    pub fn committed_build(&self) -> u8 {
        self.raw[0x1EC]
    }

    pub fn committed_minor(&self) -> u8 {
        self.raw[0x1ED]
    }

    pub fn committed_major(&self) -> u8 {
        self.raw[0x1EE]
    }

    pub fn launch_tcb(&self) -> TcbParts {
        TcbParts::from_u64(self.u64_at(0x1F0))
    }

    /// Current firmware version packed as `major << 8 | minor`.
    pub fn current_version(&self) -> u16 {
        (u16::from(self.current_major()) << 8) | u16::from(self.current_minor())
    }

    /// Committed firmware version packed as `major << 8 | minor`.
    pub fn committed_version(&self) -> u16 {
        (u16::from(self.committed_major()) << 8) | u16::from(self.committed_minor())
    }

    /// The signed region: everything before the signature.
    pub fn signed_bytes(&self) -> &[u8] {
        &self.raw[..SIGNATURE_OFFSET]
    }

    /// The ECDSA-P384 signature as big-endian `(r, s)` scalars.
    ///
    /// The firmware stores each component little-endian, zero-padded to
    /// 72 bytes; only the low 48 bytes are significant.
    pub fn signature_rs(&self) -> ([u8; 48], [u8; 48]) {
        let mut r = [0u8; 48];
        let mut s = [0u8; 48];
        for i in 0..48 {
            r[i] = self.raw[SIGNATURE_OFFSET + 47 - i];
            s[i] = self.raw[SIGNATURE_OFFSET + 72 + 47 - i];
        }
        (r, s)
    }

    /// KDS product name for this report.
    ///
    /// Only Genoa-family parts are supported by the compiled-in AMD
    /// certificate chain.
    pub fn product_name(&self) -> &'static str {
        "Genoa"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper: build an empty v2 report buffer.
    fn empty_report() -> Vec<u8> {
        let mut raw = vec![0u8; SNP_REPORT_SIZE];
        raw[0] = 2; // version
        raw
    }

    #[test]
    fn test_tcb_round_trip() {
        let parts = TcbParts {
            bl_spl: 0x07,
            tee_spl: 0x00,
            snp_spl: 0x0E,
            ucode_spl: 0x48,
        };
        assert_eq!(TcbParts::from_u64(parts.to_u64()), parts);
        // Packing matches the documented byte positions.
        assert_eq!(parts.to_u64(), 0x48_0E_00000000_00_07);
    }

    #[test]
    fn test_tcb_meets_minimum() {
        let min = TcbParts {
            bl_spl: 7,
            tee_spl: 0,
            snp_spl: 14,
            ucode_spl: 72,
        };
        assert!(min.meets_minimum(&min));
        let higher = TcbParts {
            ucode_spl: 73,
            ..min
        };
        assert!(higher.meets_minimum(&min));
        let lower = TcbParts {
            snp_spl: 13,
            ..min
        };
        assert!(!lower.meets_minimum(&min));
    }

    #[test]
    fn test_policy_unpack() {
        // abi 1.31, smt + debug set
        let value: u64 = 31 | (1 << 8) | (1 << 16) | (1 << 19);
        let policy = SnpPolicy::from_u64(value);
        assert_eq!(policy.abi_minor, 31);
        assert_eq!(policy.abi_major, 1);
        assert!(policy.smt);
        assert!(policy.debug);
        assert!(!policy.migrate_ma);
        assert!(!policy.single_socket);
    }

    #[test]
    fn test_platform_info_unpack() {
        let info = SnpPlatformInfo::from_u64(0b0100011);
        assert!(info.smt_enabled);
        assert!(info.tsme_enabled);
        assert!(!info.ecc_enabled);
        assert!(!info.rapl_disabled);
        assert!(info.alias_check_complete);
        assert!(!info.tio_enabled);
    }

    #[test]
    fn test_signer_info_unpack() {
        let info = SignerInfo::from_u32(0b000_11).unwrap();
        assert_eq!(info.signing_key, SigningKey::VcekReportSigner);
        assert!(info.mask_chip_key);
        assert!(info.author_key_en);

        let vlek = SignerInfo::from_u32(1 << 2).unwrap();
        assert_eq!(vlek.signing_key, SigningKey::VlekReportSigner);

        let none = SignerInfo::from_u32(7 << 2).unwrap();
        assert_eq!(none.signing_key, SigningKey::None);
    }

    #[test]
    fn test_signer_info_undefined_key() {
        assert!(SignerInfo::from_u32(3 << 2).is_err());
    }

    #[test]
    fn test_parse_rejects_unknown_version() {
        let mut raw = empty_report();
        raw[0] = 9;
        let err = Report::parse(&raw).unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn test_parse_rejects_short_buffer() {
        let mut raw = empty_report();
        raw.truncate(100);
        assert!(Report::parse(&raw).is_err());
    }

    #[test]
    fn test_field_offsets() {
        let mut raw = empty_report();
        raw[0x04] = 5; // guest_svn
        raw[0x30] = 2; // vmpl
        raw[0x90] = 0xAB; // measurement
        raw[0x1A0] = 0xCD; // chip_id
        raw[0x1E8] = 21; // current_build
        raw[0x1E9] = 55; // current_minor
        raw[0x1EA] = 1; // current_major
        let report = Report::parse(&raw).unwrap();
        assert_eq!(report.version(), 2);
        assert_eq!(report.guest_svn(), 5);
        assert_eq!(report.vmpl(), 2);
        assert_eq!(report.measurement()[0], 0xAB);
        assert_eq!(report.chip_id()[0], 0xCD);
        assert_eq!(report.current_build(), 21);
        assert_eq!(report.current_version(), (1 << 8) | 55);
    }

    #[test]
    fn test_signature_byte_order() {
        let mut raw = empty_report();
        // Little-endian r with low byte 0x01, s with low byte 0x02.
        raw[0x2A0] = 0x01;
        raw[0x2A0 + 72] = 0x02;
        let report = Report::parse(&raw).unwrap();
        let (r, s) = report.signature_rs();
        assert_eq!(r[47], 0x01);
        assert_eq!(s[47], 0x02);
        assert_eq!(r[0], 0x00);
    }

    #[test]
    fn test_signed_bytes_excludes_signature() {
        let report = Report::parse(&empty_report()).unwrap();
        assert_eq!(report.signed_bytes().len(), 0x2A0);
    }
}
