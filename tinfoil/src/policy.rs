//! SEV-SNP report policy validation.
//!
//! Checks a parsed report against a [`ValidationOptions`] record. Any
//! option left unset is skipped. Boolean guest-policy rules are
//! two-sided: capability bits the requirement does not allow must be off
//! in the report, and restriction bits the requirement mandates must be
//! on.

use serde::{Deserialize, Serialize};

use crate::chain::CertificateChain;
use crate::error::{Result, TinfoilError};
use crate::report::{Report, SnpPlatformInfo, SnpPolicy, TcbParts};

/// Policy for accepting an SNP attestation report.
///
/// [`ValidationOptions::default`] carries the production baseline; every
/// field is plain data a caller may replace (the firmware minimums are
/// policy constants, not compile-time immutables).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationOptions {
    /// Required guest policy. Capability bits (`debug`, `migrate_ma`,
    /// `smt`, `cxl_allowed`, `mem_aes_256_xts`) not allowed here must be
    /// clear in the report; restriction bits (`single_socket`,
    /// `mem_aes_256_xts`, `rapl_dis`, `ciphertext_hiding_dram`,
    /// `page_swap_disabled`) set here must be set in the report.
    pub guest_policy: SnpPolicy,

    /// Minimum guest security version number.
    #[serde(default)]
    pub minimum_guest_svn: Option<u32>,

    /// Minimum firmware build, checked against both current and
    /// committed build numbers.
    #[serde(default)]
    pub minimum_build: Option<u8>,

    /// Minimum firmware version packed as `major << 8 | minor`, checked
    /// against both current and committed versions.
    #[serde(default)]
    pub minimum_version: Option<u16>,

    /// Floor for the current, committed, and reported TCBs.
    #[serde(default)]
    pub minimum_tcb: Option<TcbParts>,

    /// Floor for the launch TCB.
    #[serde(default)]
    pub minimum_launch_tcb: Option<TcbParts>,

    /// Required platform info, with the same two-sided logic as the
    /// guest policy: `smt_enabled`, `tsme_enabled`, `ecc_enabled`, and
    /// `tio_enabled` are permissions; `rapl_disabled`,
    /// `ciphertext_hiding_dram_enabled`, and `alias_check_complete` are
    /// mandatory when set.
    #[serde(default)]
    pub platform_info: Option<SnpPlatformInfo>,

    /// Required VMPL; must be within 0..3.
    #[serde(default)]
    pub vmpl: Option<u32>,

    /// Accept firmware whose committed state differs from its current
    /// state. Only `false` is supported; `true` fails loudly.
    #[serde(default)]
    pub permit_provisional_firmware: bool,

    /// Not implemented; `true` fails loudly rather than being ignored.
    #[serde(default)]
    pub require_author_key: bool,

    /// Not implemented; `true` fails loudly rather than being ignored.
    #[serde(default)]
    pub require_id_block: bool,

    /// Byte-for-byte equality requirements on report fields.
    #[serde(default)]
    pub report_data: Option<Vec<u8>>,
    #[serde(default)]
    pub host_data: Option<Vec<u8>>,
    #[serde(default)]
    pub measurement: Option<Vec<u8>>,
    #[serde(default)]
    pub chip_id: Option<Vec<u8>>,
    #[serde(default)]
    pub image_id: Option<Vec<u8>>,
    #[serde(default)]
    pub family_id: Option<Vec<u8>>,
    #[serde(default)]
    pub report_id: Option<Vec<u8>>,
    #[serde(default)]
    pub report_id_ma: Option<Vec<u8>>,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            guest_policy: SnpPolicy {
                abi_major: 0,
                abi_minor: 0,
                smt: true,
                migrate_ma: false,
                debug: false,
                single_socket: false,
                cxl_allowed: false,
                mem_aes_256_xts: false,
                rapl_dis: false,
                ciphertext_hiding_dram: false,
                page_swap_disabled: false,
            },
            minimum_guest_svn: None,
            minimum_build: Some(21),
            minimum_version: Some((1 << 8) | 55),
            minimum_tcb: Some(BASELINE_TCB),
            minimum_launch_tcb: Some(BASELINE_TCB),
            platform_info: Some(SnpPlatformInfo {
                smt_enabled: true,
                tsme_enabled: true,
                ecc_enabled: false,
                rapl_disabled: false,
                ciphertext_hiding_dram_enabled: false,
                alias_check_complete: false,
                tio_enabled: false,
            }),
            vmpl: None,
            permit_provisional_firmware: false,
            require_author_key: false,
            require_id_block: false,
            report_data: None,
            host_data: None,
            measurement: None,
            chip_id: None,
            image_id: None,
            family_id: None,
            report_id: None,
            report_id_ma: None,
        }
    }
}

/// Production TCB floor for Genoa.
const BASELINE_TCB: TcbParts = TcbParts {
    bl_spl: 0x07,
    tee_spl: 0x00,
    snp_spl: 0x0E,
    ucode_spl: 0x48,
};

/// Validate a report against the options, given its verified chain.
pub fn validate_report(
    report: &Report,
    chain: &CertificateChain,
    options: &ValidationOptions,
) -> Result<()> {
    if options.require_author_key {
        return Err(TinfoilError::attestation(
            "requireAuthorKey is not yet implemented",
        ));
    }
    if options.require_id_block {
        return Err(TinfoilError::attestation(
            "requireIdBlock is not yet implemented",
        ));
    }
    if options.permit_provisional_firmware {
        return Err(TinfoilError::attestation(
            "permitProvisionalFirmware is not yet implemented",
        ));
    }

    check_guest_policy(&report.policy(), &options.guest_policy)?;

    if let Some(minimum) = options.minimum_guest_svn {
        if report.guest_svn() < minimum {
            return Err(TinfoilError::attestation(format!(
                "guest SVN {} below minimum {minimum}",
                report.guest_svn()
            )));
        }
    }

    if let Some(minimum) = options.minimum_build {
        for (label, build) in [
            ("current", report.current_build()),
            ("committed", report.committed_build()),
        ] {
            if build < minimum {
                return Err(TinfoilError::attestation(format!(
                    "{label} firmware build {build} below minimum {minimum}"
                )));
            }
        }
    }

    if let Some(minimum) = options.minimum_version {
        for (label, version) in [
            ("current", report.current_version()),
            ("committed", report.committed_version()),
        ] {
            if version < minimum {
                return Err(TinfoilError::attestation(format!(
                    "{label} firmware version {}.{} below minimum {}.{}",
                    version >> 8,
                    version & 0xFF,
                    minimum >> 8,
                    minimum & 0xFF
                )));
            }
        }
    }

    if let Some(minimum) = &options.minimum_tcb {
        for (label, tcb) in [
            ("current", report.current_tcb()),
            ("committed", report.committed_tcb()),
            ("reported", report.reported_tcb()),
        ] {
            if !tcb.meets_minimum(minimum) {
                return Err(TinfoilError::attestation(format!(
                    "{label} TCB {tcb:?} below minimum {minimum:?}"
                )));
            }
        }
    }
    if let Some(minimum) = &options.minimum_launch_tcb {
        let launch = report.launch_tcb();
        if !launch.meets_minimum(minimum) {
            return Err(TinfoilError::attestation(format!(
                "launch TCB {launch:?} below minimum {minimum:?}"
            )));
        }
    }
    chain.verify_vcek_binding(report)?;

    if !options.permit_provisional_firmware {
        if report.committed_build() != report.current_build()
            || report.committed_minor() != report.current_minor()
            || report.committed_major() != report.current_major()
        {
            return Err(TinfoilError::attestation(
                "provisional firmware: committed version differs from current",
            ));
        }
        if report.committed_tcb() != report.current_tcb() {
            return Err(TinfoilError::attestation(
                "provisional firmware: committed TCB differs from current",
            ));
        }
    }

    if let Some(required) = &options.platform_info {
        check_platform_info(&report.platform_info(), required)?;
    }

    if let Some(required) = options.vmpl {
        if required > 3 {
            return Err(TinfoilError::attestation(format!(
                "required VMPL {required} out of range 0..3"
            )));
        }
        if report.vmpl() != required {
            return Err(TinfoilError::attestation(format!(
                "VMPL {} does not match required {required}",
                report.vmpl()
            )));
        }
    }

    for (label, expected, actual) in [
        ("reportData", &options.report_data, report.report_data()),
        ("hostData", &options.host_data, report.host_data()),
        ("measurement", &options.measurement, report.measurement()),
        ("chipId", &options.chip_id, report.chip_id()),
        ("imageId", &options.image_id, report.image_id()),
        ("familyId", &options.family_id, report.family_id()),
        ("reportId", &options.report_id, report.report_id()),
        ("reportIdMa", &options.report_id_ma, report.report_id_ma()),
    ] {
        if let Some(expected) = expected {
            if expected.as_slice() != actual {
                return Err(TinfoilError::attestation(format!(
                    "{label} does not match required value"
                )));
            }
        }
    }

    Ok(())
}

fn check_guest_policy(actual: &SnpPolicy, required: &SnpPolicy) -> Result<()> {
    let report_abi = (u16::from(actual.abi_major), u16::from(actual.abi_minor));
    let required_abi = (u16::from(required.abi_major), u16::from(required.abi_minor));
    if report_abi < required_abi {
        return Err(TinfoilError::attestation(format!(
            "guest policy ABI {}.{} below required {}.{}",
            actual.abi_major, actual.abi_minor, required.abi_major, required.abi_minor
        )));
    }

    // Capabilities the requirement does not allow.
    for (label, enabled, allowed) in [
        ("debug", actual.debug, required.debug),
        ("migrateMa", actual.migrate_ma, required.migrate_ma),
        ("smt", actual.smt, required.smt),
        ("cxlAllowed", actual.cxl_allowed, required.cxl_allowed),
        ("memAes256Xts", actual.mem_aes_256_xts, required.mem_aes_256_xts),
    ] {
        if enabled && !allowed {
            return Err(TinfoilError::attestation(format!(
                "guest policy enables unauthorized capability: {label}"
            )));
        }
    }

    // Restrictions the requirement mandates.
    for (label, enabled, mandatory) in [
        ("singleSocket", actual.single_socket, required.single_socket),
        ("memAes256Xts", actual.mem_aes_256_xts, required.mem_aes_256_xts),
        ("raplDis", actual.rapl_dis, required.rapl_dis),
        (
            "ciphertextHidingDram",
            actual.ciphertext_hiding_dram,
            required.ciphertext_hiding_dram,
        ),
        (
            "pageSwapDisabled",
            actual.page_swap_disabled,
            required.page_swap_disabled,
        ),
    ] {
        if mandatory && !enabled {
            return Err(TinfoilError::attestation(format!(
                "guest policy lacks required restriction: {label}"
            )));
        }
    }

    Ok(())
}

fn check_platform_info(actual: &SnpPlatformInfo, required: &SnpPlatformInfo) -> Result<()> {
    for (label, enabled, allowed) in [
        ("smtEnabled", actual.smt_enabled, required.smt_enabled),
        ("tsmeEnabled", actual.tsme_enabled, required.tsme_enabled),
        ("eccEnabled", actual.ecc_enabled, required.ecc_enabled),
        ("tioEnabled", actual.tio_enabled, required.tio_enabled),
    ] {
        if enabled && !allowed {
            return Err(TinfoilError::attestation(format!(
                "platform enables unauthorized feature: {label}"
            )));
        }
    }

    for (label, enabled, mandatory) in [
        ("raplDisabled", actual.rapl_disabled, required.rapl_disabled),
        (
            "ciphertextHidingDramEnabled",
            actual.ciphertext_hiding_dram_enabled,
            required.ciphertext_hiding_dram_enabled,
        ),
        (
            "aliasCheckComplete",
            actual.alias_check_complete,
            required.alias_check_complete,
        ),
    ] {
        if mandatory && !enabled {
            return Err(TinfoilError::attestation(format!(
                "platform lacks required protection: {label}"
            )));
        }
    }

    Ok(())
}
