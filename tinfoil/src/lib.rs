//! Tinfoil - Verified Client for Confidential AI Inference
//!
//! Proves, before sending a request, that the server is a genuine AMD
//! SEV-SNP enclave running a signed source-code release, and that the
//! key requests are encrypted to is the key the hardware attested.
//! Once proven, requests travel with end-to-end encrypted bodies
//! (RFC 9180 HPKE) or over a key-pinned TLS connection.

pub mod attestation;
pub mod bundle;
pub mod chain;
pub mod client;
pub mod codec;
pub mod ehbp;
pub mod error;
pub mod pinned;
pub mod policy;
pub mod report;
pub mod sigstore;
pub mod verify;
pub mod x509;

// Re-export commonly used types
pub use attestation::{
    compare_measurements, verify_attestation, AttestationDocument, AttestationResponse,
    Measurement, PredicateType,
};
pub use bundle::{AttestationBundle, BundleAssembler, DEFAULT_CONFIG_REPO};
pub use chain::{AmdRoots, CertificateChain};
pub use client::{
    Attestor, BundleAttestor, ClientStatus, SecureClient, SecureClientConfig, SecureSession,
    TransportMode,
};
pub use ehbp::{
    decrypt_response, Identity, RequestInit, SessionToken, Transport, TransportResponse,
};
pub use error::{Result, TinfoilError};
pub use policy::ValidationOptions;
pub use report::{Report, TcbParts};
pub use sigstore::TrustRoot;
pub use verify::{StepStatus, VerificationDocument, Verifier};

/// Tinfoil client version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
