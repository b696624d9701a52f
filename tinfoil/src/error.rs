use thiserror::Error;

/// Tinfoil client error types.
///
/// Three kinds of failure with three propagation rules:
/// - [`TinfoilError::Configuration`] — inconsistent or missing caller
///   options; raised eagerly, never retried.
/// - [`TinfoilError::Fetch`] — network errors, non-2xx responses, or
///   malformed response bodies; retried inside the bundle assembler.
/// - [`TinfoilError::Attestation`] — cryptographic, policy, or binding
///   failures; always fatal to the current verification attempt.
#[derive(Error, Debug)]
pub enum TinfoilError {
    /// The caller supplied inconsistent or missing options.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An HTTP fetch failed: network error, non-2xx status, or a
    /// response body that could not be parsed.
    #[error("Fetch error: {url}: {message}")]
    Fetch { url: String, message: String },

    /// A cryptographic, policy, or binding check failed.
    #[error("Attestation error: {message}")]
    Attestation {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },

    /// The server rotated its HPKE key configuration: the request was
    /// not accepted, so the client may re-attest and retry it once.
    #[error("HPKE key configuration mismatch: server rotated its keys")]
    KeyConfigMismatch,
}

impl TinfoilError {
    /// Build an attestation error from a message.
    pub fn attestation(message: impl Into<String>) -> Self {
        TinfoilError::Attestation {
            message: message.into(),
            source: None,
        }
    }

    /// Build an attestation error wrapping an underlying cause.
    pub fn attestation_with(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        TinfoilError::Attestation {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Build a fetch error for the given URL.
    pub fn fetch(url: impl Into<String>, message: impl Into<String>) -> Self {
        TinfoilError::Fetch {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Whether this failure is transient and worth retrying.
    ///
    /// Only fetch failures qualify; configuration and attestation
    /// failures are deterministic.
    pub fn is_transient(&self) -> bool {
        matches!(self, TinfoilError::Fetch { .. })
    }
}

/// Result type alias for Tinfoil operations.
pub type Result<T> = std::result::Result<T, TinfoilError>;
