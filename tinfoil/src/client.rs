//! Secure transport client.
//!
//! Ties the whole pipeline together: assemble an attestation bundle,
//! verify it, then serve requests over a transport keyed by the attested
//! material. `ready()` is single-flight — concurrent callers share one
//! attestation pass — and a server-side HPKE key rotation triggers
//! exactly one automatic re-attestation and retry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::attestation::AttestationResponse;
use crate::bundle::{AttestationBundle, BundleAssembler, ATC_BASE_URL, DEFAULT_CONFIG_REPO};
use crate::chain::AmdRoots;
use crate::ehbp::{Identity, RequestInit, SessionToken, Transport, TransportResponse};
use crate::error::{Result, TinfoilError};
use crate::pinned::PinnedTlsClient;
use crate::policy::ValidationOptions;
use crate::sigstore::TrustRoot;
use crate::verify::{StepStatus, VerificationDocument, Verifier};

/// Delay before the one automatic retry of a failed attestation pass.
const READY_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Which transport carries request bodies to the enclave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportMode {
    /// Encrypted HTTP bodies under the attested HPKE key.
    #[default]
    Ehbp,
    /// Plain HTTPS pinned to the attested TLS key fingerprint.
    Tls,
}

/// Secure client configuration.
#[derive(Debug, Clone, Default)]
pub struct SecureClientConfig {
    /// Base URL for requests; defaults to `{enclave}/v1/`.
    pub base_url: Option<String>,
    /// Pin a specific enclave instead of router discovery. Must be https.
    pub enclave_url: Option<String>,
    /// GitHub repository whose releases define the expected measurement.
    pub config_repo: Option<String>,
    /// Transport for request bodies.
    pub transport: TransportMode,
    /// Base URL of a centralized attestation server handing back
    /// pre-assembled bundles.
    pub attestation_bundle_url: Option<String>,
}

/// Client lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientStatus {
    #[default]
    Uninitialized,
    Initializing,
    Ready,
    Failed,
}

/// A verified transport session.
#[async_trait]
pub trait SecureSession: Send + Sync {
    async fn request(&self, url: &str, init: &RequestInit) -> Result<TransportResponse>;

    /// Recovery token for the most recent request, when the transport
    /// supports one.
    fn recovery_token(&self) -> Option<SessionToken> {
        None
    }
}

struct EhbpSession {
    transport: Transport,
}

#[async_trait]
impl SecureSession for EhbpSession {
    async fn request(&self, url: &str, init: &RequestInit) -> Result<TransportResponse> {
        self.transport.request(url, init).await
    }

    fn recovery_token(&self) -> Option<SessionToken> {
        self.transport.recovery_token()
    }
}

struct PinnedSession {
    client: PinnedTlsClient,
}

#[async_trait]
impl SecureSession for PinnedSession {
    async fn request(&self, url: &str, init: &RequestInit) -> Result<TransportResponse> {
        self.client.request(url, init).await
    }
}

/// Outcome of one attestation pass: the audit document is always
/// present, even when verification failed.
pub struct AttestationOutcome {
    pub document: VerificationDocument,
    pub verified: Result<VerifiedAttestation>,
}

/// The attested material a session is built from.
pub struct VerifiedAttestation {
    pub response: AttestationResponse,
    pub enclave_domain: String,
}

/// Seam for the full fetch-and-verify pass, so tests can count passes.
#[async_trait]
pub trait Attestor: Send + Sync {
    async fn attest(&self, config: &SecureClientConfig) -> AttestationOutcome;
}

/// Production attestor: assemble a bundle, verify it.
pub struct BundleAttestor {
    assembler: BundleAssembler,
    roots: AmdRoots,
    trust_root: TrustRoot,
    options: ValidationOptions,
}

impl BundleAttestor {
    pub fn new() -> Self {
        Self::with_trust(
            BundleAssembler::new(),
            AmdRoots::bundled(),
            TrustRoot::bundled().clone(),
            ValidationOptions::default(),
        )
    }

    /// Attestor with explicit trust anchors (air-gapped roots, tests).
    pub fn with_trust(
        assembler: BundleAssembler,
        roots: AmdRoots,
        trust_root: TrustRoot,
        options: ValidationOptions,
    ) -> Self {
        Self {
            assembler,
            roots,
            trust_root,
            options,
        }
    }

    async fn fetch_bundle(
        &self,
        config: &SecureClientConfig,
        repo: &str,
        doc: &mut VerificationDocument,
    ) -> Result<AttestationBundle> {
        if let Some(atc) = &config.attestation_bundle_url {
            return self
                .assembler
                .fetch_from_atc(atc, config.enclave_url.as_deref(), config.config_repo.as_deref())
                .await;
        }
        if let Some(enclave_url) = &config.enclave_url {
            return self.assembler.assemble(&host_of(enclave_url), repo).await;
        }
        let router = self.assembler.select_router(ATC_BASE_URL).await?;
        doc.selected_router_endpoint = Some(router.clone());
        self.assembler.assemble(&router, repo).await
    }
}

impl Default for BundleAttestor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Attestor for BundleAttestor {
    async fn attest(&self, config: &SecureClientConfig) -> AttestationOutcome {
        let repo = config
            .config_repo
            .clone()
            .unwrap_or_else(|| DEFAULT_CONFIG_REPO.to_string());
        let mut document = VerificationDocument::new(&repo, "");

        let bundle = match self.fetch_bundle(config, &repo, &mut document).await {
            Ok(bundle) => bundle,
            Err(error) => {
                document.steps.fetch_digest.status = StepStatus::Failed;
                document.steps.fetch_digest.error = Some(error.to_string());
                return AttestationOutcome {
                    document,
                    verified: Err(error),
                };
            }
        };

        let verifier = Verifier::with_trust(
            &repo,
            self.roots.clone(),
            self.trust_root.clone(),
            self.options.clone(),
        );
        let verified = verifier
            .verify_bundle(&bundle, &mut document)
            .map(|response| VerifiedAttestation {
                response,
                enclave_domain: bundle.domain.clone(),
            });
        AttestationOutcome { document, verified }
    }
}

#[derive(Default)]
struct ClientState {
    status: ClientStatus,
    session: Option<Arc<dyn SecureSession>>,
    document: Option<VerificationDocument>,
    base_url: Option<String>,
    enclave_url: Option<String>,
}

type SessionFactory =
    dyn Fn(&AttestationResponse, &str, TransportMode) -> Result<Arc<dyn SecureSession>>
        + Send
        + Sync;

/// Verified client for a confidential inference enclave.
pub struct SecureClient {
    config: SecureClientConfig,
    attestor: Arc<dyn Attestor>,
    session_factory: Box<SessionFactory>,
    state: tokio::sync::Mutex<ClientState>,
}

impl std::fmt::Debug for SecureClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureClient").finish_non_exhaustive()
    }
}

impl SecureClient {
    /// Build a client, validating the configuration eagerly.
    pub fn new(config: SecureClientConfig) -> Result<Self> {
        Self::with_attestor(config, Arc::new(BundleAttestor::new()))
    }

    /// Build a client with a custom attestation pass.
    pub fn with_attestor(config: SecureClientConfig, attestor: Arc<dyn Attestor>) -> Result<Self> {
        Self::with_parts(config, attestor, Box::new(default_session_factory))
    }

    fn with_parts(
        config: SecureClientConfig,
        attestor: Arc<dyn Attestor>,
        session_factory: Box<SessionFactory>,
    ) -> Result<Self> {
        if let Some(url) = &config.enclave_url {
            if !url.starts_with("https://") {
                return Err(TinfoilError::Configuration(format!(
                    "enclaveURL must use https://, got {url}"
                )));
            }
        }
        if config.config_repo.is_some() && config.enclave_url.is_none() {
            return Err(TinfoilError::Configuration(
                "configRepo requires enclaveURL: the central assembly path ignores a custom repo"
                    .to_string(),
            ));
        }
        if config.enclave_url.is_some() && config.config_repo.is_none() {
            tracing::warn!(
                "enclaveURL set without configRepo; verifying against the default repository"
            );
        }

        Ok(Self {
            config,
            attestor,
            session_factory,
            state: tokio::sync::Mutex::new(ClientState::default()),
        })
    }

    /// Run (or join) the attestation pass and build the session.
    ///
    /// Single-flight: concurrent callers serialize on the client state
    /// and observe the outcome of one pass. A transient fetch or
    /// attestation failure is retried once after a fixed delay; any
    /// other error propagates immediately.
    pub async fn ready(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.status == ClientStatus::Ready {
            return Ok(());
        }

        *state = ClientState::default();
        state.status = ClientStatus::Initializing;

        let mut outcome = self.attestor.attest(&self.config).await;
        if let Err(error) = &outcome.verified {
            if matches!(
                error,
                TinfoilError::Fetch { .. } | TinfoilError::Attestation { .. }
            ) {
                tracing::warn!(error = %error, "attestation pass failed; retrying once");
                *state = ClientState::default();
                state.status = ClientStatus::Initializing;
                tokio::time::sleep(READY_RETRY_DELAY).await;
                outcome = self.attestor.attest(&self.config).await;
            }
        }

        match outcome.verified {
            Ok(verified) => {
                let enclave_url = self
                    .config
                    .enclave_url
                    .clone()
                    .unwrap_or_else(|| format!("https://{}", verified.enclave_domain));
                let base_url = self
                    .config
                    .base_url
                    .clone()
                    .unwrap_or_else(|| format!("{}/v1/", enclave_url.trim_end_matches('/')));

                let session = match (self.session_factory)(
                    &verified.response,
                    &base_url,
                    self.config.transport,
                ) {
                    Ok(session) => session,
                    Err(error) => {
                        state.document = Some(outcome.document);
                        state.status = ClientStatus::Failed;
                        return Err(error);
                    }
                };

                state.session = Some(session);
                state.document = Some(outcome.document);
                state.base_url = Some(base_url);
                state.enclave_url = Some(enclave_url);
                state.status = ClientStatus::Ready;
                Ok(())
            }
            Err(error) => {
                state.document = Some(outcome.document);
                state.status = ClientStatus::Failed;
                Err(error)
            }
        }
    }

    /// Issue a request through the verified session.
    ///
    /// `input` may be a full URL or a path joined onto the base URL.
    /// A [`TinfoilError::KeyConfigMismatch`] — the server rotated its
    /// HPKE keys and did not accept the request — triggers exactly one
    /// reset, re-attestation, and retry. Every other error propagates
    /// unchanged.
    pub async fn fetch(&self, input: &str, init: RequestInit) -> Result<TransportResponse> {
        self.ready().await?;
        let (session, url) = self.session_and_url(input).await?;

        match session.request(&url, &init).await {
            Err(TinfoilError::KeyConfigMismatch) => {
                tracing::info!("server rotated HPKE keys; re-attesting and retrying once");
                self.reset().await;
                self.ready().await?;
                let (session, url) = self.session_and_url(input).await?;
                session.request(&url, &init).await
            }
            other => other,
        }
    }

    async fn session_and_url(&self, input: &str) -> Result<(Arc<dyn SecureSession>, String)> {
        let state = self.state.lock().await;
        let session = state
            .session
            .clone()
            .ok_or_else(|| TinfoilError::Configuration("client is not ready".to_string()))?;
        let url = if input.starts_with("http://") || input.starts_with("https://") {
            input.to_string()
        } else {
            let base = state.base_url.clone().unwrap_or_default();
            format!(
                "{}/{}",
                base.trim_end_matches('/'),
                input.trim_start_matches('/')
            )
        };
        Ok((session, url))
    }

    /// Drop all derived state and return to `Uninitialized`.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        *state = ClientState::default();
    }

    pub async fn status(&self) -> ClientStatus {
        self.state.lock().await.status
    }

    /// The latest verification document, if a pass has run.
    pub async fn verification_document(&self) -> Option<VerificationDocument> {
        self.state.lock().await.document.clone()
    }

    /// Resolved base URL; `None` until `ready()` succeeds or after
    /// `reset()`.
    pub async fn get_base_url(&self) -> Option<String> {
        self.state.lock().await.base_url.clone()
    }

    /// Resolved enclave URL; `None` until `ready()` succeeds or after
    /// `reset()`.
    pub async fn get_enclave_url(&self) -> Option<String> {
        self.state.lock().await.enclave_url.clone()
    }

    /// Recovery token from the current session's latest request.
    pub async fn recovery_token(&self) -> Option<SessionToken> {
        let state = self.state.lock().await;
        state.session.as_ref().and_then(|s| s.recovery_token())
    }
}

fn default_session_factory(
    response: &AttestationResponse,
    base_url: &str,
    mode: TransportMode,
) -> Result<Arc<dyn SecureSession>> {
    match mode {
        TransportMode::Ehbp => {
            let identity = Identity::from_public_key_hex(&response.hpke_public_key)?;
            let transport = Transport::new(identity, &host_of(base_url));
            Ok(Arc::new(EhbpSession { transport }))
        }
        TransportMode::Tls => {
            let client = PinnedTlsClient::new(&response.tls_public_key_fingerprint)?;
            Ok(Arc::new(PinnedSession { client }))
        }
    }
}

/// Host portion of a URL, without scheme, path, or port.
fn host_of(url: &str) -> String {
    let without_scheme = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    without_scheme
        .split(['/', ':'])
        .next()
        .unwrap_or_default()
        .to_string()
}
