//! Attestation bundle assembly.
//!
//! Gathers everything one verification pass needs — attestation report,
//! release digest, Sigstore bundle, VCEK, and the enclave's TLS
//! certificate — from public infrastructure over HTTPS. The three
//! independent fetches run in parallel; the Sigstore bundle (keyed by
//! digest) and VCEK (keyed by the parsed report) follow sequentially.
//! Every fetch is wrapped in a bounded retry with exponential backoff;
//! parse failures are never retried.
//!
//! A centralized attestation server (the ATC) can alternatively hand
//! back a pre-assembled bundle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::attestation::AttestationDocument;
use crate::codec;
use crate::error::{Result, TinfoilError};
use crate::report::Report;

/// GitHub API proxy for release metadata and attestations.
pub const GITHUB_API_PROXY: &str = "https://api-github-proxy.tinfoil.sh";

/// GitHub download proxy for release assets.
pub const GITHUB_DL_PROXY: &str = "https://github-download-proxy.tinfoil.sh";

/// AMD Key Distribution Service proxy.
pub const KDS_PROXY: &str = "https://kds-proxy.tinfoil.sh";

/// Attestation-trust coordinator base URL.
pub const ATC_BASE_URL: &str = "https://atc.tinfoil.sh";

/// Default configuration repository: the confidential inference router.
pub const DEFAULT_CONFIG_REPO: &str = "tinfoilsh/confidential-inference-router";

/// Well-known path serving the enclave's attestation document.
const WELL_KNOWN_ATTESTATION: &str = "/.well-known/tinfoil-attestation";

/// Well-known path serving the enclave's TLS certificate.
const WELL_KNOWN_CERTIFICATE: &str = "/.well-known/tinfoil-certificate";

/// Retries after the first attempt (3 attempts total).
const MAX_RETRIES: u32 = 2;

/// Initial backoff delay; doubles per retry (500ms, 1s, 2s).
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Everything verified atomically by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationBundle {
    /// Domain the enclave serves under.
    pub domain: String,
    /// The enclave's attestation document.
    pub enclave_attestation_report: AttestationDocument,
    /// Hex SHA-256 of the release artifact.
    pub digest: String,
    /// Opaque Sigstore bundle proving code provenance.
    pub sigstore_bundle: serde_json::Value,
    /// Base64 DER VCEK certificate.
    pub vcek: String,
    /// PEM TLS certificate presented by the enclave.
    pub enclave_cert: String,
}

/// An HTTP response body with enough metadata for error reporting.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
}

impl HttpResponse {
    /// Fail with a fetch error unless the status is 2xx.
    pub fn require_success(self, url: &str) -> Result<HttpResponse> {
        if (200..300).contains(&self.status) {
            Ok(self)
        } else {
            Err(TinfoilError::fetch(url, format!("status {}", self.status)))
        }
    }

    /// Parse the body as JSON. Malformed bodies are fetch errors, but
    /// they occur outside the retry wrapper and are never retried.
    pub fn json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| TinfoilError::fetch(url, format!("invalid JSON response: {e}")))
    }
}

/// HTTP seam for the assembler and encrypted transport, so tests can
/// substitute a mock.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(&self, url: &str) -> Result<HttpResponse>;
    async fn post_json(&self, url: &str, body: serde_json::Value) -> Result<HttpResponse>;

    /// Send a request with a binary body and explicit content type.
    async fn send_bytes(
        &self,
        method: &str,
        url: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<HttpResponse>;
}

/// Production [`HttpClient`] backed by `reqwest`.
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    async fn read_response(url: &str, response: reqwest::Response) -> Result<HttpResponse> {
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|e| TinfoilError::fetch(url, format!("failed to read body: {e}")))?
            .to_vec();
        Ok(HttpResponse {
            status,
            body,
            content_type,
        })
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn get(&self, url: &str) -> Result<HttpResponse> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TinfoilError::fetch(url, e.to_string()))?;
        Self::read_response(url, response).await
    }

    async fn post_json(&self, url: &str, body: serde_json::Value) -> Result<HttpResponse> {
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| TinfoilError::fetch(url, e.to_string()))?;
        Self::read_response(url, response).await
    }

    async fn send_bytes(
        &self,
        method: &str,
        url: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<HttpResponse> {
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|e| TinfoilError::fetch(url, format!("invalid method: {e}")))?;
        let response = self
            .client
            .request(method, url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| TinfoilError::fetch(url, e.to_string()))?;
        Self::read_response(url, response).await
    }
}

/// Assembles attestation bundles from live fetches.
pub struct BundleAssembler {
    http: Arc<dyn HttpClient>,
    /// Per-URL VCEK cache; the URL encodes chip ID and TCB parts, so a
    /// hit is bit-identical to a fresh fetch.
    vcek_cache: Mutex<HashMap<String, String>>,
}

impl BundleAssembler {
    pub fn new() -> Self {
        Self::with_http(Arc::new(ReqwestHttpClient::new()))
    }

    pub fn with_http(http: Arc<dyn HttpClient>) -> Self {
        Self {
            http,
            vcek_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Assemble a bundle for an enclave host and configuration repo.
    pub async fn assemble(&self, enclave_host: &str, repo: &str) -> Result<AttestationBundle> {
        let (report, digest, cert) = tokio::join!(
            self.fetch_attestation_document(enclave_host),
            self.fetch_release_digest(repo),
            self.fetch_enclave_certificate(enclave_host),
        );
        let enclave_attestation_report = report?;
        let digest = digest?;
        let enclave_cert = cert?;

        let sigstore_bundle = self.fetch_sigstore_bundle(repo, &digest).await?;
        let vcek = self
            .fetch_vcek_for_document(&enclave_attestation_report)
            .await?;

        Ok(AttestationBundle {
            domain: enclave_host.to_string(),
            enclave_attestation_report,
            digest,
            sigstore_bundle,
            vcek,
            enclave_cert,
        })
    }

    /// Fetch a pre-assembled bundle from the attestation-trust
    /// coordinator. `POST` with an explicit target whenever the caller
    /// pinned an enclave or repo; plain `GET` otherwise selects the
    /// coordinator's default.
    pub async fn fetch_from_atc(
        &self,
        atc_base_url: &str,
        enclave_url: Option<&str>,
        repo: Option<&str>,
    ) -> Result<AttestationBundle> {
        let url = format!("{atc_base_url}/attestation");
        let response = if enclave_url.is_some() || repo.is_some() {
            let body = serde_json::json!({
                "enclaveUrl": enclave_url,
                "repo": repo.unwrap_or(DEFAULT_CONFIG_REPO),
            });
            self.post_with_retries(&url, body).await?
        } else {
            self.get_with_retries(&url).await?
        };
        response.json(&url)
    }

    /// List available router hostnames and pick one uniformly at random.
    pub async fn select_router(&self, atc_base_url: &str) -> Result<String> {
        let url = format!("{atc_base_url}/routers?platform=snp");
        let response = self.get_with_retries(&url).await?;
        let routers: Vec<String> = response.json(&url)?;
        if routers.is_empty() {
            return Err(TinfoilError::fetch(&url, "no routers available"));
        }
        let index = rand::thread_rng().gen_range(0..routers.len());
        let selected = routers[index].clone();
        tracing::debug!(router = %selected, candidates = routers.len(), "selected router");
        Ok(selected)
    }

    async fn fetch_attestation_document(&self, host: &str) -> Result<AttestationDocument> {
        let url = format!("https://{host}{WELL_KNOWN_ATTESTATION}");
        let response = self.get_with_retries(&url).await?;
        response.json(&url)
    }

    async fn fetch_enclave_certificate(&self, host: &str) -> Result<String> {
        #[derive(Deserialize)]
        struct CertificateResponse {
            certificate: String,
        }
        let url = format!("https://{host}{WELL_KNOWN_CERTIFICATE}");
        let response = self.get_with_retries(&url).await?;
        let parsed: CertificateResponse = response.json(&url)?;
        Ok(parsed.certificate)
    }

    /// Resolve the latest release digest for a repo: from the release
    /// notes when they embed it, else from the `tinfoil.hash` asset.
    async fn fetch_release_digest(&self, repo: &str) -> Result<String> {
        #[derive(Deserialize)]
        struct Release {
            tag_name: String,
            #[serde(default)]
            body: String,
        }

        let url = format!("{GITHUB_API_PROXY}/repos/{repo}/releases/latest");
        let response = self.get_with_retries(&url).await?;
        let release: Release = response.json(&url)?;

        if let Some(digest) = extract_release_digest(&release.body) {
            return Ok(digest);
        }

        let asset_url = format!(
            "{GITHUB_DL_PROXY}/{repo}/releases/download/{}/tinfoil.hash",
            release.tag_name
        );
        let response = self.get_with_retries(&asset_url).await?;
        let digest = String::from_utf8_lossy(&response.body).trim().to_string();
        if !is_hex_digest(&digest) {
            return Err(TinfoilError::fetch(
                &asset_url,
                "release hash asset is not a hex SHA-256",
            ));
        }
        Ok(digest)
    }

    async fn fetch_sigstore_bundle(&self, repo: &str, digest: &str) -> Result<serde_json::Value> {
        #[derive(Deserialize)]
        struct Attestations {
            attestations: Vec<AttestationEntry>,
        }
        #[derive(Deserialize)]
        struct AttestationEntry {
            bundle: serde_json::Value,
        }

        let url = format!("{GITHUB_API_PROXY}/repos/{repo}/attestations/sha256:{digest}");
        let response = self.get_with_retries(&url).await?;
        let parsed: Attestations = response.json(&url)?;
        parsed
            .attestations
            .into_iter()
            .next()
            .map(|entry| entry.bundle)
            .ok_or_else(|| TinfoilError::fetch(&url, "no attestations for release digest"))
    }

    /// Fetch the VCEK endorsing a report, as base64 DER. Parses the
    /// report just enough for the KDS URL (product, chip ID, reported
    /// TCB) and serves repeats from the per-URL cache.
    async fn fetch_vcek_for_document(&self, doc: &AttestationDocument) -> Result<String> {
        let raw = codec::decode_report_body(&doc.body)?;
        let report = Report::parse(&raw)?;
        let tcb = report.reported_tcb();
        let url = format!(
            "{KDS_PROXY}/vcek/v1/{}/{}?blSPL={}&teeSPL={}&snpSPL={}&ucodeSPL={}",
            report.product_name(),
            hex::encode(report.chip_id()),
            tcb.bl_spl,
            tcb.tee_spl,
            tcb.snp_spl,
            tcb.ucode_spl,
        );

        if let Some(cached) = self.vcek_cache.lock().await.get(&url) {
            tracing::debug!(url = %url, "VCEK cache hit");
            return Ok(cached.clone());
        }

        let response = self.get_with_retries(&url).await?;
        let vcek = BASE64.encode(&response.body);
        self.vcek_cache.lock().await.insert(url, vcek.clone());
        Ok(vcek)
    }

    /// GET with up to [`MAX_RETRIES`] retries on transient failures.
    async fn get_with_retries(&self, url: &str) -> Result<HttpResponse> {
        self.request_with_retries(url, None).await
    }

    async fn post_with_retries(
        &self,
        url: &str,
        body: serde_json::Value,
    ) -> Result<HttpResponse> {
        self.request_with_retries(url, Some(body)).await
    }

    async fn request_with_retries(
        &self,
        url: &str,
        body: Option<serde_json::Value>,
    ) -> Result<HttpResponse> {
        let mut delay = RETRY_BASE_DELAY;
        let mut attempt = 0;
        loop {
            let result = match &body {
                None => self.http.get(url).await,
                Some(json) => self.http.post_json(url, json.clone()).await,
            }
            .and_then(|response| response.require_success(url));

            match result {
                Ok(response) => return Ok(response),
                Err(error) if error.is_transient() && attempt < MAX_RETRIES => {
                    attempt += 1;
                    tracing::warn!(url, attempt, error = %error, "fetch failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

impl Default for BundleAssembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract a release digest from release notes: either an
/// `EIF hash: <hex>` line or a backticked ``Digest: `<hex>` `` line.
fn extract_release_digest(body: &str) -> Option<String> {
    for marker in ["EIF hash: ", "Digest: `"] {
        if let Some(pos) = body.find(marker) {
            let candidate: String = body[pos + marker.len()..].chars().take(64).collect();
            if is_hex_digest(&candidate) {
                return Some(candidate);
            }
        }
    }
    None
}

fn is_hex_digest(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Mock HTTP client that fails with transient errors a configured
    /// number of times per URL, then succeeds.
    struct FlakyHttp {
        failures: u32,
        calls: AtomicU32,
        body: Vec<u8>,
    }

    #[async_trait]
    impl HttpClient for FlakyHttp {
        async fn get(&self, url: &str) -> Result<HttpResponse> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(TinfoilError::fetch(url, "connection reset"));
            }
            Ok(HttpResponse {
                status: 200,
                body: self.body.clone(),
                content_type: None,
            })
        }

        async fn post_json(&self, url: &str, _body: serde_json::Value) -> Result<HttpResponse> {
            self.get(url).await
        }

        async fn send_bytes(
            &self,
            _method: &str,
            url: &str,
            _content_type: &str,
            _body: Vec<u8>,
        ) -> Result<HttpResponse> {
            self.get(url).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_succeed() {
        let http = Arc::new(FlakyHttp {
            failures: 1,
            calls: AtomicU32::new(0),
            body: b"ok".to_vec(),
        });
        let assembler = BundleAssembler::with_http(http.clone());
        let response = assembler.get_with_retries("https://e/x").await.unwrap();
        assert_eq!(response.body, b"ok");
        assert_eq!(http.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_bound_is_three_attempts() {
        let http = Arc::new(FlakyHttp {
            failures: 10,
            calls: AtomicU32::new(0),
            body: Vec::new(),
        });
        let assembler = BundleAssembler::with_http(http.clone());
        let err = assembler.get_with_retries("https://e/x").await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(http.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_parse_error_is_single_attempt() {
        let http = Arc::new(FlakyHttp {
            failures: 0,
            calls: AtomicU32::new(0),
            body: b"not json".to_vec(),
        });
        let assembler = BundleAssembler::with_http(http.clone());
        let err = assembler
            .fetch_attestation_document("enclave.example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, TinfoilError::Fetch { .. }));
        assert_eq!(http.calls.load(Ordering::SeqCst), 1);
    }

    /// Mock returning a different canned body per URL substring.
    struct RoutedHttp {
        routes: Vec<(&'static str, HttpResponse)>,
    }

    #[async_trait]
    impl HttpClient for RoutedHttp {
        async fn get(&self, url: &str) -> Result<HttpResponse> {
            self.routes
                .iter()
                .find(|(needle, _)| url.contains(needle))
                .map(|(_, response)| response.clone())
                .ok_or_else(|| TinfoilError::fetch(url, "no route"))
        }

        async fn post_json(&self, url: &str, _body: serde_json::Value) -> Result<HttpResponse> {
            self.get(url).await
        }

        async fn send_bytes(
            &self,
            _method: &str,
            url: &str,
            _content_type: &str,
            _body: Vec<u8>,
        ) -> Result<HttpResponse> {
            self.get(url).await
        }
    }

    fn ok_json(value: serde_json::Value) -> HttpResponse {
        HttpResponse {
            status: 200,
            body: serde_json::to_vec(&value).unwrap(),
            content_type: Some("application/json".to_string()),
        }
    }

    #[tokio::test]
    async fn test_release_digest_from_notes() {
        let digest = "ab".repeat(32);
        let http = Arc::new(RoutedHttp {
            routes: vec![(
                "/releases/latest",
                ok_json(serde_json::json!({
                    "tag_name": "v1.2.3",
                    "body": format!("Release notes\nEIF hash: {digest}\nmore text")
                })),
            )],
        });
        let assembler = BundleAssembler::with_http(http);
        assert_eq!(
            assembler.fetch_release_digest("org/repo").await.unwrap(),
            digest
        );
    }

    #[tokio::test]
    async fn test_release_digest_from_hash_asset() {
        let digest = "cd".repeat(32);
        let http = Arc::new(RoutedHttp {
            routes: vec![
                (
                    "/releases/latest",
                    ok_json(serde_json::json!({"tag_name": "v2.0.0", "body": "no digest here"})),
                ),
                (
                    "/releases/download/v2.0.0/tinfoil.hash",
                    HttpResponse {
                        status: 200,
                        body: format!("{digest}\n").into_bytes(),
                        content_type: None,
                    },
                ),
            ],
        });
        let assembler = BundleAssembler::with_http(http);
        assert_eq!(
            assembler.fetch_release_digest("org/repo").await.unwrap(),
            digest
        );
    }

    #[test]
    fn test_extract_release_digest_backticked() {
        let digest = "ef".repeat(32);
        let body = format!("## Release\nDigest: `{digest}`\n");
        assert_eq!(extract_release_digest(&body), Some(digest));
    }

    #[test]
    fn test_extract_release_digest_rejects_short_hex() {
        assert_eq!(extract_release_digest("EIF hash: abc123"), None);
        assert_eq!(extract_release_digest("nothing at all"), None);
    }

    #[tokio::test]
    async fn test_select_router_uniform_choice() {
        let http = Arc::new(RoutedHttp {
            routes: vec![(
                "/routers",
                ok_json(serde_json::json!(["r1.example.com", "r2.example.com"])),
            )],
        });
        let assembler = BundleAssembler::with_http(http);
        let selected = assembler.select_router(ATC_BASE_URL).await.unwrap();
        assert!(selected == "r1.example.com" || selected == "r2.example.com");
    }

    #[tokio::test]
    async fn test_select_router_empty_list_fails() {
        let http = Arc::new(RoutedHttp {
            routes: vec![("/routers", ok_json(serde_json::json!([])))],
        });
        let assembler = BundleAssembler::with_http(http);
        assert!(assembler.select_router(ATC_BASE_URL).await.is_err());
    }

    #[tokio::test]
    async fn test_atc_get_when_no_overrides() {
        // GET path returns a bundle document.
        let bundle = serde_json::json!({
            "domain": "inference.example.com",
            "enclaveAttestationReport": {
                "format": "https://tinfoil.sh/predicate/sev-snp-guest/v2",
                "body": "aGVsbG8="
            },
            "digest": "aa".repeat(32),
            "sigstoreBundle": {},
            "vcek": "AQID",
            "enclaveCert": "-----BEGIN CERTIFICATE-----"
        });
        let http = Arc::new(RoutedHttp {
            routes: vec![("/attestation", ok_json(bundle))],
        });
        let assembler = BundleAssembler::with_http(http);
        let parsed = assembler
            .fetch_from_atc(ATC_BASE_URL, None, None)
            .await
            .unwrap();
        assert_eq!(parsed.domain, "inference.example.com");
        assert_eq!(parsed.vcek, "AQID");
    }
}
