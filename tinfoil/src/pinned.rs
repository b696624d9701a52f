//! TLS-pinned transport.
//!
//! Alternative to the encrypted-body transport: plain HTTPS where the
//! server certificate's public key must hash to the fingerprint attested
//! in the SNP report. Pin verification must run on every connection, so
//! this transport opens one connection per request and disables
//! keep-alive; pooled reuse would skip the check.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::DigitallySignedStruct;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::TlsConnector;

use crate::ehbp::{RequestInit, TransportResponse};
use crate::error::{Result, TinfoilError};

/// HTTPS client pinned to an attested public-key fingerprint.
pub struct PinnedTlsClient {
    config: Arc<rustls::ClientConfig>,
}

impl PinnedTlsClient {
    /// Pin to a hex SHA-256 of the server's SubjectPublicKeyInfo.
    pub fn new(spki_fingerprint_hex: &str) -> Result<Self> {
        let pin = hex::decode(spki_fingerprint_hex).map_err(|e| {
            TinfoilError::attestation_with("TLS fingerprint is not valid hex", e)
        })?;
        if pin.len() != 32 {
            return Err(TinfoilError::attestation(format!(
                "TLS fingerprint has invalid length: {}",
                pin.len()
            )));
        }

        let provider = rustls::crypto::ring::default_provider();
        let algorithms = provider.signature_verification_algorithms;
        let verifier = PinVerifier { pin, algorithms };

        let config = rustls::ClientConfig::builder_with_provider(Arc::new(provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| TinfoilError::attestation_with("TLS configuration failed", e))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Issue one request over a fresh pinned connection.
    pub async fn request(&self, url: &str, init: &RequestInit) -> Result<TransportResponse> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| TinfoilError::Configuration(format!("invalid URL {url}: {e}")))?;
        if parsed.scheme() != "https" {
            return Err(TinfoilError::Configuration(format!(
                "pinned transport requires https URLs, got {url}"
            )));
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| TinfoilError::Configuration(format!("URL has no host: {url}")))?
            .to_string();
        let port = parsed.port().unwrap_or(443);
        let mut path = parsed.path().to_string();
        if let Some(query) = parsed.query() {
            path = format!("{path}?{query}");
        }

        let stream = tokio::net::TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| TinfoilError::fetch(url, format!("connect failed: {e}")))?;

        let server_name = ServerName::try_from(host.clone())
            .map_err(|e| TinfoilError::Configuration(format!("invalid host name {host}: {e}")))?;
        let connector = TlsConnector::from(self.config.clone());
        let mut tls = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| TinfoilError::attestation_with("pinned TLS handshake failed", e))?;

        let body = init.body.as_deref().unwrap_or_default();
        let mut request = format!(
            "{} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\nContent-Length: {}\r\n",
            init.method,
            path,
            host,
            body.len()
        );
        for (name, value) in &init.headers {
            request.push_str(&format!("{name}: {value}\r\n"));
        }
        request.push_str("\r\n");

        tls.write_all(request.as_bytes())
            .await
            .map_err(|e| TinfoilError::fetch(url, format!("write failed: {e}")))?;
        tls.write_all(body)
            .await
            .map_err(|e| TinfoilError::fetch(url, format!("write failed: {e}")))?;

        let mut raw = Vec::new();
        // Connection: close delimits the response; EOF errors after the
        // peer's close_notify are expected on some stacks.
        match tls.read_to_end(&mut raw).await {
            Ok(_) => {}
            Err(e) if !raw.is_empty() => {
                tracing::debug!(error = %e, "short read after response body");
            }
            Err(e) => return Err(TinfoilError::fetch(url, format!("read failed: {e}"))),
        }

        parse_http_response(&raw, url)
    }
}

/// Certificate verifier that accepts exactly the attested key.
///
/// The chain is irrelevant: trust derives from the SNP report binding,
/// not from a CA. Handshake signatures are still verified, proving the
/// peer holds the pinned key.
#[derive(Debug)]
struct PinVerifier {
    pin: Vec<u8>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for PinVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let cert = crate::x509::Certificate::from_der(end_entity.as_ref())
            .map_err(|e| rustls::Error::General(format!("certificate parse failed: {e}")))?;
        let spki = cert
            .spki_der()
            .map_err(|e| rustls::Error::General(format!("certificate has no SPKI: {e}")))?;
        let fingerprint = Sha256::digest(&spki);

        if fingerprint.as_slice() == self.pin.as_slice() {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(format!(
                "certificate key fingerprint {} does not match attested pin {}",
                hex::encode(fingerprint),
                hex::encode(&self.pin)
            )))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Parse a full HTTP/1.1 response captured up to connection close.
fn parse_http_response(raw: &[u8], url: &str) -> Result<TransportResponse> {
    let header_end = find_header_end(raw)
        .ok_or_else(|| TinfoilError::fetch(url, "malformed HTTP response: no header end"))?;
    let head = String::from_utf8_lossy(&raw[..header_end]);
    let mut lines = head.split("\r\n");

    let status_line = lines
        .next()
        .ok_or_else(|| TinfoilError::fetch(url, "malformed HTTP response: empty status line"))?;
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| {
            TinfoilError::fetch(url, format!("malformed status line: {status_line}"))
        })?;

    let mut content_type = None;
    let mut content_length: Option<usize> = None;
    let mut chunked = false;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-type") {
            content_type = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("content-length") {
            content_length = value.parse().ok();
        } else if name.eq_ignore_ascii_case("transfer-encoding")
            && value.to_ascii_lowercase().contains("chunked")
        {
            chunked = true;
        }
    }

    let raw_body = &raw[header_end + 4..];
    let body = if chunked {
        decode_chunked(raw_body, url)?
    } else if let Some(length) = content_length {
        raw_body.get(..length).unwrap_or(raw_body).to_vec()
    } else {
        raw_body.to_vec()
    };

    Ok(TransportResponse {
        status,
        content_type,
        body,
    })
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|window| window == b"\r\n\r\n")
}

fn decode_chunked(raw: &[u8], url: &str) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    let mut rest = raw;
    loop {
        let line_end = rest
            .windows(2)
            .position(|window| window == b"\r\n")
            .ok_or_else(|| TinfoilError::fetch(url, "malformed chunked body"))?;
        let size_line = String::from_utf8_lossy(&rest[..line_end]);
        let size = usize::from_str_radix(size_line.trim().split(';').next().unwrap_or("0"), 16)
            .map_err(|_| TinfoilError::fetch(url, "malformed chunk size"))?;
        rest = &rest[line_end + 2..];
        if size == 0 {
            break;
        }
        if rest.len() < size {
            return Err(TinfoilError::fetch(url, "truncated chunked body"));
        }
        body.extend_from_slice(&rest[..size]);
        rest = rest.get(size + 2..).unwrap_or_default();
    }
    Ok(body)
}
