//! Encrypted HTTP body transport (EHBP) over RFC 9180 HPKE.
//!
//! Request bodies are sealed to the enclave's attested X25519 public key
//! with DHKEM(X25519)/HKDF-SHA256/AES-128-GCM in base mode; the target
//! host is bound into the AEAD associated data. Response bodies come
//! back under an AES-128-GCM key derived from the sender context's
//! exporter secret, so a stored [`SessionToken`] can decrypt a pending
//! response even after the transport itself is gone.
//!
//! When the server rotates its key configuration it rejects the
//! encapsulated key with the keys media type; that surfaces as
//! [`TinfoilError::KeyConfigMismatch`], the one transport error the
//! secure client recovers from automatically.

use std::sync::{Arc, Mutex};

use aes_gcm::aead::Aead;
use aes_gcm::{Aes128Gcm, KeyInit, Nonce};
use hpke::aead::AesGcm128;
use hpke::kdf::HkdfSha256;
use hpke::kem::X25519HkdfSha256;
use hpke::{Deserializable, Kem as KemTrait, OpModeS, Serializable};

use crate::bundle::{HttpClient, HttpResponse, ReqwestHttpClient};
use crate::error::{Result, TinfoilError};

type Kem = X25519HkdfSha256;

/// Media type of the server's published HPKE key configuration.
pub const EHBP_KEYS_MEDIA_TYPE: &str = "application/vnd.tinfoil.ehbp-v1+keys";

/// Media type of an encrypted request body: `enc || ciphertext`.
pub const EHBP_REQUEST_MEDIA_TYPE: &str = "application/vnd.tinfoil.ehbp-v1+request";

/// Media type of an encrypted response body.
pub const EHBP_RESPONSE_MEDIA_TYPE: &str = "application/vnd.tinfoil.ehbp-v1+response";

/// HPKE info string for request encapsulation.
const EHBP_INFO: &[u8] = b"tinfoil-ehbp-v1";

/// Exporter label for the response key material.
const EHBP_RESPONSE_EXPORT: &[u8] = b"tinfoil-ehbp-v1 response";

/// Exported secret length: AES-128 key plus 96-bit nonce.
const RESPONSE_SECRET_LEN: usize = 16 + 12;

/// X25519 encapsulated key length on the wire.
const ENCAPPED_KEY_LEN: usize = 32;

/// Status code the server answers with when the encapsulated key no
/// longer matches a live key configuration.
const KEY_MISMATCH_STATUS: u16 = 409;

/// The server identity requests are encrypted to.
#[derive(Clone)]
pub struct Identity {
    public_key: <Kem as KemTrait>::PublicKey,
}

impl Identity {
    /// Build an identity from an attested public key, hex-encoded.
    pub fn from_public_key_hex(hex_key: &str) -> Result<Self> {
        let bytes = hex::decode(hex_key)
            .map_err(|e| TinfoilError::attestation_with("HPKE public key is not valid hex", e))?;
        Self::from_public_key_bytes(&bytes)
    }

    /// Build an identity from raw public key bytes.
    pub fn from_public_key_bytes(bytes: &[u8]) -> Result<Self> {
        let public_key = <Kem as KemTrait>::PublicKey::from_bytes(bytes)
            .map_err(|e| TinfoilError::attestation_with("invalid X25519 public key", e))?;
        Ok(Self { public_key })
    }

    /// The public key, hex-encoded.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.to_bytes())
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

/// A request in the shape the secure client's `fetch` accepts.
#[derive(Debug, Clone)]
pub struct RequestInit {
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl Default for RequestInit {
    fn default() -> Self {
        Self {
            method: "POST".to_string(),
            headers: Vec::new(),
            body: None,
        }
    }
}

/// A decrypted transport response.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Recovery token for a pending response: enough key material to decrypt
/// it later (for example after a page reload), without the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    /// Exporter-derived response key material.
    pub exported_secret: Vec<u8>,
    /// The encapsulated key the request was sent with.
    pub request_enc: Vec<u8>,
}

/// Encrypted-body transport bound to one server identity and host.
pub struct Transport {
    identity: Identity,
    request_host: String,
    http: Arc<dyn HttpClient>,
    last_token: Mutex<Option<SessionToken>>,
}

impl Transport {
    /// Transport to `request_host`, encrypting to `identity`.
    pub fn new(identity: Identity, request_host: &str) -> Self {
        Self::with_http(identity, request_host, Arc::new(ReqwestHttpClient::new()))
    }

    pub fn with_http(identity: Identity, request_host: &str, http: Arc<dyn HttpClient>) -> Self {
        Self {
            identity,
            request_host: request_host.to_string(),
            http,
            last_token: Mutex::new(None),
        }
    }

    /// Send a request with an end-to-end encrypted body.
    ///
    /// Dropping the returned future cancels the underlying HTTP request.
    pub async fn request(&self, url: &str, init: &RequestInit) -> Result<TransportResponse> {
        let plaintext = init.body.clone().unwrap_or_default();

        let mut rng = rand::rngs::OsRng;
        let (encapped_key, mut ctx) = hpke::setup_sender::<AesGcm128, HkdfSha256, Kem, _>(
            &OpModeS::Base,
            &self.identity.public_key,
            EHBP_INFO,
            &mut rng,
        )
        .map_err(|e| TinfoilError::attestation_with("HPKE sender setup failed", e))?;

        let ciphertext = ctx
            .seal(&plaintext, self.request_host.as_bytes())
            .map_err(|e| TinfoilError::attestation_with("request encryption failed", e))?;

        let mut exported_secret = vec![0u8; RESPONSE_SECRET_LEN];
        ctx.export(EHBP_RESPONSE_EXPORT, &mut exported_secret)
            .map_err(|e| TinfoilError::attestation_with("exporter derivation failed", e))?;

        let request_enc = encapped_key.to_bytes().to_vec();
        let token = SessionToken {
            exported_secret,
            request_enc: request_enc.clone(),
        };
        *self.last_token.lock().expect("token lock poisoned") = Some(token.clone());

        let mut wire = request_enc;
        wire.extend_from_slice(&ciphertext);

        let response = self
            .http
            .send_bytes(&init.method, url, EHBP_REQUEST_MEDIA_TYPE, wire)
            .await?;

        Self::decode_response(&token, response)
    }

    fn decode_response(token: &SessionToken, response: HttpResponse) -> Result<TransportResponse> {
        let content_type = response.content_type.clone();
        let is_keys = content_type
            .as_deref()
            .map(|ct| ct.starts_with(EHBP_KEYS_MEDIA_TYPE))
            .unwrap_or(false);
        if response.status == KEY_MISMATCH_STATUS && is_keys {
            return Err(TinfoilError::KeyConfigMismatch);
        }

        let encrypted = content_type
            .as_deref()
            .map(|ct| ct.starts_with(EHBP_RESPONSE_MEDIA_TYPE))
            .unwrap_or(false);
        let body = if encrypted {
            decrypt_response(token, &response.body)?
        } else {
            response.body
        };

        Ok(TransportResponse {
            status: response.status,
            content_type,
            body,
        })
    }

    /// Token for the most recent request, if one was sent.
    pub fn recovery_token(&self) -> Option<SessionToken> {
        self.last_token.lock().expect("token lock poisoned").clone()
    }
}

/// Decrypt a stored response body with a [`SessionToken`].
pub fn decrypt_response(token: &SessionToken, body: &[u8]) -> Result<Vec<u8>> {
    if token.exported_secret.len() != RESPONSE_SECRET_LEN {
        return Err(TinfoilError::attestation(format!(
            "invalid session token secret length: {}",
            token.exported_secret.len()
        )));
    }
    let cipher = Aes128Gcm::new_from_slice(&token.exported_secret[..16])
        .map_err(|_| TinfoilError::attestation("invalid response key length"))?;
    let nonce = Nonce::from_slice(&token.exported_secret[16..]);
    cipher
        .decrypt(nonce, body)
        .map_err(|_| TinfoilError::attestation("response decryption failed"))
}

/// Split an EHBP request wire body into encapsulated key and ciphertext.
pub fn split_wire_body(wire: &[u8]) -> Result<(&[u8], &[u8])> {
    if wire.len() < ENCAPPED_KEY_LEN {
        return Err(TinfoilError::attestation(
            "EHBP request body shorter than an encapsulated key",
        ));
    }
    Ok(wire.split_at(ENCAPPED_KEY_LEN))
}
