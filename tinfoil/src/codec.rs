//! Binary codecs: attestation body packaging, the dcode SAN scheme, and
//! document fingerprints.
//!
//! The attestation report travels as `base64(gzip(report))`. The enclave's
//! TLS certificate carries two byte blobs split across DNS-shaped Subject
//! Alternative Names (`NN<base32-chunk>.<prefix>.<apex>`), which this
//! module encodes and decodes.

use std::io::Read;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

use crate::error::{Result, TinfoilError};

/// SAN prefix carrying the enclave's HPKE public key.
pub const SAN_PREFIX_HPKE: &str = "hpke";

/// SAN prefix carrying the hex SHA-256 of the attestation document.
pub const SAN_PREFIX_HATT: &str = "hatt";

/// RFC 4648 base32 alphabet.
const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Longest base32 chunk per SAN label: 63 chars minus the 2-digit index.
const DCODE_CHUNK_LEN: usize = 56;

/// Decode an attestation report body: base64, then gzip.
pub fn decode_report_body(body: &str) -> Result<Vec<u8>> {
    let compressed = BASE64
        .decode(body.trim())
        .map_err(|e| TinfoilError::attestation_with("report body is not valid base64", e))?;

    let mut decoder = GzDecoder::new(compressed.as_slice());
    let mut raw = Vec::new();
    decoder
        .read_to_end(&mut raw)
        .map_err(|e| TinfoilError::attestation_with("report body is not valid gzip", e))?;
    Ok(raw)
}

/// Package raw report bytes as `base64(gzip(report))`.
pub fn encode_report_body(raw: &[u8]) -> Result<String> {
    use std::io::Write;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(raw)
        .and_then(|_| encoder.finish())
        .map(|compressed| BASE64.encode(compressed))
        .map_err(|e| TinfoilError::attestation_with("report body compression failed", e))
}

/// Hex SHA-256 over `format || body` of an attestation document.
///
/// This is a byte-exact contract shared with the certificate's `hatt`
/// SAN payload; it must remain stable.
pub fn hash_attestation_document(format: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format.as_bytes());
    hasher.update(body.as_bytes());
    hex::encode(hasher.finalize())
}

/// Decode an RFC 4648 base32 string (case-insensitive, padding stripped).
pub fn base32_decode(input: &str) -> Result<Vec<u8>> {
    let mut output = Vec::with_capacity(input.len() * 5 / 8);
    let mut buf: u64 = 0;
    let mut bits: u32 = 0;

    for ch in input.bytes() {
        let val = match ch {
            b'A'..=b'Z' => ch - b'A',
            b'a'..=b'z' => ch - b'a',
            b'2'..=b'7' => ch - b'2' + 26,
            b'=' => continue,
            _ => {
                return Err(TinfoilError::attestation(format!(
                    "invalid base32 character: {}",
                    ch as char
                )))
            }
        };
        buf = (buf << 5) | val as u64;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            output.push((buf >> bits) as u8);
            buf &= (1 << bits) - 1;
        }
    }

    Ok(output)
}

/// Encode bytes as RFC 4648 base32, uppercase, no padding.
pub fn base32_encode(input: &[u8]) -> String {
    let mut output = String::with_capacity(input.len().div_ceil(5) * 8);
    let mut buf: u64 = 0;
    let mut bits: u32 = 0;

    for &byte in input {
        buf = (buf << 8) | byte as u64;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            output.push(BASE32_ALPHABET[((buf >> bits) & 0x1F) as usize] as char);
        }
    }
    if bits > 0 {
        output.push(BASE32_ALPHABET[((buf << (5 - bits)) & 0x1F) as usize] as char);
    }

    output
}

/// Decode a dcode payload embedded in certificate SAN DNS names.
///
/// Each SAN has the form `NN<base32-chunk>.<prefix>.<apex>` where `NN` is
/// a two-digit chunk index. The SAN list is filtered by `.<prefix>.`,
/// sorted by index, stripped of the index digits, concatenated, and
/// base32-decoded. SAN order in the input does not matter.
pub fn decode_san_payload(sans: &[String], prefix: &str) -> Result<Vec<u8>> {
    let needle = format!(".{prefix}.");
    let mut chunks: Vec<(u32, &str)> = Vec::new();

    for san in sans {
        let Some(pos) = san.find(&needle) else {
            continue;
        };
        let label = &san[..pos];
        if label.len() < 2 || !label[..2].bytes().all(|b| b.is_ascii_digit()) {
            return Err(TinfoilError::attestation(format!(
                "SAN chunk missing two-digit index: {san}"
            )));
        }
        let index: u32 = label[..2].parse().map_err(|_| {
            TinfoilError::attestation(format!("SAN chunk has invalid index: {san}"))
        })?;
        chunks.push((index, &label[2..]));
    }

    if chunks.is_empty() {
        return Err(TinfoilError::attestation(format!(
            "no SAN entries with prefix {prefix:?}"
        )));
    }

    chunks.sort_by_key(|(index, _)| *index);
    let joined: String = chunks.iter().map(|(_, chunk)| *chunk).collect();
    base32_decode(&joined)
}

/// Encode a payload as dcode SAN DNS names under the given prefix and apex.
pub fn encode_san_payload(payload: &[u8], prefix: &str, apex: &str) -> Vec<String> {
    let encoded = base32_encode(payload);
    let chunks: Vec<&str> = encoded
        .as_bytes()
        .chunks(DCODE_CHUNK_LEN)
        .map(|c| std::str::from_utf8(c).unwrap_or_default())
        .collect();

    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| format!("{i:02}{chunk}.{prefix}.{apex}"))
        .collect()
}
