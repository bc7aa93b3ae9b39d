//! Shared access signature token generation
//!
//! Produces the `SharedAccessSignature sr=...&sig=...&se=...` tokens the hub
//! accepts as an MQTT password on the symmetric-key path. The exact byte
//! layout matters: the resource URI uses the lowercased hostname, the
//! string-to-sign is the URL-encoded URI plus the decimal expiry, and the
//! URL encoding must preserve the RFC 3986 unreserved set with uppercase
//! hex for everything else.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Token generation errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("shared secret is not valid base64 or decodes to empty bytes")]
    InvalidSecret,
}

/// Parameters for token generation with a relative validity period
#[derive(Debug, Clone)]
pub struct SasTokenConfig {
    /// Hub hostname, e.g. `my-hub.azure-devices.net`
    pub host: String,
    /// Device identifier (case-sensitive)
    pub device_id: String,
    /// Base64-encoded device shared access key
    pub device_key_base64: String,
    /// Token validity in seconds from now
    pub validity_seconds: u64,
}

impl SasTokenConfig {
    /// Generate a token expiring `validity_seconds` from the current time
    pub fn generate(&self) -> Result<String, TokenError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        generate(
            &self.host,
            &self.device_id,
            &self.device_key_base64,
            now + self.validity_seconds,
        )
    }
}

/// Generate a shared access signature token with an explicit expiry.
///
/// Deterministic for identical inputs.
pub fn generate(
    host: &str,
    device_id: &str,
    device_key_base64: &str,
    expiry_epoch_seconds: u64,
) -> Result<String, TokenError> {
    // The hub compares the resource URI case-sensitively against the
    // lowercased hostname it knows itself by.
    let resource_uri = format!("{}/devices/{}", host.to_lowercase(), device_id);

    let string_to_sign = format!("{}\n{}", url_encode(&resource_uri), expiry_epoch_seconds);

    let key = BASE64
        .decode(device_key_base64)
        .map_err(|_| TokenError::InvalidSecret)?;
    if key.is_empty() {
        return Err(TokenError::InvalidSecret);
    }

    let mut mac = HmacSha256::new_from_slice(&key).map_err(|_| TokenError::InvalidSecret)?;
    mac.update(string_to_sign.as_bytes());
    let signature_b64 = BASE64.encode(mac.finalize().into_bytes());

    Ok(format!(
        "SharedAccessSignature sr={}&sig={}&se={}",
        url_encode(&resource_uri),
        url_encode(&signature_b64),
        expiry_epoch_seconds
    ))
}

/// Percent-encode a string per RFC 3986.
///
/// Preserves `A-Z a-z 0-9 - _ . ~`; everything else becomes `%XX` with
/// uppercase hex digits.
pub fn url_encode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push_str(&format!("%{byte:02X}"));
            }
        }
    }
    encoded
}
