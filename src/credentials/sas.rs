//! Shared access signature minting
//!
//! Token format:
//! `SharedAccessSignature sr={uri}&sig={signature}&se={expiry}` where `uri`
//! is the URL-encoded `{host}/devices/{device_id}` and `signature` is the
//! URL-encoded base64 HMAC-SHA256 of `"{uri}\n{expiry}"` under the decoded
//! device key.

use crate::protocol::device_resource_uri;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum SasError {
    #[error("Device key is not valid base64: {0}")]
    InvalidKey(#[from] base64::DecodeError),
    #[error("Device key cannot be used for HMAC")]
    KeyLength,
}

fn url_encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Generate a token valid until `expires_at` (seconds since the Unix epoch)
pub fn generate_sas_token(
    host: &str,
    device_id: &str,
    base64_key: &str,
    expires_at: i64,
) -> Result<String, SasError> {
    let encoded_uri = url_encode(&device_resource_uri(host, device_id));
    let to_sign = format!("{encoded_uri}\n{expires_at}");

    let key = STANDARD.decode(base64_key)?;
    let mut mac = HmacSha256::new_from_slice(&key).map_err(|_| SasError::KeyLength)?;
    mac.update(to_sign.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    Ok(format!(
        "SharedAccessSignature sr={encoded_uri}&sig={}&se={expires_at}",
        url_encode(&signature)
    ))
}
