//! HMAC-SHA1 webhook verification and Kommo Chats API request signing.

use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Hex-encoded HMAC-SHA1 of `payload` keyed by `secret`.
pub fn sign_payload(secret: &str, payload: &[u8]) -> String {
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a hex signature (any case, surrounding whitespace ignored) against `payload`.
pub fn verify_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let Ok(provided) = hex::decode(signature.trim()) else {
        return false;
    };
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(payload);
    mac.verify_slice(&provided).is_ok()
}

/// Hex MD5 of the request body (Content-MD5 header).
pub fn content_md5(body: &[u8]) -> String {
    hex::encode(Md5::digest(body))
}

/// Headers for a signed Chats API request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub date: String,
    pub content_type: &'static str,
    pub content_md5: String,
    pub signature: String,
}

pub const SIGNED_CONTENT_TYPE: &str = "application/json";

/// Sign `METHOD\nContent-MD5\nContent-Type\nDate\npath` with the channel secret.
/// `path` is the request path without scheme and host (e.g. `/v2/origin/custom/<scope>`).
pub fn sign_request(secret: &str, method: &str, path: &str, body: &[u8], date: &str) -> SignedHeaders {
    let content_md5 = content_md5(body);
    let canonical = [
        method.to_uppercase().as_str(),
        content_md5.as_str(),
        SIGNED_CONTENT_TYPE,
        date,
        path,
    ]
    .join("\n");
    SignedHeaders {
        date: date.to_string(),
        content_type: SIGNED_CONTENT_TYPE,
        content_md5,
        signature: sign_payload(secret, canonical.as_bytes()),
    }
}

/// Current time formatted for the `Date` header.
pub fn http_date_now() -> String {
    chrono::Utc::now().to_rfc2822()
}
