pub mod rest;
pub mod stream;

pub use rest::BitmexClient;
pub use stream::PositionStream;

use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Seconds a signed request stays valid for.
const SIGNATURE_TTL_SECS: i64 = 60;

/// API key pair. Public endpoints work without one.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub api_key: String,
    pub secret: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            secret: secret.into(),
        }
    }

    /// hex(HMAC-SHA256(secret, verb + path + expires + body))
    pub fn sign(&self, verb: &str, path: &str, expires: i64, body: &str) -> String {
        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(verb.as_bytes());
        mac.update(path.as_bytes());
        mac.update(expires.to_string().as_bytes());
        mac.update(body.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

pub(crate) fn expires_at() -> i64 {
    chrono::Utc::now().timestamp() + SIGNATURE_TTL_SECS
}
