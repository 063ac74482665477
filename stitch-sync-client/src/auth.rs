//! HMAC request signing, mirroring the signature scheme the teacher's
//! server-side `AuthState::create_hmac_signature`/`verify_hmac` expect on
//! the other end of the wire: `HMAC-SHA256(secret, "{ts}.{email}.{key}.{body}")`,
//! hex-encoded, compared in constant time.

use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use std::sync::atomic::{AtomicBool, Ordering};
use stitch_sync_core::{AuthClient, SyncResult};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct ApiCredentials {
    pub api_key: String,
    pub secret: String,
}

impl ApiCredentials {
    /// Mints a fresh key/secret pair for registering a new client with the
    /// remote service out of band.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let api_key_bytes: [u8; 32] = rng.gen();
        let secret_bytes: [u8; 32] = rng.gen();
        ApiCredentials {
            api_key: format!("stch_{}", hex::encode(api_key_bytes)),
            secret: format!("stcs_{}", hex::encode(secret_bytes)),
        }
    }
}

pub fn sign(secret: &str, timestamp: i64, email: &str, api_key: &str, body: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts a key of any size");
    let message = format!("{timestamp}.{email}.{api_key}.{body}");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Stateful auth session: holds the signing secret and tracks whether the
/// last handshake with the remote service succeeded. Unlike a bearer token
/// there's nothing to "refresh" about an HMAC secret, so `refresh_token`
/// just clears the logged-out flag for the next connection attempt to retry.
pub struct HmacAuthClient {
    pub email: String,
    pub api_key: String,
    secret: String,
    logged_in: AtomicBool,
}

impl HmacAuthClient {
    pub fn new(email: impl Into<String>, credentials: ApiCredentials) -> Self {
        HmacAuthClient {
            email: email.into(),
            api_key: credentials.api_key,
            secret: credentials.secret,
            logged_in: AtomicBool::new(true),
        }
    }

    pub fn sign_now(&self, timestamp: i64, body: &str) -> String {
        sign(&self.secret, timestamp, &self.email, &self.api_key, body)
    }

    pub(crate) fn mark_logged_out(&self) {
        self.logged_in.store(false, Ordering::SeqCst);
    }

    pub(crate) fn mark_logged_in(&self) {
        self.logged_in.store(true, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl AuthClient for HmacAuthClient {
    async fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    async fn refresh_token(&self) -> SyncResult<()> {
        self.mark_logged_in();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_for_same_inputs() {
        let a = sign("secret", 1000, "a@example.com", "key", "body");
        let b = sign("secret", 1000, "a@example.com", "key", "body");
        assert_eq!(a, b);
    }

    #[test]
    fn signature_changes_with_body() {
        let a = sign("secret", 1000, "a@example.com", "key", "body-one");
        let b = sign("secret", 1000, "a@example.com", "key", "body-two");
        assert_ne!(a, b);
    }
}
