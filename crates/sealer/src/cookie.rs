//! AEAD-sealed session cookies.
//!
//! The cookie value is `base64url(nonce ‖ ciphertext ‖ mac)`: ChaCha20-
//! Poly1305 under the encryption key, then HMAC-SHA256 under the
//! independent authentication key over `nonce ‖ ciphertext`. Any bit flip
//! fails the MAC and the session is discarded. An `iat` claim inside the
//! payload bounds the session age server-side regardless of the cookie
//! attributes the client presents.

use crate::error::{SealError, SealResult};
use crate::keys::SealerKeys;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hmac::{Hmac, Mac};
use rand::RngCore as _;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 12;
const MAC_LEN: usize = 32;

/// Values carried by a session.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionValues {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_auth_domain: Option<String>,
    /// Issue time, unix seconds. Set on seal.
    #[serde(default)]
    pub iat: u64,
}

/// Seals and unseals session cookies.
pub struct CookieSealer {
    cipher: ChaCha20Poly1305,
    auth_key: [u8; 32],
    max_age: Duration,
}

impl CookieSealer {
    pub fn new(keys: &SealerKeys, max_age: Duration) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&keys.cookie_enc)),
            auth_key: keys.cookie_auth,
            max_age,
        }
    }

    pub fn seal(&self, values: &SessionValues) -> SealResult<String> {
        self.seal_at(values, unix_now())
    }

    pub fn unseal(&self, sealed: &str) -> SealResult<SessionValues> {
        self.unseal_at(sealed, unix_now())
    }

    pub fn seal_at(&self, values: &SessionValues, now: u64) -> SealResult<String> {
        let mut stamped = values.clone();
        stamped.iat = now;
        let payload =
            serde_json::to_vec(&stamped).map_err(|e| SealError::Seal(e.to_string()))?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), payload.as_ref())
            .map_err(|_| SealError::Seal("encryption failed".into()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len() + MAC_LEN);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);

        let mut mac = <HmacSha256 as KeyInit>::new_from_slice(&self.auth_key)
            .map_err(|_| SealError::Seal("bad mac key".into()))?;
        mac.update(&blob);
        blob.extend_from_slice(&mac.finalize().into_bytes());

        Ok(URL_SAFE_NO_PAD.encode(blob))
    }

    pub fn unseal_at(&self, sealed: &str, now: u64) -> SealResult<SessionValues> {
        let blob = URL_SAFE_NO_PAD
            .decode(sealed)
            .map_err(|_| SealError::Rejected)?;
        if blob.len() < NONCE_LEN + MAC_LEN {
            return Err(SealError::Rejected);
        }

        let (body, tag) = blob.split_at(blob.len() - MAC_LEN);
        let mut mac = <HmacSha256 as KeyInit>::new_from_slice(&self.auth_key)
            .map_err(|_| SealError::Rejected)?;
        mac.update(body);
        mac.verify_slice(tag).map_err(|_| SealError::Rejected)?;

        let (nonce, ciphertext) = body.split_at(NONCE_LEN);
        let payload = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SealError::Rejected)?;

        let values: SessionValues =
            serde_json::from_slice(&payload).map_err(|_| SealError::Rejected)?;

        if values.iat > now || now - values.iat > self.max_age.as_secs() {
            return Err(SealError::Expired);
        }
        Ok(values)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealer() -> CookieSealer {
        CookieSealer::new(&SealerKeys::derive("test-secret"), Duration::from_secs(600))
    }

    fn values() -> SessionValues {
        SessionValues {
            access_token: Some("tok".into()),
            state: Some("st".into()),
            uri: Some("https://a.test/secret/".into()),
            proxy_auth_domain: None,
            iat: 0,
        }
    }

    #[test]
    fn roundtrip() {
        let sealer = sealer();
        let sealed = sealer.seal_at(&values(), 1000).unwrap();
        let opened = sealer.unseal_at(&sealed, 1001).unwrap();
        assert_eq!(opened.access_token.as_deref(), Some("tok"));
        assert_eq!(opened.uri.as_deref(), Some("https://a.test/secret/"));
    }

    #[test]
    fn every_bit_flip_is_rejected() {
        let sealer = sealer();
        let sealed = sealer.seal_at(&values(), 1000).unwrap();
        let raw = URL_SAFE_NO_PAD.decode(&sealed).unwrap();

        for byte in 0..raw.len() {
            let mut flipped = raw.clone();
            flipped[byte] ^= 0x01;
            let cookie = URL_SAFE_NO_PAD.encode(&flipped);
            assert!(
                sealer.unseal_at(&cookie, 1001).is_err(),
                "bit flip in byte {byte} was accepted"
            );
        }
    }

    #[test]
    fn garbage_is_rejected() {
        let sealer = sealer();
        assert!(sealer.unseal_at("", 0).is_err());
        assert!(sealer.unseal_at("not base64 !!", 0).is_err());
        assert!(sealer.unseal_at("AAAA", 0).is_err());
    }

    #[test]
    fn sessions_expire() {
        let sealer = sealer();
        let sealed = sealer.seal_at(&values(), 1000).unwrap();

        assert!(sealer.unseal_at(&sealed, 1599).is_ok());
        assert!(matches!(
            sealer.unseal_at(&sealed, 1601),
            Err(SealError::Expired)
        ));
        // A cookie from the future is as bad as an expired one.
        assert!(sealer.unseal_at(&sealed, 999).is_err());
    }

    #[test]
    fn different_secrets_do_not_interoperate() {
        let a = sealer();
        let b = CookieSealer::new(&SealerKeys::derive("other"), Duration::from_secs(600));
        let sealed = a.seal_at(&values(), 1000).unwrap();
        assert!(b.unseal_at(&sealed, 1001).is_err());
    }
}
