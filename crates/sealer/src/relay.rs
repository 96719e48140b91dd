//! Cross-domain authorization-code relay.
//!
//! The pages domain receives the OAuth code and must hand it to the tenant
//! domain through the user's browser. The code travels as an AEAD-sealed
//! envelope binding `(code, audience, expiry)`: the tag prevents forgery,
//! the cipher keeps the code out of the URL bar, and the audience claim
//! stops one tenant from replaying another tenant's envelope.

use crate::error::{SealError, SealResult};
use crate::keys::SealerKeys;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore as _;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const NONCE_LEN: usize = 12;

#[derive(Serialize, Deserialize)]
struct RelayClaims {
    code: String,
    aud: String,
    exp: u64,
}

/// Seals authorization codes for transport between domains.
pub struct CodeRelay {
    cipher: ChaCha20Poly1305,
    expiry: Duration,
}

impl CodeRelay {
    pub fn new(keys: &SealerKeys, expiry: Duration) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&keys.relay)),
            expiry,
        }
    }

    pub fn seal(&self, code: &str, audience: &str) -> SealResult<String> {
        self.seal_at(code, audience, unix_now())
    }

    pub fn open(&self, sealed: &str, audience: &str) -> SealResult<String> {
        self.open_at(sealed, audience, unix_now())
    }

    pub fn seal_at(&self, code: &str, audience: &str, now: u64) -> SealResult<String> {
        let claims = RelayClaims {
            code: code.to_string(),
            aud: audience.to_string(),
            exp: now + self.expiry.as_secs(),
        };
        let payload = serde_json::to_vec(&claims).map_err(|e| SealError::Seal(e.to_string()))?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), payload.as_ref())
            .map_err(|_| SealError::Seal("encryption failed".into()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(blob))
    }

    pub fn open_at(&self, sealed: &str, audience: &str, now: u64) -> SealResult<String> {
        let blob = URL_SAFE_NO_PAD
            .decode(sealed)
            .map_err(|_| SealError::Rejected)?;
        if blob.len() < NONCE_LEN {
            return Err(SealError::Rejected);
        }

        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let payload = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SealError::Rejected)?;
        let claims: RelayClaims =
            serde_json::from_slice(&payload).map_err(|_| SealError::Rejected)?;

        if !crate::constant_time_eq(&claims.aud, audience) {
            return Err(SealError::AudienceMismatch);
        }
        if now >= claims.exp {
            return Err(SealError::Expired);
        }
        Ok(claims.code)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
