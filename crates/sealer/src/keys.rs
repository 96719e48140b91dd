//! Key derivation.

use hkdf::Hkdf;
use sha2::Sha256;

/// HKDF info label; fixed so every instance sharing a secret derives the
/// same keys.
const KEY_INFO: &[u8] = b"pagoda.signing-and-encryption-keys.v1";

/// The three derived 32-byte keys.
pub struct SealerKeys {
    /// HMAC key authenticating session cookies.
    pub cookie_auth: [u8; 32],
    /// AEAD key encrypting session cookies.
    pub cookie_enc: [u8; 32],
    /// AEAD key sealing relayed authorization codes.
    pub relay: [u8; 32],
}

impl SealerKeys {
    /// Derive the key set from the configured secret.
    pub fn derive(secret: &str) -> Self {
        let hkdf = Hkdf::<Sha256>::new(None, secret.as_bytes());
        let mut okm = [0u8; 96];
        hkdf.expand(KEY_INFO, &mut okm)
            .expect("96 bytes is a valid HKDF-SHA256 output length");

        let mut keys = Self {
            cookie_auth: [0u8; 32],
            cookie_enc: [0u8; 32],
            relay: [0u8; 32],
        };
        keys.cookie_auth.copy_from_slice(&okm[0..32]);
        keys.cookie_enc.copy_from_slice(&okm[32..64]);
        keys.relay.copy_from_slice(&okm[64..96]);
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let a = SealerKeys::derive("the-secret");
        let b = SealerKeys::derive("the-secret");
        assert_eq!(a.cookie_auth, b.cookie_auth);
        assert_eq!(a.cookie_enc, b.cookie_enc);
        assert_eq!(a.relay, b.relay);
    }

    #[test]
    fn keys_are_independent() {
        let keys = SealerKeys::derive("the-secret");
        assert_ne!(keys.cookie_auth, keys.cookie_enc);
        assert_ne!(keys.cookie_enc, keys.relay);

        let other = SealerKeys::derive("another-secret");
        assert_ne!(keys.cookie_auth, other.cookie_auth);
    }
}
