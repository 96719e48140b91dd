//! Sealing primitives for the OAuth layer.
//!
//! One long configured secret is expanded into three independent 32-byte
//! keys via HKDF-SHA256: cookie authentication, cookie encryption, and the
//! cross-domain code relay. Session cookies are encrypt-then-MAC opaque
//! blobs; relay envelopes bind an authorization code to its audience
//! domain and a short expiry.

pub mod cookie;
pub mod error;
pub mod keys;
pub mod relay;

pub use cookie::{CookieSealer, SessionValues};
pub use error::{SealError, SealResult};
pub use keys::SealerKeys;
pub use relay::CodeRelay;

/// Generate a random 128-bit state nonce, base64url encoded.
pub fn random_state() -> String {
    use base64::Engine as _;
    use rand::RngCore as _;

    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Constant-time string equality for state nonces.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    use subtle::ConstantTimeEq as _;

    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
