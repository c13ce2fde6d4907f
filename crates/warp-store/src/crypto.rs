//! AEAD box for refresh tokens at rest
//!
//! AES-256-GCM with a fresh 96-bit nonce per encryption. The stored layout
//! is `nonce ‖ ciphertext ‖ tag` in a single blob, so a record carries
//! everything needed to open it except the key.
//!
//! The key comes from explicit configuration (`TOKEN_ENCRYPTION_KEY`,
//! base64url, 32 bytes). Without one the process derives a stable key from
//! a static salt and a machine-bound seed, logged loudly so a dev setup
//! never passes for production hardening.

use aes_gcm::aead::{Aead, AeadCore, OsRng};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};
use tracing::warn;

use common::Secret;

use crate::error::{Error, Result};

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

/// Domain separation for refresh-token fingerprints. Versioned so a future
/// scheme change cannot collide with existing rows.
const FINGERPRINT_PREFIX: &[u8] = b"warp-gateway/fingerprint/v1:";

/// Salt mixed into the development key derivation.
const DEV_KEY_SALT: &[u8] = b"warp-gateway/dev-key/v1:";

/// Authenticated symmetric encryption for token ciphertext.
pub struct CryptoBox {
    cipher: Aes256Gcm,
}

impl CryptoBox {
    /// Build a box from an explicit 256-bit key.
    pub fn from_key(key: [u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
        }
    }

    /// Build a box from the base64url (unpadded) key encoding used by
    /// `TOKEN_ENCRYPTION_KEY`.
    pub fn from_base64url(encoded: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|e| Error::Key(format!("key is not valid base64url: {e}")))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Key("key must decode to exactly 32 bytes".into()))?;
        Ok(Self::from_key(key))
    }

    /// Derive a development key from the machine seed.
    ///
    /// Stable across restarts on the same machine, so a dev database stays
    /// readable. Not suitable for production.
    pub fn derive_dev() -> Self {
        warn!(
            "TOKEN_ENCRYPTION_KEY not set, deriving a machine-bound development key; \
             configure an explicit key for production"
        );
        let mut hasher = Sha256::new();
        hasher.update(DEV_KEY_SALT);
        hasher.update(machine_seed().as_bytes());
        let key: [u8; 32] = hasher.finalize().into();
        Self::from_key(key)
    }

    /// Seal a plaintext. Output layout: `nonce ‖ ciphertext ‖ tag`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| Error::Key("encryption failed".into()))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Open a sealed blob produced by [`CryptoBox::encrypt`].
    ///
    /// Any tamper, truncation, or wrong-key condition surfaces as
    /// [`Error::Decrypt`]; the caller decides the account's fate.
    pub fn decrypt(&self, sealed: &[u8]) -> Result<Secret<String>> {
        if sealed.len() <= NONCE_LEN {
            return Err(Error::Decrypt);
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| Error::Decrypt)?;
        let text = String::from_utf8(plaintext).map_err(|_| Error::Decrypt)?;
        Ok(Secret::new(text))
    }
}

/// One-way fingerprint of a refresh token, for uniqueness and import
/// deduplication. Independent of the encryption key, so rotating the key
/// never duplicates accounts.
pub fn fingerprint(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(FINGERPRINT_PREFIX);
    hasher.update(token.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Machine-bound seed for the development key: machine-id where available,
/// hostname otherwise.
fn machine_seed() -> String {
    if let Ok(id) = std::fs::read_to_string("/etc/machine-id") {
        let id = id.trim();
        if !id.is_empty() {
            return id.to_string();
        }
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_box() -> CryptoBox {
        CryptoBox::from_key([7u8; 32])
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let crypto = test_box();
        let sealed = crypto.encrypt(b"rt_roundtrip_token").unwrap();
        let opened = crypto.decrypt(&sealed).unwrap();
        assert_eq!(opened.expose_str(), "rt_roundtrip_token");
    }

    #[test]
    fn nonce_embedded_per_ciphertext() {
        let crypto = test_box();
        let a = crypto.encrypt(b"same plaintext").unwrap();
        let b = crypto.encrypt(b"same plaintext").unwrap();
        // Fresh nonce every call: identical plaintext, distinct blobs.
        assert_ne!(a, b);
        assert_eq!(crypto.decrypt(&a).unwrap().expose_str(), "same plaintext");
        assert_eq!(crypto.decrypt(&b).unwrap().expose_str(), "same plaintext");
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let crypto = test_box();
        let mut sealed = crypto.encrypt(b"rt_x").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(crypto.decrypt(&sealed), Err(Error::Decrypt)));
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = test_box().encrypt(b"rt_x").unwrap();
        let other = CryptoBox::from_key([8u8; 32]);
        assert!(matches!(other.decrypt(&sealed), Err(Error::Decrypt)));
    }

    #[test]
    fn truncated_blob_fails() {
        let crypto = test_box();
        assert!(matches!(crypto.decrypt(&[0u8; 4]), Err(Error::Decrypt)));
        assert!(matches!(crypto.decrypt(&[]), Err(Error::Decrypt)));
    }

    #[test]
    fn base64url_key_accepted() {
        let key = [42u8; 32];
        let encoded = URL_SAFE_NO_PAD.encode(key);
        let crypto = CryptoBox::from_base64url(&encoded).unwrap();
        let sealed = crypto.encrypt(b"rt_key").unwrap();
        assert_eq!(
            CryptoBox::from_key(key)
                .decrypt(&sealed)
                .unwrap()
                .expose_str(),
            "rt_key"
        );
    }

    #[test]
    fn short_base64url_key_rejected() {
        let encoded = URL_SAFE_NO_PAD.encode([1u8; 16]);
        assert!(matches!(
            CryptoBox::from_base64url(&encoded),
            Err(Error::Key(_))
        ));
    }

    #[test]
    fn garbage_key_encoding_rejected() {
        assert!(matches!(
            CryptoBox::from_base64url("!!not-base64!!"),
            Err(Error::Key(_))
        ));
    }

    #[test]
    fn fingerprint_is_stable_and_distinct() {
        let a1 = fingerprint("rt_account_a");
        let a2 = fingerprint("rt_account_a");
        let b = fingerprint("rt_account_b");
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
        assert_eq!(a1.len(), 64);
        assert!(a1.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
