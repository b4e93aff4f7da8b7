//! Content encryption at rest
//!
//! AES-256-GCM with a versioned text envelope `enc:<iv_b64>:<ct_b64>` where
//! the ciphertext carries the 16-byte GCM tag. Keys are derived with
//! PBKDF2-HMAC-SHA256 (fixed salt, 100k iterations). A primary key encrypts;
//! decryption tries the primary then each configured secondary, which is what
//! makes key rotation a plain re-encrypt pass.

use aes_gcm::aead::{Aead, AeadCore, OsRng};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use sha2::Sha256;

/// Key-derivation salt. Fixed so existing envelopes survive restarts; bump
/// the suffix only together with an envelope version change.
const KDF_SALT: &[u8] = b"openmemory-salt-v1";
const KDF_ITERATIONS: u32 = 100_000;
const ENVELOPE_PREFIX: &str = "enc:";
const MIN_KEY_LEN: usize = 16;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Encryption error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Envelope present but structurally invalid
    #[error("Malformed encryption envelope")]
    Malformed,
    /// Envelope decodes but no configured key authenticates it
    #[error("No configured key decrypts this envelope")]
    NoKeyMatches,
    /// AEAD encryption failed
    #[error("Encryption failed")]
    EncryptFailed,
    /// Decrypted bytes are not valid UTF-8
    #[error("Decrypted content is not valid UTF-8")]
    InvalidUtf8,
}

pub type Result<T> = std::result::Result<T, CryptoError>;

// ============================================================================
// ENCRYPTION PROVIDER
// ============================================================================

/// Envelope encryption for memory content. When disabled (or the key is
/// missing/too short) it degrades to an explicit identity pass-through;
/// it never half-encrypts.
pub struct Encryption {
    primary: Option<Aes256Gcm>,
    secondaries: Vec<Aes256Gcm>,
}

impl Encryption {
    /// Build from configuration. A missing or short (<16 chars) key refuses
    /// to enable encryption rather than encrypting weakly.
    pub fn from_config(enabled: bool, key: Option<&str>, secondary_keys: &[String]) -> Self {
        if !enabled {
            return Self::disabled();
        }
        let Some(secret) = key else {
            tracing::warn!("[crypto] encryption enabled but no key configured, disabling");
            return Self::disabled();
        };
        if secret.len() < MIN_KEY_LEN {
            tracing::warn!("[crypto] encryption key shorter than {MIN_KEY_LEN} chars, disabling");
            return Self::disabled();
        }

        let secondaries = secondary_keys
            .iter()
            .filter(|k| k.len() >= MIN_KEY_LEN)
            .map(|k| Self::derive_cipher(k))
            .collect();

        tracing::info!("[crypto] encryption-at-rest enabled (AES-256-GCM / PBKDF2)");
        Self {
            primary: Some(Self::derive_cipher(secret)),
            secondaries,
        }
    }

    /// Identity pass-through provider
    pub fn disabled() -> Self {
        Self {
            primary: None,
            secondaries: vec![],
        }
    }

    pub fn enabled(&self) -> bool {
        self.primary.is_some()
    }

    fn derive_cipher(secret: &str) -> Aes256Gcm {
        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(secret.as_bytes(), KDF_SALT, KDF_ITERATIONS, &mut key);
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key))
    }

    /// Encrypt text into the envelope form. Identity when disabled.
    pub fn encrypt(&self, text: &str) -> Result<String> {
        let Some(cipher) = &self.primary else {
            return Ok(text.to_string());
        };

        let iv = Aes256Gcm::generate_nonce(&mut OsRng);
        let ct = cipher
            .encrypt(&iv, text.as_bytes())
            .map_err(|_| CryptoError::EncryptFailed)?;

        Ok(format!(
            "{ENVELOPE_PREFIX}{}:{}",
            B64.encode(iv),
            B64.encode(ct)
        ))
    }

    /// Decrypt an envelope, trying the primary key then each secondary.
    /// Legacy rows without the `enc:` prefix pass through as plaintext.
    pub fn decrypt(&self, text: &str) -> Result<String> {
        let Some(rest) = text.strip_prefix(ENVELOPE_PREFIX) else {
            return Ok(text.to_string());
        };
        if self.primary.is_none() {
            // No key configured at all; surface the envelope untouched so the
            // operator can see the row is encrypted rather than corrupted.
            return Ok(text.to_string());
        }

        let mut parts = rest.splitn(2, ':');
        let (iv_b64, ct_b64) = match (parts.next(), parts.next()) {
            (Some(a), Some(b)) => (a, b),
            _ => return Err(CryptoError::Malformed),
        };
        let iv = B64.decode(iv_b64).map_err(|_| CryptoError::Malformed)?;
        let ct = B64.decode(ct_b64).map_err(|_| CryptoError::Malformed)?;
        if iv.len() != 12 {
            return Err(CryptoError::Malformed);
        }

        let nonce = Nonce::from_slice(&iv);
        for cipher in self.primary.iter().chain(self.secondaries.iter()) {
            if let Ok(pt) = cipher.decrypt(nonce, ct.as_slice()) {
                return String::from_utf8(pt).map_err(|_| CryptoError::InvalidUtf8);
            }
        }
        Err(CryptoError::NoKeyMatches)
    }

    /// Re-wrap an envelope (or plaintext) under the current primary key.
    /// Used by `rotate_key` after the primary has been swapped.
    pub fn re_encrypt(&self, stored: &str) -> Result<String> {
        let plain = self.decrypt(stored)?;
        self.encrypt(&plain)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(key: &str) -> Encryption {
        Encryption::from_config(true, Some(key), &[])
    }

    #[test]
    fn test_roundtrip_identity() {
        let e = enc("a-sufficiently-long-key");
        for text in ["hello", "", "unicode: héllo wörld 🦀", "enc-like but not: x"] {
            let ct = e.encrypt(text).unwrap();
            assert!(ct.starts_with("enc:"));
            assert_eq!(e.decrypt(&ct).unwrap(), text);
        }
    }

    #[test]
    fn test_disabled_is_identity() {
        let e = Encryption::disabled();
        assert!(!e.enabled());
        assert_eq!(e.encrypt("plain").unwrap(), "plain");
        assert_eq!(e.decrypt("plain").unwrap(), "plain");
    }

    #[test]
    fn test_short_key_refused() {
        let e = Encryption::from_config(true, Some("short"), &[]);
        assert!(!e.enabled());
        let e = Encryption::from_config(true, None, &[]);
        assert!(!e.enabled());
    }

    #[test]
    fn test_legacy_plaintext_passthrough() {
        let e = enc("a-sufficiently-long-key");
        assert_eq!(e.decrypt("never encrypted").unwrap(), "never encrypted");
    }

    #[test]
    fn test_secondary_key_decrypts_after_rotation() {
        let old = enc("old-key-old-key-old-key");
        let ct = old.encrypt("secret memo").unwrap();

        // New provider: fresh primary, old key demoted to secondary
        let rotated = Encryption::from_config(
            true,
            Some("new-key-new-key-new-key"),
            &["old-key-old-key-old-key".to_string()],
        );
        assert_eq!(rotated.decrypt(&ct).unwrap(), "secret memo");

        // Re-encrypt pins it to the new primary alone
        let fresh = rotated.re_encrypt(&ct).unwrap();
        let primary_only = enc("new-key-new-key-new-key");
        assert_eq!(primary_only.decrypt(&fresh).unwrap(), "secret memo");
    }

    #[test]
    fn test_wrong_key_is_error_not_garbage() {
        let a = enc("first-key-first-key-1");
        let b = enc("other-key-other-key-2");
        let ct = a.encrypt("payload").unwrap();
        assert!(matches!(b.decrypt(&ct), Err(CryptoError::NoKeyMatches)));
    }

    #[test]
    fn test_corrupted_envelope_errors() {
        let e = enc("a-sufficiently-long-key");
        assert!(matches!(e.decrypt("enc:only-one-part"), Err(_)));
        assert!(matches!(e.decrypt("enc:!!!:???"), Err(CryptoError::Malformed)));
    }
}
