//! AES-256-GCM encryption boundary for stored API keys.
//!
//! Ciphertexts are self-describing byte strings carried as base64 text:
//!
//! ```text
//! version (1 byte) || nonce (12 bytes) || ciphertext + tag (16 bytes)
//! ```
//!
//! A fresh random nonce is drawn for every call, so encrypting the same key
//! twice yields different blobs.

use crate::error::{Error, Result};
use aes_gcm::{
    Aes256Gcm,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use base64::{Engine as _, engine::general_purpose};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use zeroize::Zeroizing;

const FORMAT_VERSION: u8 = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

// ---------------------------------------------------------------------------
// Key material
// ---------------------------------------------------------------------------

/// 256-bit master key. Zeroed on drop.
pub struct KeyMaterial(Zeroizing<[u8; KEY_LEN]>);

impl KeyMaterial {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let decoded = Zeroizing::new(
            hex::decode(hex_key.trim())
                .map_err(|e| Error::Crypto(format!("Master key is not valid hex: {}", e)))?,
        );
        let bytes: [u8; KEY_LEN] = decoded.as_slice().try_into().map_err(|_| {
            Error::Crypto(format!(
                "Master key must be {} bytes ({} hex characters), got {} bytes",
                KEY_LEN,
                KEY_LEN * 2,
                decoded.len()
            ))
        })?;
        Ok(Self::from_bytes(bytes))
    }

    /// Read the hex key from an environment variable.
    pub fn from_env(var: &str) -> Result<Self> {
        let value = Zeroizing::new(std::env::var(var).map_err(|_| {
            Error::Crypto(format!(
                "Master key not provisioned: environment variable {} is not set. \
                 Generate one with `lkv keygen`.",
                var
            ))
        })?);
        Self::from_hex(&value)
    }

    /// Read the hex key from a file (first line, surrounding whitespace ignored).
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = Zeroizing::new(std::fs::read_to_string(path).map_err(|e| {
            Error::Crypto(format!(
                "Master key not provisioned: cannot read {}: {}",
                path.display(),
                e
            ))
        })?);
        Self::from_hex(contents.lines().next().unwrap_or_default())
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyMaterial(<redacted>)")
    }
}

// ---------------------------------------------------------------------------
// Encrypted secret
// ---------------------------------------------------------------------------

/// Opaque ciphertext produced by [`Cipher::encrypt`]. Stores persist it
/// verbatim and never look inside.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncryptedSecret(String);

impl EncryptedSecret {
    /// Wrap a blob read back from storage.
    pub fn from_encoded(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for EncryptedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptedSecret(<{} chars>)", self.0.len())
    }
}

// ---------------------------------------------------------------------------
// Cipher
// ---------------------------------------------------------------------------

pub struct Cipher {
    aead: Aes256Gcm,
}

impl Cipher {
    pub fn new(key: &KeyMaterial) -> Self {
        let key = aes_gcm::Key::<Aes256Gcm>::from_slice(key.0.as_slice());
        Self {
            aead: Aes256Gcm::new(key),
        }
    }

    /// Generate a new random master key, hex encoded.
    pub fn generate_key() -> Zeroizing<String> {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        Zeroizing::new(hex::encode(key))
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedSecret> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .aead
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| Error::Crypto(format!("AES-GCM encryption failed: {}", e)))?;

        let mut blob = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        blob.push(FORMAT_VERSION);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);

        Ok(EncryptedSecret(general_purpose::STANDARD.encode(blob)))
    }

    /// Decrypt and verify. Any blob not produced under this key, or altered
    /// after the fact, fails with [`Error::Crypto`].
    pub fn decrypt(&self, secret: &EncryptedSecret) -> Result<Zeroizing<String>> {
        let blob = general_purpose::STANDARD
            .decode(secret.as_str())
            .map_err(|e| Error::Crypto(format!("Ciphertext is not valid base64: {}", e)))?;

        if blob.len() < 1 + NONCE_LEN + TAG_LEN {
            return Err(Error::Crypto("Ciphertext is truncated".to_string()));
        }
        if blob[0] != FORMAT_VERSION {
            return Err(Error::Crypto(format!(
                "Unsupported ciphertext version {}",
                blob[0]
            )));
        }

        let nonce = aes_gcm::Nonce::from_slice(&blob[1..1 + NONCE_LEN]);

        let plaintext = Zeroizing::new(
            self.aead
                .decrypt(nonce, &blob[1 + NONCE_LEN..])
                .map_err(|_| {
                    Error::Crypto(
                        "Integrity check failed: ciphertext was tampered with or encrypted under a different key"
                            .to_string(),
                    )
                })?,
        );

        let text = std::str::from_utf8(&plaintext).map_err(Error::crypto)?;
        Ok(Zeroizing::new(text.to_string()))
    }
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Cipher(AES-256-GCM)")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> Cipher {
        Cipher::new(&KeyMaterial::from_bytes([7u8; 32]))
    }

    fn flip_bit(secret: &EncryptedSecret, bit: usize) -> EncryptedSecret {
        let mut blob = general_purpose::STANDARD.decode(secret.as_str()).unwrap();
        blob[bit / 8] ^= 1 << (bit % 8);
        EncryptedSecret::from_encoded(general_purpose::STANDARD.encode(blob))
    }

    #[test]
    fn test_round_trip() {
        let c = cipher();
        for s in ["sk-proj-abcdefghijklmnop", "", "キー🔑", "a"] {
            let enc = c.encrypt(s).unwrap();
            assert_eq!(&*c.decrypt(&enc).unwrap(), s);
        }
    }

    #[test]
    fn test_ciphertext_differs_from_plaintext_and_is_randomized() {
        let c = cipher();
        let a = c.encrypt("sk-abc123").unwrap();
        let b = c.encrypt("sk-abc123").unwrap();
        assert_ne!(a, b);
        assert!(!a.as_str().contains("sk-abc123"));
    }

    #[test]
    fn test_every_bit_flip_is_detected() {
        let c = cipher();
        let enc = c.encrypt("sk-ant-secret").unwrap();
        let bits = general_purpose::STANDARD.decode(enc.as_str()).unwrap().len() * 8;
        for bit in 0..bits {
            let err = c.decrypt(&flip_bit(&enc, bit)).unwrap_err();
            assert!(matches!(err, Error::Crypto(_)), "bit {} not detected", bit);
        }
    }

    #[test]
    fn test_wrong_key_rejected() {
        let enc = cipher().encrypt("sk-abc").unwrap();
        let other = Cipher::new(&KeyMaterial::from_bytes([8u8; 32]));
        assert!(matches!(other.decrypt(&enc), Err(Error::Crypto(_))));
    }

    #[test]
    fn test_garbage_and_truncated_rejected() {
        let c = cipher();
        assert!(matches!(
            c.decrypt(&EncryptedSecret::from_encoded("not base64!!")),
            Err(Error::Crypto(_))
        ));
        assert!(matches!(
            c.decrypt(&EncryptedSecret::from_encoded("AQID")),
            Err(Error::Crypto(_))
        ));
    }

    #[test]
    fn test_key_from_hex() {
        let hex_key = Cipher::generate_key();
        assert_eq!(hex_key.len(), 64);
        assert!(KeyMaterial::from_hex(&hex_key).is_ok());
        assert_ne!(*Cipher::generate_key(), *hex_key);
    }

    #[test]
    fn test_key_from_hex_wrong_length() {
        assert!(matches!(KeyMaterial::from_hex("abcd"), Err(Error::Crypto(_))));
        assert!(matches!(KeyMaterial::from_hex("zz"), Err(Error::Crypto(_))));
    }

    #[test]
    fn test_key_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.key");
        std::fs::write(&path, format!("{}\n", &*Cipher::generate_key())).unwrap();
        assert!(KeyMaterial::from_file(&path).is_ok());
        assert!(KeyMaterial::from_file(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_debug_redacts() {
        let key = KeyMaterial::from_bytes([1u8; 32]);
        assert_eq!(format!("{:?}", key), "KeyMaterial(<redacted>)");
        let enc = cipher().encrypt("sk-abc").unwrap();
        assert!(!format!("{:?}", enc).contains(enc.as_str()));
    }
}
