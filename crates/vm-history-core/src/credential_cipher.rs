//! # Credential Cipher
//!
//! Symmetric encryption of cloud credential payloads before they are persisted.
//!
//! Payloads are serialized to JSON, padded (PKCS#7) and encrypted with
//! AES-256 in CBC mode under a fresh random 128-bit IV per call. The IV is
//! prepended to the ciphertext and the pair is authenticated with
//! HMAC-SHA256, so any modification of a stored blob is rejected before
//! decryption is attempted.
//!
//! Blob layout (base64 encoded as a whole):
//!
//! ```text
//! +--------+---------------------------+-------------------+
//! | IV(16) | AES-256-CBC ciphertext    | HMAC-SHA256 (32)  |
//! +--------+---------------------------+-------------------+
//! ```
//!
//! Both keys are derived from one configured secret string with SHA-256;
//! the MAC key is domain separated from the encryption key.
//!
//! See [`crate::masking`] for display-side redaction of decrypted payloads.

use crate::masking::SensitiveDataMasker;
use crate::CredentialId;
use aes::Aes256;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// AES block size, also the IV length
pub const BLOCK_LEN: usize = 16;

/// Length of the authentication tag appended to every blob
pub const TAG_LEN: usize = 32;

/// Environment variable consulted when no secret is configured explicitly
pub const ENCRYPTION_KEY_ENV: &str = "CREDENTIALS_ENCRYPTION_KEY";

const MAC_KEY_LABEL: &[u8] = b"vm-history/credential-mac/v1";

// ============================================================================
// Errors
// ============================================================================

/// Errors raised by the credential cipher
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CipherError {
    /// Encryption secret missing or unusable; fatal at startup
    #[error("Encryption configuration error: {message}")]
    Configuration { message: String },

    /// Blob is malformed, tampered with, or was sealed under another key
    #[error("Credential decryption failed: {reason}")]
    Decryption { reason: String },

    /// Payload could not be serialized before encryption
    #[error("Credential serialization failed: {message}")]
    Serialization { message: String },
}

impl CipherError {
    fn decryption(reason: &str) -> Self {
        Self::Decryption {
            reason: reason.to_string(),
        }
    }
}

// ============================================================================
// Secret and configuration
// ============================================================================

/// Configured secret the cipher keys are derived from
///
/// The value is wiped from memory on drop and never printed: both `Debug`
/// and `Serialize` emit a redaction marker.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionSecret(String);

impl EncryptionSecret {
    /// Wrap a secret string
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the secret (only for immediate use)
    pub fn expose_secret(&self) -> &str {
        &self.0
    }

    /// Check whether the secret is empty or whitespace only
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for EncryptionSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionSecret")
            .field("length", &self.0.len())
            .field("value", &"[REDACTED]")
            .finish()
    }
}

impl Serialize for EncryptionSecret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> Deserialize<'de> for EncryptionSecret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self)
    }
}

/// Encryption settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Secret used to derive the credential keys
    ///
    /// Falls back to the `CREDENTIALS_ENCRYPTION_KEY` environment variable.
    pub secret: Option<EncryptionSecret>,
}

impl EncryptionConfig {
    /// Resolve the effective secret from configuration or environment
    pub fn resolve_secret(&self) -> Result<EncryptionSecret, CipherError> {
        let secret = match &self.secret {
            Some(secret) if !secret.is_blank() => secret.clone(),
            _ => std::env::var(ENCRYPTION_KEY_ENV)
                .map(EncryptionSecret::new)
                .map_err(|_| CipherError::Configuration {
                    message: format!(
                        "no encryption secret configured and {} is not set",
                        ENCRYPTION_KEY_ENV
                    ),
                })?,
        };

        if secret.is_blank() {
            return Err(CipherError::Configuration {
                message: "encryption secret must not be empty".to_string(),
            });
        }

        Ok(secret)
    }
}

// ============================================================================
// Cipher
// ============================================================================

/// Encrypts and decrypts credential payloads
///
/// Holds only the derived keys, which are read-only after construction, so
/// a single instance can be shared across threads behind an `Arc`.
///
/// # Examples
///
/// ```rust
/// use serde_json::{json, Value};
/// use vm_history_core::{CredentialCipher, EncryptionSecret};
///
/// let cipher = CredentialCipher::from_secret(&EncryptionSecret::new("s3cret")).unwrap();
/// let blob = cipher.encrypt(&json!({"access_key": "AKIA"})).unwrap();
/// let payload: Value = cipher.decrypt(&blob).unwrap();
/// assert_eq!(payload["access_key"], "AKIA");
/// ```
#[derive(Clone)]
pub struct CredentialCipher {
    encryption_key: Zeroizing<[u8; 32]>,
    mac_key: Zeroizing<[u8; 32]>,
}

impl CredentialCipher {
    /// Derive the cipher keys from a secret
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::Configuration`] if the secret is empty.
    pub fn from_secret(secret: &EncryptionSecret) -> Result<Self, CipherError> {
        if secret.is_blank() {
            return Err(CipherError::Configuration {
                message: "encryption secret must not be empty".to_string(),
            });
        }

        let encryption_key: [u8; 32] = Sha256::digest(secret.expose_secret().as_bytes()).into();
        let mac_key: [u8; 32] = Sha256::new()
            .chain_update(MAC_KEY_LABEL)
            .chain_update(secret.expose_secret().as_bytes())
            .finalize()
            .into();

        Ok(Self {
            encryption_key: Zeroizing::new(encryption_key),
            mac_key: Zeroizing::new(mac_key),
        })
    }

    /// Build the cipher from configuration (or the environment fallback)
    pub fn from_config(config: &EncryptionConfig) -> Result<Self, CipherError> {
        Self::from_secret(&config.resolve_secret()?)
    }

    /// Short, non-reversible identifier of the active key for logs
    pub fn key_fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.encryption_key[..]);
        hex::encode(&digest[..6])
    }

    /// Encrypt a payload into a printable blob
    ///
    /// Every call draws a fresh IV, so equal payloads produce different blobs.
    pub fn encrypt<T: Serialize + ?Sized>(&self, payload: &T) -> Result<String, CipherError> {
        let plaintext = Zeroizing::new(serde_json::to_vec(payload).map_err(|e| {
            CipherError::Serialization {
                message: e.to_string(),
            }
        })?);

        let mut iv = [0u8; BLOCK_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let encryptor = Aes256CbcEnc::new_from_slices(&self.encryption_key[..], &iv).map_err(
            |_| CipherError::Configuration {
                message: "derived key has an invalid length".to_string(),
            },
        )?;
        let ciphertext = encryptor.encrypt_padded_vec_mut::<Pkcs7>(&plaintext);

        let mut blob = Vec::with_capacity(BLOCK_LEN + ciphertext.len() + TAG_LEN);
        blob.extend_from_slice(&iv);
        blob.extend_from_slice(&ciphertext);
        let tag = self.tag(&blob)?;
        blob.extend_from_slice(&tag);

        Ok(STANDARD.encode(blob))
    }

    /// Decrypt a blob produced by [`CredentialCipher::encrypt`]
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::Decryption`] if the blob is not valid base64,
    /// has an impossible length, fails the integrity check, has invalid
    /// padding, or does not deserialize into `T`.
    pub fn decrypt<T: DeserializeOwned>(&self, blob: &str) -> Result<T, CipherError> {
        let raw = STANDARD
            .decode(blob.trim())
            .map_err(|_| CipherError::decryption("blob is not valid base64"))?;

        if raw.len() < BLOCK_LEN * 2 + TAG_LEN || (raw.len() - TAG_LEN) % BLOCK_LEN != 0 {
            return Err(CipherError::decryption("blob has an invalid length"));
        }

        let (signed, tag) = raw.split_at(raw.len() - TAG_LEN);
        let mut mac = HmacSha256::new_from_slice(&self.mac_key[..])
            .map_err(|_| CipherError::decryption("MAC key rejected"))?;
        mac.update(signed);
        mac.verify_slice(tag)
            .map_err(|_| CipherError::decryption("integrity check failed"))?;

        let (iv, ciphertext) = signed.split_at(BLOCK_LEN);
        let decryptor = Aes256CbcDec::new_from_slices(&self.encryption_key[..], iv)
            .map_err(|_| CipherError::decryption("invalid IV"))?;
        let plaintext = Zeroizing::new(
            decryptor
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|_| CipherError::decryption("invalid padding"))?,
        );

        serde_json::from_slice(&plaintext)
            .map_err(|_| CipherError::decryption("payload does not deserialize"))
    }

    fn tag(&self, data: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut mac = HmacSha256::new_from_slice(&self.mac_key[..]).map_err(|_| {
            CipherError::Configuration {
                message: "MAC key rejected".to_string(),
            }
        })?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

impl fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialCipher")
            .field("key_fingerprint", &self.key_fingerprint())
            .finish()
    }
}

// ============================================================================
// Sealed credentials
// ============================================================================

/// Credential payload in its persisted, encrypted form
///
/// Only the ciphertext ever leaves memory; plaintext exists transiently
/// while a caller holds the value returned by [`SealedCredential::open`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedCredential {
    pub credential_id: CredentialId,
    pub ciphertext: String,
}

impl SealedCredential {
    /// Encrypt a credential payload for storage
    pub fn seal<T: Serialize + ?Sized>(
        cipher: &CredentialCipher,
        credential_id: CredentialId,
        payload: &T,
    ) -> Result<Self, CipherError> {
        Ok(Self {
            credential_id,
            ciphertext: cipher.encrypt(payload)?,
        })
    }

    /// Decrypt the payload for immediate use
    pub fn open<T: DeserializeOwned>(&self, cipher: &CredentialCipher) -> Result<T, CipherError> {
        cipher.decrypt(&self.ciphertext)
    }

    /// Decrypt and mask the payload for display
    pub fn masked_view(
        &self,
        cipher: &CredentialCipher,
        masker: &SensitiveDataMasker,
    ) -> Result<serde_json::Value, CipherError> {
        let payload: serde_json::Value = self.open(cipher)?;
        Ok(masker.mask(&payload))
    }
}

#[cfg(test)]
#[path = "credential_cipher_tests.rs"]
mod tests;
