//! Key material
//!
//! - Symmetric Key: 32-byte AES-256 key, zeroized on drop
//! - Key Envelope: the `{key, salt}` structure carried inside a wrapped key
//! - Wrapped Key: RSA-OAEP ciphertext of a key envelope under the custodian's
//!   public key

use crate::config::OaepHash;
use crate::crypto::KEY_SIZE;
use crate::error::{Error, Result};
use base64::Engine as _;
use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use zeroize::Zeroizing;

fn oaep(hash: OaepHash) -> Oaep {
    match hash {
        OaepHash::Sha1 => Oaep::new::<sha1::Sha1>(),
        OaepHash::Sha256 => Oaep::new::<sha2::Sha256>(),
    }
}

fn oaep_digest_len(hash: OaepHash) -> usize {
    match hash {
        OaepHash::Sha1 => 20,
        OaepHash::Sha256 => 32,
    }
}

/// AES-256 key
#[derive(Clone)]
pub struct SymmetricKey {
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl SymmetricKey {
    /// Generate a random key
    pub fn random() -> Self {
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        rand::thread_rng().fill_bytes(key.as_mut());
        SymmetricKey { key }
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        SymmetricKey {
            key: Zeroizing::new(bytes),
        }
    }

    /// Build from a slice, checking the length
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(Error::InvalidKeyLength {
                expected: KEY_SIZE,
                got: bytes.len(),
            });
        }
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        key.copy_from_slice(bytes);
        Ok(SymmetricKey { key })
    }

    /// Parse a hex-encoded key as sent by the custodian
    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let bytes = Zeroizing::new(
            hex::decode(hex_key.trim())
                .map_err(|e| Error::UnwrapKeyFailed(format!("key is not valid hex: {}", e)))?,
        );
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(<redacted>)")
    }
}

/// Plaintext carried inside a wrapped key
#[derive(Serialize, Deserialize)]
pub struct KeyEnvelope {
    /// Hex-encoded symmetric key
    key: String,
    /// Hex-encoded PBKDF2 salt, when the key was passphrase-derived
    salt: Option<String>,
}

impl KeyEnvelope {
    pub fn new(key: &SymmetricKey, salt: Option<&[u8]>) -> Self {
        KeyEnvelope {
            key: hex::encode(key.as_bytes()),
            salt: salt.map(hex::encode),
        }
    }

    pub fn to_json(&self) -> Result<Zeroizing<Vec<u8>>> {
        Ok(Zeroizing::new(serde_json::to_vec(self)?))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::UnwrapKeyFailed(format!("invalid key envelope: {}", e)))
    }

    /// Decode into the key and optional salt
    pub fn open(&self) -> Result<(SymmetricKey, Option<Vec<u8>>)> {
        let key = SymmetricKey::from_hex(&self.key)?;
        let salt = match &self.salt {
            Some(s) => Some(
                hex::decode(s)
                    .map_err(|e| Error::UnwrapKeyFailed(format!("salt is not valid hex: {}", e)))?,
            ),
            None => None,
        };
        Ok((key, salt))
    }
}

impl Drop for KeyEnvelope {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.key.zeroize();
    }
}

/// RSA public key of a custodian user
#[derive(Clone, Debug)]
pub struct PublicKey {
    inner: RsaPublicKey,
}

impl PublicKey {
    /// Parse an SPKI (`BEGIN PUBLIC KEY`) or PKCS#1 (`BEGIN RSA PUBLIC KEY`) PEM
    pub fn from_pem(pem: &str) -> Result<Self> {
        let pem = pem.trim();
        let inner = RsaPublicKey::from_public_key_pem(pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
            .map_err(|e| Error::WrapKeyFailed(format!("invalid public key PEM: {}", e)))?;
        Ok(PublicKey { inner })
    }

    /// SPKI PEM encoding
    pub fn to_pem(&self) -> Result<String> {
        use rsa::pkcs8::{EncodePublicKey, LineEnding};
        self.inner
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| Error::Internal(format!("cannot encode public key: {}", e)))
    }

    /// Modulus size in bytes
    pub fn size(&self) -> usize {
        self.inner.size()
    }

    /// Largest OAEP plaintext this key can encrypt
    pub fn max_payload(&self, hash: OaepHash) -> usize {
        self.size()
            .saturating_sub(2 * oaep_digest_len(hash) + 2)
    }

    /// RSA-OAEP encrypt a small payload
    pub fn encrypt(&self, data: &[u8], hash: OaepHash) -> Result<Vec<u8>> {
        let limit = self.max_payload(hash);
        if data.len() > limit {
            return Err(Error::WrapKeyFailed(format!(
                "payload of {} bytes exceeds the {}-byte OAEP limit of a {}-bit key",
                data.len(),
                limit,
                self.size() * 8
            )));
        }

        self.inner
            .encrypt(&mut rand::thread_rng(), oaep(hash), data)
            .map_err(|e| Error::WrapKeyFailed(e.to_string()))
    }
}

/// RSA private key, used only for offline unwrapping
pub struct PrivateKey {
    inner: RsaPrivateKey,
}

impl PrivateKey {
    /// Parse a PKCS#8 (`BEGIN PRIVATE KEY`) or PKCS#1 (`BEGIN RSA PRIVATE KEY`) PEM
    pub fn from_pem(pem: &str) -> Result<Self> {
        let pem = pem.trim();
        let inner = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| Error::UnwrapKeyFailed(format!("invalid private key PEM: {}", e)))?;
        Ok(PrivateKey { inner })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let pem = Zeroizing::new(std::fs::read_to_string(path)?);
        Self::from_pem(&pem)
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            inner: self.inner.to_public_key(),
        }
    }

    pub fn decrypt(&self, data: &[u8], hash: OaepHash) -> Result<Zeroizing<Vec<u8>>> {
        self.inner
            .decrypt(oaep(hash), data)
            .map(Zeroizing::new)
            .map_err(|e| Error::UnwrapKeyFailed(e.to_string()))
    }
}

/// Symmetric key (plus salt) encrypted under a custodian public key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WrappedKey {
    bytes: Vec<u8>,
}

impl WrappedKey {
    /// Wrap `key` and its optional salt under `public_key`
    pub fn wrap(
        public_key: &PublicKey,
        key: &SymmetricKey,
        salt: Option<&[u8]>,
        hash: OaepHash,
    ) -> Result<Self> {
        let payload = KeyEnvelope::new(key, salt).to_json()?;
        let bytes = public_key.encrypt(&payload, hash)?;
        Ok(WrappedKey { bytes })
    }

    /// Recover the key and salt with the matching private key
    pub fn unwrap(&self, private_key: &PrivateKey, hash: OaepHash) -> Result<(SymmetricKey, Option<Vec<u8>>)> {
        let payload = private_key.decrypt(&self.bytes, hash)?;
        KeyEnvelope::from_json(&payload)?.open()
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        WrappedKey { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Base64 form submitted to the custodian
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.bytes)
    }
}
