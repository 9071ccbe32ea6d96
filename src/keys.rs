//! Key manager
//!
//! Resolves the symmetric key of one file operation.
//!
//! Encryption runs a small state machine:
//!
//! ```text
//! INIT -> FETCH_PUBLIC_KEY -> { REMOTE_READY | LOCAL_FALLBACK } -> KEY_GENERATED -> KEY_WRAPPED -> DONE
//! any state -> FAILURE
//! ```
//!
//! A failed public-key fetch drops straight to LOCAL_FALLBACK; transport
//! retries are the custodian client's business, not this machine's.

use crate::config::{Config, KeySourceMode, OaepHash};
use crate::crypto::{derive_key, generate_salt, PrivateKey, PublicKey, SymmetricKey, WrappedKey};
use crate::custodian::{Custodian, FileInfo};
use crate::error::{Error, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Encryption key states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Init,
    FetchPublicKey,
    RemoteReady,
    LocalFallback,
    KeyGenerated,
    KeyWrapped,
    Done,
    Failure,
}

impl fmt::Display for KeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyState::Init => "INIT",
            KeyState::FetchPublicKey => "FETCH_PUBLIC_KEY",
            KeyState::RemoteReady => "REMOTE_READY",
            KeyState::LocalFallback => "LOCAL_FALLBACK",
            KeyState::KeyGenerated => "KEY_GENERATED",
            KeyState::KeyWrapped => "KEY_WRAPPED",
            KeyState::Done => "DONE",
            KeyState::Failure => "FAILURE",
        };
        f.write_str(name)
    }
}

/// How the key will be stored in the container
#[derive(Debug, Clone)]
pub enum KeyTrailer {
    /// Remote variant: key wrapped under the custodian public key
    Wrapped(WrappedKey),
    /// Local variant: key stored in the clear (degraded mode)
    Clear,
}

/// Outcome of the encryption key state machine
#[derive(Debug)]
pub struct KeyResolution {
    pub key: SymmetricKey,
    pub salt: Option<Vec<u8>>,
    pub trailer: KeyTrailer,
    /// States visited, in order
    pub path: Vec<KeyState>,
}

impl KeyResolution {
    pub fn is_remote(&self) -> bool {
        matches!(self.trailer, KeyTrailer::Wrapped(_))
    }
}

/// Key material found in a container trailer
#[derive(Debug, Clone)]
pub enum StoredKey {
    Wrapped(WrappedKey),
    Clear(SymmetricKey),
}

/// Inputs for one encryption key resolution
#[derive(Default)]
pub struct KeyRequest {
    pub file_name: String,
    pub file_size: u64,
    /// Derive the key from this passphrase instead of generating it
    pub passphrase: Option<Zeroizing<String>>,
    /// Key (and salt) issued together with a device approval
    pub issued: Option<(SymmetricKey, Option<Vec<u8>>)>,
}

struct Machine {
    path: Vec<KeyState>,
}

impl Machine {
    fn new() -> Self {
        Machine {
            path: vec![KeyState::Init],
        }
    }

    fn enter(&mut self, state: KeyState) {
        debug!("Key state {} -> {}", self.current(), state);
        self.path.push(state);
    }

    fn current(&self) -> KeyState {
        self.path.last().copied().unwrap_or(KeyState::Init)
    }

    fn fail(&mut self, err: Error) -> Error {
        warn!("Key resolution failed in {}: {}", self.current(), err);
        self.path.push(KeyState::Failure);
        err
    }
}

/// Obtains and releases symmetric keys
pub struct KeyManager {
    custodian: Arc<dyn Custodian>,
    user_id: String,
    oaep_hash: OaepHash,
    pbkdf2_iterations: u32,
    key_source: KeySourceMode,
    fetch_timeout: Duration,
}

impl KeyManager {
    pub fn new(custodian: Arc<dyn Custodian>, config: &Config) -> Self {
        KeyManager {
            custodian,
            user_id: config.server.user_id.clone(),
            oaep_hash: config.encryption.oaep_hash,
            pbkdf2_iterations: config.encryption.pbkdf2_iterations,
            key_source: config.encryption.key_source,
            fetch_timeout: config.server.timeout(),
        }
    }

    pub fn oaep_hash(&self) -> OaepHash {
        self.oaep_hash
    }

    /// Fetch the user's public key, bounded by the request timeout
    async fn fetch_public_key(&self) -> Result<PublicKey> {
        let fetch = self.custodian.public_key(&self.user_id);
        let pem = match tokio::time::timeout(self.fetch_timeout, fetch).await {
            Ok(Ok(pem)) => pem,
            Ok(Err(e)) => {
                return Err(Error::FetchPublicKeyFailed {
                    user_id: self.user_id.clone(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(Error::FetchPublicKeyFailed {
                    user_id: self.user_id.clone(),
                    reason: format!("timed out after {:?}", self.fetch_timeout),
                })
            }
        };

        if pem.trim().is_empty() {
            return Err(Error::FetchPublicKeyFailed {
                user_id: self.user_id.clone(),
                reason: "custodian returned no key material".to_string(),
            });
        }

        PublicKey::from_pem(&pem).map_err(|e| Error::FetchPublicKeyFailed {
            user_id: self.user_id.clone(),
            reason: e.to_string(),
        })
    }

    /// Run the encryption key state machine
    pub async fn resolve_encrypt_key(&self, request: KeyRequest) -> Result<KeyResolution> {
        let mut machine = Machine::new();
        machine.enter(KeyState::FetchPublicKey);

        let public_key = match self.fetch_public_key().await {
            Ok(pk) => {
                machine.enter(KeyState::RemoteReady);
                Some(pk)
            }
            Err(e) => {
                warn!("{}; falling back to a local key container", e);
                machine.enter(KeyState::LocalFallback);
                None
            }
        };

        let Some(public_key) = public_key else {
            if request.issued.is_some() || request.passphrase.is_some() {
                warn!("Local fallback ignores issued or passphrase keys and uses a fresh random key");
            }
            let key = SymmetricKey::random();
            machine.enter(KeyState::KeyGenerated);
            warn!("The local container stores its key in the clear next to the ciphertext");
            machine.enter(KeyState::Done);
            return Ok(KeyResolution {
                key,
                salt: None,
                trailer: KeyTrailer::Clear,
                path: machine.path,
            });
        };

        let (key, salt) = match self.generate_remote_key(&public_key, request).await {
            Ok(pair) => pair,
            Err(e) => return Err(machine.fail(e)),
        };
        machine.enter(KeyState::KeyGenerated);

        let wrapped = match WrappedKey::wrap(&public_key, &key, salt.as_deref(), self.oaep_hash) {
            Ok(w) => w,
            Err(e) => return Err(machine.fail(e)),
        };
        machine.enter(KeyState::KeyWrapped);
        machine.enter(KeyState::Done);
        info!("Symmetric key wrapped for user {} ({} bytes)", self.user_id, wrapped.len());

        Ok(KeyResolution {
            key,
            salt,
            trailer: KeyTrailer::Wrapped(wrapped),
            path: machine.path,
        })
    }

    async fn generate_remote_key(
        &self,
        public_key: &PublicKey,
        request: KeyRequest,
    ) -> Result<(SymmetricKey, Option<Vec<u8>>)> {
        if let Some((key, salt)) = request.issued {
            debug!("Using the key issued with the approval");
            return Ok((key, salt));
        }

        if self.key_source == KeySourceMode::Custodian {
            let info = FileInfo {
                file_name: request.file_name,
                file_size: request.file_size,
                timestamp: chrono::Utc::now().timestamp(),
            };
            let body = serde_json::to_vec(&info)?;
            let encrypted = public_key.encrypt(&body, self.oaep_hash)?;
            let key = self.custodian.request_symmetric_key(encrypted).await?;
            debug!("Using a custodian-issued key");
            return Ok((key, None));
        }

        if let Some(passphrase) = request.passphrase {
            let salt = generate_salt();
            let iterations = self.pbkdf2_iterations;
            let key = tokio::task::spawn_blocking(move || {
                derive_key(passphrase.as_bytes(), &salt, iterations)
            })
            .await
            .map_err(|e| Error::Internal(format!("key derivation task failed: {}", e)))??;
            return Ok((key, Some(salt.to_vec())));
        }

        Ok((SymmetricKey::random(), None))
    }

    /// Recover the key of a container. Fails closed on any custodian problem.
    pub async fn resolve_decrypt_key(
        &self,
        stored: StoredKey,
        private_key: Option<&PrivateKey>,
    ) -> Result<SymmetricKey> {
        match stored {
            StoredKey::Clear(key) => {
                warn!("Container uses the local variant; its key was stored in the clear");
                Ok(key)
            }
            StoredKey::Wrapped(wrapped) => {
                if let Some(private_key) = private_key {
                    debug!("Unwrapping key offline");
                    let (key, _salt) = wrapped.unwrap(private_key, self.oaep_hash)?;
                    return Ok(key);
                }

                let released = self
                    .custodian
                    .decrypt_key(&self.user_id, &wrapped.to_base64())
                    .await?;
                let (key, _salt) = released.open(&format!("key release for {}", self.user_id))?;
                info!("Custodian released the key for user {}", self.user_id);
                Ok(key)
            }
        }
    }
}
