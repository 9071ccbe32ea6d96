//! Remote key custodian
//!
//! The [`Custodian`] trait is the seam between the key manager / approval
//! protocol and the custodian service. [`HttpCustodian`] talks to the real
//! HTTP API; tests substitute in-memory fakes.

mod client;

pub use client::HttpCustodian;

use crate::crypto::SymmetricKey;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Operations offered by the custodian service
#[async_trait]
pub trait Custodian: Send + Sync {
    /// Succeeds when the service is reachable
    async fn health(&self) -> Result<()>;

    /// Register a new approval session
    async fn register_session(&self) -> Result<String>;

    /// Poll the approval state of a session
    async fn check_approval(&self, session_id: &str) -> Result<ApprovalStatus>;

    /// Report a finished encryption
    async fn notify_completed(&self, notice: &CompletionNotice) -> Result<()>;

    /// PEM public key of `user_id`
    async fn public_key(&self, user_id: &str) -> Result<String>;

    /// Submit an RSA-encrypted [`FileInfo`] and receive a fresh symmetric key
    async fn request_symmetric_key(&self, encrypted_request: Vec<u8>) -> Result<SymmetricKey>;

    /// Ask the custodian to unwrap a base64 wrapped key for `user_id`
    async fn decrypt_key(&self, user_id: &str, encrypted_key_b64: &str) -> Result<ReleasedKey>;
}

/// Response of the session registration call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRegistration {
    pub session_id: String,
}

/// Response of the check-approval call
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApprovalStatus {
    #[serde(default)]
    pub approved: bool,
    /// Hex key issued together with the approval
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symmetric_key: Option<String>,
    /// Hex salt issued together with the approval
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
}

/// Body of the completion notice
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletionNotice {
    pub session_id: String,
    /// Container file name
    pub file_name: String,
    /// Container size in bytes
    pub file_size: u64,
    pub status: String,
    /// Unix seconds
    pub timestamp: i64,
}

impl CompletionNotice {
    pub fn completed(session_id: &str, file_name: &str, file_size: u64) -> Self {
        CompletionNotice {
            session_id: session_id.to_string(),
            file_name: file_name.to_string(),
            file_size,
            status: "completed".to_string(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Plaintext of a custodian key request, RSA-encrypted before sending
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub file_name: String,
    pub file_size: u64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PublicKeyResponse {
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DecryptKeyRequest {
    pub encrypted_key: String,
}

/// Key released by the custodian for decryption
#[derive(Clone, Serialize, Deserialize)]
pub struct ReleasedKey {
    /// Hex-encoded key
    pub symmetric_key: String,
    /// Hex-encoded salt
    #[serde(default)]
    pub salt: Option<String>,
}

impl ReleasedKey {
    /// Decode the hex fields
    pub fn open(&self, endpoint: &str) -> Result<(SymmetricKey, Option<Vec<u8>>)> {
        let bad = |reason: String| Error::CustodianResponse {
            endpoint: endpoint.to_string(),
            reason,
        };

        let key = SymmetricKey::from_hex(&self.symmetric_key).map_err(|e| bad(e.to_string()))?;
        let salt = self
            .salt
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(hex::decode)
            .transpose()
            .map_err(|e| bad(format!("salt is not valid hex: {}", e)))?;
        Ok((key, salt))
    }
}

impl std::fmt::Debug for ReleasedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleasedKey")
            .field("symmetric_key", &"<redacted>")
            .field("salt", &self.salt.is_some())
            .finish()
    }
}
