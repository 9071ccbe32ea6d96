//! Device approval protocol
//!
//! An encryption waits until a human approves it on a secondary device. The
//! outcome arrives either by polling the custodian or through the push
//! channel; both race to settle one oneshot per session and the first
//! signal wins. Later signals for the same session are no-ops.

mod push;
mod session;

pub use push::{PushChannel, PushMessage, ENCRYPTION_APPROVED, ENCRYPTION_REJECTED, HEARTBEAT};
pub use session::SessionStore;

use crate::custodian::{ApprovalStatus, Custodian};
use crate::crypto::SymmetricKey;
use crate::error::{Error, Result};
use crate::executor::{ProgressEvent, ProgressObserver};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// What the approving device is shown
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ApprovalRequest {
    pub file_path: String,
    pub file_name: String,
    pub file_size: u64,
    pub session_id: String,
    /// Unix seconds
    pub timestamp: i64,
}

impl ApprovalRequest {
    pub fn for_file(path: &Path, file_size: u64, session_id: &str) -> Self {
        ApprovalRequest {
            file_path: path.display().to_string(),
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            file_size,
            session_id: session_id.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    /// Text to encode into the scannable code
    pub fn token(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Terminal outcome of one approval exchange
#[derive(Debug, Clone)]
pub struct ApprovalResult {
    pub approved: bool,
    /// Key issued with the approval, if the custodian sent one
    pub symmetric_key: Option<SymmetricKey>,
    pub salt: Option<Vec<u8>>,
    /// Rejection reason
    pub reason: Option<String>,
}

impl ApprovalResult {
    pub fn approved(symmetric_key: Option<SymmetricKey>, salt: Option<Vec<u8>>) -> Self {
        ApprovalResult {
            approved: true,
            symmetric_key,
            salt,
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        ApprovalResult {
            approved: false,
            symmetric_key: None,
            salt: None,
            reason: Some(reason.into()),
        }
    }

    /// Interpret a poll response; `None` while still pending
    pub fn from_status(status: ApprovalStatus) -> Option<Self> {
        if !status.approved {
            return None;
        }

        let key = status
            .symmetric_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .map(SymmetricKey::from_hex)
            .transpose();
        let salt = status
            .salt
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(hex::decode)
            .transpose();

        Some(match (key, salt) {
            (Ok(key), Ok(salt)) => Self::approved(key, salt),
            _ => Self::rejected("approval carried a malformed key"),
        })
    }
}

/// Pending approvals, keyed by session
#[derive(Clone, Default)]
pub struct ApprovalBroker {
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<ApprovalResult>>>>,
}

impl ApprovalBroker {
    /// Start waiting on `session_id`
    pub fn subscribe(&self, session_id: &str) -> Result<oneshot::Receiver<ApprovalResult>> {
        let mut pending = self.pending.lock();
        if pending.contains_key(session_id) {
            return Err(Error::ApprovalPending(session_id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(session_id.to_string(), tx);
        Ok(rx)
    }

    /// Settle a pending approval. Returns false if nothing was pending.
    pub fn resolve(&self, session_id: &str, result: ApprovalResult) -> bool {
        let sender = self.pending.lock().remove(session_id);
        match sender {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Drop a pending approval without settling it
    pub fn cancel(&self, session_id: &str) {
        self.pending.lock().remove(session_id);
    }

    pub fn is_pending(&self, session_id: &str) -> bool {
        self.pending.lock().contains_key(session_id)
    }
}

/// Waits for a device approval within a deadline
pub struct ApprovalGate {
    custodian: Arc<dyn Custodian>,
    broker: ApprovalBroker,
    timeout: Duration,
    poll_interval: Duration,
}

impl ApprovalGate {
    pub fn new(
        custodian: Arc<dyn Custodian>,
        broker: ApprovalBroker,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        ApprovalGate {
            custodian,
            broker,
            timeout,
            poll_interval,
        }
    }

    /// Present the token and wait for the first approval signal.
    ///
    /// Emits the token, then 5% once it is out and 10% on approval. On
    /// timeout or rejection a `Reset` event is emitted instead.
    pub async fn await_approval(
        &self,
        request: &ApprovalRequest,
        progress: &dyn ProgressObserver,
    ) -> Result<ApprovalResult> {
        let session_id = request.session_id.clone();
        let rx = self.broker.subscribe(&session_id)?;

        let token = match request.token() {
            Ok(t) => t,
            Err(e) => {
                self.broker.cancel(&session_id);
                return Err(e);
            }
        };
        progress.on_event(ProgressEvent::ApprovalToken(token));
        progress.on_event(ProgressEvent::Status(
            "Waiting for approval on the secondary device".to_string(),
        ));
        progress.percent(5);
        info!("Waiting up to {:?} for approval of session {}", self.timeout, session_id);

        let poller = tokio::spawn(poll_until_decided(
            Arc::clone(&self.custodian),
            self.broker.clone(),
            session_id.clone(),
            self.poll_interval,
        ));

        let outcome = tokio::select! {
            received = rx => received.map_err(|_| Error::Cancelled),
            _ = tokio::time::sleep(self.timeout) => Err(Error::ApprovalTimeout {
                session_id: session_id.clone(),
                waited_secs: self.timeout.as_secs(),
            }),
        };

        poller.abort();
        self.broker.cancel(&session_id);

        match outcome {
            Ok(result) if result.approved => {
                info!("Session {} approved", session_id);
                progress.percent(10);
                Ok(result)
            }
            Ok(result) => {
                let reason = result.reason.unwrap_or_else(|| "rejected".to_string());
                warn!("Session {} rejected: {}", session_id, reason);
                progress.on_event(ProgressEvent::Reset);
                Err(Error::ApprovalRejected { session_id, reason })
            }
            Err(e) => {
                warn!("Approval for session {} failed: {}", session_id, e);
                progress.on_event(ProgressEvent::Reset);
                Err(e)
            }
        }
    }
}

async fn poll_until_decided(
    custodian: Arc<dyn Custodian>,
    broker: ApprovalBroker,
    session_id: String,
    interval: Duration,
) {
    loop {
        tokio::time::sleep(interval).await;
        if !broker.is_pending(&session_id) {
            return;
        }

        match custodian.check_approval(&session_id).await {
            Ok(status) => {
                if let Some(result) = ApprovalResult::from_status(status) {
                    broker.resolve(&session_id, result);
                    return;
                }
            }
            Err(e) => debug!("Approval poll for {} failed: {}", session_id, e),
        }
    }
}
