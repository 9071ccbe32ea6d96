//! Push channel message handling
//!
//! Frames are JSON `{type, timestamp, data}`. The socket transport is not
//! part of this crate: it feeds received text frames into the inbound queue
//! and sends whatever appears on the outbound queue.

use super::{ApprovalBroker, ApprovalResult};
use crate::crypto::SymmetricKey;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const HEARTBEAT: &str = "heartbeat";
pub const ENCRYPTION_APPROVED: &str = "encryption_approved";
pub const ENCRYPTION_REJECTED: &str = "encryption_rejected";

/// One push channel frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushMessage {
    #[serde(rename = "type")]
    pub kind: String,
    /// Unix seconds
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub data: Value,
}

impl PushMessage {
    pub fn new(kind: &str, data: Value) -> Self {
        PushMessage {
            kind: kind.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            data,
        }
    }

    pub fn heartbeat(client_id: &str) -> Self {
        Self::new(HEARTBEAT, json!({ "client_id": client_id }))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    fn session_id(&self) -> Option<&str> {
        self.data.get("session_id").and_then(Value::as_str)
    }

    fn data_str(&self, field: &str) -> Option<&str> {
        self.data
            .get(field)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Interpret an approval/rejection frame as `(session_id, result)`
    pub fn approval(&self) -> Option<(String, ApprovalResult)> {
        let session_id = self.session_id()?.to_string();
        match self.kind.as_str() {
            ENCRYPTION_APPROVED => {
                let key = self.data_str("symmetric_key").map(SymmetricKey::from_hex);
                let salt = self.data_str("salt").map(hex::decode);
                let result = match (key.transpose(), salt.transpose()) {
                    (Ok(key), Ok(salt)) => ApprovalResult::approved(key, salt),
                    _ => ApprovalResult::rejected("approval carried a malformed key"),
                };
                Some((session_id, result))
            }
            ENCRYPTION_REJECTED => {
                let reason = self.data_str("reason").unwrap_or("unknown reason");
                Some((session_id, ApprovalResult::rejected(reason)))
            }
            _ => None,
        }
    }
}

/// Dispatches inbound frames to the broker and emits heartbeats
pub struct PushChannel {
    broker: ApprovalBroker,
    client_id: String,
    heartbeat_interval: Duration,
}

impl PushChannel {
    pub fn new(broker: ApprovalBroker, client_id: impl Into<String>, heartbeat_interval: Duration) -> Self {
        PushChannel {
            broker,
            client_id: client_id.into(),
            heartbeat_interval,
        }
    }

    /// Handle one inbound text frame; returns whether it settled an approval
    pub fn dispatch(&self, text: &str) -> bool {
        let message = match PushMessage::parse(text) {
            Ok(m) => m,
            Err(e) => {
                warn!("Dropping malformed push frame: {}", e);
                return false;
            }
        };

        match message.approval() {
            Some((session_id, result)) => {
                let settled = self.broker.resolve(&session_id, result);
                if !settled {
                    debug!("Push '{}' for session {} ignored (not pending)", message.kind, session_id);
                }
                settled
            }
            None => {
                debug!("Unhandled push message type '{}'", message.kind);
                false
            }
        }
    }

    /// Run until the inbound queue closes or the outbound queue is dropped
    pub async fn run(&self, mut inbound: mpsc::Receiver<String>, outbound: mpsc::Sender<String>) -> Result<()> {
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("Push channel running");

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let frame = PushMessage::heartbeat(&self.client_id).to_json()?;
                    if outbound.send(frame).await.is_err() {
                        debug!("Outbound queue closed");
                        break;
                    }
                }
                frame = inbound.recv() => match frame {
                    Some(text) => {
                        self.dispatch(&text);
                    }
                    None => {
                        debug!("Inbound queue closed");
                        break;
                    }
                },
            }
        }

        info!("Push channel stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_shape() {
        let text = PushMessage::heartbeat("pc_client").to_json().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "heartbeat");
        assert_eq!(value["data"]["client_id"], "pc_client");
        assert!(value["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_approved_frame_with_key() {
        let msg = PushMessage::new(
            ENCRYPTION_APPROVED,
            json!({ "session_id": "s", "symmetric_key": hex::encode([4u8; 32]), "salt": "0a0b" }),
        );
        let (session, result) = msg.approval().unwrap();
        assert_eq!(session, "s");
        assert!(result.approved);
        assert_eq!(result.symmetric_key.unwrap().as_bytes(), &[4u8; 32]);
        assert_eq!(result.salt, Some(vec![10, 11]));
    }

    #[test]
    fn test_rejected_frame_and_unknown_type() {
        let msg = PushMessage::new(ENCRYPTION_REJECTED, json!({ "session_id": "s", "reason": "no" }));
        let (_, result) = msg.approval().unwrap();
        assert!(!result.approved);
        assert_eq!(result.reason.as_deref(), Some("no"));

        assert!(PushMessage::new("status", json!({ "session_id": "s" })).approval().is_none());
        assert!(PushMessage::new(ENCRYPTION_APPROVED, json!({})).approval().is_none());
    }

    #[tokio::test]
    async fn test_channel_settles_pending_and_sends_heartbeat() {
        let broker = ApprovalBroker::default();
        let rx = broker.subscribe("sess").unwrap();
        let channel = PushChannel::new(broker.clone(), "pc_client", Duration::from_secs(30));

        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let task = tokio::spawn(async move { channel.run(in_rx, out_tx).await });

        // First tick fires immediately
        let first = out_rx.recv().await.unwrap();
        assert_eq!(PushMessage::parse(&first).unwrap().kind, HEARTBEAT);

        in_tx.send("garbage".to_string()).await.unwrap();
        let approved = PushMessage::new(ENCRYPTION_APPROVED, json!({ "session_id": "sess" }));
        in_tx.send(approved.to_json().unwrap()).await.unwrap();

        let result = rx.await.unwrap();
        assert!(result.approved);
        assert!(result.symmetric_key.is_none());

        drop(in_tx);
        task.await.unwrap().unwrap();
    }
}
