//! HTTP client for the custodian API

use super::{
    ApprovalStatus, CompletionNotice, Custodian, DecryptKeyRequest, PublicKeyResponse,
    ReleasedKey, SessionRegistration,
};
use crate::config::{EndpointConfig, ServerConfig};
use crate::crypto::SymmetricKey;
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::{header, Client, Response, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

/// reqwest-based [`Custodian`]
pub struct HttpCustodian {
    http: Client,
    base_url: Url,
    endpoints: EndpointConfig,
    retry_attempts: u32,
    retry_base_delay: Duration,
}

impl HttpCustodian {
    /// Create a client bound by the configured per-request timeout
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("custocrypt/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout())
            .connect_timeout(config.timeout())
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        let base_url = Url::parse(config.base_url.trim_end_matches('/')).map_err(|e| {
            Error::Config(format!("Invalid custodian URL {}: {}", config.base_url, e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(Error::Config(format!(
                "Custodian URL {} cannot carry a path",
                config.base_url
            )));
        }

        Ok(HttpCustodian {
            http,
            base_url,
            endpoints: config.endpoints.clone(),
            retry_attempts: config.retry_attempts.max(1),
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
        })
    }

    /// URL of an endpoint template. `{name}` segments are replaced by the
    /// matching parameter, percent-encoded as a single path segment.
    fn url(&self, template: &str, params: &[(&str, &str)]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty();
            for segment in template.split('/').filter(|s| !s.is_empty()) {
                let name = segment.strip_prefix('{').and_then(|s| s.strip_suffix('}'));
                let value = params
                    .iter()
                    .find(|(param, _)| Some(*param) == name)
                    .map_or(segment, |(_, value)| *value);
                segments.push(value);
            }
        }
        url
    }

    fn unreachable(endpoint: &str, e: reqwest::Error) -> Error {
        Error::CustodianUnreachable {
            endpoint: endpoint.to_string(),
            reason: if e.is_timeout() {
                "request timed out".to_string()
            } else {
                e.to_string()
            },
        }
    }

    /// Single GET
    async fn get_once(&self, url: &Url) -> Result<Response> {
        self.http
            .get(url.clone())
            .send()
            .await
            .map_err(|e| Self::unreachable(url.path(), e))
    }

    /// Idempotent GET with exponential backoff on transport errors and 5xx
    async fn get_with_retry(&self, url: &Url) -> Result<Response> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = self.get_once(url).await;

            let retryable = match &outcome {
                Ok(resp) => resp.status().is_server_error(),
                Err(_) => true,
            };
            if !retryable || attempt >= self.retry_attempts {
                return outcome;
            }

            let delay = self.retry_base_delay * 2u32.saturating_pow(attempt - 1);
            debug!("GET {} failed (attempt {}), retrying in {:?}", url.path(), attempt, delay);
            tokio::time::sleep(delay).await;
        }
    }

    /// Reject non-2xx responses
    fn check_status(path: &str, response: Response) -> Result<Response> {
        let status = response.status();
        if !status.is_success() {
            warn!("Custodian answered {} for {}", status.as_u16(), path);
            return Err(Error::CustodianRejected {
                endpoint: path.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    async fn json_body<T: DeserializeOwned>(path: &str, response: Response) -> Result<T> {
        let response = Self::check_status(path, response)?;
        response.json::<T>().await.map_err(|e| Error::CustodianResponse {
            endpoint: path.to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl Custodian for HttpCustodian {
    async fn health(&self) -> Result<()> {
        let url = self.url(&self.endpoints.health, &[]);
        let response = self.get_once(&url).await?;
        Self::check_status(url.path(), response)?;
        Ok(())
    }

    async fn register_session(&self) -> Result<String> {
        let url = self.url(&self.endpoints.register_session, &[]);
        let path = url.path();
        let response = self
            .http
            .post(url.clone())
            .send()
            .await
            .map_err(|e| Self::unreachable(path, e))?;

        let registration: SessionRegistration = Self::json_body(path, response).await?;
        if registration.session_id.trim().is_empty() {
            return Err(Error::CustodianResponse {
                endpoint: path.to_string(),
                reason: "empty session_id".to_string(),
            });
        }
        Ok(registration.session_id)
    }

    async fn check_approval(&self, session_id: &str) -> Result<ApprovalStatus> {
        // Polling is its own retry loop
        let url = self.url(&self.endpoints.check_approval, &[("session_id", session_id)]);
        let response = self.get_once(&url).await?;
        Self::json_body(url.path(), response).await
    }

    async fn notify_completed(&self, notice: &CompletionNotice) -> Result<()> {
        let url = self.url(&self.endpoints.encryption_completed, &[]);
        let response = self
            .http
            .post(url.clone())
            .json(notice)
            .send()
            .await
            .map_err(|e| Self::unreachable(url.path(), e))?;
        Self::check_status(url.path(), response)?;
        Ok(())
    }

    async fn public_key(&self, user_id: &str) -> Result<String> {
        let url = self.url(&self.endpoints.get_public_key, &[("user_id", user_id)]);
        let response = self.get_with_retry(&url).await?;
        let body: PublicKeyResponse = Self::json_body(url.path(), response).await?;
        Ok(body.public_key)
    }

    async fn request_symmetric_key(&self, encrypted_request: Vec<u8>) -> Result<SymmetricKey> {
        let url = self.url(&self.endpoints.get_key, &[]);
        let path = url.path();
        let response = self
            .http
            .post(url.clone())
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(encrypted_request)
            .send()
            .await
            .map_err(|e| Self::unreachable(path, e))?;

        let response = Self::check_status(path, response)?;
        let bytes = response.bytes().await.map_err(|e| Error::CustodianResponse {
            endpoint: path.to_string(),
            reason: e.to_string(),
        })?;

        SymmetricKey::from_slice(&bytes).map_err(|e| Error::CustodianResponse {
            endpoint: path.to_string(),
            reason: e.to_string(),
        })
    }

    async fn decrypt_key(&self, user_id: &str, encrypted_key_b64: &str) -> Result<ReleasedKey> {
        let url = self.url(&self.endpoints.decrypt_key, &[("user_id", user_id)]);
        let response = self
            .http
            .post(url.clone())
            .json(&DecryptKeyRequest {
                encrypted_key: encrypted_key_b64.to_string(),
            })
            .send()
            .await
            .map_err(|e| Self::unreachable(url.path(), e))?;

        Self::json_body(url.path(), response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;
    use axum::extract::{Path, State};
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client(base_url: String) -> HttpCustodian {
        let config = ServerConfig {
            base_url,
            retry_base_delay_ms: 10,
            ..ServerConfig::default()
        };
        HttpCustodian::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_register_and_check() {
        let router = Router::new()
            .route(
                "/api/session/register",
                post(|| async { Json(json!({ "session_id": "sess-42" })) }),
            )
            .route(
                "/api/session/check/{session_id}",
                get(|Path(id): Path<String>| async move {
                    Json(json!({
                        "approved": id == "sess-42",
                        "symmetric_key": hex::encode([1u8; 32]),
                    }))
                }),
            );
        let custodian = client(serve(router).await);

        let session = custodian.register_session().await.unwrap();
        assert_eq!(session, "sess-42");

        let status = custodian.check_approval(&session).await.unwrap();
        assert!(status.approved);
        assert_eq!(status.symmetric_key, Some(hex::encode([1u8; 32])));
        assert!(status.salt.is_none());
    }

    #[tokio::test]
    async fn test_public_key_retries_server_errors() {
        async fn flaky(State(calls): State<Arc<AtomicUsize>>, Path(user): Path<String>) -> (AxumStatus, Json<Value>) {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return (AxumStatus::SERVICE_UNAVAILABLE, Json(json!({})));
            }
            (AxumStatus::OK, Json(json!({ "public_key": format!("PEM for {}", user) })))
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route("/api/key/public/{user_id}", get(flaky))
            .with_state(calls.clone());
        let custodian = client(serve(router).await);

        let pem = custodian.public_key("alice").await.unwrap();
        assert_eq!(pem, "PEM for alice");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_ids_are_sent_as_one_path_segment() {
        let router = Router::new()
            .route(
                "/api/key/public/{user_id}",
                get(|Path(user): Path<String>| async move {
                    Json(json!({ "public_key": format!("PEM for {}", user) }))
                }),
            )
            .route(
                "/api/session/check/{session_id}",
                get(|Path(id): Path<String>| async move {
                    Json(json!({ "approved": id == "a/b?c#d" }))
                }),
            );
        let custodian = client(serve(router).await);

        let pem = custodian.public_key("team/alice?x=1#top").await.unwrap();
        assert_eq!(pem, "PEM for team/alice?x=1#top");
        assert!(custodian.check_approval("a/b?c#d").await.unwrap().approved);

        let url = custodian.url("/api/key/decrypt/{user_id}", &[("user_id", "x/y")]);
        assert!(url.path().ends_with("/api/key/decrypt/x%2Fy"));
    }

    #[test]
    fn test_base_url_with_prefix() {
        let config = ServerConfig {
            base_url: "http://127.0.0.1:9/custodian/".to_string(),
            ..ServerConfig::default()
        };
        let custodian = HttpCustodian::new(&config).unwrap();
        let url = custodian.url("/api/session/check/{session_id}", &[("session_id", "s 1")]);
        assert_eq!(url.as_str(), "http://127.0.0.1:9/custodian/api/session/check/s%201");
    }

    #[tokio::test]
    async fn test_not_found_is_rejected_without_retry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let router = Router::new().route(
            "/api/key/public/{user_id}",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    AxumStatus::NOT_FOUND
                }
            }),
        );
        let custodian = client(serve(router).await);

        let err = custodian.public_key("nobody").await.unwrap_err();
        assert!(matches!(err, Error::CustodianRejected { status: 404, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_decrypt_key_rejected_status() {
        let router = Router::new().route(
            "/api/key/decrypt/{user_id}",
            post(|| async { AxumStatus::INTERNAL_SERVER_ERROR }),
        );
        let custodian = client(serve(router).await);

        let err = custodian.decrypt_key("alice", "AAAA").await.unwrap_err();
        match err {
            Error::CustodianRejected { endpoint, status } => {
                assert_eq!(status, 500);
                assert_eq!(endpoint, "/api/key/decrypt/alice");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_decrypt_key_round_trip() {
        let router = Router::new().route(
            "/api/key/decrypt/{user_id}",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["encrypted_key"], "d3JhcHBlZA==");
                Json(json!({ "symmetric_key": hex::encode([9u8; 32]), "salt": null }))
            }),
        );
        let custodian = client(serve(router).await);

        let released = custodian.decrypt_key("alice", "d3JhcHBlZA==").await.unwrap();
        let (key, salt) = released.open("/api/key/decrypt/alice").unwrap();
        assert_eq!(key.as_bytes(), &[9u8; 32]);
        assert!(salt.is_none());
    }

    #[tokio::test]
    async fn test_request_symmetric_key_raw_body() {
        let router = Router::new().route(
            "/api/key/get",
            post(|body: Bytes| async move {
                assert_eq!(&body[..], b"ciphertext");
                vec![3u8; 32]
            }),
        );
        let custodian = client(serve(router).await);

        let key = custodian
            .request_symmetric_key(b"ciphertext".to_vec())
            .await
            .unwrap();
        assert_eq!(key.as_bytes(), &[3u8; 32]);
    }

    #[tokio::test]
    async fn test_short_key_body_is_response_error() {
        let router = Router::new().route("/api/key/get", post(|| async { vec![3u8; 8] }));
        let custodian = client(serve(router).await);

        let err = custodian.request_symmetric_key(Vec::new()).await.unwrap_err();
        assert!(matches!(err, Error::CustodianResponse { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_custodian() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let custodian = client(format!("http://{}", addr));
        let err = custodian.health().await.unwrap_err();
        assert!(matches!(err, Error::CustodianUnreachable { .. }));
    }

    #[tokio::test]
    async fn test_completion_notice_posted() {
        let seen = Arc::new(parking_lot::Mutex::new(None::<Value>));
        let sink = seen.clone();
        let router = Router::new().route(
            "/api/encryption/completed",
            post(move |Json(body): Json<Value>| {
                let sink = sink.clone();
                async move {
                    *sink.lock() = Some(body);
                    AxumStatus::OK
                }
            }),
        );
        let custodian = client(serve(router).await);

        let notice = CompletionNotice::completed("s-1", "a.txt.enc", 48);
        custodian.notify_completed(&notice).await.unwrap();

        let body = seen.lock().clone().unwrap();
        assert_eq!(body["file_name"], "a.txt.enc");
        assert_eq!(body["status"], "completed");
    }
}
