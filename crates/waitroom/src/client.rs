//! Admission service client.
//!
//! Two operations against the backend:
//! - `JoinQueue`: `POST {base}/queue/join` with `{"user_id": ...}`
//! - `PollStatus`: `GET {base}/status/{user_id}` (read-only)
//!
//! Both return a [`QueueSnapshot`]. Every failure is surfaced as a
//! [`ServiceError`]; the controller only looks at its [`FailureKind`].

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::identity::{ClientIdentity, InvalidIdentity};
use crate::machine::{Failure, FailureKind};
use crate::status::QueueSnapshot;
use crate::version::user_agent;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("could not reach admission service: {0}")]
    Transport(String),
    #[error("admission service returned {status}: {detail}")]
    Application { status: u16, detail: String },
    #[error("admission service rejected the request ({status}): {detail}")]
    Rejected { status: u16, detail: String },
    #[error("invalid client identity: {0}")]
    InvalidIdentity(#[from] InvalidIdentity),
    #[error("malformed response from admission service: {0}")]
    Decode(String),
}

impl ServiceError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Transport(_) => FailureKind::Transport,
            Self::Application { .. } | Self::Decode(_) => FailureKind::Application,
            Self::Rejected { .. } | Self::InvalidIdentity(_) => FailureKind::Validation,
        }
    }
}

impl From<ServiceError> for Failure {
    fn from(err: ServiceError) -> Self {
        Failure::new(err.kind(), err.to_string())
    }
}

/// The backend's admission API, as consumed by the controller.
#[async_trait]
pub trait AdmissionService: Send + Sync {
    /// Enqueue the client if not already enqueued.
    async fn join_queue(&self, identity: &ClientIdentity) -> Result<QueueSnapshot, ServiceError>;

    /// Side-effect-free status read.
    async fn poll_status(&self, identity: &ClientIdentity)
    -> Result<QueueSnapshot, ServiceError>;
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub base_url: String,
    pub join_path: String,
    pub status_path: String,
    pub timeout: Duration,
    pub auth_token: Option<String>,
}

impl ServiceConfig {
    /// Defaults for the deployed backend; auth token from `WAITROOM_AUTH_TOKEN`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            join_path: "/queue/join".to_string(),
            status_path: "/status".to_string(),
            timeout: Duration::from_secs(30),
            auth_token: std::env::var("WAITROOM_AUTH_TOKEN").ok(),
        }
    }
}

pub struct HttpAdmissionService {
    config: ServiceConfig,
    client: reqwest::Client,
}

impl HttpAdmissionService {
    pub fn new(config: ServiceConfig) -> Self {
        let mut headers = reqwest::header::HeaderMap::new();

        if let Some(token) = config.auth_token.as_deref()
            && let Ok(value) = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token))
        {
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }

        if let Ok(value) = reqwest::header::HeaderValue::from_str(&user_agent()) {
            headers.insert(reqwest::header::USER_AGENT, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .expect("Failed to create HTTP client");

        Self { config, client }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn join_url(&self) -> String {
        self.url(&self.config.join_path)
    }

    fn status_url(&self, identity: &ClientIdentity) -> String {
        format!(
            "{}/{}",
            self.url(&self.config.status_path).trim_end_matches('/'),
            identity
        )
    }

    async fn execute(
        &self,
        operation: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<QueueSnapshot, ServiceError> {
        let request_id = Uuid::new_v4().to_string();
        tracing::debug!(operation, %request_id, "Sending admission request");

        let response = request
            .header("x-request-id", &request_id)
            .send()
            .await
            .map_err(|e| ServiceError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| ServiceError::Transport(e.to_string()))?;

        if status.is_success() {
            let snapshot: QueueSnapshot = serde_json::from_slice(&body)
                .map_err(|e| ServiceError::Decode(e.to_string()))?;
            tracing::debug!(
                operation,
                %request_id,
                status = %snapshot.status,
                position = snapshot.position,
                "Admission snapshot received"
            );
            return Ok(snapshot);
        }

        let detail = error_detail(&body)
            .or_else(|| status.canonical_reason().map(str::to_string))
            .unwrap_or_default();
        let code = status.as_u16();
        tracing::warn!(operation, %request_id, status = code, %detail, "Admission request failed");

        match code {
            400 | 422 => Err(ServiceError::Rejected {
                status: code,
                detail,
            }),
            _ => Err(ServiceError::Application {
                status: code,
                detail,
            }),
        }
    }
}

#[async_trait]
impl AdmissionService for HttpAdmissionService {
    async fn join_queue(&self, identity: &ClientIdentity) -> Result<QueueSnapshot, ServiceError> {
        identity.validate()?;
        let request = self
            .client
            .post(self.join_url())
            .json(&serde_json::json!({ "user_id": identity }));
        self.execute("join", request).await
    }

    async fn poll_status(
        &self,
        identity: &ClientIdentity,
    ) -> Result<QueueSnapshot, ServiceError> {
        identity.validate()?;
        let request = self.client.get(self.status_url(identity));
        self.execute("poll", request).await
    }
}

/// Pull a human-readable message out of an error body.
///
/// Understands `{"detail": ...}` bodies; otherwise uses the trimmed text.
fn error_detail(body: &[u8]) -> Option<String> {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body)
        && let Some(detail) = value.get("detail")
    {
        return Some(match detail {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        });
    }

    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}
