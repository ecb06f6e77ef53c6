use std::time::Duration;

use opsdesk_core::{ClarificationAnswer, ClarificationRequest, ClarificationSession};
use opsdesk_runtime_config::OpsdeskConfig;
use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::retry::{RetryConfig, retry};

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ClarificationServiceError {
    #[error("clarification service unreachable: {0}")]
    Network(#[from] reqwest::Error),
    #[error("clarification service returned HTTP {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("clarification service has no resource at {0}")]
    NotFound(String),
    #[error("invalid clarification service response: {0}")]
    Decode(String),
}

impl ClarificationServiceError {
    /// Worth retrying the same call.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Status { .. })
    }

    /// The service does not know the session (or the endpoint).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// HTTP client for the clarification service.
///
/// Every call retries recoverable failures on the configured schedule and
/// normalizes the returned session snapshot before handing it out.
pub struct ClarificationClient {
    client: reqwest::Client,
    base_url: String,
    path: String,
    auth_token: Option<String>,
    retry: RetryConfig,
}

#[derive(Serialize)]
struct AcceptDefaultsBody {
    accept_defaults: bool,
}

impl ClarificationClient {
    /// Create a new client with the given base URL, API path and timeout.
    pub fn new(base_url: &str, path: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url, path))
    }

    /// Create from an existing `reqwest::Client` (e.g. shared in tests).
    pub fn with_client(client: reqwest::Client, base_url: &str, path: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            path: format!("/{}", path.trim_matches('/')),
            auth_token: None,
            retry: RetryConfig::default(),
        }
    }

    pub fn from_config(config: &OpsdeskConfig) -> Result<Self, reqwest::Error> {
        let settings = &config.clarifications;
        let mut client = Self::new(
            &config.server.url,
            &settings.path,
            settings.request_timeout(),
        )?
        .with_retry(RetryConfig::from_settings(settings));
        let token = config.server.auth_token.trim();
        if !token.is_empty() {
            client.set_auth(token.to_string());
        }
        Ok(client)
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn set_auth(&mut self, token: String) {
        self.auth_token = Some(token);
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}{}{}", self.base_url, self.path, suffix)
    }

    // ── Session lifecycle ─────────────────────────────────────────────────

    /// Open a session for a query.
    pub async fn evaluate(
        &self,
        request: &ClarificationRequest,
    ) -> Result<ClarificationSession, ClarificationServiceError> {
        self.post_session("evaluate", self.url("/sessions"), request)
            .await
    }

    /// Submit the answer to the session's active question.
    pub async fn advance(
        &self,
        session_id: &str,
        answer: &ClarificationAnswer,
    ) -> Result<ClarificationSession, ClarificationServiceError> {
        self.post_session(
            "advance",
            self.url(&format!("/sessions/{session_id}/answers")),
            answer,
        )
        .await
    }

    /// Take the active question's defaults as the answer.
    pub async fn accept_defaults(
        &self,
        session_id: &str,
    ) -> Result<ClarificationSession, ClarificationServiceError> {
        self.post_session(
            "accept defaults",
            self.url(&format!("/sessions/{session_id}/accept-defaults")),
            &AcceptDefaultsBody {
                accept_defaults: true,
            },
        )
        .await
    }

    async fn post_session<B: Serialize>(
        &self,
        label: &str,
        url: String,
        body: &B,
    ) -> Result<ClarificationSession, ClarificationServiceError> {
        let mut session: ClarificationSession = retry(
            &self.retry,
            label,
            ClarificationServiceError::is_recoverable,
            || self.post_json(&url, body),
        )
        .await?;
        session.normalize();
        debug!(
            session_id = %session.session_id,
            pending = session.pending.len(),
            "Clarification {label} succeeded"
        );
        Ok(session)
    }

    async fn post_json<T: DeserializeOwned, B: Serialize>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<T, ClarificationServiceError> {
        let mut req = self.client.post(url).json(body);
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }
        parse_response(req.send().await?).await
    }
}

/// Parse an HTTP response: return the deserialized body on 2xx, `NotFound`
/// on 404, or an error containing the status and body text.
async fn parse_response<T: DeserializeOwned>(
    resp: reqwest::Response,
) -> Result<T, ClarificationServiceError> {
    let status = resp.status();
    if status == StatusCode::NOT_FOUND {
        return Err(ClarificationServiceError::NotFound(
            resp.url().path().to_string(),
        ));
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ClarificationServiceError::Status { status, body });
    }
    let bytes = resp.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| ClarificationServiceError::Decode(e.to_string()))
}
