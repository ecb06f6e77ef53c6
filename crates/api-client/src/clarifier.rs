//! Remote-first clarification with local fallback.

use std::collections::HashSet;

use opsdesk_core::{
    ClarificationAnswer, ClarificationEngine, ClarificationRequest, ClarificationSession,
    ClarifyError, StateViolation,
};
use tracing::{debug, error, warn};

use crate::client::{ClarificationClient, ClarificationServiceError};

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ClarifierError {
    /// The caller broke the answering rules (e.g. wrong number of values).
    #[error(transparent)]
    Usage(#[from] ClarifyError),
    /// The service failed; the caller's session is still valid and the call
    /// may be repeated.
    #[error(transparent)]
    Service(#[from] ClarificationServiceError),
}

impl ClarifierError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Service(_))
    }
}

/// Drives clarification sessions against the service, resolving them with
/// the local engine when the service is absent, keeps failing on evaluate,
/// or stops recognising a session.
///
/// Transitions take the caller's last-known-good session by reference and
/// return the next one; on error the caller keeps what it had.
pub struct Clarifier {
    remote: Option<ClarificationClient>,
    engine: ClarificationEngine,
    local_sessions: HashSet<String>,
}

impl Clarifier {
    pub fn new(remote: Option<ClarificationClient>, engine: ClarificationEngine) -> Self {
        Self {
            remote,
            engine,
            local_sessions: HashSet::new(),
        }
    }

    /// Resolve everything with the local engine.
    pub fn local(engine: ClarificationEngine) -> Self {
        Self::new(None, engine)
    }

    pub fn engine(&self) -> &ClarificationEngine {
        &self.engine
    }

    /// Whether `session_id` is resolved locally.
    pub fn is_local(&self, session_id: &str) -> bool {
        self.remote.is_none() || self.local_sessions.contains(session_id)
    }

    /// Open a new session for `request`. Never fails: the local engine
    /// answers when the service cannot.
    pub async fn evaluate(&mut self, request: &ClarificationRequest) -> ClarificationSession {
        if let Some(remote) = &self.remote {
            match remote.evaluate(request).await {
                Ok(session) => {
                    debug!(
                        session_id = %session.session_id,
                        pending = session.pending.len(),
                        "Clarification session opened remotely"
                    );
                    return session;
                }
                Err(e) => warn!("Clarification service failed ({e}); resolving locally"),
            }
        }

        let session = ClarificationSession::from_response(self.engine.evaluate(request));
        debug!(
            session_id = %session.session_id,
            pending = session.pending.len(),
            "Clarification session opened locally"
        );
        self.local_sessions.insert(session.session_id.clone());
        session
    }

    /// Answer the active question of `session`.
    pub async fn answer(
        &mut self,
        session: &ClarificationSession,
        question_id: &str,
        values: &[String],
    ) -> Result<ClarificationSession, ClarifierError> {
        let next = match session.answer(question_id, values) {
            Ok(next) => next,
            Err(e) => return self.reject(session, e),
        };
        if self.is_local(&session.session_id) {
            return Ok(next);
        }

        let answer = ClarificationAnswer {
            question_id: question_id.to_string(),
            selected_values: values.to_vec(),
        };
        let result = match &self.remote {
            Some(remote) => remote.advance(&session.session_id, &answer).await,
            None => return Ok(next),
        };
        self.settle(session, next, result)
    }

    /// Take the active question's defaults. A no-op when it has none; the
    /// user then has to answer.
    pub async fn accept_defaults(
        &mut self,
        session: &ClarificationSession,
    ) -> Result<ClarificationSession, ClarifierError> {
        let Some(active) = session.active() else {
            return self.reject(session, StateViolation::NothingPending.into());
        };
        if active.defaults_applied.is_empty() {
            return Ok(session.clone());
        }
        let next = session.accept_defaults();
        if self.is_local(&session.session_id) {
            return Ok(next);
        }

        let result = match &self.remote {
            Some(remote) => remote.accept_defaults(&session.session_id).await,
            None => return Ok(next),
        };
        self.settle(session, next, result)
    }

    fn settle(
        &mut self,
        session: &ClarificationSession,
        local_next: ClarificationSession,
        result: Result<ClarificationSession, ClarificationServiceError>,
    ) -> Result<ClarificationSession, ClarifierError> {
        match result {
            Ok(remote_next) => Ok(remote_next),
            Err(e) if e.is_not_found() => {
                warn!(
                    session_id = %session.session_id,
                    "Clarification service lost the session ({e}); resolving locally"
                );
                self.local_sessions.insert(session.session_id.clone());
                Ok(local_next)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Usage errors on state fail loudly in debug builds; release builds log
    /// them and keep the session unchanged.
    fn reject(
        &self,
        session: &ClarificationSession,
        err: ClarifyError,
    ) -> Result<ClarificationSession, ClarifierError> {
        if !err.is_invalid_state() {
            return Err(err.into());
        }
        debug_assert!(false, "invalid clarification transition: {err}");
        error!(
            session_id = %session.session_id,
            "Ignoring invalid clarification transition: {err}"
        );
        Ok(session.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryConfig;
    use crate::test_server::{Reply, TestServer};
    use opsdesk_core::{ClarificationCatalog, SystemDefaults};
    use serde_json::json;

    fn hoodie_engine() -> ClarificationEngine {
        let catalog = ClarificationCatalog::from_json_str(
            &json!({
                "clarifications": {
                    "apparel_size": {
                        "module": "Inventory",
                        "user_question": "reorder hoodies by size",
                        "clarification_question": "Which size?",
                        "selector": {"kind": "single_select"},
                        "options": [
                            {"value": "size_s", "display_value": "Small"},
                            {"value": "size_m", "display_value": "Medium"}
                        ],
                        "keyword_hints": ["reorder", "hoodies"],
                        "context_tags": ["apparel_size"]
                    },
                    "subsidiary": {
                        "module": "Purchasing",
                        "user_question": "reorder hoodies for subsidiary",
                        "clarification_question": "Which subsidiary?",
                        "selector": {"kind": "single_select"},
                        "available_options": ["US Retail", "EU Retail"],
                        "keyword_hints": ["reorder", "hoodies"],
                        "context_tags": ["subsidiary"]
                    }
                }
            })
            .to_string(),
        )
        .unwrap();
        let defaults = SystemDefaults::from_json_str(
            &json!([{"query_id": "txn_subsidiary_volume", "rows": [
                {"subsidiary_name": "EU Retail", "transaction_count": 40},
                {"subsidiary_name": "US Retail", "transaction_count": 12}
            ]}])
            .to_string(),
        )
        .unwrap();
        ClarificationEngine::new(catalog, defaults)
    }

    fn remote(server: &TestServer) -> ClarificationClient {
        ClarificationClient::with_client(reqwest::Client::new(), &server.url(), "/clarify")
            .with_retry(RetryConfig::none())
    }

    fn remote_snapshot() -> serde_json::Value {
        json!({
            "session_id": "remote-7",
            "original_query": "reorder hoodies",
            "pending": [{
                "question_id": "apparel_size",
                "clarification_question": "Which size?",
                "selector": {"kind": "single_select"},
                "options": [
                    {"value": "size_s", "display_value": "Small"},
                    {"value": "size_m", "display_value": "Medium"}
                ],
                "context_tags": ["apparel_size"]
            }]
        })
    }

    #[tokio::test]
    async fn test_local_session_runs_to_ready() {
        let mut clarifier = Clarifier::local(hoodie_engine());
        let session = clarifier
            .evaluate(&ClarificationRequest::new("reorder hoodies"))
            .await;
        assert!(clarifier.is_local(&session.session_id));
        assert_eq!(session.pending.len(), 2);
        assert_eq!(session.active().unwrap().question_id, "apparel_size");

        let session = clarifier
            .answer(&session, "apparel_size", &["size_m".to_string()])
            .await
            .unwrap();
        assert_eq!(session.active().unwrap().question_id, "subsidiary");
        assert!(!session.active().unwrap().defaults_applied.is_empty());

        let session = clarifier.accept_defaults(&session).await.unwrap();
        assert!(session.is_ready());
        assert_eq!(
            session.resolved_context.get("apparel_size").map(String::as_str),
            Some("Medium")
        );
        assert_eq!(
            session.resolved_context.get("subsidiary").map(String::as_str),
            Some("EU Retail")
        );
    }

    #[tokio::test]
    async fn test_selector_violation_is_a_usage_error() {
        let mut clarifier = Clarifier::local(hoodie_engine());
        let session = clarifier
            .evaluate(&ClarificationRequest::new("reorder hoodies"))
            .await;
        let err = clarifier
            .answer(
                &session,
                "apparel_size",
                &["size_s".to_string(), "size_m".to_string()],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClarifierError::Usage(_)));
        assert!(!err.is_recoverable());
    }

    #[cfg(debug_assertions)]
    #[tokio::test]
    #[should_panic(expected = "invalid clarification transition")]
    async fn test_out_of_order_answer_panics_in_debug() {
        let mut clarifier = Clarifier::local(hoodie_engine());
        let session = clarifier
            .evaluate(&ClarificationRequest::new("reorder hoodies"))
            .await;
        let _ = clarifier
            .answer(&session, "subsidiary", &["EU Retail".to_string()])
            .await;
    }

    #[tokio::test]
    async fn test_remote_session_is_advanced_remotely() {
        let server = TestServer::spawn(|request| {
            if request.path.ends_with("/answers") {
                Reply::json(
                    200,
                    json!({
                        "session_id": "remote-7",
                        "original_query": "reorder hoodies",
                        "answers": {"apparel_size": ["size_m"]},
                        "resolved_context": {"apparel_size": "Medium"},
                        "pending": []
                    }),
                )
            } else {
                Reply::json(200, remote_snapshot())
            }
        })
        .await;
        let mut clarifier = Clarifier::new(Some(remote(&server)), hoodie_engine());

        let session = clarifier
            .evaluate(&ClarificationRequest::new("reorder hoodies"))
            .await;
        assert_eq!(session.session_id, "remote-7");
        assert!(!clarifier.is_local("remote-7"));

        let done = clarifier
            .answer(&session, "apparel_size", &["size_m".to_string()])
            .await
            .unwrap();
        assert!(done.is_ready());
        assert_eq!(server.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_not_found_falls_back_to_local() {
        let server = TestServer::spawn(|request| {
            if request.path.ends_with("/answers") {
                Reply::text(404, "unknown session")
            } else {
                Reply::json(200, remote_snapshot())
            }
        })
        .await;
        let mut clarifier = Clarifier::new(Some(remote(&server)), hoodie_engine());

        let session = clarifier
            .evaluate(&ClarificationRequest::new("reorder hoodies"))
            .await;
        let done = clarifier
            .answer(&session, "apparel_size", &["size_s".to_string()])
            .await
            .unwrap();
        assert!(done.is_ready());
        assert_eq!(
            done.resolved_context.get("apparel_size").map(String::as_str),
            Some("Small")
        );
        assert!(clarifier.is_local("remote-7"));
    }

    #[tokio::test]
    async fn test_service_failure_keeps_session_and_is_recoverable() {
        let server = TestServer::spawn(|request| {
            if request.path.ends_with("/answers") {
                Reply::text(500, "database offline")
            } else {
                Reply::json(200, remote_snapshot())
            }
        })
        .await;
        let mut clarifier = Clarifier::new(Some(remote(&server)), hoodie_engine());

        let session = clarifier
            .evaluate(&ClarificationRequest::new("reorder hoodies"))
            .await;
        let before = session.clone();
        let err = clarifier
            .answer(&session, "apparel_size", &["size_s".to_string()])
            .await
            .unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(session, before);
        assert!(!clarifier.is_local("remote-7"));
    }

    #[tokio::test]
    async fn test_evaluate_falls_back_when_service_is_down() {
        let server = TestServer::spawn(|_| Reply::text(503, "maintenance")).await;
        let mut clarifier = Clarifier::new(Some(remote(&server)), hoodie_engine());

        let session = clarifier
            .evaluate(&ClarificationRequest::new("reorder hoodies"))
            .await;
        assert!(clarifier.is_local(&session.session_id));
        assert_eq!(session.pending.len(), 2);
    }

    #[tokio::test]
    async fn test_accept_defaults_without_defaults_is_noop() {
        let server = TestServer::spawn(|_| Reply::json(200, remote_snapshot())).await;
        let mut clarifier = Clarifier::new(Some(remote(&server)), hoodie_engine());
        let session = clarifier
            .evaluate(&ClarificationRequest::new("reorder hoodies"))
            .await;

        let same = clarifier.accept_defaults(&session).await.unwrap();
        assert_eq!(same, session);
        assert_eq!(server.requests().len(), 1);
    }
}
