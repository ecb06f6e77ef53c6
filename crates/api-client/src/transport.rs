//! Streaming transport for agent runs.
//!
//! One run at a time: starting a run cancels the previous one before the new
//! request is opened. Each run is a spawned task feeding a bounded channel;
//! nothing from a cancelled run is delivered after cancellation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use opsdesk_core::StreamEvent;
use opsdesk_runtime_config::OpsdeskConfig;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::sse::{SseDecoder, SseRecord};
use crate::wire::{Classified, classify};

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Server returned HTTP {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("Malformed stream: {0}")]
    Stream(String),
    /// The server reported that the run itself failed.
    #[error("Run failed on the server: {0}")]
    Server(String),
    #[error("Run timed out after {}", human_duration(*.0))]
    Timeout(Duration),
}

impl TransportError {
    /// Short tag carried as `error_kind` on the synthetic error event.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Status { .. } => "status",
            Self::Stream(_) => "stream",
            Self::Server(_) => "server",
            Self::Timeout(_) => "timeout",
        }
    }

    /// Log event standing in for this failure in the turn timeline.
    pub fn to_event(&self) -> StreamEvent {
        StreamEvent::error(self.kind(), self.to_string(), Utc::now())
    }
}

fn human_duration(duration: Duration) -> String {
    if duration.subsec_millis() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub base_url: String,
    pub stream_path: String,
    pub auth_token: Option<String>,
    pub run_timeout: Duration,
    pub channel_capacity: usize,
}

impl TransportConfig {
    pub fn new(base_url: &str) -> Self {
        Self::from_settings(&OpsdeskConfig::default()).with_base_url(base_url)
    }

    pub fn from_settings(config: &OpsdeskConfig) -> Self {
        let token = config.server.auth_token.trim();
        Self {
            base_url: config.server.url.trim_end_matches('/').to_string(),
            stream_path: config.stream.path.clone(),
            auth_token: (!token.is_empty()).then(|| token.to_string()),
            run_timeout: config.stream.run_timeout(),
            channel_capacity: config.stream.channel_capacity.max(1),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_run_timeout(mut self, run_timeout: Duration) -> Self {
        self.run_timeout = run_timeout;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/{}", self.base_url, self.stream_path.trim_start_matches('/'))
    }
}

/// Body of a run request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunRequest {
    pub prompt: String,
    pub model: String,
    pub max_turns: u32,
    /// Conversation to continue; filled from the transport when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl RunRequest {
    pub fn new(prompt: impl Into<String>, model: impl Into<String>, max_turns: u32) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            max_turns,
            session_id: None,
        }
    }

    pub fn from_settings(prompt: impl Into<String>, config: &OpsdeskConfig) -> Self {
        Self::new(prompt, config.stream.model.clone(), config.stream.max_turns)
    }
}

/// What a run delivers to its consumer. `Completed` and `Failed` are terminal.
#[derive(Debug)]
pub enum RunEvent {
    Event(StreamEvent),
    Completed {
        final_text: Option<String>,
        session_id: Option<String>,
    },
    /// `event` is the synthetic log event to record in the timeline.
    Failed {
        error: TransportError,
        event: StreamEvent,
    },
}

impl RunEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Event(_))
    }
}

pub struct StreamTransport {
    client: reqwest::Client,
    config: TransportConfig,
    session_id: Arc<Mutex<Option<String>>>,
    generation: Arc<AtomicU64>,
    active: Option<CancellationToken>,
}

impl StreamTransport {
    pub fn new(config: TransportConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self::with_client(client, config))
    }

    /// Create from an existing `reqwest::Client` (e.g. shared in tests).
    pub fn with_client(client: reqwest::Client, config: TransportConfig) -> Self {
        Self {
            client,
            config,
            session_id: Arc::new(Mutex::new(None)),
            generation: Arc::new(AtomicU64::new(0)),
            active: None,
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn set_auth(&mut self, token: String) {
        self.config.auth_token = Some(token);
    }

    /// Conversation identifier remembered from the last completed run.
    pub fn session_id(&self) -> Option<String> {
        lock(&self.session_id).clone()
    }

    /// Forget the conversation; the next run starts a new one.
    pub fn reset_session(&mut self) {
        self.cancel();
        *lock(&self.session_id) = None;
    }

    /// Cancel the in-flight run, if any. Silent: the run reports nothing.
    pub fn cancel(&mut self) {
        if let Some(token) = self.active.take() {
            self.generation.fetch_add(1, Ordering::SeqCst);
            token.cancel();
            debug!("In-flight run cancelled");
        }
    }

    /// Open a run, superseding any run still in flight.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_run(&mut self, mut request: RunRequest) -> RunHandle {
        self.cancel();

        if request.session_id.is_none() {
            request.session_id = self.session_id();
        }
        let run_id = Uuid::new_v4();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        self.active = Some(cancel.clone());

        info!(
            %run_id,
            model = %request.model,
            continues = request.session_id.is_some(),
            "Run started"
        );

        let run = Run {
            id: run_id,
            client: self.client.clone(),
            endpoint: self.config.endpoint(),
            auth_token: self.config.auth_token.clone(),
            run_timeout: self.config.run_timeout,
            generation,
            current: Arc::clone(&self.generation),
            session_id: Arc::clone(&self.session_id),
            cancel: cancel.clone(),
            tx,
        };
        tokio::spawn(run.drive(request));

        RunHandle {
            id: run_id,
            events: rx,
            cancel,
        }
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        if let Some(token) = self.active.take() {
            token.cancel();
        }
    }
}

/// Consumer side of one run.
#[derive(Debug)]
pub struct RunHandle {
    id: Uuid,
    events: mpsc::Receiver<RunEvent>,
    cancel: CancellationToken,
}

impl RunHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next event of the run; `None` once the run has ended or was cancelled.
    pub async fn next_event(&mut self) -> Option<RunEvent> {
        if self.cancel.is_cancelled() {
            return None;
        }
        let next = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            next = self.events.recv() => next,
        };
        // Buffered events from a run cancelled meanwhile are discarded.
        next.filter(|_| !self.cancel.is_cancelled())
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token that cancels this run, for use from another task.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[derive(Debug, Default)]
struct Completion {
    final_text: Option<String>,
    session_id: Option<String>,
}

enum Stop {
    Cancelled,
    Failed(TransportError),
}

impl From<TransportError> for Stop {
    fn from(error: TransportError) -> Self {
        Self::Failed(error)
    }
}

impl From<reqwest::Error> for Stop {
    fn from(error: reqwest::Error) -> Self {
        Self::Failed(TransportError::Network(error))
    }
}

struct Run {
    id: Uuid,
    client: reqwest::Client,
    endpoint: String,
    auth_token: Option<String>,
    run_timeout: Duration,
    generation: u64,
    current: Arc<AtomicU64>,
    session_id: Arc<Mutex<Option<String>>>,
    cancel: CancellationToken,
    tx: mpsc::Sender<RunEvent>,
}

impl Run {
    async fn drive(self, request: RunRequest) {
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Stop::Cancelled),
            result = tokio::time::timeout(self.run_timeout, self.stream(&request)) => {
                match result {
                    Ok(outcome) => outcome,
                    Err(_) => Err(Stop::Failed(TransportError::Timeout(self.run_timeout))),
                }
            }
        };

        match outcome {
            Ok(completion) => {
                if self.is_superseded() {
                    debug!(run_id = %self.id, "Run finished after cancellation; result dropped");
                    return;
                }
                if let Some(session_id) = &completion.session_id {
                    *lock(&self.session_id) = Some(session_id.clone());
                }
                info!(
                    run_id = %self.id,
                    has_session = completion.session_id.is_some(),
                    "Run completed"
                );
                let _ = self
                    .tx
                    .send(RunEvent::Completed {
                        final_text: completion.final_text,
                        session_id: completion.session_id,
                    })
                    .await;
            }
            Err(Stop::Cancelled) => {
                debug!(run_id = %self.id, "Run cancelled");
            }
            Err(Stop::Failed(error)) => {
                if self.is_superseded() {
                    debug!(run_id = %self.id, "Run failed after cancellation: {error}");
                    return;
                }
                warn!(run_id = %self.id, kind = error.kind(), "Run failed: {error}");
                let event = error.to_event();
                let _ = self.tx.send(RunEvent::Failed { error, event }).await;
            }
        }
    }

    async fn stream(&self, request: &RunRequest) -> Result<Completion, Stop> {
        let mut req = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(request);
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }

        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status { status, body }.into());
        }

        let mut body = response.bytes_stream();
        let mut decoder = SseDecoder::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk
                .map_err(|e| TransportError::Stream(format!("failed to read response body: {e}")))?;
            for record in decoder.push(&chunk) {
                if let Some(completion) = self.handle(&record).await? {
                    return Ok(completion);
                }
            }
        }
        if let Some(record) = decoder.finish() {
            if let Some(completion) = self.handle(&record).await? {
                return Ok(completion);
            }
        }

        debug!(run_id = %self.id, "Stream ended without a final response");
        Ok(Completion::default())
    }

    /// Route one record; `Some` once the run has completed.
    async fn handle(&self, record: &SseRecord) -> Result<Option<Completion>, Stop> {
        match classify(record, Utc::now()) {
            Ok(Classified::Event(event)) => {
                self.emit(event).await?;
                Ok(None)
            }
            Ok(Classified::Terminal {
                event,
                final_text,
                session_id,
            }) => {
                self.emit(event).await?;
                Ok(Some(Completion {
                    final_text,
                    session_id,
                }))
            }
            Ok(Classified::Filtered(reason)) => {
                debug!(run_id = %self.id, record = record.name(), reason, "Record filtered");
                Ok(None)
            }
            Ok(Classified::ServerError(message)) => Err(TransportError::Server(message).into()),
            Err(e) => {
                warn!(
                    run_id = %self.id,
                    record = record.name(),
                    "Dropping malformed stream record: {e}"
                );
                Ok(None)
            }
        }
    }

    async fn emit(&self, event: StreamEvent) -> Result<(), Stop> {
        if self.is_superseded() {
            return Err(Stop::Cancelled);
        }
        self.tx
            .send(RunEvent::Event(event))
            .await
            .map_err(|_| Stop::Cancelled)
    }

    fn is_superseded(&self) -> bool {
        self.cancel.is_cancelled() || self.current.load(Ordering::SeqCst) != self.generation
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_server::{Piece, Reply, TestServer, pause, text};
    use opsdesk_core::{EventKind, Payload};

    fn transport(server: &TestServer) -> StreamTransport {
        let mut config = TransportConfig::new(&server.url());
        config.auth_token = Some("secret".to_string());
        StreamTransport::new(config).unwrap()
    }

    fn sse(event: &str, data: serde_json::Value) -> Piece {
        text(&format!("event: {event}\ndata: {data}\n\n"))
    }

    async fn collect(handle: &mut RunHandle) -> Vec<RunEvent> {
        let mut out = Vec::new();
        while let Some(event) = handle.next_event().await {
            let terminal = event.is_terminal();
            out.push(event);
            if terminal {
                break;
            }
        }
        out
    }

    fn narration(events: &[RunEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|event| match event {
                RunEvent::Event(e) => e.full_content.clone().or_else(|| e.display.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_run_streams_events_and_completes() {
        let server = TestServer::spawn(|_| {
            Reply::sse(vec![
                sse("connection", serde_json::json!({"display": "Connected"})),
                sse("user", serde_json::json!({"content": "net sales for bottles?"})),
                // One record split mid-JSON across two chunks.
                text("event: message\ndata: {\"full_content\":\"Looking"),
                pause(20),
                text(" up sales\"}\n\n"),
                text("event: log\ndata: {not json}\n\n"),
                sse(
                    "log",
                    serde_json::json!({"display": "Todo: Check Q1 bottles",
                        "payload": {"todos": [{"content": "Check Q1 bottles", "status": "pending"}]}}),
                ),
                sse(
                    "final_response",
                    serde_json::json!({"content": "Net sales: 120 units", "session_id": "sess-1"}),
                ),
                sse("complete", serde_json::json!({})),
            ])
        })
        .await;

        let mut transport = transport(&server);
        let mut run = transport.start_run(RunRequest::new("net sales for bottles?", "model-x", 4));
        let events = collect(&mut run).await;

        assert_eq!(
            narration(&events),
            vec![
                "Connected",
                "Looking up sales",
                "Todo: Check Q1 bottles",
                "Net sales: 120 units"
            ]
        );
        match &events[2] {
            RunEvent::Event(e) => assert!(matches!(e.payload, Payload::TodoUpdate { .. })),
            other => panic!("unexpected {other:?}"),
        }
        match &events[3] {
            RunEvent::Event(e) => assert_eq!(e.kind, EventKind::FinalResponse),
            other => panic!("unexpected {other:?}"),
        }
        match events.last() {
            Some(RunEvent::Completed {
                final_text,
                session_id,
            }) => {
                assert_eq!(final_text.as_deref(), Some("Net sales: 120 units"));
                assert_eq!(session_id.as_deref(), Some("sess-1"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(transport.session_id().as_deref(), Some("sess-1"));

        let requests = server.requests();
        assert_eq!(requests[0].method, "POST");
        assert_eq!(requests[0].path, "/api/v1/query/stream");
        assert_eq!(
            requests[0].headers.get("authorization").map(String::as_str),
            Some("Bearer secret")
        );
        let body = requests[0].json();
        assert_eq!(body["prompt"], "net sales for bottles?");
        assert_eq!(body["max_turns"], 4);
        assert!(body.get("session_id").is_none());
    }

    #[tokio::test]
    async fn test_session_id_carries_into_next_run() {
        let server = TestServer::spawn(|_| {
            Reply::sse(vec![sse(
                "final_response",
                serde_json::json!({"content": "ok", "session_id": "sess-42"}),
            )])
        })
        .await;
        let mut transport = transport(&server);

        let mut first = transport.start_run(RunRequest::new("q1", "m", 1));
        collect(&mut first).await;
        let mut second = transport.start_run(RunRequest::new("q2", "m", 1));
        collect(&mut second).await;

        let requests = server.requests();
        assert!(requests[0].json().get("session_id").is_none());
        assert_eq!(requests[1].json()["session_id"], "sess-42");

        transport.reset_session();
        assert_eq!(transport.session_id(), None);
    }

    #[tokio::test]
    async fn test_new_run_cancels_previous_silently() {
        let server = TestServer::spawn(|request| {
            if request.json()["prompt"] == "first" {
                Reply::sse(vec![
                    sse("message", serde_json::json!({"full_content": "first: step 1"})),
                    pause(150),
                    sse("message", serde_json::json!({"full_content": "first: step 2"})),
                    sse(
                        "final_response",
                        serde_json::json!({"content": "first answer", "session_id": "sess-first"}),
                    ),
                ])
            } else {
                Reply::sse(vec![
                    pause(250),
                    sse("message", serde_json::json!({"full_content": "second: step 1"})),
                    sse("final_response", serde_json::json!({"content": "second answer"})),
                ])
            }
        })
        .await;
        let mut transport = transport(&server);

        let mut first = transport.start_run(RunRequest::new("first", "m", 1));
        match first.next_event().await {
            Some(RunEvent::Event(e)) => assert_eq!(e.narration(), Some("first: step 1")),
            other => panic!("unexpected {other:?}"),
        }

        let mut second = transport.start_run(RunRequest::new("second", "m", 1));
        assert!(first.is_cancelled());
        assert!(first.next_event().await.is_none());

        let events = collect(&mut second).await;
        assert_eq!(narration(&events), vec!["second: step 1", "second answer"]);
        assert!(matches!(events.last(), Some(RunEvent::Completed { .. })));

        // The cancelled run never wrote its session id.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.session_id(), None);
    }

    #[tokio::test]
    async fn test_explicit_cancel_ends_run_without_error() {
        let server = TestServer::spawn(|_| {
            Reply::sse(vec![
                sse("message", serde_json::json!({"full_content": "working"})),
                Piece::Hang,
            ])
        })
        .await;
        let mut transport = transport(&server);
        let mut run = transport.start_run(RunRequest::new("q", "m", 1));
        assert!(matches!(run.next_event().await, Some(RunEvent::Event(_))));

        transport.cancel();
        assert!(run.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let server = TestServer::spawn(|_| {
            Reply::sse(vec![
                sse("message", serde_json::json!({"full_content": "slow tool call"})),
                Piece::Hang,
            ])
        })
        .await;
        let config = TransportConfig::new(&server.url()).with_run_timeout(Duration::from_millis(200));
        let mut transport = StreamTransport::new(config).unwrap();
        let mut run = transport.start_run(RunRequest::new("q", "m", 1));

        let events = collect(&mut run).await;
        assert_eq!(events.len(), 2);
        match &events[1] {
            RunEvent::Failed { error, event } => {
                assert!(matches!(error, TransportError::Timeout(_)));
                assert_eq!(error.kind(), "timeout");
                assert_eq!(event.error_message(), Some("Run timed out after 200ms"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_http_error_becomes_failed_event() {
        let server = TestServer::spawn(|_| Reply::text(502, "upstream down")).await;
        let mut transport = transport(&server);
        let mut run = transport.start_run(RunRequest::new("q", "m", 1));

        let events = collect(&mut run).await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            RunEvent::Failed { error, event } => {
                assert_eq!(error.kind(), "status");
                assert_eq!(event.kind, EventKind::Log);
                assert_eq!(
                    event.error_message(),
                    Some("Server returned HTTP 502 Bad Gateway: upstream down")
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_server_error_record_fails_run() {
        let server = TestServer::spawn(|_| {
            Reply::sse(vec![
                sse("message", serde_json::json!({"full_content": "querying"})),
                sse("error", serde_json::json!({"message": "agent crashed"})),
            ])
        })
        .await;
        let mut transport = transport(&server);
        let mut run = transport.start_run(RunRequest::new("q", "m", 1));

        let events = collect(&mut run).await;
        match events.last() {
            Some(RunEvent::Failed { error, .. }) => {
                assert_eq!(error.to_string(), "Run failed on the server: agent crashed");
                assert_eq!(error.kind(), "server");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stream_without_final_completes_empty() {
        let server = TestServer::spawn(|_| {
            Reply::sse(vec![text("data: {\"type\":\"message\",\"content\":\"partial\"}")])
        })
        .await;
        let mut transport = transport(&server);
        let mut run = transport.start_run(RunRequest::new("q", "m", 1));

        let events = collect(&mut run).await;
        assert_eq!(narration(&events), vec!["partial"]);
        assert!(matches!(
            events.last(),
            Some(RunEvent::Completed {
                final_text: None,
                session_id: None
            })
        ));
    }

    #[test]
    fn test_config_from_settings() {
        let mut settings = OpsdeskConfig::default();
        settings.server.url = "https://agent.internal/".to_string();
        settings.server.auth_token = " ".to_string();
        let config = TransportConfig::from_settings(&settings);
        assert_eq!(config.endpoint(), "https://agent.internal/api/v1/query/stream");
        assert_eq!(config.auth_token, None);
        assert_eq!(config.run_timeout, Duration::from_secs(600));
        assert_eq!(
            TransportError::Timeout(Duration::from_secs(600)).to_string(),
            "Run timed out after 600s"
        );
    }
}
