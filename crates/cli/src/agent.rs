use std::path::Path;

use anyhow::{Context, Result};
use opsdesk_api_client::{
    ClarificationClient, Clarifier, RunEvent, RunRequest, StreamTransport, TransportConfig,
};
use opsdesk_core::{
    ClarificationCatalog, ClarificationEngine, ClarificationRequest, ConversationContext,
    SegmentConfig, SystemDefaults, analyze_request, compose_prompt,
};
use opsdesk_runtime_config::{ClarificationMode, OpsdeskConfig};
use tracing::{debug, info};

use crate::dialogue::{Answerer, resolve};
use crate::render::{TurnPrinter, format_history};

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Answered(Option<String>),
    Failed(String),
    Cancelled,
}

/// Local catalog and system defaults, plus the service unless the config
/// pins clarification to local resolution.
pub fn build_clarifier(config: &OpsdeskConfig) -> Result<Clarifier> {
    let settings = &config.clarifications;
    let catalog = if settings.catalog_path.is_empty() {
        ClarificationCatalog::default()
    } else {
        ClarificationCatalog::load(Path::new(&settings.catalog_path))
            .context("Failed to load clarification catalog")?
    };
    let defaults = if settings.system_defaults_path.is_empty() {
        SystemDefaults::default()
    } else {
        SystemDefaults::load(Path::new(&settings.system_defaults_path))
            .context("Failed to load system defaults")?
    };
    debug!(records = catalog.len(), "Clarification catalog loaded");

    let engine = ClarificationEngine::new(catalog, defaults);
    let remote = match settings.mode {
        ClarificationMode::Local => None,
        _ => Some(
            ClarificationClient::from_config(config)
                .context("Failed to build clarification client")?,
        ),
    };
    Ok(Clarifier::new(remote, engine))
}

/// One conversation with the agent.
pub struct Agent {
    config: OpsdeskConfig,
    context: ConversationContext,
    transport: StreamTransport,
    clarifier: Clarifier,
}

impl Agent {
    pub fn from_config(config: OpsdeskConfig) -> Result<Self> {
        let transport = StreamTransport::new(TransportConfig::from_settings(&config))
            .context("Failed to build HTTP client")?;
        let clarifier = build_clarifier(&config)?;
        Ok(Self::new(config, transport, clarifier))
    }

    pub fn new(config: OpsdeskConfig, transport: StreamTransport, clarifier: Clarifier) -> Self {
        let segments = SegmentConfig::from_millis(config.turns.tolerance_ms, config.turns.guard_ms);
        Self {
            config,
            context: ConversationContext::new(segments),
            transport,
            clarifier,
        }
    }

    pub fn config_mut(&mut self) -> &mut OpsdeskConfig {
        &mut self.config
    }

    /// Resolve clarifications for an ERP query and return the prompt to send.
    /// Other queries pass through unchanged.
    pub async fn clarify(&mut self, query: &str, answerer: &mut dyn Answerer) -> Result<String> {
        let analysis = analyze_request(query);
        if !analysis.needs_clarification {
            return Ok(query.trim().to_string());
        }
        info!(
            intent = analysis.intent.map(|i| i.as_str()).unwrap_or("unknown"),
            "Clarifying ERP request"
        );
        let session = self
            .clarifier
            .evaluate(&ClarificationRequest::new(query))
            .await;
        let session = resolve(&mut self.clarifier, session, answerer).await?;
        Ok(compose_prompt(query, &session.resolved_context))
    }

    /// Clarify (when an answerer is given and clarification is enabled),
    /// then stream the run, printing narration as it arrives. Ctrl-C cancels
    /// the run and keeps the conversation.
    pub async fn ask(&mut self, query: &str, answerer: Option<&mut dyn Answerer>) -> Result<Outcome> {
        let prompt = match answerer {
            Some(answerer) if self.config.clarifications.enabled => {
                self.clarify(query, answerer).await?
            }
            _ => query.trim().to_string(),
        };
        let interrupt = async {
            let _ = tokio::signal::ctrl_c().await;
        };
        self.run(query, prompt, interrupt).await
    }

    /// Stream one run until it ends or `interrupt` resolves.
    async fn run(
        &mut self,
        query: &str,
        prompt: String,
        interrupt: impl Future<Output = ()>,
    ) -> Result<Outcome> {
        self.context.push_user_message(query.trim());
        self.context.begin_run();
        let mut handle = self
            .transport
            .start_run(RunRequest::from_settings(prompt, &self.config));
        debug!(run_id = %handle.id(), "Run started");

        let mut printer = TurnPrinter::new();
        tokio::pin!(interrupt);

        loop {
            tokio::select! {
                _ = &mut interrupt => {
                    handle.cancel();
                    self.context.record_failure();
                    return Ok(Outcome::Cancelled);
                }
                next = handle.next_event() => match next {
                    Some(RunEvent::Event(event)) => {
                        self.context.record_event(event);
                        self.print_current(&mut printer);
                    }
                    Some(RunEvent::Completed { final_text, .. }) => {
                        self.context.record_final(final_text.clone());
                        self.print_current(&mut printer);
                        return Ok(Outcome::Answered(final_text));
                    }
                    Some(RunEvent::Failed { error, event }) => {
                        self.context.record_event(event);
                        self.context.record_failure();
                        self.print_current(&mut printer);
                        return Ok(Outcome::Failed(error.to_string()));
                    }
                    None => {
                        self.context.record_failure();
                        return Ok(Outcome::Cancelled);
                    }
                }
            }
        }
    }

    fn print_current(&self, printer: &mut TurnPrinter) {
        if let Some(render) = self.context.current_render() {
            printer.print(&render);
        }
    }

    /// Forget the conversation, including the server-side session.
    pub fn new_conversation(&mut self) {
        self.transport.reset_session();
        self.context.reset();
    }

    pub fn history(&self) -> String {
        format_history(&self.context.render())
    }

    /// Flip turn `number` (1-based, as shown by `history`).
    pub fn toggle(&mut self, number: usize) -> Option<bool> {
        let renders = self.context.render();
        let key = renders.get(number.checked_sub(1)?)?.key.clone();
        self.context.toggle(&key)
    }

    pub fn session_id(&self) -> Option<String> {
        self.transport.session_id()
    }
}
