use crate::event::{ConversationMessage, StreamEvent};
use crate::present::{ExpandState, TurnRender, present};
use crate::segment::{SegmentConfig, Turn, TurnKey, segment};
use chrono::{DateTime, Utc};

/// Messages, events and view state of one conversation.
///
/// Turns and render models are derived on demand from the recorded
/// snapshot; nothing is updated incrementally.
#[derive(Debug, Clone, Default)]
pub struct ConversationContext {
    messages: Vec<ConversationMessage>,
    events: Vec<StreamEvent>,
    expand: ExpandState,
    config: SegmentConfig,
    run_in_flight: bool,
}

impl ConversationContext {
    pub fn new(config: SegmentConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn push_user_message(&mut self, text: impl Into<String>) -> &ConversationMessage {
        self.push_user_message_at(text, Utc::now())
    }

    pub fn push_user_message_at(
        &mut self,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> &ConversationMessage {
        self.messages.push(ConversationMessage::user(text, timestamp));
        &self.messages[self.messages.len() - 1]
    }

    /// Mark a run as streaming into the current turn.
    pub fn begin_run(&mut self) {
        self.run_in_flight = true;
    }

    pub fn record_event(&mut self, event: StreamEvent) {
        self.events.push(event);
    }

    /// Close the run; a non-empty answer is persisted as an assistant message.
    pub fn record_final(&mut self, final_text: Option<String>) {
        self.record_final_at(final_text, Utc::now());
    }

    pub fn record_final_at(&mut self, final_text: Option<String>, timestamp: DateTime<Utc>) {
        self.run_in_flight = false;
        if let Some(text) = final_text.filter(|text| !text.trim().is_empty()) {
            self.messages
                .push(ConversationMessage::assistant(text, timestamp));
        }
    }

    /// Close the run after a failure. The error itself arrives as an event.
    pub fn record_failure(&mut self) {
        self.run_in_flight = false;
    }

    pub fn turns(&self) -> Vec<Turn<'_>> {
        segment(&self.events, &self.messages, &self.config)
    }

    /// Render models of every visible turn, oldest first.
    pub fn render(&self) -> Vec<TurnRender> {
        self.turns()
            .iter()
            .filter_map(|turn| present(turn, self.is_live(turn), &self.expand))
            .collect()
    }

    pub fn current_render(&self) -> Option<TurnRender> {
        let turns = self.turns();
        let turn = turns.last()?;
        present(turn, self.is_live(turn), &self.expand)
    }

    /// Flip the expand state of the turn with `key`; `None` when no such
    /// turn exists.
    pub fn toggle(&mut self, key: &TurnKey) -> Option<bool> {
        let (live, has_final) = self
            .turns()
            .iter()
            .find(|turn| &turn.key == key)
            .map(|turn| (self.is_live(turn), turn.has_final()))?;
        Some(self.expand.toggle(key, live, has_final))
    }

    /// Start a new conversation.
    pub fn reset(&mut self) {
        self.messages.clear();
        self.events.clear();
        self.expand.clear();
        self.run_in_flight = false;
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    pub fn events(&self) -> &[StreamEvent] {
        &self.events
    }

    pub fn is_run_in_flight(&self) -> bool {
        self.run_in_flight
    }

    pub fn segment_config(&self) -> &SegmentConfig {
        &self.config
    }

    fn is_live(&self, turn: &Turn<'_>) -> bool {
        self.run_in_flight && turn.is_live()
    }
}
