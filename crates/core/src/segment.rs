//! Turn segmentation over a flat event timeline.
//!
//! Event timestamps are observed locally, not assigned by the server, so a
//! run that is still emitting trailing narration can overlap the next user
//! message by a few hundred milliseconds. Ownership of every event is
//! decided by [`owner_of`], which keeps each event in at most one turn.

use crate::event::{ConversationMessage, Role, StreamEvent};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Windows used to attribute events around a user message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentConfig {
    /// Events up to this long before the anchor may still belong to it.
    pub tolerance: Duration,
    /// Events further than this before the anchor always belong to the
    /// previous turn.
    pub guard: Duration,
}

/// Longest window accepted by [`SegmentConfig::from_millis`] (one day).
pub const MAX_WINDOW_MS: u64 = 86_400_000;

impl SegmentConfig {
    /// Windows longer than [`MAX_WINDOW_MS`] are clamped to it.
    pub fn from_millis(tolerance_ms: u64, guard_ms: u64) -> Self {
        let window = |ms: u64| Duration::milliseconds(ms.min(MAX_WINDOW_MS) as i64);
        Self {
            tolerance: window(tolerance_ms),
            guard: window(guard_ms),
        }
    }
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self::from_millis(1_000, 5_000)
    }
}

/// Stable key of a turn, derived from its anchoring user message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TurnKey(String);

impl TurnKey {
    pub fn for_anchor(anchor: &ConversationMessage) -> Self {
        Self(format!("turn:{}", anchor.id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// All events produced in response to one user message.
#[derive(Debug, Clone)]
pub struct Turn<'a> {
    pub key: TurnKey,
    pub index: usize,
    pub anchor: &'a ConversationMessage,
    /// Owned events in non-decreasing timestamp order.
    pub events: Vec<&'a StreamEvent>,
    /// Persisted final answer, when the conversation history has one.
    pub answer: Option<&'a ConversationMessage>,
    /// Anchored to the most recent user message.
    pub is_current: bool,
}

impl<'a> Turn<'a> {
    pub fn final_event(&self) -> Option<&'a StreamEvent> {
        self.events.iter().copied().find(|event| event.is_final())
    }

    pub fn has_final(&self) -> bool {
        self.final_event().is_some() || self.answer.is_some()
    }

    /// Still streaming: the current turn until its final answer arrives.
    pub fn is_live(&self) -> bool {
        self.is_current && !self.has_final()
    }
}

/// Partition `events` into turns anchored on the user messages.
pub fn segment<'a>(
    events: &'a [StreamEvent],
    messages: &'a [ConversationMessage],
    config: &SegmentConfig,
) -> Vec<Turn<'a>> {
    let anchors = sorted_anchors(messages);
    if anchors.is_empty() {
        return Vec::new();
    }

    let mut ordered: Vec<&StreamEvent> = events.iter().collect();
    ordered.sort_by_key(|event| event.timestamp);

    let closed_at: Vec<Option<DateTime<Utc>>> = (0..anchors.len())
        .map(|idx| closing_time(&ordered, &anchors, idx))
        .collect();

    let mut owned: Vec<Vec<&StreamEvent>> = vec![Vec::new(); anchors.len()];
    for event in ordered {
        if let Some(owner) = owner_of(event, &anchors, &closed_at, config) {
            owned[owner].push(event);
        }
    }

    let last = anchors.len() - 1;
    anchors
        .iter()
        .copied()
        .zip(owned)
        .enumerate()
        .map(|(index, (anchor, events))| Turn {
            key: TurnKey::for_anchor(anchor),
            index,
            anchor,
            events,
            answer: persisted_answer(messages, &anchors, index),
            is_current: index == last,
        })
        .collect()
}

/// Events owned by the turn anchored on `anchor_id`, in timestamp order.
pub fn turn_events<'a>(
    events: &'a [StreamEvent],
    messages: &'a [ConversationMessage],
    anchor_id: &str,
    config: &SegmentConfig,
) -> Vec<&'a StreamEvent> {
    segment(events, messages, config)
        .into_iter()
        .find(|turn| turn.anchor.id == anchor_id)
        .map(|turn| turn.events)
        .unwrap_or_default()
}

/// The turn anchored on the most recent user message.
pub fn current_turn<'a>(
    events: &'a [StreamEvent],
    messages: &'a [ConversationMessage],
    config: &SegmentConfig,
) -> Option<Turn<'a>> {
    segment(events, messages, config).pop()
}

fn sorted_anchors(messages: &[ConversationMessage]) -> Vec<&ConversationMessage> {
    let mut anchors: Vec<&ConversationMessage> =
        messages.iter().filter(|msg| msg.is_user()).collect();
    anchors.sort_by_key(|msg| msg.timestamp);
    anchors
}

/// Timestamp of the first final_response between anchor `idx` and the next
/// anchor. Finals in that span can only belong to turn `idx`.
fn closing_time(
    ordered: &[&StreamEvent],
    anchors: &[&ConversationMessage],
    idx: usize,
) -> Option<DateTime<Utc>> {
    let start = anchors[idx].timestamp;
    let end = anchors.get(idx + 1).map(|next| next.timestamp);
    ordered
        .iter()
        .filter(|event| event.is_final())
        .map(|event| event.timestamp)
        .find(|ts| *ts >= start && end.is_none_or(|end| *ts < end))
}

/// Index of the turn that owns `event`, if any.
fn owner_of(
    event: &StreamEvent,
    anchors: &[&ConversationMessage],
    closed_at: &[Option<DateTime<Utc>>],
    config: &SegmentConfig,
) -> Option<usize> {
    let ts = event.timestamp;
    let idx = anchors
        .iter()
        .rposition(|anchor| window_start(anchor.timestamp, config.tolerance) <= ts)?;
    let anchor_ts = anchors[idx].timestamp;
    if ts >= anchor_ts || idx == 0 {
        return Some(idx);
    }

    // Inside the tolerance window of anchor `idx` while a previous turn exists.
    let previous = idx - 1;
    let fallback =
        (ts >= window_start(anchors[previous].timestamp, config.tolerance)).then_some(previous);
    if anchor_ts - ts > config.guard {
        return fallback;
    }
    // A final answer never precedes its own question.
    if event.is_final() {
        return fallback;
    }
    match closed_at[previous] {
        Some(closed) if closed <= ts => Some(idx),
        _ => fallback,
    }
}

/// `at - window`, saturating at the earliest representable instant.
fn window_start(at: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    at.checked_sub_signed(window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn persisted_answer<'a>(
    messages: &'a [ConversationMessage],
    anchors: &[&ConversationMessage],
    idx: usize,
) -> Option<&'a ConversationMessage> {
    let start = anchors[idx].timestamp;
    let end = anchors.get(idx + 1).map(|next| next.timestamp);
    messages.iter().find(|msg| {
        msg.role == Role::Assistant
            && msg.timestamp >= start
            && end.is_none_or(|end| msg.timestamp < end)
    })
}
