//! Turn render models: primary narration, sub-tasks and expand state.

use crate::event::{Attachment, EventKind, Payload, StreamEvent, TodoStatus};
use crate::sanitize::sanitize_narration;
use crate::segment::{Turn, TurnKey};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::LazyLock;

static TODO_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:todo|to-do|task|action item)s?\s*[:\-–]\s*(.+)$").unwrap()
});

static CHECKBOX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\[[ xX]\]|☐|☑|✅|✓)\s*(.+)$").unwrap());

/// One visible line of narration within a turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NarrationItem {
    pub event_id: String,
    pub text: String,
    pub is_todo: bool,
    pub is_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub todo_status: Option<TodoStatus>,
    pub timestamp: DateTime<Utc>,
}

impl NarrationItem {
    fn narration(event: &StreamEvent, text: &str) -> Self {
        Self {
            event_id: event.id.clone(),
            text: text.to_string(),
            is_todo: false,
            is_error: false,
            todo_status: None,
            timestamp: event.timestamp,
        }
    }

    fn error(event: &StreamEvent, message: &str) -> Self {
        Self {
            is_error: true,
            ..Self::narration(event, message)
        }
    }

    fn todo(event_id: String, event: &StreamEvent, text: &str, status: TodoStatus) -> Self {
        Self {
            event_id,
            text: text.to_string(),
            is_todo: true,
            is_error: false,
            todo_status: Some(status),
            timestamp: event.timestamp,
        }
    }
}

/// Everything a display layer needs to draw one turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnRender {
    pub key: TurnKey,
    pub primary: Option<NarrationItem>,
    pub subtasks: Vec<NarrationItem>,
    pub has_final: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_text: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    pub live: bool,
    pub expanded: bool,
}

/// Per-turn expand/collapse overrides, keyed by [`TurnKey`].
#[derive(Debug, Clone, Default)]
pub struct ExpandState {
    overrides: HashMap<TurnKey, bool>,
}

impl ExpandState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expanded while the turn is live or unanswered; afterwards the last
    /// explicit toggle wins, collapsed when there is none.
    pub fn is_expanded(&self, key: &TurnKey, live: bool, has_final: bool) -> bool {
        if live || !has_final {
            return true;
        }
        self.overrides.get(key).copied().unwrap_or(false)
    }

    pub fn set(&mut self, key: TurnKey, expanded: bool) {
        self.overrides.insert(key, expanded);
    }

    /// Flip the visible state and return the new one.
    pub fn toggle(&mut self, key: &TurnKey, live: bool, has_final: bool) -> bool {
        let next = !self.is_expanded(key, live, has_final);
        self.overrides.insert(key.clone(), next);
        next
    }

    pub fn clear(&mut self) {
        self.overrides.clear();
    }
}

/// Build the render model for `turn`, or `None` when nothing is visible.
pub fn present(turn: &Turn<'_>, live: bool, expand: &ExpandState) -> Option<TurnRender> {
    let final_event = turn.final_event();
    let mut narration = Vec::new();
    let mut todos: Vec<NarrationItem> = Vec::new();
    let mut todo_index: HashMap<String, usize> = HashMap::new();

    for event in turn.events.iter().copied() {
        if event.is_final() {
            continue;
        }
        if let Some(text) = event.narration() {
            narration.push(NarrationItem::narration(event, text));
            continue;
        }
        if event.kind != EventKind::Log {
            continue;
        }
        if let Some(message) = event.error_message() {
            narration.push(NarrationItem::error(event, message));
            continue;
        }
        for (idx, (text, status)) in todo_entries(event).into_iter().enumerate() {
            let norm = normalize_todo(&text);
            if norm.is_empty() {
                continue;
            }
            match todo_index.get(&norm).copied() {
                // Re-emitted todo: keep the first position, refresh status.
                Some(pos) => todos[pos].todo_status = Some(status),
                None => {
                    todo_index.insert(norm, todos.len());
                    let id = format!("{}#{idx}", event.id);
                    todos.push(NarrationItem::todo(id, event, &text, status));
                }
            }
        }
    }

    // Items that sanitize to nothing are gone before primary selection and
    // final-predecessor suppression see them.
    let mut narration: Vec<NarrationItem> = narration.into_iter().filter_map(sanitized).collect();
    if let Some(final_event) = final_event {
        suppress_final_predecessor(&mut narration, final_event.timestamp);
    }

    let mut items = narration.into_iter();
    let primary = items.next();
    let subtasks: Vec<NarrationItem> = items
        .chain(todos.into_iter().filter_map(sanitized))
        .collect();

    if primary.is_none() && subtasks.is_empty() {
        return None;
    }

    let has_final = turn.has_final();
    let final_text = final_event
        .and_then(|event| event.full_content.clone().or_else(|| event.display.clone()))
        .or_else(|| turn.answer.map(|answer| answer.content.clone()));

    Some(TurnRender {
        key: turn.key.clone(),
        primary,
        subtasks,
        has_final,
        final_text,
        attachments: collect_attachments(&turn.events),
        live,
        expanded: expand.is_expanded(&turn.key, live, has_final),
    })
}

/// Drop the last assistant narration preceding the final answer, unless it
/// is the headline item.
fn suppress_final_predecessor(narration: &mut Vec<NarrationItem>, final_at: DateTime<Utc>) {
    let predecessor = narration
        .iter()
        .rposition(|item| !item.is_error && item.timestamp <= final_at);
    if let Some(pos) = predecessor {
        if pos > 0 {
            narration.remove(pos);
        }
    }
}

fn sanitized(mut item: NarrationItem) -> Option<NarrationItem> {
    item.text = sanitize_narration(&item.text);
    (!item.text.is_empty()).then_some(item)
}

/// Todo entries carried by a log event, from its payload or display text.
fn todo_entries(event: &StreamEvent) -> Vec<(String, TodoStatus)> {
    if let Some(todos) = event.payload.todos() {
        return todos
            .into_iter()
            .map(|todo| (todo.content, todo.status))
            .collect();
    }
    if !matches!(event.payload, Payload::Empty | Payload::Unknown(_)) {
        return Vec::new();
    }
    event
        .display
        .as_deref()
        .and_then(todo_from_display)
        .into_iter()
        .collect()
}

fn todo_from_display(display: &str) -> Option<(String, TodoStatus)> {
    if let Some(caps) = TODO_PREFIX_RE.captures(display) {
        return Some((caps[1].trim().to_string(), TodoStatus::Pending));
    }
    let caps = CHECKBOX_RE.captures(display)?;
    let status = match &caps[1] {
        "[ ]" | "☐" => TodoStatus::Pending,
        _ => TodoStatus::Completed,
    };
    Some((caps[2].trim().to_string(), status))
}

fn normalize_todo(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(['.', '!', ':', ';'])
        .to_lowercase()
}

fn collect_attachments(events: &[&StreamEvent]) -> Vec<Attachment> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for event in events {
        if let Payload::Attachments { files } = &event.payload {
            for file in files {
                if seen.insert(file.path.clone()) {
                    out.push(file.clone());
                }
            }
        }
    }
    out
}
