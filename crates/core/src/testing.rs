use crate::event::{ConversationMessage, EventKind, Payload, StreamEvent, TodoItem, TodoStatus};
use chrono::{DateTime, Duration, TimeZone, Utc};

/// Fixed epoch for deterministic timelines (2026-01-05T09:00:00Z).
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap()
}

/// `base_time()` shifted by `ms` milliseconds (may be negative).
pub fn at(ms: i64) -> DateTime<Utc> {
    base_time() + Duration::milliseconds(ms)
}

/// User message anchored at `ms`.
pub fn user(id: &str, ms: i64, text: &str) -> ConversationMessage {
    ConversationMessage {
        id: id.to_string(),
        ..ConversationMessage::user(text, at(ms))
    }
}

/// Assistant (final answer) message at `ms`.
pub fn assistant(id: &str, ms: i64, text: &str) -> ConversationMessage {
    ConversationMessage {
        id: id.to_string(),
        ..ConversationMessage::assistant(text, at(ms))
    }
}

/// Narration event.
pub fn message(ms: i64, text: &str) -> StreamEvent {
    StreamEvent::new(EventKind::Message, at(ms))
        .with_id(format!("msg-{}", next_id()))
        .with_content(text)
}

/// Log event carrying a single todo entry.
pub fn todo(ms: i64, text: &str) -> StreamEvent {
    StreamEvent::new(EventKind::Log, at(ms))
        .with_id(format!("todo-{}", next_id()))
        .with_display(format!("Todo: {text}"))
        .with_payload(Payload::TodoUpdate {
            todos: vec![TodoItem {
                content: text.to_string(),
                status: TodoStatus::Pending,
            }],
        })
}

/// Plain log event.
pub fn log(ms: i64, display: &str) -> StreamEvent {
    StreamEvent::new(EventKind::Log, at(ms))
        .with_id(format!("log-{}", next_id()))
        .with_display(display)
}

/// Terminal answer event.
pub fn final_response(ms: i64, text: &str) -> StreamEvent {
    StreamEvent::new(EventKind::FinalResponse, at(ms))
        .with_id(format!("final-{}", next_id()))
        .with_content(text)
}

fn next_id() -> u32 {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}
