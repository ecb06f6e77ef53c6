//! Mapping of decoded SSE records onto stream events.

use crate::sse::SseRecord;
use chrono::{DateTime, Utc};
use opsdesk_core::{EventKind, Payload, StreamEvent, new_event_id};
use serde_json::{Map, Value};

/// What a single wire record means to the run.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Classified {
    Event(StreamEvent),
    /// The final answer: emitted as an event, then the run completes.
    Terminal {
        event: StreamEvent,
        final_text: Option<String>,
        session_id: Option<String>,
    },
    /// Transport noise that never reaches the presenter.
    Filtered(&'static str),
    /// The server reported a failure of the run.
    ServerError(String),
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum WireError {
    #[error("record data is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("record data is not a JSON object")]
    NotObject,
}

pub(crate) fn classify(
    record: &SseRecord,
    received_at: DateTime<Utc>,
) -> Result<Classified, WireError> {
    let data = record.data.trim();
    if data == "[DONE]" {
        return Ok(Classified::Filtered("completion"));
    }
    let map = if data.is_empty() {
        Map::new()
    } else {
        match serde_json::from_str::<Value>(data)? {
            Value::Object(map) => map,
            _ => return Err(WireError::NotObject),
        }
    };

    let record_type = text(&map, &["type"])
        .or_else(|| record.event.clone())
        .map(|name| name.trim().to_ascii_lowercase().replace('-', "_"))
        .unwrap_or_else(|| "message".to_string());

    let kind = match record_type.as_str() {
        "connection" => EventKind::Connection,
        "log" => EventKind::Log,
        "message" => EventKind::Message,
        "final_response" => EventKind::FinalResponse,
        "user" | "user_message" | "echo" => return Ok(Classified::Filtered("echo")),
        "complete" | "completed" | "done" | "run_completed" => {
            return Ok(Classified::Filtered("completion"));
        }
        "error" => return Ok(Classified::ServerError(error_message(&map))),
        _ => EventKind::Log,
    };

    let event = build_event(kind, &map, record, received_at);
    if kind != EventKind::FinalResponse {
        return Ok(Classified::Event(event));
    }

    let session_id = text(&map, &["session_id"])
        .or_else(|| event.payload.session_id().map(str::to_string));
    let final_text = event
        .full_content
        .clone()
        .filter(|content| !content.trim().is_empty());
    Ok(Classified::Terminal {
        event,
        final_text,
        session_id,
    })
}

fn build_event(
    kind: EventKind,
    map: &Map<String, Value>,
    record: &SseRecord,
    received_at: DateTime<Utc>,
) -> StreamEvent {
    let mut event = StreamEvent::new(kind, received_at);
    event.id = scalar(map.get("id"))
        .or_else(|| record.id.clone())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(new_event_id);
    event.server_timestamp = map.get("timestamp").and_then(parse_timestamp);
    event.display = text(map, &["display", "message"]);
    event.full_content = text(map, &["full_content", "content"]);
    if event.full_content.is_none() {
        event.full_content = match kind {
            EventKind::FinalResponse => text(map, &["result"]),
            // Short-form narration: `{"type":"message","message":"..."}`
            EventKind::Message => text(map, &["message"]),
            _ => None,
        };
    }
    let payload = map
        .get("payload")
        .or_else(|| map.get("data"))
        .cloned()
        .unwrap_or(Value::Null);
    event.payload = Payload::classify(payload);
    event
}

fn error_message(map: &Map<String, Value>) -> String {
    let nested = map
        .get("error")
        .and_then(Value::as_object)
        .and_then(|error| text(error, &["message"]));
    nested
        .or_else(|| text(map, &["error", "message", "display", "content"]))
        .unwrap_or_else(|| "the server reported an error".to_string())
}

fn text(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| map.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

fn scalar(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// RFC 3339 strings, or epoch seconds as emitted by `time.time()`-style clocks.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(raw) => DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        Value::Number(n) => {
            let secs = n.as_f64()?;
            DateTime::from_timestamp_millis((secs * 1000.0).round() as i64)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsdesk_core::testing::base_time;

    fn record(event: Option<&str>, data: &str) -> SseRecord {
        SseRecord {
            event: event.map(str::to_string),
            data: data.to_string(),
            id: None,
        }
    }

    fn event_of(classified: Classified) -> StreamEvent {
        match classified {
            Classified::Event(event) => event,
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn test_type_field_wins_over_event_name() {
        let out = classify(
            &record(
                Some("log"),
                r#"{"type":"message","id":"m1","full_content":"Looking up sales","timestamp":"2025-03-01T10:00:00Z"}"#,
            ),
            base_time(),
        )
        .unwrap();
        let event = event_of(out);
        assert_eq!(event.kind, EventKind::Message);
        assert_eq!(event.id, "m1");
        assert_eq!(event.timestamp, base_time());
        assert!(event.server_timestamp.is_some());
        assert_eq!(event.narration(), Some("Looking up sales"));
    }

    #[test]
    fn test_message_text_is_narration_without_content() {
        let event = event_of(
            classify(
                &record(None, r#"{"type":"message","message":"Looking up sales"}"#),
                base_time(),
            )
            .unwrap(),
        );
        assert_eq!(event.kind, EventKind::Message);
        assert_eq!(event.display.as_deref(), Some("Looking up sales"));
        assert_eq!(event.narration(), Some("Looking up sales"));

        let event = event_of(
            classify(
                &record(
                    None,
                    r#"{"type":"message","message":"Working","full_content":"Comparing vendors"}"#,
                ),
                base_time(),
            )
            .unwrap(),
        );
        assert_eq!(event.narration(), Some("Comparing vendors"));

        let event = event_of(
            classify(&record(Some("log"), r#"{"message":"connected"}"#), base_time()).unwrap(),
        );
        assert!(event.full_content.is_none());
    }

    #[test]
    fn test_event_name_fallback_and_aliases() {
        let event = event_of(
            classify(
                &record(
                    Some("log"),
                    r#"{"message":"Running saved search","data":{"type":"tool_use","tool_name":"netsuite_query","input":{}}}"#,
                ),
                base_time(),
            )
            .unwrap(),
        );
        assert_eq!(event.kind, EventKind::Log);
        assert_eq!(event.display.as_deref(), Some("Running saved search"));
        assert!(matches!(event.payload, Payload::ToolUse { .. }));
        assert!(!event.id.is_empty());
    }

    #[test]
    fn test_final_response_is_terminal() {
        let out = classify(
            &record(
                Some("final_response"),
                r#"{"content":"Net sales: 120 units","session_id":"sess-9"}"#,
            ),
            base_time(),
        )
        .unwrap();
        match out {
            Classified::Terminal {
                event,
                final_text,
                session_id,
            } => {
                assert!(event.is_final());
                assert_eq!(final_text.as_deref(), Some("Net sales: 120 units"));
                assert_eq!(session_id.as_deref(), Some("sess-9"));
            }
            other => panic!("expected terminal, got {other:?}"),
        }

        let out = classify(
            &record(
                None,
                r#"{"type":"final_response","result":"done","payload":{"session_id":"sess-10"}}"#,
            ),
            base_time(),
        )
        .unwrap();
        assert!(matches!(
            out,
            Classified::Terminal { final_text: Some(ref t), session_id: Some(ref s), .. }
                if t == "done" && s == "sess-10"
        ));
    }

    #[test]
    fn test_noise_is_filtered() {
        for (name, data) in [
            (Some("user"), r#"{"content":"reorder hoodies"}"#),
            (None, r#"{"type":"echo"}"#),
            (Some("complete"), ""),
            (Some("run-completed"), "{}"),
            (None, "[DONE]"),
        ] {
            let out = classify(&record(name, data), base_time()).unwrap();
            assert!(matches!(out, Classified::Filtered(_)), "{name:?} {data}");
        }
    }

    #[test]
    fn test_server_error_record() {
        let out = classify(
            &record(Some("error"), r#"{"error":{"message":"agent crashed"}}"#),
            base_time(),
        )
        .unwrap();
        assert_eq!(out, Classified::ServerError("agent crashed".to_string()));

        let out = classify(&record(Some("error"), ""), base_time()).unwrap();
        assert!(matches!(out, Classified::ServerError(_)));
    }

    #[test]
    fn test_unknown_type_becomes_log() {
        let event = event_of(
            classify(
                &record(Some("thinking"), r#"{"display":"Planning"}"#),
                base_time(),
            )
            .unwrap(),
        );
        assert_eq!(event.kind, EventKind::Log);
        assert_eq!(event.display.as_deref(), Some("Planning"));
    }

    #[test]
    fn test_malformed_data_is_an_error() {
        assert!(matches!(
            classify(&record(Some("message"), "{not json"), base_time()),
            Err(WireError::Json(_))
        ));
        assert!(matches!(
            classify(&record(Some("message"), "[1,2]"), base_time()),
            Err(WireError::NotObject)
        ));
    }

    #[test]
    fn test_epoch_timestamp() {
        let ts = parse_timestamp(&serde_json::json!(1_700_000_000.5)).unwrap();
        assert_eq!(ts.timestamp_millis(), 1_700_000_000_500);
        assert_eq!(parse_timestamp(&serde_json::json!(true)), None);
    }
}
