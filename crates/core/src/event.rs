use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value, json};

/// Kind of a stream event after transport-level filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Connection,
    Log,
    Message,
    FinalResponse,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Log => "log",
            Self::Message => "message",
            Self::FinalResponse => "final_response",
        }
    }
}

/// One parsed record of an agent run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Unique identifier, generated client-side when the record has none
    pub id: String,
    pub kind: EventKind,
    /// When the event was observed locally
    pub timestamp: DateTime<Utc>,
    /// Emission time claimed by the server, informational only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_timestamp: Option<DateTime<Utc>>,
    /// Short human-readable summary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
    /// Complete narration text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_content: Option<String>,
    #[serde(default, skip_serializing_if = "Payload::is_empty")]
    pub payload: Payload,
}

impl StreamEvent {
    pub fn new(kind: EventKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: new_event_id(),
            kind,
            timestamp,
            server_timestamp: None,
            display: None,
            full_content: None,
            payload: Payload::Empty,
        }
    }

    /// Synthetic log event standing in for a transport failure.
    pub fn error(
        error_kind: impl Into<String>,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let message = message.into();
        Self {
            display: Some(message.clone()),
            payload: Payload::Error {
                error_kind: error_kind.into(),
                message,
            },
            ..Self::new(EventKind::Log, timestamp)
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_display(mut self, display: impl Into<String>) -> Self {
        self.display = Some(display.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.full_content = Some(content.into());
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// Narration text carried by a `message` event, if any.
    pub fn narration(&self) -> Option<&str> {
        if self.kind != EventKind::Message {
            return None;
        }
        self.full_content
            .as_deref()
            .filter(|text| !text.trim().is_empty())
    }

    pub fn is_final(&self) -> bool {
        self.kind == EventKind::FinalResponse
    }

    /// Error message when this is a (synthetic or server) error log.
    pub fn error_message(&self) -> Option<&str> {
        match &self.payload {
            Payload::Error { message, .. } if self.kind == EventKind::Log => Some(message.as_str()),
            _ => None,
        }
    }
}

pub fn new_event_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Status of one todo entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

impl TodoStatus {
    fn parse(raw: &str) -> Self {
        match normalize_tag(raw).as_str() {
            "in_progress" | "active" | "running" => Self::InProgress,
            "completed" | "complete" | "done" => Self::Completed,
            _ => Self::Pending,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub content: String,
    #[serde(default)]
    pub status: TodoStatus,
}

/// A file produced by the run. Opaque: only named, never opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
}

/// Structured data riding on an event, keyed by its `type` discriminant.
///
/// Records the client does not recognise are kept verbatim in `Unknown`.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    ToolUse {
        tool_name: String,
        input: Value,
    },
    TodoUpdate {
        todos: Vec<TodoItem>,
    },
    Attachments {
        files: Vec<Attachment>,
    },
    Session {
        session_id: String,
    },
    Error {
        error_kind: String,
        message: String,
    },
    #[default]
    Empty,
    Unknown(Value),
}

const TODO_TOOL_NAMES: &[&str] = &["todowrite", "todo_write", "todos", "update_todos"];

impl Payload {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Classify a loosely-shaped JSON payload.
    pub fn classify(value: Value) -> Self {
        let map = match value {
            Value::Null => return Self::Empty,
            Value::Object(map) if map.is_empty() => return Self::Empty,
            Value::Object(map) => map,
            other => return Self::Unknown(other),
        };

        let tag = map
            .get("type")
            .or_else(|| map.get("kind"))
            .and_then(Value::as_str)
            .map(normalize_tag);

        let parsed = match tag.as_deref() {
            Some("tool_use") | Some("tool_call") => parse_tool_use(&map),
            Some("todo_update") | Some("todos") | Some("todo") => parse_todos(&map),
            Some("attachments") | Some("attachment") | Some("files") => parse_attachments(&map),
            Some("session") => parse_session(&map),
            Some("error") => parse_error(&map),
            Some(_) => None,
            None => classify_by_shape(&map),
        };
        parsed.unwrap_or(Self::Unknown(Value::Object(map)))
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::ToolUse { tool_name, input } => {
                json!({ "type": "tool_use", "tool_name": tool_name, "input": input })
            }
            Self::TodoUpdate { todos } => json!({ "type": "todo_update", "todos": todos }),
            Self::Attachments { files } => json!({ "type": "attachments", "files": files }),
            Self::Session { session_id } => json!({ "type": "session", "session_id": session_id }),
            Self::Error {
                error_kind,
                message,
            } => json!({ "type": "error", "error_kind": error_kind, "message": message }),
            Self::Empty => Value::Null,
            Self::Unknown(value) => value.clone(),
        }
    }

    /// Todo entries carried by this payload, including todo-writing tool calls.
    pub fn todos(&self) -> Option<Vec<TodoItem>> {
        match self {
            Self::TodoUpdate { todos } => Some(todos.clone()),
            Self::ToolUse { tool_name, input } => {
                let name = normalize_tag(tool_name);
                if !TODO_TOOL_NAMES.contains(&name.as_str()) {
                    return None;
                }
                input.as_object().and_then(parse_todo_list)
            }
            _ => None,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Session { session_id } => Some(session_id.as_str()),
            Self::Unknown(Value::Object(map)) => map.get("session_id").and_then(Value::as_str),
            _ => None,
        }
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::classify)
    }
}

fn normalize_tag(raw: &str) -> String {
    raw.trim()
        .to_ascii_lowercase()
        .replace(['-', ' ', '.'], "_")
}

fn classify_by_shape(map: &Map<String, Value>) -> Option<Payload> {
    if map.contains_key("todos") || map.contains_key("todo") {
        return parse_todos(map);
    }
    if map.contains_key("attachments") || map.contains_key("files") {
        return parse_attachments(map);
    }
    if map.contains_key("tool_name") {
        return parse_tool_use(map);
    }
    if map.len() == 1 && map.contains_key("session_id") {
        return parse_session(map);
    }
    None
}

fn parse_tool_use(map: &Map<String, Value>) -> Option<Payload> {
    let tool_name = map
        .get("tool_name")
        .or_else(|| map.get("name"))
        .and_then(Value::as_str)?
        .to_string();
    let input = map
        .get("input")
        .or_else(|| map.get("tool_input"))
        .cloned()
        .unwrap_or(Value::Null);
    Some(Payload::ToolUse { tool_name, input })
}

fn parse_todos(map: &Map<String, Value>) -> Option<Payload> {
    parse_todo_list(map).map(|todos| Payload::TodoUpdate { todos })
}

fn parse_todo_list(map: &Map<String, Value>) -> Option<Vec<TodoItem>> {
    if let Some(single) = map.get("todo").and_then(Value::as_str) {
        return Some(vec![TodoItem {
            content: single.to_string(),
            status: map
                .get("status")
                .and_then(Value::as_str)
                .map(TodoStatus::parse)
                .unwrap_or_default(),
        }]);
    }
    let entries = map
        .get("todos")
        .or_else(|| map.get("items"))
        .and_then(Value::as_array)?;
    let todos = entries.iter().filter_map(parse_todo_entry).collect();
    Some(todos)
}

fn parse_todo_entry(entry: &Value) -> Option<TodoItem> {
    match entry {
        Value::String(text) => Some(TodoItem {
            content: text.clone(),
            status: TodoStatus::Pending,
        }),
        Value::Object(obj) => {
            let content = ["content", "text", "title", "task"]
                .iter()
                .find_map(|key| obj.get(*key).and_then(Value::as_str))?;
            let status = obj
                .get("status")
                .and_then(Value::as_str)
                .map(TodoStatus::parse)
                .unwrap_or_default();
            Some(TodoItem {
                content: content.to_string(),
                status,
            })
        }
        _ => None,
    }
}

fn parse_attachments(map: &Map<String, Value>) -> Option<Payload> {
    let entries = map
        .get("files")
        .or_else(|| map.get("attachments"))
        .and_then(Value::as_array)?;
    let files = entries.iter().filter_map(parse_attachment).collect();
    Some(Payload::Attachments { files })
}

fn parse_attachment(entry: &Value) -> Option<Attachment> {
    match entry {
        Value::String(path) => Some(Attachment {
            name: file_name(path),
            path: path.clone(),
            mime: None,
        }),
        Value::Object(obj) => {
            let path = ["path", "url", "file_path"]
                .iter()
                .find_map(|key| obj.get(*key).and_then(Value::as_str))?
                .to_string();
            let name = ["name", "filename", "display_name"]
                .iter()
                .find_map(|key| obj.get(*key).and_then(Value::as_str))
                .map(str::to_string)
                .unwrap_or_else(|| file_name(&path));
            let mime = ["mime", "mime_type", "content_type"]
                .iter()
                .find_map(|key| obj.get(*key).and_then(Value::as_str))
                .map(str::to_string);
            Some(Attachment { name, path, mime })
        }
        _ => None,
    }
}

fn file_name(path: &str) -> String {
    path.rsplit(['/', '\\'])
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or(path)
        .to_string()
}

fn parse_session(map: &Map<String, Value>) -> Option<Payload> {
    let session_id = map.get("session_id").and_then(Value::as_str)?;
    Some(Payload::Session {
        session_id: session_id.to_string(),
    })
}

fn parse_error(map: &Map<String, Value>) -> Option<Payload> {
    let message = map
        .get("message")
        .or_else(|| map.get("error"))
        .and_then(Value::as_str)?
        .to_string();
    let error_kind = map
        .get("error_kind")
        .and_then(Value::as_str)
        .unwrap_or("server")
        .to_string();
    Some(Payload::Error {
        error_kind,
        message,
    })
}

/// Author of a persisted conversation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// A persisted message. Assistant messages only ever hold the final answer
/// of a closed turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationMessage {
    pub fn user(content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: new_event_id(),
            role: Role::User,
            content: content.into(),
            timestamp,
        }
    }

    pub fn assistant(content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: new_event_id(),
            role: Role::Assistant,
            content: content.into(),
            timestamp,
        }
    }

    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }
}
