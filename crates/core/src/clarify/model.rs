use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// How a question's options may be picked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorKind {
    SingleSelect,
    MultiSelect,
    /// Informational: nothing to pick, submitting acknowledges it
    None,
}

impl SelectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SingleSelect => "single_select",
            Self::MultiSelect => "multi_select",
            Self::None => "none",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorMetadata {
    pub kind: SelectorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

impl SelectorMetadata {
    pub fn new(kind: SelectorKind) -> Self {
        Self {
            kind,
            style: None,
            raw: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationOption {
    pub value: String,
    pub display_value: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<String>,
}

impl ClarificationOption {
    pub fn new(value: impl Into<String>, display_value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            display_value: display_value.into(),
            links: Vec::new(),
        }
    }
}

/// One ambiguity to resolve before the query is issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationQuestion {
    pub question_id: String,
    #[serde(rename = "clarification_question", alias = "question_text")]
    pub question_text: String,
    pub selector: SelectorMetadata,
    #[serde(default)]
    pub options: Vec<ClarificationOption>,
    /// System defaults for this question, keyed by dimension
    #[serde(default, deserialize_with = "string_map")]
    pub defaults_applied: BTreeMap<String, String>,
    #[serde(default)]
    pub context_tags: Vec<String>,
    #[serde(default)]
    pub reason: String,
}

impl ClarificationQuestion {
    /// Keys of `resolved_context` this question writes to.
    pub fn dimension_keys(&self) -> Vec<String> {
        if self.context_tags.is_empty() {
            vec![self.question_id.clone()]
        } else {
            self.context_tags.clone()
        }
    }

    /// Human-readable form of a selected value: the option's display value
    /// when `raw` names an option, `raw` itself otherwise.
    pub fn display_for(&self, raw: &str) -> String {
        self.options
            .iter()
            .find(|opt| opt.value == raw || opt.display_value == raw)
            .map(|opt| opt.display_value.clone())
            .unwrap_or_else(|| raw.to_string())
    }
}

/// Input to an evaluation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationRequest {
    pub user_query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_hint: Option<String>,
    #[serde(default, deserialize_with = "string_map")]
    pub already_provided: BTreeMap<String, String>,
}

impl ClarificationRequest {
    pub fn new(user_query: impl Into<String>) -> Self {
        Self {
            user_query: user_query.into(),
            ..Self::default()
        }
    }
}

/// Result of evaluating a query against the catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationResponse {
    pub user_query: String,
    #[serde(default)]
    pub suggestions: Vec<ClarificationQuestion>,
    #[serde(default, deserialize_with = "string_map")]
    pub auto_applied: BTreeMap<String, String>,
    pub evaluated_at: DateTime<Utc>,
    #[serde(default)]
    pub matched_question_ids: Vec<String>,
}

/// One answered question, as sent to the clarification service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationAnswer {
    pub question_id: String,
    pub selected_values: Vec<String>,
}

/// Accept any scalar values in a string map; nulls are dropped.
pub(crate) fn string_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw
        .into_iter()
        .filter_map(|(key, value)| scalar_text(&value).map(|text| (key, text)))
        .collect())
}

pub(crate) fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}
