use super::model::{ClarificationQuestion, ClarificationResponse, SelectorKind, string_map};
use super::{ClarifyError, SelectorViolation, StateViolation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Pending,
    Ready,
}

/// Clarification state for one user query.
///
/// Transitions return a new session and leave `self` untouched, so a caller
/// always keeps a last-known-good snapshot. `status` is `Ready` exactly when
/// `pending` is empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationSession {
    pub session_id: String,
    pub original_query: String,
    /// System-chosen defaults already merged into `resolved_context`
    #[serde(default, deserialize_with = "string_map")]
    pub auto_applied: BTreeMap<String, String>,
    /// Raw selected values per answered question; empty for acknowledgments
    #[serde(default)]
    pub answers: BTreeMap<String, Vec<String>>,
    /// Unanswered questions; the first one is active
    #[serde(default)]
    pub pending: Vec<ClarificationQuestion>,
    #[serde(default)]
    pub matched_question_ids: Vec<String>,
    /// Human-readable values keyed by dimension
    #[serde(default, deserialize_with = "string_map")]
    pub resolved_context: BTreeMap<String, String>,
    #[serde(default)]
    pub status: SessionStatus,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl ClarificationSession {
    pub fn from_response(response: ClarificationResponse) -> Self {
        let mut session = Self {
            session_id: uuid::Uuid::new_v4().simple().to_string(),
            original_query: response.user_query,
            resolved_context: response.auto_applied.clone(),
            auto_applied: response.auto_applied,
            answers: BTreeMap::new(),
            pending: response.suggestions,
            matched_question_ids: response.matched_question_ids,
            status: SessionStatus::Pending,
            updated_at: response.evaluated_at,
        };
        session.normalize();
        session
    }

    /// The question currently awaiting an answer.
    pub fn active(&self) -> Option<&ClarificationQuestion> {
        self.pending.first()
    }

    pub fn is_ready(&self) -> bool {
        self.status == SessionStatus::Ready
    }

    /// Check that `question_id` may be answered with `count` values.
    pub fn validate_answer(
        &self,
        question_id: &str,
        count: usize,
    ) -> Result<&ClarificationQuestion, ClarifyError> {
        if self.answers.contains_key(question_id) {
            return Err(StateViolation::AlreadyAnswered(question_id.to_string()).into());
        }
        let active = self.active().ok_or(StateViolation::NothingPending)?;
        if active.question_id != question_id {
            return Err(StateViolation::NotActive {
                question_id: question_id.to_string(),
                active: active.question_id.clone(),
            }
            .into());
        }
        match active.selector.kind {
            SelectorKind::SingleSelect if count != 1 => Err(SelectorViolation::SingleSelectArity {
                question_id: question_id.to_string(),
                count,
            }
            .into()),
            SelectorKind::MultiSelect if count == 0 => {
                Err(SelectorViolation::EmptySelection(question_id.to_string()).into())
            }
            _ => Ok(active),
        }
    }

    /// Answer the active question.
    ///
    /// Values may be option codes or display values; `resolved_context`
    /// always receives display values joined with ", ".
    pub fn answer<S: AsRef<str>>(
        &self,
        question_id: &str,
        values: &[S],
    ) -> Result<Self, ClarifyError> {
        let question = self.validate_answer(question_id, values.len())?;
        let raw: Vec<String> = values.iter().map(|v| v.as_ref().to_string()).collect();
        let display: Vec<String> = raw.iter().map(|v| question.display_for(v)).collect();

        let mut next = self.clone();
        let question = next.pending.remove(0);
        if !display.is_empty() {
            let joined = display.join(", ");
            for key in question.dimension_keys() {
                next.auto_applied.remove(&key);
                next.resolved_context.insert(key, joined.clone());
            }
        }
        next.answers.insert(question.question_id, raw);
        next.touch();
        Ok(next)
    }

    /// Answer the active question with its own defaults. Without pending
    /// questions or defaults this is a no-op.
    pub fn accept_defaults(&self) -> Self {
        let Some(active) = self.active() else {
            return self.clone();
        };
        if active.defaults_applied.is_empty() {
            return self.clone();
        }

        let mut next = self.clone();
        let question = next.pending.remove(0);
        for (key, value) in &question.defaults_applied {
            next.resolved_context.insert(key.clone(), value.clone());
        }
        next.answers.insert(
            question.question_id.clone(),
            question.defaults_applied.values().cloned().collect(),
        );
        next.touch();
        next
    }

    /// Re-establish invariants on a snapshot received from elsewhere:
    /// answered questions leave `pending`, every auto-applied key is resolved
    /// and `status` follows `pending`.
    pub fn normalize(&mut self) {
        let answers = &self.answers;
        self.pending
            .retain(|question| !answers.contains_key(&question.question_id));
        for (key, value) in &self.auto_applied {
            self.resolved_context
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        self.status = if self.pending.is_empty() {
            SessionStatus::Ready
        } else {
            SessionStatus::Pending
        };
    }

    fn touch(&mut self) {
        self.normalize();
        self.updated_at = Utc::now();
    }
}
