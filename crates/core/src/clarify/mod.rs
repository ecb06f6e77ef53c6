//! Clarification dialogue: questions, sessions and the local catalog engine.

mod defaults;
mod engine;
mod model;
mod selection;
mod session;

pub use defaults::{SystemDefaults, SystemQueryResult};
pub use engine::{CatalogError, ClarificationCatalog, ClarificationEngine, ClarificationRecord};
pub use model::{
    ClarificationAnswer, ClarificationOption, ClarificationQuestion, ClarificationRequest,
    ClarificationResponse, SelectorKind, SelectorMetadata,
};
pub use selection::Selection;
pub use session::{ClarificationSession, SessionStatus};

/// Misuse of a clarification session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ClarifyError {
    #[error("invalid clarification state: {0}")]
    InvalidState(#[from] StateViolation),
    #[error("invalid selection: {0}")]
    Selector(#[from] SelectorViolation),
}

impl ClarifyError {
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateViolation {
    #[error("question `{0}` was already answered")]
    AlreadyAnswered(String),
    #[error("question `{question_id}` is not active (active question is `{active}`)")]
    NotActive { question_id: String, active: String },
    #[error("no question is pending")]
    NothingPending,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectorViolation {
    #[error("single-select question `{question_id}` takes exactly one value, got {count}")]
    SingleSelectArity { question_id: String, count: usize },
    #[error("multi-select question `{0}` needs at least one value")]
    EmptySelection(String),
}
