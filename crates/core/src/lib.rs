pub mod clarify;
pub mod compose;
pub mod conversation;
pub mod event;
pub mod present;
pub mod sanitize;
pub mod segment;

pub use clarify::{
    ClarificationAnswer, ClarificationCatalog, ClarificationEngine, ClarificationOption,
    ClarificationQuestion, ClarificationRequest, ClarificationResponse, ClarificationSession,
    ClarifyError, Selection, SelectorKind, SelectorViolation, SessionStatus, StateViolation,
    SystemDefaults,
};
pub use compose::{Intent, RequestAnalysis, analyze_request, compose_prompt};
pub use conversation::ConversationContext;
pub use event::*;
pub use present::{ExpandState, NarrationItem, TurnRender, present};
pub use sanitize::sanitize_narration;
pub use segment::{SegmentConfig, Turn, TurnKey, segment, turn_events};

#[cfg(any(test, feature = "testing"))]
pub mod testing;
