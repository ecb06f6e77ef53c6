//! Interactive resolution of a clarification session.

use anyhow::{Context, Result, bail};
use dialoguer::{Confirm, Input, Select};
use opsdesk_api_client::{Clarifier, ClarifierError};
use opsdesk_core::{ClarificationQuestion, ClarificationSession, Selection, SelectorKind};

/// What to do with the active question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Choice {
    Values(Vec<String>),
    AcceptDefaults,
    /// Informational question: submit without values.
    Acknowledge,
}

pub trait Answerer {
    fn choose(&mut self, question: &ClarificationQuestion) -> Result<Choice>;

    /// Whether to repeat a call that failed recoverably.
    fn retry_after(&mut self, error: &ClarifierError) -> Result<bool>;
}

/// Answer questions until the session is ready.
pub async fn resolve(
    clarifier: &mut Clarifier,
    mut session: ClarificationSession,
    answerer: &mut dyn Answerer,
) -> Result<ClarificationSession> {
    while let Some(question) = session.active().cloned() {
        let choice = answerer.choose(&question)?;
        loop {
            let next = match &choice {
                Choice::AcceptDefaults => clarifier.accept_defaults(&session).await,
                Choice::Values(values) => {
                    clarifier
                        .answer(&session, &question.question_id, values)
                        .await
                }
                Choice::Acknowledge => {
                    clarifier
                        .answer(&session, &question.question_id, &[])
                        .await
                }
            };
            match next {
                Ok(next) if next == session => {
                    bail!("question `{}` was not accepted", question.question_id)
                }
                Ok(next) => {
                    session = next;
                    break;
                }
                Err(e) if e.is_recoverable() && answerer.retry_after(&e)? => continue,
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Failed to answer `{}`", question.question_id)
                    });
                }
            }
        }
    }
    Ok(session)
}

/// Prompts on the terminal.
pub struct TerminalAnswerer;

const SELECT_ALL: &str = "Select all";
const CLEAR_ALL: &str = "Clear all";
const DONE: &str = "Done";

impl Answerer for TerminalAnswerer {
    fn choose(&mut self, question: &ClarificationQuestion) -> Result<Choice> {
        println!();
        if !question.reason.is_empty() {
            println!("  {}", question.reason);
        }
        match question.selector.kind {
            SelectorKind::None => {
                println!("{}", question.question_text);
                Confirm::new()
                    .with_prompt("Continue?")
                    .default(true)
                    .interact()
                    .context("failed to read confirmation")?;
                Ok(Choice::Acknowledge)
            }
            _ if question.options.is_empty() => free_text(question),
            SelectorKind::SingleSelect => single_select(question),
            SelectorKind::MultiSelect => multi_select(question),
        }
    }

    fn retry_after(&mut self, error: &ClarifierError) -> Result<bool> {
        Confirm::new()
            .with_prompt(format!("{error}. Retry?"))
            .default(true)
            .interact()
            .context("failed to read confirmation")
    }
}

fn default_label(question: &ClarificationQuestion) -> Option<String> {
    if question.defaults_applied.is_empty() {
        return None;
    }
    let values: Vec<&str> = question
        .defaults_applied
        .values()
        .map(String::as_str)
        .collect();
    Some(format!("Use default ({})", values.join(", ")))
}

fn single_select(question: &ClarificationQuestion) -> Result<Choice> {
    let mut items: Vec<String> = question
        .options
        .iter()
        .map(|opt| opt.display_value.clone())
        .collect();
    let default = default_label(question);
    if let Some(label) = &default {
        items.push(label.clone());
    }
    let picked = Select::new()
        .with_prompt(&question.question_text)
        .items(&items)
        .default(0)
        .interact()
        .context("failed to read selection")?;
    if picked >= question.options.len() {
        return Ok(Choice::AcceptDefaults);
    }
    Ok(Choice::Values(vec![question.options[picked].value.clone()]))
}

fn multi_select(question: &ClarificationQuestion) -> Result<Choice> {
    let mut selection = Selection::new(question);
    let default = default_label(question);
    loop {
        let items = multi_select_items(question, &selection, default.as_deref());
        let picked = Select::new()
            .with_prompt(&question.question_text)
            .items(&items)
            .default(0)
            .interact()
            .context("failed to read selection")?;

        let option_count = question.options.len();
        if picked < option_count {
            selection.toggle_option(&question.options[picked].value);
            continue;
        }
        match items[picked].as_str() {
            SELECT_ALL | CLEAR_ALL => selection.toggle_all(),
            DONE if selection.is_empty() => println!("  Pick at least one option."),
            DONE => return Ok(Choice::Values(selection.values())),
            _ => return Ok(Choice::AcceptDefaults),
        }
    }
}

fn multi_select_items(
    question: &ClarificationQuestion,
    selection: &Selection,
    default: Option<&str>,
) -> Vec<String> {
    let mut items: Vec<String> = question
        .options
        .iter()
        .map(|opt| {
            let mark = if selection.is_selected(&opt.value) { "x" } else { " " };
            format!("[{mark}] {}", opt.display_value)
        })
        .collect();
    let all = if selection.is_all_selected() {
        CLEAR_ALL
    } else {
        SELECT_ALL
    };
    items.push(all.to_string());
    items.push(DONE.to_string());
    if let Some(label) = default {
        items.push(label.to_string());
    }
    items
}

fn free_text(question: &ClarificationQuestion) -> Result<Choice> {
    let mut input = Input::<String>::new().with_prompt(&question.question_text);
    if let Some(value) = question.defaults_applied.values().next() {
        input = input.default(value.clone());
    }
    let text = input.interact_text().context("failed to read answer")?;
    let text = text.trim();
    if question.defaults_applied.values().any(|value| value == text) {
        return Ok(Choice::AcceptDefaults);
    }
    Ok(Choice::Values(vec![text.to_string()]))
}

/// Non-interactive answering: defaults where they exist, otherwise fail.
pub struct DefaultsAnswerer;

impl Answerer for DefaultsAnswerer {
    fn choose(&mut self, question: &ClarificationQuestion) -> Result<Choice> {
        if question.selector.kind == SelectorKind::None {
            return Ok(Choice::Acknowledge);
        }
        if !question.defaults_applied.is_empty() {
            return Ok(Choice::AcceptDefaults);
        }
        bail!(
            "question `{}` ({}) has no default; run interactively to answer it",
            question.question_id,
            question.question_text
        )
    }

    fn retry_after(&mut self, _error: &ClarifierError) -> Result<bool> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsdesk_core::{
        ClarificationCatalog, ClarificationEngine, ClarificationRequest, SystemDefaults,
        compose_prompt,
    };
    use serde_json::json;
    use std::collections::VecDeque;

    struct Scripted(VecDeque<Choice>);

    impl Answerer for Scripted {
        fn choose(&mut self, _question: &ClarificationQuestion) -> Result<Choice> {
            self.0.pop_front().context("script exhausted")
        }

        fn retry_after(&mut self, _error: &ClarifierError) -> Result<bool> {
            Ok(false)
        }
    }

    fn engine() -> ClarificationEngine {
        let catalog = ClarificationCatalog::from_json_str(
            &json!({
                "clarifications": {
                    "apparel_size": {
                        "user_question": "reorder hoodies by size",
                        "clarification_question": "Which size?",
                        "selector": {"kind": "multi_select"},
                        "options": [
                            {"value": "size_s", "display_value": "Small"},
                            {"value": "size_m", "display_value": "Medium"},
                            {"value": "size_l", "display_value": "Large"}
                        ],
                        "keyword_hints": ["reorder", "hoodies"],
                        "context_tags": ["apparel_size"]
                    },
                    "po_note": {
                        "user_question": "reorder hoodies purchase note",
                        "clarification_question": "Purchase orders are created as drafts.",
                        "selector": {"kind": "none"},
                        "keyword_hints": ["reorder", "hoodies"],
                        "context_tags": ["po_note"]
                    },
                    "currency": {
                        "user_question": "reorder hoodies currency",
                        "clarification_question": "Which currency?",
                        "selector": {"kind": "single_select"},
                        "options": [
                            {"value": "EUR", "display_value": "EUR"},
                            {"value": "USD", "display_value": "USD"}
                        ],
                        "keyword_hints": ["reorder", "hoodies"],
                        "context_tags": ["currency"]
                    }
                }
            })
            .to_string(),
        )
        .unwrap();
        let defaults = SystemDefaults::from_json_str(
            &json!([{"query_id": "config_currencies", "rows": [
                {"symbol": "USD", "isbasecurrency": "T"}
            ]}])
            .to_string(),
        )
        .unwrap();
        ClarificationEngine::new(catalog, defaults)
    }

    #[tokio::test]
    async fn test_scripted_dialogue_reaches_ready() {
        let mut clarifier = Clarifier::local(engine());
        let session = clarifier
            .evaluate(&ClarificationRequest::new("reorder hoodies"))
            .await;
        let ids: Vec<&str> = session
            .pending
            .iter()
            .map(|q| q.question_id.as_str())
            .collect();
        assert_eq!(ids, vec!["apparel_size", "currency"]);

        let mut script = Scripted(VecDeque::from([
            Choice::Values(vec!["size_m".to_string(), "size_l".to_string()]),
            Choice::AcceptDefaults,
        ]));
        let done = resolve(&mut clarifier, session, &mut script).await.unwrap();
        assert!(done.is_ready());
        assert_eq!(
            compose_prompt("reorder hoodies", &done.resolved_context),
            "reorder hoodies\n\nClarified context:\n- Apparel size: Medium, Large\n- Currency: USD"
        );
    }

    #[tokio::test]
    async fn test_defaults_answerer_stops_on_question_without_default() {
        let mut clarifier = Clarifier::local(ClarificationEngine::new(
            ClarificationCatalog::from_json_str(
                &json!({"clarifications": {"vendor": {
                    "user_question": "create purchase order for vendor",
                    "clarification_question": "Which vendor?",
                    "selector": {"kind": "single_select"},
                    "options": [{"value": "v1", "display_value": "Acme"}],
                    "keyword_hints": ["vendor"]
                }}})
                .to_string(),
            )
            .unwrap(),
            SystemDefaults::default(),
        ));
        let session = clarifier
            .evaluate(&ClarificationRequest::new(
                "create purchase order for vendor",
            ))
            .await;
        assert_eq!(session.pending.len(), 1);

        let err = resolve(&mut clarifier, session, &mut DefaultsAnswerer)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("has no default"));
    }

    #[test]
    fn test_multi_select_items_track_selection() {
        let question = engine().create_session("reorder hoodies").pending[0].clone();
        let mut selection = Selection::new(&question);
        selection.toggle_option("size_s");
        let items = multi_select_items(&question, &selection, Some("Use default (Small)"));
        assert_eq!(
            items,
            vec![
                "[x] Small",
                "[ ] Medium",
                "[ ] Large",
                SELECT_ALL,
                DONE,
                "Use default (Small)"
            ]
        );

        selection.toggle_all();
        let items = multi_select_items(&question, &selection, None);
        assert_eq!(items[3], CLEAR_ALL);
    }
}
