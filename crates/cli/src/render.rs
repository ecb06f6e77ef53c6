use opsdesk_core::{NarrationItem, TodoStatus, TurnRender};
use std::collections::HashSet;

/// Prints a streaming turn incrementally: every narration line once, the
/// final answer once it exists.
#[derive(Debug, Default)]
pub struct TurnPrinter {
    seen: HashSet<String>,
    final_shown: bool,
}

impl TurnPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines of `render` that have not been printed yet.
    pub fn pending_lines(&mut self, render: &TurnRender) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(primary) = &render.primary {
            if self.seen.insert(item_key(primary)) {
                lines.push(format!("● {}", primary.text));
            }
        }
        for item in &render.subtasks {
            if self.seen.insert(item_key(item)) {
                lines.push(format!("  {}", format_item(item)));
            }
        }
        if render.has_final && !self.final_shown {
            self.final_shown = true;
            if let Some(text) = &render.final_text {
                lines.push(String::new());
                lines.push(text.trim().to_string());
            }
            for attachment in &render.attachments {
                lines.push(format!("  attachment: {} ({})", attachment.name, attachment.path));
            }
        }
        lines
    }

    pub fn print(&mut self, render: &TurnRender) {
        for line in self.pending_lines(render) {
            println!("{line}");
        }
    }
}

/// A todo whose status changes is printed again.
fn item_key(item: &NarrationItem) -> String {
    match item.todo_status {
        Some(status) => format!("{}:{}", item.event_id, status.as_str()),
        None => item.event_id.clone(),
    }
}

fn format_item(item: &NarrationItem) -> String {
    if item.is_error {
        return format!("✗ {}", item.text);
    }
    match item.todo_status {
        Some(TodoStatus::Completed) => format!("[x] {}", item.text),
        Some(TodoStatus::InProgress) => format!("[~] {}", item.text),
        Some(TodoStatus::Pending) => format!("[ ] {}", item.text),
        None => format!("· {}", item.text),
    }
}

/// Whole-conversation view. Collapsed turns show only the headline and the
/// answer.
pub fn format_history(renders: &[TurnRender]) -> String {
    let mut out = Vec::new();
    for (index, render) in renders.iter().enumerate() {
        let marker = if render.expanded { "▾" } else { "▸" };
        let headline = render
            .primary
            .as_ref()
            .map(|item| item.text.as_str())
            .unwrap_or("(working)");
        out.push(format!("{marker} [{}] {headline}", index + 1));
        if render.expanded {
            out.extend(
                render
                    .subtasks
                    .iter()
                    .map(|item| format!("    {}", format_item(item))),
            );
        } else if !render.subtasks.is_empty() {
            out.push(format!("    ({} more steps)", render.subtasks.len()));
        }
        if let Some(text) = render.final_text.as_deref().filter(|_| render.has_final) {
            out.push(format!("    = {}", text.trim()));
        }
    }
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsdesk_core::testing::{at, final_response, message, todo};
    use opsdesk_core::{ConversationContext, SegmentConfig};

    fn live_context() -> ConversationContext {
        let mut ctx = ConversationContext::new(SegmentConfig::default());
        ctx.push_user_message_at("net sales for bottles?", at(-1_000));
        ctx.begin_run();
        ctx
    }

    #[test]
    fn test_lines_are_printed_once() {
        let mut ctx = live_context();
        let mut printer = TurnPrinter::new();

        ctx.record_event(message(0, "Looking up sales"));
        let lines = printer.pending_lines(&ctx.current_render().unwrap());
        assert_eq!(lines, vec!["● Looking up sales"]);
        assert!(
            printer
                .pending_lines(&ctx.current_render().unwrap())
                .is_empty()
        );

        ctx.record_event(todo(1_000, "Check Q1 bottles"));
        ctx.record_event(final_response(3_000, "Net sales: 120 units"));
        ctx.record_final_at(Some("Net sales: 120 units".to_string()), at(3_100));
        let lines = printer.pending_lines(&ctx.current_render().unwrap());
        assert_eq!(
            lines,
            vec!["  [ ] Check Q1 bottles", "", "Net sales: 120 units"]
        );
        assert!(
            printer
                .pending_lines(&ctx.current_render().unwrap())
                .is_empty()
        );
    }

    #[test]
    fn test_history_respects_expand_state() {
        let mut ctx = live_context();
        ctx.record_event(message(0, "Looking up sales"));
        ctx.record_event(message(500, "Checking returns"));
        ctx.record_event(final_response(1_000, "120 units"));
        ctx.record_final_at(Some("120 units".to_string()), at(1_100));

        let collapsed = format_history(&ctx.render());
        assert_eq!(
            collapsed,
            "▸ [1] Looking up sales\n    = 120 units"
        );

        let key = ctx.turns()[0].key.clone();
        ctx.toggle(&key);
        ctx.record_event(message(200, "Summing units"));
        let expanded = format_history(&ctx.render());
        assert!(expanded.starts_with("▾ [1] Looking up sales"));
        assert!(expanded.contains("    · Summing units"));
        assert!(!expanded.contains("Checking returns"));
    }
}
