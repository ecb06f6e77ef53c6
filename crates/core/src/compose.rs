//! Final prompt composition and ERP request detection.

use regex::RegexSet;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::LazyLock;

static ERP_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)\bpurchase order\b",
        r"(?i)\bPO\b",
        r"(?i)\breplenishment\b",
        r"(?i)\binventory\b",
        r"(?i)\bvendor\b",
        r"(?i)\bsupplier\b",
        r"(?i)\bNetSuite\b",
        r"(?i)\bERP\b",
        r"(?i)\border.*units\b",
        r"(?i)\bcreate.*order\b",
    ])
    .unwrap()
});

const CREATE_WORDS: &[&str] = &["create", "make", "generate"];
const STATUS_WORDS: &[&str] = &["check", "verify", "status"];
const INVENTORY_WORDS: &[&str] = &["inventory", "stock"];

/// What the user most likely wants from an ERP request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    CreatePurchaseOrder,
    CheckOrderStatus,
    CheckInventory,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreatePurchaseOrder => "create_purchase_order",
            Self::CheckOrderStatus => "check_order_status",
            Self::CheckInventory => "check_inventory",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RequestAnalysis {
    pub is_erp: bool,
    pub needs_clarification: bool,
    pub intent: Option<Intent>,
}

/// Flag ERP-related prompts; only those go through clarification.
pub fn analyze_request(prompt: &str) -> RequestAnalysis {
    if !ERP_PATTERNS.is_match(prompt) {
        return RequestAnalysis {
            is_erp: false,
            needs_clarification: false,
            intent: None,
        };
    }
    let lowered = prompt.to_lowercase();
    let mentions = |words: &[&str]| words.iter().any(|w| lowered.contains(w));
    let intent = if mentions(CREATE_WORDS) {
        Some(Intent::CreatePurchaseOrder)
    } else if mentions(STATUS_WORDS) {
        Some(Intent::CheckOrderStatus)
    } else if mentions(INVENTORY_WORDS) {
        Some(Intent::CheckInventory)
    } else {
        None
    };
    RequestAnalysis {
        is_erp: true,
        needs_clarification: true,
        intent,
    }
}

/// Build the prompt sent to the agent: the query followed by the resolved
/// clarification context, one `- Key: value` line per dimension.
pub fn compose_prompt(query: &str, context: &BTreeMap<String, String>) -> String {
    let query = query.trim();
    let lines: Vec<String> = context
        .iter()
        .filter(|(_, value)| !value.trim().is_empty())
        .map(|(key, value)| format!("- {}: {}", human_key(key), value.trim()))
        .collect();
    if lines.is_empty() {
        return query.to_string();
    }
    format!("{query}\n\nClarified context:\n{}", lines.join("\n"))
}

fn human_key(key: &str) -> String {
    let spaced = key.replace(['_', '-'], " ");
    let mut chars = spaced.trim().chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_with_context() {
        let context = BTreeMap::from([
            ("apparel_size".to_string(), "Medium".to_string()),
            ("currency".to_string(), "EUR".to_string()),
            ("empty".to_string(), " ".to_string()),
        ]);
        assert_eq!(
            compose_prompt("  reorder hoodies ", &context),
            "reorder hoodies\n\nClarified context:\n- Apparel size: Medium\n- Currency: EUR"
        );
    }

    #[test]
    fn test_compose_without_context_is_query() {
        assert_eq!(compose_prompt("net sales?", &BTreeMap::new()), "net sales?");
    }

    #[test]
    fn test_analyze_request_intents() {
        let create = analyze_request("Create a purchase order for 40 hoodies");
        assert!(create.is_erp && create.needs_clarification);
        assert_eq!(create.intent, Some(Intent::CreatePurchaseOrder));

        let status = analyze_request("What's the status of PO 1042?");
        assert_eq!(status.intent, Some(Intent::CheckOrderStatus));

        let stock = analyze_request("How much inventory do we hold?");
        assert_eq!(stock.intent, Some(Intent::CheckInventory));

        let plain = analyze_request("Summarise last week's support tickets");
        assert!(!plain.is_erp);
        assert_eq!(plain.intent, None);

        assert!(analyze_request("order 200 units of caps").is_erp);
        assert!(!analyze_request("a pot of coffee").is_erp);
    }
}
