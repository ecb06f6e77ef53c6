use super::defaults::SystemDefaults;
use super::model::{
    ClarificationOption, ClarificationQuestion, ClarificationRequest, ClarificationResponse,
    SelectorKind, SelectorMetadata,
};
use super::session::ClarificationSession;
use chrono::Utc;
use regex::Regex;
use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static TOKEN_SPLIT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

const MIN_SCORE: i64 = 5;
const MAX_MATCHES: usize = 10;
const SIMILARITY_FLOOR: f64 = 0.45;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// One curated clarification and the query patterns that trigger it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationRecord {
    #[serde(default)]
    pub question_id: String,
    #[serde(default)]
    pub module: String,
    #[serde(default)]
    pub user_question: String,
    pub clarification_question: String,
    #[serde(default)]
    pub query_id: Option<String>,
    pub selector: SelectorMetadata,
    #[serde(default)]
    pub options: Vec<ClarificationOption>,
    #[serde(default)]
    pub available_options: Vec<String>,
    #[serde(default)]
    pub keyword_hints: Vec<String>,
    #[serde(default)]
    pub context_tags: Vec<String>,
}

/// Curated clarification records in file order.
#[derive(Debug, Clone, Default)]
pub struct ClarificationCatalog {
    records: Vec<ClarificationRecord>,
}

impl ClarificationCatalog {
    pub fn from_records(records: Vec<ClarificationRecord>) -> Self {
        Self { records }
    }

    /// Parse a compiled dataset: `{"clarifications": {id: record, ...}}`, a
    /// bare `{id: record}` map or a list of records.
    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Dataset {
            Compiled { clarifications: OrderedRecords },
            Bare(OrderedRecords),
        }

        let records = match serde_json::from_str::<Dataset>(raw)? {
            Dataset::Compiled { clarifications } => clarifications.0,
            Dataset::Bare(records) => records.0,
        };
        Ok(Self { records })
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw).map_err(|source| CatalogError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn get(&self, question_id: &str) -> Option<&ClarificationRecord> {
        self.records.iter().find(|r| r.question_id == question_id)
    }

    pub fn records(&self) -> &[ClarificationRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Records from either a map keyed by question id or a list, keeping the
/// order they appear in the file.
struct OrderedRecords(Vec<ClarificationRecord>);

impl<'de> Deserialize<'de> for OrderedRecords {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RecordsVisitor;

        impl<'de> Visitor<'de> for RecordsVisitor {
            type Value = OrderedRecords;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map or list of clarification records")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut records = Vec::new();
                while let Some((key, mut record)) = map.next_entry::<String, ClarificationRecord>()? {
                    if record.question_id.is_empty() {
                        record.question_id = key;
                    }
                    records.push(record);
                }
                Ok(OrderedRecords(records))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut records = Vec::new();
                while let Some(record) = seq.next_element::<ClarificationRecord>()? {
                    if record.question_id.is_empty() {
                        return Err(de::Error::missing_field("question_id"));
                    }
                    records.push(record);
                }
                Ok(OrderedRecords(records))
            }
        }

        deserializer.deserialize_any(RecordsVisitor)
    }
}

/// Local clarification matcher over the curated catalog.
#[derive(Debug, Clone, Default)]
pub struct ClarificationEngine {
    catalog: ClarificationCatalog,
    defaults: SystemDefaults,
    token_index: HashMap<String, HashMap<String, usize>>,
}

impl ClarificationEngine {
    pub fn new(catalog: ClarificationCatalog, defaults: SystemDefaults) -> Self {
        let token_index = catalog
            .records()
            .iter()
            .map(|record| {
                (
                    record.question_id.clone(),
                    token_counts(&tokens(&record.user_question)),
                )
            })
            .collect();
        Self {
            catalog,
            defaults,
            token_index,
        }
    }

    pub fn catalog(&self) -> &ClarificationCatalog {
        &self.catalog
    }

    /// Match the query against the catalog and split the hits into questions
    /// to ask and defaults to apply silently.
    pub fn evaluate(&self, request: &ClarificationRequest) -> ClarificationResponse {
        let mut suggestions = Vec::new();
        let mut seen: HashSet<(SelectorKind, Vec<String>)> = HashSet::new();
        let mut auto_applied = BTreeMap::new();
        let mut matched = Vec::new();

        for (score, record) in self.score_candidates(request) {
            tracing::debug!(question_id = %record.question_id, score, "clarification match");
            matched.push(record.question_id.clone());
            let defaults = self.suggest_defaults(record);
            let context_key = record
                .context_tags
                .first()
                .or(record.query_id.as_ref());

            if self.already_satisfied(record, request, &defaults) {
                let applied = context_key.and_then(|key| defaults.get(key).map(|v| (key, v)));
                if let Some((key, value)) = applied {
                    auto_applied.insert(key.clone(), value.clone());
                    continue;
                }
            }

            if record.selector.kind == SelectorKind::None {
                auto_applied.extend(defaults);
                continue;
            }

            let mut tags = record.context_tags.clone();
            tags.sort();
            if !seen.insert((record.selector.kind, tags)) {
                continue;
            }

            suggestions.push(ClarificationQuestion {
                question_id: record.question_id.clone(),
                question_text: record.clarification_question.clone(),
                selector: record.selector.clone(),
                options: record.options.clone(),
                reason: build_reason(&defaults),
                defaults_applied: defaults,
                context_tags: record.context_tags.clone(),
            });
        }

        ClarificationResponse {
            user_query: request.user_query.clone(),
            suggestions,
            auto_applied,
            evaluated_at: Utc::now(),
            matched_question_ids: matched,
        }
    }

    /// Evaluate `query` and open a fresh session for it.
    pub fn create_session(&self, query: &str) -> ClarificationSession {
        ClarificationSession::from_response(self.evaluate(&ClarificationRequest::new(query)))
    }

    fn score_candidates(&self, request: &ClarificationRequest) -> Vec<(i64, &ClarificationRecord)> {
        let query = request.user_query.to_lowercase();
        let query_tokens = tokens(&request.user_query);
        let module_hint = request
            .module_hint
            .as_deref()
            .unwrap_or_default()
            .to_lowercase();

        let mut scored: Vec<(i64, &ClarificationRecord)> = self
            .catalog
            .records()
            .iter()
            .filter_map(|record| {
                let mut score = 0i64;
                if !module_hint.is_empty() && record.module.to_lowercase().contains(&module_hint) {
                    score += 4;
                }
                let similarity = sequence_ratio(&record.user_question.to_lowercase(), &query);
                if similarity > SIMILARITY_FLOOR {
                    score += (similarity * 10.0) as i64;
                }
                let keyword_hits = record
                    .keyword_hints
                    .iter()
                    .filter(|hint| query_tokens.contains(&hint.to_lowercase()))
                    .count() as i64;
                score += keyword_hits * 2;
                let context_hits = record
                    .context_tags
                    .iter()
                    .filter(|tag| query_tokens.contains(&tag.to_lowercase()))
                    .count() as i64;
                score += context_hits;
                score += option_hits(record, &query);
                score += (self.token_similarity(&query_tokens, &record.question_id) * 10.0) as i64;
                (score >= MIN_SCORE).then_some((score, record))
            })
            .collect();

        // Stable: equal scores keep catalog order.
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.truncate(MAX_MATCHES);
        scored
    }

    /// Multiset Jaccard similarity between the query tokens and the
    /// record's indexed user question.
    fn token_similarity(&self, query_tokens: &[String], question_id: &str) -> f64 {
        if query_tokens.is_empty() {
            return 0.0;
        }
        let Some(target) = self.token_index.get(question_id) else {
            return 0.0;
        };
        if target.is_empty() {
            return 0.0;
        }
        let query = token_counts(query_tokens);
        let intersection: usize = query
            .iter()
            .map(|(tok, n)| (*n).min(target.get(tok).copied().unwrap_or(0)))
            .sum();
        let mut union: usize = query
            .iter()
            .map(|(tok, n)| (*n).max(target.get(tok).copied().unwrap_or(0)))
            .sum();
        union += target
            .iter()
            .filter(|(tok, _)| !query.contains_key(*tok))
            .map(|(_, n)| *n)
            .sum::<usize>();
        intersection as f64 / union.max(1) as f64
    }

    fn suggest_defaults(&self, record: &ClarificationRecord) -> BTreeMap<String, String> {
        record
            .context_tags
            .iter()
            .filter_map(|tag| {
                self.defaults
                    .default_for(tag, record)
                    .filter(|value| !value.is_empty())
                    .map(|value| (tag.clone(), value))
            })
            .collect()
    }

    fn already_satisfied(
        &self,
        record: &ClarificationRecord,
        request: &ClarificationRequest,
        defaults: &BTreeMap<String, String>,
    ) -> bool {
        let query = request.user_query.to_lowercase();
        let by_tag = record.context_tags.iter().any(|tag| {
            request.already_provided.contains_key(tag)
                || defaults
                    .get(tag)
                    .is_some_and(|value| query.contains(&value.to_lowercase()))
        });
        by_tag || option_hits(record, &query) > 0
    }
}

fn build_reason(defaults: &BTreeMap<String, String>) -> String {
    if defaults.is_empty() {
        return "Matches module and keyword patterns from the curated dataset.".to_string();
    }
    let bits: Vec<String> = defaults.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("Default suggestion available ({}).", bits.join(", "))
}

/// Three points per option whose code or display value appears in the query.
fn option_hits(record: &ClarificationRecord, lowered_query: &str) -> i64 {
    record
        .options
        .iter()
        .filter(|opt| {
            [&opt.display_value, &opt.value].iter().any(|text| {
                let text = text.to_lowercase();
                !text.is_empty() && lowered_query.contains(&text)
            })
        })
        .count() as i64
        * 3
}

fn tokens(text: &str) -> Vec<String> {
    TOKEN_SPLIT_RE
        .split(&text.to_lowercase())
        .filter(|tok| tok.chars().count() > 2)
        .map(str::to_string)
        .collect()
}

fn token_counts(tokens: &[String]) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for tok in tokens {
        *counts.entry(tok.clone()).or_insert(0) += 1;
    }
    counts
}

/// Ratcliff/Obershelp similarity: twice the matched characters over the
/// total length, matching blocks found by recursive longest common run.
fn sequence_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    let mut matched = 0;
    let mut queue = vec![(0, a.len(), 0, b.len())];
    while let Some((alo, ahi, blo, bhi)) = queue.pop() {
        let (i, j, k) = longest_match(&a, &b, alo, ahi, blo, bhi);
        if k == 0 {
            continue;
        }
        matched += k;
        if alo < i && blo < j {
            queue.push((alo, i, blo, j));
        }
        if i + k < ahi && j + k < bhi {
            queue.push((i + k, ahi, j + k, bhi));
        }
    }
    2.0 * matched as f64 / total as f64
}

/// Longest common run of `a[alo..ahi]` and `b[blo..bhi]`, earliest in `a`
/// then earliest in `b` on ties.
fn longest_match(
    a: &[char],
    b: &[char],
    alo: usize,
    ahi: usize,
    blo: usize,
    bhi: usize,
) -> (usize, usize, usize) {
    let mut best = (alo, blo, 0);
    let width = bhi - blo;
    let mut prev = vec![0usize; width + 1];
    for i in alo..ahi {
        let mut cur = vec![0usize; width + 1];
        for j in blo..bhi {
            if a[i] == b[j] {
                let k = prev[j - blo] + 1;
                cur[j - blo + 1] = k;
                if k > best.2 {
                    best = (i + 1 - k, j + 1 - k, k);
                }
            }
        }
        prev = cur;
    }
    best
}
