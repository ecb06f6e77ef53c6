use super::engine::{CatalogError, ClarificationRecord};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;

/// Cached rows of one system-wide ERP query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemQueryResult {
    pub query_id: String,
    #[serde(default)]
    pub collected_at: Option<String>,
    #[serde(default)]
    pub row_count: usize,
    #[serde(default)]
    pub rows: Vec<Map<String, Value>>,
}

/// System-wide query results used to pick safe defaults per dimension.
#[derive(Debug, Clone, Default)]
pub struct SystemDefaults {
    results: HashMap<String, SystemQueryResult>,
}

impl SystemDefaults {
    /// Parse a JSON list of query results. Malformed entries are skipped.
    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        let entries: Vec<Value> = serde_json::from_str(raw)?;
        let mut defaults = Self::default();
        for entry in entries {
            match serde_json::from_value::<SystemQueryResult>(entry) {
                Ok(result) => defaults.insert(result),
                Err(err) => tracing::debug!("skipping malformed system default entry: {err}"),
            }
        }
        Ok(defaults)
    }

    /// Load cached results; a missing file yields no defaults.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw).map_err(|source| CatalogError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn insert(&mut self, result: SystemQueryResult) {
        self.results.insert(result.query_id.clone(), result);
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn get(&self, query_id: &str) -> Option<&SystemQueryResult> {
        self.results.get(query_id)
    }

    /// Safe default for `tag` on `record`, falling back to the record's first
    /// available option and then its first option.
    pub fn default_for(&self, tag: &str, record: &ClarificationRecord) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        self.from_system_data(tag)
            .or_else(|| record.available_options.first().cloned())
            .or_else(|| record.options.first().map(|opt| opt.display_value.clone()))
    }

    fn from_system_data(&self, tag: &str) -> Option<String> {
        match tag {
            "subsidiary" => {
                let top = self.top_row("txn_subsidiary_volume", "transaction_count")?;
                text(top, "subsidiary_name").or_else(|| text(top, "subsidiary"))
            }
            "department" | "location" => {
                let top = self.top_row("txn_department_location", "transaction_count")?;
                text(top, tag)
            }
            "account" => self
                .rows("master_chart_of_accounts")
                .iter()
                .find_map(|row| text(row, "accttype")),
            "currency" => {
                let base = self
                    .rows("config_currencies")
                    .iter()
                    .find(|row| row.get("isbasecurrency").and_then(Value::as_str) == Some("T"))?;
                text(base, "symbol").or_else(|| text(base, "name"))
            }
            "status" => {
                let top = self.top_row("txn_status_distribution", "count")?;
                text(top, "status")
            }
            "type" => {
                let top = self.top_row("txn_type_usage", "usage_count")?;
                text(top, "type")
            }
            "role" => {
                let top = self.top_row("config_roles_permissions", "employee_count")?;
                text(top, "name")
            }
            _ => None,
        }
    }

    fn rows(&self, query_id: &str) -> &[Map<String, Value>] {
        self.results
            .get(query_id)
            .map(|result| result.rows.as_slice())
            .unwrap_or_default()
    }

    /// Row with the highest `count_key`; the first row wins ties.
    fn top_row(&self, query_id: &str, count_key: &str) -> Option<&Map<String, Value>> {
        self.rows(query_id)
            .iter()
            .rev()
            .max_by_key(|row| count(row, count_key))
    }
}

fn count(row: &Map<String, Value>, key: &str) -> i64 {
    match row.get(key) {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn text(row: &Map<String, Value>, key: &str) -> Option<String> {
    match row.get(key)? {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
