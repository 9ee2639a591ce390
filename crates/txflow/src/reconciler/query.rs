use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A named indexer query plus the variable set it runs with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryKey {
    name: String,
    #[serde(default)]
    vars: BTreeMap<String, String>,
}

impl QueryKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vars: BTreeMap::new(),
        }
    }

    pub fn with_var(mut self, var: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(var.into(), value.into());
        self
    }

    pub fn with_vars(name: impl Into<String>, vars: BTreeMap<String, String>) -> Self {
        Self {
            name: name.into(),
            vars,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn var(&self, var: &str) -> Option<&str> {
        self.vars.get(var).map(String::as_str)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if self.vars.is_empty() {
            return Ok(());
        }
        f.write_str("{")?;
        for (idx, (var, value)) in self.vars.iter().enumerate() {
            if idx > 0 {
                f.write_str(",")?;
            }
            write!(f, "{var}={value}")?;
        }
        f.write_str("}")
    }
}

/// One indexer row: an entity id plus string-encoded fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub id: String,
    #[serde(flatten)]
    pub fields: BTreeMap<String, String>,
}

impl Row {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn field(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    /// Numeric view of a string-encoded field.
    pub fn field_u128(&self, field: &str) -> Option<u128> {
        self.field(field).and_then(|raw| raw.trim().parse::<u128>().ok())
    }
}

/// One page of rows as returned by a poll.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryResult {
    rows: Vec<Row>,
}

impl QueryResult {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn row(&self, entity_id: &str) -> Option<&Row> {
        self.rows.iter().find(|row| row.id == entity_id)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }
}

impl From<Vec<Row>> for QueryResult {
    fn from(rows: Vec<Row>) -> Self {
        Self { rows }
    }
}

/// How a freshly polled result may replace the cached one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Entity state: the newest response wins unless it has fewer rows.
    #[default]
    Latest,
    /// Logs that only grow: a response must keep every cached entry.
    AppendOnly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySpec {
    #[serde(flatten)]
    pub key: QueryKey,
    #[serde(default)]
    pub policy: CachePolicy,
}

impl QuerySpec {
    pub fn latest(key: QueryKey) -> Self {
        Self {
            key,
            policy: CachePolicy::Latest,
        }
    }

    pub fn append_only(key: QueryKey) -> Self {
        Self {
            key,
            policy: CachePolicy::AppendOnly,
        }
    }
}
