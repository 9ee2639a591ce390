use super::cache::QueryCache;
use super::query::{QueryKey, QueryResult};

/// What the read-model must show before a pending transaction counts as
/// confirmed. The indexer has no transaction-id column, so confirmation is
/// always inferred from entity content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expectation {
    /// The result holds at least `count` rows, e.g. one battle beyond the
    /// log length known at submission.
    RowCountAtLeast { key: QueryKey, count: usize },
    EntityPresent { key: QueryKey, entity_id: String },
    FieldEquals {
        key: QueryKey,
        entity_id: String,
        field: String,
        value: String,
    },
    FieldChanged {
        key: QueryKey,
        entity_id: String,
        field: String,
        from: String,
    },
    /// Numeric field strictly below `below`.
    FieldDecreased {
        key: QueryKey,
        entity_id: String,
        field: String,
        below: u128,
    },
    Any(Vec<Expectation>),
    All(Vec<Expectation>),
}

impl Expectation {
    pub fn row_count_at_least(key: QueryKey, count: usize) -> Self {
        Self::RowCountAtLeast { key, count }
    }

    pub fn field_equals(
        key: QueryKey,
        entity_id: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self::FieldEquals {
            key,
            entity_id: entity_id.into(),
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn field_changed(
        key: QueryKey,
        entity_id: impl Into<String>,
        field: impl Into<String>,
        from: impl Into<String>,
    ) -> Self {
        Self::FieldChanged {
            key,
            entity_id: entity_id.into(),
            field: field.into(),
            from: from.into(),
        }
    }

    pub fn field_decreased(
        key: QueryKey,
        entity_id: impl Into<String>,
        field: impl Into<String>,
        below: u128,
    ) -> Self {
        Self::FieldDecreased {
            key,
            entity_id: entity_id.into(),
            field: field.into(),
            below,
        }
    }

    pub fn is_satisfied(&self, cache: &QueryCache) -> bool {
        match self {
            Expectation::Any(inner) => inner.iter().any(|exp| exp.is_satisfied(cache)),
            Expectation::All(inner) => {
                !inner.is_empty() && inner.iter().all(|exp| exp.is_satisfied(cache))
            }
            leaf => leaf
                .leaf_key()
                .and_then(|key| cache.with_result(key, |result| leaf.matches(result)))
                .unwrap_or(false),
        }
    }

    /// Every query this expectation reads, without duplicates.
    pub fn keys(&self) -> Vec<&QueryKey> {
        let mut keys = Vec::new();
        self.collect_keys(&mut keys);
        keys
    }

    fn collect_keys<'a>(&'a self, out: &mut Vec<&'a QueryKey>) {
        match self {
            Expectation::Any(inner) | Expectation::All(inner) => {
                for exp in inner {
                    exp.collect_keys(out);
                }
            }
            leaf => {
                if let Some(key) = leaf.leaf_key() {
                    if !out.contains(&key) {
                        out.push(key);
                    }
                }
            }
        }
    }

    fn leaf_key(&self) -> Option<&QueryKey> {
        match self {
            Expectation::RowCountAtLeast { key, .. }
            | Expectation::EntityPresent { key, .. }
            | Expectation::FieldEquals { key, .. }
            | Expectation::FieldChanged { key, .. }
            | Expectation::FieldDecreased { key, .. } => Some(key),
            Expectation::Any(_) | Expectation::All(_) => None,
        }
    }

    fn matches(&self, result: &QueryResult) -> bool {
        match self {
            Expectation::RowCountAtLeast { count, .. } => result.len() >= *count,
            Expectation::EntityPresent { entity_id, .. } => result.row(entity_id).is_some(),
            Expectation::FieldEquals {
                entity_id,
                field,
                value,
                ..
            } => result
                .row(entity_id)
                .and_then(|row| row.field(field))
                .is_some_and(|current| current == value),
            Expectation::FieldChanged {
                entity_id,
                field,
                from,
                ..
            } => result
                .row(entity_id)
                .and_then(|row| row.field(field))
                .is_some_and(|current| current != from),
            Expectation::FieldDecreased {
                entity_id,
                field,
                below,
                ..
            } => result
                .row(entity_id)
                .and_then(|row| row.field_u128(field))
                .is_some_and(|current| current < *below),
            Expectation::Any(_) | Expectation::All(_) => false,
        }
    }
}
