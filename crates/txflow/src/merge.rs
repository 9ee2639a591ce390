//! Render-time combination of confirmed cache data with the optimistic
//! snapshot of the in-flight transaction.
//!
//! Overlay is per field: a snapshot row whose id matches a confirmed row
//! replaces only the fields it names; a snapshot row with a new id is appended
//! after the confirmed rows. Confirmed rows the snapshot does not mention are
//! passed through untouched.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::lifecycle::TxPhase;
use crate::reconciler::{CachedQuery, QueryKey, Row};

/// Rows to show as if the transaction had already landed, per query.
///
/// Built once before submission and never mutated after it is attached to a
/// transaction; clones share the same rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptimisticSnapshot {
    overlays: Arc<BTreeMap<QueryKey, Vec<Row>>>,
}

impl OptimisticSnapshot {
    pub fn builder() -> SnapshotBuilder {
        SnapshotBuilder::default()
    }

    pub fn overlay(&self, key: &QueryKey) -> Option<&[Row]> {
        self.overlays.get(key).map(Vec::as_slice)
    }

    pub fn keys(&self) -> impl Iterator<Item = &QueryKey> {
        self.overlays.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.overlays.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    overlays: BTreeMap<QueryKey, Vec<Row>>,
}

impl SnapshotBuilder {
    pub fn row(mut self, key: QueryKey, row: Row) -> Self {
        self.overlays.entry(key).or_default().push(row);
        self
    }

    pub fn rows(mut self, key: QueryKey, rows: impl IntoIterator<Item = Row>) -> Self {
        self.overlays.entry(key).or_default().extend(rows);
        self
    }

    pub fn build(self) -> OptimisticSnapshot {
        OptimisticSnapshot {
            overlays: Arc::new(self.overlays),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewSource {
    /// Last accepted cache value only.
    Confirmed,
    /// Cache value with the in-flight snapshot overlaid.
    Optimistic,
    /// Cache value after the transaction was confirmed; snapshot discarded.
    Polled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedView {
    pub key: QueryKey,
    pub rows: Vec<Row>,
    pub source: ViewSource,
    /// Cache version the view was built from; 0 when nothing was cached yet.
    pub version: u64,
}

impl MergedView {
    pub fn row(&self, entity_id: &str) -> Option<&Row> {
        self.rows.iter().find(|row| row.id == entity_id)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Combines the cached value for `key` with the active transaction, if any.
///
/// `active` carries the phase the caller wants rendered together with that
/// transaction's snapshot.
pub fn merged_view(
    key: &QueryKey,
    cached: Option<&CachedQuery>,
    active: Option<(TxPhase, &OptimisticSnapshot)>,
) -> MergedView {
    let confirmed_rows = cached
        .map(|entry| entry.result.rows().to_vec())
        .unwrap_or_default();
    let version = cached.map(|entry| entry.version).unwrap_or(0);

    let (rows, source) = match active {
        Some((TxPhase::Submitted | TxPhase::Pending, snapshot)) => match snapshot.overlay(key) {
            Some(overlay) => (overlay_rows(confirmed_rows, overlay), ViewSource::Optimistic),
            None => (confirmed_rows, ViewSource::Confirmed),
        },
        Some((TxPhase::Confirmed, _)) => (confirmed_rows, ViewSource::Polled),
        Some((TxPhase::Failed, _)) | None => (confirmed_rows, ViewSource::Confirmed),
    };

    MergedView {
        key: key.clone(),
        rows,
        source,
        version,
    }
}

fn overlay_rows(mut rows: Vec<Row>, overlay: &[Row]) -> Vec<Row> {
    for patch in overlay {
        match rows.iter_mut().find(|row| row.id == patch.id) {
            Some(row) => {
                for (field, value) in &patch.fields {
                    row.fields.insert(field.clone(), value.clone());
                }
            }
            None => rows.push(patch.clone()),
        }
    }
    rows
}
