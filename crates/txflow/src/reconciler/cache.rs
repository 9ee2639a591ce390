use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::time::Instant;

use crate::lock::{read_recovering, write_recovering};

use super::query::{CachePolicy, QueryKey, QueryResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedQuery {
    pub result: QueryResult,
    /// Bumped only when the cached content actually changes.
    pub version: u64,
    /// Sequence number of the response that last touched this entry.
    pub seq: u64,
    pub updated_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheWrite {
    Inserted,
    Updated { version: u64 },
    Unchanged,
    RejectedStale,
    RejectedShrink,
}

impl CacheWrite {
    pub fn changed(self) -> bool {
        matches!(self, CacheWrite::Inserted | CacheWrite::Updated { .. })
    }

    pub fn rejected(self) -> bool {
        matches!(self, CacheWrite::RejectedStale | CacheWrite::RejectedShrink)
    }
}

/// Keyed store of the latest accepted poll results.
///
/// Cloning shares the underlying map. Each key has a single writer (its poll
/// watcher); every clone may read.
#[derive(Debug, Clone, Default)]
pub struct QueryCache {
    entries: Arc<RwLock<HashMap<QueryKey, CachedQuery>>>,
    next_seq: Arc<AtomicU64>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number to tag a request with before it is issued.
    pub fn issue_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn apply(
        &self,
        key: &QueryKey,
        seq: u64,
        result: QueryResult,
        policy: CachePolicy,
        now: Instant,
    ) -> CacheWrite {
        let mut entries = write_recovering(&self.entries, "query_cache");
        let Some(entry) = entries.get_mut(key) else {
            entries.insert(
                key.clone(),
                CachedQuery {
                    result,
                    version: 1,
                    seq,
                    updated_at: now,
                },
            );
            return CacheWrite::Inserted;
        };

        if seq < entry.seq {
            return CacheWrite::RejectedStale;
        }
        if shrinks(&entry.result, &result, policy) {
            return CacheWrite::RejectedShrink;
        }

        entry.seq = seq;
        if entry.result == result {
            return CacheWrite::Unchanged;
        }

        entry.result = result;
        entry.version = entry.version.saturating_add(1);
        entry.updated_at = now;
        CacheWrite::Updated {
            version: entry.version,
        }
    }

    pub fn get(&self, key: &QueryKey) -> Option<CachedQuery> {
        read_recovering(&self.entries, "query_cache").get(key).cloned()
    }

    pub fn version(&self, key: &QueryKey) -> u64 {
        read_recovering(&self.entries, "query_cache")
            .get(key)
            .map(|entry| entry.version)
            .unwrap_or(0)
    }

    /// Runs `read` against the cached result without cloning it.
    pub fn with_result<R>(&self, key: &QueryKey, read: impl FnOnce(&QueryResult) -> R) -> Option<R> {
        read_recovering(&self.entries, "query_cache")
            .get(key)
            .map(|entry| read(&entry.result))
    }

    pub fn keys(&self) -> Vec<QueryKey> {
        let mut keys: Vec<QueryKey> = read_recovering(&self.entries, "query_cache")
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        read_recovering(&self.entries, "query_cache").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A newer result never carries fewer rows than the cached one. Logs must
/// also keep every entry already seen.
fn shrinks(cached: &QueryResult, incoming: &QueryResult, policy: CachePolicy) -> bool {
    if incoming.len() < cached.len() {
        return true;
    }
    policy == CachePolicy::AppendOnly
        && cached
            .rows()
            .iter()
            .any(|row| incoming.row(&row.id).is_none())
}
