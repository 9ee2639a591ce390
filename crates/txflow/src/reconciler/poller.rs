use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cache::QueryCache;
use super::expectation::Expectation;
use super::query::{CachePolicy, QueryKey, QueryResult, QuerySpec};
use super::stats::PollStatsHandle;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexerError {
    #[error("indexer request failed: {0}")]
    Request(String),
    #[error("indexer response could not be decoded: {0}")]
    Decode(String),
}

/// Read side of the ledger: named, parameterized queries returning rows.
#[async_trait]
pub trait Indexer: Send + Sync {
    async fn fetch(&self, key: &QueryKey) -> Result<QueryResult, IndexerError>;
}

struct Watcher {
    policy: CachePolicy,
    token: CancellationToken,
    wake: Arc<Notify>,
    task: JoinHandle<()>,
}

/// Keeps a set of indexer queries fresh in a shared [`QueryCache`].
///
/// Each watched key gets its own task: polls for one key never overlap, and a
/// slow key never delays another. Watchers must be started from inside a
/// tokio runtime.
pub struct PollingReconciler {
    indexer: Arc<dyn Indexer>,
    cache: QueryCache,
    stats: PollStatsHandle,
    interval: Duration,
    root: CancellationToken,
    watchers: HashMap<QueryKey, Watcher>,
}

impl PollingReconciler {
    pub fn new(indexer: Arc<dyn Indexer>, interval: Duration) -> Self {
        Self::with_cache(indexer, interval, QueryCache::new())
    }

    pub fn with_cache(indexer: Arc<dyn Indexer>, interval: Duration, cache: QueryCache) -> Self {
        Self {
            indexer,
            cache,
            stats: PollStatsHandle::default(),
            interval: normalize_interval(interval),
            root: CancellationToken::new(),
            watchers: HashMap::new(),
        }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn stats(&self) -> PollStatsHandle {
        self.stats.clone()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Starts polling `spec.key`. Returns false if it is already watched or
    /// the reconciler has been stopped.
    pub fn watch(&mut self, spec: QuerySpec) -> bool {
        if self.root.is_cancelled() {
            warn!(query = %spec.key, "poll_watch_rejected_after_stop");
            return false;
        }
        if self.watchers.contains_key(&spec.key) {
            return false;
        }

        let token = self.root.child_token();
        let wake = Arc::new(Notify::new());
        let task = tokio::spawn(run_watcher(WatcherContext {
            key: spec.key.clone(),
            policy: spec.policy,
            indexer: Arc::clone(&self.indexer),
            cache: self.cache.clone(),
            stats: self.stats.clone(),
            interval: self.interval,
            token: token.clone(),
            wake: Arc::clone(&wake),
        }));
        info!(
            query = %spec.key,
            policy = ?spec.policy,
            interval_ms = self.interval.as_millis() as u64,
            "poll_watch_started"
        );
        self.watchers.insert(
            spec.key,
            Watcher {
                policy: spec.policy,
                token,
                wake,
                task,
            },
        );
        true
    }

    /// Stops polling `key`. Its cached value stays readable.
    pub fn unwatch(&mut self, key: &QueryKey) -> bool {
        match self.watchers.remove(key) {
            Some(watcher) => {
                watcher.token.cancel();
                info!(query = %key, "poll_watch_stopped");
                true
            }
            None => false,
        }
    }

    /// Points the query named `spec.key.name()` at a new variable set, e.g.
    /// once a transaction reveals which beast it targets. Watchers for other
    /// variable sets of the same query stop; cached entries are kept.
    pub fn retarget(&mut self, spec: QuerySpec) -> bool {
        let superseded: Vec<QueryKey> = self
            .watchers
            .keys()
            .filter(|key| key.name() == spec.key.name() && **key != spec.key)
            .cloned()
            .collect();
        for key in &superseded {
            self.unwatch(key);
        }
        if !superseded.is_empty() {
            debug!(
                query = %spec.key,
                superseded = superseded.len(),
                "poll_watch_retargeted"
            );
        }
        self.watch(spec)
    }

    /// Wakes the watcher for `key` so it polls without waiting for its next tick.
    pub fn poll_now(&self, key: &QueryKey) -> bool {
        match self.watchers.get(key) {
            Some(watcher) => {
                watcher.wake.notify_one();
                true
            }
            None => false,
        }
    }

    pub fn is_watching(&self, key: &QueryKey) -> bool {
        self.watchers.contains_key(key)
    }

    pub fn policy(&self, key: &QueryKey) -> Option<CachePolicy> {
        self.watchers.get(key).map(|watcher| watcher.policy)
    }

    pub fn watched_keys(&self) -> Vec<QueryKey> {
        let mut keys: Vec<QueryKey> = self.watchers.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn is_confirmed(&self, expectation: &Expectation) -> bool {
        expectation.is_satisfied(&self.cache)
    }

    pub fn is_stopped(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Cancels every watcher, including requests already in flight. On a
    /// current-thread runtime no cache write happens after this returns. A
    /// watcher on another worker thread may still finish the write it already
    /// started, so await [`shutdown`](Self::shutdown) when that matters.
    pub fn stop(&mut self) {
        self.root.cancel();
        let stopped = self.watchers.len();
        self.watchers.clear();
        info!(stopped, "poll_reconciler_stopped");
    }

    /// Like [`stop`](Self::stop), but also waits for the watcher tasks to
    /// exit. No cache write happens after this returns on any runtime.
    pub async fn shutdown(&mut self) {
        self.root.cancel();
        for (key, watcher) in self.watchers.drain() {
            if let Err(err) = watcher.task.await {
                debug!(query = %key, ?err, "poll watcher exited with error");
            }
        }
        info!("poll_reconciler_shutdown");
    }

    /// Re-arms a stopped reconciler so new watchers can be started.
    pub fn resume(&mut self) {
        if self.root.is_cancelled() {
            self.root = CancellationToken::new();
            info!("poll_reconciler_resumed");
        }
    }
}

impl Drop for PollingReconciler {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

struct WatcherContext {
    key: QueryKey,
    policy: CachePolicy,
    indexer: Arc<dyn Indexer>,
    cache: QueryCache,
    stats: PollStatsHandle,
    interval: Duration,
    token: CancellationToken,
    wake: Arc<Notify>,
}

async fn run_watcher(ctx: WatcherContext) {
    let mut ticker = time::interval(ctx.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = ctx.token.cancelled() => break,
            _ = ticker.tick() => {}
            _ = ctx.wake.notified() => {
                ticker.reset();
            }
        }

        let seq = ctx.cache.issue_seq();
        ctx.stats.record_issued();
        let fetched = tokio::select! {
            biased;
            _ = ctx.token.cancelled() => break,
            fetched = ctx.indexer.fetch(&ctx.key) => fetched,
        };
        if ctx.token.is_cancelled() {
            break;
        }

        match fetched {
            Ok(result) => {
                let rows = result.len();
                let write = ctx
                    .cache
                    .apply(&ctx.key, seq, result, ctx.policy, Instant::now());
                ctx.stats.record_write(write);
                if write.changed() {
                    debug!(query = %ctx.key, seq, rows, write = ?write, "poll_cache_updated");
                } else if write.rejected() {
                    debug!(query = %ctx.key, seq, rows, write = ?write, "poll_result_discarded");
                }
            }
            Err(error) => {
                ctx.stats.record_failed();
                warn!(query = %ctx.key, seq, error = %error, "poll_failed");
            }
        }
    }

    debug!(query = %ctx.key, "poll_watcher_exited");
}

fn normalize_interval(interval: Duration) -> Duration {
    if interval.is_zero() {
        crate::config::DEFAULT_POLL_INTERVAL
    } else {
        interval
    }
}
