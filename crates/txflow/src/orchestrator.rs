//! The object the rendering layer holds: cart, submission, lifecycle and
//! read-model in one place, with no global state.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::intent::{Intent, IntentError, IntentQueue};
use crate::lifecycle::{
    FailureReason, LifecycleError, LifecycleTracker, Outcome, TransactionHandle, Transition,
    TxPhase, TxRecord,
};
use crate::merge::{merged_view, MergedView};
use crate::reconciler::{Indexer, PollingReconciler, QueryKey, QuerySpec};
use crate::submission::{
    Broadcaster, NetworkStatus, SubmissionCoordinator, SubmissionError, SubmitOutcome,
    SubmitRequest,
};

pub struct Orchestrator {
    config: OrchestratorConfig,
    queue: IntentQueue,
    coordinator: SubmissionCoordinator,
    tracker: LifecycleTracker,
    reconciler: PollingReconciler,
    accepted_refetch_sent: bool,
}

impl Orchestrator {
    /// Starts watching every query listed in `config`. Must be called from
    /// inside a tokio runtime.
    pub fn new(
        config: OrchestratorConfig,
        broadcaster: Arc<dyn Broadcaster>,
        indexer: Arc<dyn Indexer>,
    ) -> Self {
        let config = config.normalized();
        let mut reconciler = PollingReconciler::new(indexer, config.poll_interval);
        for spec in &config.queries {
            reconciler.watch(spec.clone());
        }
        info!(
            poll_interval_ms = config.poll_interval.as_millis() as u64,
            confirmation_timeout_ms = config.confirmation_timeout.as_millis() as u64,
            watched = config.queries.len(),
            "orchestrator_started"
        );

        Self {
            tracker: LifecycleTracker::new(config.confirmation_timeout, config.history_capacity),
            coordinator: SubmissionCoordinator::new(broadcaster),
            queue: IntentQueue::new(),
            reconciler,
            config,
            accepted_refetch_sent: false,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn enqueue(&mut self, intent: Intent) -> Result<(), IntentError> {
        self.queue.enqueue(intent)
    }

    pub fn cart(&self) -> &[Intent] {
        self.queue.intents()
    }

    pub fn cart_len(&self) -> usize {
        self.queue.len()
    }

    pub fn cancel_cart(&mut self) -> usize {
        self.queue.cancel()
    }

    pub fn remove_from_cart(&mut self, index: usize) -> Result<Intent, IntentError> {
        self.queue.remove(index)
    }

    /// Broadcasts the cart as one transaction. `now` stamps the new handle and
    /// is the origin of its confirmation timeout.
    pub async fn submit(
        &mut self,
        request: SubmitRequest,
        now: Instant,
    ) -> Result<SubmitOutcome, SubmissionError> {
        let outcome = self
            .coordinator
            .submit(&mut self.queue, &mut self.tracker, request, now)
            .await?;

        if let SubmitOutcome::Submitted(_) = &outcome {
            self.accepted_refetch_sent = false;
            self.watch_expectation_keys();
        }
        Ok(outcome)
    }

    pub fn current(&self) -> Option<&TransactionHandle> {
        self.tracker.current()
    }

    pub fn acknowledge(&mut self) -> Result<TransactionHandle, LifecycleError> {
        self.tracker.acknowledge()
    }

    pub fn history(&self) -> impl Iterator<Item = &TxRecord> {
        self.tracker.history()
    }

    /// Advances the active transaction from everything known at `now`:
    /// network status first, then the read-model, then the wait budget.
    ///
    /// Returns the last phase entered during this call, if any.
    pub async fn refresh(&mut self, now: Instant) -> Transition {
        let Some(handle) = self.tracker.current() else {
            return Transition::Unchanged;
        };
        if handle.phase().is_terminal() {
            return Transition::Unchanged;
        }
        let tx_id = handle.tx_id().clone();
        let has_expectation = handle.expectation().is_some();
        let mut transition = Transition::Unchanged;

        match self.coordinator.network_status(&tx_id).await {
            Ok(NetworkStatus::Unknown) => {}
            Ok(NetworkStatus::Received) => {
                transition = latest(transition, self.mark_pending(now));
            }
            Ok(NetworkStatus::Accepted) => {
                transition = latest(transition, self.mark_pending(now));
                if !has_expectation {
                    transition = latest(transition, self.resolve(Outcome::Confirmed, now));
                } else if !self.accepted_refetch_sent {
                    self.accepted_refetch_sent = true;
                    self.poll_expectation_keys();
                }
            }
            Ok(NetworkStatus::Rejected(reason)) => {
                transition = latest(
                    transition,
                    self.resolve(Outcome::Failed(FailureReason::Rejected(reason)), now),
                );
            }
            Ok(NetworkStatus::Reverted(reason)) => {
                transition = latest(
                    transition,
                    self.resolve(Outcome::Failed(FailureReason::Reverted(reason)), now),
                );
            }
            Err(error) => {
                warn!(tx_id = %tx_id, error = %error, "tx_status_unavailable");
            }
        }

        if self.expectation_met() {
            transition = latest(transition, self.resolve(Outcome::Confirmed, now));
        }

        latest(transition, self.tracker.check_timeout(now))
    }

    /// Rows to render for `key`, with the active transaction's snapshot
    /// applied according to its phase.
    pub fn view(&self, key: &QueryKey) -> MergedView {
        let cached = self.reconciler.cache().get(key);
        let active = self.tracker.current().map(|handle| {
            let phase = if handle.phase().is_in_flight() && self.expectation_met() {
                // The cache already shows the effect; overlaying would duplicate it.
                TxPhase::Confirmed
            } else {
                handle.phase()
            };
            (phase, handle.snapshot())
        });
        merged_view(key, cached.as_ref(), active)
    }

    pub fn reconciler(&self) -> &PollingReconciler {
        &self.reconciler
    }

    pub fn reconciler_mut(&mut self) -> &mut PollingReconciler {
        &mut self.reconciler
    }

    /// Stops all polling and waits for the watcher tasks to exit. The cart,
    /// the active handle and the cached data stay readable.
    pub async fn shutdown(&mut self) {
        self.reconciler.shutdown().await;
        info!(
            cart_len = self.queue.len(),
            active = self.tracker.current().is_some(),
            "orchestrator_shutdown"
        );
    }

    fn mark_pending(&mut self, now: Instant) -> Transition {
        self.tracker.mark_pending(now).unwrap_or(Transition::Unchanged)
    }

    fn resolve(&mut self, outcome: Outcome, now: Instant) -> Transition {
        self.tracker
            .resolve(outcome, now)
            .unwrap_or(Transition::Unchanged)
    }

    fn expectation_met(&self) -> bool {
        self.tracker
            .current()
            .and_then(TransactionHandle::expectation)
            .is_some_and(|expectation| self.reconciler.is_confirmed(expectation))
    }

    fn expectation_keys(&self) -> Vec<QueryKey> {
        self.tracker
            .current()
            .and_then(TransactionHandle::expectation)
            .map(|expectation| expectation.keys().into_iter().cloned().collect())
            .unwrap_or_default()
    }

    fn watch_expectation_keys(&mut self) {
        for key in self.expectation_keys() {
            if self.reconciler.is_watching(&key) {
                continue;
            }
            if self.reconciler.watch(QuerySpec::latest(key.clone())) {
                debug!(query = %key, "expectation_query_watched");
            }
        }
    }

    fn poll_expectation_keys(&self) {
        for key in self.expectation_keys() {
            if self.reconciler.poll_now(&key) {
                debug!(query = %key, "expectation_query_refetched");
            }
        }
    }
}

fn latest(previous: Transition, next: Transition) -> Transition {
    match next {
        Transition::Unchanged => previous,
        entered => entered,
    }
}
