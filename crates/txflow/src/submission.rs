use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::intent::{Batch, IntentQueue};
use crate::lifecycle::{ActionKind, LifecycleTracker, TxId};
use crate::merge::OptimisticSnapshot;
use crate::reconciler::Expectation;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BroadcastError {
    #[error("the player rejected the signature request")]
    UserRejected,
    #[error("signer error: {0}")]
    Signer(String),
    #[error("network error: {0}")]
    Network(String),
}

/// What the network currently reports for a broadcast transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkStatus {
    Unknown,
    Received,
    Accepted,
    Rejected(String),
    Reverted(String),
}

/// Signs and sends a batch as one transaction. Signing details stay behind
/// this seam.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn broadcast(&self, batch: &Batch) -> Result<TxId, BroadcastError>;

    async fn status(&self, tx_id: &TxId) -> Result<NetworkStatus, BroadcastError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmissionError {
    #[error("transaction {outstanding} has not been acknowledged yet")]
    BatchInFlight { outstanding: TxId },
    #[error("broadcast failed: {0}")]
    Broadcast(#[from] BroadcastError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    NothingToSubmit,
    Submitted(TxId),
}

/// Everything the tracker needs to know about the batch being submitted.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub kind: ActionKind,
    pub label: Option<String>,
    pub snapshot: OptimisticSnapshot,
    pub expectation: Option<Expectation>,
}

impl SubmitRequest {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            label: None,
            snapshot: OptimisticSnapshot::default(),
            expectation: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_snapshot(mut self, snapshot: OptimisticSnapshot) -> Self {
        self.snapshot = snapshot;
        self
    }

    pub fn expecting(mut self, expectation: Expectation) -> Self {
        self.expectation = Some(expectation);
        self
    }

    fn resolved_label(&self) -> String {
        self.label
            .clone()
            .unwrap_or_else(|| self.kind.verb().to_string())
    }
}

pub struct SubmissionCoordinator {
    broadcaster: Arc<dyn Broadcaster>,
}

impl SubmissionCoordinator {
    pub fn new(broadcaster: Arc<dyn Broadcaster>) -> Self {
        Self { broadcaster }
    }

    /// Drains `queue` and broadcasts it as a single transaction.
    ///
    /// A failed broadcast loses the batch; nothing is retried or re-queued.
    pub async fn submit(
        &self,
        queue: &mut IntentQueue,
        tracker: &mut LifecycleTracker,
        request: SubmitRequest,
        now: Instant,
    ) -> Result<SubmitOutcome, SubmissionError> {
        if let Some(outstanding) = tracker.current() {
            debug!(
                outstanding = %outstanding.tx_id(),
                queued = queue.len(),
                "submit_rejected_batch_in_flight"
            );
            return Err(SubmissionError::BatchInFlight {
                outstanding: outstanding.tx_id().clone(),
            });
        }

        let batch = queue.drain_all();
        if batch.is_empty() {
            debug!("submit_nothing_to_submit");
            return Ok(SubmitOutcome::NothingToSubmit);
        }

        let intent_count = batch.len();
        let tx_id = match self.broadcaster.broadcast(&batch).await {
            Ok(tx_id) => tx_id,
            Err(error) => {
                warn!(
                    kind = %request.kind,
                    intent_count,
                    error = %error,
                    "submit_broadcast_failed"
                );
                return Err(error.into());
            }
        };
        info!(tx_id = %tx_id, kind = %request.kind, intent_count, "batch_broadcast");

        let label = request.resolved_label();
        tracker
            .begin(
                tx_id.clone(),
                request.kind,
                label,
                request.snapshot,
                request.expectation,
                now,
            )
            .map_err(|_| SubmissionError::BatchInFlight {
                outstanding: tx_id.clone(),
            })?;
        Ok(SubmitOutcome::Submitted(tx_id))
    }

    pub async fn network_status(&self, tx_id: &TxId) -> Result<NetworkStatus, BroadcastError> {
        self.broadcaster.status(tx_id).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::intent::Intent;
    use crate::lifecycle::TxPhase;

    #[derive(Default)]
    struct RecordingBroadcaster {
        results: Mutex<VecDeque<Result<TxId, BroadcastError>>>,
        batches: Mutex<Vec<Batch>>,
    }

    impl RecordingBroadcaster {
        fn returning(results: Vec<Result<TxId, BroadcastError>>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results.into()),
                batches: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.batches.lock().expect("batches").len()
        }
    }

    #[async_trait]
    impl Broadcaster for RecordingBroadcaster {
        async fn broadcast(&self, batch: &Batch) -> Result<TxId, BroadcastError> {
            self.batches.lock().expect("batches").push(batch.clone());
            self.results
                .lock()
                .expect("results")
                .pop_front()
                .unwrap_or_else(|| Err(BroadcastError::Network("unscripted".to_string())))
        }

        async fn status(&self, _tx_id: &TxId) -> Result<NetworkStatus, BroadcastError> {
            Ok(NetworkStatus::Unknown)
        }
    }

    fn tracker() -> LifecycleTracker {
        LifecycleTracker::new(Duration::from_secs(150), 8)
    }

    #[tokio::test]
    async fn empty_batch_never_reaches_broadcaster() {
        let broadcaster = RecordingBroadcaster::returning(Vec::new());
        let coordinator = SubmissionCoordinator::new(broadcaster.clone());
        let mut queue = IntentQueue::new();
        let mut tracker = tracker();

        let outcome = coordinator
            .submit(
                &mut queue,
                &mut tracker,
                SubmitRequest::new(ActionKind::Attack),
                Instant::now(),
            )
            .await
            .expect("submit");

        assert_eq!(outcome, SubmitOutcome::NothingToSubmit);
        assert_eq!(broadcaster.calls(), 0);
        assert!(tracker.current().is_none());
    }

    #[tokio::test]
    async fn success_broadcasts_full_batch_once_and_begins_tracking() {
        let broadcaster = RecordingBroadcaster::returning(vec![Ok(TxId::from("0xabc"))]);
        let coordinator = SubmissionCoordinator::new(broadcaster.clone());
        let mut queue = IntentQueue::new();
        let mut tracker = tracker();
        queue.enqueue(Intent::upgrade("0x0adv", "2")).expect("enqueue");
        queue.enqueue(Intent::purchase("0x0market", "14")).expect("enqueue");

        let outcome = coordinator
            .submit(
                &mut queue,
                &mut tracker,
                SubmitRequest::new(ActionKind::Purchase),
                Instant::now(),
            )
            .await
            .expect("submit");

        assert_eq!(outcome, SubmitOutcome::Submitted(TxId::from("0xabc")));
        assert!(queue.is_empty());
        let batches = broadcaster.batches.lock().expect("batches");
        assert_eq!(batches.len(), 1);
        let entry_points: Vec<&str> = batches[0]
            .intents()
            .iter()
            .map(|intent| intent.entry_point.as_str())
            .collect();
        assert_eq!(entry_points, vec!["upgrade_stat", "purchase"]);

        let handle = tracker.current().expect("handle");
        assert_eq!(handle.phase(), TxPhase::Submitted);
        assert_eq!(handle.label(), "Purchasing");
    }

    #[tokio::test]
    async fn second_submit_while_in_flight_is_rejected_without_side_effects() {
        let broadcaster = RecordingBroadcaster::returning(vec![Ok(TxId::from("0xabc"))]);
        let coordinator = SubmissionCoordinator::new(broadcaster.clone());
        let mut queue = IntentQueue::new();
        let mut tracker = tracker();
        queue.enqueue(Intent::attack("0x0beast", "7")).expect("enqueue");
        coordinator
            .submit(
                &mut queue,
                &mut tracker,
                SubmitRequest::new(ActionKind::Attack),
                Instant::now(),
            )
            .await
            .expect("first submit");

        queue.enqueue(Intent::flee("0x0beast", "7")).expect("enqueue");
        let error = coordinator
            .submit(
                &mut queue,
                &mut tracker,
                SubmitRequest::new(ActionKind::Flee),
                Instant::now(),
            )
            .await
            .expect_err("second submit");

        assert_eq!(
            error,
            SubmissionError::BatchInFlight {
                outstanding: TxId::from("0xabc")
            }
        );
        assert_eq!(broadcaster.calls(), 1);
        assert_eq!(queue.len(), 1);
        let handle = tracker.current().expect("handle");
        assert_eq!(handle.tx_id(), &TxId::from("0xabc"));
        assert_eq!(handle.kind(), &ActionKind::Attack);
    }

    #[tokio::test]
    async fn rejected_signature_loses_batch_and_creates_no_handle() {
        let broadcaster = RecordingBroadcaster::returning(vec![Err(BroadcastError::UserRejected)]);
        let coordinator = SubmissionCoordinator::new(broadcaster.clone());
        let mut queue = IntentQueue::new();
        let mut tracker = tracker();
        queue.enqueue(Intent::flee("0x0beast", "7")).expect("enqueue");

        let error = coordinator
            .submit(
                &mut queue,
                &mut tracker,
                SubmitRequest::new(ActionKind::Flee),
                Instant::now(),
            )
            .await
            .expect_err("rejected");

        assert_eq!(error, SubmissionError::Broadcast(BroadcastError::UserRejected));
        assert!(queue.is_empty());
        assert!(tracker.current().is_none());
        assert_eq!(broadcaster.calls(), 1);
        queue.enqueue(Intent::flee("0x0beast", "7")).expect("cart reusable");
    }

    #[tokio::test(start_paused = true)]
    async fn handle_is_stamped_with_caller_clock() {
        let broadcaster = RecordingBroadcaster::returning(vec![Ok(TxId::from("0xabc"))]);
        let coordinator = SubmissionCoordinator::new(broadcaster);
        let mut queue = IntentQueue::new();
        let mut tracker = tracker();
        queue.enqueue(Intent::attack("0x0beast", "7")).expect("enqueue");
        let clicked_at = Instant::now();
        tokio::time::advance(Duration::from_secs(60)).await;

        coordinator
            .submit(
                &mut queue,
                &mut tracker,
                SubmitRequest::new(ActionKind::Attack),
                clicked_at,
            )
            .await
            .expect("submit");

        assert_eq!(tracker.current().expect("handle").created_at(), clicked_at);
        assert!(tracker
            .check_timeout(clicked_at + Duration::from_secs(150))
            .entered()
            .is_some());
    }
}
