use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::merge::OptimisticSnapshot;
use crate::reconciler::Expectation;

/// Opaque ledger transaction identifier (e.g. a transaction hash).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxId(pub String);

impl TxId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TxId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TxId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    Attack,
    Flee,
    Purchase,
    Upgrade,
    Explore,
    Other(String),
}

impl ActionKind {
    /// Progress verb shown while the transaction settles.
    pub fn verb(&self) -> &str {
        match self {
            ActionKind::Attack => "Attacking",
            ActionKind::Flee => "Fleeing",
            ActionKind::Purchase => "Purchasing",
            ActionKind::Upgrade => "Upgrading",
            ActionKind::Explore => "Exploring",
            ActionKind::Other(name) => name.as_str(),
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Attack => f.write_str("Attack"),
            ActionKind::Flee => f.write_str("Flee"),
            ActionKind::Purchase => f.write_str("Purchase"),
            ActionKind::Upgrade => f.write_str("Upgrade"),
            ActionKind::Explore => f.write_str("Explore"),
            ActionKind::Other(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TxPhase {
    Submitted,
    Pending,
    Confirmed,
    Failed,
}

impl TxPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, TxPhase::Confirmed | TxPhase::Failed)
    }

    pub fn is_in_flight(self) -> bool {
        !self.is_terminal()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FailureReason {
    Rejected(String),
    Reverted(String),
    ConfirmationTimeout,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Rejected(reason) => write!(f, "rejected by the network: {reason}"),
            FailureReason::Reverted(reason) => write!(f, "reverted on chain: {reason}"),
            FailureReason::ConfirmationTimeout => {
                f.write_str("timed out waiting for the indexer to confirm")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Confirmed,
    Failed(FailureReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    Entered(TxPhase),
}

impl Transition {
    pub fn entered(self) -> Option<TxPhase> {
        match self {
            Transition::Unchanged => None,
            Transition::Entered(phase) => Some(phase),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("transaction {active} is still outstanding")]
    HandleActive { active: TxId },
    #[error("no transaction is being tracked")]
    NoActiveHandle,
    #[error("transaction {tx_id} is {phase:?}; only confirmed or failed transactions can be acknowledged")]
    NotTerminal { tx_id: TxId, phase: TxPhase },
}

#[derive(Debug, Clone)]
pub struct TransactionHandle {
    tx_id: TxId,
    kind: ActionKind,
    label: String,
    created_at: Instant,
    phase: TxPhase,
    phase_changed_at: Instant,
    snapshot: OptimisticSnapshot,
    expectation: Option<Expectation>,
    failure: Option<FailureReason>,
}

impl TransactionHandle {
    pub fn tx_id(&self) -> &TxId {
        &self.tx_id
    }

    pub fn kind(&self) -> &ActionKind {
        &self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn phase(&self) -> TxPhase {
        self.phase
    }

    pub fn phase_changed_at(&self) -> Instant {
        self.phase_changed_at
    }

    pub fn snapshot(&self) -> &OptimisticSnapshot {
        &self.snapshot
    }

    pub fn expectation(&self) -> Option<&Expectation> {
        self.expectation.as_ref()
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        self.failure.as_ref()
    }

    fn enter(&mut self, phase: TxPhase, now: Instant) {
        self.phase = phase;
        self.phase_changed_at = now;
    }
}

/// A retired transaction, kept for the activity list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxRecord {
    pub tx_id: TxId,
    pub kind: ActionKind,
    pub description: String,
    pub phase: TxPhase,
    pub failure: Option<FailureReason>,
}

#[derive(Debug)]
pub struct LifecycleTracker {
    active: Option<TransactionHandle>,
    confirmation_timeout: Duration,
    history: VecDeque<TxRecord>,
    history_capacity: usize,
}

impl LifecycleTracker {
    pub fn new(confirmation_timeout: Duration, history_capacity: usize) -> Self {
        Self {
            active: None,
            confirmation_timeout,
            history: VecDeque::new(),
            history_capacity,
        }
    }

    pub fn confirmation_timeout(&self) -> Duration {
        self.confirmation_timeout
    }

    pub fn current(&self) -> Option<&TransactionHandle> {
        self.active.as_ref()
    }

    pub fn history(&self) -> impl Iterator<Item = &TxRecord> {
        self.history.iter()
    }

    pub fn begin(
        &mut self,
        tx_id: TxId,
        kind: ActionKind,
        label: String,
        snapshot: OptimisticSnapshot,
        expectation: Option<Expectation>,
        now: Instant,
    ) -> Result<&TransactionHandle, LifecycleError> {
        if let Some(active) = &self.active {
            return Err(LifecycleError::HandleActive {
                active: active.tx_id.clone(),
            });
        }

        info!(
            tx_id = %tx_id,
            kind = %kind,
            label = label.as_str(),
            has_expectation = expectation.is_some(),
            "tx_submitted"
        );
        Ok(&*self.active.insert(TransactionHandle {
            tx_id,
            kind,
            label,
            created_at: now,
            phase: TxPhase::Submitted,
            phase_changed_at: now,
            snapshot,
            expectation,
            failure: None,
        }))
    }

    /// The network acknowledged the broadcast; start waiting for the indexer.
    pub fn mark_pending(&mut self, now: Instant) -> Result<Transition, LifecycleError> {
        let handle = self.active.as_mut().ok_or(LifecycleError::NoActiveHandle)?;
        if handle.phase != TxPhase::Submitted {
            return Ok(Transition::Unchanged);
        }
        handle.enter(TxPhase::Pending, now);
        info!(tx_id = %handle.tx_id, "tx_pending");
        Ok(Transition::Entered(TxPhase::Pending))
    }

    /// Moves the active handle to a terminal phase. Terminal phases are
    /// sticky: later signals report `Unchanged`.
    pub fn resolve(&mut self, outcome: Outcome, now: Instant) -> Result<Transition, LifecycleError> {
        let handle = self.active.as_mut().ok_or(LifecycleError::NoActiveHandle)?;
        if handle.phase.is_terminal() {
            return Ok(Transition::Unchanged);
        }

        match outcome {
            Outcome::Confirmed => {
                handle.enter(TxPhase::Confirmed, now);
                info!(
                    tx_id = %handle.tx_id,
                    kind = %handle.kind,
                    elapsed_ms = now.saturating_duration_since(handle.created_at).as_millis() as u64,
                    "tx_confirmed"
                );
                Ok(Transition::Entered(TxPhase::Confirmed))
            }
            Outcome::Failed(reason) => {
                warn!(
                    tx_id = %handle.tx_id,
                    kind = %handle.kind,
                    reason = %reason,
                    "tx_failed"
                );
                handle.failure = Some(reason);
                handle.enter(TxPhase::Failed, now);
                Ok(Transition::Entered(TxPhase::Failed))
            }
        }
    }

    /// Fails an in-flight handle whose wait budget has run out.
    pub fn check_timeout(&mut self, now: Instant) -> Transition {
        let Some(handle) = self.active.as_ref() else {
            return Transition::Unchanged;
        };
        if handle.phase.is_terminal() {
            return Transition::Unchanged;
        }
        if now.saturating_duration_since(handle.created_at) < self.confirmation_timeout {
            return Transition::Unchanged;
        }
        self.resolve(Outcome::Failed(FailureReason::ConfirmationTimeout), now)
            .unwrap_or(Transition::Unchanged)
    }

    /// Retires a terminal handle once the consumer has rendered it.
    pub fn acknowledge(&mut self) -> Result<TransactionHandle, LifecycleError> {
        let handle = self.active.as_ref().ok_or(LifecycleError::NoActiveHandle)?;
        if !handle.phase.is_terminal() {
            return Err(LifecycleError::NotTerminal {
                tx_id: handle.tx_id.clone(),
                phase: handle.phase,
            });
        }

        let handle = self.active.take().ok_or(LifecycleError::NoActiveHandle)?;
        push_bounded(
            &mut self.history,
            TxRecord {
                tx_id: handle.tx_id.clone(),
                kind: handle.kind.clone(),
                description: handle.label.clone(),
                phase: handle.phase,
                failure: handle.failure.clone(),
            },
            self.history_capacity,
        );
        info!(tx_id = %handle.tx_id, phase = ?handle.phase, "tx_acknowledged");
        Ok(handle)
    }
}

fn push_bounded<T>(queue: &mut VecDeque<T>, value: T, max_len: usize) {
    if max_len == 0 {
        return;
    }
    while queue.len() >= max_len {
        queue.pop_front();
    }
    queue.push_back(value);
}
