use thiserror::Error;

pub mod config;
pub mod intent;
pub mod lifecycle;
mod lock;
pub mod merge;
pub mod orchestrator;
pub mod reconciler;
pub mod submission;

pub use config::{
    ConfigError, OrchestratorConfig, CONFIRMATION_TIMEOUT_ENV_VAR, DEFAULT_CONFIRMATION_TIMEOUT,
    DEFAULT_HISTORY_CAPACITY, DEFAULT_POLL_INTERVAL, HISTORY_CAPACITY_ENV_VAR,
    POLL_INTERVAL_ENV_VAR,
};
pub use intent::{Batch, Intent, IntentError, IntentQueue};
pub use lifecycle::{
    ActionKind, FailureReason, LifecycleError, LifecycleTracker, Outcome, TransactionHandle,
    Transition, TxId, TxPhase, TxRecord,
};
pub use merge::{merged_view, MergedView, OptimisticSnapshot, SnapshotBuilder, ViewSource};
pub use orchestrator::Orchestrator;
pub use reconciler::{
    CachePolicy, CacheWrite, CachedQuery, Expectation, Indexer, IndexerError, PollStatsHandle,
    PollStatsSnapshot, PollingReconciler, QueryCache, QueryKey, QueryResult, QuerySpec, Row,
};
pub use submission::{
    BroadcastError, Broadcaster, NetworkStatus, SubmissionCoordinator, SubmissionError,
    SubmitOutcome, SubmitRequest,
};

/// Any error a client of the orchestrator may need to surface.
#[derive(Debug, Error)]
pub enum TxflowError {
    #[error(transparent)]
    Intent(#[from] IntentError),
    #[error(transparent)]
    Submission(#[from] SubmissionError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
