//! Read-model side: indexer polling and the query cache it feeds.

mod cache;
mod expectation;
mod poller;
mod query;
mod stats;

pub use cache::{CacheWrite, CachedQuery, QueryCache};
pub use expectation::Expectation;
pub use poller::{Indexer, IndexerError, PollingReconciler};
pub use query::{CachePolicy, QueryKey, QueryResult, QuerySpec, Row};
pub use stats::{PollStatsHandle, PollStatsSnapshot};
