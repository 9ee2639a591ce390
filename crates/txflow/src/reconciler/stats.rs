use std::sync::{Arc, RwLock};

use crate::lock::{read_recovering, write_recovering};

use super::cache::CacheWrite;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStatsSnapshot {
    pub polls_issued: u64,
    pub polls_failed: u64,
    pub cache_updates: u64,
    pub rejected_writes: u64,
}

#[derive(Clone, Debug, Default)]
pub struct PollStatsHandle {
    snapshot: Arc<RwLock<PollStatsSnapshot>>,
}

impl PollStatsHandle {
    pub fn snapshot(&self) -> PollStatsSnapshot {
        *read_recovering(&self.snapshot, "poll_stats")
    }

    pub(crate) fn record_issued(&self) {
        let mut guard = write_recovering(&self.snapshot, "poll_stats");
        guard.polls_issued = guard.polls_issued.saturating_add(1);
    }

    pub(crate) fn record_failed(&self) {
        let mut guard = write_recovering(&self.snapshot, "poll_stats");
        guard.polls_failed = guard.polls_failed.saturating_add(1);
    }

    pub(crate) fn record_write(&self, write: CacheWrite) {
        let mut guard = write_recovering(&self.snapshot, "poll_stats");
        if write.changed() {
            guard.cache_updates = guard.cache_updates.saturating_add(1);
        } else if write.rejected() {
            guard.rejected_writes = guard.rejected_writes.saturating_add(1);
        }
    }
}
