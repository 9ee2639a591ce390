//! Simulated ledger and indexer the arena plays against.

mod ledger;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{info, warn};
use txflow::{
    Batch, BroadcastError, Broadcaster, Indexer, IndexerError, NetworkStatus, QueryKey,
    QueryResult, Row, TxId,
};

pub(crate) use ledger::{AdventurerState, BeastState, LedgerTiming, WorldState};
use ledger::{Ledger, LedgerTxState};

pub(crate) const BEAST_QUERY: &str = "beastById";
pub(crate) const BATTLES_QUERY: &str = "battlesByBeast";
pub(crate) const ADVENTURER_QUERY: &str = "adventurerById";

#[derive(Debug, Clone)]
pub(crate) struct SimSettings {
    pub(crate) timing: LedgerTiming,
    /// 1-based broadcast number the simulated wallet refuses to sign.
    pub(crate) decline_signature_at: Option<usize>,
    /// Every n-th indexer request fails with a transient error.
    pub(crate) indexer_failure_every: Option<u64>,
}

pub(crate) struct SimChain {
    ledger: Mutex<Ledger>,
    settings: SimSettings,
    broadcasts: AtomicUsize,
    fetches: AtomicU64,
}

impl SimChain {
    pub(crate) fn new(genesis: WorldState, settings: SimSettings) -> Self {
        Self {
            ledger: Mutex::new(Ledger::new(genesis, settings.timing, Instant::now())),
            settings,
            broadcasts: AtomicUsize::new(0),
            fetches: AtomicU64::new(0),
        }
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Broadcaster for SimChain {
    async fn broadcast(&self, batch: &Batch) -> Result<TxId, BroadcastError> {
        let attempt = self.broadcasts.fetch_add(1, Ordering::Relaxed) + 1;
        if self.settings.decline_signature_at == Some(attempt) {
            info!(attempt, intents = batch.len(), "wallet_declined_signature");
            return Err(BroadcastError::UserRejected);
        }
        Ok(self.ledger().submit(batch.intents().to_vec(), Instant::now()))
    }

    async fn status(&self, tx_id: &TxId) -> Result<NetworkStatus, BroadcastError> {
        let status = match self.ledger().status(tx_id, Instant::now()) {
            None => NetworkStatus::Unknown,
            Some(LedgerTxState::Received) => NetworkStatus::Received,
            Some(LedgerTxState::Accepted) => NetworkStatus::Accepted,
            Some(LedgerTxState::Reverted(reason)) => NetworkStatus::Reverted(reason),
        };
        Ok(status)
    }
}

#[async_trait]
impl Indexer for SimChain {
    async fn fetch(&self, key: &QueryKey) -> Result<QueryResult, IndexerError> {
        let request = self.fetches.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(every) = self.settings.indexer_failure_every {
            if every > 0 && request % every == 0 {
                warn!(query = %key, request, "sim_indexer_timeout");
                return Err(IndexerError::Request("indexer timed out".to_string()));
            }
        }

        let mut ledger = self.ledger();
        rows_for(ledger.indexed_view(Instant::now()), key).map(QueryResult::new)
    }
}

fn rows_for(world: &WorldState, key: &QueryKey) -> Result<Vec<Row>, IndexerError> {
    match key.name() {
        BEAST_QUERY => {
            let id = required_var(key, "id")?;
            let beast = &world.beast;
            if beast.id != id {
                return Ok(Vec::new());
            }
            Ok(vec![Row::new(&beast.id)
                .with_field("beast", &beast.name)
                .with_field("health", beast.health.to_string())
                .with_field("fled", beast.fled.to_string())])
        }
        BATTLES_QUERY => {
            let beast_id = required_var(key, "beastId")?;
            if world.beast.id != beast_id {
                return Ok(Vec::new());
            }
            Ok(world
                .battles
                .iter()
                .map(|battle| {
                    Row::new(&battle.id)
                        .with_field("action", battle.action)
                        .with_field("damageDealt", battle.damage_dealt.to_string())
                        .with_field("damageTaken", battle.damage_taken.to_string())
                        .with_field("txHash", battle.tx_id.as_str())
                })
                .collect())
        }
        ADVENTURER_QUERY => {
            let id = required_var(key, "id")?;
            let adventurer = &world.adventurer;
            if adventurer.id != id {
                return Ok(Vec::new());
            }
            Ok(vec![Row::new(&adventurer.id)
                .with_field("health", adventurer.health.to_string())])
        }
        other => Err(IndexerError::Request(format!("unknown query {other}"))),
    }
}

fn required_var<'a>(key: &'a QueryKey, var: &str) -> Result<&'a str, IndexerError> {
    key.var(var)
        .ok_or_else(|| IndexerError::Decode(format!("query {} is missing `{var}`", key.name())))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::sleep;
    use txflow::Intent;

    use super::*;

    fn genesis() -> WorldState {
        WorldState {
            beast: BeastState {
                id: "7".to_string(),
                name: "Gnome".to_string(),
                health: 30,
                fled: false,
            },
            adventurer: AdventurerState {
                id: "2".to_string(),
                health: 100,
            },
            battles: Vec::new(),
        }
    }

    fn settings() -> SimSettings {
        SimSettings {
            timing: LedgerTiming {
                accept_after: Duration::from_millis(800),
                index_lag: Duration::from_millis(1200),
            },
            decline_signature_at: Some(2),
            indexer_failure_every: None,
        }
    }

    fn batch(intent: Intent) -> Batch {
        Batch::from(vec![intent])
    }

    #[tokio::test(start_paused = true)]
    async fn status_and_rows_follow_ledger_then_indexer_lag() {
        let chain = SimChain::new(genesis(), settings());
        let beast_key = QueryKey::new(BEAST_QUERY).with_var("id", "7");
        let tx_id = chain
            .broadcast(&batch(Intent::attack("0x0arena", "7")))
            .await
            .expect("broadcast");

        assert_eq!(chain.status(&tx_id).await, Ok(NetworkStatus::Received));
        sleep(Duration::from_millis(800)).await;
        assert_eq!(chain.status(&tx_id).await, Ok(NetworkStatus::Accepted));

        let before = chain.fetch(&beast_key).await.expect("fetch");
        assert_eq!(before.row("7").and_then(|row| row.field("health")), Some("30"));
        sleep(Duration::from_millis(1200)).await;
        let after = chain.fetch(&beast_key).await.expect("fetch");
        assert_eq!(after.row("7").and_then(|row| row.field("health")), Some("18"));
    }

    #[tokio::test(start_paused = true)]
    async fn wallet_declines_only_the_configured_attempt() {
        let chain = SimChain::new(genesis(), settings());
        let attack = batch(Intent::attack("0x0arena", "7"));

        assert!(chain.broadcast(&attack).await.is_ok());
        assert_eq!(
            chain.broadcast(&attack).await,
            Err(BroadcastError::UserRejected)
        );
        assert!(chain.broadcast(&attack).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn indexer_serves_empty_rows_for_unknown_entities_and_rejects_unknown_queries() {
        let chain = SimChain::new(genesis(), settings());

        let other_beast = QueryKey::new(BEAST_QUERY).with_var("id", "8");
        assert!(chain.fetch(&other_beast).await.expect("fetch").is_empty());

        let missing_var = QueryKey::new(BATTLES_QUERY);
        assert!(matches!(
            chain.fetch(&missing_var).await,
            Err(IndexerError::Decode(_))
        ));
        assert!(matches!(
            chain.fetch(&QueryKey::new("itemsByOwner")).await,
            Err(IndexerError::Request(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_indexer_failures_are_transient() {
        let chain = SimChain::new(
            genesis(),
            SimSettings {
                indexer_failure_every: Some(2),
                ..settings()
            },
        );
        let key = QueryKey::new(ADVENTURER_QUERY).with_var("id", "2");

        assert!(chain.fetch(&key).await.is_ok());
        assert!(chain.fetch(&key).await.is_err());
        assert!(chain.fetch(&key).await.is_ok());
    }
}
