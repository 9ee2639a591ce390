use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};
use txflow::{
    ActionKind, Batch, BroadcastError, Broadcaster, CachePolicy, CacheWrite, Expectation,
    FailureReason, Indexer, IndexerError, Intent, NetworkStatus, OptimisticSnapshot, Orchestrator,
    OrchestratorConfig, PollingReconciler, QueryCache, QueryKey, QueryResult, QuerySpec, Row,
    SubmissionError, SubmitOutcome, SubmitRequest, Transition, TxId, TxPhase, ViewSource,
};

const BEAST_CONTRACT: &str = "0x0beast";

/// Ledger and indexer double. Broadcast results and per-key responses are
/// scripted; the last response of a key's script repeats forever.
#[derive(Default)]
struct ScriptedChain {
    broadcasts: Mutex<VecDeque<Result<TxId, BroadcastError>>>,
    broadcast_calls: Mutex<Vec<Batch>>,
    status: Mutex<Option<NetworkStatus>>,
    responses: Mutex<HashMap<QueryKey, VecDeque<Vec<Row>>>>,
}

impl ScriptedChain {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn script_broadcast(&self, result: Result<TxId, BroadcastError>) {
        self.broadcasts.lock().expect("broadcasts").push_back(result);
    }

    fn set_status(&self, status: NetworkStatus) {
        *self.status.lock().expect("status") = Some(status);
    }

    fn respond(&self, key: &QueryKey, rows: Vec<Row>) {
        self.respond_in_sequence(key, vec![rows]);
    }

    fn respond_in_sequence(&self, key: &QueryKey, responses: Vec<Vec<Row>>) {
        self.responses
            .lock()
            .expect("responses")
            .insert(key.clone(), responses.into());
    }

    fn broadcast_count(&self) -> usize {
        self.broadcast_calls.lock().expect("calls").len()
    }
}

#[async_trait]
impl Broadcaster for ScriptedChain {
    async fn broadcast(&self, batch: &Batch) -> Result<TxId, BroadcastError> {
        self.broadcast_calls.lock().expect("calls").push(batch.clone());
        self.broadcasts
            .lock()
            .expect("broadcasts")
            .pop_front()
            .unwrap_or_else(|| Err(BroadcastError::Network("unscripted".to_string())))
    }

    async fn status(&self, _tx_id: &TxId) -> Result<NetworkStatus, BroadcastError> {
        Ok(self
            .status
            .lock()
            .expect("status")
            .clone()
            .unwrap_or(NetworkStatus::Unknown))
    }
}

#[async_trait]
impl Indexer for ScriptedChain {
    async fn fetch(&self, key: &QueryKey) -> Result<QueryResult, IndexerError> {
        let mut responses = self.responses.lock().expect("responses");
        let Some(script) = responses.get_mut(key) else {
            return Ok(QueryResult::empty());
        };
        let rows = if script.len() > 1 {
            script.pop_front().unwrap_or_default()
        } else {
            script.front().cloned().unwrap_or_default()
        };
        Ok(QueryResult::new(rows))
    }
}

fn beast_key() -> QueryKey {
    QueryKey::new("beastById").with_var("id", "7")
}

fn battle_log_key() -> QueryKey {
    QueryKey::new("battlesByBeast").with_var("beastId", "7")
}

fn beast(health: &str) -> Row {
    Row::new("7").with_field("beast", "Gnome").with_field("health", health)
}

fn battle(id: &str, damage: &str) -> Row {
    Row::new(id)
        .with_field("attacker", "Adventurer")
        .with_field("damage", damage)
}

fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        poll_interval: Duration::from_secs(5),
        confirmation_timeout: Duration::from_secs(150),
        history_capacity: 8,
        queries: vec![
            QuerySpec::latest(beast_key()),
            QuerySpec::append_only(battle_log_key()),
        ],
    }
}

fn attack_request() -> SubmitRequest {
    SubmitRequest::new(ActionKind::Attack)
        .with_snapshot(
            OptimisticSnapshot::builder()
                .row(beast_key(), Row::new("7").with_field("health", "5"))
                .row(battle_log_key(), battle("local-1", "25"))
                .build(),
        )
        .expecting(Expectation::Any(vec![
            Expectation::field_decreased(beast_key(), "7", "health", 30),
            Expectation::row_count_at_least(battle_log_key(), 2),
        ]))
}

async fn settle() {
    sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn attack_is_confirmed_by_polled_health_and_snapshot_is_discarded() {
    let chain = ScriptedChain::new();
    chain.respond(&beast_key(), vec![beast("30")]);
    chain.respond(&battle_log_key(), vec![battle("b1", "10")]);
    chain.script_broadcast(Ok(TxId::from("0xabc")));
    let mut orchestrator = Orchestrator::new(config(), chain.clone(), chain.clone());
    settle().await;

    orchestrator
        .enqueue(Intent::attack(BEAST_CONTRACT, "7"))
        .expect("enqueue");
    assert_eq!(orchestrator.cart_len(), 1);
    let outcome = orchestrator
        .submit(attack_request(), Instant::now())
        .await
        .expect("submit");
    assert_eq!(outcome, SubmitOutcome::Submitted(TxId::from("0xabc")));
    assert_eq!(orchestrator.cart_len(), 0);

    let handle = orchestrator.current().expect("handle");
    assert_eq!(handle.phase(), TxPhase::Submitted);
    assert_eq!(handle.kind(), &ActionKind::Attack);
    assert!(handle.label().contains("Attacking"));

    let log = orchestrator.view(&battle_log_key());
    assert_eq!(log.source, ViewSource::Optimistic);
    assert_eq!(log.len(), 2);

    chain.set_status(NetworkStatus::Accepted);
    chain.respond(&beast_key(), vec![beast("0")]);
    chain.respond(&battle_log_key(), vec![battle("b1", "10"), battle("b2", "30")]);
    orchestrator.refresh(Instant::now()).await;
    settle().await;

    assert_eq!(
        orchestrator.refresh(Instant::now()).await,
        Transition::Entered(TxPhase::Confirmed)
    );
    let view = orchestrator.view(&beast_key());
    assert_eq!(view.source, ViewSource::Polled);
    assert_eq!(view.row("7").and_then(|row| row.field("health")), Some("0"));
    assert_eq!(view.row("7").and_then(|row| row.field("beast")), Some("Gnome"));

    let log = orchestrator.view(&battle_log_key());
    assert_eq!(log.source, ViewSource::Polled);
    let ids: Vec<&str> = log.rows.iter().map(|row| row.id.as_str()).collect();
    assert_eq!(ids, vec!["b1", "b2"]);

    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn repeated_confirmation_signal_neither_retransitions_nor_double_counts() {
    let chain = ScriptedChain::new();
    chain.respond(&beast_key(), vec![beast("30")]);
    chain.respond(&battle_log_key(), vec![battle("b1", "10")]);
    chain.script_broadcast(Ok(TxId::from("0xabc")));
    let mut orchestrator = Orchestrator::new(config(), chain.clone(), chain.clone());
    settle().await;

    orchestrator
        .enqueue(Intent::attack(BEAST_CONTRACT, "7"))
        .expect("enqueue");
    orchestrator
        .submit(attack_request(), Instant::now())
        .await
        .expect("submit");
    chain.set_status(NetworkStatus::Received);
    assert_eq!(
        orchestrator.refresh(Instant::now()).await,
        Transition::Entered(TxPhase::Pending)
    );

    chain.respond(&battle_log_key(), vec![battle("b1", "10"), battle("b2", "25")]);
    sleep(Duration::from_secs(5)).await;

    assert_eq!(
        orchestrator.refresh(Instant::now()).await,
        Transition::Entered(TxPhase::Confirmed)
    );
    for _ in 0..3 {
        sleep(Duration::from_secs(5)).await;
        assert_eq!(orchestrator.refresh(Instant::now()).await, Transition::Unchanged);
    }

    let log = orchestrator.view(&battle_log_key());
    assert_eq!(log.len(), 2);
    assert!(log.row("local-1").is_none());
    assert_eq!(
        orchestrator.current().map(|handle| handle.phase()),
        Some(TxPhase::Confirmed)
    );
}

#[tokio::test(start_paused = true)]
async fn signer_rejection_loses_batch_and_frees_the_cart() {
    let chain = ScriptedChain::new();
    chain.script_broadcast(Err(BroadcastError::UserRejected));
    chain.script_broadcast(Ok(TxId::from("0xdef")));
    let mut orchestrator = Orchestrator::new(config(), chain.clone(), chain.clone());

    orchestrator
        .enqueue(Intent::flee(BEAST_CONTRACT, "7"))
        .expect("enqueue");
    let error = orchestrator
        .submit(SubmitRequest::new(ActionKind::Flee), Instant::now())
        .await
        .expect_err("rejected");

    assert!(matches!(
        error,
        SubmissionError::Broadcast(BroadcastError::UserRejected)
    ));
    assert_eq!(orchestrator.cart_len(), 0);
    assert!(orchestrator.current().is_none());

    orchestrator
        .enqueue(Intent::flee(BEAST_CONTRACT, "7"))
        .expect("cart accepts immediately");
    let outcome = orchestrator
        .submit(SubmitRequest::new(ActionKind::Flee), Instant::now())
        .await
        .expect("retry by user");
    assert_eq!(outcome, SubmitOutcome::Submitted(TxId::from("0xdef")));
    assert_eq!(chain.broadcast_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_transaction_times_out_exactly_once() {
    let chain = ScriptedChain::new();
    chain.respond(&beast_key(), vec![beast("30")]);
    chain.script_broadcast(Ok(TxId::from("0xabc")));
    let mut orchestrator = Orchestrator::new(config(), chain.clone(), chain.clone());
    settle().await;

    orchestrator
        .enqueue(Intent::attack(BEAST_CONTRACT, "7"))
        .expect("enqueue");
    orchestrator
        .submit(attack_request(), Instant::now())
        .await
        .expect("submit");
    chain.set_status(NetworkStatus::Accepted);

    let mut entered = Vec::new();
    for _ in 0..40 {
        if let Some(phase) = orchestrator.refresh(Instant::now()).await.entered() {
            entered.push(phase);
        }
        sleep(Duration::from_secs(5)).await;
    }

    assert_eq!(entered, vec![TxPhase::Pending, TxPhase::Failed]);
    let handle = orchestrator.current().expect("handle");
    assert_eq!(handle.failure(), Some(&FailureReason::ConfirmationTimeout));
    assert_eq!(orchestrator.view(&beast_key()).source, ViewSource::Confirmed);

    let retired = orchestrator.acknowledge().expect("acknowledge");
    assert_eq!(retired.phase(), TxPhase::Failed);
    let record = orchestrator.history().last().expect("history");
    assert_eq!(record.failure, Some(FailureReason::ConfirmationTimeout));
}

#[tokio::test(start_paused = true)]
async fn lagging_replica_cannot_shrink_battle_log() {
    let chain = ScriptedChain::new();
    chain.respond_in_sequence(
        &battle_log_key(),
        vec![
            vec![battle("b1", "10"), battle("b2", "25")],
            vec![battle("b1", "10")],
        ],
    );
    let mut reconciler = PollingReconciler::new(chain.clone(), Duration::from_secs(5));
    assert!(reconciler.watch(QuerySpec::append_only(battle_log_key())));

    settle().await;
    assert_eq!(reconciler.cache().version(&battle_log_key()), 1);
    sleep(Duration::from_secs(5)).await;

    let cached = reconciler.cache().get(&battle_log_key()).expect("cached");
    assert_eq!(cached.result.len(), 2);
    assert_eq!(cached.version, 1);
    assert!(reconciler.stats().snapshot().rejected_writes >= 1);
    reconciler.shutdown().await;
}

#[test]
fn late_response_issued_earlier_never_overwrites_newer_one() {
    let cache = QueryCache::new();
    let key = battle_log_key();
    let early = cache.issue_seq();
    let late = cache.issue_seq();
    let now = Instant::now();

    let mut versions = Vec::new();
    let write = cache.apply(
        &key,
        late,
        QueryResult::new(vec![battle("b1", "10"), battle("b2", "25")]),
        CachePolicy::Latest,
        now,
    );
    assert_eq!(write, CacheWrite::Inserted);
    versions.push(cache.version(&key));

    let write = cache.apply(
        &key,
        early,
        QueryResult::new(vec![battle("b1", "10")]),
        CachePolicy::Latest,
        now,
    );
    assert_eq!(write, CacheWrite::RejectedStale);
    versions.push(cache.version(&key));

    assert_eq!(cache.get(&key).map(|entry| entry.result.len()), Some(2));
    assert!(versions.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[tokio::test(start_paused = true)]
async fn retargeting_keeps_cached_entries_for_previous_entity() {
    let chain = ScriptedChain::new();
    let next_beast = QueryKey::new("beastById").with_var("id", "8");
    chain.respond(&beast_key(), vec![beast("0")]);
    chain.respond(&next_beast, vec![Row::new("8").with_field("health", "40")]);
    let mut orchestrator = Orchestrator::new(config(), chain.clone(), chain.clone());
    settle().await;

    assert!(orchestrator
        .reconciler_mut()
        .retarget(QuerySpec::latest(next_beast.clone())));
    settle().await;

    assert!(!orchestrator.reconciler().is_watching(&beast_key()));
    assert!(orchestrator.reconciler().is_watching(&next_beast));
    assert_eq!(orchestrator.view(&beast_key()).len(), 1);
    assert_eq!(
        orchestrator
            .view(&next_beast)
            .row("8")
            .and_then(|row| row.field("health")),
        Some("40")
    );
}
