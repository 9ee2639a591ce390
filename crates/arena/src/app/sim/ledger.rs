use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};
use txflow::{Intent, TxId};

pub(crate) const ATTACK_DAMAGE: u32 = 12;
pub(crate) const COUNTER_DAMAGE: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BeastState {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) health: u32,
    pub(crate) fled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AdventurerState {
    pub(crate) id: String,
    pub(crate) health: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BattleEntry {
    pub(crate) id: String,
    pub(crate) action: &'static str,
    pub(crate) damage_dealt: u32,
    pub(crate) damage_taken: u32,
    pub(crate) tx_id: TxId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WorldState {
    pub(crate) beast: BeastState,
    pub(crate) adventurer: AdventurerState,
    pub(crate) battles: Vec<BattleEntry>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct LedgerTiming {
    /// Time from broadcast until the ledger executes the transaction.
    pub(crate) accept_after: Duration,
    /// Time from execution until the indexer serves the new state.
    pub(crate) index_lag: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LedgerTxState {
    Received,
    Accepted,
    Reverted(String),
}

#[derive(Debug)]
struct LedgerTx {
    intents: Vec<Intent>,
    submitted_at: Instant,
    state: LedgerTxState,
}

/// In-memory ledger with a lagging read replica.
#[derive(Debug)]
pub(crate) struct Ledger {
    timing: LedgerTiming,
    head: WorldState,
    indexed: Vec<(Instant, WorldState)>,
    txs: HashMap<TxId, LedgerTx>,
    submission_order: Vec<TxId>,
}

impl Ledger {
    pub(crate) fn new(genesis: WorldState, timing: LedgerTiming, now: Instant) -> Self {
        Self {
            timing,
            indexed: vec![(now, genesis.clone())],
            head: genesis,
            txs: HashMap::new(),
            submission_order: Vec::new(),
        }
    }

    pub(crate) fn submit(&mut self, intents: Vec<Intent>, now: Instant) -> TxId {
        let tx_id = TxId(format!("0x{:04x}", 0xa00 + self.submission_order.len()));
        debug!(tx_id = %tx_id, intents = intents.len(), "ledger_tx_received");
        self.txs.insert(
            tx_id.clone(),
            LedgerTx {
                intents,
                submitted_at: now,
                state: LedgerTxState::Received,
            },
        );
        self.submission_order.push(tx_id.clone());
        tx_id
    }

    pub(crate) fn status(&mut self, tx_id: &TxId, now: Instant) -> Option<LedgerTxState> {
        self.advance(now);
        self.txs.get(tx_id).map(|tx| tx.state.clone())
    }

    /// Latest state the indexer has caught up with at `now`. States older
    /// than that one can never be served again and are dropped.
    pub(crate) fn indexed_view(&mut self, now: Instant) -> &WorldState {
        self.advance(now);
        let visible = self
            .indexed
            .iter()
            .rposition(|(visible_from, _)| *visible_from <= now)
            .unwrap_or(0);
        self.indexed.drain(..visible);
        &self.indexed[0].1
    }

    /// Executes every received transaction whose acceptance time has passed,
    /// in submission order.
    fn advance(&mut self, now: Instant) {
        for tx_id in &self.submission_order {
            let Some(tx) = self.txs.get_mut(tx_id) else {
                continue;
            };
            if tx.state != LedgerTxState::Received {
                continue;
            }
            let accepted_at = tx.submitted_at + self.timing.accept_after;
            if accepted_at > now {
                break;
            }

            let mut next = self.head.clone();
            let executed = tx
                .intents
                .iter()
                .try_for_each(|intent| execute(&mut next, intent, tx_id));
            match executed {
                Ok(()) => {
                    info!(tx_id = %tx_id, beast_health = next.beast.health, "ledger_tx_accepted");
                    self.indexed
                        .push((accepted_at + self.timing.index_lag, next.clone()));
                    self.head = next;
                    tx.state = LedgerTxState::Accepted;
                }
                Err(reason) => {
                    info!(tx_id = %tx_id, reason = reason.as_str(), "ledger_tx_reverted");
                    tx.state = LedgerTxState::Reverted(reason);
                }
            }
        }
    }
}

fn execute(world: &mut WorldState, intent: &Intent, tx_id: &TxId) -> Result<(), String> {
    let target = intent.calldata.first().map(String::as_str).unwrap_or_default();
    if target != world.beast.id {
        return Err(format!("beast {target} is not in this encounter"));
    }

    match intent.entry_point.as_str() {
        "attack" => {
            if world.beast.health == 0 {
                return Err("beast is already slain".to_string());
            }
            if world.beast.fled {
                return Err("adventurer has fled this beast".to_string());
            }
            world.beast.health = world.beast.health.saturating_sub(ATTACK_DAMAGE);
            let damage_taken = if world.beast.health > 0 {
                world.adventurer.health = world.adventurer.health.saturating_sub(COUNTER_DAMAGE);
                COUNTER_DAMAGE
            } else {
                0
            };
            push_battle(world, "attack", ATTACK_DAMAGE, damage_taken, tx_id);
            Ok(())
        }
        "flee" => {
            if world.beast.health == 0 {
                return Err("nothing left to flee from".to_string());
            }
            world.beast.fled = true;
            push_battle(world, "flee", 0, 0, tx_id);
            Ok(())
        }
        other => Err(format!("unsupported entry point {other}")),
    }
}

fn push_battle(
    world: &mut WorldState,
    action: &'static str,
    damage_dealt: u32,
    damage_taken: u32,
    tx_id: &TxId,
) {
    let id = format!("b{}", world.battles.len() + 1);
    world.battles.push(BattleEntry {
        id,
        action,
        damage_dealt,
        damage_taken,
        tx_id: tx_id.clone(),
    });
}
