use std::process::ExitCode;
use std::sync::Arc;

use tokio::runtime::Builder;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{error, info, warn};
use txflow::{
    MergedView, Orchestrator, PollStatsSnapshot, SubmissionError, SubmitOutcome, TxRecord,
    TxflowError,
};

use super::battle::Encounter;
use super::bootstrap::AppWiring;
use super::sim::SimChain;

#[derive(Debug)]
pub(crate) struct SessionSummary {
    pub(crate) settled: Vec<TxRecord>,
    pub(crate) declined: usize,
    pub(crate) poll_stats: PollStatsSnapshot,
}

pub(crate) fn run(app: AppWiring) -> ExitCode {
    let runtime = match Builder::new_current_thread()
        .enable_time()
        .thread_name("arena")
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "startup_failed");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(play_session(app)) {
        Ok(summary) => {
            info!(
                settled = summary.settled.len(),
                declined = summary.declined,
                polls_issued = summary.poll_stats.polls_issued,
                polls_failed = summary.poll_stats.polls_failed,
                cache_updates = summary.poll_stats.cache_updates,
                rejected_writes = summary.poll_stats.rejected_writes,
                "session_finished"
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "session_failed");
            ExitCode::FAILURE
        }
    }
}

/// Plays every scripted action to a terminal phase, one transaction at a time.
pub(crate) async fn play_session(app: AppWiring) -> Result<SessionSummary, TxflowError> {
    let AppWiring {
        mut config,
        sim,
        encounter,
        beast_health,
        script,
    } = app;

    let chain = Arc::new(SimChain::new(encounter.genesis(beast_health), sim));
    for spec in encounter.query_specs() {
        if !config.queries.iter().any(|existing| existing.key == spec.key) {
            config.queries.push(spec);
        }
    }
    let mut orchestrator = Orchestrator::new(config, chain.clone(), chain);
    let mut ticker = time::interval(orchestrator.config().poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.reset();

    let mut declined = 0;
    for (step, action) in script.into_iter().enumerate() {
        ticker.tick().await;
        orchestrator.enqueue(encounter.intent(action))?;
        let request = encounter.request(
            action,
            &orchestrator.view(&encounter.battles_key()),
            &orchestrator.view(&encounter.beast_key()),
        );

        match orchestrator.submit(request, Instant::now()).await {
            Ok(SubmitOutcome::Submitted(tx_id)) => {
                info!(step, action = %action, tx_id = %tx_id, "action_submitted");
            }
            Ok(SubmitOutcome::NothingToSubmit) => continue,
            Err(SubmissionError::Broadcast(err)) => {
                declined += 1;
                warn!(step, action = %action, error = %err, "action_not_sent");
                continue;
            }
            Err(err) => return Err(err.into()),
        }
        render(&orchestrator, &encounter);

        while orchestrator
            .current()
            .is_some_and(|handle| !handle.phase().is_terminal())
        {
            ticker.tick().await;
            if let Some(phase) = orchestrator.refresh(Instant::now()).await.entered() {
                info!(step, phase = ?phase, "action_phase_changed");
                render(&orchestrator, &encounter);
            }
        }

        let settled = orchestrator.acknowledge()?;
        match settled.failure() {
            Some(reason) => {
                warn!(step, tx_id = %settled.tx_id(), reason = %reason, "action_failed")
            }
            None => info!(step, tx_id = %settled.tx_id(), "action_confirmed"),
        }
    }

    let poll_stats = orchestrator.reconciler().stats().snapshot();
    orchestrator.shutdown().await;
    Ok(SessionSummary {
        settled: orchestrator.history().cloned().collect(),
        declined,
        poll_stats,
    })
}

fn render(orchestrator: &Orchestrator, encounter: &Encounter) {
    let beast = orchestrator.view(&encounter.beast_key());
    let battles = orchestrator.view(&encounter.battles_key());
    let label = orchestrator
        .current()
        .map(|handle| handle.label().to_string())
        .unwrap_or_default();
    info!(
        label = label.as_str(),
        beast_health = field_of(&beast, &encounter.beast_id, "health"),
        beast_source = ?beast.source,
        battles = battles.len(),
        battles_source = ?battles.source,
        "view_rendered"
    );
}

fn field_of<'a>(view: &'a MergedView, entity_id: &str, field: &str) -> &'a str {
    view.row(entity_id)
        .and_then(|row| row.field(field))
        .unwrap_or("?")
}
