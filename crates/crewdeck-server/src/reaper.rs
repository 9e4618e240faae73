use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use crewdeck_engine::{PriorityScorer, Summariser};
use crewdeck_store::queries::event::EventRefs;
use crewdeck_store::queries::agent;
use crewdeck_store::{EventWriter, LockNamespace};
use crewdeck_types::{EventKind, StreamEventKind};
use serde_json::json;

use crate::availability::AvailabilityTracker;
use crate::state::AppState;

/// Background workers never propagate errors to the scheduler: they log,
/// count, and continue. Per-agent work uses `try_lock` so a held hook lock
/// just defers that agent to the next cycle.
pub fn spawn_workers(state: AppState, scorer: Option<PriorityScorer>, summariser: Option<Summariser>) {
    let tracker = Arc::new(AvailabilityTracker::new(
        state.storage.clone(),
        Arc::clone(&state.bridge),
        state.broadcaster.clone(),
        3,
    ));

    {
        let state = state.clone();
        let tracker = Arc::clone(&tracker);
        tokio::spawn(async move {
            let interval = Duration::from_secs(
                state.config.tmux_bridge.health_check_interval_seconds.max(1),
            );
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                reaper_pass(&state, &tracker).await;
            }
        });
    }

    if let Some(scorer) = scorer {
        let state = state.clone();
        let scorer = Arc::new(scorer);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                scorer_pass(&state, Arc::clone(&scorer)).await;
            }
        });
    }

    if let Some(summariser) = summariser {
        let summariser = Arc::new(summariser);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(20));
            loop {
                ticker.tick().await;
                let summariser = Arc::clone(&summariser);
                let outcome = tokio::task::spawn_blocking(move || summariser.run_once()).await;
                match outcome {
                    Ok(Ok(written)) if written > 0 => {
                        tracing::debug!(written, "summariser pass complete");
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => tracing::warn!(%err, "summariser pass failed"),
                    Err(err) => tracing::warn!(%err, "summariser task panicked"),
                }
            }
        });
    }

    // Receiver fallback check keeps watcher cadence honest even when hooks
    // stop arriving entirely.
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                state.pipeline.receiver().check_fallback(Utc::now());
            }
        });
    }
}

/// One reaper cycle: close idle registry sessions, then health-check every
/// live agent that is not currently locked by a hook handler.
pub async fn reaper_pass(state: &AppState, tracker: &Arc<AvailabilityTracker>) {
    let inactivity =
        chrono::Duration::seconds(state.config.file_watcher.inactivity_timeout_seconds as i64);
    let now = Utc::now();

    for entry in state.registry.stale(now, inactivity) {
        state.registry.remove(&entry.session_uuid);
        let storage = state.storage.clone();
        let writer_config = (
            state.config.event_system.write_retry_attempts,
            state.config.event_system.write_retry_delay_ms,
        );
        let session_uuid = entry.session_uuid.clone();
        let ended = tokio::task::spawn_blocking(move || {
            let writer = EventWriter::new(storage.clone(), writer_config.0, writer_config.1);
            let db = storage.connect()?;
            let agent_row = agent::get_by_session_uuid(db.conn(), &session_uuid)?;
            if let Some(agent_row) = &agent_row
                && agent_row.ended_at.is_none()
                && let Err(err) = agent::mark_ended(db.conn(), agent_row.id, Utc::now())
            {
                // Lost a race with a session_end hook; the event still lands.
                tracing::debug!(agent = agent_row.id, %err, "agent already ended");
            }
            let result = writer.write(
                EventKind::SessionEnded,
                json!({"reason": "timeout", "session_uuid": session_uuid}),
                agent_row
                    .as_ref()
                    .map(|a| EventRefs::agent(a.id))
                    .unwrap_or_default(),
            );
            if !result.success {
                tracing::warn!(error = ?result.error, "timeout session_ended write failed");
            }
            crewdeck_store::Result::Ok(agent_row.map(|a| a.id))
        })
        .await;

        match ended {
            Ok(Ok(agent_id)) => {
                state.broadcaster.broadcast(
                    StreamEventKind::SessionEnded,
                    json!({"agent_id": agent_id, "reason": "timeout"}),
                );
            }
            Ok(Err(err)) => tracing::warn!(%err, "stale session closure failed"),
            Err(err) => tracing::warn!(%err, "stale session task panicked"),
        }
    }

    // Pane health, skip-if-locked.
    let live = {
        let storage = state.storage.clone();
        tokio::task::spawn_blocking(move || {
            let db = storage.connect()?;
            agent::list_live(db.conn())
        })
        .await
    };
    let live = match live {
        Ok(Ok(live)) => live,
        Ok(Err(err)) => {
            tracing::warn!(%err, "live agent scan failed");
            return;
        }
        Err(err) => {
            tracing::warn!(%err, "live agent scan panicked");
            return;
        }
    };

    for agent_row in live {
        // Observe on the async side (multiplexer only), then apply the
        // mutation on a blocking thread under try_lock: a held hook lock
        // defers this agent to the next cycle.
        let observation = match tracker.observe(&agent_row).await {
            Ok(observation) => observation,
            Err(err) => {
                tracing::warn!(agent = agent_row.id, %err, "pane observation failed");
                continue;
            }
        };

        let locks = state.locks.clone();
        let tracker = Arc::clone(tracker);
        let storage = state.storage.clone();
        let retry = (
            state.config.event_system.write_retry_attempts,
            state.config.event_system.write_retry_delay_ms,
        );
        let applied = tokio::task::spawn_blocking(move || {
            let Some(_guard) = locks.try_lock(LockNamespace::Agent, agent_row.id) else {
                return Ok(None);
            };
            let writer = EventWriter::new(storage, retry.0, retry.1);
            tracker.apply(&agent_row, observation, &writer).map(Some)
        })
        .await;

        match applied {
            Ok(Ok(Some(change))) => tracing::trace!(?change, "availability check"),
            Ok(Ok(None)) => {}
            Ok(Err(err)) => tracing::warn!(%err, "availability apply failed"),
            Err(err) => tracing::warn!(%err, "availability task panicked"),
        }
    }

    // Rolling per-agent snapshots for the headspace metrics.
    let storage = state.storage.clone();
    let snapshots = tokio::task::spawn_blocking(move || -> crewdeck_store::Result<()> {
        let db = storage.connect()?;
        let now = Utc::now();
        for agent_row in agent::list_live(db.conn())? {
            let state_name = crewdeck_store::queries::command::current_for_agent(db.conn(), agent_row.id)?
                .map(|c| c.state.as_str().to_string())
                .unwrap_or_else(|| "idle".to_string());
            let open = crewdeck_store::queries::command::open_count_for_agent(db.conn(), agent_row.id)?;
            crewdeck_store::queries::metric::record_snapshot(
                db.conn(),
                agent_row.id,
                now,
                &state_name,
                agent_row.context_percent_used,
                open,
            )?;
        }
        Ok(())
    })
    .await;
    if let Ok(Err(err)) = snapshots {
        tracing::warn!(%err, "snapshot pass failed");
    }
}

async fn scorer_pass(state: &AppState, scorer: Arc<PriorityScorer>) {
    let outcome = tokio::task::spawn_blocking(move || scorer.run_once()).await;
    match outcome {
        Ok(Ok(applied)) => {
            for verdict in applied {
                state.broadcaster.broadcast(
                    StreamEventKind::PriorityUpdated,
                    json!({
                        "agent_id": verdict.agent_id,
                        "score": verdict.score,
                        "reason": verdict.reason,
                    }),
                );
                state.broadcaster.broadcast(
                    StreamEventKind::CardRefresh,
                    json!({"agent_id": verdict.agent_id, "reason": "priority_updated"}),
                );
            }
        }
        Ok(Err(err)) => tracing::warn!(%err, "priority pass failed"),
        Err(err) => tracing::warn!(%err, "priority task panicked"),
    }
}
