use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use crewdeck_bridge::{PaneInfo, TmuxBridge};
use crewdeck_store::queries::event::EventRefs;
use crewdeck_store::queries::{agent, project};
use crewdeck_store::records::AgentRecord;
use crewdeck_store::{EventWriter, Storage};
use crewdeck_types::{AgentId, EventKind, StreamEventKind};
use serde_json::json;

use crate::broadcast::Broadcaster;
use crate::error::Result;

/// Bridge-side observation of one agent's pane, taken without any locks.
#[derive(Debug, Clone)]
pub enum PaneObservation {
    NoPane,
    Healthy,
    /// Pane gone or not running the REPL; carries the current pane table
    /// for the adoption scan.
    Gone { panes: Vec<PaneInfo> },
}

/// How an apply pass left one agent.
#[derive(Debug, Clone, PartialEq)]
pub enum AvailabilityChange {
    Healthy,
    /// Pane died but an equivalent one was found and adopted.
    Reconnected { new_pane_id: String },
    /// Pane is gone and no unambiguous replacement exists yet.
    Degraded { consecutive_failures: u32 },
    /// Failure threshold exceeded; the agent was marked ended.
    Ended,
    /// Two live agents share the working directory; adoption skipped.
    AmbiguousSkipped,
}

/// Watches pane health and reattaches agents whose panes were recreated.
///
/// Split in two phases so the advisory lock is only held for the storage
/// mutation: `observe` talks to the multiplexer, `apply` talks to the store.
pub struct AvailabilityTracker {
    storage: Storage,
    bridge: Arc<TmuxBridge>,
    broadcaster: Broadcaster,
    max_consecutive_failures: u32,
    failures: Mutex<HashMap<AgentId, u32>>,
}

impl AvailabilityTracker {
    pub fn new(
        storage: Storage,
        bridge: Arc<TmuxBridge>,
        broadcaster: Broadcaster,
        max_consecutive_failures: u32,
    ) -> Self {
        Self {
            storage,
            bridge,
            broadcaster,
            max_consecutive_failures,
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub async fn observe(&self, agent_row: &AgentRecord) -> Result<PaneObservation> {
        let Some(pane_id) = agent_row.tmux_pane_id.as_deref() else {
            return Ok(PaneObservation::NoPane);
        };
        let health = self.bridge.check_health(pane_id).await?;
        if health.available && health.running.unwrap_or(false) {
            return Ok(PaneObservation::Healthy);
        }
        let panes = self.bridge.list_panes().await.unwrap_or_default();
        Ok(PaneObservation::Gone { panes })
    }

    /// Apply one observation. Callers hold (or skipped on) the agent's
    /// advisory lock.
    pub fn apply(
        &self,
        agent_row: &AgentRecord,
        observation: PaneObservation,
        writer: &EventWriter,
    ) -> Result<AvailabilityChange> {
        let panes = match observation {
            PaneObservation::NoPane => return Ok(AvailabilityChange::Healthy),
            PaneObservation::Healthy => {
                self.reset_failures(agent_row.id);
                return Ok(AvailabilityChange::Healthy);
            }
            PaneObservation::Gone { panes } => panes,
        };
        let dead_pane = agent_row.tmux_pane_id.as_deref().unwrap_or_default();

        match self.find_replacement(agent_row, dead_pane, &panes)? {
            ReplacementScan::Found(new_pane) => {
                let db = self.storage.connect()?;
                agent::set_pane(db.conn(), agent_row.id, Some(&new_pane))?;
                self.bridge.release_send_lock(dead_pane);
                self.reset_failures(agent_row.id);
                self.broadcaster.broadcast(
                    StreamEventKind::CommanderAvailabilityChanged,
                    json!({"agent_id": agent_row.id, "reason": "pane_reconnected"}),
                );
                Ok(AvailabilityChange::Reconnected { new_pane_id: new_pane })
            }
            ReplacementScan::Ambiguous => {
                let result = writer.write(
                    EventKind::HookNotification,
                    json!({
                        "claude_session_id": agent_row.session_uuid,
                        "kind": "pane_reconnect_ambiguous",
                    }),
                    EventRefs::agent(agent_row.id),
                );
                if !result.success {
                    tracing::warn!(agent = agent_row.id, error = ?result.error, "ambiguity audit failed");
                }
                Ok(AvailabilityChange::AmbiguousSkipped)
            }
            ReplacementScan::None => {
                let strikes = self.bump_failures(agent_row.id);
                if strikes < self.max_consecutive_failures {
                    return Ok(AvailabilityChange::Degraded {
                        consecutive_failures: strikes,
                    });
                }

                let db = self.storage.connect()?;
                agent::mark_ended(db.conn(), agent_row.id, Utc::now())?;
                self.bridge.release_send_lock(dead_pane);
                self.reset_failures(agent_row.id);
                let result = writer.write(
                    EventKind::SessionEnded,
                    json!({"reason": "pane_lost", "session_uuid": agent_row.session_uuid}),
                    EventRefs::agent(agent_row.id),
                );
                if !result.success {
                    tracing::warn!(agent = agent_row.id, error = ?result.error, "session_ended write failed");
                }
                self.broadcaster.broadcast(
                    StreamEventKind::SessionEnded,
                    json!({"agent_id": agent_row.id, "reason": "pane_lost"}),
                );
                Ok(AvailabilityChange::Ended)
            }
        }
    }

    /// Match by `(working_directory, current_command)`, skipping the known
    /// dead pane. When several live agents share the directory the match is
    /// ambiguous and adoption is skipped.
    fn find_replacement(
        &self,
        agent_row: &AgentRecord,
        dead_pane: &str,
        panes: &[PaneInfo],
    ) -> Result<ReplacementScan> {
        let db = self.storage.connect()?;
        let Some(project_row) = project::get(db.conn(), agent_row.project_id)? else {
            return Ok(ReplacementScan::None);
        };

        let siblings = agent::list_live_for_project(db.conn(), agent_row.project_id)?;
        if siblings.len() > 1 {
            return Ok(ReplacementScan::Ambiguous);
        }

        let candidates: Vec<&PaneInfo> = panes
            .iter()
            .filter(|pane| {
                pane.pane_id != dead_pane
                    && pane.working_directory == project_row.path
                    && matches!(pane.current_command.as_str(), "claude" | "node")
            })
            .collect();

        match candidates.as_slice() {
            [] => Ok(ReplacementScan::None),
            [only] => Ok(ReplacementScan::Found(only.pane_id.clone())),
            _ => Ok(ReplacementScan::Ambiguous),
        }
    }

    fn bump_failures(&self, agent_id: AgentId) -> u32 {
        let mut failures = self.failures.lock().unwrap_or_else(|p| p.into_inner());
        let entry = failures.entry(agent_id).or_insert(0);
        *entry += 1;
        *entry
    }

    fn reset_failures(&self, agent_id: AgentId) {
        self.failures
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&agent_id);
    }
}

enum ReplacementScan {
    Found(String),
    Ambiguous,
    None,
}
