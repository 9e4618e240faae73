use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crewdeck_store::queries::event::EventRefs;
use crewdeck_store::queries::{agent, project};
use crewdeck_store::records::AgentRecord;
use crewdeck_store::{
    AdvisoryLockManager, Error, EventWriter, LockNamespace, Result, Storage,
};
use crewdeck_types::{AgentId, CommandState, EventKind, HookKind, HookMode, HookPayload, ObservedTurn, TurnActor};
use serde_json::json;

use crate::correlator::Correlator;

const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Receiver-side bookkeeping: which mode the watcher should run in and how
/// many hooks have arrived.
#[derive(Debug)]
pub struct HookReceiverState {
    inner: Mutex<ReceiverInner>,
}

#[derive(Debug, Clone)]
struct ReceiverInner {
    enabled: bool,
    last_event_at: Option<DateTime<Utc>>,
    last_event_type: Option<HookKind>,
    events_received: u64,
    mode: HookMode,
    polling_interval_with_hooks: Duration,
    polling_fallback_interval: Duration,
    fallback_timeout: Duration,
}

impl Default for HookReceiverState {
    fn default() -> Self {
        Self {
            inner: Mutex::new(ReceiverInner {
                enabled: true,
                last_event_at: None,
                last_event_type: None,
                events_received: 0,
                mode: HookMode::PollingFallback,
                polling_interval_with_hooks: Duration::from_secs(60),
                polling_fallback_interval: Duration::from_secs(2),
                fallback_timeout: Duration::from_secs(300),
            }),
        }
    }
}

impl HookReceiverState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn configure(
        &self,
        enabled: Option<bool>,
        polling_interval_with_hooks: Option<Duration>,
        fallback_timeout: Option<Duration>,
    ) {
        let mut inner = self.lock();
        if let Some(enabled) = enabled {
            inner.enabled = enabled;
        }
        if let Some(interval) = polling_interval_with_hooks {
            inner.polling_interval_with_hooks = interval;
        }
        if let Some(timeout) = fallback_timeout {
            inner.fallback_timeout = timeout;
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    /// Every accepted hook lands here; hooks arriving means the tail can
    /// relax to the slow cadence.
    pub fn record_event(&self, kind: HookKind, now: DateTime<Utc>) {
        let mut inner = self.lock();
        inner.last_event_at = Some(now);
        inner.last_event_type = Some(kind);
        inner.events_received += 1;
        inner.mode = HookMode::HooksActive;
    }

    /// Revert to fallback polling when hooks have gone quiet.
    pub fn check_fallback(&self, now: DateTime<Utc>) {
        let mut inner = self.lock();
        let timed_out = match inner.last_event_at {
            Some(last) => {
                now.signed_duration_since(last).to_std().unwrap_or_default() > inner.fallback_timeout
            }
            None => true,
        };
        if timed_out {
            inner.mode = HookMode::PollingFallback;
        }
    }

    pub fn mode(&self) -> HookMode {
        self.lock().mode
    }

    pub fn events_received(&self) -> u64 {
        self.lock().events_received
    }

    pub fn last_event(&self) -> Option<(HookKind, DateTime<Utc>)> {
        let inner = self.lock();
        match (inner.last_event_type, inner.last_event_at) {
            (Some(kind), Some(at)) => Some((kind, at)),
            _ => None,
        }
    }

    /// Cadence the transcript watcher should poll at right now.
    pub fn polling_interval(&self) -> Duration {
        let inner = self.lock();
        match inner.mode {
            HookMode::HooksActive => inner.polling_interval_with_hooks,
            HookMode::PollingFallback => inner.polling_fallback_interval,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ReceiverInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// What a hook did, reported back to the HTTP layer.
#[derive(Debug, Clone, Default)]
pub struct HookOutcome {
    pub success: bool,
    pub agent_id: Option<AgentId>,
    pub agent_created: bool,
    pub agent_ended: bool,
    pub state_changed: bool,
    pub new_state: Option<CommandState>,
    pub session_uuid: Option<String>,
}

/// Hook ingestion: validate, audit, lock, correlate, commit.
///
/// A partial hook is never visible: all mutation for one hook happens in one
/// transaction under the agent's advisory lock.
pub struct HookPipeline {
    storage: Storage,
    locks: AdvisoryLockManager,
    writer: EventWriter,
    correlator: Correlator,
    receiver: HookReceiverState,
}

impl HookPipeline {
    pub fn new(
        storage: Storage,
        locks: AdvisoryLockManager,
        writer: EventWriter,
        correlator: Correlator,
    ) -> Self {
        Self {
            storage,
            locks,
            writer,
            correlator,
            receiver: HookReceiverState::new(),
        }
    }

    pub fn receiver(&self) -> &HookReceiverState {
        &self.receiver
    }

    pub fn writer(&self) -> &EventWriter {
        &self.writer
    }

    pub fn process(&self, kind: HookKind, payload: &HookPayload) -> Result<HookOutcome> {
        if payload.claude_session_id.trim().is_empty() {
            return Err(Error::Validation("claude_session_id is required".to_string()));
        }
        if !self.receiver.is_enabled() {
            return Ok(HookOutcome::default());
        }
        let now = Utc::now();
        self.receiver.record_event(kind, now);

        // The hook audit event is recorded unconditionally, before any
        // correlation, so even no-op hooks are traceable.
        let (agent_row, agent_created) = self.find_or_create_agent(kind, payload, now)?;
        self.write_hook_event(kind, payload, agent_row.as_ref());

        let Some(agent_row) = agent_row else {
            // Nothing to correlate against (e.g. stop for an unknown session).
            return Ok(HookOutcome {
                success: true,
                ..Default::default()
            });
        };

        let _guard = self
            .locks
            .lock(LockNamespace::Agent, agent_row.id, LOCK_TIMEOUT)?;

        let mut db = self.storage.connect()?;
        let tx = db.conn_mut().transaction().map_err(Error::from)?;

        let mut outcome = HookOutcome {
            success: true,
            agent_id: Some(agent_row.id),
            agent_created,
            session_uuid: Some(agent_row.session_uuid.clone()),
            ..Default::default()
        };

        match kind {
            HookKind::SessionStart => {
                agent::touch_last_seen(&tx, agent_row.id, now)?;
            }
            HookKind::SessionEnd => {
                // A stop-style completion for whatever is still live, then
                // the agent itself ends.
                let stop = self.correlator.process_stop(&tx, &self.writer, &agent_row)?;
                if stop.state_changed {
                    outcome.state_changed = true;
                    outcome.new_state = stop.new_state;
                }
                // Re-read under the lock: a concurrent closer may have beaten
                // this hook to the ended_at column.
                let still_live = agent::get(&tx, agent_row.id)?
                    .map(|a| a.ended_at.is_none())
                    .unwrap_or(false);
                if still_live {
                    agent::mark_ended(&tx, agent_row.id, now)?;
                    outcome.agent_ended = true;
                    outcome.state_changed = true;
                    let result = self.writer.write_with_conn(
                        &tx,
                        EventKind::SessionEnded,
                        json!({"reason": "session_end_hook", "session_uuid": agent_row.session_uuid}),
                        EventRefs::agent(agent_row.id),
                    );
                    if !result.success {
                        tracing::warn!(agent = agent_row.id, error = ?result.error, "session_ended write failed");
                    }
                }
            }
            HookKind::UserPromptSubmit => {
                let text = payload.prompt.clone().unwrap_or_default();
                let observed = ObservedTurn::from_hook(TurnActor::User, text, now);
                let result = self
                    .correlator
                    .process_turn(&tx, &self.writer, &agent_row, &observed)?;
                outcome.state_changed = result.state_changed;
                outcome.new_state = result.new_state;
            }
            HookKind::Stop => {
                let result = self.correlator.process_stop(&tx, &self.writer, &agent_row)?;
                outcome.state_changed = result.state_changed;
                outcome.new_state = result.new_state;
            }
            HookKind::Notification => {
                let result = self
                    .correlator
                    .process_notification(&tx, &self.writer, &agent_row)?;
                outcome.state_changed = result.state_changed;
                outcome.new_state = result.new_state;
            }
            HookKind::PostToolUse => {
                agent::touch_last_seen(&tx, agent_row.id, now)?;
            }
        }

        tx.commit().map_err(Error::from)?;
        Ok(outcome)
    }

    /// Hooks identify agents by the host session id. `session_start` (and,
    /// defensively, a prompt for an unseen session) creates the agent row,
    /// registering the project from the working directory when needed.
    fn find_or_create_agent(
        &self,
        kind: HookKind,
        payload: &HookPayload,
        now: DateTime<Utc>,
    ) -> Result<(Option<AgentRecord>, bool)> {
        let db = self.storage.connect()?;
        if let Some(existing) =
            agent::get_by_session_uuid(db.conn(), &payload.claude_session_id)?
        {
            return Ok((Some(existing), false));
        }

        let creates = matches!(kind, HookKind::SessionStart | HookKind::UserPromptSubmit);
        let Some(working_directory) = payload.working_directory.as_deref() else {
            return Ok((None, false));
        };
        if !creates {
            return Ok((None, false));
        }

        let project_row = match project::get_by_path(db.conn(), working_directory)? {
            Some(found) => found,
            None => {
                let id = register_project(db.conn(), working_directory)?;
                project::get(db.conn(), id)?
                    .ok_or_else(|| Error::Query("freshly registered project vanished".to_string()))?
            }
        };

        // An agent spawned through the control path is waiting under a
        // placeholder uuid; the first hook binds it to the host session.
        if let Some(unbound) = agent::find_unbound_for_project(db.conn(), project_row.id)? {
            agent::bind_session_uuid(db.conn(), unbound.id, &payload.claude_session_id)?;
            agent::touch_last_seen(db.conn(), unbound.id, now)?;
            return Ok((agent::get(db.conn(), unbound.id)?, false));
        }

        let agent_id = agent::insert(
            db.conn(),
            &agent::NewAgent {
                session_uuid: &payload.claude_session_id,
                project_id: project_row.id,
                persona_id: None,
                position_id: None,
                previous_agent_id: None,
                tmux_session_name: None,
                tmux_pane_id: None,
                started_at: now,
            },
        )?;
        let result = self.writer.write(
            EventKind::SessionRegistered,
            json!({
                "session_uuid": payload.claude_session_id,
                "project_path": project_row.path,
            }),
            EventRefs {
                agent_id: Some(agent_id),
                project_id: Some(project_row.id),
                ..Default::default()
            },
        );
        if !result.success {
            tracing::warn!(agent = agent_id, error = ?result.error, "session_registered write failed");
        }
        Ok((agent::get(db.conn(), agent_id)?, true))
    }

    fn write_hook_event(&self, kind: HookKind, payload: &HookPayload, agent_row: Option<&AgentRecord>) {
        let refs = agent_row
            .map(|a| EventRefs {
                agent_id: Some(a.id),
                project_id: Some(a.project_id),
                ..Default::default()
            })
            .unwrap_or_default();

        let body = match kind {
            HookKind::SessionStart => json!({
                "claude_session_id": payload.claude_session_id,
                "working_directory": payload.working_directory,
            }),
            HookKind::SessionEnd => json!({"claude_session_id": payload.claude_session_id}),
            HookKind::UserPromptSubmit => json!({
                "claude_session_id": payload.claude_session_id,
                "prompt_preview": payload.prompt.as_deref().map(preview),
            }),
            HookKind::Stop => json!({"claude_session_id": payload.claude_session_id}),
            HookKind::Notification => json!({
                "claude_session_id": payload.claude_session_id,
                "message": payload.message,
            }),
            HookKind::PostToolUse => {
                // Tool error output is scrubbed of system detail before it
                // lands anywhere an agent could read it back.
                let output_preview = payload.tool_output.as_deref().map(|output| {
                    if crate::sanitiser::contains_error_patterns(output) {
                        preview(&crate::sanitiser::sanitise_error_output(output))
                    } else {
                        preview(output)
                    }
                });
                json!({
                    "claude_session_id": payload.claude_session_id,
                    "tool_name": payload.tool_name,
                    "output_preview": output_preview,
                })
            }
        };
        let result = self.writer.write(kind.event_kind(), body, refs);
        if !result.success {
            tracing::warn!(hook = %kind, error = ?result.error, "hook audit write failed");
        }
    }
}

/// Register a project discovered from a hook's working directory. The slug
/// comes from the path basename, suffixed on collision.
pub fn register_project(conn: &rusqlite::Connection, path: &str) -> Result<i64> {
    let base = path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("project")
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>();

    let mut attempt = 0;
    loop {
        let slug = if attempt == 0 {
            base.clone()
        } else {
            format!("{base}-{attempt}")
        };
        match project::insert(
            conn,
            &project::NewProject {
                slug: &slug,
                name: &slug,
                path,
                git_origin: None,
                git_branch: None,
            },
        ) {
            Ok(id) => return Ok(id),
            Err(err) if err.is_conflict() && attempt < 50 => attempt += 1,
            Err(err) => return Err(err),
        }
    }
}

fn preview(text: &str) -> String {
    text.chars().take(200).collect()
}
