use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use crewdeck_store::queries::event::EventRefs;
use crewdeck_store::queries::metric::{self, MetricScope};
use crewdeck_store::queries::turn::InsertOutcome;
use crewdeck_store::queries::{agent, command, turn};
use crewdeck_store::records::{AgentRecord, CommandRecord};
use crewdeck_store::{EventWriter, Result};
use crewdeck_types::{
    AgentId, CommandId, CommandState, EventKind, ObservedTurn, TurnActor, TurnId, TurnIntent,
};
use rusqlite::Connection;
use serde_json::json;

use crate::state_machine::{self, REASON_NO_TRANSITION};

/// Tuning for deduplication and command-rate limiting.
#[derive(Debug, Clone)]
pub struct CorrelatorConfig {
    /// Recent-hash ring: entries older than this are forgotten.
    pub dedup_window: Duration,
    /// Recent-hash ring: bound per agent.
    pub dedup_capacity: usize,
    /// New-command cap per agent within `rate_window`.
    pub rate_limit_max: usize,
    pub rate_window: Duration,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            dedup_window: Duration::seconds(30),
            dedup_capacity: 64,
            rate_limit_max: 10,
            rate_window: Duration::seconds(60),
        }
    }
}

/// What one observation did to the model.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutcome {
    pub turn_id: Option<TurnId>,
    pub command_id: Option<CommandId>,
    pub new_command_created: bool,
    pub state_changed: bool,
    pub new_state: Option<CommandState>,
    pub duplicate: bool,
    pub rate_limited: bool,
}

/// Maps observed turns onto `(agent, command)` and applies the transition
/// table. Every entry point expects to run under the agent's advisory lock
/// with a caller-owned transaction; events ride that transaction through the
/// writer's pass-through mode.
pub struct Correlator {
    config: CorrelatorConfig,
    recent_hashes: Mutex<HashMap<AgentId, VecDeque<(String, DateTime<Utc>)>>>,
    command_opens: Mutex<HashMap<AgentId, VecDeque<DateTime<Utc>>>>,
}

impl Correlator {
    pub fn new(config: CorrelatorConfig) -> Self {
        Self {
            config,
            recent_hashes: Mutex::new(HashMap::new()),
            command_opens: Mutex::new(HashMap::new()),
        }
    }

    /// Correlate one observed turn. Classification depends on the current
    /// command: a user turn is an answer while the command awaits input and
    /// a command otherwise; an agent turn is a question when it reads like
    /// one and progress otherwise.
    pub fn process_turn(
        &self,
        conn: &Connection,
        writer: &EventWriter,
        agent_row: &AgentRecord,
        observed: &ObservedTurn,
    ) -> Result<ProcessOutcome> {
        agent::touch_last_seen(conn, agent_row.id, observed.timestamp.max(Utc::now()))?;

        if self.seen_recently(agent_row.id, observed) {
            return Ok(ProcessOutcome {
                duplicate: true,
                ..Default::default()
            });
        }

        let current = command::current_for_agent(conn, agent_row.id)?;
        let intent = classify(observed, current.as_ref());

        let outcome = match (observed.actor, intent) {
            (TurnActor::User, TurnIntent::Command) => {
                self.open_command(conn, writer, agent_row, observed, current.as_ref())?
            }
            (TurnActor::User, TurnIntent::Answer) => {
                self.apply_to_current(conn, writer, agent_row, observed, intent, current)?
            }
            (TurnActor::Agent, _) => {
                self.apply_to_current(conn, writer, agent_row, observed, intent, current)?
            }
            // Remaining user intents have no cell in the table; record the
            // rejection for traceability.
            (TurnActor::User, _) => {
                self.record_rejection(conn, writer, agent_row, current.as_ref(), observed.actor, intent)?;
                ProcessOutcome::default()
            }
        };

        if let Some(hash) = &observed.entry_hash
            && !outcome.duplicate
        {
            self.remember_hash(agent_row.id, hash.clone(), observed.timestamp);
        }
        if outcome.turn_id.is_some() {
            self.bump_metrics(conn, agent_row, observed.timestamp)?;
        }
        Ok(outcome)
    }

    /// `stop` hook: the live command completes, no debounce.
    pub fn process_stop(
        &self,
        conn: &Connection,
        writer: &EventWriter,
        agent_row: &AgentRecord,
    ) -> Result<ProcessOutcome> {
        let now = Utc::now();
        agent::touch_last_seen(conn, agent_row.id, now)?;

        let Some(current) = command::current_for_agent(conn, agent_row.id)? else {
            return Ok(ProcessOutcome::default());
        };
        if !matches!(current.state, CommandState::Commanded | CommandState::Processing) {
            self.record_rejection(
                conn,
                writer,
                agent_row,
                Some(&current),
                TurnActor::Agent,
                TurnIntent::EndOfCommand,
            )?;
            return Ok(ProcessOutcome::default());
        }

        let last_output = turn::list_for_command(conn, current.id)?
            .into_iter()
            .rev()
            .find(|t| t.actor == TurnActor::Agent)
            .map(|t| t.text);
        command::complete(conn, current.id, now, last_output.as_deref())?;
        self.write_transition(
            conn,
            writer,
            agent_row,
            current.id,
            None,
            current.state,
            CommandState::Complete,
            "stop_hook",
        );

        Ok(ProcessOutcome {
            command_id: Some(current.id),
            state_changed: true,
            new_state: Some(CommandState::Complete),
            ..Default::default()
        })
    }

    /// `notification` hook: a processing command parks for input. Anything
    /// else, including an already-complete command, is a counted no-op.
    pub fn process_notification(
        &self,
        conn: &Connection,
        writer: &EventWriter,
        agent_row: &AgentRecord,
    ) -> Result<ProcessOutcome> {
        agent::touch_last_seen(conn, agent_row.id, Utc::now())?;

        let Some(current) = command::current_for_agent(conn, agent_row.id)? else {
            return Ok(ProcessOutcome::default());
        };
        if current.state != CommandState::Processing {
            return Ok(ProcessOutcome::default());
        }

        command::set_state(conn, current.id, CommandState::AwaitingInput)?;
        self.write_transition(
            conn,
            writer,
            agent_row,
            current.id,
            None,
            CommandState::Processing,
            CommandState::AwaitingInput,
            "notification",
        );

        Ok(ProcessOutcome {
            command_id: Some(current.id),
            state_changed: true,
            new_state: Some(CommandState::AwaitingInput),
            ..Default::default()
        })
    }

    fn open_command(
        &self,
        conn: &Connection,
        writer: &EventWriter,
        agent_row: &AgentRecord,
        observed: &ObservedTurn,
        current: Option<&CommandRecord>,
    ) -> Result<ProcessOutcome> {
        if !self.allow_new_command(agent_row.id, observed.timestamp) {
            tracing::warn!(agent = agent_row.id, "command creation rate limit hit");
            return Ok(ProcessOutcome {
                rate_limited: true,
                ..Default::default()
            });
        }

        // The previous command, live or complete, is left exactly as it is.
        let from_state = current.map(|c| c.state).unwrap_or(CommandState::Idle);
        let command_id = command::insert(
            conn,
            agent_row.id,
            CommandState::Commanded,
            observed.timestamp,
            Some(&observed.text),
        )?;

        let turn_id = match turn::insert(conn, command_id, observed, TurnIntent::Command)? {
            InsertOutcome::Inserted(id) => id,
            InsertOutcome::Duplicate => {
                return Ok(ProcessOutcome {
                    duplicate: true,
                    ..Default::default()
                });
            }
        };

        self.write_turn_detected(conn, writer, agent_row, command_id, turn_id, observed, TurnIntent::Command);
        self.write_transition(
            conn,
            writer,
            agent_row,
            command_id,
            Some(turn_id),
            from_state,
            CommandState::Commanded,
            "user_command",
        );

        Ok(ProcessOutcome {
            turn_id: Some(turn_id),
            command_id: Some(command_id),
            new_command_created: true,
            state_changed: true,
            new_state: Some(CommandState::Commanded),
            ..Default::default()
        })
    }

    fn apply_to_current(
        &self,
        conn: &Connection,
        writer: &EventWriter,
        agent_row: &AgentRecord,
        observed: &ObservedTurn,
        intent: TurnIntent,
        current: Option<CommandRecord>,
    ) -> Result<ProcessOutcome> {
        let Some(current) = current else {
            // An agent turn with no live command has nowhere to land.
            self.record_rejection(conn, writer, agent_row, None, observed.actor, intent)?;
            return Ok(ProcessOutcome::default());
        };

        let verdict = state_machine::validate(current.state, observed.actor, intent);
        if !verdict.valid {
            self.record_rejection(
                conn,
                writer,
                agent_row,
                Some(&current),
                observed.actor,
                intent,
            )?;
            return Ok(ProcessOutcome::default());
        }
        let to_state = verdict.to_state.unwrap_or(current.state);

        let turn_id = match turn::insert(conn, current.id, observed, intent)? {
            InsertOutcome::Inserted(id) => id,
            InsertOutcome::Duplicate => {
                return Ok(ProcessOutcome {
                    duplicate: true,
                    ..Default::default()
                });
            }
        };

        match to_state {
            CommandState::Complete => {
                command::complete(conn, current.id, observed.timestamp, Some(&observed.text))?;
            }
            state if state != current.state => {
                command::set_state(conn, current.id, state)?;
            }
            _ => {}
        }

        // Answers resolve the question that parked the command.
        if intent == TurnIntent::Answer
            && let Some(question) = turn::open_question(conn, current.id)?
        {
            turn::set_answered_by(conn, question.id, turn_id)?;
        }

        self.write_turn_detected(conn, writer, agent_row, current.id, turn_id, observed, intent);

        if intent == TurnIntent::Question {
            let result = writer.write_with_conn(
                conn,
                EventKind::QuestionDetected,
                json!({"question": preview(&observed.text), "turn_id": turn_id}),
                EventRefs {
                    agent_id: Some(agent_row.id),
                    command_id: Some(current.id),
                    turn_id: Some(turn_id),
                    ..Default::default()
                },
            );
            if !result.success {
                tracing::warn!(agent = agent_row.id, error = ?result.error, "question_detected write failed");
            }
        }

        let state_changed = to_state != current.state;
        if state_changed {
            self.write_transition(
                conn,
                writer,
                agent_row,
                current.id,
                Some(turn_id),
                current.state,
                to_state,
                verdict.trigger,
            );
        }

        Ok(ProcessOutcome {
            turn_id: Some(turn_id),
            command_id: Some(current.id),
            state_changed,
            new_state: state_changed.then_some(to_state),
            ..Default::default()
        })
    }

    fn write_turn_detected(
        &self,
        conn: &Connection,
        writer: &EventWriter,
        agent_row: &AgentRecord,
        command_id: CommandId,
        turn_id: TurnId,
        observed: &ObservedTurn,
        intent: TurnIntent,
    ) {
        let result = writer.write_with_conn(
            conn,
            EventKind::TurnDetected,
            json!({
                "actor": observed.actor.as_str(),
                "intent": intent.as_str(),
                "text_preview": preview(&observed.text),
                "timestamp_source": observed.timestamp_source.as_str(),
            }),
            EventRefs {
                agent_id: Some(agent_row.id),
                command_id: Some(command_id),
                turn_id: Some(turn_id),
                project_id: Some(agent_row.project_id),
            },
        );
        if !result.success {
            tracing::warn!(agent = agent_row.id, error = ?result.error, "turn_detected write failed");
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write_transition(
        &self,
        conn: &Connection,
        writer: &EventWriter,
        agent_row: &AgentRecord,
        command_id: CommandId,
        turn_id: Option<TurnId>,
        from_state: CommandState,
        to_state: CommandState,
        trigger: &str,
    ) {
        let result = writer.write_with_conn(
            conn,
            EventKind::StateTransition,
            json!({
                "from_state": from_state.as_str(),
                "to_state": to_state.as_str(),
                "trigger": trigger,
            }),
            EventRefs {
                agent_id: Some(agent_row.id),
                command_id: Some(command_id),
                turn_id,
                project_id: Some(agent_row.project_id),
            },
        );
        if !result.success {
            tracing::warn!(agent = agent_row.id, error = ?result.error, "state_transition write failed");
        }
    }

    /// A rejected cell is a no-op, but it still leaves an audit row: a
    /// self-transition tagged with the rejection reason.
    fn record_rejection(
        &self,
        conn: &Connection,
        writer: &EventWriter,
        agent_row: &AgentRecord,
        current: Option<&CommandRecord>,
        actor: TurnActor,
        intent: TurnIntent,
    ) -> Result<()> {
        let state = current.map(|c| c.state).unwrap_or(CommandState::Idle);
        let verdict = state_machine::validate(state, actor, intent);
        let result = writer.write_with_conn(
            conn,
            EventKind::StateTransition,
            json!({
                "from_state": state.as_str(),
                "to_state": state.as_str(),
                "trigger": verdict.trigger,
                "reason": verdict.reason.unwrap_or(REASON_NO_TRANSITION),
            }),
            EventRefs {
                agent_id: Some(agent_row.id),
                command_id: current.map(|c| c.id),
                project_id: Some(agent_row.project_id),
                ..Default::default()
            },
        );
        if !result.success {
            tracing::warn!(agent = agent_row.id, error = ?result.error, "rejection audit write failed");
        }
        Ok(())
    }

    fn bump_metrics(
        &self,
        conn: &Connection,
        agent_row: &AgentRecord,
        at: DateTime<Utc>,
    ) -> Result<()> {
        metric::bump_turn_count(conn, MetricScope::Overall, at, 1)?;
        metric::bump_turn_count(conn, MetricScope::Agent(agent_row.id), at, 1)?;
        metric::bump_turn_count(conn, MetricScope::Project(agent_row.project_id), at, 1)?;
        Ok(())
    }

    fn seen_recently(&self, agent_id: AgentId, observed: &ObservedTurn) -> bool {
        let Some(hash) = &observed.entry_hash else {
            return false;
        };
        let mut rings = self.recent_hashes.lock().unwrap_or_else(|p| p.into_inner());
        let ring = rings.entry(agent_id).or_default();
        let horizon = observed.timestamp - self.config.dedup_window;
        while let Some((_, ts)) = ring.front() {
            if *ts < horizon {
                ring.pop_front();
            } else {
                break;
            }
        }
        ring.iter().any(|(seen, _)| seen == hash)
    }

    fn remember_hash(&self, agent_id: AgentId, hash: String, at: DateTime<Utc>) {
        let mut rings = self.recent_hashes.lock().unwrap_or_else(|p| p.into_inner());
        let ring = rings.entry(agent_id).or_default();
        ring.push_back((hash, at));
        while ring.len() > self.config.dedup_capacity {
            ring.pop_front();
        }
    }

    fn allow_new_command(&self, agent_id: AgentId, at: DateTime<Utc>) -> bool {
        let mut opens = self.command_opens.lock().unwrap_or_else(|p| p.into_inner());
        let window = opens.entry(agent_id).or_default();
        let horizon = at - self.config.rate_window;
        while let Some(front) = window.front() {
            if *front < horizon {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() >= self.config.rate_limit_max {
            return false;
        }
        window.push_back(at);
        true
    }
}

/// Intent classification for raw observations. Hook-origin turns arrive
/// pre-classified by their route; everything else lands here.
fn classify(observed: &ObservedTurn, current: Option<&CommandRecord>) -> TurnIntent {
    match observed.actor {
        TurnActor::User => match current.map(|c| c.state) {
            Some(CommandState::AwaitingInput) => TurnIntent::Answer,
            _ => TurnIntent::Command,
        },
        TurnActor::Agent => {
            if looks_like_question(&observed.text) {
                TurnIntent::Question
            } else {
                TurnIntent::Progress
            }
        }
    }
}

/// An agent utterance whose final line ends in a question mark is waiting
/// on the operator.
fn looks_like_question(text: &str) -> bool {
    text.trim_end()
        .lines()
        .last()
        .map(|line| line.trim_end().ends_with('?'))
        .unwrap_or(false)
}

fn preview(text: &str) -> String {
    const MAX: usize = 200;
    if text.chars().count() <= MAX {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(MAX).collect();
        format!("{truncated}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crewdeck_store::queries::project::{self, NewProject};
    use crewdeck_store::queries::{agent as agent_q, event};
    use crewdeck_store::{Database, Storage};
    use crewdeck_types::TimestampSource;

    struct Fixture {
        _dir: tempfile::TempDir,
        storage: Storage,
        writer: EventWriter,
        correlator: Correlator,
        agent: AgentRecord,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().join("crewdeck.db")).unwrap();
        let db = storage.connect().unwrap();
        let project_id = project::insert(
            db.conn(),
            &NewProject {
                slug: "atlas",
                name: "Atlas",
                path: "/home/dev/atlas",
                git_origin: None,
                git_branch: None,
            },
        )
        .unwrap();
        let agent_id = agent_q::insert(
            db.conn(),
            &agent_q::NewAgent {
                session_uuid: "S1",
                project_id,
                persona_id: None,
                position_id: None,
                previous_agent_id: None,
                tmux_session_name: None,
                tmux_pane_id: None,
                started_at: Utc::now(),
            },
        )
        .unwrap();
        let agent = agent_q::get(db.conn(), agent_id).unwrap().unwrap();
        Fixture {
            _dir: dir,
            writer: EventWriter::new(storage.clone(), 3, 10),
            correlator: Correlator::new(CorrelatorConfig::default()),
            storage,
            agent,
        }
    }

    fn user_turn(text: &str) -> ObservedTurn {
        ObservedTurn::from_hook(TurnActor::User, text, Utc::now())
    }

    fn agent_turn(text: &str) -> ObservedTurn {
        ObservedTurn {
            actor: TurnActor::Agent,
            text: text.to_string(),
            timestamp: Utc::now(),
            timestamp_source: TimestampSource::Jsonl,
            entry_hash: Some(crate_entry_hash(text)),
            is_internal: false,
            tool_input: None,
        }
    }

    fn crate_entry_hash(text: &str) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(b"agent\n");
        hasher.update(text.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn db(fx: &Fixture) -> Database {
        fx.storage.connect().unwrap()
    }

    #[test]
    fn user_command_opens_commanded_command() {
        let fx = fixture();
        let db = db(&fx);
        let outcome = fx
            .correlator
            .process_turn(db.conn(), &fx.writer, &fx.agent, &user_turn("Fix login"))
            .unwrap();

        assert!(outcome.new_command_created);
        assert_eq!(outcome.new_state, Some(CommandState::Commanded));
        let cmd = command::get(db.conn(), outcome.command_id.unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(cmd.full_command.as_deref(), Some("Fix login"));
        assert_eq!(cmd.state, CommandState::Commanded);
    }

    #[test]
    fn progress_moves_commanded_to_processing_then_self_loops() {
        let fx = fixture();
        let db = db(&fx);
        fx.correlator
            .process_turn(db.conn(), &fx.writer, &fx.agent, &user_turn("go"))
            .unwrap();

        let first = fx
            .correlator
            .process_turn(db.conn(), &fx.writer, &fx.agent, &agent_turn("working on it"))
            .unwrap();
        assert_eq!(first.new_state, Some(CommandState::Processing));

        let second = fx
            .correlator
            .process_turn(db.conn(), &fx.writer, &fx.agent, &agent_turn("still going"))
            .unwrap();
        assert!(second.turn_id.is_some(), "self-loop still records the turn");
        assert!(!second.state_changed);
    }

    #[test]
    fn question_parks_command_and_answer_resumes_with_back_reference() {
        let fx = fixture();
        let db = db(&fx);
        fx.correlator
            .process_turn(db.conn(), &fx.writer, &fx.agent, &user_turn("go"))
            .unwrap();
        let q = fx
            .correlator
            .process_turn(
                db.conn(),
                &fx.writer,
                &fx.agent,
                &agent_turn("Should I also update the tests?"),
            )
            .unwrap();
        assert_eq!(q.new_state, Some(CommandState::AwaitingInput));

        let question_events = event::list_by_type(db.conn(), "question_detected", 5).unwrap();
        assert_eq!(question_events.len(), 1);

        let a = fx
            .correlator
            .process_turn(db.conn(), &fx.writer, &fx.agent, &user_turn("yes please"))
            .unwrap();
        assert_eq!(a.new_state, Some(CommandState::Processing));

        let question = turn::get(db.conn(), q.turn_id.unwrap()).unwrap().unwrap();
        assert_eq!(question.answered_by_turn_id, a.turn_id);
    }

    #[test]
    fn double_prompting_creates_a_sibling_command() {
        let fx = fixture();
        let db = db(&fx);
        let first = fx
            .correlator
            .process_turn(db.conn(), &fx.writer, &fx.agent, &user_turn("task one"))
            .unwrap();
        fx.correlator
            .process_turn(db.conn(), &fx.writer, &fx.agent, &agent_turn("on it"))
            .unwrap();

        let second = fx
            .correlator
            .process_turn(db.conn(), &fx.writer, &fx.agent, &user_turn("task two"))
            .unwrap();
        assert!(second.new_command_created);
        assert_ne!(first.command_id, second.command_id);

        // The first command keeps its state.
        let one = command::get(db.conn(), first.command_id.unwrap()).unwrap().unwrap();
        assert_eq!(one.state, CommandState::Processing);
    }

    #[test]
    fn stop_completes_and_populates_full_output() {
        let fx = fixture();
        let db = db(&fx);
        fx.correlator
            .process_turn(db.conn(), &fx.writer, &fx.agent, &user_turn("go"))
            .unwrap();
        fx.correlator
            .process_turn(db.conn(), &fx.writer, &fx.agent, &agent_turn("done, all tests pass"))
            .unwrap();

        let outcome = fx
            .correlator
            .process_stop(db.conn(), &fx.writer, &fx.agent)
            .unwrap();
        assert_eq!(outcome.new_state, Some(CommandState::Complete));

        let cmd = command::get(db.conn(), outcome.command_id.unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(cmd.state, CommandState::Complete);
        assert_eq!(cmd.full_output.as_deref(), Some("done, all tests pass"));
        assert!(cmd.completed_at.is_some());
    }

    #[test]
    fn notification_after_complete_is_a_noop() {
        let fx = fixture();
        let db = db(&fx);
        fx.correlator
            .process_turn(db.conn(), &fx.writer, &fx.agent, &user_turn("go"))
            .unwrap();
        fx.correlator
            .process_stop(db.conn(), &fx.writer, &fx.agent)
            .unwrap();

        let outcome = fx
            .correlator
            .process_notification(db.conn(), &fx.writer, &fx.agent)
            .unwrap();
        assert!(!outcome.state_changed);
        assert_eq!(outcome.new_state, None);

        // The completed command was not revived.
        assert!(command::current_for_agent(db.conn(), fx.agent.id).unwrap().is_none());
    }

    #[test]
    fn notification_while_processing_parks_for_input() {
        let fx = fixture();
        let db = db(&fx);
        fx.correlator
            .process_turn(db.conn(), &fx.writer, &fx.agent, &user_turn("go"))
            .unwrap();
        fx.correlator
            .process_turn(db.conn(), &fx.writer, &fx.agent, &agent_turn("running"))
            .unwrap();

        let outcome = fx
            .correlator
            .process_notification(db.conn(), &fx.writer, &fx.agent)
            .unwrap();
        assert_eq!(outcome.new_state, Some(CommandState::AwaitingInput));

        // A second notification is a no-op.
        let again = fx
            .correlator
            .process_notification(db.conn(), &fx.writer, &fx.agent)
            .unwrap();
        assert!(!again.state_changed);
    }

    #[test]
    fn identical_jsonl_entries_yield_exactly_one_turn() {
        let fx = fixture();
        let db = db(&fx);
        fx.correlator
            .process_turn(db.conn(), &fx.writer, &fx.agent, &user_turn("go"))
            .unwrap();

        let line = agent_turn("the same appended line");
        let first = fx
            .correlator
            .process_turn(db.conn(), &fx.writer, &fx.agent, &line)
            .unwrap();
        assert!(first.turn_id.is_some());

        let second = fx
            .correlator
            .process_turn(db.conn(), &fx.writer, &fx.agent, &line)
            .unwrap();
        assert!(second.duplicate);
        assert!(second.turn_id.is_none());

        assert_eq!(
            command::turn_count(db.conn(), first.command_id.unwrap()).unwrap(),
            2 // the user command turn + one agent turn
        );
    }

    #[test]
    fn storage_index_catches_duplicates_that_skip_the_ring() {
        let fx = fixture();
        let db = db(&fx);
        fx.correlator
            .process_turn(db.conn(), &fx.writer, &fx.agent, &user_turn("go"))
            .unwrap();

        let line = agent_turn("raced line");
        fx.correlator
            .process_turn(db.conn(), &fx.writer, &fx.agent, &line)
            .unwrap();

        // A second correlator (fresh ring, same store) simulates the
        // concurrent-hook race; the partial unique index backstops it.
        let other = Correlator::new(CorrelatorConfig::default());
        let outcome = other
            .process_turn(db.conn(), &fx.writer, &fx.agent, &line)
            .unwrap();
        assert!(outcome.duplicate);
    }

    #[test]
    fn runaway_prompt_loop_is_rate_limited() {
        let fx = fixture();
        let db = db(&fx);
        let correlator = Correlator::new(CorrelatorConfig {
            rate_limit_max: 3,
            ..CorrelatorConfig::default()
        });

        let mut limited = 0;
        for i in 0..5 {
            let outcome = correlator
                .process_turn(db.conn(), &fx.writer, &fx.agent, &user_turn(&format!("p{i}")))
                .unwrap();
            if outcome.rate_limited {
                limited += 1;
            }
        }
        assert_eq!(limited, 2);
    }

    #[test]
    fn rejected_cells_leave_an_audit_trail() {
        let fx = fixture();
        let db = db(&fx);
        // Agent progress with no command at all: rejected, but last_seen
        // still moves and an audit event lands.
        let before = event::list_by_type(db.conn(), "state_transition", 50).unwrap().len();
        let outcome = fx
            .correlator
            .process_turn(db.conn(), &fx.writer, &fx.agent, &agent_turn("orphan output"))
            .unwrap();
        assert!(outcome.turn_id.is_none());

        let after = event::list_by_type(db.conn(), "state_transition", 50).unwrap();
        assert_eq!(after.len(), before + 1);
        assert_eq!(after[0].payload["reason"], REASON_NO_TRANSITION);
    }
}
