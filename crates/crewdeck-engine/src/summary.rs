use chrono::Utc;
use crewdeck_store::queries::event::EventRefs;
use crewdeck_store::queries::{agent, command, project, turn};
use crewdeck_store::records::{CommandRecord, TurnRecord};
use crewdeck_store::{Result, Storage};
use crewdeck_types::{InferenceLevel, TurnActor};

use crate::oracle::CachingOracle;

/// Batch sizes per pass keep a single slow oracle from starving the loop.
const TURN_BATCH: i64 = 16;
const COMMAND_BATCH: i64 = 8;

/// Per-turn and per-command summary generation.
///
/// Nothing is inferred for a project with `inference_paused`; the rows stay
/// pending and are picked up once the pause lifts.
pub struct Summariser {
    storage: Storage,
    oracle: CachingOracle,
}

impl Summariser {
    pub fn new(storage: Storage, oracle: CachingOracle) -> Self {
        Self { storage, oracle }
    }

    /// One pass over pending work. Returns how many summaries were written.
    pub fn run_once(&self) -> Result<usize> {
        let mut written = 0;
        written += self.summarise_turns()?;
        written += self.summarise_commands()?;
        Ok(written)
    }

    fn summarise_turns(&self) -> Result<usize> {
        let db = self.storage.connect()?;
        let pending = turn::pending_summaries(db.conn(), TURN_BATCH)?;
        let mut written = 0;
        for turn_row in pending {
            if self.project_paused_for_turn(&turn_row)? {
                continue;
            }
            let prompt = format!(
                "Summarise this {} message from a coding session in one or two sentences:\n\n{}",
                turn_row.actor, turn_row.text
            );
            let refs = EventRefs {
                turn_id: Some(turn_row.id),
                command_id: Some(turn_row.command_id),
                ..Default::default()
            };
            match self.oracle.infer(InferenceLevel::Turn, &prompt, refs) {
                Ok((summary, _cached)) => {
                    turn::set_summary(db.conn(), turn_row.id, summary.trim(), Utc::now())?;
                    written += 1;
                }
                Err(err) => {
                    tracing::warn!(turn = turn_row.id, %err, "turn summary failed");
                }
            }
        }
        Ok(written)
    }

    fn summarise_commands(&self) -> Result<usize> {
        let db = self.storage.connect()?;
        let pending = command::pending_completion_summaries(db.conn(), COMMAND_BATCH)?;
        let mut written = 0;
        for cmd in pending {
            if self.project_paused_for_command(&cmd)? {
                continue;
            }

            // Instruction comes from the opening user turn.
            if cmd.instruction.is_none()
                && let Some(opening) =
                    turn::first_for_command_by_actor(db.conn(), cmd.id, TurnActor::User)?
            {
                let prompt = format!(
                    "Condense this request into a one-line instruction:\n\n{}",
                    opening.text
                );
                let refs = EventRefs {
                    command_id: Some(cmd.id),
                    ..Default::default()
                };
                match self.oracle.infer(InferenceLevel::Command, &prompt, refs) {
                    Ok((instruction, _)) => {
                        command::set_instruction(db.conn(), cmd.id, instruction.trim())?;
                    }
                    Err(err) => {
                        tracing::warn!(command = cmd.id, %err, "instruction summary failed");
                    }
                }
            }

            // Completion summary from the last user/agent exchange.
            let turns = turn::list_for_command(db.conn(), cmd.id)?;
            let last_agent = turns.iter().rev().find(|t| t.actor == TurnActor::Agent);
            let last_user = turns.iter().rev().find(|t| t.actor == TurnActor::User);
            let mut material = String::new();
            if let Some(user) = last_user {
                material.push_str(&format!("User: {}\n", user.text));
            }
            if let Some(agent_turn) = last_agent {
                material.push_str(&format!("Agent: {}\n", agent_turn.text));
            }
            if material.is_empty() {
                material = cmd.full_command.clone().unwrap_or_default();
            }

            let prompt = format!(
                "Summarise the outcome of this completed command in one or two sentences:\n\n{material}"
            );
            let refs = EventRefs {
                command_id: Some(cmd.id),
                ..Default::default()
            };
            match self.oracle.infer(InferenceLevel::Command, &prompt, refs) {
                Ok((summary, _)) => {
                    command::set_completion_summary(db.conn(), cmd.id, summary.trim())?;
                    written += 1;
                }
                Err(err) => {
                    tracing::warn!(command = cmd.id, %err, "completion summary failed");
                }
            }
        }
        Ok(written)
    }

    fn project_paused_for_turn(&self, turn_row: &TurnRecord) -> Result<bool> {
        let db = self.storage.connect()?;
        let Some(cmd) = command::get(db.conn(), turn_row.command_id)? else {
            return Ok(false);
        };
        self.project_paused_for_command(&cmd)
    }

    fn project_paused_for_command(&self, cmd: &CommandRecord) -> Result<bool> {
        let db = self.storage.connect()?;
        let Some(agent_row) = agent::get(db.conn(), cmd.agent_id)? else {
            return Ok(false);
        };
        let Some(project_row) = project::get(db.conn(), agent_row.project_id)? else {
            return Ok(false);
        };
        Ok(project_row.inference_paused)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::Oracle;
    use crewdeck_store::queries::{agent as agent_q, project as project_q};
    use crewdeck_types::{CommandState, ObservedTurn, TimestampSource, TurnIntent};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        _dir: tempfile::TempDir,
        storage: Storage,
        agent_id: i64,
        project_id: i64,
        oracle_calls: Arc<AtomicUsize>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().join("s.db")).unwrap();
        let db = storage.connect().unwrap();
        let project_id = project_q::insert(
            db.conn(),
            &project_q::NewProject {
                slug: "p",
                name: "P",
                path: "/p",
                git_origin: None,
                git_branch: None,
            },
        )
        .unwrap();
        let agent_id = agent_q::insert(
            db.conn(),
            &agent_q::NewAgent {
                session_uuid: "S",
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
        Fixture {
            _dir: dir,
            storage,
            agent_id,
            project_id,
            oracle_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn summariser(fx: &Fixture) -> Summariser {
        let calls = Arc::clone(&fx.oracle_calls);
        let oracle: Arc<dyn Oracle> = Arc::new(move |prompt: &str| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("Summary of: {}", prompt.lines().last().unwrap_or("")))
        });
        Summariser::new(
            fx.storage.clone(),
            CachingOracle::new(fx.storage.clone(), oracle),
        )
    }

    fn seed_turn(fx: &Fixture, text: &str) -> (i64, i64) {
        let db = fx.storage.connect().unwrap();
        let cmd = command::insert(db.conn(), fx.agent_id, CommandState::Processing, Utc::now(), Some(text))
            .unwrap();
        let observed = ObservedTurn {
            actor: TurnActor::Agent,
            text: text.to_string(),
            timestamp: Utc::now(),
            timestamp_source: TimestampSource::Jsonl,
            entry_hash: None,
            is_internal: false,
            tool_input: None,
        };
        let id = match turn::insert(db.conn(), cmd, &observed, TurnIntent::Progress).unwrap() {
            crewdeck_store::queries::turn::InsertOutcome::Inserted(id) => id,
            other => panic!("unexpected {other:?}"),
        };
        (cmd, id)
    }

    #[test]
    fn turn_summaries_are_written_once() {
        let fx = fixture();
        let (_cmd, turn_id) = seed_turn(&fx, "Refactored the auth module");
        let summariser = summariser(&fx);

        assert_eq!(summariser.run_once().unwrap(), 1);
        let db = fx.storage.connect().unwrap();
        let stored = turn::get(db.conn(), turn_id).unwrap().unwrap();
        assert!(stored.summary.is_some());
        assert!(stored.summary_generated_at.is_some());

        // A second pass finds nothing pending.
        assert_eq!(summariser.run_once().unwrap(), 0);
    }

    #[test]
    fn paused_project_is_gated() {
        let fx = fixture();
        seed_turn(&fx, "Should not be summarised");
        {
            let db = fx.storage.connect().unwrap();
            project_q::set_inference_paused(db.conn(), fx.project_id, true, Some("cost"), Utc::now())
                .unwrap();
        }

        let summariser = summariser(&fx);
        assert_eq!(summariser.run_once().unwrap(), 0);
        assert_eq!(fx.oracle_calls.load(Ordering::SeqCst), 0, "no oracle traffic while paused");
    }

    #[test]
    fn completed_command_gets_instruction_and_completion_summary() {
        let fx = fixture();
        let db = fx.storage.connect().unwrap();
        let cmd = command::insert(db.conn(), fx.agent_id, CommandState::Commanded, Utc::now(), Some("fix the login flow"))
            .unwrap();
        let opening = ObservedTurn::from_hook(TurnActor::User, "fix the login flow", Utc::now());
        turn::insert(db.conn(), cmd, &opening, TurnIntent::Command).unwrap();
        let reply = ObservedTurn {
            actor: TurnActor::Agent,
            text: "Login flow fixed, added a regression test".to_string(),
            timestamp: Utc::now(),
            timestamp_source: TimestampSource::Jsonl,
            entry_hash: None,
            is_internal: false,
            tool_input: None,
        };
        turn::insert(db.conn(), cmd, &reply, TurnIntent::Progress).unwrap();
        command::complete(db.conn(), cmd, Utc::now(), None).unwrap();

        let summariser = summariser(&fx);
        summariser.run_once().unwrap();

        let stored = command::get(db.conn(), cmd).unwrap().unwrap();
        assert!(stored.instruction.is_some());
        assert!(stored.completion_summary.is_some());
    }
}
