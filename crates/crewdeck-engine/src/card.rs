use chrono::{DateTime, Duration, Utc};
use crewdeck_store::queries::{command, project, turn};
use crewdeck_store::records::{AgentRecord, CommandRecord};
use crewdeck_store::Result;
use crewdeck_types::{CardState, CommandState, TurnActor};
use rusqlite::Connection;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// One dashboard card. States cross the wire as strings; enums never do.
#[derive(Debug, Clone, Serialize)]
pub struct AgentCard {
    pub id: i64,
    pub session_uuid: String,
    pub project_id: i64,
    pub project_slug: String,
    pub project_name: String,
    pub state: String,
    pub state_info: StateInfo,
    pub is_active: bool,
    pub uptime: String,
    pub last_seen: String,
    pub task_summary: Option<String>,
    pub task_instruction: Option<String>,
    pub task_completion_summary: Option<String>,
    pub priority: i64,
    pub priority_reason: Option<String>,
    pub turn_count: i64,
    pub elapsed: Option<String>,
    pub hero_chars: String,
    pub hero_trail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateInfo {
    pub label: &'static str,
    pub color: &'static str,
    pub description: &'static str,
}

fn state_info(state: CardState) -> StateInfo {
    match state {
        CardState::Idle => StateInfo {
            label: "Idle",
            color: "slate",
            description: "Waiting for a command",
        },
        CardState::Commanded => StateInfo {
            label: "Commanded",
            color: "blue",
            description: "Command received, not yet started",
        },
        CardState::Processing => StateInfo {
            label: "Processing",
            color: "green",
            description: "Working on the current command",
        },
        CardState::AwaitingInput => StateInfo {
            label: "Awaiting input",
            color: "amber",
            description: "Blocked on an operator answer",
        },
        CardState::Complete => StateInfo {
            label: "Complete",
            color: "teal",
            description: "Last command finished",
        },
        CardState::TimedOut => StateInfo {
            label: "Timed out",
            color: "red",
            description: "Processing with no recent activity",
        },
    }
}

const DEFAULT_PRIORITY: i64 = 50;

/// Read-side projection of an agent into its card payload.
#[derive(Debug, Clone)]
pub struct CardProjector {
    pub stale_processing_seconds: i64,
    pub active_timeout_minutes: i64,
}

impl Default for CardProjector {
    fn default() -> Self {
        Self {
            stale_processing_seconds: 600,
            active_timeout_minutes: 5,
        }
    }
}

impl CardProjector {
    pub fn project(
        &self,
        conn: &Connection,
        agent: &AgentRecord,
        now: DateTime<Utc>,
    ) -> Result<AgentCard> {
        let project = project::get(conn, agent.project_id)?;
        let latest = command::latest_for_agent(conn, agent.id)?;
        let state = self.effective_state(conn, agent, latest.as_ref(), now)?;

        let (task_summary, task_instruction, task_completion_summary) = match &latest {
            Some(cmd) => {
                let newest_turn = turn::list_for_command(conn, cmd.id)?
                    .into_iter()
                    .rev()
                    .find(|t| !t.is_internal);
                let summary = newest_turn
                    .and_then(|t| t.summary.or(Some(t.text)))
                    .filter(|s| !s.trim().is_empty());
                (
                    summary,
                    cmd.instruction.clone().or_else(|| cmd.full_command.clone()),
                    cmd.completion_summary.clone(),
                )
            }
            None => (Some("No active task".to_string()), None, None),
        };

        let (turn_count, elapsed) = match &latest {
            Some(cmd) => {
                let count = command::turn_count(conn, cmd.id)?;
                let elapsed = cmd
                    .completed_at
                    .map(|done| humanise_duration(done - cmd.started_at));
                (count, elapsed)
            }
            None => (0, None),
        };

        Ok(AgentCard {
            id: agent.id,
            session_uuid: agent.session_uuid.clone(),
            project_id: agent.project_id,
            project_slug: project.as_ref().map(|p| p.slug.clone()).unwrap_or_default(),
            project_name: project.map(|p| p.name).unwrap_or_default(),
            state: state.as_str().to_string(),
            state_info: state_info(state),
            is_active: self.is_active(agent, now),
            uptime: humanise_duration(now - agent.started_at),
            last_seen: humanise_last_seen(now - agent.last_seen_at),
            task_summary,
            task_instruction,
            task_completion_summary,
            priority: agent.priority_score.unwrap_or(DEFAULT_PRIORITY),
            priority_reason: agent.priority_reason.clone(),
            turn_count,
            elapsed,
            hero_chars: hero_chars(&agent.session_uuid),
            hero_trail: hero_trail(&agent.session_uuid),
        })
    }

    /// TIMED_OUT is derived: a processing command whose newest turn is older
    /// than the staleness threshold. Everything else mirrors the newest
    /// command, or IDLE with none.
    fn effective_state(
        &self,
        conn: &Connection,
        agent: &AgentRecord,
        latest: Option<&CommandRecord>,
        now: DateTime<Utc>,
    ) -> Result<CardState> {
        let Some(latest) = latest else {
            return Ok(CardState::Idle);
        };
        if latest.state == CommandState::Processing {
            let last_activity = turn::latest_for_agent(conn, agent.id)?
                .map(|t| t.timestamp)
                .unwrap_or(agent.last_seen_at);
            if now - last_activity > Duration::seconds(self.stale_processing_seconds) {
                return Ok(CardState::TimedOut);
            }
        }
        Ok(CardState::from(latest.state))
    }

    fn is_active(&self, agent: &AgentRecord, now: DateTime<Utc>) -> bool {
        agent.ended_at.is_none()
            && now - agent.last_seen_at <= Duration::minutes(self.active_timeout_minutes)
    }
}

/// Stable visual identifier: two glyphs plus a short trail, both derived
/// from the session UUID so a card keeps its face across refreshes.
pub fn hero_chars(session_uuid: &str) -> String {
    let digest = Sha256::digest(session_uuid.as_bytes());
    const GLYPHS: &[char] = &[
        '◐', '◑', '◒', '◓', '◔', '◕', '◖', '◗', '▲', '▼', '◆', '●', '■', '▣', '▤', '▥',
    ];
    let first = GLYPHS[digest[0] as usize % GLYPHS.len()];
    let second = GLYPHS[digest[1] as usize % GLYPHS.len()];
    format!("{first}{second}")
}

pub fn hero_trail(session_uuid: &str) -> String {
    let digest = Sha256::digest(session_uuid.as_bytes());
    digest[2..5].iter().map(|b| format!("{b:02x}")).collect()
}

fn humanise_duration(duration: Duration) -> String {
    let seconds = duration.num_seconds().max(0);
    let (days, hours, minutes) = (seconds / 86_400, (seconds % 86_400) / 3_600, (seconds % 3_600) / 60);
    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m")
    } else {
        format!("{seconds}s")
    }
}

fn humanise_last_seen(since: Duration) -> String {
    let seconds = since.num_seconds().max(0);
    if seconds < 10 {
        "just now".to_string()
    } else if seconds < 60 {
        format!("{seconds}s ago")
    } else if seconds < 3_600 {
        format!("{}m ago", seconds / 60)
    } else if seconds < 86_400 {
        format!("{}h ago", seconds / 3_600)
    } else {
        format!("{}d ago", seconds / 86_400)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crewdeck_store::queries::{agent as agent_q, project as project_q};
    use crewdeck_store::Database;

    fn insert_bare_turn(conn: &Connection, command_id: i64, timestamp: DateTime<Utc>) {
        let observed = crewdeck_types::ObservedTurn {
            actor: TurnActor::Agent,
            text: "working".to_string(),
            timestamp,
            timestamp_source: crewdeck_types::TimestampSource::Jsonl,
            entry_hash: None,
            is_internal: false,
            tool_input: None,
        };
        turn::insert(conn, command_id, &observed, crewdeck_types::TurnIntent::Progress).unwrap();
    }

    fn seed(conn: &Connection) -> AgentRecord {
        let project_id = project_q::insert(
            conn,
            &project_q::NewProject {
                slug: "atlas",
                name: "Atlas",
                path: "/home/dev/atlas",
                git_origin: None,
                git_branch: None,
            },
        )
        .unwrap();
        let id = agent_q::insert(
            conn,
            &agent_q::NewAgent {
                session_uuid: "11111111-2222-3333-4444-555555555555",
                project_id,
                persona_id: None,
                position_id: None,
                previous_agent_id: None,
                tmux_session_name: None,
                tmux_pane_id: None,
                started_at: Utc::now() - Duration::hours(1),
            },
        )
        .unwrap();
        agent_q::get(conn, id).unwrap().unwrap()
    }

    #[test]
    fn idle_agent_card_has_defaults() {
        let db = Database::open_in_memory().unwrap();
        let agent = seed(db.conn());
        let card = CardProjector::default()
            .project(db.conn(), &agent, Utc::now())
            .unwrap();

        assert_eq!(card.state, "IDLE");
        assert_eq!(card.task_summary.as_deref(), Some("No active task"));
        assert_eq!(card.priority, DEFAULT_PRIORITY);
        assert_eq!(card.turn_count, 0);
        assert_eq!(card.elapsed, None);
        assert!(card.is_active);
        assert_eq!(card.project_slug, "atlas");
        assert!(card.uptime.contains('h'));
    }

    #[test]
    fn processing_card_reflects_command_and_instruction() {
        let db = Database::open_in_memory().unwrap();
        let agent = seed(db.conn());
        let cmd = command::insert(
            db.conn(),
            agent.id,
            CommandState::Processing,
            Utc::now(),
            Some("Add OAuth2 support"),
        )
        .unwrap();
        insert_bare_turn(db.conn(), cmd, Utc::now());

        let card = CardProjector::default()
            .project(db.conn(), &agent, Utc::now())
            .unwrap();
        assert_eq!(card.state, "PROCESSING");
        assert_eq!(card.task_instruction.as_deref(), Some("Add OAuth2 support"));
        assert_eq!(card.turn_count, 1);
    }

    #[test]
    fn stale_processing_derives_timed_out() {
        let db = Database::open_in_memory().unwrap();
        let agent = seed(db.conn());
        let cmd = command::insert(
            db.conn(),
            agent.id,
            CommandState::Processing,
            Utc::now() - Duration::minutes(30),
            None,
        )
        .unwrap();
        insert_bare_turn(db.conn(), cmd, Utc::now() - Duration::minutes(20));

        let card = CardProjector::default()
            .project(db.conn(), &agent, Utc::now())
            .unwrap();
        assert_eq!(card.state, "TIMED_OUT");
        assert_eq!(card.state_info.color, "red");
    }

    #[test]
    fn complete_card_carries_turn_count_and_elapsed() {
        let db = Database::open_in_memory().unwrap();
        let agent = seed(db.conn());
        let started = Utc::now() - Duration::minutes(95);
        let cmd = command::insert(db.conn(), agent.id, CommandState::Commanded, started, Some("fix"))
            .unwrap();
        for offset in [90, 80, 70] {
            insert_bare_turn(db.conn(), cmd, Utc::now() - Duration::minutes(offset));
        }
        command::complete(db.conn(), cmd, started + Duration::minutes(90), None).unwrap();
        command::set_completion_summary(db.conn(), cmd, "Bug fixed").unwrap();

        let card = CardProjector::default()
            .project(db.conn(), &agent, Utc::now())
            .unwrap();
        assert_eq!(card.state, "COMPLETE");
        assert_eq!(card.turn_count, 3);
        assert_eq!(card.elapsed.as_deref(), Some("1h 30m"));
        assert_eq!(card.task_completion_summary.as_deref(), Some("Bug fixed"));
    }

    #[test]
    fn hero_identifiers_are_stable_per_session() {
        let a1 = hero_chars("11111111-2222-3333-4444-555555555555");
        let a2 = hero_chars("11111111-2222-3333-4444-555555555555");
        let b = hero_chars("99999999-8888-7777-6666-555555555555");
        assert_eq!(a1, a2);
        assert_ne!(hero_trail("s1"), hero_trail("s2"));
        let _ = b;
    }

    #[test]
    fn inactive_after_timeout_or_end() {
        let db = Database::open_in_memory().unwrap();
        let agent = seed(db.conn());
        let projector = CardProjector::default();

        let later = Utc::now() + Duration::minutes(10);
        let card = projector.project(db.conn(), &agent, later).unwrap();
        assert!(!card.is_active);
        assert!(card.last_seen.ends_with("ago"));
    }
}
