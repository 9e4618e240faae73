use chrono::{DateTime, Utc};
use crewdeck_types::{
    AgentId, CommandId, CommandState, EventId, InferenceLevel, PersonaStatus, ProjectId,
    TimestampSource, TurnActor, TurnId, TurnIntent,
};
use rusqlite::Row;

use crate::time::parse_ts;

fn optional_ts(value: Option<String>) -> Option<DateTime<Utc>> {
    value.as_deref().and_then(parse_ts)
}

#[derive(Debug, Clone)]
pub struct ProjectRecord {
    pub id: ProjectId,
    pub slug: String,
    pub name: String,
    pub path: String,
    pub git_origin: Option<String>,
    pub git_branch: Option<String>,
    pub inference_paused: bool,
    pub inference_paused_reason: Option<String>,
    pub inference_paused_at: Option<DateTime<Utc>>,
}

impl ProjectRecord {
    pub const COLUMNS: &'static str = "id, slug, name, path, git_origin, git_branch, \
         inference_paused, inference_paused_reason, inference_paused_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            slug: row.get(1)?,
            name: row.get(2)?,
            path: row.get(3)?,
            git_origin: row.get(4)?,
            git_branch: row.get(5)?,
            inference_paused: row.get(6)?,
            inference_paused_reason: row.get(7)?,
            inference_paused_at: optional_ts(row.get(8)?),
        })
    }
}

#[derive(Debug, Clone)]
pub struct PersonaRecord {
    pub id: i64,
    pub role_id: i64,
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    pub status: PersonaStatus,
    pub created_at: DateTime<Utc>,
}

impl PersonaRecord {
    pub const COLUMNS: &'static str = "id, role_id, slug, name, description, status, created_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get(5)?;
        let created_at: String = row.get(6)?;
        Ok(Self {
            id: row.get(0)?,
            role_id: row.get(1)?,
            slug: row.get(2)?,
            name: row.get(3)?,
            description: row.get(4)?,
            status: PersonaStatus::parse(&status).unwrap_or(PersonaStatus::Archived),
            created_at: parse_ts(&created_at).unwrap_or_else(Utc::now),
        })
    }
}

#[derive(Debug, Clone)]
pub struct PositionRecord {
    pub id: i64,
    pub role_id: Option<i64>,
    pub title: String,
    pub reports_to_id: Option<i64>,
    pub escalates_to_id: Option<i64>,
}

impl PositionRecord {
    pub const COLUMNS: &'static str = "id, role_id, title, reports_to_id, escalates_to_id";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            role_id: row.get(1)?,
            title: row.get(2)?,
            reports_to_id: row.get(3)?,
            escalates_to_id: row.get(4)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub id: AgentId,
    pub session_uuid: String,
    pub project_id: ProjectId,
    pub persona_id: Option<i64>,
    pub position_id: Option<i64>,
    pub previous_agent_id: Option<AgentId>,
    pub tmux_session_name: Option<String>,
    pub tmux_pane_id: Option<String>,
    pub iterm_window_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub prompt_injected_at: Option<DateTime<Utc>>,
    pub guardrails_version_hash: Option<String>,
    pub priority_score: Option<i64>,
    pub priority_reason: Option<String>,
    pub priority_updated_at: Option<DateTime<Utc>>,
    pub context_percent_used: Option<i64>,
    pub context_remaining_tokens: Option<String>,
    pub context_updated_at: Option<DateTime<Utc>>,
}

impl AgentRecord {
    pub const COLUMNS: &'static str = "id, session_uuid, project_id, persona_id, position_id, \
         previous_agent_id, tmux_session_name, tmux_pane_id, iterm_window_id, started_at, \
         last_seen_at, ended_at, prompt_injected_at, guardrails_version_hash, priority_score, \
         priority_reason, priority_updated_at, context_percent_used, context_remaining_tokens, \
         context_updated_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let started_at: String = row.get(9)?;
        let last_seen_at: String = row.get(10)?;
        Ok(Self {
            id: row.get(0)?,
            session_uuid: row.get(1)?,
            project_id: row.get(2)?,
            persona_id: row.get(3)?,
            position_id: row.get(4)?,
            previous_agent_id: row.get(5)?,
            tmux_session_name: row.get(6)?,
            tmux_pane_id: row.get(7)?,
            iterm_window_id: row.get(8)?,
            started_at: parse_ts(&started_at).unwrap_or_else(Utc::now),
            last_seen_at: parse_ts(&last_seen_at).unwrap_or_else(Utc::now),
            ended_at: optional_ts(row.get(11)?),
            prompt_injected_at: optional_ts(row.get(12)?),
            guardrails_version_hash: row.get(13)?,
            priority_score: row.get(14)?,
            priority_reason: row.get(15)?,
            priority_updated_at: optional_ts(row.get(16)?),
            context_percent_used: row.get(17)?,
            context_remaining_tokens: row.get(18)?,
            context_updated_at: optional_ts(row.get(19)?),
        })
    }

    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct CommandRecord {
    pub id: CommandId,
    pub agent_id: AgentId,
    pub state: CommandState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub instruction: Option<String>,
    pub completion_summary: Option<String>,
    pub full_command: Option<String>,
    pub full_output: Option<String>,
    pub plan_file_path: Option<String>,
    pub plan_content: Option<String>,
    pub plan_approved_at: Option<DateTime<Utc>>,
}

impl CommandRecord {
    pub const COLUMNS: &'static str = "id, agent_id, state, started_at, completed_at, \
         instruction, completion_summary, full_command, full_output, plan_file_path, \
         plan_content, plan_approved_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let state: String = row.get(2)?;
        let started_at: String = row.get(3)?;
        Ok(Self {
            id: row.get(0)?,
            agent_id: row.get(1)?,
            state: CommandState::parse(&state).unwrap_or(CommandState::Idle),
            started_at: parse_ts(&started_at).unwrap_or_else(Utc::now),
            completed_at: optional_ts(row.get(4)?),
            instruction: row.get(5)?,
            completion_summary: row.get(6)?,
            full_command: row.get(7)?,
            full_output: row.get(8)?,
            plan_file_path: row.get(9)?,
            plan_content: row.get(10)?,
            plan_approved_at: optional_ts(row.get(11)?),
        })
    }
}

#[derive(Debug, Clone)]
pub struct TurnRecord {
    pub id: TurnId,
    pub command_id: CommandId,
    pub actor: TurnActor,
    pub intent: TurnIntent,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub timestamp_source: TimestampSource,
    pub jsonl_entry_hash: Option<String>,
    pub is_internal: bool,
    pub tool_input: Option<serde_json::Value>,
    pub file_metadata: Option<serde_json::Value>,
    pub answered_by_turn_id: Option<TurnId>,
    pub summary: Option<String>,
    pub summary_generated_at: Option<DateTime<Utc>>,
}

impl TurnRecord {
    pub const COLUMNS: &'static str = "id, command_id, actor, intent, text, timestamp, \
         timestamp_source, jsonl_entry_hash, is_internal, tool_input, file_metadata, \
         answered_by_turn_id, summary, summary_generated_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let actor: String = row.get(2)?;
        let intent: String = row.get(3)?;
        let timestamp: String = row.get(5)?;
        let source: String = row.get(6)?;
        let tool_input: Option<String> = row.get(9)?;
        let file_metadata: Option<String> = row.get(10)?;
        Ok(Self {
            id: row.get(0)?,
            command_id: row.get(1)?,
            actor: TurnActor::parse(&actor).unwrap_or(TurnActor::Agent),
            intent: TurnIntent::parse(&intent).unwrap_or(TurnIntent::Progress),
            text: row.get(4)?,
            timestamp: parse_ts(&timestamp).unwrap_or_else(Utc::now),
            timestamp_source: TimestampSource::parse(&source).unwrap_or(TimestampSource::Inferred),
            jsonl_entry_hash: row.get(7)?,
            is_internal: row.get(8)?,
            tool_input: tool_input.and_then(|s| serde_json::from_str(&s).ok()),
            file_metadata: file_metadata.and_then(|s| serde_json::from_str(&s).ok()),
            answered_by_turn_id: row.get(11)?,
            summary: row.get(12)?,
            summary_generated_at: optional_ts(row.get(13)?),
        })
    }
}

#[derive(Debug, Clone)]
pub struct EventRecord {
    pub id: EventId,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub project_id: Option<ProjectId>,
    pub agent_id: Option<AgentId>,
    pub command_id: Option<CommandId>,
    pub turn_id: Option<TurnId>,
}

impl EventRecord {
    pub const COLUMNS: &'static str =
        "id, event_type, payload, created_at, project_id, agent_id, command_id, turn_id";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let payload: String = row.get(2)?;
        let created_at: String = row.get(3)?;
        Ok(Self {
            id: row.get(0)?,
            event_type: row.get(1)?,
            payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
            created_at: parse_ts(&created_at).unwrap_or_else(Utc::now),
            project_id: row.get(4)?,
            agent_id: row.get(5)?,
            command_id: row.get(6)?,
            turn_id: row.get(7)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct HandoffRecord {
    pub id: i64,
    pub agent_id: AgentId,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl HandoffRecord {
    pub const COLUMNS: &'static str = "id, agent_id, reason, created_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let created_at: String = row.get(3)?;
        Ok(Self {
            id: row.get(0)?,
            agent_id: row.get(1)?,
            reason: row.get(2)?,
            created_at: parse_ts(&created_at).unwrap_or_else(Utc::now),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ActivityMetricRecord {
    pub id: i64,
    pub bucket_start: DateTime<Utc>,
    pub is_overall: bool,
    pub agent_id: Option<AgentId>,
    pub project_id: Option<ProjectId>,
    pub turn_count: i64,
}

impl ActivityMetricRecord {
    pub const COLUMNS: &'static str =
        "id, bucket_start, is_overall, agent_id, project_id, turn_count";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let bucket_start: String = row.get(1)?;
        Ok(Self {
            id: row.get(0)?,
            bucket_start: parse_ts(&bucket_start).unwrap_or_else(Utc::now),
            is_overall: row.get(2)?,
            agent_id: row.get(3)?,
            project_id: row.get(4)?,
            turn_count: row.get(5)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct InferenceCallRecord {
    pub id: i64,
    pub level: InferenceLevel,
    pub input_hash: String,
    pub cached: bool,
    pub input_text: Option<String>,
    pub output_text: Option<String>,
    pub tokens_in: Option<i64>,
    pub tokens_out: Option<i64>,
    pub cost_usd: Option<f64>,
    pub latency_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub project_id: Option<ProjectId>,
    pub agent_id: Option<AgentId>,
    pub command_id: Option<CommandId>,
    pub turn_id: Option<TurnId>,
}

impl InferenceCallRecord {
    pub const COLUMNS: &'static str = "id, level, input_hash, cached, input_text, output_text, \
         tokens_in, tokens_out, cost_usd, latency_ms, created_at, project_id, agent_id, \
         command_id, turn_id";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let level: String = row.get(1)?;
        let created_at: String = row.get(10)?;
        Ok(Self {
            id: row.get(0)?,
            level: InferenceLevel::parse(&level).unwrap_or(InferenceLevel::Turn),
            input_hash: row.get(2)?,
            cached: row.get(3)?,
            input_text: row.get(4)?,
            output_text: row.get(5)?,
            tokens_in: row.get(6)?,
            tokens_out: row.get(7)?,
            cost_usd: row.get(8)?,
            latency_ms: row.get(9)?,
            created_at: parse_ts(&created_at).unwrap_or_else(Utc::now),
            project_id: row.get(11)?,
            agent_id: row.get(12)?,
            command_id: row.get(13)?,
            turn_id: row.get(14)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ObjectiveRecord {
    pub id: i64,
    pub text: String,
    pub priority_enabled: bool,
    pub is_current: bool,
    pub created_at: DateTime<Utc>,
}

impl ObjectiveRecord {
    pub const COLUMNS: &'static str = "id, text, priority_enabled, is_current, created_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let created_at: String = row.get(4)?;
        Ok(Self {
            id: row.get(0)?,
            text: row.get(1)?,
            priority_enabled: row.get(2)?,
            is_current: row.get(3)?,
            created_at: parse_ts(&created_at).unwrap_or_else(Utc::now),
        })
    }
}
