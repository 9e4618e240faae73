use chrono::{DateTime, Utc};
use crewdeck_types::{AgentId, CommandId, EventId, ProjectId, TurnId};
use rusqlite::{Connection, OptionalExtension, params};

use crate::records::EventRecord;
use crate::time::fmt_ts;
use crate::Result;

/// Optional foreign keys attached to an event row.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventRefs {
    pub project_id: Option<ProjectId>,
    pub agent_id: Option<AgentId>,
    pub command_id: Option<CommandId>,
    pub turn_id: Option<TurnId>,
}

impl EventRefs {
    pub fn agent(agent_id: AgentId) -> Self {
        Self {
            agent_id: Some(agent_id),
            ..Default::default()
        }
    }
}

pub fn insert(
    conn: &Connection,
    event_type: &str,
    payload: &serde_json::Value,
    created_at: DateTime<Utc>,
    refs: EventRefs,
) -> Result<EventId> {
    conn.execute(
        r#"
        INSERT INTO events (event_type, payload, created_at, project_id, agent_id, command_id, turn_id)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        params![
            event_type,
            serde_json::to_string(payload)?,
            fmt_ts(created_at),
            refs.project_id,
            refs.agent_id,
            refs.command_id,
            refs.turn_id,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn list_for_agent(conn: &Connection, agent_id: AgentId, limit: i64) -> Result<Vec<EventRecord>> {
    let sql = format!(
        "SELECT {} FROM events WHERE agent_id = ?1 ORDER BY id DESC LIMIT ?2",
        EventRecord::COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![agent_id, limit], EventRecord::from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Newest hook audit event, if any. The standalone watcher reads this to
/// decide whether hooks are carrying the load (slow tail cadence) or the
/// tail is the only source (fast cadence).
pub fn latest_hook_event_at(conn: &Connection) -> Result<Option<DateTime<Utc>>> {
    let latest: Option<String> = conn
        .query_row(
            "SELECT created_at FROM events WHERE event_type LIKE 'hook_%' \
             ORDER BY id DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(latest.as_deref().and_then(crate::time::parse_ts))
}

pub fn list_by_type(conn: &Connection, event_type: &str, limit: i64) -> Result<Vec<EventRecord>> {
    let sql = format!(
        "SELECT {} FROM events WHERE event_type = ?1 ORDER BY id DESC LIMIT ?2",
        EventRecord::COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![event_type, limit], EventRecord::from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries::agent::tests::seed_agent;
    use crate::Database;

    #[test]
    fn events_are_append_only_and_queryable_by_type() {
        let db = Database::open_in_memory().unwrap();
        let agent_id = seed_agent(db.conn());
        let now = Utc::now();

        insert(
            db.conn(),
            "session_registered",
            &serde_json::json!({"session_uuid": "S1"}),
            now,
            EventRefs::agent(agent_id),
        )
        .unwrap();
        insert(
            db.conn(),
            "state_transition",
            &serde_json::json!({"from_state": "commanded", "to_state": "processing", "trigger": "agent_progress"}),
            now,
            EventRefs::agent(agent_id),
        )
        .unwrap();

        let transitions = list_by_type(db.conn(), "state_transition", 10).unwrap();
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].payload["to_state"], "processing");

        let for_agent = list_for_agent(db.conn(), agent_id, 10).unwrap();
        assert_eq!(for_agent.len(), 2);
    }
}
