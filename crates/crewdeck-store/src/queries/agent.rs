use chrono::{DateTime, Utc};
use crewdeck_types::{AgentId, ProjectId};
use rusqlite::{Connection, OptionalExtension, params};

use crate::records::AgentRecord;
use crate::time::fmt_ts;
use crate::{Error, Result};

pub struct NewAgent<'a> {
    pub session_uuid: &'a str,
    pub project_id: ProjectId,
    pub persona_id: Option<i64>,
    pub position_id: Option<i64>,
    pub previous_agent_id: Option<AgentId>,
    pub tmux_session_name: Option<&'a str>,
    pub tmux_pane_id: Option<&'a str>,
    pub started_at: DateTime<Utc>,
}

pub fn insert(conn: &Connection, agent: &NewAgent<'_>) -> Result<AgentId> {
    conn.execute(
        r#"
        INSERT INTO agents (session_uuid, project_id, persona_id, position_id,
                            previous_agent_id, tmux_session_name, tmux_pane_id,
                            started_at, last_seen_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
        "#,
        params![
            agent.session_uuid,
            agent.project_id,
            agent.persona_id,
            agent.position_id,
            agent.previous_agent_id,
            agent.tmux_session_name,
            agent.tmux_pane_id,
            fmt_ts(agent.started_at),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get(conn: &Connection, id: AgentId) -> Result<Option<AgentRecord>> {
    let sql = format!("SELECT {} FROM agents WHERE id = ?1", AgentRecord::COLUMNS);
    Ok(conn.query_row(&sql, [id], AgentRecord::from_row).optional()?)
}

pub fn get_by_session_uuid(conn: &Connection, session_uuid: &str) -> Result<Option<AgentRecord>> {
    let sql = format!(
        "SELECT {} FROM agents WHERE session_uuid = ?1",
        AgentRecord::COLUMNS
    );
    Ok(conn
        .query_row(&sql, [session_uuid], AgentRecord::from_row)
        .optional()?)
}

/// Agents that have not ended, newest first.
pub fn list_live(conn: &Connection) -> Result<Vec<AgentRecord>> {
    let sql = format!(
        "SELECT {} FROM agents WHERE ended_at IS NULL ORDER BY started_at DESC",
        AgentRecord::COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], AgentRecord::from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn list_live_for_project(conn: &Connection, project_id: ProjectId) -> Result<Vec<AgentRecord>> {
    let sql = format!(
        "SELECT {} FROM agents WHERE ended_at IS NULL AND project_id = ?1 \
         ORDER BY started_at DESC",
        AgentRecord::COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([project_id], AgentRecord::from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn touch_last_seen(conn: &Connection, id: AgentId, at: DateTime<Utc>) -> Result<()> {
    update_one(
        conn,
        "UPDATE agents SET last_seen_at = ?2 WHERE id = ?1",
        params![id, fmt_ts(at)],
        id,
    )
}

pub fn mark_ended(conn: &Connection, id: AgentId, at: DateTime<Utc>) -> Result<()> {
    update_one(
        conn,
        "UPDATE agents SET ended_at = ?2 WHERE id = ?1 AND ended_at IS NULL",
        params![id, fmt_ts(at)],
        id,
    )
}

pub fn set_pane(conn: &Connection, id: AgentId, pane_id: Option<&str>) -> Result<()> {
    update_one(
        conn,
        "UPDATE agents SET tmux_pane_id = ?2 WHERE id = ?1",
        params![id, pane_id],
        id,
    )
}

pub fn set_prompt_injected(conn: &Connection, id: AgentId, at: DateTime<Utc>) -> Result<()> {
    update_one(
        conn,
        "UPDATE agents SET prompt_injected_at = ?2 WHERE id = ?1",
        params![id, fmt_ts(at)],
        id,
    )
}

pub fn set_guardrails_hash(conn: &Connection, id: AgentId, hash: &str) -> Result<()> {
    update_one(
        conn,
        "UPDATE agents SET guardrails_version_hash = ?2 WHERE id = ?1",
        params![id, hash],
        id,
    )
}

/// Write the priority triplet atomically. The CHECK constraint enforces
/// all-or-nothing, so reason and timestamp always accompany the score.
pub fn set_priority(
    conn: &Connection,
    id: AgentId,
    score: i64,
    reason: &str,
    at: DateTime<Utc>,
) -> Result<()> {
    update_one(
        conn,
        "UPDATE agents SET priority_score = ?2, priority_reason = ?3, priority_updated_at = ?4 \
         WHERE id = ?1",
        params![id, score, reason, fmt_ts(at)],
        id,
    )
}

pub fn clear_priority(conn: &Connection, id: AgentId) -> Result<()> {
    update_one(
        conn,
        "UPDATE agents SET priority_score = NULL, priority_reason = NULL, \
         priority_updated_at = NULL WHERE id = ?1",
        params![id],
        id,
    )
}

pub fn set_context_usage(
    conn: &Connection,
    id: AgentId,
    percent_used: i64,
    remaining_tokens: &str,
    at: DateTime<Utc>,
) -> Result<()> {
    update_one(
        conn,
        "UPDATE agents SET context_percent_used = ?2, context_remaining_tokens = ?3, \
         context_updated_at = ?4 WHERE id = ?1",
        params![id, percent_used, remaining_tokens, fmt_ts(at)],
        id,
    )
}

/// Agents spawned by the lifecycle controller carry a placeholder session
/// uuid until the first hook announces the real host session id.
pub fn find_unbound_for_project(
    conn: &Connection,
    project_id: ProjectId,
) -> Result<Option<AgentRecord>> {
    let sql = format!(
        "SELECT {} FROM agents WHERE ended_at IS NULL AND project_id = ?1 \
         AND session_uuid LIKE 'pending-%' ORDER BY started_at DESC LIMIT 1",
        AgentRecord::COLUMNS
    );
    Ok(conn
        .query_row(&sql, [project_id], AgentRecord::from_row)
        .optional()?)
}

pub fn bind_session_uuid(conn: &Connection, id: AgentId, session_uuid: &str) -> Result<()> {
    update_one(
        conn,
        "UPDATE agents SET session_uuid = ?2 WHERE id = ?1",
        params![id, session_uuid],
        id,
    )
}

pub fn record_handoff(
    conn: &Connection,
    agent_id: AgentId,
    reason: Option<&str>,
    at: DateTime<Utc>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO handoffs (agent_id, reason, created_at) VALUES (?1, ?2, ?3)",
        params![agent_id, reason, fmt_ts(at)],
    )?;
    Ok(conn.last_insert_rowid())
}

/// A successor referencing an agent without a handoff row is a revival.
pub fn has_handoff(conn: &Connection, agent_id: AgentId) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM handoffs WHERE agent_id = ?1",
        [agent_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn update_one(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
    id: AgentId,
) -> Result<()> {
    let changed = conn.execute(sql, params)?;
    if changed == 0 {
        return Err(Error::Query(format!("No agent with id {id}")));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::queries::project::{self, NewProject};
    use crate::Database;

    pub(crate) fn seed_agent(conn: &Connection) -> AgentId {
        let project_id = project::insert(
            conn,
            &NewProject {
                slug: "atlas",
                name: "Atlas",
                path: "/home/dev/atlas",
                git_origin: None,
                git_branch: None,
            },
        )
        .unwrap();
        insert(
            conn,
            &NewAgent {
                session_uuid: "4f1d3c1e-0000-0000-0000-000000000001",
                project_id,
                persona_id: None,
                position_id: None,
                previous_agent_id: None,
                tmux_session_name: Some("hs-atlas-a1b2"),
                tmux_pane_id: Some("%5"),
                started_at: Utc::now(),
            },
        )
        .unwrap()
    }

    #[test]
    fn insert_and_lookup_by_session_uuid() {
        let db = Database::open_in_memory().unwrap();
        let id = seed_agent(db.conn());

        let agent = get_by_session_uuid(db.conn(), "4f1d3c1e-0000-0000-0000-000000000001")
            .unwrap()
            .unwrap();
        assert_eq!(agent.id, id);
        assert!(!agent.is_ended());
        assert_eq!(agent.tmux_pane_id.as_deref(), Some("%5"));
    }

    #[test]
    fn priority_triplet_is_all_or_nothing() {
        let db = Database::open_in_memory().unwrap();
        let id = seed_agent(db.conn());

        // Partial triplet violates the CHECK constraint.
        let err = db
            .conn()
            .execute(
                "UPDATE agents SET priority_score = 80 WHERE id = ?1",
                [id],
            )
            .unwrap_err();
        assert!(matches!(err, rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation));

        set_priority(db.conn(), id, 80, "aligned with objective", Utc::now()).unwrap();
        let agent = get(db.conn(), id).unwrap().unwrap();
        assert_eq!(agent.priority_score, Some(80));
        assert!(agent.priority_reason.is_some());
        assert!(agent.priority_updated_at.is_some());

        clear_priority(db.conn(), id).unwrap();
        let agent = get(db.conn(), id).unwrap().unwrap();
        assert_eq!(agent.priority_score, None);
        assert_eq!(agent.priority_reason, None);
        assert_eq!(agent.priority_updated_at, None);
    }

    #[test]
    fn mark_ended_is_idempotent_guarded() {
        let db = Database::open_in_memory().unwrap();
        let id = seed_agent(db.conn());
        mark_ended(db.conn(), id, Utc::now()).unwrap();
        // A second end is a no-op that reports the missing live row.
        assert!(mark_ended(db.conn(), id, Utc::now()).is_err());
        assert!(list_live(db.conn()).unwrap().is_empty());
    }

    #[test]
    fn handoff_presence_distinguishes_revival() {
        let db = Database::open_in_memory().unwrap();
        let id = seed_agent(db.conn());
        assert!(!has_handoff(db.conn(), id).unwrap());
        record_handoff(db.conn(), id, Some("context window exhausted"), Utc::now()).unwrap();
        assert!(has_handoff(db.conn(), id).unwrap());
    }
}
