use chrono::{DateTime, Utc};
use crewdeck_types::{AgentId, CommandId, CommandState};
use rusqlite::{Connection, OptionalExtension, params};

use crate::records::CommandRecord;
use crate::time::fmt_ts;
use crate::{Error, Result};

pub fn insert(
    conn: &Connection,
    agent_id: AgentId,
    state: CommandState,
    started_at: DateTime<Utc>,
    full_command: Option<&str>,
) -> Result<CommandId> {
    conn.execute(
        r#"
        INSERT INTO commands (agent_id, state, started_at, full_command)
        VALUES (?1, ?2, ?3, ?4)
        "#,
        params![agent_id, state.as_str(), fmt_ts(started_at), full_command],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get(conn: &Connection, id: CommandId) -> Result<Option<CommandRecord>> {
    let sql = format!("SELECT {} FROM commands WHERE id = ?1", CommandRecord::COLUMNS);
    Ok(conn.query_row(&sql, [id], CommandRecord::from_row).optional()?)
}

/// The agent's live command: the newest one that has not completed.
pub fn current_for_agent(conn: &Connection, agent_id: AgentId) -> Result<Option<CommandRecord>> {
    let sql = format!(
        "SELECT {} FROM commands WHERE agent_id = ?1 AND state != 'complete' \
         ORDER BY started_at DESC, id DESC LIMIT 1",
        CommandRecord::COLUMNS
    );
    Ok(conn
        .query_row(&sql, [agent_id], CommandRecord::from_row)
        .optional()?)
}

/// The newest command regardless of state, for card projection.
pub fn latest_for_agent(conn: &Connection, agent_id: AgentId) -> Result<Option<CommandRecord>> {
    let sql = format!(
        "SELECT {} FROM commands WHERE agent_id = ?1 ORDER BY started_at DESC, id DESC LIMIT 1",
        CommandRecord::COLUMNS
    );
    Ok(conn
        .query_row(&sql, [agent_id], CommandRecord::from_row)
        .optional()?)
}

pub fn set_state(conn: &Connection, id: CommandId, state: CommandState) -> Result<()> {
    update_one(
        conn,
        "UPDATE commands SET state = ?2 WHERE id = ?1",
        params![id, state.as_str()],
        id,
    )
}

/// Completion writes the terminal state and the completion timestamp in one
/// statement. `completed_at` is clamped to `started_at` so the temporal
/// CHECK holds even when hook clocks disagree with turn clocks.
pub fn complete(
    conn: &Connection,
    id: CommandId,
    completed_at: DateTime<Utc>,
    full_output: Option<&str>,
) -> Result<()> {
    update_one(
        conn,
        "UPDATE commands SET state = 'complete', \
         completed_at = MAX(?2, started_at), \
         full_output = COALESCE(?3, full_output) \
         WHERE id = ?1",
        params![id, fmt_ts(completed_at), full_output],
        id,
    )
}

pub fn set_instruction(conn: &Connection, id: CommandId, instruction: &str) -> Result<()> {
    update_one(
        conn,
        "UPDATE commands SET instruction = ?2 WHERE id = ?1",
        params![id, instruction],
        id,
    )
}

pub fn set_completion_summary(conn: &Connection, id: CommandId, summary: &str) -> Result<()> {
    update_one(
        conn,
        "UPDATE commands SET completion_summary = ?2 WHERE id = ?1",
        params![id, summary],
        id,
    )
}

pub fn set_plan(
    conn: &Connection,
    id: CommandId,
    plan_file_path: Option<&str>,
    plan_content: Option<&str>,
    plan_approved_at: Option<DateTime<Utc>>,
) -> Result<()> {
    update_one(
        conn,
        "UPDATE commands SET plan_file_path = ?2, plan_content = ?3, plan_approved_at = ?4 \
         WHERE id = ?1",
        params![id, plan_file_path, plan_content, plan_approved_at.map(fmt_ts)],
        id,
    )
}

pub fn open_count_for_agent(conn: &Connection, agent_id: AgentId) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM commands WHERE agent_id = ?1 AND state != 'complete'",
        [agent_id],
        |row| row.get(0),
    )?)
}

pub fn turn_count(conn: &Connection, id: CommandId) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM turns WHERE command_id = ?1",
        [id],
        |row| row.get(0),
    )?)
}

/// Completed commands the summariser has not written up yet.
pub fn pending_completion_summaries(conn: &Connection, limit: i64) -> Result<Vec<CommandRecord>> {
    let sql = format!(
        "SELECT {} FROM commands WHERE state = 'complete' AND completion_summary IS NULL \
         ORDER BY completed_at LIMIT ?1",
        CommandRecord::COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([limit], CommandRecord::from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Commands stuck in `processing` whose newest turn is older than the
/// cutoff. Feeds the derived TIMED_OUT card state and the reaper.
pub fn stale_processing(
    conn: &Connection,
    cutoff: DateTime<Utc>,
) -> Result<Vec<CommandRecord>> {
    let sql = format!(
        "SELECT {} FROM commands c WHERE c.state = 'processing' AND NOT EXISTS ( \
             SELECT 1 FROM turns t WHERE t.command_id = c.id AND t.timestamp >= ?1)",
        CommandRecord::COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([fmt_ts(cutoff)], CommandRecord::from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn update_one(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
    id: CommandId,
) -> Result<()> {
    let changed = conn.execute(sql, params)?;
    if changed == 0 {
        return Err(Error::Query(format!("No command with id {id}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries::agent::tests::seed_agent;
    use crate::Database;

    #[test]
    fn current_picks_newest_live_command() {
        let db = Database::open_in_memory().unwrap();
        let agent_id = seed_agent(db.conn());
        let t0 = Utc::now();

        let first = insert(db.conn(), agent_id, CommandState::Processing, t0, Some("one")).unwrap();
        let second = insert(
            db.conn(),
            agent_id,
            CommandState::Commanded,
            t0 + chrono::Duration::seconds(5),
            Some("two"),
        )
        .unwrap();

        let current = current_for_agent(db.conn(), agent_id).unwrap().unwrap();
        assert_eq!(current.id, second);

        complete(db.conn(), second, Utc::now(), None).unwrap();
        let current = current_for_agent(db.conn(), agent_id).unwrap().unwrap();
        assert_eq!(current.id, first, "older live sibling becomes current again");
    }

    #[test]
    fn complete_clamps_completed_at_to_started_at() {
        let db = Database::open_in_memory().unwrap();
        let agent_id = seed_agent(db.conn());
        let started = Utc::now();
        let id = insert(db.conn(), agent_id, CommandState::Commanded, started, None).unwrap();

        complete(db.conn(), id, started - chrono::Duration::seconds(30), Some("done")).unwrap();
        let cmd = get(db.conn(), id).unwrap().unwrap();
        assert_eq!(cmd.state, CommandState::Complete);
        assert!(cmd.completed_at.unwrap() >= cmd.started_at);
        assert_eq!(cmd.full_output.as_deref(), Some("done"));
    }

    #[test]
    fn temporal_check_rejects_raw_backwards_completion() {
        let db = Database::open_in_memory().unwrap();
        let agent_id = seed_agent(db.conn());
        let started = Utc::now();
        let id = insert(db.conn(), agent_id, CommandState::Commanded, started, None).unwrap();

        let err = db
            .conn()
            .execute(
                "UPDATE commands SET completed_at = '2000-01-01T00:00:00.000000Z' WHERE id = ?1",
                [id],
            )
            .unwrap_err();
        assert!(matches!(err, rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation));
    }

    #[test]
    fn plan_fields_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let agent_id = seed_agent(db.conn());
        let id = insert(db.conn(), agent_id, CommandState::Processing, Utc::now(), None).unwrap();

        let approved = Utc::now();
        set_plan(
            db.conn(),
            id,
            Some("plans/login-fix.md"),
            Some("1. reproduce\n2. fix\n3. test"),
            Some(approved),
        )
        .unwrap();

        let cmd = get(db.conn(), id).unwrap().unwrap();
        assert_eq!(cmd.plan_file_path.as_deref(), Some("plans/login-fix.md"));
        assert!(cmd.plan_content.as_deref().unwrap().contains("reproduce"));
        assert!(cmd.plan_approved_at.is_some());
    }

    #[test]
    fn stale_processing_finds_only_quiet_commands() {
        let db = Database::open_in_memory().unwrap();
        let agent_id = seed_agent(db.conn());
        let now = Utc::now();
        let quiet = insert(db.conn(), agent_id, CommandState::Processing, now, None).unwrap();
        let busy = insert(db.conn(), agent_id, CommandState::Processing, now, None).unwrap();

        crate::queries::turn::tests::insert_bare_turn(db.conn(), busy, now);

        let stale = stale_processing(db.conn(), now - chrono::Duration::seconds(600)).unwrap();
        let ids: Vec<_> = stale.iter().map(|c| c.id).collect();
        assert!(ids.contains(&quiet));
        assert!(!ids.contains(&busy));
    }
}
