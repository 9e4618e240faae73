use chrono::{DateTime, Utc};
use crewdeck_types::{AgentId, CommandId, ObservedTurn, TurnId, TurnIntent};
use rusqlite::{Connection, OptionalExtension, params};

use crate::records::TurnRecord;
use crate::time::fmt_ts;
use crate::{Error, Result};

/// Outcome of a turn insert attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(TurnId),
    /// The partial unique index on `(command_id, jsonl_entry_hash)` already
    /// holds this entry; the write is a silent skip.
    Duplicate,
}

pub fn insert(
    conn: &Connection,
    command_id: CommandId,
    turn: &ObservedTurn,
    intent: TurnIntent,
) -> Result<InsertOutcome> {
    let tool_input = turn
        .tool_input
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    let result = conn.execute(
        r#"
        INSERT INTO turns (command_id, actor, intent, text, timestamp, timestamp_source,
                           jsonl_entry_hash, is_internal, tool_input)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
        params![
            command_id,
            turn.actor.as_str(),
            intent.as_str(),
            turn.text,
            fmt_ts(turn.timestamp),
            turn.timestamp_source.as_str(),
            turn.entry_hash,
            turn.is_internal,
            tool_input,
        ],
    );

    match result {
        Ok(_) => Ok(InsertOutcome::Inserted(conn.last_insert_rowid())),
        Err(err) => {
            let wrapped = Error::from(err);
            if wrapped.is_conflict() {
                Ok(InsertOutcome::Duplicate)
            } else {
                Err(wrapped)
            }
        }
    }
}

pub fn get(conn: &Connection, id: TurnId) -> Result<Option<TurnRecord>> {
    let sql = format!("SELECT {} FROM turns WHERE id = ?1", TurnRecord::COLUMNS);
    Ok(conn.query_row(&sql, [id], TurnRecord::from_row).optional()?)
}

pub fn list_for_command(conn: &Connection, command_id: CommandId) -> Result<Vec<TurnRecord>> {
    let sql = format!(
        "SELECT {} FROM turns WHERE command_id = ?1 ORDER BY timestamp, id",
        TurnRecord::COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([command_id], TurnRecord::from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Newest turn across all of an agent's commands.
pub fn latest_for_agent(conn: &Connection, agent_id: AgentId) -> Result<Option<TurnRecord>> {
    let sql = format!(
        "SELECT {} FROM turns t JOIN commands c ON t.command_id = c.id \
         WHERE c.agent_id = ?1 ORDER BY t.timestamp DESC, t.id DESC LIMIT 1",
        TurnRecord::COLUMNS
            .split(", ")
            .map(|c| format!("t.{c}"))
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(conn
        .query_row(&sql, [agent_id], TurnRecord::from_row)
        .optional()?)
}

/// First turn of a command by a given actor, for instruction extraction.
pub fn first_for_command_by_actor(
    conn: &Connection,
    command_id: CommandId,
    actor: crewdeck_types::TurnActor,
) -> Result<Option<TurnRecord>> {
    let sql = format!(
        "SELECT {} FROM turns WHERE command_id = ?1 AND actor = ?2 \
         ORDER BY timestamp, id LIMIT 1",
        TurnRecord::COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![command_id, actor.as_str()], TurnRecord::from_row)
        .optional()?)
}

/// Newest unanswered question in a command, for answer back-references.
pub fn open_question(conn: &Connection, command_id: CommandId) -> Result<Option<TurnRecord>> {
    let sql = format!(
        "SELECT {} FROM turns WHERE command_id = ?1 AND intent = 'question' \
         AND answered_by_turn_id IS NULL ORDER BY timestamp DESC, id DESC LIMIT 1",
        TurnRecord::COLUMNS
    );
    Ok(conn
        .query_row(&sql, [command_id], TurnRecord::from_row)
        .optional()?)
}

pub fn set_answered_by(conn: &Connection, question_id: TurnId, answer_id: TurnId) -> Result<()> {
    let changed = conn.execute(
        "UPDATE turns SET answered_by_turn_id = ?2 WHERE id = ?1",
        params![question_id, answer_id],
    )?;
    if changed == 0 {
        return Err(Error::Query(format!("No turn with id {question_id}")));
    }
    Ok(())
}

/// Turns are immutable once committed; the summary pair is the one sanctioned
/// exception.
pub fn set_summary(
    conn: &Connection,
    id: TurnId,
    summary: &str,
    generated_at: DateTime<Utc>,
) -> Result<()> {
    let changed = conn.execute(
        "UPDATE turns SET summary = ?2, summary_generated_at = ?3 WHERE id = ?1",
        params![id, summary, fmt_ts(generated_at)],
    )?;
    if changed == 0 {
        return Err(Error::Query(format!("No turn with id {id}")));
    }
    Ok(())
}

/// Turns with meaningful text and no summary yet, oldest first, capped.
pub fn pending_summaries(conn: &Connection, limit: i64) -> Result<Vec<TurnRecord>> {
    let sql = format!(
        "SELECT {} FROM turns WHERE summary IS NULL AND LENGTH(TRIM(text)) > 0 \
         AND is_internal = 0 ORDER BY id LIMIT ?1",
        TurnRecord::COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([limit], TurnRecord::from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}
