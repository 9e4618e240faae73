use chrono::{DateTime, DurationRound, Utc};
use crewdeck_types::{AgentId, ProjectId};
use rusqlite::{Connection, params};

use crate::records::ActivityMetricRecord;
use crate::time::fmt_ts;
use crate::Result;

/// Scope of an activity bucket. Exactly one variant holds, mirroring the
/// table's CHECK constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricScope {
    Overall,
    Agent(AgentId),
    Project(ProjectId),
}

pub const BUCKET_MINUTES: i64 = 15;

pub fn bucket_start(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(chrono::Duration::minutes(BUCKET_MINUTES))
        .unwrap_or(at)
}

/// Add `count` turns to a bucket, creating it on first touch. The functional
/// unique index makes this safe under concurrent writers.
pub fn bump_turn_count(
    conn: &Connection,
    scope: MetricScope,
    at: DateTime<Utc>,
    count: i64,
) -> Result<()> {
    let (is_overall, agent_id, project_id) = match scope {
        MetricScope::Overall => (true, None, None),
        MetricScope::Agent(id) => (false, Some(id), None),
        MetricScope::Project(id) => (false, None, Some(id)),
    };
    conn.execute(
        r#"
        INSERT INTO activity_metrics (bucket_start, is_overall, agent_id, project_id, turn_count)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT (bucket_start, COALESCE(agent_id, -1), COALESCE(project_id, -1), is_overall)
        DO UPDATE SET turn_count = turn_count + ?5
        "#,
        params![fmt_ts(bucket_start(at)), is_overall, agent_id, project_id, count],
    )?;
    Ok(())
}

pub fn list_for_agent(conn: &Connection, agent_id: AgentId) -> Result<Vec<ActivityMetricRecord>> {
    let sql = format!(
        "SELECT {} FROM activity_metrics WHERE agent_id = ?1 ORDER BY bucket_start",
        ActivityMetricRecord::COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([agent_id], ActivityMetricRecord::from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn overall_total(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COALESCE(SUM(turn_count), 0) FROM activity_metrics WHERE is_overall = 1",
        [],
        |row| row.get(0),
    )?)
}

pub fn record_snapshot(
    conn: &Connection,
    agent_id: AgentId,
    captured_at: DateTime<Utc>,
    state: &str,
    context_percent_used: Option<i64>,
    open_command_count: i64,
) -> Result<i64> {
    conn.execute(
        r#"
        INSERT INTO agent_snapshots (agent_id, captured_at, state, context_percent_used, open_command_count)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
        params![agent_id, fmt_ts(captured_at), state, context_percent_used, open_command_count],
    )?;
    Ok(conn.last_insert_rowid())
}
