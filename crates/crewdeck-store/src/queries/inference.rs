use chrono::{DateTime, Utc};
use crewdeck_types::InferenceLevel;
use rusqlite::{Connection, OptionalExtension, params};

use crate::queries::event::EventRefs;
use crate::records::InferenceCallRecord;
use crate::time::fmt_ts;
use crate::Result;

pub struct NewInferenceCall<'a> {
    pub level: InferenceLevel,
    pub input_hash: &'a str,
    pub cached: bool,
    pub input_text: Option<&'a str>,
    pub output_text: Option<&'a str>,
    pub tokens_in: Option<i64>,
    pub tokens_out: Option<i64>,
    pub cost_usd: Option<f64>,
    pub latency_ms: Option<i64>,
    pub refs: EventRefs,
}

pub fn insert(conn: &Connection, call: &NewInferenceCall<'_>, at: DateTime<Utc>) -> Result<i64> {
    conn.execute(
        r#"
        INSERT INTO inference_calls (level, input_hash, cached, input_text, output_text,
                                     tokens_in, tokens_out, cost_usd, latency_ms, created_at,
                                     project_id, agent_id, command_id, turn_id)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
        "#,
        params![
            call.level.as_str(),
            call.input_hash,
            call.cached,
            call.input_text,
            call.output_text,
            call.tokens_in,
            call.tokens_out,
            call.cost_usd,
            call.latency_ms,
            fmt_ts(at),
            call.refs.project_id,
            call.refs.agent_id,
            call.refs.command_id,
            call.refs.turn_id,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Newest non-cached output for an input hash: the idempotent-cache lookup.
pub fn cached_output(conn: &Connection, input_hash: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT output_text FROM inference_calls \
             WHERE input_hash = ?1 AND output_text IS NOT NULL \
             ORDER BY id DESC LIMIT 1",
            [input_hash],
            |row| row.get(0),
        )
        .optional()?)
}

pub fn get(conn: &Connection, id: i64) -> Result<Option<InferenceCallRecord>> {
    let sql = format!(
        "SELECT {} FROM inference_calls WHERE id = ?1",
        InferenceCallRecord::COLUMNS
    );
    Ok(conn
        .query_row(&sql, [id], InferenceCallRecord::from_row)
        .optional()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries::agent::tests::seed_agent;
    use crate::Database;

    #[test]
    fn parentless_call_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        let call = NewInferenceCall {
            level: InferenceLevel::Turn,
            input_hash: "deadbeef",
            cached: false,
            input_text: None,
            output_text: Some("summary"),
            tokens_in: None,
            tokens_out: None,
            cost_usd: None,
            latency_ms: None,
            refs: EventRefs::default(),
        };
        let err = insert(db.conn(), &call, Utc::now()).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn cache_lookup_returns_latest_output() {
        let db = Database::open_in_memory().unwrap();
        let agent_id = seed_agent(db.conn());

        assert!(cached_output(db.conn(), "h1").unwrap().is_none());

        let call = NewInferenceCall {
            level: InferenceLevel::Turn,
            input_hash: "h1",
            cached: false,
            input_text: Some("summarise: hello"),
            output_text: Some("A greeting."),
            tokens_in: Some(12),
            tokens_out: Some(4),
            cost_usd: Some(0.0001),
            latency_ms: Some(420),
            refs: EventRefs::agent(agent_id),
        };
        insert(db.conn(), &call, Utc::now()).unwrap();

        assert_eq!(cached_output(db.conn(), "h1").unwrap().as_deref(), Some("A greeting."));
    }
}
