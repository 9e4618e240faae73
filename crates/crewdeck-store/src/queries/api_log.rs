use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};

use crate::time::fmt_ts;
use crate::Result;

/// Bodies are stored at most this large, with a sentinel marking the cut.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;
pub const TRUNCATION_SENTINEL: &str = "…[truncated]";

pub struct NewApiCallLog<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub status_code: u16,
    pub latency_ms: i64,
    pub authenticated: bool,
    pub request_headers: Option<&'a str>,
    pub request_body: Option<&'a str>,
    pub response_body: Option<&'a str>,
}

pub fn insert(conn: &Connection, log: &NewApiCallLog<'_>, at: DateTime<Utc>) -> Result<i64> {
    conn.execute(
        r#"
        INSERT INTO api_call_logs (method, path, status_code, latency_ms, authenticated,
                                   request_headers, request_body, response_body, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
        params![
            log.method,
            log.path,
            log.status_code,
            log.latency_ms,
            log.authenticated,
            log.request_headers,
            log.request_body.map(truncate_body),
            log.response_body.map(truncate_body),
            fmt_ts(at),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Clamp a body to the retention cap at a char boundary and append the
/// sentinel when anything was dropped.
pub fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_BODY_BYTES {
        return body.to_string();
    }
    let mut cut = MAX_BODY_BYTES;
    while !body.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut truncated = body[..cut].to_string();
    truncated.push_str(TRUNCATION_SENTINEL);
    truncated
}

pub fn recent(conn: &Connection, limit: i64) -> Result<Vec<(String, String, u16)>> {
    let mut stmt = conn.prepare(
        "SELECT method, path, status_code FROM api_call_logs ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map([limit], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    #[test]
    fn oversized_bodies_get_the_sentinel() {
        let body = "x".repeat(MAX_BODY_BYTES + 10);
        let stored = truncate_body(&body);
        assert!(stored.ends_with(TRUNCATION_SENTINEL));
        assert!(stored.len() <= MAX_BODY_BYTES + TRUNCATION_SENTINEL.len());

        let small = truncate_body("hello");
        assert_eq!(small, "hello");
    }

    #[test]
    fn insert_and_list() {
        let db = Database::open_in_memory().unwrap();
        insert(
            db.conn(),
            &NewApiCallLog {
                method: "POST",
                path: "/api/agents",
                status_code: 201,
                latency_ms: 12,
                authenticated: true,
                request_headers: Some("{\"authorization\":\"[redacted]\"}"),
                request_body: Some("{\"project_id\":1}"),
                response_body: None,
            },
            Utc::now(),
        )
        .unwrap();

        let rows = recent(db.conn(), 5).unwrap();
        assert_eq!(rows, vec![("POST".to_string(), "/api/agents".to_string(), 201)]);
    }
}
