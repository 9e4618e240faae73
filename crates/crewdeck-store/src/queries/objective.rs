use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::records::ObjectiveRecord;
use crate::time::fmt_ts;
use crate::Result;

/// Setting an objective demotes any previous current one.
pub fn set_current(
    conn: &Connection,
    text: &str,
    priority_enabled: bool,
    at: DateTime<Utc>,
) -> Result<i64> {
    conn.execute("UPDATE objectives SET is_current = 0 WHERE is_current = 1", [])?;
    conn.execute(
        r#"
        INSERT INTO objectives (text, priority_enabled, is_current, created_at)
        VALUES (?1, ?2, 1, ?3)
        "#,
        params![text, priority_enabled, fmt_ts(at)],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn current(conn: &Connection) -> Result<Option<ObjectiveRecord>> {
    let sql = format!(
        "SELECT {} FROM objectives WHERE is_current = 1 ORDER BY id DESC LIMIT 1",
        ObjectiveRecord::COLUMNS
    );
    Ok(conn.query_row(&sql, [], ObjectiveRecord::from_row).optional()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    #[test]
    fn only_one_objective_is_current() {
        let db = Database::open_in_memory().unwrap();
        set_current(db.conn(), "Ship auth", true, Utc::now()).unwrap();
        set_current(db.conn(), "Fix the pipeline", false, Utc::now()).unwrap();

        let current = current(db.conn()).unwrap().unwrap();
        assert_eq!(current.text, "Fix the pipeline");
        assert!(!current.priority_enabled);

        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM objectives WHERE is_current = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
