use chrono::{DateTime, Utc};
use crewdeck_types::PersonaStatus;
use rusqlite::{Connection, OptionalExtension, params};

use crate::records::{PersonaRecord, PositionRecord};
use crate::time::fmt_ts;
use crate::{Error, Result};

pub fn insert_organisation(conn: &Connection, name: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO organisations (name) VALUES (?1) ON CONFLICT (name) DO NOTHING",
        [name],
    )?;
    let id: i64 = conn.query_row(
        "SELECT id FROM organisations WHERE name = ?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(id)
}

/// Find or create a role by name under an organisation.
pub fn ensure_role(conn: &Connection, organisation_id: Option<i64>, name: &str) -> Result<i64> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM roles WHERE name = ?1 AND organisation_id IS ?2",
            params![name, organisation_id],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }
    conn.execute(
        "INSERT INTO roles (organisation_id, name) VALUES (?1, ?2)",
        params![organisation_id, name],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn insert_persona(
    conn: &Connection,
    role_id: i64,
    slug: &str,
    name: &str,
    description: Option<&str>,
    created_at: DateTime<Utc>,
) -> Result<i64> {
    conn.execute(
        r#"
        INSERT INTO personas (role_id, slug, name, description, status, created_at)
        VALUES (?1, ?2, ?3, ?4, 'active', ?5)
        "#,
        params![role_id, slug, name, description, fmt_ts(created_at)],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_by_slug(conn: &Connection, slug: &str) -> Result<Option<PersonaRecord>> {
    let sql = format!(
        "SELECT {} FROM personas WHERE slug = ?1",
        PersonaRecord::COLUMNS
    );
    Ok(conn
        .query_row(&sql, [slug], PersonaRecord::from_row)
        .optional()?)
}

/// Active personas sorted by `(role name, persona name)` for listing.
pub fn list_active(conn: &Connection) -> Result<Vec<(PersonaRecord, String)>> {
    let sql = format!(
        "SELECT {}, r.name FROM personas p JOIN roles r ON p.role_id = r.id \
         WHERE p.status = 'active' ORDER BY r.name, p.name",
        PersonaRecord::COLUMNS
            .split(", ")
            .map(|c| format!("p.{c}"))
            .collect::<Vec<_>>()
            .join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |row| {
        let persona = PersonaRecord::from_row(row)?;
        let role_name: String = row.get(7)?;
        Ok((persona, role_name))
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Personas are archived, never deleted.
pub fn archive(conn: &Connection, slug: &str) -> Result<()> {
    let changed = conn.execute(
        "UPDATE personas SET status = 'archived' WHERE slug = ?1",
        [slug],
    )?;
    if changed == 0 {
        return Err(Error::Query(format!("No persona with slug {slug}")));
    }
    Ok(())
}

pub fn is_active(record: &PersonaRecord) -> bool {
    record.status == PersonaStatus::Active
}

pub fn insert_position(
    conn: &Connection,
    role_id: Option<i64>,
    title: &str,
    reports_to_id: Option<i64>,
    escalates_to_id: Option<i64>,
) -> Result<i64> {
    conn.execute(
        r#"
        INSERT INTO positions (role_id, title, reports_to_id, escalates_to_id)
        VALUES (?1, ?2, ?3, ?4)
        "#,
        params![role_id, title, reports_to_id, escalates_to_id],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_position(conn: &Connection, id: i64) -> Result<Option<PositionRecord>> {
    let sql = format!(
        "SELECT {} FROM positions WHERE id = ?1",
        PositionRecord::COLUMNS
    );
    Ok(conn
        .query_row(&sql, [id], PositionRecord::from_row)
        .optional()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    #[test]
    fn persona_lifecycle_register_then_archive() {
        let db = Database::open_in_memory().unwrap();
        let role = ensure_role(db.conn(), None, "reviewer").unwrap();
        insert_persona(db.conn(), role, "picky-reviewer", "Picky Reviewer", None, Utc::now())
            .unwrap();

        let persona = get_by_slug(db.conn(), "picky-reviewer").unwrap().unwrap();
        assert!(is_active(&persona));

        archive(db.conn(), "picky-reviewer").unwrap();
        let archived = get_by_slug(db.conn(), "picky-reviewer").unwrap().unwrap();
        assert_eq!(archived.status, PersonaStatus::Archived);
    }

    #[test]
    fn list_active_sorts_by_role_then_name() {
        let db = Database::open_in_memory().unwrap();
        let ops = ensure_role(db.conn(), None, "ops").unwrap();
        let dev = ensure_role(db.conn(), None, "dev").unwrap();
        let now = Utc::now();
        insert_persona(db.conn(), ops, "zed", "Zed", None, now).unwrap();
        insert_persona(db.conn(), dev, "beta", "Beta", None, now).unwrap();
        insert_persona(db.conn(), dev, "alpha", "Alpha", None, now).unwrap();
        insert_persona(db.conn(), dev, "gone", "Gone", None, now).unwrap();
        archive(db.conn(), "gone").unwrap();

        let listed = list_active(db.conn()).unwrap();
        let slugs: Vec<_> = listed.iter().map(|(p, _)| p.slug.as_str()).collect();
        assert_eq!(slugs, ["alpha", "beta", "zed"]);
    }

    #[test]
    fn ensure_role_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let a = ensure_role(db.conn(), None, "dev").unwrap();
        let b = ensure_role(db.conn(), None, "dev").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn deleting_reported_to_position_nulls_the_reference() {
        let db = Database::open_in_memory().unwrap();
        let lead = insert_position(db.conn(), None, "Lead", None, None).unwrap();
        let ic = insert_position(db.conn(), None, "IC", Some(lead), Some(lead)).unwrap();

        db.conn()
            .execute("DELETE FROM positions WHERE id = ?1", [lead])
            .unwrap();

        let orphan = get_position(db.conn(), ic).unwrap().unwrap();
        assert_eq!(orphan.reports_to_id, None);
        assert_eq!(orphan.escalates_to_id, None);
    }
}
