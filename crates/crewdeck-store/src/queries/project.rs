use chrono::{DateTime, Utc};
use crewdeck_types::ProjectId;
use rusqlite::{Connection, OptionalExtension, params};

use crate::records::ProjectRecord;
use crate::time::fmt_ts;
use crate::{Error, Result};

pub struct NewProject<'a> {
    pub slug: &'a str,
    pub name: &'a str,
    pub path: &'a str,
    pub git_origin: Option<&'a str>,
    pub git_branch: Option<&'a str>,
}

pub fn insert(conn: &Connection, project: &NewProject<'_>) -> Result<ProjectId> {
    conn.execute(
        r#"
        INSERT INTO projects (slug, name, path, git_origin, git_branch)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
        params![
            project.slug,
            project.name,
            project.path,
            project.git_origin,
            project.git_branch
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get(conn: &Connection, id: ProjectId) -> Result<Option<ProjectRecord>> {
    let sql = format!(
        "SELECT {} FROM projects WHERE id = ?1",
        ProjectRecord::COLUMNS
    );
    Ok(conn
        .query_row(&sql, [id], ProjectRecord::from_row)
        .optional()?)
}

pub fn get_by_slug(conn: &Connection, slug: &str) -> Result<Option<ProjectRecord>> {
    let sql = format!(
        "SELECT {} FROM projects WHERE slug = ?1",
        ProjectRecord::COLUMNS
    );
    Ok(conn
        .query_row(&sql, [slug], ProjectRecord::from_row)
        .optional()?)
}

pub fn get_by_path(conn: &Connection, path: &str) -> Result<Option<ProjectRecord>> {
    let sql = format!(
        "SELECT {} FROM projects WHERE path = ?1",
        ProjectRecord::COLUMNS
    );
    Ok(conn
        .query_row(&sql, [path], ProjectRecord::from_row)
        .optional()?)
}

pub fn list(conn: &Connection) -> Result<Vec<ProjectRecord>> {
    let sql = format!("SELECT {} FROM projects ORDER BY slug", ProjectRecord::COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], ProjectRecord::from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn set_inference_paused(
    conn: &Connection,
    id: ProjectId,
    paused: bool,
    reason: Option<&str>,
    at: DateTime<Utc>,
) -> Result<()> {
    let changed = conn.execute(
        r#"
        UPDATE projects
        SET inference_paused = ?2,
            inference_paused_reason = ?3,
            inference_paused_at = ?4
        WHERE id = ?1
        "#,
        params![
            id,
            paused,
            if paused { reason } else { None },
            if paused { Some(fmt_ts(at)) } else { None }
        ],
    )?;
    if changed == 0 {
        return Err(Error::Query(format!("No project with id {id}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn seed(conn: &Connection) -> ProjectId {
        insert(
            conn,
            &NewProject {
                slug: "atlas",
                name: "Atlas",
                path: "/home/dev/atlas",
                git_origin: Some("git@example.com:dev/atlas.git"),
                git_branch: Some("main"),
            },
        )
        .unwrap()
    }

    #[test]
    fn insert_and_fetch_by_slug_and_path() {
        let db = Database::open_in_memory().unwrap();
        let id = seed(db.conn());

        let by_slug = get_by_slug(db.conn(), "atlas").unwrap().unwrap();
        assert_eq!(by_slug.id, id);
        assert_eq!(by_slug.path, "/home/dev/atlas");
        assert!(!by_slug.inference_paused);

        let by_path = get_by_path(db.conn(), "/home/dev/atlas").unwrap().unwrap();
        assert_eq!(by_path.slug, "atlas");
    }

    #[test]
    fn duplicate_slug_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        seed(db.conn());
        let err = insert(
            db.conn(),
            &NewProject {
                slug: "atlas",
                name: "Other",
                path: "/elsewhere",
                git_origin: None,
                git_branch: None,
            },
        )
        .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn pause_and_resume_inference() {
        let db = Database::open_in_memory().unwrap();
        let id = seed(db.conn());
        let now = Utc::now();

        set_inference_paused(db.conn(), id, true, Some("cost cap"), now).unwrap();
        let paused = get(db.conn(), id).unwrap().unwrap();
        assert!(paused.inference_paused);
        assert_eq!(paused.inference_paused_reason.as_deref(), Some("cost cap"));
        assert!(paused.inference_paused_at.is_some());

        set_inference_paused(db.conn(), id, false, None, now).unwrap();
        let resumed = get(db.conn(), id).unwrap().unwrap();
        assert!(!resumed.inference_paused);
        assert!(resumed.inference_paused_reason.is_none());
        assert!(resumed.inference_paused_at.is_none());
    }
}
