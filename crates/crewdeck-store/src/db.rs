use std::path::{Path, PathBuf};

use rusqlite::Connection;

use crate::schema;
use crate::{Error, Result};

/// One open connection to the store.
///
/// Connections are cheap to open and short-lived by convention; anything
/// that needs cross-connection coordination goes through the advisory lock
/// manager, not connection sharing.
pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(|e| {
            Error::Query(format!("Failed to open database {}: {}", db_path.display(), e))
        })?;
        configure(&conn)?;

        let db = Self { conn };
        schema::init_schema(db.conn())?;
        Ok(db)
    }

    /// Private in-memory store for unit tests. Each call gets its own
    /// database; use `Storage` with a temp file when two connections must
    /// see the same data.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let db = Self { conn };
        schema::init_schema(db.conn())?;
        Ok(db)
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn into_conn(self) -> Connection {
        self.conn
    }
}

fn configure(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(())
}

/// Cloneable handle on the store location. Every component that needs a
/// connection asks this for one instead of sharing `Connection`s across
/// threads.
#[derive(Debug, Clone)]
pub struct Storage {
    db_path: PathBuf,
}

impl Storage {
    /// Open (creating if necessary) the store at `db_path` and verify the
    /// schema once up front.
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        Database::open(&db_path)?;
        Ok(Self { db_path })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn connect(&self) -> Result<Database> {
        Database::open(&self.db_path)
    }
}
