use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use rusqlite::{params, Connection, OpenFlags};
use thiserror::Error;

use crate::protocol::Subject;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open database {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("no fruit fact with id {0}")]
    MissingRow(i64),
}

impl StoreError {
    /// Short kind used in `db_update_error:<kind>` tags.
    pub fn kind(&self) -> String {
        match self {
            Self::Open { source, .. } | Self::Sqlite(source) => sqlite_error_kind(source),
            Self::MissingRow(_) => "MissingRow".to_string(),
        }
    }
}

fn sqlite_error_kind(error: &rusqlite::Error) -> String {
    match error {
        rusqlite::Error::SqliteFailure(failure, _) => format!("{:?}", failure.code),
        other => format!("{other:?}")
            .split(['(', '{', ' '])
            .next()
            .unwrap_or("Sqlite")
            .to_string(),
    }
}

/// Write side of the fact store used after a successful download.
pub trait FactStore {
    /// Points one fact row at its image. Rewriting the same path is a no-op.
    fn set_fruit_image(&self, fact_id: i64, relative_path: &str) -> Result<(), StoreError>;
}

/// SQLite access to `countries` and `fruit_facts`. Every operation opens and
/// closes its own connection so committed updates survive an aborted run.
pub struct DbManager {
    db_path: PathBuf,
}

impl DbManager {
    /// Fails when the database is missing or unreadable.
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let db_manager = Self {
            db_path: db_path.into(),
        };
        let conn = db_manager.connect()?;
        db_manager.migrate(&conn)?;
        Ok(db_manager)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|source| StoreError::Open {
            path: self.db_path.clone(),
            source,
        })?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    fn migrate(&self, conn: &Connection) -> Result<(), StoreError> {
        // Older databases predate the image column.
        let mut stmt = conn.prepare("PRAGMA table_info(fruit_facts)")?;
        let columns = stmt.query_map([], |row| row.get::<_, String>(1))?;
        let mut has_fruit_image = false;
        for col in columns {
            if col? == "fruit_image" {
                has_fruit_image = true;
                break;
            }
        }

        if !has_fruit_image {
            info!("Adding fruit_facts.fruit_image column");
            conn.execute("ALTER TABLE fruit_facts ADD COLUMN fruit_image TEXT", [])?;
        }
        Ok(())
    }

    /// Fact rows joined to their country, ordered by country name.
    pub fn list_subjects(&self, limit: Option<u32>) -> Result<Vec<Subject>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT ff.id, c.id, c.slug, c.name, ff.fruit
             FROM fruit_facts ff
             JOIN countries c ON c.id = ff.country_id
             ORDER BY c.name ASC, ff.id ASC
             LIMIT ?1",
        )?;
        let limit = limit.map(i64::from).unwrap_or(-1);
        let subject_iter = stmt.query_map(params![limit], |row| {
            Ok(Subject {
                fact_id: row.get(0)?,
                country_id: row.get(1)?,
                country_slug: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                country_name: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                fruit_name: row
                    .get::<_, Option<String>>(4)?
                    .unwrap_or_default()
                    .trim()
                    .to_string(),
            })
        })?;

        let mut subjects = Vec::new();
        for subject in subject_iter {
            subjects.push(subject?);
        }
        debug!("Loaded {} subjects from {}", subjects.len(), self.db_path.display());
        Ok(subjects)
    }

    #[cfg(test)]
    pub fn fruit_image(&self, fact_id: i64) -> Result<Option<String>, StoreError> {
        let conn = self.connect()?;
        let value = conn.query_row(
            "SELECT fruit_image FROM fruit_facts WHERE id = ?1",
            params![fact_id],
            |row| row.get::<_, Option<String>>(0),
        )?;
        Ok(value)
    }
}

impl FactStore for DbManager {
    fn set_fruit_image(&self, fact_id: i64, relative_path: &str) -> Result<(), StoreError> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE fruit_facts SET fruit_image = ?1 WHERE id = ?2",
            params![relative_path, fact_id],
        )?;
        if changed == 0 {
            return Err(StoreError::MissingRow(fact_id));
        }
        Ok(())
    }
}
