//! SQLite persistence for itinerary documents: one versioned row per itinerary.

use std::path::Path;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tokio::sync::Mutex;
use waypoint_schema::Itinerary;

use crate::error::{Result, RevisionError};

/// Result of a compare-and-swap write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    Success,
    NotFound,
    VersionConflict { actual: u64 },
}

impl CasResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItinerarySummary {
    pub id: String,
    pub title: String,
    pub version: u64,
}

pub struct ItineraryStore {
    conn: Arc<Mutex<Connection>>,
}

impl ItineraryStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn insert(&self, doc: &Itinerary) -> Result<()> {
        let conn = self.conn.lock().await;
        let record = serde_json::to_string(doc)?;
        let inserted = conn.execute(
            r#"INSERT OR IGNORE INTO itineraries (id, version, title, updated_at_ms, record)
               VALUES (?1, ?2, ?3, ?4, ?5)"#,
            params![
                doc.id,
                doc.version as i64,
                doc.title,
                doc.updated_at.timestamp_millis(),
                record,
            ],
        )?;
        if inserted == 0 {
            return Err(RevisionError::AlreadyExists(doc.id.clone()));
        }
        Ok(())
    }

    pub async fn load(&self, id: &str) -> Result<Option<Itinerary>> {
        let conn = self.conn.lock().await;
        let record: Option<String> = conn
            .query_row(
                "SELECT record FROM itineraries WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()?;
        record
            .map(|r| serde_json::from_str(&r).map_err(RevisionError::from))
            .transpose()
    }

    /// Persist `doc` only if the stored row is still at `expected_version`.
    pub async fn compare_and_swap(&self, doc: &Itinerary, expected_version: u64) -> Result<CasResult> {
        let conn = self.conn.lock().await;
        let record = serde_json::to_string(doc)?;
        let updated = conn.execute(
            r#"UPDATE itineraries
               SET version = ?1, title = ?2, updated_at_ms = ?3, record = ?4
               WHERE id = ?5 AND version = ?6"#,
            params![
                doc.version as i64,
                doc.title,
                doc.updated_at.timestamp_millis(),
                record,
                doc.id,
                expected_version as i64,
            ],
        )?;
        if updated == 1 {
            return Ok(CasResult::Success);
        }

        let actual: Option<i64> = conn
            .query_row(
                "SELECT version FROM itineraries WHERE id = ?1",
                [&doc.id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match actual {
            Some(actual) => CasResult::VersionConflict {
                actual: actual as u64,
            },
            None => CasResult::NotFound,
        })
    }

    pub async fn list(&self) -> Result<Vec<ItinerarySummary>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, title, version FROM itineraries ORDER BY updated_at_ms DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ItinerarySummary {
                id: row.get(0)?,
                title: row.get(1)?,
                version: row.get::<_, i64>(2)? as u64,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"CREATE TABLE IF NOT EXISTS __itineraries_schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );"#,
    )?;

    let applied: std::collections::HashSet<i64> = {
        let mut stmt = conn.prepare("SELECT version FROM __itineraries_schema_version")?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        rows.filter_map(|r| r.ok()).collect()
    };

    let migrations: Vec<(i64, &str)> = vec![(
        1,
        r#"
        CREATE TABLE IF NOT EXISTS itineraries (
            id TEXT PRIMARY KEY,
            version INTEGER NOT NULL,
            title TEXT NOT NULL,
            updated_at_ms INTEGER NOT NULL,
            record TEXT NOT NULL
        );
        "#,
    )];

    for (version, sql) in migrations {
        if !applied.contains(&version) {
            conn.execute_batch(sql)?;
            conn.execute(
                "INSERT INTO __itineraries_schema_version (version) VALUES (?1)",
                [version],
            )?;
        }
    }

    Ok(())
}
