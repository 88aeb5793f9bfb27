//! SQLite persistence for canonical places, the source-key index and the
//! pending-merge queue.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use waypoint_schema::{CanonicalPlace, Coordinates, PlaceCandidate};

use crate::error::{RegistryError, Result};

/// A candidate that could not be merged yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMerge {
    pub id: i64,
    pub candidate: PlaceCandidate,
    pub last_error: String,
    pub attempts: u32,
    pub queued_at: DateTime<Utc>,
}

pub struct PlaceStore {
    conn: Arc<Mutex<Connection>>,
}

impl PlaceStore {
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

    pub async fn get(&self, place_id: &str) -> Result<Option<CanonicalPlace>> {
        let conn = self.conn.lock().await;
        let record: Option<String> = conn
            .query_row(
                "SELECT record FROM places WHERE id = ?1",
                [place_id],
                |row| row.get(0),
            )
            .optional()?;
        record
            .map(|r| serde_json::from_str(&r).map_err(RegistryError::from))
            .transpose()
    }

    pub async fn place_id_for_source(&self, source_key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT place_id FROM place_sources WHERE source_key = ?1",
                [source_key],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Upsert the place row and index every source key it carries.
    pub async fn save(&self, place: &CanonicalPlace) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let record = serde_json::to_string(place)?;
        tx.execute(
            r#"INSERT OR REPLACE INTO places (id, name, lat, lng, updated_at_ms, record)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
            params![
                place.id,
                place.name,
                place.coordinates.map(|c| c.lat),
                place.coordinates.map(|c| c.lng),
                place.last_updated.timestamp_millis(),
                record,
            ],
        )?;
        for source in &place.sources {
            tx.execute(
                "INSERT OR IGNORE INTO place_sources (source_key, place_id) VALUES (?1, ?2)",
                params![source.source_key(), place.id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Places inside a lat/lng bounding box around `center`; callers refine by distance.
    pub async fn near(&self, center: Coordinates, radius_m: f64) -> Result<Vec<CanonicalPlace>> {
        let dlat = (radius_m / 111_320.0).max(1e-6);
        let dlng = (radius_m / (111_320.0 * center.lat.to_radians().cos().abs().max(0.01))).max(1e-6);

        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"SELECT record FROM places
               WHERE lat BETWEEN ?1 AND ?2 AND lng BETWEEN ?3 AND ?4"#,
        )?;
        let rows = stmt.query_map(
            params![
                center.lat - dlat,
                center.lat + dlat,
                center.lng - dlng,
                center.lng + dlng
            ],
            |row| row.get::<_, String>(0),
        )?;

        let mut places = Vec::new();
        for row in rows {
            places.push(serde_json::from_str(&row?)?);
        }
        Ok(places)
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<CanonicalPlace>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT record FROM places ORDER BY updated_at_ms DESC LIMIT ?1")?;
        let rows = stmt.query_map([limit as i64], |row| row.get::<_, String>(0))?;

        let mut places = Vec::new();
        for row in rows {
            places.push(serde_json::from_str(&row?)?);
        }
        Ok(places)
    }

    pub async fn enqueue_pending(&self, candidate: &PlaceCandidate, error: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO pending_merges (source_key, candidate, last_error, attempts, queued_at_ms)
               VALUES (?1, ?2, ?3, 0, ?4)"#,
            params![
                candidate.source_key(),
                serde_json::to_string(candidate)?,
                error,
                Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub async fn pending(&self) -> Result<Vec<PendingMerge>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"SELECT id, candidate, last_error, attempts, queued_at_ms
               FROM pending_merges ORDER BY id ASC"#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, candidate, last_error, attempts, queued_at_ms) = row?;
            out.push(PendingMerge {
                id,
                candidate: serde_json::from_str(&candidate)?,
                last_error,
                attempts: attempts as u32,
                queued_at: Utc
                    .timestamp_millis_opt(queued_at_ms)
                    .single()
                    .unwrap_or_else(Utc::now),
            });
        }
        Ok(out)
    }

    pub async fn record_pending_failure(&self, id: i64, error: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE pending_merges SET attempts = attempts + 1, last_error = ?1 WHERE id = ?2",
            params![error, id],
        )?;
        Ok(())
    }

    pub async fn remove_pending(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM pending_merges WHERE id = ?1", [id])?;
        Ok(())
    }
}

fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"CREATE TABLE IF NOT EXISTS __places_schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );"#,
    )?;

    let applied: std::collections::HashSet<i64> = {
        let mut stmt = conn.prepare("SELECT version FROM __places_schema_version")?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        rows.filter_map(|r| r.ok()).collect()
    };

    let migrations: Vec<(i64, &str)> = vec![
        (
            1,
            r#"
            CREATE TABLE IF NOT EXISTS places (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                lat REAL,
                lng REAL,
                updated_at_ms INTEGER NOT NULL,
                record TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS place_sources (
                source_key TEXT PRIMARY KEY,
                place_id TEXT NOT NULL REFERENCES places(id)
            );

            CREATE INDEX IF NOT EXISTS idx_places_coords ON places(lat, lng);
            CREATE INDEX IF NOT EXISTS idx_place_sources_place ON place_sources(place_id);
            "#,
        ),
        (
            2,
            r#"
            CREATE TABLE IF NOT EXISTS pending_merges (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_key TEXT NOT NULL,
                candidate TEXT NOT NULL,
                last_error TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                queued_at_ms INTEGER NOT NULL
            );
            "#,
        ),
    ];

    for (version, sql) in migrations {
        if !applied.contains(&version) {
            conn.execute_batch(sql)?;
            conn.execute(
                "INSERT INTO __places_schema_version (version) VALUES (?1)",
                [version],
            )?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use waypoint_schema::SourceType;

    use crate::merge::new_place;

    #[tokio::test]
    async fn test_save_indexes_sources() {
        let tmp = TempDir::new().unwrap();
        let store = PlaceStore::open(&tmp.path().join("places.db")).unwrap();
        let candidate = PlaceCandidate::new(SourceType::MappingProvider, "osm-1", "Jerónimos")
            .at(38.6979, -9.2068);
        let place = new_place(&candidate, Utc::now());
        store.save(&place).await.unwrap();

        assert_eq!(
            store
                .place_id_for_source(&candidate.source_key())
                .await
                .unwrap(),
            Some(place.id.clone())
        );
        assert_eq!(store.get(&place.id).await.unwrap().unwrap(), place);
        assert_eq!(store.list(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_near_uses_bounding_box() {
        let store = PlaceStore::open_in_memory().unwrap();
        let here = PlaceCandidate::new(SourceType::ReviewSite, "r1", "Pastéis").at(38.6975, -9.2032);
        let far = PlaceCandidate::new(SourceType::ReviewSite, "r2", "Elsewhere").at(41.0, -8.0);
        store.save(&new_place(&here, Utc::now())).await.unwrap();
        store.save(&new_place(&far, Utc::now())).await.unwrap();

        let found = store
            .near(Coordinates::new(38.6976, -9.2033), 150.0)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "Pastéis");
    }

    #[tokio::test]
    async fn test_pending_queue_lifecycle() {
        let store = PlaceStore::open_in_memory().unwrap();
        let candidate = PlaceCandidate::new(SourceType::LlmGenerated, "llm-9", "Somewhere");
        store.enqueue_pending(&candidate, "bad authority").await.unwrap();

        let pending = store.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 0);

        store
            .record_pending_failure(pending[0].id, "still bad")
            .await
            .unwrap();
        let pending = store.pending().await.unwrap();
        assert_eq!(pending[0].attempts, 1);
        assert_eq!(pending[0].last_error, "still bad");

        store.remove_pending(pending[0].id).await.unwrap();
        assert!(store.pending().await.unwrap().is_empty());
    }
}
