//! SQLite persistence for the task table.
//!
//! Each row stores the full task as JSON next to the handful of columns the
//! engine filters and orders on. Every mutation is a read-modify-write inside
//! one transaction, so lease and completion transitions are atomic.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use uuid::Uuid;
use waypoint_schema::{Task, TaskStatus, TaskType};

use crate::error::{Result, TaskError};

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<TaskType>,
    pub itinerary_id: Option<String>,
    pub limit: Option<usize>,
}

pub struct TaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl TaskStore {
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

    /// Insert `task` unless a task with the same idempotency key was created at
    /// or after `dedup_since`; in that case the existing task is returned.
    pub async fn insert_unless_duplicate(
        &self,
        task: &Task,
        dedup_since: DateTime<Utc>,
    ) -> Result<Option<Task>> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let existing: Option<String> = tx
            .query_row(
                r#"SELECT record FROM tasks
                   WHERE idempotency_key = ?1 AND created_at_ms >= ?2
                   ORDER BY created_at_ms DESC
                   LIMIT 1"#,
                params![task.idempotency_key, dedup_since.timestamp_millis()],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(record) = existing {
            return Ok(Some(serde_json::from_str(&record)?));
        }

        save(&tx, task)?;
        tx.commit()?;
        Ok(None)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Task>> {
        let conn = self.conn.lock().await;
        load(&conn, id)
    }

    /// Most recent task carrying `key`, regardless of age.
    pub async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Task>> {
        let conn = self.conn.lock().await;
        let record: Option<String> = conn
            .query_row(
                r#"SELECT record FROM tasks
                   WHERE idempotency_key = ?1
                   ORDER BY created_at_ms DESC
                   LIMIT 1"#,
                [key],
                |row| row.get(0),
            )
            .optional()?;
        record
            .map(|r| serde_json::from_str(&r).map_err(TaskError::from))
            .transpose()
    }

    /// Atomically load, mutate and save one task. Nothing is written if `f` fails.
    pub async fn update<T>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut Task) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let mut task = load(&tx, id)?.ok_or(TaskError::NotFound(id))?;
        let out = f(&mut task)?;
        save(&tx, &task)?;
        tx.commit()?;
        Ok(out)
    }

    /// Claim the highest-priority ready task, oldest schedule first.
    pub async fn claim_next<T>(
        &self,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut Task) -> T,
    ) -> Result<Option<T>> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let record: Option<String> = tx
            .query_row(
                r#"SELECT record FROM tasks
                   WHERE status = 'pending' AND scheduled_at_ms <= ?1
                   ORDER BY priority DESC, scheduled_at_ms ASC, created_at_ms ASC
                   LIMIT 1"#,
                [now.timestamp_millis()],
                |row| row.get(0),
            )
            .optional()?;

        let Some(record) = record else {
            return Ok(None);
        };
        let mut task: Task = serde_json::from_str(&record)?;
        let out = f(&mut task);
        save(&tx, &task)?;
        tx.commit()?;
        Ok(Some(out))
    }

    /// Ids of tasks whose lease expired at or before `now`.
    pub async fn expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"SELECT id FROM tasks
               WHERE lease_expires_at_ms IS NOT NULL AND lease_expires_at_ms <= ?1
               ORDER BY lease_expires_at_ms ASC"#,
        )?;
        let rows = stmt.query_map([now.timestamp_millis()], |row| row.get::<_, String>(0))?;

        let mut ids = Vec::new();
        for row in rows {
            match Uuid::parse_str(&row?) {
                Ok(id) => ids.push(id),
                Err(e) => tracing::warn!("skipping task row with malformed id: {e}"),
            }
        }
        Ok(ids)
    }

    pub async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"SELECT record FROM tasks
               WHERE (?1 IS NULL OR status = ?1)
                 AND (?2 IS NULL OR task_type = ?2)
                 AND (?3 IS NULL OR itinerary_id = ?3)
               ORDER BY created_at_ms DESC
               LIMIT ?4"#,
        )?;
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        let rows = stmt.query_map(
            params![
                filter.status.map(|s| s.as_str()),
                filter.task_type.map(|t| t.as_str()),
                filter.itinerary_id,
                limit,
            ],
            |row| row.get::<_, String>(0),
        )?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(serde_json::from_str(&row?)?);
        }
        Ok(tasks)
    }

    /// Delete terminal tasks last touched before `before`. Returns the number removed.
    pub async fn purge_terminal(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            r#"DELETE FROM tasks
               WHERE status IN ('completed', 'failed', 'cancelled')
                 AND lease_expires_at_ms IS NULL
                 AND updated_at_ms < ?1"#,
            [before.timestamp_millis()],
        )?;
        Ok(removed)
    }
}

fn load(conn: &Connection, id: Uuid) -> Result<Option<Task>> {
    let record: Option<String> = conn
        .query_row(
            "SELECT record FROM tasks WHERE id = ?1",
            [id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    record
        .map(|r| serde_json::from_str(&r).map_err(TaskError::from))
        .transpose()
}

fn save(conn: &Connection, task: &Task) -> Result<()> {
    let record = serde_json::to_string(task)?;
    conn.execute(
        r#"INSERT OR REPLACE INTO tasks
           (id, idempotency_key, task_type, itinerary_id, status, priority,
            scheduled_at_ms, lease_expires_at_ms, created_at_ms, updated_at_ms, record)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"#,
        params![
            task.id.to_string(),
            task.idempotency_key,
            task.task_type.as_str(),
            task.itinerary_id,
            task.status().as_str(),
            task.priority as i64,
            task.scheduled_at.timestamp_millis(),
            task.lease.as_ref().map(|l| l.expires_at.timestamp_millis()),
            task.created_at.timestamp_millis(),
            task.updated_at.timestamp_millis(),
            record,
        ],
    )?;
    Ok(())
}

fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"CREATE TABLE IF NOT EXISTS __tasks_schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );"#,
    )?;

    let applied: std::collections::HashSet<i64> = {
        let mut stmt = conn.prepare("SELECT version FROM __tasks_schema_version")?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        rows.filter_map(|r| r.ok()).collect()
    };

    let migrations: Vec<(i64, &str)> = vec![(
        1,
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            idempotency_key TEXT NOT NULL,
            task_type TEXT NOT NULL,
            itinerary_id TEXT,
            status TEXT NOT NULL,
            priority INTEGER NOT NULL,
            scheduled_at_ms INTEGER NOT NULL,
            lease_expires_at_ms INTEGER,
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL,
            record TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_tasks_idempotency ON tasks(idempotency_key, created_at_ms DESC);
        CREATE INDEX IF NOT EXISTS idx_tasks_ready ON tasks(status, priority DESC, scheduled_at_ms);
        CREATE INDEX IF NOT EXISTS idx_tasks_lease ON tasks(lease_expires_at_ms);
        CREATE INDEX IF NOT EXISTS idx_tasks_itinerary ON tasks(itinerary_id, created_at_ms DESC);
        "#,
    )];

    for (version, sql) in migrations {
        if !applied.contains(&version) {
            conn.execute_batch(sql)?;
            conn.execute(
                "INSERT INTO __tasks_schema_version (version) VALUES (?1)",
                [version],
            )?;
            tracing::debug!(version, "applied task store migration");
        }
    }

    Ok(())
}
