//! SQLite persistence layer.
//!
//! One database file backs the relational store (projects, deployments), the
//! durable append log with its consumer-group offsets, and the queryable log
//! table. Uses WAL mode so build executors can append while the control plane
//! reads.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use uuid::Uuid;

use crate::deploy::fsm::DeploymentStatus;
use crate::errors::PlatformError;
use crate::models::deployment::Deployment;
use crate::models::log_event::{LogEvent, StoredLog};
use crate::models::project::Project;
use crate::storage::store::ProjectStore;
use crate::transport::durable::{AppendLog, LogRecord, LogStore};

const ACTIVE_STATUSES: &str = "('QUEUED', 'IN_PROGRESS')";

/// Database handle wrapping a SQLite connection
pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    /// Open (or create) the database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PlatformError> {
        let conn = Connection::open(path)?;
        let db = Self { conn: Mutex::new(conn) };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_memory() -> Result<Self, PlatformError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn: Mutex::new(conn) };
        db.init()?;
        Ok(db)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn init(&self) -> Result<(), PlatformError> {
        let conn = self.lock();
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS projects (
                id              TEXT PRIMARY KEY,
                name            TEXT NOT NULL,
                repository_url  TEXT NOT NULL,
                subdomain       TEXT NOT NULL UNIQUE,
                created_at      TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS deployments (
                id          TEXT PRIMARY KEY,
                project_id  TEXT NOT NULL REFERENCES projects(id),
                status      TEXT NOT NULL,
                task_id     TEXT,
                error       TEXT,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_deployments_project_status
                ON deployments(project_id, status);

            CREATE TABLE IF NOT EXISTS log_records (
                log_offset   INTEGER PRIMARY KEY AUTOINCREMENT,
                payload      BLOB NOT NULL,
                appended_at  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS consumer_groups (
                group_id        TEXT PRIMARY KEY,
                committed       INTEGER NOT NULL DEFAULT 0,
                last_heartbeat  TEXT
            );

            CREATE TABLE IF NOT EXISTS deployment_logs (
                event_id       TEXT PRIMARY KEY,
                deployment_id  TEXT NOT NULL,
                project_id     TEXT NOT NULL,
                sequence       INTEGER NOT NULL,
                source         TEXT NOT NULL,
                text           TEXT NOT NULL,
                timestamp      TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_deployment_logs_deployment
                ON deployment_logs(deployment_id, sequence);
            ",
        )?;
        Ok(())
    }

    /// Committed offset of a consumer group
    pub fn committed_offset(&self, group: &str) -> Result<u64, PlatformError> {
        let conn = self.lock();
        committed_offset(&conn, group)
    }
}

fn committed_offset(conn: &Connection, group: &str) -> Result<u64, PlatformError> {
    let committed: Option<i64> = conn
        .query_row(
            "SELECT committed FROM consumer_groups WHERE group_id = ?1",
            params![group],
            |row| row.get(0),
        )
        .optional()?;
    Ok(committed.unwrap_or(0) as u64)
}

fn conversion_error(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        Type::Text,
        Box::new(PlatformError::StorageError(message)),
    )
}

fn uuid_column(row: &Row<'_>, index: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(index)?;
    raw.parse()
        .map_err(|e: uuid::Error| conversion_error(index, e.to_string()))
}

fn time_column(row: &Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(index)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(index, e.to_string()))
}

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: uuid_column(row, 0)?,
        name: row.get(1)?,
        repository_url: row.get(2)?,
        subdomain: row.get(3)?,
        created_at: time_column(row, 4)?,
    })
}

fn deployment_from_row(row: &Row<'_>) -> rusqlite::Result<Deployment> {
    let status: String = row.get(2)?;
    Ok(Deployment {
        id: uuid_column(row, 0)?,
        project_id: uuid_column(row, 1)?,
        status: status.parse().map_err(|e: String| conversion_error(2, e))?,
        task_id: row.get(3)?,
        error: row.get(4)?,
        created_at: time_column(row, 5)?,
        updated_at: time_column(row, 6)?,
    })
}

const PROJECT_COLUMNS: &str = "id, name, repository_url, subdomain, created_at";
const DEPLOYMENT_COLUMNS: &str = "id, project_id, status, task_id, error, created_at, updated_at";

#[async_trait]
impl ProjectStore for Db {
    async fn insert_project(&self, project: &Project) -> Result<(), PlatformError> {
        let conn = self.lock();
        let result = conn.execute(
            "INSERT INTO projects (id, name, repository_url, subdomain, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                project.id.to_string(),
                project.name,
                project.repository_url,
                project.subdomain,
                project.created_at.to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _)) if err.code == ErrorCode::ConstraintViolation => {
                Err(PlatformError::Conflict(format!(
                    "subdomain {} is already taken",
                    project.subdomain
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find_project(&self, id: Uuid) -> Result<Option<Project>, PlatformError> {
        let conn = self.lock();
        let project = conn
            .query_row(
                &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"),
                params![id.to_string()],
                project_from_row,
            )
            .optional()?;
        Ok(project)
    }

    async fn find_project_by_subdomain(&self, subdomain: &str) -> Result<Option<Project>, PlatformError> {
        let conn = self.lock();
        let project = conn
            .query_row(
                &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE subdomain = ?1"),
                params![subdomain],
                project_from_row,
            )
            .optional()?;
        Ok(project)
    }

    async fn insert_deployment_if_idle(&self, deployment: &Deployment) -> Result<bool, PlatformError> {
        let mut conn = self.lock();
        // IMMEDIATE takes the write lock up front, so two admissions for the
        // same project (even from different processes) cannot interleave.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let active: i64 = tx.query_row(
            &format!(
                "SELECT COUNT(*) FROM deployments WHERE project_id = ?1 AND status IN {ACTIVE_STATUSES}"
            ),
            params![deployment.project_id.to_string()],
            |row| row.get(0),
        )?;
        if active > 0 {
            return Ok(false);
        }

        tx.execute(
            &format!("INSERT INTO deployments ({DEPLOYMENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
            params![
                deployment.id.to_string(),
                deployment.project_id.to_string(),
                deployment.status.as_str(),
                deployment.task_id,
                deployment.error,
                deployment.created_at.to_rfc3339(),
                deployment.updated_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    async fn find_deployment(&self, id: Uuid) -> Result<Option<Deployment>, PlatformError> {
        let conn = self.lock();
        let deployment = conn
            .query_row(
                &format!("SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE id = ?1"),
                params![id.to_string()],
                deployment_from_row,
            )
            .optional()?;
        Ok(deployment)
    }

    async fn find_active_deployments_for_project(
        &self,
        project_id: Uuid,
    ) -> Result<Vec<Deployment>, PlatformError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments
             WHERE project_id = ?1 AND status IN {ACTIVE_STATUSES}
             ORDER BY created_at"
        ))?;
        let rows = stmt.query_map(params![project_id.to_string()], deployment_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    async fn list_active_deployments(&self) -> Result<Vec<Deployment>, PlatformError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments
             WHERE status IN {ACTIVE_STATUSES}
             ORDER BY created_at"
        ))?;
        let rows = stmt.query_map([], deployment_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    async fn update_deployment(
        &self,
        deployment: &Deployment,
        expected: DeploymentStatus,
    ) -> Result<bool, PlatformError> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE deployments
             SET status = ?1, task_id = ?2, error = ?3, updated_at = ?4
             WHERE id = ?5 AND status = ?6",
            params![
                deployment.status.as_str(),
                deployment.task_id,
                deployment.error,
                deployment.updated_at.to_rfc3339(),
                deployment.id.to_string(),
                expected.as_str(),
            ],
        )?;

        if changed == 0 {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM deployments WHERE id = ?1",
                    params![deployment.id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(PlatformError::NotFound(format!("deployment {}", deployment.id)));
            }
        }
        Ok(changed > 0)
    }
}

#[async_trait]
impl AppendLog for Db {
    async fn append(&self, payload: &[u8]) -> Result<u64, PlatformError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO log_records (payload, appended_at) VALUES (?1, ?2)",
            params![payload, Utc::now().to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid() as u64)
    }

    async fn fetch(&self, group: &str, max: usize) -> Result<Vec<LogRecord>, PlatformError> {
        let conn = self.lock();
        let committed = committed_offset(&conn, group)?;
        let mut stmt = conn.prepare(
            "SELECT log_offset, payload FROM log_records
             WHERE log_offset > ?1 ORDER BY log_offset LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![committed as i64, max as i64], |row| {
            let offset: i64 = row.get(0)?;
            Ok(LogRecord {
                offset: offset as u64,
                payload: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    async fn commit(&self, group: &str, offset: u64) -> Result<(), PlatformError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO consumer_groups (group_id, committed) VALUES (?1, ?2)
             ON CONFLICT(group_id) DO UPDATE SET committed = MAX(committed, excluded.committed)",
            params![group, offset as i64],
        )?;
        Ok(())
    }

    async fn heartbeat(&self, group: &str) -> Result<(), PlatformError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO consumer_groups (group_id, last_heartbeat) VALUES (?1, ?2)
             ON CONFLICT(group_id) DO UPDATE SET last_heartbeat = excluded.last_heartbeat",
            params![group, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

#[async_trait]
impl LogStore for Db {
    async fn insert(&self, event: &LogEvent) -> Result<bool, PlatformError> {
        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO deployment_logs
                (event_id, deployment_id, project_id, sequence, source, text, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.event_id.to_string(),
                event.deployment_id.to_string(),
                event.project_id.to_string(),
                event.sequence as i64,
                event.source.as_str(),
                event.text,
                event.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(inserted > 0)
    }

    async fn query(&self, deployment_id: Uuid) -> Result<Vec<StoredLog>, PlatformError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT event_id, text, timestamp FROM deployment_logs
             WHERE deployment_id = ?1 ORDER BY sequence",
        )?;
        let rows = stmt.query_map(params![deployment_id.to_string()], |row| {
            Ok(StoredLog {
                event_id: uuid_column(row, 0)?,
                text: row.get(1)?,
                timestamp: time_column(row, 2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
