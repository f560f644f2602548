use crate::error::AuditError;
use crate::types::{AttemptRecord, NewAttempt};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// Append-only store for attempt records. Shared by every in-flight attempt,
/// so implementations must be safe under concurrent `append` calls.
pub trait AuditSink: Send + Sync {
    fn append(&self, attempt: &NewAttempt) -> Result<i64, AuditError>;
}

pub struct SqliteAuditLog {
    conn: Mutex<Connection>,
}

impl SqliteAuditLog {
    pub fn open(path: &Path) -> Result<Self, AuditError> {
        if let Some(parent) = path.parent() {
            // open() reports the real error if this fails.
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::with_connection(conn)
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self, AuditError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, AuditError> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn recent(&self, limit: usize) -> Result<Vec<AttemptRecord>, AuditError> {
        let conn = self.conn.lock().map_err(|_| AuditError::Poisoned)?;
        let mut stmt = conn.prepare(
            "SELECT id, host, request, command, exit_status, transcript, created_at
             FROM attempts ORDER BY id DESC LIMIT ?1",
        )?;
        let records = stmt
            .query_map(params![limit as i64], |row| {
                Ok(AttemptRecord {
                    id: row.get(0)?,
                    host: row.get(1)?,
                    request: row.get(2)?,
                    command: row.get(3)?,
                    exit_status: row.get(4)?,
                    transcript: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn count(&self) -> Result<u64, AuditError> {
        let conn = self.conn.lock().map_err(|_| AuditError::Poisoned)?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM attempts", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

fn init_db(conn: &Connection) -> Result<(), AuditError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attempts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            host TEXT NOT NULL,
            request TEXT NOT NULL,
            command TEXT NOT NULL,
            exit_status INTEGER NOT NULL,
            transcript TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )",
        [],
    )?;
    Ok(())
}

impl AuditSink for SqliteAuditLog {
    fn append(&self, attempt: &NewAttempt) -> Result<i64, AuditError> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.conn.lock().map_err(|_| AuditError::Poisoned)?;
        conn.execute(
            "INSERT INTO attempts (host, request, command, exit_status, transcript, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                attempt.host,
                attempt.request,
                attempt.command,
                attempt.exit_status,
                attempt.transcript,
                now
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }
}
