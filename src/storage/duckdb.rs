use super::traits::{CheckpointStore, StorageError, TemplateStore};
use crate::render::Template;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duckdb::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        std::process::Command::new("ps")
            .arg("-p")
            .arg(pid.to_string())
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

/// DuckDB reports the holder as `... (PID 12345) ...`
fn extract_pid_from_lock_error(message: &str) -> Option<u32> {
    let start = message.find("(PID ")? + "(PID ".len();
    let end = message[start..].find(')')?;
    message[start..start + end].trim().parse().ok()
}

fn remove_lock_files(db_path: &Path) -> std::io::Result<()> {
    for suffix in ["wal", "lock"] {
        let stale = PathBuf::from(format!("{}.{}", db_path.display(), suffix));
        if stale.exists() {
            std::fs::remove_file(&stale)?;
            info!(path = %stale.display(), "Removed stale database file");
        }
    }
    Ok(())
}

/// DuckDB-backed template and checkpoint state
pub struct DuckDbStore {
    conn: Arc<Mutex<Connection>>,
}

impl DuckDbStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = match Connection::open(path) {
            Ok(conn) => conn,
            Err(e) => {
                let message = e.to_string();
                if !message.contains("Could not set lock") {
                    return Err(e.into());
                }
                let Some(pid) = extract_pid_from_lock_error(&message) else {
                    return Err(e.into());
                };
                if is_process_running(pid) {
                    warn!(pid, path = %path.display(), "State database is held by a running process");
                    return Err(StorageError::Locked { pid });
                }

                warn!(pid, "Lock holder is gone, removing stale lock files");
                remove_lock_files(path)?;
                Connection::open(path)?
            }
        };
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory DuckDB store (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn init_schema(&self) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS state_entries (
                    state_key VARCHAR PRIMARY KEY,
                    state_value VARCHAR NOT NULL
                )",
                [],
            )?;

            conn.execute(
                "CREATE TABLE IF NOT EXISTS templates (
                    id VARCHAR PRIMARY KEY,
                    body VARCHAR NOT NULL,
                    sender_field VARCHAR NOT NULL,
                    updated_at VARCHAR NOT NULL
                )",
                [],
            )?;

            Ok(())
        })
        .await
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = lock(&conn)?;
            f(&guard)
        })
        .await
        .map_err(|e| StorageError::Database(format!("Task join error: {}", e)))?
    }
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, StorageError> {
    conn.lock()
        .map_err(|_| StorageError::Database("connection mutex poisoned".to_string()))
}

fn template_from_row(row: &duckdb::Row<'_>) -> Result<Template, StorageError> {
    let id: String = row.get(0)?;
    let updated_at: String = row.get(3)?;
    let updated_at = DateTime::parse_from_rfc3339(&updated_at)
        .map_err(|e| StorageError::Corrupt {
            key: format!("templates/{}", id),
            message: e.to_string(),
        })?
        .with_timezone(&Utc);

    Ok(Template {
        id,
        body: row.get(1)?,
        sender_field: row.get(2)?,
        updated_at,
    })
}

#[async_trait]
impl TemplateStore for DuckDbStore {
    async fn get_template(&self, id: &str) -> Result<Option<Template>, StorageError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, body, sender_field, updated_at FROM templates WHERE id = ?",
            )?;
            let mut rows = stmt.query(duckdb::params![id])?;

            let template = match rows.next()? {
                Some(row) => Some(template_from_row(row)?),
                None => None,
            };
            Ok(template)
        })
        .await
    }

    async fn list_templates(&self) -> Result<Vec<Template>, StorageError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT id, body, sender_field, updated_at FROM templates ORDER BY id")?;
            let mut rows = stmt.query([])?;

            let mut templates = Vec::new();
            while let Some(row) = rows.next()? {
                templates.push(template_from_row(row)?);
            }
            Ok(templates)
        })
        .await
    }

    async fn put_template(&self, template: &Template) -> Result<(), StorageError> {
        let template = template.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO templates (id, body, sender_field, updated_at)
                 VALUES (?, ?, ?, ?)",
                duckdb::params![
                    template.id,
                    template.body,
                    template.sender_field,
                    template.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn remove_template(&self, id: &str) -> Result<bool, StorageError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let removed = conn.execute("DELETE FROM templates WHERE id = ?", duckdb::params![id])?;
            Ok(removed > 0)
        })
        .await
    }
}

#[async_trait]
impl CheckpointStore for DuckDbStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT state_value FROM state_entries WHERE state_key = ?")?;
            let mut rows = stmt.query(duckdb::params![key])?;

            let value: Option<String> = match rows.next()? {
                Some(row) => Some(row.get(0)?),
                None => None,
            };
            Ok(value)
        })
        .await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let key = key.to_string();
        let value = value.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO state_entries (state_key, state_value) VALUES (?, ?)",
                duckdb::params![key, value],
            )?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM state_entries WHERE state_key = ?", duckdb::params![key])?;
            Ok(())
        })
        .await
    }
}
