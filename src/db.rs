use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::errors::DeployError;
use crate::models::{DeploymentHistoryRecord, ServerTarget};
use crate::recorder::HistoryStore;

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, String> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|error| {
                format!("Failed to create database directory `{}`: {error}", parent.display())
            })?;
        }
        let conn = Connection::open(path)
            .map_err(|error| format!("Failed to open SQLite database: {error}"))?;
        let database = Self { conn };
        database.init_schema()?;
        Ok(database)
    }

    pub fn open_in_memory() -> Result<Self, String> {
        let conn = Connection::open_in_memory()
            .map_err(|error| format!("Failed to open in-memory SQLite database: {error}"))?;
        let database = Self { conn };
        database.init_schema()?;
        Ok(database)
    }

    fn init_schema(&self) -> Result<(), String> {
        self.conn
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS server_targets (
                    name TEXT PRIMARY KEY,
                    host TEXT NOT NULL,
                    port INTEGER NOT NULL,
                    username TEXT NOT NULL,
                    password TEXT,
                    private_key_path TEXT,
                    private_key_passphrase TEXT,
                    upload_directory TEXT NOT NULL,
                    install_directory TEXT NOT NULL,
                    backup_directory TEXT NOT NULL,
                    enabled INTEGER NOT NULL,
                    description TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS deployment_history (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_id TEXT NOT NULL,
                    server_name TEXT NOT NULL,
                    server_host TEXT NOT NULL,
                    package_name TEXT NOT NULL,
                    package_size INTEGER NOT NULL,
                    success INTEGER NOT NULL,
                    error_message TEXT,
                    started_at TEXT NOT NULL,
                    ended_at TEXT,
                    duration_millis INTEGER NOT NULL,
                    backup_file_path TEXT,
                    deployed_files_json TEXT NOT NULL,
                    task_description TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_deployment_history_created_at
                    ON deployment_history(created_at);
                "#,
            )
            .map_err(|error| format!("Failed to initialize schema: {error}"))
    }

    pub fn list_server_targets(&self) -> Result<Vec<ServerTarget>, String> {
        let mut statement = self
            .conn
            .prepare(
                r#"
                SELECT name, host, port, username, password, private_key_path, private_key_passphrase,
                       upload_directory, install_directory, backup_directory, enabled, description
                FROM server_targets
                ORDER BY name ASC
                "#,
            )
            .map_err(|error| format!("Failed to prepare list_server_targets query: {error}"))?;
        let mut rows = statement
            .query([])
            .map_err(|error| format!("Failed to query server targets: {error}"))?;

        let mut targets = Vec::new();
        while let Some(row) = rows
            .next()
            .map_err(|error| format!("Failed to iterate server targets: {error}"))?
        {
            let parsed = Self::target_from_row(row)
                .map_err(|error| format!("Failed to parse server target row: {error}"))?;
            targets.push(parsed);
        }
        Ok(targets)
    }

    pub fn get_server_target(&self, name: &str) -> Result<Option<ServerTarget>, String> {
        self.conn
            .query_row(
                r#"
                SELECT name, host, port, username, password, private_key_path, private_key_passphrase,
                       upload_directory, install_directory, backup_directory, enabled, description
                FROM server_targets
                WHERE name = ?1
                "#,
                params![name.trim()],
                Self::target_from_row,
            )
            .optional()
            .map_err(|error| format!("Failed to get server target `{name}`: {error}"))
    }

    /// Inserts or replaces the target with the same name. `created_at` survives updates.
    pub fn upsert_server_target(
        &self,
        target: &ServerTarget,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        let now = format_timestamp(now);
        self.conn
            .execute(
                r#"
                INSERT INTO server_targets (
                    name, host, port, username, password, private_key_path, private_key_passphrase,
                    upload_directory, install_directory, backup_directory, enabled, description,
                    created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)
                ON CONFLICT(name)
                DO UPDATE SET
                    host = excluded.host,
                    port = excluded.port,
                    username = excluded.username,
                    password = excluded.password,
                    private_key_path = excluded.private_key_path,
                    private_key_passphrase = excluded.private_key_passphrase,
                    upload_directory = excluded.upload_directory,
                    install_directory = excluded.install_directory,
                    backup_directory = excluded.backup_directory,
                    enabled = excluded.enabled,
                    description = excluded.description,
                    updated_at = excluded.updated_at
                "#,
                params![
                    target.name.trim(),
                    target.host.trim(),
                    i64::from(target.port),
                    target.username.trim(),
                    target.password,
                    target.private_key_path,
                    target.private_key_passphrase,
                    target.upload_directory.trim(),
                    target.install_directory.trim(),
                    target.backup_directory.trim(),
                    target.enabled as i64,
                    target.description,
                    now,
                ],
            )
            .map_err(|error| format!("Failed to save server target `{}`: {error}", target.name))?;
        Ok(())
    }

    pub fn server_target_created_at(&self, name: &str) -> Result<Option<DateTime<Utc>>, String> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT created_at FROM server_targets WHERE name = ?1",
                params![name.trim()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|error| format!("Failed to read created_at for `{name}`: {error}"))?;
        value.map(|value| parse_rfc3339_to_utc(&value)).transpose()
    }

    /// Returns whether a row was removed.
    pub fn delete_server_target(&self, name: &str) -> Result<bool, String> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM server_targets WHERE name = ?1",
                params![name.trim()],
            )
            .map_err(|error| format!("Failed to delete server target `{name}`: {error}"))?;
        Ok(removed > 0)
    }

    pub fn insert_history(&self, record: &DeploymentHistoryRecord) -> Result<i64, String> {
        let deployed_files_json = serde_json::to_string(&record.deployed_files)
            .map_err(|error| format!("Failed to serialize deployed files: {error}"))?;
        self.conn
            .execute(
                r#"
                INSERT INTO deployment_history (
                    task_id,
                    server_name,
                    server_host,
                    package_name,
                    package_size,
                    success,
                    error_message,
                    started_at,
                    ended_at,
                    duration_millis,
                    backup_file_path,
                    deployed_files_json,
                    task_description,
                    created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                "#,
                params![
                    record.task_id,
                    record.server_name,
                    record.server_host,
                    record.package_name,
                    record.package_size as i64,
                    record.success as i64,
                    record.error_message,
                    format_timestamp(record.started_at),
                    record.ended_at.map(format_timestamp),
                    record.duration_millis,
                    record.backup_file_path,
                    deployed_files_json,
                    record.task_description,
                    format_timestamp(record.created_at),
                ],
            )
            .map_err(|error| format!("Failed to save deployment history: {error}"))?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Newest first.
    pub fn recent_history(&self, limit: usize) -> Result<Vec<DeploymentHistoryRecord>, String> {
        let mut statement = self
            .conn
            .prepare(
                r#"
                SELECT id, task_id, server_name, server_host, package_name, package_size, success,
                       error_message, started_at, ended_at, duration_millis, backup_file_path,
                       deployed_files_json, task_description, created_at
                FROM deployment_history
                ORDER BY created_at DESC, id DESC
                LIMIT ?1
                "#,
            )
            .map_err(|error| format!("Failed to prepare history query: {error}"))?;
        let mut rows = statement
            .query(params![limit as i64])
            .map_err(|error| format!("Failed to query deployment history: {error}"))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .map_err(|error| format!("Failed to iterate deployment history: {error}"))?
        {
            records.push(Self::history_from_row(row)?);
        }
        Ok(records)
    }

    pub fn delete_history_before(&self, cutoff: DateTime<Utc>) -> Result<usize, String> {
        self.conn
            .execute(
                "DELETE FROM deployment_history WHERE created_at < ?1",
                params![format_timestamp(cutoff)],
            )
            .map_err(|error| format!("Failed to delete old deployment history: {error}"))
    }

    fn history_from_row(row: &rusqlite::Row<'_>) -> Result<DeploymentHistoryRecord, String> {
        let read_error = |column: &str, error: rusqlite::Error| {
            format!("Failed to read `{column}` from deployment history: {error}")
        };
        let started_at: String = row.get(8).map_err(|error| read_error("started_at", error))?;
        let ended_at: Option<String> = row.get(9).map_err(|error| read_error("ended_at", error))?;
        let deployed_files_json: String = row
            .get(12)
            .map_err(|error| read_error("deployed_files_json", error))?;
        let created_at: String = row.get(14).map_err(|error| read_error("created_at", error))?;

        Ok(DeploymentHistoryRecord {
            id: row.get(0).map_err(|error| read_error("id", error))?,
            task_id: row.get(1).map_err(|error| read_error("task_id", error))?,
            server_name: row.get(2).map_err(|error| read_error("server_name", error))?,
            server_host: row.get(3).map_err(|error| read_error("server_host", error))?,
            package_name: row.get(4).map_err(|error| read_error("package_name", error))?,
            package_size: row
                .get::<_, i64>(5)
                .map_err(|error| read_error("package_size", error))? as u64,
            success: row
                .get::<_, i64>(6)
                .map_err(|error| read_error("success", error))?
                != 0,
            error_message: row.get(7).map_err(|error| read_error("error_message", error))?,
            started_at: parse_rfc3339_to_utc(&started_at)?,
            ended_at: ended_at
                .map(|value| parse_rfc3339_to_utc(&value))
                .transpose()?,
            duration_millis: row
                .get(10)
                .map_err(|error| read_error("duration_millis", error))?,
            backup_file_path: row
                .get(11)
                .map_err(|error| read_error("backup_file_path", error))?,
            deployed_files: serde_json::from_str(&deployed_files_json)
                .map_err(|error| format!("Failed to decode deployed files: {error}"))?,
            task_description: row
                .get(13)
                .map_err(|error| read_error("task_description", error))?,
            created_at: parse_rfc3339_to_utc(&created_at)?,
        })
    }

    fn target_from_row(row: &rusqlite::Row<'_>) -> Result<ServerTarget, rusqlite::Error> {
        Ok(ServerTarget {
            name: row.get(0)?,
            host: row.get(1)?,
            port: row.get::<_, i64>(2)? as u16,
            username: row.get(3)?,
            password: row.get(4)?,
            private_key_path: row.get(5)?,
            private_key_passphrase: row.get(6)?,
            upload_directory: row.get(7)?,
            install_directory: row.get(8)?,
            backup_directory: row.get(9)?,
            enabled: row.get::<_, i64>(10)? != 0,
            description: row.get(11)?,
        })
    }
}

impl HistoryStore for Mutex<Database> {
    fn save(&self, record: &DeploymentHistoryRecord) -> Result<i64, DeployError> {
        self.lock()
            .map_err(|_| DeployError::Storage("Database lock poisoned".to_string()))?
            .insert_history(record)
            .map_err(DeployError::Storage)
    }

    fn find_recent(&self, limit: usize) -> Result<Vec<DeploymentHistoryRecord>, DeployError> {
        self.lock()
            .map_err(|_| DeployError::Storage("Database lock poisoned".to_string()))?
            .recent_history(limit)
            .map_err(DeployError::Storage)
    }

    fn delete_older_than(&self, days: u32) -> Result<usize, DeployError> {
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        self.lock()
            .map_err(|_| DeployError::Storage("Database lock poisoned".to_string()))?
            .delete_history_before(cutoff)
            .map_err(DeployError::Storage)
    }
}

/// Fixed-width UTC form so stored timestamps also sort correctly as text.
fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_rfc3339_to_utc(input: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(input)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|error| format!("Failed to parse timestamp `{input}`: {error}"))
}
