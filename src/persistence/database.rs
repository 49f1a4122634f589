//! SQLite database implementation for persistent storage

use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tracing::{debug, error, info};

use crate::core::{EngineType, Instance, InstanceId, InstanceState};

/// Database wrapper for SQLite operations
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database file
    pub fn open(db_path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)
            .context(format!("Failed to open database at {:?}", db_path))?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        info!("Database opened at {:?}", db_path);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Initialize database schema
    pub fn initialize(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            -- Instances table
            CREATE TABLE IF NOT EXISTS instances (
                id TEXT PRIMARY KEY,
                engine_type TEXT NOT NULL,
                aircraft_type TEXT NOT NULL,
                port INTEGER NOT NULL,
                state TEXT NOT NULL,
                pid_engine INTEGER,
                pid_router INTEGER,
                working_dir TEXT NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                stopped_at TEXT,
                last_error TEXT
            );

            -- Instance history
            CREATE TABLE IF NOT EXISTS instance_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                event_time TEXT NOT NULL,
                details TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_history_instance
                ON instance_history (instance_id);
            "#,
        )?;

        info!("Database schema initialized");
        Ok(())
    }

    // === Instances ===

    /// Insert or replace an instance row
    pub fn save_instance(&self, instance: &Instance) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO instances
            (id, engine_type, aircraft_type, port, state, pid_engine, pid_router,
             working_dir, created_at, started_at, stopped_at, last_error)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                instance.id.to_string(),
                instance.engine_type.as_str(),
                instance.aircraft_type,
                instance.port,
                instance.state.label(),
                instance.pid_engine,
                instance.pid_router,
                instance.working_dir.to_string_lossy().to_string(),
                instance.created_at.to_rfc3339(),
                instance.started_at.map(|t| t.to_rfc3339()),
                instance.stopped_at.map(|t| t.to_rfc3339()),
                instance.last_error,
            ],
        )?;

        debug!("Instance {} saved", instance.id);
        Ok(())
    }

    /// Load all instances from database
    pub fn load_all_instances(&self) -> Result<Vec<Instance>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, engine_type, aircraft_type, port, state, pid_engine, pid_router, \
             working_dir, created_at, started_at, stopped_at, last_error \
             FROM instances ORDER BY created_at",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(InstanceRow {
                id: row.get(0)?,
                engine_type: row.get(1)?,
                aircraft_type: row.get(2)?,
                port: row.get(3)?,
                state: row.get(4)?,
                pid_engine: row.get(5)?,
                pid_router: row.get(6)?,
                working_dir: row.get(7)?,
                created_at: row.get(8)?,
                started_at: row.get(9)?,
                stopped_at: row.get(10)?,
                last_error: row.get(11)?,
            })
        })?;

        let mut result = Vec::new();
        for row in rows {
            let row = row?;
            match row.into_instance() {
                Ok(instance) => result.push(instance),
                Err(e) => error!("Skipping unreadable instance record: {}", e),
            }
        }

        Ok(result)
    }

    /// Delete an instance from database
    pub fn delete_instance(&self, id: InstanceId) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM instances WHERE id = ?1",
            params![id.to_string()],
        )?;
        debug!("Instance {} deleted", id);
        Ok(())
    }

    // === History ===

    /// Record an instance event
    pub fn record_instance_event(
        &self,
        instance_id: InstanceId,
        event_type: &str,
        details: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO instance_history (instance_id, event_type, event_time, details)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                instance_id.to_string(),
                event_type,
                Utc::now().to_rfc3339(),
                details,
            ],
        )?;
        Ok(())
    }

    /// Get instance history, oldest first
    pub fn get_instance_history(
        &self,
        instance_id: InstanceId,
    ) -> Result<Vec<(String, String, Option<String>)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT event_type, event_time, details FROM instance_history WHERE instance_id = ?1 ORDER BY id"
        )?;

        let history = stmt.query_map(params![instance_id.to_string()], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;

        let mut result = Vec::new();
        for event in history {
            result.push(event?);
        }

        Ok(result)
    }

    /// Clean up old history entries
    pub fn cleanup_history(&self, retention_days: u32) -> Result<usize> {
        if retention_days == 0 {
            return Ok(0); // Keep forever
        }

        let conn = self.conn()?;
        let cutoff = Utc::now()
            - chrono::TimeDelta::try_days(retention_days as i64)
                .unwrap_or_else(|| chrono::TimeDelta::days(30));
        let count = conn.execute(
            "DELETE FROM instance_history WHERE event_time < ?1",
            params![cutoff.to_rfc3339()],
        )?;

        debug!("Cleaned up {} old history entries", count);
        Ok(count)
    }
}

/// Raw column values of an `instances` row
struct InstanceRow {
    id: String,
    engine_type: String,
    aircraft_type: String,
    port: u16,
    state: String,
    pid_engine: Option<u32>,
    pid_router: Option<u32>,
    working_dir: String,
    created_at: String,
    started_at: Option<String>,
    stopped_at: Option<String>,
    last_error: Option<String>,
}

impl InstanceRow {
    fn into_instance(self) -> Result<Instance> {
        let id: InstanceId = self
            .id
            .parse()
            .with_context(|| format!("invalid instance id '{}'", self.id))?;
        let engine_type: EngineType = self
            .engine_type
            .parse()
            .map_err(|e| anyhow::anyhow!("instance {}: {}", id, e))?;
        let state: InstanceState = self
            .state
            .parse()
            .map_err(|e| anyhow::anyhow!("instance {}: {}", id, e))?;

        let mut instance = Instance::with_id(
            id,
            engine_type,
            self.aircraft_type,
            self.port,
            PathBuf::from(self.working_dir),
        );
        instance.state = state;
        instance.pid_engine = self.pid_engine;
        instance.pid_router = self.pid_router;
        instance.created_at = parse_time(&self.created_at).unwrap_or_else(Utc::now);
        instance.started_at = self.started_at.as_deref().and_then(parse_time);
        instance.stopped_at = self.stopped_at.as_deref().and_then(parse_time);
        instance.last_error = self.last_error;
        Ok(instance)
    }
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
