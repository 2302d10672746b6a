//! Call History Database
//!
//! SQLite-Datenbank für die Anrufliste.
//! Speichert Gegenstelle, Zeitpunkt und Dauer jedes beendeten Anrufs.
//! Einträge werden nur angehängt und nur gesammelt gelöscht.

use chrono::Local;
use parking_lot::Mutex;
use rusqlite::{params, Connection, Result as SqliteResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Format der gespeicherten Zeitstempel (lokale Zeit)
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const DATABASE_FILE: &str = "call_history.db";

pub type RecordId = i64;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    DirectoryCreation(#[from] std::io::Error),

    #[error("Invalid duration: {0}")]
    InvalidDuration(u64),
}

// ============================================================================
// CALL HISTORY RECORD
// ============================================================================

/// Ein beendeter Anruf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallHistoryRecord {
    pub id: RecordId,
    pub peer_name: String,
    pub timestamp: String,
    pub duration_seconds: u64,
}

impl std::fmt::Display for CallHistoryRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} - {} (Duration: {} sec)",
            self.peer_name, self.timestamp, self.duration_seconds
        )
    }
}

// ============================================================================
// STORE TRAIT
// ============================================================================

/// Ablage für beendete Anrufe
pub trait CallHistoryStore: Send + Sync {
    /// Hängt einen Eintrag mit dem aktuellen Zeitpunkt an
    fn record(&self, peer_name: &str, duration_seconds: u64) -> Result<RecordId, DatabaseError>;

    /// Alle Einträge, neueste zuerst
    fn list_all(&self) -> Result<Vec<CallHistoryRecord>, DatabaseError>;

    /// Löscht alle Einträge, gibt die Anzahl zurück
    fn clear_all(&self) -> Result<usize, DatabaseError>;
}

// ============================================================================
// DATABASE
// ============================================================================

/// SQLite-Datenbank für die Anrufliste (Thread-safe durch Mutex)
pub struct CallHistoryDatabase {
    conn: Mutex<Connection>,
}

impl CallHistoryDatabase {
    /// Öffnet oder erstellt die Datenbank unter `path`
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        // Parent-Verzeichnis erstellen
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        tracing::info!("Opening call history at {:?}", path);

        Self::with_connection(Connection::open(path)?)
    }

    /// Öffnet die Datenbank im App-Datenverzeichnis
    pub fn open_default() -> Result<Self, DatabaseError> {
        Self::open(&Self::default_path()?)
    }

    /// In-Memory Datenbank, nichts wird gespeichert
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, DatabaseError> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Ermittelt den Pfad zur Datenbank-Datei
    pub fn default_path() -> Result<PathBuf, DatabaseError> {
        let proj_dirs = directories::ProjectDirs::from("org", "bluecall", "bluecall")
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Could not determine app data directory",
                )
            })?;

        Ok(proj_dirs.data_dir().join(DATABASE_FILE))
    }

    /// Initialisiert das Datenbank-Schema
    fn init_schema(&self) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS call_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_name TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                duration INTEGER NOT NULL CHECK (duration >= 0)
            )
            "#,
            [],
        )?;
        Ok(())
    }
}

impl CallHistoryStore for CallHistoryDatabase {
    fn record(&self, peer_name: &str, duration_seconds: u64) -> Result<RecordId, DatabaseError> {
        let duration = i64::try_from(duration_seconds)
            .map_err(|_| DatabaseError::InvalidDuration(duration_seconds))?;
        let timestamp = Local::now().format(TIMESTAMP_FORMAT).to_string();

        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO call_history (device_name, timestamp, duration)
            VALUES (?1, ?2, ?3)
            "#,
            params![peer_name, timestamp, duration],
        )?;

        let id = conn.last_insert_rowid();
        tracing::debug!("Call history entry {} saved ({}, {} sec)", id, peer_name, duration);
        Ok(id)
    }

    fn list_all(&self) -> Result<Vec<CallHistoryRecord>, DatabaseError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, device_name, timestamp, duration
            FROM call_history
            ORDER BY id DESC
            "#,
        )?;

        let records = stmt
            .query_map([], |row| {
                Ok(CallHistoryRecord {
                    id: row.get(0)?,
                    peer_name: row.get(1)?,
                    timestamp: row.get(2)?,
                    duration_seconds: row.get::<_, i64>(3)?.max(0) as u64,
                })
            })?
            .collect::<SqliteResult<Vec<CallHistoryRecord>>>()?;

        Ok(records)
    }

    fn clear_all(&self) -> Result<usize, DatabaseError> {
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM call_history", [])?;
        tracing::info!("Call history cleared ({} entries)", removed);
        Ok(removed)
    }
}

// ============================================================================
// TESTS
// ============================================================================
