//! Per-window replay log.
//!
//! Each operator records the exact payload it emitted for each window
//! so a restarted pipeline can re-emit identical windows instead of
//! reprocessing live input. Records live in a local SQLite database;
//! the `(operator_id, window_id)` primary key is what makes saves
//! write-once.

use std::path::Path;
use std::sync::OnceLock;

use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite_migration::Migrations;
use rusqlite_migration::M;

use crate::errors::Result;
use crate::errors::StateError;
use crate::model::OperatorId;
use crate::model::WindowId;

fn get_migrations() -> &'static Migrations<'static> {
    static MIGRATIONS: OnceLock<Migrations<'static>> = OnceLock::new();
    MIGRATIONS.get_or_init(|| {
        Migrations::new(vec![M::up(
            "CREATE TABLE replays (
                 created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                 operator_id TEXT NOT NULL,
                 window_id INTEGER NOT NULL CHECK (window_id >= 0),
                 payload BLOB NOT NULL,
                 PRIMARY KEY (operator_id, window_id)
             ) STRICT",
        )])
    })
}

fn setup_conn(conn: &mut Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "FULL")?;
    conn.pragma_update(None, "busy_timeout", "5000")?;
    get_migrations().to_latest(conn)?;
    Ok(())
}

/// Write-once store of per-window replay payloads.
pub struct IdempotentStorageManager {
    conn: Connection,
}

impl IdempotentStorageManager {
    /// Open (or create) the replay database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let mut conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        setup_conn(&mut conn)?;
        tracing::debug!("Opened replay log at {path:?}");
        Ok(Self { conn })
    }

    /// In-memory log for tests and ephemeral pipelines.
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        setup_conn(&mut conn)?;
        Ok(Self { conn })
    }

    /// Record the payload an operator produced for a window. A second
    /// save for the same `(operator, window)` is rejected; the first
    /// record stands.
    pub fn save(&self, operator: &OperatorId, window: WindowId, payload: &[u8]) -> Result<()> {
        let result = self.conn.execute(
            "INSERT INTO replays (operator_id, window_id, payload) VALUES (?1, ?2, ?3)",
            (&operator.0, window.0, payload),
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StateError::DuplicateWrite {
                    operator: operator.clone(),
                    window,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Replace a record in place. Only for log compaction, where a
    /// run of windows is collapsed into one record; normal saves go
    /// through [`save`](Self::save).
    pub fn save_for_compaction(
        &self,
        operator: &OperatorId,
        window: WindowId,
        payload: &[u8],
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO replays (operator_id, window_id, payload)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (operator_id, window_id) DO UPDATE SET payload = excluded.payload",
            (&operator.0, window.0, payload),
        )?;
        Ok(())
    }

    /// Fetch the payload recorded for a window, if any.
    pub fn load(&self, operator: &OperatorId, window: WindowId) -> Result<Option<Vec<u8>>> {
        let payload = self
            .conn
            .query_row(
                "SELECT payload FROM replays WHERE operator_id = ?1 AND window_id = ?2",
                (&operator.0, window.0),
                |row| row.get(0),
            )
            .optional()?;
        Ok(payload)
    }

    /// The largest window this operator has a record for. Windows at
    /// or below it must replay from the log on restart.
    pub fn largest_recovery_window(&self, operator: &OperatorId) -> Result<Option<WindowId>> {
        let max = self.conn.query_row(
            "SELECT MAX(window_id) FROM replays WHERE operator_id = ?1",
            (&operator.0,),
            |row| row.get::<_, Option<u64>>(0),
        )?;
        Ok(max.map(WindowId))
    }

    /// Delete an operator's records at windows <= `bound`, except its
    /// newest record, which is always kept so
    /// [`largest_recovery_window`](Self::largest_recovery_window)
    /// stays stable across pruning.
    pub fn delete_up_to(&self, operator: &OperatorId, bound: WindowId) -> Result<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM replays
             WHERE operator_id = ?1
               AND window_id <= ?2
               AND window_id < (SELECT MAX(window_id) FROM replays WHERE operator_id = ?1)",
            (&operator.0, bound.0),
        )?;
        if deleted > 0 {
            tracing::debug!("Pruned {deleted} replay records for {operator} up to window {bound}");
        }
        Ok(deleted)
    }
}
