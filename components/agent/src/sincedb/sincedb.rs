// External crates
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SinceDbError {
    #[error("sincedb query failed: {0}")]
    Sql(#[from] rusqlite::Error),
}

/// Durable file-position store.
///
/// One row per watched filename: the file identity it was last seen as,
/// the number of lines consumed since position zero of that identity, and
/// the wall-clock time of the last write. Writes auto-commit; the store
/// tolerates concurrent agents because rows are small, keyed, and offsets
/// only ever advance for a given identity (last writer wins).
#[derive(Debug)]
pub struct SinceDb {
    conn: Connection,
    write_interval: Duration,
    last_write: HashMap<String, Instant>,
}

impl SinceDb {
    pub fn open(path: &Path, write_interval: Duration) -> Result<Self, SinceDbError> {
        let conn = Connection::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sincedb (
                filename   TEXT PRIMARY KEY,
                identity   TEXT NOT NULL,
                offset     INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            (),
        )?;
        Ok(Self {
            conn,
            write_interval,
            last_write: HashMap::new(),
        })
    }

    /// Read-only lookup used when a tail opens its file.
    pub fn start_position(&self, filename: &str) -> Result<Option<(String, u64)>, SinceDbError> {
        let row = self
            .conn
            .query_row(
                "SELECT identity, offset FROM sincedb WHERE filename = ?1",
                params![filename],
                |row| {
                    let identity: String = row.get(0)?;
                    let offset: i64 = row.get(1)?;
                    Ok((identity, offset.max(0) as u64))
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Persist the position for `filename`. Unforced writes are throttled
    /// to one per `write_interval` per file; forced writes (close, flush,
    /// identity change) always land. Returns whether a write happened.
    pub fn update(
        &mut self,
        filename: &str,
        identity: &str,
        offset: u64,
        force: bool,
    ) -> Result<bool, SinceDbError> {
        let now = Instant::now();
        if !force {
            if let Some(last) = self.last_write.get(filename) {
                if now.duration_since(*last) < self.write_interval {
                    return Ok(false);
                }
            }
        }

        self.conn.execute(
            "INSERT INTO sincedb (filename, identity, offset, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(filename) DO UPDATE SET
                 identity = excluded.identity,
                 offset = excluded.offset,
                 updated_at = excluded.updated_at",
            params![
                filename,
                identity,
                offset as i64,
                chrono::Utc::now().timestamp()
            ],
        )?;
        self.last_write.insert(filename.to_string(), now);
        debug!(filename, identity, offset, "Position persisted");
        Ok(true)
    }

    pub fn remove(&mut self, filename: &str) -> Result<(), SinceDbError> {
        self.conn
            .execute("DELETE FROM sincedb WHERE filename = ?1", params![filename])?;
        self.last_write.remove(filename);
        Ok(())
    }
}
