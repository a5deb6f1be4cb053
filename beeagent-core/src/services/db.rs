// src/services/db.rs
//! Shared SQLite connection setup for the stores.
//!
//! Every store owns exactly one connection behind a mutex. They all point at the
//! same database file, so WAL mode and the busy timeout are set on each one.

use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

/// Open/create the database file with WAL and a bounded busy wait.
///
/// `:memory:` is passed through untouched (no parent dir, no WAL).
pub fn open_connection(db_path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let in_memory = db_path.as_os_str() == ":memory:";
    if !in_memory {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
    }

    let conn = Connection::open(db_path)?;
    conn.busy_timeout(busy_timeout)?;
    if !in_memory {
        // journal_mode returns a row, so it cannot go through execute().
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |r| r.get(0))?;
    }
    Ok(conn)
}
