/// Database Utilities
///
/// Connection setup and retry logic for SQLite under concurrent readers
/// plus the single writer task.

use rusqlite::{Connection, ErrorCode, OpenFlags};
use std::time::Duration;

use crate::config;
use crate::metrics;

/// Open a connection with the pragmas every nodepulse connection runs with:
/// WAL journaling, `synchronous=NORMAL`, memory temp store, 32 MB mmap and a
/// generous busy timeout.
pub fn open_connection(db_path: &str, read_only: bool) -> rusqlite::Result<Connection> {
    let conn = if read_only {
        Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI,
        )?
    } else {
        Connection::open(db_path)?
    };

    if read_only {
        conn.execute_batch(
            "PRAGMA synchronous=NORMAL;
             PRAGMA cache_size=-64000;
             PRAGMA temp_store=MEMORY;
             PRAGMA mmap_size=33554432;
             PRAGMA busy_timeout=30000;",
        )?;
    } else {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA cache_size=-64000;
             PRAGMA temp_store=MEMORY;
             PRAGMA mmap_size=33554432;
             PRAGMA busy_timeout=30000;",
        )?;
    }
    Ok(conn)
}

/// True for the transient lock contention errors worth retrying
pub fn is_busy_error(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.code == ErrorCode::DatabaseBusy || e.code == ErrorCode::DatabaseLocked
        }
        _ => false,
    }
}

/// Run a database operation, retrying busy/locked errors with exponential
/// backoff (base 0.5 s, factor 2, capped). Integrity violations and other
/// operational errors propagate immediately.
pub fn with_retry<T, F>(mut op: F) -> rusqlite::Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    let max_attempts = config::db_max_retries().max(1);
    let max_delay = config::db_retry_max_delay_secs();
    let mut delay = config::db_retry_base_delay_secs();

    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if is_busy_error(&err) && attempt < max_attempts => {
                tracing::warn!(
                    attempt,
                    max_attempts,
                    "database busy, retrying in {:.2}s: {}",
                    delay,
                    err
                );
                metrics::DB_RETRIES.inc();
                std::thread::sleep(Duration::from_secs_f64(delay));
                delay = (delay * 2.0).min(max_delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_sets_wal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        let conn = open_connection(path.to_str().unwrap(), false).unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode;", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn test_with_retry_passes_through_success() {
        let result: rusqlite::Result<i32> = with_retry(|| Ok(7));
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn test_with_retry_propagates_non_busy_errors() {
        let mut calls = 0;
        let result: rusqlite::Result<()> = with_retry(|| {
            calls += 1;
            Err(rusqlite::Error::InvalidQuery)
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_is_busy_error() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(is_busy_error(&busy));
        assert!(!is_busy_error(&rusqlite::Error::InvalidQuery));
    }
}
