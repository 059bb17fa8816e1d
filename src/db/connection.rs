//! One persistent connection per backend, reopened after it breaks.

use std::time::Duration;

use rusqlite::{Connection, ErrorCode, OpenFlags};
use tracing::{debug, warn};

use super::api::StoreConfig;
use crate::storage::{StorageError, StoreResult};

/// Statements per connection are few and fixed; this leaves room for the
/// staging statements of a bulk import.
const STATEMENT_CACHE_CAPACITY: usize = 16;

/// Owns a backend's connection.
///
/// Operations borrow the connection through [`ConnectionManager::run`]. When
/// an operation fails with a connection-level error the connection is
/// discarded, and the next call opens a fresh one. Anything scoped to the old
/// connection (its statement cache, temporary tables) is gone with it.
pub struct ConnectionManager {
    config: StoreConfig,
    role: &'static str,
    conn: Option<Connection>,
    reconnects: u64,
}

impl ConnectionManager {
    /// Open the connection right away so a bad path fails at open time.
    pub fn connect(config: StoreConfig, role: &'static str) -> StoreResult<Self> {
        let conn = open_connection(&config)?;
        debug!(role, path = %config.path.display(), "connected");
        Ok(Self {
            config,
            role,
            conn: Some(conn),
            reconnects: 0,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Number of times the connection has been reopened.
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    /// Get the live connection, reopening it if the last one was dropped.
    pub fn get(&mut self) -> StoreResult<&Connection> {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => self.reconnect()?,
        };
        Ok(self.conn.insert(conn))
    }

    /// Run `f` against the connection.
    ///
    /// A connection-level failure drops the connection before the error is
    /// returned; the failed operation is not retried.
    pub fn run<T>(&mut self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let result = f(self.get()?);
        if let Err(err) = &result {
            if is_connection_error(err) {
                warn!(role = self.role, %err, "dropping broken connection");
                self.discard();
            }
        }
        result
    }

    /// Forget the current connection without closing it gracefully.
    pub fn discard(&mut self) {
        self.conn = None;
    }

    /// Close the connection, reporting close errors.
    pub fn close(mut self) -> StoreResult<()> {
        match self.conn.take() {
            Some(conn) => conn.close().map_err(|(_, err)| StorageError::Backend(err)),
            None => Ok(()),
        }
    }

    fn reconnect(&mut self) -> StoreResult<Connection> {
        let attempts = self.config.reconnect_attempts.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match open_connection(&self.config) {
                Ok(conn) => {
                    self.reconnects += 1;
                    warn!(role = self.role, attempt, "reconnected");
                    return Ok(conn);
                }
                Err(err) => {
                    warn!(role = self.role, attempt, %err, "reconnect failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            StorageError::InvalidConfig("reconnect_attempts must be positive".to_string())
        }))
    }
}

/// Open and configure a connection to the store file.
pub(crate) fn open_connection(config: &StoreConfig) -> StoreResult<Connection> {
    let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    if config.create_if_missing {
        flags |= OpenFlags::SQLITE_OPEN_CREATE;
    }

    let conn = Connection::open_with_flags(&config.path, flags).map_err(|err| {
        if is_cant_open(&err) {
            StorageError::NotInitialized(config.path.clone())
        } else {
            StorageError::Backend(err)
        }
    })?;
    conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
    conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);
    Ok(conn)
}

fn is_cant_open(err: &rusqlite::Error) -> bool {
    matches!(err.sqlite_error_code(), Some(ErrorCode::CannotOpen))
}

/// Errors after which the connection itself can no longer be trusted.
fn is_connection_error(err: &StorageError) -> bool {
    let StorageError::Backend(err) = err else {
        return false;
    };
    matches!(
        err.sqlite_error_code(),
        Some(
            ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::NotADatabase
                | ErrorCode::DatabaseCorrupt
                | ErrorCode::FileLockingProtocolFailed
        )
    )
}
