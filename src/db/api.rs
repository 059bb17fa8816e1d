//! Store API - configuration and bootstrap.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use super::connection::{open_connection, ConnectionManager};
use super::schema::{self, OdbStatements, RefdbStatements};
use crate::storage::{SqlObjectBackend, SqlRefBackend, StorageError, StoreResult};

/// Default object table name.
pub const DEFAULT_ODB_TABLE: &str = "git2_odb";
/// Default reference table name.
pub const DEFAULT_REFDB_TABLE: &str = "git2_refdb";

/// Store configuration options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path to the database file.
    pub path: PathBuf,
    /// Create the database file if it doesn't exist.
    pub create_if_missing: bool,
    /// How long a statement waits on a locked database, in milliseconds.
    pub busy_timeout_ms: u64,
    /// Attempts made to reopen a broken connection.
    pub reconnect_attempts: u32,
    /// zlib level (0-9) for stored object payloads.
    pub compression_level: u32,
    /// Object table name.
    pub odb_table: String,
    /// Reference table name.
    pub refdb_table: String,
    /// Where bulk imports materialize their pack files.
    pub temp_dir: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("gitsql.db"),
            create_if_missing: true,
            busy_timeout_ms: 5_000,
            reconnect_attempts: 3,
            compression_level: 6,
            odb_table: DEFAULT_ODB_TABLE.to_string(),
            refdb_table: DEFAULT_REFDB_TABLE.to_string(),
            temp_dir: None,
        }
    }
}

impl StoreConfig {
    /// Create a new configuration with the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Build a configuration from `GITSQL_*` environment variables.
    ///
    /// `GITSQL_DATABASE` is required; `GITSQL_BUSY_TIMEOUT_MS` and
    /// `GITSQL_TEMP_DIR` are optional.
    pub fn from_env() -> StoreResult<Self> {
        let path = std::env::var_os("GITSQL_DATABASE").ok_or_else(|| {
            StorageError::InvalidConfig("GITSQL_DATABASE is not set".to_string())
        })?;
        let mut config = Self::new(path);
        if let Ok(timeout) = std::env::var("GITSQL_BUSY_TIMEOUT_MS") {
            config.busy_timeout_ms = timeout.parse().map_err(|_| {
                StorageError::InvalidConfig(format!("GITSQL_BUSY_TIMEOUT_MS: {timeout:?}"))
            })?;
        }
        if let Some(dir) = std::env::var_os("GITSQL_TEMP_DIR") {
            config.temp_dir = Some(PathBuf::from(dir));
        }
        Ok(config)
    }

    /// Set create_if_missing flag.
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Set the busy timeout.
    pub fn busy_timeout_ms(mut self, value: u64) -> Self {
        self.busy_timeout_ms = value;
        self
    }

    /// Set the number of reconnect attempts.
    pub fn reconnect_attempts(mut self, value: u32) -> Self {
        self.reconnect_attempts = value;
        self
    }

    /// Set the payload compression level.
    pub fn compression_level(mut self, value: u32) -> Self {
        self.compression_level = value;
        self
    }

    /// Use custom table names.
    pub fn tables(mut self, odb: impl Into<String>, refdb: impl Into<String>) -> Self {
        self.odb_table = odb.into();
        self.refdb_table = refdb.into();
        self
    }

    /// Set the directory for temporary pack files.
    pub fn temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    /// Check values that would otherwise fail later and less clearly.
    pub fn validate(&self) -> StoreResult<()> {
        if self.compression_level > 9 {
            return Err(StorageError::InvalidConfig(format!(
                "compression_level must be 0-9, got {}",
                self.compression_level
            )));
        }
        if self.reconnect_attempts == 0 {
            return Err(StorageError::InvalidConfig(
                "reconnect_attempts must be positive".to_string(),
            ));
        }
        if self.odb_table == self.refdb_table {
            return Err(StorageError::InvalidConfig(
                "object and reference tables must differ".to_string(),
            ));
        }
        schema::quote_ident(&self.odb_table)?;
        schema::quote_ident(&self.refdb_table)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// The two backends of one store, each on its own connection.
pub struct Backends {
    pub odb: SqlObjectBackend,
    pub refdb: SqlRefBackend,
}

/// Create both tables and the initial `HEAD` reference.
pub fn create(config: &StoreConfig) -> StoreResult<()> {
    config.validate()?;
    let mut conn = open_connection(config)?;

    if schema::table_exists(&conn, &config.odb_table)?
        || schema::table_exists(&conn, &config.refdb_table)?
    {
        return Err(StorageError::AlreadyInitialized(config.path.clone()));
    }

    let tx = conn.transaction()?;
    tx.execute_batch(&schema::odb_table_ddl(&config.odb_table)?)?;
    tx.execute_batch(&schema::refdb_table_ddl(&config.refdb_table)?)?;
    tx.execute(
        &RefdbStatements::new(&config.refdb_table)?.write,
        rusqlite::params![
            "HEAD",
            crate::storage::REF_SYMBOLIC,
            Option::<Vec<u8>>::None,
            "refs/heads/master"
        ],
    )?;
    tx.commit()?;

    info!(path = %config.path.display(), "created store");
    Ok(())
}

/// Open an existing store.
///
/// Each backend gets its own connection so that one can be dropped, or can
/// reconnect, without disturbing the other.
pub fn open(config: &StoreConfig) -> StoreResult<Backends> {
    config.validate()?;
    // opening must not leave an empty database file behind
    if !config.path.exists() {
        return Err(StorageError::NotInitialized(config.path.clone()));
    }

    let mut odb_conn = ConnectionManager::connect(config.clone(), "odb")?;
    let present = odb_conn.run(|conn| {
        Ok(schema::table_exists(conn, &config.odb_table)?
            && schema::table_exists(conn, &config.refdb_table)?)
    })?;
    if !present {
        return Err(StorageError::NotInitialized(config.path.clone()));
    }

    let refdb_conn = ConnectionManager::connect(config.clone(), "refdb")?;

    let odb = SqlObjectBackend::new(odb_conn, OdbStatements::new(&config.odb_table)?)?;
    let refdb = SqlRefBackend::new(refdb_conn, RefdbStatements::new(&config.refdb_table)?)?;

    info!(path = %config.path.display(), "opened store");
    Ok(Backends { odb, refdb })
}

/// Open a store, creating its tables first if they are missing.
pub fn open_or_create(config: &StoreConfig) -> StoreResult<Backends> {
    match open(config) {
        Err(StorageError::NotInitialized(_)) if config.create_if_missing => {
            create(config)?;
            open(config)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ObjectBackend, RefBackend, ReferenceTarget};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> StoreConfig {
        StoreConfig::new(dir.path().join("store.db"))
    }

    #[test]
    fn test_create_then_open() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        create(&config).unwrap();

        let backends = open(&config).unwrap();
        let head = backends.refdb.lookup("HEAD").unwrap();
        assert_eq!(
            head.target(),
            &ReferenceTarget::Symbolic("refs/heads/master".to_string())
        );
        assert!(!backends.odb.exists(&git2::Oid::zero()).unwrap());
    }

    #[test]
    fn test_open_without_tables_fails() {
        let dir = TempDir::new().unwrap();
        let result = open(&config(&dir));
        assert!(matches!(result, Err(StorageError::NotInitialized(_))));
        assert!(!dir.path().join("store.db").exists());
    }

    #[test]
    fn test_open_empty_file_fails() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        rusqlite::Connection::open(config.path()).unwrap();
        assert!(matches!(open(&config), Err(StorageError::NotInitialized(_))));
    }

    #[test]
    fn test_open_missing_file_without_create() {
        let dir = TempDir::new().unwrap();
        let result = open(&config(&dir).create_if_missing(false));
        assert!(matches!(result, Err(StorageError::NotInitialized(_))));
        assert!(!dir.path().join("store.db").exists());
    }

    #[test]
    fn test_create_twice_fails() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        create(&config).unwrap();
        assert!(matches!(
            create(&config),
            Err(StorageError::AlreadyInitialized(_))
        ));
    }

    #[test]
    fn test_open_or_create() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let first = open_or_create(&config).unwrap();
        let oid = first.odb.write(b"hello", git2::ObjectType::Blob).unwrap();
        drop(first);

        let second = open_or_create(&config).unwrap();
        assert!(second.odb.exists(&oid).unwrap());
    }

    #[test]
    fn test_custom_table_names() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir).tables("objects", "refs");
        create(&config).unwrap();
        let backends = open(&config).unwrap();
        assert!(backends.refdb.exists("HEAD").unwrap());
    }

    #[test]
    fn test_validate() {
        let dir = TempDir::new().unwrap();
        assert!(config(&dir).validate().is_ok());
        assert!(config(&dir).compression_level(10).validate().is_err());
        assert!(config(&dir).reconnect_attempts(0).validate().is_err());
        assert!(config(&dir).tables("same", "same").validate().is_err());
        assert!(config(&dir).tables("bad name", "refs").validate().is_err());
    }

    #[test]
    fn test_config_serde_defaults() {
        let config: StoreConfig = serde_json::from_str(r#"{"path": "/tmp/x.db"}"#).unwrap();
        assert_eq!(config.path, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.odb_table, DEFAULT_ODB_TABLE);
        assert_eq!(config.busy_timeout_ms, 5_000);
        assert!(config.create_if_missing);
    }
}
