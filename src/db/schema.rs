//! Table layout and the fixed set of prepared statements each backend uses.
//!
//! Table names come from configuration and cannot be bound as parameters, so
//! every statement is rendered once per backend from a validated name and then
//! handed to the connection's prepared-statement cache.

use rusqlite::Connection;

use crate::storage::{StorageError, StoreResult};

/// Suffix appended to the object table name for the bulk-import staging table.
pub const STAGING_SUFFIX: &str = "_staging";

/// Check that `name` is a plain identifier and return it double-quoted.
pub fn quote_ident(name: &str) -> StoreResult<String> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') || name.len() > 64 {
        return Err(StorageError::InvalidConfig(format!(
            "invalid table name: {name:?}"
        )));
    }
    Ok(format!("\"{name}\""))
}

/// DDL for the object table and its secondary indexes.
pub fn odb_table_ddl(table: &str) -> StoreResult<String> {
    let quoted = quote_ident(table)?;
    let type_index = quote_ident(&format!("{table}_type"))?;
    let size_index = quote_ident(&format!("{table}_size"))?;
    Ok(format!(
        "CREATE TABLE {quoted} (
            oid BLOB NOT NULL PRIMARY KEY,
            type INTEGER NOT NULL,
            size INTEGER NOT NULL,
            data BLOB NOT NULL
        );
        CREATE INDEX {type_index} ON {quoted} (type);
        CREATE INDEX {size_index} ON {quoted} (size);"
    ))
}

/// DDL for the reference table. Reference names are unique.
pub fn refdb_table_ddl(table: &str) -> StoreResult<String> {
    let quoted = quote_ident(table)?;
    let name_index = quote_ident(&format!("{table}_name"))?;
    Ok(format!(
        "CREATE TABLE {quoted} (
            refname TEXT NOT NULL,
            type INTEGER NOT NULL,
            oid BLOB,
            symref TEXT
        );
        CREATE UNIQUE INDEX {name_index} ON {quoted} (refname);"
    ))
}

/// Whether a table of this name exists in the main schema.
pub fn table_exists(conn: &Connection, table: &str) -> StoreResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Statements used by the object backend and its bulk import.
#[derive(Debug, Clone)]
pub struct OdbStatements {
    pub read: String,
    pub read_header: String,
    pub read_prefix: String,
    pub write: String,
    pub create_staging: String,
    pub stage: String,
    pub merge: String,
    pub drop_staging: String,
}

impl OdbStatements {
    pub fn new(table: &str) -> StoreResult<Self> {
        let t = quote_ident(table)?;
        let staging_name = format!("{table}{STAGING_SUFFIX}");
        let s = quote_ident(&staging_name)?;
        Ok(Self {
            read: format!("SELECT type, size, data FROM {t} WHERE oid = ?1"),
            read_header: format!("SELECT type, size FROM {t} WHERE oid = ?1"),
            read_prefix: format!(
                "SELECT oid FROM {t} \
                 WHERE oid >= ?1 AND (?2 IS NULL OR oid < ?2) ORDER BY oid LIMIT 2"
            ),
            write: format!(
                "INSERT OR IGNORE INTO {t} (oid, type, size, data) VALUES (?1, ?2, ?3, ?4)"
            ),
            create_staging: format!(
                "DROP TABLE IF EXISTS temp.{s};
                 CREATE TEMP TABLE {s} (
                    oid BLOB NOT NULL PRIMARY KEY,
                    type INTEGER NOT NULL,
                    size INTEGER NOT NULL,
                    data BLOB NOT NULL
                 );"
            ),
            stage: format!(
                "INSERT OR IGNORE INTO temp.{s} (oid, type, size, data) VALUES (?1, ?2, ?3, ?4)"
            ),
            merge: format!(
                "INSERT OR IGNORE INTO main.{t} (oid, type, size, data) \
                 SELECT oid, type, size, data FROM temp.{s}"
            ),
            drop_staging: format!("DROP TABLE IF EXISTS temp.{s}"),
        })
    }

    /// Prepare every statement against the object table so a broken schema
    /// fails at open time instead of on first use.
    pub fn prepare(&self, conn: &Connection) -> StoreResult<()> {
        for sql in [&self.read, &self.read_header, &self.read_prefix, &self.write] {
            conn.prepare_cached(sql)?;
        }
        Ok(())
    }
}

/// Statements used by the reference backend.
#[derive(Debug, Clone)]
pub struct RefdbStatements {
    pub lookup: String,
    pub write: String,
    pub delete: String,
    pub iterate: String,
}

impl RefdbStatements {
    pub fn new(table: &str) -> StoreResult<Self> {
        let t = quote_ident(table)?;
        Ok(Self {
            lookup: format!("SELECT type, oid, symref FROM {t} WHERE refname = ?1"),
            write: format!("INSERT INTO {t} (refname, type, oid, symref) VALUES (?1, ?2, ?3, ?4)"),
            delete: format!("DELETE FROM {t} WHERE refname = ?1"),
            iterate: format!(
                "SELECT refname, type, oid, symref FROM {t} \
                 WHERE refname LIKE ?1 ESCAPE '\\' AND refname GLOB ?2 ORDER BY refname"
            ),
        })
    }

    pub fn prepare(&self, conn: &Connection) -> StoreResult<()> {
        for sql in [&self.lookup, &self.write, &self.delete, &self.iterate] {
            conn.prepare_cached(sql)?;
        }
        Ok(())
    }
}
