//! Connection-scoped staging table used by bulk imports.

use flate2::Compression;
use git2::{ObjectType, Oid};
use rusqlite::Connection;
use tracing::{debug, warn};

use crate::db::OdbStatements;
use crate::storage::error::{StorageError, StoreResult};
use crate::storage::odb::{deflate, insert_object};
use crate::storage::types::object_type_to_raw;

/// A temporary table holding objects until they are merged into the object
/// table with one statement.
///
/// The table lives on the connection that created it and is invisible to
/// every other connection. It is dropped when this guard goes out of scope,
/// whether or not the merge ran.
pub(crate) struct StagingTable<'c> {
    conn: &'c Connection,
    statements: &'c OdbStatements,
    live: bool,
}

impl<'c> StagingTable<'c> {
    /// Create the staging table, replacing any left behind by an earlier
    /// import on this connection.
    pub(crate) fn create(conn: &'c Connection, statements: &'c OdbStatements) -> StoreResult<Self> {
        conn.execute_batch(&statements.create_staging)?;
        debug!("staging table created");
        Ok(Self {
            conn,
            statements,
            live: true,
        })
    }

    /// Add one object. Returns false if it was already staged.
    pub(crate) fn stage(
        &self,
        oid: &Oid,
        kind: ObjectType,
        data: &[u8],
        level: Compression,
    ) -> StoreResult<bool> {
        let type_code = object_type_to_raw(kind)?;
        let compressed = deflate(data, level)?;
        match insert_object(
            self.conn,
            &self.statements.stage,
            oid,
            type_code,
            data.len(),
            &compressed,
        )? {
            0 => Ok(false),
            1 => Ok(true),
            n => Err(StorageError::inconsistency(format!(
                "staging object {oid} affected {n} rows"
            ))),
        }
    }

    /// Copy staged objects into the object table, skipping ids already
    /// there. Returns the number of new rows.
    pub(crate) fn merge(&self) -> StoreResult<usize> {
        Ok(self.conn.execute(&self.statements.merge, [])?)
    }

    pub(crate) fn drop_table(mut self) -> StoreResult<()> {
        self.live = false;
        self.conn.execute_batch(&self.statements.drop_staging)?;
        debug!("staging table dropped");
        Ok(())
    }
}

impl Drop for StagingTable<'_> {
    fn drop(&mut self) {
        if self.live {
            if let Err(err) = self.conn.execute_batch(&self.statements.drop_staging) {
                warn!(%err, "failed to drop staging table");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::odb_table_ddl;

    fn setup() -> (Connection, OdbStatements) {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(&odb_table_ddl("git2_odb").unwrap()).unwrap();
        (conn, OdbStatements::new("git2_odb").unwrap())
    }

    fn staging_exists(conn: &Connection) -> bool {
        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_temp_master WHERE name = 'git2_odb_staging'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        count > 0
    }

    fn main_rows(conn: &Connection) -> i64 {
        conn.query_row("SELECT count(*) FROM git2_odb", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_stage_merge_and_drop() {
        let (conn, statements) = setup();
        let data = b"staged blob";
        let oid = Oid::hash_object(ObjectType::Blob, data).unwrap();

        let staging = StagingTable::create(&conn, &statements).unwrap();
        assert!(staging.stage(&oid, ObjectType::Blob, data, Compression::default()).unwrap());
        assert!(!staging.stage(&oid, ObjectType::Blob, data, Compression::default()).unwrap());
        assert_eq!(main_rows(&conn), 0);

        assert_eq!(staging.merge().unwrap(), 1);
        assert_eq!(main_rows(&conn), 1);

        staging.drop_table().unwrap();
        assert!(!staging_exists(&conn));
    }

    #[test]
    fn test_merge_skips_existing_rows() {
        let (conn, statements) = setup();
        let data = b"already there";
        let oid = Oid::hash_object(ObjectType::Blob, data).unwrap();
        let compressed = deflate(data, Compression::default()).unwrap();
        insert_object(&conn, &statements.write, &oid, 3, data.len(), &compressed).unwrap();

        let staging = StagingTable::create(&conn, &statements).unwrap();
        staging.stage(&oid, ObjectType::Blob, data, Compression::default()).unwrap();
        assert_eq!(staging.merge().unwrap(), 0);
        assert_eq!(main_rows(&conn), 1);
    }

    #[test]
    fn test_dropped_guard_removes_table() {
        let (conn, statements) = setup();
        {
            let staging = StagingTable::create(&conn, &statements).unwrap();
            let oid = Oid::hash_object(ObjectType::Blob, b"x").unwrap();
            staging.stage(&oid, ObjectType::Blob, b"x", Compression::fast()).unwrap();
            assert!(staging_exists(&conn));
        }
        assert!(!staging_exists(&conn));
        assert_eq!(main_rows(&conn), 0);
    }

    #[test]
    fn test_create_replaces_leftover_table() {
        let (conn, statements) = setup();
        conn.execute_batch(&statements.create_staging).unwrap();
        let oid = Oid::hash_object(ObjectType::Blob, b"left").unwrap();
        let compressed = deflate(b"left", Compression::default()).unwrap();
        insert_object(&conn, &statements.stage, &oid, 3, 4, &compressed).unwrap();

        let staging = StagingTable::create(&conn, &statements).unwrap();
        assert_eq!(staging.merge().unwrap(), 0);
    }
}
