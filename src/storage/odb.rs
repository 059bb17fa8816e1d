//! Content-addressed object storage on the object table.
//!
//! Payloads are zlib-compressed before they are bound and inflated after they
//! are fetched; the `size` column always holds the inflated length.

use std::io::{Read, Write};
use std::path::PathBuf;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use git2::{ObjectType, Oid};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::debug;

use crate::db::{ConnectionManager, OdbStatements};
use crate::storage::column::{fetch_blob, sized_buffer};
use crate::storage::error::{StorageError, StoreResult};
use crate::storage::pack::{PackWriter, ProgressCallback};
use crate::storage::types::{
    object_type_from_raw, object_type_to_raw, oid_from_column, ObjectHeader, OidPrefix,
    RawObject, OID_HEXSZ,
};

/// Object storage as seen by the host.
///
/// Implementations must be content-addressed: `write` derives the id from the
/// type and data, and writing the same object twice is a successful no-op.
pub trait ObjectBackend: Send + Sync {
    /// Type and size of an object.
    fn read_header(&self, oid: &Oid) -> StoreResult<ObjectHeader>;

    /// Type and inflated content of an object.
    fn read(&self, oid: &Oid) -> StoreResult<RawObject>;

    /// Resolve the first `nibbles` hex digits of `partial` to a single object.
    ///
    /// Fails with `Ambiguous` when several objects share the prefix. Odd
    /// nibble counts are rounded down to whole bytes.
    fn read_prefix(&self, partial: &Oid, nibbles: usize) -> StoreResult<(Oid, RawObject)>;

    /// Whether an object is stored. Absence is `Ok(false)`, not an error.
    fn exists(&self, oid: &Oid) -> StoreResult<bool>;

    /// Hash and store an object, returning its id.
    fn write(&self, data: &[u8], kind: ObjectType) -> StoreResult<Oid>;

    /// Start receiving a pack. Nothing becomes visible until the returned
    /// writer is committed.
    fn open_bulk_import<'a>(
        &'a self,
        progress: Option<ProgressCallback<'a>>,
    ) -> StoreResult<PackWriter<'a>>;
}

/// [`ObjectBackend`] on a SQL object table.
pub struct SqlObjectBackend {
    conn: Mutex<ConnectionManager>,
    statements: OdbStatements,
    compression: Compression,
    temp_dir: Option<PathBuf>,
}

impl SqlObjectBackend {
    /// Wrap a connection, preparing the backend's statements up front.
    pub(crate) fn new(mut conn: ConnectionManager, statements: OdbStatements) -> StoreResult<Self> {
        conn.run(|c| statements.prepare(c))?;
        let compression = Compression::new(conn.config().compression_level);
        let temp_dir = conn.config().temp_dir.clone();
        Ok(Self {
            conn: Mutex::new(conn),
            statements,
            compression,
            temp_dir,
        })
    }

    /// Run `f` with exclusive use of the backend's connection.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        self.conn.lock().run(f)
    }

    pub(crate) fn statements(&self) -> &OdbStatements {
        &self.statements
    }

    pub(crate) fn compression(&self) -> Compression {
        self.compression
    }

    pub(crate) fn temp_dir(&self) -> Option<&PathBuf> {
        self.temp_dir.as_ref()
    }

    /// Close the connection, reporting any error from doing so.
    pub fn close(self) -> StoreResult<()> {
        self.conn.into_inner().close()
    }

    /// Fetch type, size and still-compressed data of the single row for `oid`.
    fn fetch_row(&self, conn: &Connection, oid: &Oid) -> StoreResult<(ObjectType, u64, Vec<u8>)> {
        let mut stmt = conn.prepare_cached(&self.statements.read)?;
        let mut rows = stmt.query([oid.as_bytes()])?;

        let Some(row) = rows.next()? else {
            return Err(StorageError::NotFound(oid.to_string()));
        };
        let kind = object_type_from_raw(row.get(0)?)?;
        let size = size_from_column(row.get(1)?)?;
        let compressed = fetch_blob(row, 2)?;

        if rows.next()?.is_some() {
            return Err(StorageError::inconsistency(format!(
                "more than one row for object {oid}"
            )));
        }
        Ok((kind, size, compressed))
    }
}

impl ObjectBackend for SqlObjectBackend {
    fn read_header(&self, oid: &Oid) -> StoreResult<ObjectHeader> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&self.statements.read_header)?;
            let mut rows = stmt.query([oid.as_bytes()])?;

            let Some(row) = rows.next()? else {
                return Err(StorageError::NotFound(oid.to_string()));
            };
            let header = ObjectHeader {
                kind: object_type_from_raw(row.get(0)?)?,
                size: size_from_column(row.get(1)?)?,
            };

            if rows.next()?.is_some() {
                return Err(StorageError::inconsistency(format!(
                    "more than one row for object {oid}"
                )));
            }
            Ok(header)
        })
    }

    fn read(&self, oid: &Oid) -> StoreResult<RawObject> {
        let (kind, size, compressed) = self.with_conn(|conn| self.fetch_row(conn, oid))?;
        let data = inflate(&compressed, size, oid)?;
        Ok(RawObject::new(kind, data))
    }

    fn read_prefix(&self, partial: &Oid, nibbles: usize) -> StoreResult<(Oid, RawObject)> {
        let prefix = OidPrefix::new(partial, nibbles)?;
        if prefix.effective_nibbles() == OID_HEXSZ {
            let object = self.read(partial)?;
            return Ok((*partial, object));
        }

        let (oid, kind, size, compressed) = self.with_conn(|conn| {
            let oid = {
                let mut stmt = conn.prepare_cached(&self.statements.read_prefix)?;
                let mut rows =
                    stmt.query(params![prefix.lower_bound(), prefix.upper_bound()])?;

                let Some(row) = rows.next()? else {
                    return Err(StorageError::NotFound(format!("prefix {prefix}")));
                };
                let oid = oid_from_column(&fetch_blob(row, 0)?)?;

                if rows.next()?.is_some() {
                    return Err(StorageError::Ambiguous {
                        prefix: prefix.to_string(),
                        nibbles: prefix.nibbles(),
                    });
                }
                oid
            };
            let (kind, size, compressed) = self.fetch_row(conn, &oid)?;
            Ok((oid, kind, size, compressed))
        })?;

        let data = inflate(&compressed, size, &oid)?;
        Ok((oid, RawObject::new(kind, data)))
    }

    fn exists(&self, oid: &Oid) -> StoreResult<bool> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&self.statements.read_header)?;
            let mut rows = stmt.query([oid.as_bytes()])?;
            let mut found = 0usize;
            while rows.next()?.is_some() {
                found += 1;
            }
            match found {
                0 => Ok(false),
                1 => Ok(true),
                n => Err(StorageError::inconsistency(format!(
                    "{n} rows for object {oid}"
                ))),
            }
        })
    }

    fn write(&self, data: &[u8], kind: ObjectType) -> StoreResult<Oid> {
        let type_code = object_type_to_raw(kind)?;
        let oid = Oid::hash_object(kind, data)?;
        let compressed = deflate(data, self.compression)?;

        let inserted = self.with_conn(|conn| {
            insert_object(conn, &self.statements.write, &oid, type_code, data.len(), &compressed)
        })?;

        match inserted {
            0 => debug!(%oid, "object already stored"),
            1 => debug!(%oid, size = data.len(), "object written"),
            n => {
                return Err(StorageError::inconsistency(format!(
                    "writing object {oid} affected {n} rows"
                )))
            }
        }
        Ok(oid)
    }

    fn open_bulk_import<'a>(
        &'a self,
        progress: Option<ProgressCallback<'a>>,
    ) -> StoreResult<PackWriter<'a>> {
        PackWriter::new(self, progress)
    }
}

/// Bind one object row into `sql` (an `INSERT OR IGNORE`) and return the
/// affected row count.
pub(crate) fn insert_object(
    conn: &Connection,
    sql: &str,
    oid: &Oid,
    type_code: u8,
    size: usize,
    compressed: &[u8],
) -> StoreResult<usize> {
    let size = i64::try_from(size).map_err(|_| {
        StorageError::InvalidSpec(format!("object {oid} is too large to store ({size} bytes)"))
    })?;
    let mut stmt = conn.prepare_cached(sql)?;
    Ok(stmt.execute(params![oid.as_bytes(), type_code, size, compressed])?)
}

fn size_from_column(raw: i64) -> StoreResult<u64> {
    u64::try_from(raw)
        .map_err(|_| StorageError::InternalInconsistency(format!("negative object size {raw}")))
}

pub(crate) fn deflate(data: &[u8], level: Compression) -> StoreResult<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2 + 64), level);
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Inflate a stored payload into a buffer sized from the `size` column.
pub(crate) fn inflate(compressed: &[u8], size: u64, oid: &Oid) -> StoreResult<Vec<u8>> {
    let len = usize::try_from(size).map_err(|_| StorageError::OutOfMemory {
        requested: usize::MAX,
    })?;
    let mut data = sized_buffer(len)?;
    ZlibDecoder::new(compressed)
        .take(size.saturating_add(1))
        .read_to_end(&mut data)
        .map_err(|e| StorageError::Corrupt {
            oid: oid.to_string(),
            reason: e.to_string(),
        })?;

    if data.len() != len {
        return Err(StorageError::Corrupt {
            oid: oid.to_string(),
            reason: format!("inflated to {} bytes, size column says {len}", data.len()),
        });
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{self, StoreConfig};
    use tempfile::TempDir;

    fn setup() -> (TempDir, SqlObjectBackend) {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::new(dir.path().join("store.db"));
        db::create(&config).unwrap();
        let backends = db::open(&config).unwrap();
        (dir, backends.odb)
    }

    /// Find two blobs whose ids share the first byte but differ in the second.
    fn colliding_blobs() -> (Vec<u8>, Oid, Vec<u8>, Oid) {
        let mut seen: std::collections::HashMap<u8, (Vec<u8>, Oid)> = Default::default();
        for i in 0u32.. {
            let data = format!("blob number {i}\n").into_bytes();
            let oid = Oid::hash_object(ObjectType::Blob, &data).unwrap();
            let first = oid.as_bytes()[0];
            if let Some((other_data, other_oid)) = seen.get(&first) {
                if other_oid.as_bytes()[1] != oid.as_bytes()[1] {
                    return (other_data.clone(), *other_oid, data, oid);
                }
            } else {
                seen.insert(first, (data, oid));
            }
        }
        unreachable!()
    }

    #[test]
    fn test_write_read_roundtrip() {
        let (_dir, odb) = setup();
        let oid = odb.write(b"hello world\n", ObjectType::Blob).unwrap();
        assert_eq!(oid, Oid::hash_object(ObjectType::Blob, b"hello world\n").unwrap());

        let object = odb.read(&oid).unwrap();
        assert_eq!(object.kind, ObjectType::Blob);
        assert_eq!(object.data, b"hello world\n");
        assert_eq!(object.size(), 12);

        let header = odb.read_header(&oid).unwrap();
        assert_eq!(header, ObjectHeader { kind: ObjectType::Blob, size: 12 });
    }

    #[test]
    fn test_write_is_idempotent() {
        let (_dir, odb) = setup();
        let first = odb.write(b"same content", ObjectType::Blob).unwrap();
        let second = odb.write(b"same content", ObjectType::Blob).unwrap();
        assert_eq!(first, second);

        let rows: i64 = odb
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT count(*) FROM git2_odb", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_type_is_part_of_the_id() {
        let (_dir, odb) = setup();
        let blob = odb.write(b"payload", ObjectType::Blob).unwrap();
        let tag = odb.write(b"payload", ObjectType::Tag).unwrap();
        assert_ne!(blob, tag);
        assert_eq!(odb.read(&tag).unwrap().kind, ObjectType::Tag);
    }

    #[test]
    fn test_large_binary_payload() {
        let (_dir, odb) = setup();
        let mut data = vec![0u8; 3 * 1024 * 1024];
        for (i, byte) in data.iter_mut().enumerate().step_by(7) {
            *byte = (i % 251) as u8;
        }
        let oid = odb.write(&data, ObjectType::Blob).unwrap();
        let object = odb.read(&oid).unwrap();
        assert_eq!(object.data.len(), data.len());
        assert_eq!(object.data, data);
    }

    #[test]
    fn test_empty_object() {
        let (_dir, odb) = setup();
        let oid = odb.write(b"", ObjectType::Blob).unwrap();
        assert_eq!(oid.to_string(), "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391");
        assert!(odb.read(&oid).unwrap().data.is_empty());
    }

    #[test]
    fn test_missing_object() {
        let (_dir, odb) = setup();
        let oid = Oid::hash_object(ObjectType::Blob, b"never written").unwrap();
        assert!(matches!(odb.read(&oid), Err(StorageError::NotFound(_))));
        assert!(matches!(odb.read_header(&oid), Err(StorageError::NotFound(_))));
        assert!(!odb.exists(&oid).unwrap());
    }

    #[test]
    fn test_any_type_rejected() {
        let (_dir, odb) = setup();
        assert!(matches!(
            odb.write(b"x", ObjectType::Any),
            Err(StorageError::InvalidSpec(_))
        ));
    }

    #[test]
    fn test_read_prefix_unique_and_ambiguous() {
        let (_dir, odb) = setup();
        let (data_a, oid_a, data_b, oid_b) = colliding_blobs();
        odb.write(&data_a, ObjectType::Blob).unwrap();
        odb.write(&data_b, ObjectType::Blob).unwrap();

        let result = odb.read_prefix(&oid_a, 2);
        assert!(matches!(result, Err(StorageError::Ambiguous { nibbles: 2, .. })));

        let (found, object) = odb.read_prefix(&oid_a, 4).unwrap();
        assert_eq!(found, oid_a);
        assert_eq!(object.data, data_a);

        let (found, _) = odb.read_prefix(&oid_b, 4).unwrap();
        assert_eq!(found, oid_b);
    }

    #[test]
    fn test_read_prefix_odd_nibbles_truncate() {
        let (_dir, odb) = setup();
        let (data_a, oid_a, data_b, _) = colliding_blobs();
        odb.write(&data_a, ObjectType::Blob).unwrap();
        odb.write(&data_b, ObjectType::Blob).unwrap();

        // three digits compare as two, which both objects share
        assert!(matches!(
            odb.read_prefix(&oid_a, 3),
            Err(StorageError::Ambiguous { nibbles: 3, .. })
        ));
        let (found, _) = odb.read_prefix(&oid_a, 5).unwrap();
        assert_eq!(found, oid_a);
    }

    #[test]
    fn test_read_prefix_not_found_and_full_length() {
        let (_dir, odb) = setup();
        let oid = odb.write(b"only object", ObjectType::Blob).unwrap();

        let mut other = oid.as_bytes().to_vec();
        other[0] = other[0].wrapping_add(1);
        let other = Oid::from_bytes(&other).unwrap();
        assert!(matches!(odb.read_prefix(&other, 8), Err(StorageError::NotFound(_))));

        let (found, object) = odb.read_prefix(&oid, OID_HEXSZ).unwrap();
        assert_eq!(found, oid);
        assert_eq!(object.data, b"only object");
        assert!(matches!(odb.read_prefix(&oid, 0), Err(StorageError::InvalidSpec(_))));
    }

    #[test]
    fn test_prefix_bytes_are_not_wildcards() {
        let (_dir, odb) = setup();
        // 0x25 is '%' and 0x5f is '_' in ASCII
        let mut found = None;
        for i in 0u32.. {
            let data = format!("wildcard probe {i}").into_bytes();
            let oid = Oid::hash_object(ObjectType::Blob, &data).unwrap();
            if oid.as_bytes()[0] == 0x25 || oid.as_bytes()[0] == 0x5f {
                found = Some((data, oid));
                break;
            }
        }
        let (data, oid) = found.unwrap();
        odb.write(&data, ObjectType::Blob).unwrap();
        odb.write(b"some other object", ObjectType::Blob).unwrap();

        let (resolved, _) = odb.read_prefix(&oid, 8).unwrap();
        assert_eq!(resolved, oid);
    }

    #[test]
    fn test_corrupt_payload_detected() {
        let (_dir, odb) = setup();
        let oid = odb.write(b"will be damaged", ObjectType::Blob).unwrap();
        odb.with_conn(|conn| {
            conn.execute(
                "UPDATE git2_odb SET size = size + 5 WHERE oid = ?1",
                [oid.as_bytes()],
            )?;
            Ok(())
        })
        .unwrap();
        assert!(matches!(odb.read(&oid), Err(StorageError::Corrupt { .. })));
    }

    #[test]
    fn test_duplicate_rows_are_reported() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::new(dir.path().join("store.db"));
        let conn = Connection::open(&config.path).unwrap();
        // no primary key, so duplicates can be planted
        conn.execute_batch(
            "CREATE TABLE git2_odb (oid BLOB, type INTEGER, size INTEGER, data BLOB);
             CREATE TABLE git2_refdb (refname TEXT, type INTEGER, oid BLOB, symref TEXT);",
        )
        .unwrap();
        let oid = Oid::hash_object(ObjectType::Blob, b"dup").unwrap();
        let compressed = deflate(b"dup", Compression::default()).unwrap();
        for _ in 0..2 {
            conn.execute(
                "INSERT INTO git2_odb VALUES (?1, 3, 3, ?2)",
                params![oid.as_bytes(), compressed],
            )
            .unwrap();
        }
        drop(conn);

        let odb = db::open(&config).unwrap().odb;
        assert!(matches!(odb.read(&oid), Err(StorageError::InternalInconsistency(_))));
        assert!(matches!(
            odb.read_header(&oid),
            Err(StorageError::InternalInconsistency(_))
        ));
        assert!(matches!(odb.exists(&oid), Err(StorageError::InternalInconsistency(_))));

        // the statement was reset, so the backend is still usable
        let other = odb.write(b"fine", ObjectType::Blob).unwrap();
        assert!(odb.exists(&other).unwrap());
    }

    #[test]
    fn test_usable_through_trait_object() {
        let (_dir, odb) = setup();
        let backend: Box<dyn ObjectBackend> = Box::new(odb);
        let oid = backend.write(b"dyn", ObjectType::Blob).unwrap();
        assert!(backend.exists(&oid).unwrap());
    }

    #[test]
    fn test_inflate_rejects_garbage() {
        let oid = Oid::zero();
        assert!(matches!(
            inflate(b"not zlib at all", 15, &oid),
            Err(StorageError::Corrupt { .. })
        ));
        let compressed = deflate(b"four", Compression::default()).unwrap();
        assert!(matches!(inflate(&compressed, 3, &oid), Err(StorageError::Corrupt { .. })));
        assert_eq!(inflate(&compressed, 4, &oid).unwrap(), b"four");
    }
}
