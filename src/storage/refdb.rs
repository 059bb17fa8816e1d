//! Named references on the reference table.

use parking_lot::Mutex;
use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use tracing::debug;

use crate::db::{ConnectionManager, RefdbStatements};
use crate::storage::column::{fetch_opt_text, fetch_text, fetch_var_column};
use crate::storage::error::{StorageError, StoreResult};
use crate::storage::iter::RefIterator;
use crate::storage::types::{RefGlob, Reference};

/// Reference storage as seen by the host.
pub trait RefBackend: Send + Sync {
    /// Whether a reference exists. Errors other than absence propagate.
    fn exists(&self, name: &str) -> StoreResult<bool>;

    fn lookup(&self, name: &str) -> StoreResult<Reference>;

    /// Snapshot every reference whose name matches `glob` (all of them when
    /// `None`), ordered by name.
    fn iterate(&self, glob: Option<&str>) -> StoreResult<RefIterator>;

    /// Store a reference. An existing reference of the same name is replaced
    /// only when `force` is set, otherwise this fails with `AlreadyExists`.
    fn write(&self, reference: &Reference, force: bool) -> StoreResult<()>;

    /// Remove a reference, failing with `NotFound` if there was none.
    fn delete(&self, name: &str) -> StoreResult<()>;
}

/// [`RefBackend`] on a SQL reference table.
pub struct SqlRefBackend {
    conn: Mutex<ConnectionManager>,
    statements: RefdbStatements,
}

impl SqlRefBackend {
    pub(crate) fn new(mut conn: ConnectionManager, statements: RefdbStatements) -> StoreResult<Self> {
        conn.run(|c| statements.prepare(c))?;
        Ok(Self {
            conn: Mutex::new(conn),
            statements,
        })
    }

    pub fn close(self) -> StoreResult<()> {
        self.conn.into_inner().close()
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        self.conn.lock().run(f)
    }
}

/// Look a reference up on `conn`, which may be inside a transaction.
fn lookup_on(
    conn: &Connection,
    statements: &RefdbStatements,
    name: &str,
) -> StoreResult<Reference> {
    let mut stmt = conn.prepare_cached(&statements.lookup)?;
    let mut rows = stmt.query([name])?;

    let Some(row) = rows.next()? else {
        return Err(StorageError::NotFound(name.to_string()));
    };
    let type_code: i64 = row.get(0)?;
    let oid = fetch_var_column(row, 1)?;
    let symref = fetch_opt_text(row, 2)?;

    if rows.next()?.is_some() {
        return Err(StorageError::inconsistency(format!(
            "more than one row for reference {name}"
        )));
    }
    Reference::from_columns(name.to_string(), type_code, oid.as_deref(), symref)
}

fn delete_on(conn: &Connection, statements: &RefdbStatements, name: &str) -> StoreResult<()> {
    let deleted = conn.prepare_cached(&statements.delete)?.execute([name])?;
    match deleted {
        0 => Err(StorageError::NotFound(name.to_string())),
        1 => Ok(()),
        n => Err(StorageError::inconsistency(format!(
            "deleting reference {name} removed {n} rows"
        ))),
    }
}

impl RefBackend for SqlRefBackend {
    fn exists(&self, name: &str) -> StoreResult<bool> {
        match self.lookup(name) {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn lookup(&self, name: &str) -> StoreResult<Reference> {
        self.with_conn(|conn| lookup_on(conn, &self.statements, name))
    }

    fn iterate(&self, glob: Option<&str>) -> StoreResult<RefIterator> {
        let glob = match glob {
            Some(glob) => RefGlob::new(glob)?,
            None => RefGlob::all(),
        };

        let refs = self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&self.statements.iterate)?;
            let mut rows = stmt.query(params![glob.to_like_pattern(), glob.to_glob_pattern()])?;
            let mut refs = Vec::new();
            while let Some(row) = rows.next()? {
                let name = fetch_text(row, 0)?;
                let type_code: i64 = row.get(1)?;
                let oid = fetch_var_column(row, 2)?;
                let symref = fetch_opt_text(row, 3)?;
                refs.push(Reference::from_columns(name, type_code, oid.as_deref(), symref)?);
            }
            Ok(refs)
        })?;

        debug!(%glob, matched = refs.len(), "references iterated");
        Ok(RefIterator::new(refs))
    }

    fn write(&self, reference: &Reference, force: bool) -> StoreResult<()> {
        let name = reference.name();
        if name.is_empty() {
            return Err(StorageError::InvalidSpec("empty reference name".to_string()));
        }
        let oid = reference.oid();
        let oid_bytes = oid.as_ref().map(|oid| oid.as_bytes());

        self.with_conn(|conn| {
            // IMMEDIATE takes the write lock up front, serializing writers of
            // the same name across connections.
            let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;

            match lookup_on(&tx, &self.statements, name) {
                Ok(_) if !force => return Err(StorageError::AlreadyExists(name.to_string())),
                Ok(_) => delete_on(&tx, &self.statements, name)?,
                Err(StorageError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }

            let inserted = tx.prepare_cached(&self.statements.write)?.execute(params![
                name,
                reference.type_code(),
                oid_bytes,
                reference.symbolic_target(),
            ])?;
            if inserted != 1 {
                return Err(StorageError::inconsistency(format!(
                    "writing reference {name} affected {inserted} rows"
                )));
            }
            tx.commit()?;
            Ok(())
        })?;

        debug!(%reference, force, "reference written");
        Ok(())
    }

    fn delete(&self, name: &str) -> StoreResult<()> {
        self.with_conn(|conn| delete_on(conn, &self.statements, name))?;
        debug!(name, "reference deleted");
        Ok(())
    }
}
