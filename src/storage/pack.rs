//! Bulk import of packfiles.
//!
//! A pack is streamed into an indexer that writes it, with its index, under a
//! private temporary directory. On commit the pack is opened as a throwaway
//! object database, every object in it is copied into the staging table, and
//! the staging table is merged into the object table in a single statement.
//! Until that statement runs, nothing is visible to readers.

use std::io::{self, Write};
use std::path::Path;

use git2::{Indexer, Odb, Oid, Progress};
use serde::Serialize;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::storage::error::{StorageError, StoreResult};
use crate::storage::odb::SqlObjectBackend;
use crate::storage::staging::StagingTable;

/// Callback receiving indexer progress. Returning false cancels the import.
pub type ProgressCallback<'a> = Box<dyn FnMut(&TransferProgress) -> bool + 'a>;

/// Indexer statistics, as reported while a pack is received.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransferProgress {
    pub total_objects: usize,
    pub indexed_objects: usize,
    pub received_objects: usize,
    pub local_objects: usize,
    pub total_deltas: usize,
    pub indexed_deltas: usize,
    pub received_bytes: usize,
}

impl From<&Progress<'_>> for TransferProgress {
    fn from(stats: &Progress<'_>) -> Self {
        Self {
            total_objects: stats.total_objects(),
            indexed_objects: stats.indexed_objects(),
            received_objects: stats.received_objects(),
            local_objects: stats.local_objects(),
            total_deltas: stats.total_deltas(),
            indexed_deltas: stats.indexed_deltas(),
            received_bytes: stats.received_bytes(),
        }
    }
}

/// Outcome of a committed import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    /// Checksum name of the pack, as computed by the indexer.
    pub pack_name: String,
    /// Objects found in the pack.
    pub objects: usize,
    /// Objects newly added to the object table.
    pub inserted: usize,
    /// Bytes of pack data received.
    pub received_bytes: usize,
}

/// A pack being received.
///
/// Feed it with [`append`](Self::append) or through `io::Write`, then call
/// [`commit`](Self::commit). Dropping the writer without committing discards
/// the pack and its temporary directory.
pub struct PackWriter<'a> {
    // must drop before `dir`, it holds files inside it open
    indexer: Indexer<'a>,
    backend: &'a SqlObjectBackend,
    dir: TempDir,
    received_bytes: usize,
    #[cfg(test)]
    fail_before_merge: bool,
}

impl<'a> PackWriter<'a> {
    pub(crate) fn new(
        backend: &'a SqlObjectBackend,
        progress: Option<ProgressCallback<'a>>,
    ) -> StoreResult<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("gitsql-import-");
        let dir = match backend.temp_dir() {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };
        let pack_dir = dir.path().join("pack");
        std::fs::create_dir(&pack_dir)?;

        let mut indexer = Indexer::new(None, &pack_dir, 0, false)?;
        if let Some(mut callback) = progress {
            indexer.progress(move |stats| callback(&TransferProgress::from(&stats)));
        }

        debug!(dir = %dir.path().display(), "bulk import started");
        Ok(Self {
            indexer,
            backend,
            dir,
            received_bytes: 0,
            #[cfg(test)]
            fail_before_merge: false,
        })
    }

    /// Feed the next chunk of pack data.
    pub fn append(&mut self, data: &[u8]) -> StoreResult<()> {
        self.indexer.write_all(data)?;
        self.received_bytes += data.len();
        Ok(())
    }

    /// Directory the pack is being written to.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    #[cfg(test)]
    pub(crate) fn fail_before_merge(&mut self) {
        self.fail_before_merge = true;
    }

    /// Finish the pack and publish its objects.
    ///
    /// Either every object of the pack ends up in the object table or, on
    /// error, none of them do.
    pub fn commit(self) -> StoreResult<ImportSummary> {
        #[cfg(test)]
        let fail_before_merge = self.fail_before_merge;
        #[cfg(not(test))]
        let fail_before_merge = false;

        let Self {
            indexer,
            backend,
            dir,
            received_bytes,
            ..
        } = self;

        let pack_name = indexer.commit()?;
        debug!(pack = %pack_name, received_bytes, "pack indexed");

        let (objects, inserted) = import_pack(backend, dir.path(), fail_before_merge)?;
        info!(pack = %pack_name, objects, inserted, "pack imported");

        if let Err(err) = dir.close() {
            warn!(%err, "failed to remove temporary pack directory");
        }
        Ok(ImportSummary {
            pack_name,
            objects,
            inserted,
            received_bytes,
        })
    }
}

impl Write for PackWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.indexer.write(buf)?;
        self.received_bytes += written;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Stage every object of the pack under `root` and merge. Returns the number
/// of objects seen and of rows added to the object table.
fn import_pack(
    backend: &SqlObjectBackend,
    root: &Path,
    fail_before_merge: bool,
) -> StoreResult<(usize, usize)> {
    let root = root.to_str().ok_or_else(|| {
        StorageError::InvalidConfig(format!("temporary directory {} is not UTF-8", root.display()))
    })?;
    let pack = Odb::new()?;
    pack.add_disk_alternate(root)?;

    backend.with_conn(|conn| {
        let staging = StagingTable::create(conn, backend.statements())?;

        let mut objects = 0usize;
        let mut failure = None;
        let walk = pack.foreach(|oid| match stage_object(&pack, &staging, backend, oid) {
            Ok(_) => {
                objects += 1;
                true
            }
            Err(err) => {
                failure = Some(err);
                false
            }
        });
        if let Some(err) = failure {
            return Err(err);
        }
        walk?;
        debug!(objects, "pack staged");

        if fail_before_merge {
            return Err(StorageError::Io(io::Error::other("injected failure before merge")));
        }

        let inserted = staging.merge()?;
        if let Err(err) = staging.drop_table() {
            warn!(%err, "failed to drop staging table");
        }
        Ok((objects, inserted))
    })
}

fn stage_object(
    pack: &Odb<'_>,
    staging: &StagingTable<'_>,
    backend: &SqlObjectBackend,
    oid: &Oid,
) -> StoreResult<bool> {
    let object = pack.read(*oid)?;
    let kind = object.kind();
    let data = object.data();
    if Oid::hash_object(kind, data)? != *oid {
        return Err(StorageError::Corrupt {
            oid: oid.to_string(),
            reason: "pack content does not hash to its id".to_string(),
        });
    }
    staging.stage(oid, kind, data, backend.compression())
}
