//! Variable-length column fetch.
//!
//! Column lengths are only known once a row has been stepped. Each helper
//! first probes the length the engine reports for the column, reserves an
//! exactly-sized buffer (failing with `OutOfMemory` rather than aborting), and
//! then copies the column into it.

use rusqlite::types::ValueRef;
use rusqlite::Row;

use crate::storage::error::{StorageError, StoreResult};

/// Reserve exactly `len` bytes.
pub(crate) fn sized_buffer(len: usize) -> StoreResult<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| StorageError::OutOfMemory { requested: len })?;
    Ok(buf)
}

/// Borrow the raw bytes of a text or blob column, `None` for SQL NULL.
fn column_bytes<'r>(row: &'r Row<'_>, idx: usize) -> StoreResult<Option<&'r [u8]>> {
    match row.get_ref(idx)? {
        ValueRef::Null => Ok(None),
        ValueRef::Blob(bytes) | ValueRef::Text(bytes) => Ok(Some(bytes)),
        other => Err(StorageError::InternalInconsistency(format!(
            "column {idx} holds {:?}, expected text or blob",
            other.data_type()
        ))),
    }
}

/// Length of a column in the current row, `None` for SQL NULL.
pub(crate) fn probe_len(row: &Row<'_>, idx: usize) -> StoreResult<Option<usize>> {
    Ok(column_bytes(row, idx)?.map(<[u8]>::len))
}

/// Fetch a nullable binary column into an owned, exactly-sized buffer.
pub(crate) fn fetch_var_column(row: &Row<'_>, idx: usize) -> StoreResult<Option<Vec<u8>>> {
    let Some(len) = probe_len(row, idx)? else {
        return Ok(None);
    };
    let mut buf = sized_buffer(len)?;
    let bytes = column_bytes(row, idx)?.unwrap_or_default();
    if bytes.len() != len {
        return Err(StorageError::InternalInconsistency(format!(
            "column {idx} changed length from {len} to {} during fetch",
            bytes.len()
        )));
    }
    buf.extend_from_slice(bytes);
    Ok(Some(buf))
}

/// Fetch a non-null binary column.
pub(crate) fn fetch_blob(row: &Row<'_>, idx: usize) -> StoreResult<Vec<u8>> {
    fetch_var_column(row, idx)?.ok_or_else(|| {
        StorageError::InternalInconsistency(format!("column {idx} is unexpectedly NULL"))
    })
}

/// Fetch a nullable text column.
pub(crate) fn fetch_opt_text(row: &Row<'_>, idx: usize) -> StoreResult<Option<String>> {
    fetch_var_column(row, idx)?
        .map(|bytes| {
            String::from_utf8(bytes).map_err(|e| {
                StorageError::InternalInconsistency(format!("column {idx} is not utf-8: {e}"))
            })
        })
        .transpose()
}

/// Fetch a non-null text column.
pub(crate) fn fetch_text(row: &Row<'_>, idx: usize) -> StoreResult<String> {
    fetch_opt_text(row, idx)?.ok_or_else(|| {
        StorageError::InternalInconsistency(format!("column {idx} is unexpectedly NULL"))
    })
}
