//! storage layer for gitsql
//!
//! Git objects and references kept in SQL tables. Hosts talk to the two
//! backends through the [`ObjectBackend`] and [`RefBackend`] traits and never
//! see the connection underneath.
//!
//! # Architecture
//!
//! ```text
//!   ObjectBackend                          RefBackend
//!  ┌──────────────────────┐               ┌──────────────────────┐
//!  │   SqlObjectBackend   │               │    SqlRefBackend     │
//!  │ read / write / prefix│               │ lookup / write / glob│
//!  └──────────────────────┘               └──────────────────────┘
//!      │            │                          │
//!      │            ▼                          ▼
//!      │     ┌─────────────┐            ┌─────────────┐
//!      │     │ PackWriter  │            │ RefIterator │
//!      │     │  (staging)  │            │ (snapshot)  │
//!      │     └─────────────┘            └─────────────┘
//!      ▼            │                          │
//!  connection A ◄───┘                    connection B
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use git2::ObjectType;
//! use gitsql::db::{self, StoreConfig};
//! use gitsql::storage::{ObjectBackend, RefBackend, Reference};
//!
//! let config = StoreConfig::new("store.db");
//! let backends = db::open_or_create(&config)?;
//!
//! let oid = backends.odb.write(b"hello\n", ObjectType::Blob)?;
//! backends.refdb.write(&Reference::direct("refs/heads/main", oid), false)?;
//!
//! for reference in backends.refdb.iterate(Some("refs/heads/*"))? {
//!     println!("{reference}");
//! }
//! # Ok::<(), gitsql::storage::StorageError>(())
//! ```

pub(crate) mod column;
mod error;
mod iter;
mod odb;
mod pack;
mod refdb;
mod staging;
mod types;

pub use error::{StorageError, StoreResult};
pub use iter::RefIterator;
pub use odb::{ObjectBackend, SqlObjectBackend};
pub use pack::{ImportSummary, PackWriter, ProgressCallback, TransferProgress};
pub use refdb::{RefBackend, SqlRefBackend};
pub use types::{
    object_type_from_raw, object_type_to_raw, ObjectHeader, OidPrefix, RawObject, RefGlob,
    Reference, ReferenceTarget, OID_HEXSZ, OID_RAWSZ, REF_DIRECT, REF_SYMBOLIC,
};
