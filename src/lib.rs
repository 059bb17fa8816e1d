//! gitsql - git object and reference storage in SQLite
//!
//! This crate keeps a git object database and reference database in two
//! SQL tables. Objects are content-addressed and compressed; packs are
//! imported through a staging table so they appear all at once.
//!
//! # Example
//!
//! ```no_run
//! use gitsql::db::{self, StoreConfig};
//! use gitsql::storage::ObjectBackend;
//!
//! let backends = db::open_or_create(&StoreConfig::new("store.db")).unwrap();
//! let oid = backends.odb.write(b"hello\n", git2::ObjectType::Blob).unwrap();
//! assert!(backends.odb.exists(&oid).unwrap());
//! ```

pub mod db;
pub mod storage;
