//! Configuration, bootstrap and connection handling for the SQL side.

mod api;
mod connection;
pub(crate) mod schema;

pub use api::{
    create, open, open_or_create, Backends, StoreConfig, DEFAULT_ODB_TABLE, DEFAULT_REFDB_TABLE,
};
pub use connection::ConnectionManager;
pub(crate) use schema::{OdbStatements, RefdbStatements};
