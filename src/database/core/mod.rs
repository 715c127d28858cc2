//! Core database infrastructure
//!
//! Connection management and schema definitions shared by all repositories.

mod connection;
mod schema;

pub use connection::{DatabaseConn, SharedConn};
pub(crate) use connection::table_exists;
pub use schema::{SchemaDefinitions, SchemaManager, SchemaStatus, SCHEMA_VERSION};
