//! Storage core: sessions, streams, and the schema manager
//!
//! Ingest flows client → session → write stream → schema manager (table
//! resolution) → insert buffer → transactional executor → store. Reads flow
//! through a read stream that fans one query across every capture table
//! whose catalog window intersects the requested range.

pub mod executor;
pub mod ops;
pub mod read;
pub mod schema;
pub mod session;
pub mod types;
pub mod write;

pub use executor::{DirectExecutor, SqlExecutor, TxExecutor, CTX_TIMEOUT};
pub use ops::{fill_template, DbOper, SqlDialect};
pub use read::{CaptureFilter, EntityFilter, ReadFilter, ReadStream, Record};
pub use schema::SchemaMgr;
pub use session::Session;
pub use types::{
    capture_table_name, capture_window, sanitize_ip, Capture, CaptureMessage, CollectorTable,
    Entity, Node, ENTITY_TABLE, MAIN_TABLE, NODE_TABLE,
};
pub use write::{WriteKind, WriteRequest, WriteStream, BUFFER_SIZE};
