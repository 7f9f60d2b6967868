//! A read-only SQLite file format engine: paged I/O with an LRU cache, a
//! B-tree reader/cursor, the record/serial-type codec, a schema reader, and
//! a WAL overlay. No SQL execution engine and no write path; see
//! `database::Database` for the handle-level entry point.

pub mod btree;
pub mod database;
pub mod error;
pub mod header;
pub mod page;
pub mod pipeline;
pub mod record;
pub mod schema;
pub mod serial_type;
pub mod value;
pub mod varint;
pub mod wal;

pub use database::{Database, OpenOptions, TableCursor, WalMode};
pub use error::{Error, Result};
pub use header::FileHeader;
pub use schema::{ColumnInfo, IndexInfo, Schema, SortOrder, TableInfo};
pub use value::{ColumnType, Value};
