//! The L5 database handle: open options, schema access, and cursor
//! construction. Grounded on the teacher's `stored_db.rs` (the type that
//! owned the teacher's single `Pager` and schema map), generalized to hand
//! out one cloned pipeline per cursor instead of one shared pager (see
//! `crate::pipeline` module docs for why).

use std::sync::Arc;

use crate::btree::cursor::Cursor;
use crate::error::{Error, Result};
use crate::page::transform::{EncryptingTransform, IdentityTransform, PageTransform};
use crate::page::{FilePageSource, MemoryPageSource, PageSource};
use crate::pipeline::{build_pipeline, MaybeWal, Pipeline, RawSource};
use crate::schema::{read_schema, Schema, TableInfo};
use crate::value::{ColumnType, Value};
use crate::wal::WalOverlay;

/// How aggressively to look for a WAL file alongside the main database file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WalMode {
    /// Open the sibling `-wal` file if the header's read/write version says
    /// WAL mode is in effect (spec §4.6). Default.
    #[default]
    Auto,
    /// Never consult a WAL file, even if the header requests it; reads come
    /// from the main file only.
    ForceOff,
}

/// Open-time configuration (spec §6).
#[derive(Clone)]
pub struct OpenOptions {
    pub page_cache_size: usize,
    pub encryption_key: Option<Vec<u8>>,
    pub max_database_size: Option<u64>,
    pub text_encoding_override: Option<u32>,
    pub wal_mode: WalMode,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            page_cache_size: crate::page::cache::DEFAULT_CAPACITY,
            encryption_key: None,
            max_database_size: None,
            text_encoding_override: None,
            wal_mode: WalMode::Auto,
        }
    }
}

/// A read-only handle on a SQLite database image: either an on-disk file
/// (with an optional WAL overlay) or an in-memory buffer.
pub struct Database {
    raw: MaybeWal,
    transform: Arc<dyn PageTransform + Send + Sync>,
    cache_capacity: usize,
    schema: Schema,
    page_count: u32,
    disposed: bool,
}

impl Database {
    /// Opens a file on disk by path.
    pub fn open(path: &str, options: OpenOptions) -> Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let header_is_wal_mode = crate::header::FileHeader::read(&mut file)?.is_wal_mode();
        let main = FilePageSource::open(path)?;
        Self::open_raw(RawSource::File(main), header_is_wal_mode, path_wal_sibling(path), options)
    }

    /// Opens an already-loaded in-memory image. `wal_bytes`, if given, is
    /// treated as the contents of the sibling `-wal` file; it is only
    /// consulted when `data`'s own header declares WAL mode (spec §4.6
    /// "mode detection"), same as the on-disk path.
    pub fn open_memory(data: Vec<u8>, wal_bytes: Option<Vec<u8>>, options: OpenOptions) -> Result<Self> {
        let header_is_wal_mode = crate::header::FileHeader::read(&mut std::io::Cursor::new(&data))?.is_wal_mode();
        let main = MemoryPageSource::new(data)?;
        Self::open_raw(RawSource::Memory(main), header_is_wal_mode, wal_bytes, options)
    }

    fn open_raw(main: RawSource, header_is_wal_mode: bool, wal_bytes: Option<Vec<u8>>, options: OpenOptions) -> Result<Self> {
        if let Some(max) = options.max_database_size {
            let declared = main.page_size() as u64 * main.page_count() as u64;
            if declared > max {
                return Err(Error::InvalidDatabase(format!(
                    "database is {declared} bytes, exceeding max_database_size {max}"
                )));
            }
        }

        let raw = match (options.wal_mode, header_is_wal_mode, wal_bytes) {
            (WalMode::ForceOff, _, _) => MaybeWal::Plain(main),
            // A WAL file that exists but fails to parse is a hard open
            // failure (spec §4.6 "A WAL whose header is malformed fails
            // open with an 'invalid database' error"); a WAL file that
            // couldn't be read at all never reaches here -- `wal_bytes` is
            // already `None` for that case, handled by the arm below.
            (WalMode::Auto, true, Some(bytes)) => MaybeWal::Wal(WalOverlay::open(main.clone(), bytes)?),
            (WalMode::Auto, _, _) => MaybeWal::Plain(main),
        };

        let transform: Arc<dyn PageTransform + Send + Sync> = match &options.encryption_key {
            Some(key) => Arc::new(EncryptingTransform::from_passphrase(key)),
            None => Arc::new(IdentityTransform),
        };

        let mut database = Database {
            raw,
            transform,
            cache_capacity: options.page_cache_size,
            schema: Schema::default(),
            page_count: 0,
            disposed: false,
        };
        database.page_count = database.raw.page_count();
        database.schema = database.load_schema()?;
        Ok(database)
    }

    fn load_schema(&self) -> Result<Schema> {
        let pipeline = self.build_pipeline()?;
        read_schema(pipeline)
    }

    fn build_pipeline(&self) -> Result<Pipeline> {
        let raw = self.raw.try_clone()?;
        Ok(build_pipeline(raw, Arc::clone(&self.transform), self.cache_capacity))
    }

    fn check_disposed(&self) -> Result<()> {
        if self.disposed {
            return Err(Error::InvalidState("database handle is disposed".to_string()));
        }
        Ok(())
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn data_version(&self) -> u64 {
        self.raw.data_version()
    }

    /// Opens a fresh cursor over `table_name`'s rows, positioned at *Fresh*
    /// (spec §4.4). `projection`, if given, restricts `TableCursor::column`
    /// to the named columns, addressed by their position in the projection
    /// list rather than the table's declared order.
    pub fn open_cursor(&self, table_name: &str, projection: Option<&[&str]>) -> Result<TableCursor> {
        self.check_disposed()?;
        let table = self
            .schema
            .table(table_name)
            .ok_or_else(|| Error::InvalidState(format!("no such table: {table_name}")))?
            .clone();
        let projection = resolve_projection(&table, projection)?;
        let pipeline = self.build_pipeline()?;
        let cursor = Cursor::new(pipeline, table.root_page, true);
        Ok(TableCursor { cursor, table, projection })
    }

    /// Builds a `TableCursor` pre-positioned for reuse: same construction as
    /// `open_cursor`, callers reset and reseek it rather than reopening
    /// (spec §5 "prepared-reader pool").
    pub fn prepare_reader(&self, table_name: &str, projection: Option<&[&str]>) -> Result<TableCursor> {
        self.open_cursor(table_name, projection)
    }

    /// Releases this handle. Idempotent; cascades to the fact that any
    /// cursor built from this handle still holds its own cloned pipeline and
    /// keeps working independently -- the handle owns no shared state a
    /// disposed handle could invalidate out from under a live cursor.
    pub fn close(&mut self) {
        self.disposed = true;
    }
}

fn path_wal_sibling(path: &str) -> Option<Vec<u8>> {
    std::fs::read(format!("{path}-wal")).ok()
}

fn resolve_projection(table: &TableInfo, projection: Option<&[&str]>) -> Result<Vec<usize>> {
    match projection {
        None => Ok((0..table.columns.len()).collect()),
        Some(names) => names
            .iter()
            .map(|name| {
                table
                    .columns
                    .iter()
                    .position(|c| &c.name == name)
                    .ok_or_else(|| Error::InvalidState(format!("no such column: {name}")))
            })
            .collect(),
    }
}

/// A cursor over one table's rows, bound to a `TableInfo` and an optional
/// column projection. Thin wrapper around `btree::cursor::Cursor` that
/// applies the declared schema: column names/types, and the
/// `INTEGER PRIMARY KEY` rowid-alias substitution (spec's GLOSSARY entry
/// for "rowid alias" -- the stored column is NULL, the logical value is the
/// row's rowid).
pub struct TableCursor {
    cursor: Cursor<Pipeline>,
    table: TableInfo,
    projection: Vec<usize>,
}

impl TableCursor {
    pub fn move_next(&mut self) -> Result<bool> {
        self.cursor.move_next()
    }

    pub fn seek(&mut self, rowid: i64) -> Result<bool> {
        self.cursor.seek(rowid)
    }

    pub fn reset(&mut self) {
        self.cursor.reset();
    }

    pub fn rowid(&self) -> Result<i64> {
        self.cursor.rowid()
    }

    pub fn column_count(&self) -> usize {
        self.projection.len()
    }

    pub fn column_name(&self, i: usize) -> Result<&str> {
        let table_index = self.table_index(i)?;
        Ok(&self.table.columns[table_index].name)
    }

    fn table_index(&self, i: usize) -> Result<usize> {
        self.projection
            .get(i)
            .copied()
            .ok_or_else(|| Error::OutOfRange(format!("column index {i} outside projection of {} columns", self.projection.len())))
    }

    fn value(&self, i: usize) -> Result<Value<'_>> {
        let table_index = self.table_index(i)?;
        if self.table.columns[table_index].is_rowid_alias {
            return Ok(Value::Int(self.cursor.rowid()?));
        }
        self.cursor.column(table_index)
    }

    pub fn column_type(&self, i: usize) -> Result<ColumnType> {
        Ok(self.value(i)?.column_type())
    }

    pub fn is_null(&self, i: usize) -> Result<bool> {
        Ok(self.value(i)?.is_null())
    }

    pub fn int(&self, i: usize) -> Result<Option<i64>> {
        Ok(self.value(i)?.as_int())
    }

    pub fn real(&self, i: usize) -> Result<Option<f64>> {
        Ok(self.value(i)?.as_real())
    }

    pub fn blob(&self, i: usize) -> Result<Option<&[u8]>> {
        Ok(self.value(i)?.as_blob())
    }

    /// Returns the column's TEXT bytes decoded as UTF-8. Non-UTF-8 text
    /// under a UTF-16 header encoding is `UnsupportedFeature` (SPEC_FULL §F):
    /// this core only decodes UTF-8 text to `&str`.
    pub fn text(&self, i: usize) -> Result<Option<&str>> {
        match self.value(i)?.as_text() {
            Some(bytes) => std::str::from_utf8(bytes)
                .map(Some)
                .map_err(|_| Error::UnsupportedFeature("text_encoding:utf16".to_string())),
            None => Ok(None),
        }
    }
}
