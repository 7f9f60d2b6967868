//! The schema reader: parses the system catalogue (`sqlite_master`, rooted
//! at page 1) into `TableInfo`/`IndexInfo`, using a minimal CREATE-TABLE /
//! CREATE-INDEX lexer for the declared column types the catalogue's `sql`
//! column carries as free text. Grounded on the teacher's `stored_db.rs`
//! (which walked the same catalogue rows) and, for the lexer, on the
//! pest-based approach in the teacher's (now-dropped) `pt_to_ast.rs` --
//! narrowed here to exactly the grammar in `create_table.pest` (spec §4.5:
//! "only column names, declared types, PRIMARY KEY, and NOT NULL are
//! recognised").

use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;

use crate::btree::cursor::Cursor;
use crate::error::{Error, Result};
use crate::page::{PageNum, PageSource};
use crate::value::Value;

#[derive(Parser)]
#[grammar = "create_table.pest"]
struct SchemaGrammar;

pub const SCHEMA_ROOT_PAGE: PageNum = 1;

#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: Option<String>,
    pub not_null: bool,
    /// 1-based rank among PRIMARY KEY columns in declaration order; `None`
    /// if this column isn't part of the primary key.
    pub primary_key_rank: Option<u32>,
    /// True for the single `INTEGER PRIMARY KEY` column that aliases the
    /// table's rowid (spec §4.5).
    pub is_rowid_alias: bool,
}

#[derive(Debug, Clone)]
pub struct TableInfo {
    pub name: String,
    pub root_page: PageNum,
    pub columns: Vec<ColumnInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone)]
pub struct IndexInfo {
    pub name: String,
    pub table_name: String,
    pub root_page: PageNum,
    pub columns: Vec<(String, SortOrder)>,
}

#[derive(Debug, Clone, Default)]
pub struct Schema {
    pub tables: Vec<TableInfo>,
    pub indexes: Vec<IndexInfo>,
}

impl Schema {
    pub fn table(&self, name: &str) -> Option<&TableInfo> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn index(&self, name: &str) -> Option<&IndexInfo> {
        self.indexes.iter().find(|i| i.name == name)
    }
}

/// Reads the whole catalogue by scanning a table-btree cursor rooted at
/// page 1. Catalogue rows are `(type, name, tbl_name, rootpage, sql)`.
pub fn read_schema<S: PageSource>(source: S) -> Result<Schema> {
    let mut cursor = Cursor::new(source, SCHEMA_ROOT_PAGE, true);
    let mut schema = Schema::default();
    while cursor.move_next()? {
        let kind = text_column(&cursor, 0)?;
        let name = text_column(&cursor, 1)?;
        let root_page = int_column(&cursor, 3)? as PageNum;
        let sql = text_column(&cursor, 4)?;

        match kind.as_deref() {
            Some("table") => {
                if let (Some(name), Some(sql)) = (name, sql) {
                    if let Some(table) = parse_create_table(&name, root_page, &sql)? {
                        schema.tables.push(table);
                    }
                }
            }
            Some("index") => {
                if let (Some(name), Some(sql)) = (name, sql) {
                    check_supported_collation(&sql)?;
                    let tbl_name = text_column(&cursor, 2)?.unwrap_or_default();
                    if let Some(index) = parse_create_index(&name, &tbl_name, root_page, &sql)? {
                        schema.indexes.push(index);
                    }
                }
            }
            _ => {}
        }
    }
    Ok(schema)
}

fn text_column<S: PageSource>(cursor: &Cursor<S>, i: usize) -> Result<Option<String>> {
    match cursor.column(i)? {
        Value::Text(bytes) => Ok(Some(
            std::str::from_utf8(bytes)
                .map_err(|_| Error::UnsupportedFeature("text_encoding:non-utf8".to_string()))?
                .to_string(),
        )),
        Value::Null => Ok(None),
        _ => Err(Error::InvalidState("expected TEXT column in catalogue row".to_string())),
    }
}

fn int_column<S: PageSource>(cursor: &Cursor<S>, i: usize) -> Result<i64> {
    match cursor.column(i)? {
        Value::Int(n) => Ok(n),
        other => Err(Error::InvalidState(format!("expected INTEGER column in catalogue row, got {other:?}"))),
    }
}

/// Parses one `CREATE TABLE` statement's `sql` text into a `TableInfo`.
/// Returns `Ok(None)` only in the unreachable case of an empty rule match;
/// malformed SQL is a hard parse error, since a catalogue with text that
/// doesn't even lex as a `CREATE TABLE` is itself corruption the caller
/// should see.
fn parse_create_table(name: &str, root_page: PageNum, sql: &str) -> Result<Option<TableInfo>> {
    let mut pairs = SchemaGrammar::parse(Rule::create_table, sql)
        .map_err(|e| Error::InvalidDatabase(format!("unparseable CREATE TABLE for {name}: {e}")))?;
    let create_table = pairs.next().expect("create_table rule always produces one pair");

    let mut columns = Vec::new();
    let mut pk_rank = 0u32;
    for inner in create_table.into_inner() {
        if inner.as_rule() == Rule::column_list {
            for column_def in inner.into_inner() {
                columns.push(parse_column_def(column_def, &mut pk_rank));
            }
        }
    }

    let single_int_pk = columns.iter().filter(|c| c.primary_key_rank.is_some()).count() == 1;
    for column in columns.iter_mut() {
        if single_int_pk
            && column.primary_key_rank.is_some()
            && column
                .declared_type
                .as_deref()
                .map(|t| t.eq_ignore_ascii_case("integer"))
                .unwrap_or(false)
        {
            column.is_rowid_alias = true;
        }
    }

    Ok(Some(TableInfo {
        name: name.to_string(),
        root_page,
        columns,
    }))
}

fn parse_column_def(pair: Pair<Rule>, pk_rank: &mut u32) -> ColumnInfo {
    let mut inner = pair.into_inner();
    let name = unquote(inner.next().expect("column_def always has an identifier").as_str());
    let mut declared_type = None;
    let mut not_null = false;
    let mut primary_key_rank = None;

    for part in inner {
        match part.as_rule() {
            Rule::type_name => declared_type = Some(normalize_whitespace(part.as_str())),
            Rule::column_constraint => {
                for constraint in part.into_inner() {
                    match constraint.as_rule() {
                        Rule::constraint_primary_key => {
                            *pk_rank += 1;
                            primary_key_rank = Some(*pk_rank);
                        }
                        Rule::constraint_not_null => not_null = true,
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    ColumnInfo {
        name,
        declared_type,
        not_null,
        primary_key_rank,
        is_rowid_alias: false,
    }
}

fn parse_create_index(name: &str, table_name: &str, root_page: PageNum, sql: &str) -> Result<Option<IndexInfo>> {
    let mut pairs = SchemaGrammar::parse(Rule::create_index, sql)
        .map_err(|e| Error::InvalidDatabase(format!("unparseable CREATE INDEX for {name}: {e}")))?;
    let create_index = pairs.next().expect("create_index rule always produces one pair");

    let mut columns = Vec::new();
    for inner in create_index.into_inner() {
        if inner.as_rule() == Rule::index_column_list {
            for index_column in inner.into_inner() {
                let mut parts = index_column.into_inner();
                let col_name = unquote(parts.next().expect("index_column always has an identifier").as_str());
                let order = parts
                    .next()
                    .filter(|p| p.as_rule() == Rule::sort_order)
                    .map(|p| {
                        if p.as_str().eq_ignore_ascii_case("desc") {
                            SortOrder::Desc
                        } else {
                            SortOrder::Asc
                        }
                    })
                    .unwrap_or(SortOrder::Asc);
                columns.push((col_name, order));
            }
        }
    }

    Ok(Some(IndexInfo {
        name: name.to_string(),
        table_name: table_name.to_string(),
        root_page,
        columns,
    }))
}

fn unquote(s: &str) -> String {
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s)
        .to_string()
}

fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Returns `UnsupportedFeature("collation")` if the `sql` text for an index
/// declares a non-BINARY collation -- spec §9 open question, resolved in
/// DESIGN.md to reject anything but BINARY.
pub fn check_supported_collation(sql: &str) -> Result<()> {
    let lower = sql.to_ascii_lowercase();
    if let Some(pos) = lower.find("collate") {
        let rest = lower[pos + "collate".len()..].trim_start();
        if !rest.starts_with("binary") {
            return Err(Error::UnsupportedFeature("collation".to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_simple_create_table() {
        let t = parse_create_table("t", 2, "CREATE TABLE t(x INTEGER)").unwrap().unwrap();
        assert_eq!(t.name, "t");
        assert_eq!(t.columns.len(), 1);
        assert_eq!(t.columns[0].name, "x");
        assert_eq!(t.columns[0].declared_type.as_deref(), Some("INTEGER"));
    }

    #[test]
    fn recognises_primary_key_and_not_null() {
        let t = parse_create_table(
            "u",
            3,
            "CREATE TABLE u(id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
        )
        .unwrap()
        .unwrap();
        assert_eq!(t.columns[0].primary_key_rank, Some(1));
        assert!(t.columns[0].is_rowid_alias);
        assert!(t.columns[1].not_null);
        assert!(t.columns[1].primary_key_rank.is_none());
    }

    #[test]
    fn ignores_unrecognised_constraints() {
        let t = parse_create_table(
            "v",
            4,
            "CREATE TABLE v(a INTEGER DEFAULT 0 CHECK(a > 0), b TEXT COLLATE NOCASE)",
        )
        .unwrap()
        .unwrap();
        assert_eq!(t.columns.len(), 2);
        assert_eq!(t.columns[0].name, "a");
        assert_eq!(t.columns[1].name, "b");
    }

    #[test]
    fn parses_quoted_identifiers() {
        let t = parse_create_table("\"weird name\"", 5, "CREATE TABLE \"weird name\"(\"col one\" TEXT)")
            .unwrap()
            .unwrap();
        assert_eq!(t.columns[0].name, "col one");
    }

    #[test]
    fn parses_create_index_with_sort_order() {
        let idx = parse_create_index("idx_name", "t", 6, "CREATE INDEX idx_name ON t(name DESC, id)")
            .unwrap()
            .unwrap();
        assert_eq!(idx.columns.len(), 2);
        assert_eq!(idx.columns[0], ("name".to_string(), SortOrder::Desc));
        assert_eq!(idx.columns[1], ("id".to_string(), SortOrder::Asc));
    }

    #[test]
    fn detects_non_binary_collation() {
        assert!(check_supported_collation("CREATE INDEX i ON t(a COLLATE NOCASE)").is_err());
        assert!(check_supported_collation("CREATE INDEX i ON t(a COLLATE BINARY)").is_ok());
        assert!(check_supported_collation("CREATE INDEX i ON t(a)").is_ok());
    }

    #[test]
    fn malformed_sql_is_invalid_database() {
        assert!(parse_create_table("broken", 1, "NOT EVEN SQL").is_err());
    }
}
