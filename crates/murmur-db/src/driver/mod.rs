//! Storage driver abstraction.
//!
//! The substrate talks to an abstract row-oriented store. Backends implement
//! [`StorageDriver`] (a connection factory) and [`StorageConnection`] (query
//! execution, prepared statements, transactions). Results come back as the
//! concrete textual [`Rows`] type: every cell is an optional string the way
//! wire-level text protocols deliver them, and the typed accessors on
//! [`RowView`] do the parsing repositories need.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::{MemoryDriver, MemoryStore};
#[cfg(feature = "postgres")]
pub use postgres::PostgresDriver;

use async_trait::async_trait;
use murmur_error::StoreError;
use serde::{Deserialize, Serialize};

use crate::conninfo::ConnectionInfo;

/// Classification of a statement, used for caching and monitoring decisions.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryKind {
    /// Plain read.
    Select,
    /// Row insertion (including upserts).
    Insert,
    /// Row mutation.
    Update,
    /// Row removal.
    Delete,
    /// Table truncation.
    Truncate,
    /// Anything else (DDL, SET, ...).
    Other,
}

impl QueryKind {
    /// Get the kind as an uppercase SQL verb.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Select => "SELECT",
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Truncate => "TRUNCATE",
            Self::Other => "OTHER",
        }
    }

    /// Whether this kind mutates data. Write kinds are never cached and
    /// invalidate the affected table on success.
    #[must_use]
    pub const fn is_write(&self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Delete | Self::Truncate)
    }

    /// Whether results of this kind may be cached.
    #[must_use]
    pub const fn is_read_like(&self) -> bool {
        !self.is_write()
    }
}

impl std::fmt::Display for QueryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A result set in textual form.
///
/// Cells are `Option<String>`: `None` is SQL NULL, everything else is the
/// backend's text rendering. Cheap to share behind an `Arc` on cache hits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rows {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
    rows_affected: u64,
}

impl Rows {
    /// Build a result set. Row widths are trusted to match `columns`.
    #[must_use]
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Option<String>>>, rows_affected: u64) -> Self {
        Self {
            columns,
            rows,
            rows_affected,
        }
    }

    /// Empty result with only an affected-row count (writes).
    #[must_use]
    pub fn affected(rows_affected: u64) -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            rows_affected,
        }
    }

    /// Column names in result order.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Number of data rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether there are no data rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows affected by a write, as reported by the backend.
    #[must_use]
    pub const fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    /// View of one row; `None` past the end.
    #[must_use]
    pub fn row(&self, index: usize) -> Option<RowView<'_>> {
        self.rows.get(index).map(|values| RowView {
            columns: &self.columns,
            values,
        })
    }

    /// Iterate over row views.
    pub fn iter(&self) -> impl Iterator<Item = RowView<'_>> {
        self.rows.iter().map(|values| RowView {
            columns: &self.columns,
            values,
        })
    }

    /// Approximate size of the payload in bytes, used for cache
    /// admission and memory accounting.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        let header: usize = self.columns.iter().map(String::len).sum();
        let cells: usize = self
            .rows
            .iter()
            .flatten()
            .map(|cell| cell.as_ref().map_or(1, String::len))
            .sum();
        header + cells
    }
}

/// Column lookup by name or positional index.
pub trait ColumnKey {
    /// Resolve to a column index, if present.
    fn resolve(&self, columns: &[String]) -> Option<usize>;
}

impl ColumnKey for usize {
    fn resolve(&self, columns: &[String]) -> Option<usize> {
        (*self < columns.len()).then_some(*self)
    }
}

impl ColumnKey for &str {
    fn resolve(&self, columns: &[String]) -> Option<usize> {
        columns.iter().position(|c| c == self)
    }
}

/// Borrowed view of a single result row with typed accessors.
///
/// Out-of-range and NULL accesses return zero-values (`""`, `0`, `false`,
/// `[]`) the way the wire utilities upstream of this crate always have;
/// repositories that need to distinguish NULL use [`RowView::get_opt`].
#[derive(Debug, Clone, Copy)]
pub struct RowView<'a> {
    columns: &'a [String],
    values: &'a [Option<String>],
}

impl RowView<'_> {
    /// Raw optional cell; `None` for NULL or unknown column.
    #[must_use]
    pub fn get_opt(&self, key: impl ColumnKey) -> Option<&str> {
        let idx = key.resolve(self.columns)?;
        self.values.get(idx)?.as_deref()
    }

    /// String value; empty string for NULL or unknown column.
    #[must_use]
    pub fn get_string(&self, key: impl ColumnKey) -> String {
        self.get_opt(key).unwrap_or_default().to_string()
    }

    /// Integer value; 0 for NULL, unknown column, or unparseable text.
    #[must_use]
    pub fn get_int(&self, key: impl ColumnKey) -> i64 {
        self.get_opt(key)
            .and_then(|v| v.trim().parse::<i64>().ok())
            .unwrap_or(0)
    }

    /// Float value; 0.0 for NULL, unknown column, or unparseable text.
    #[must_use]
    pub fn get_float(&self, key: impl ColumnKey) -> f64 {
        self.get_opt(key)
            .and_then(|v| v.trim().parse::<f64>().ok())
            .unwrap_or(0.0)
    }

    /// Boolean value; accepts `t`, `true`, `1` (case-insensitive for the
    /// word forms), anything else is false.
    #[must_use]
    pub fn get_bool(&self, key: impl ColumnKey) -> bool {
        match self.get_opt(key) {
            Some(v) => matches!(v.trim(), "t" | "1") || v.trim().eq_ignore_ascii_case("true"),
            None => false,
        }
    }

    /// Array value parsed from the `{a,b,"c"}` text form; empty for
    /// NULL, unknown column, or malformed text.
    #[must_use]
    pub fn get_array(&self, key: impl ColumnKey) -> Vec<String> {
        self.get_opt(key).map(parse_text_array).unwrap_or_default()
    }
}

/// Parse the `{a,b,"c, with comma"}` array text form.
///
/// Elements may be bare or double-quoted; inside quotes `\"` and `\\` are
/// the recognized escapes. Malformed input yields the elements parsed so
/// far rather than an error, matching the tolerant accessor contract.
fn parse_text_array(raw: &str) -> Vec<String> {
    let raw = raw.trim();
    let Some(inner) = raw.strip_prefix('{').and_then(|r| r.strip_suffix('}')) else {
        return Vec::new();
    };
    if inner.is_empty() {
        return Vec::new();
    }

    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = inner.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => in_quotes = !in_quotes,
            '\\' if in_quotes => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            },
            ',' if !in_quotes => {
                out.push(std::mem::take(&mut current));
            },
            _ => current.push(c),
        }
    }
    out.push(current);
    out
}

/// Connection factory for a storage backend.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Open a new connection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] when the backend is unreachable or
    /// rejects the credentials.
    async fn connect(&self, info: &ConnectionInfo) -> Result<Box<dyn StorageConnection>, StoreError>;
}

/// A live connection to the storage backend.
///
/// Implementations are not required to be internally synchronized; the
/// pool guarantees exclusive access while a connection is leased.
#[async_trait]
pub trait StorageConnection: Send {
    /// Execute a statement with positional `$1..$n` parameters.
    async fn execute(&mut self, sql: &str, params: &[String]) -> Result<Rows, StoreError>;

    /// Register a named prepared statement.
    async fn prepare(&mut self, name: &str, sql: &str) -> Result<(), StoreError>;

    /// Execute a previously prepared statement.
    async fn execute_prepared(&mut self, name: &str, params: &[String]) -> Result<Rows, StoreError>;

    /// Begin a transaction. Fails if one is already open.
    async fn begin(&mut self) -> Result<(), StoreError>;

    /// Commit the open transaction.
    async fn commit(&mut self) -> Result<(), StoreError>;

    /// Roll back the open transaction.
    async fn rollback(&mut self) -> Result<(), StoreError>;

    /// Whether there is an open transaction.
    fn in_transaction(&self) -> bool;

    /// Cheap liveness probe.
    async fn is_alive(&self) -> bool;

    /// Release backend resources. Further calls are undefined.
    async fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rows() -> Rows {
        Rows::new(
            vec!["id".into(), "name".into(), "active".into(), "tags".into(), "score".into()],
            vec![
                vec![
                    Some("42".into()),
                    Some("ada".into()),
                    Some("t".into()),
                    Some("{a,b,\"c d\"}".into()),
                    None,
                ],
            ],
            0,
        )
    }

    #[test]
    fn test_query_kind_classification() {
        assert!(QueryKind::Insert.is_write());
        assert!(QueryKind::Truncate.is_write());
        assert!(QueryKind::Select.is_read_like());
        assert!(QueryKind::Other.is_read_like());
    }

    #[test]
    fn test_row_accessors_by_name() {
        let rows = sample_rows();
        let row = rows.row(0).expect("row exists");
        assert_eq!(row.get_int("id"), 42);
        assert_eq!(row.get_string("name"), "ada");
        assert!(row.get_bool("active"));
        assert_eq!(row.get_array("tags"), vec!["a", "b", "c d"]);
    }

    #[test]
    fn test_row_accessors_by_index() {
        let rows = sample_rows();
        let row = rows.row(0).expect("row exists");
        assert_eq!(row.get_int(0), 42);
        assert_eq!(row.get_string(1), "ada");
    }

    #[test]
    fn test_out_of_range_returns_zero_values() {
        let rows = sample_rows();
        let row = rows.row(0).expect("row exists");
        assert_eq!(row.get_string("missing"), "");
        assert_eq!(row.get_int(99), 0);
        assert!(!row.get_bool("missing"));
        assert!(row.get_array(99).is_empty());
    }

    #[test]
    fn test_null_is_zero_value() {
        let rows = sample_rows();
        let row = rows.row(0).expect("row exists");
        assert_eq!(row.get_float("score"), 0.0);
        assert!(row.get_opt("score").is_none());
    }

    #[test]
    fn test_bool_word_forms() {
        let rows = Rows::new(
            vec!["a".into(), "b".into(), "c".into()],
            vec![vec![Some("true".into()), Some("1".into()), Some("f".into())]],
            0,
        );
        let row = rows.row(0).expect("row exists");
        assert!(row.get_bool("a"));
        assert!(row.get_bool("b"));
        assert!(!row.get_bool("c"));
    }

    #[test]
    fn test_array_parsing_edge_cases() {
        assert!(parse_text_array("{}").is_empty());
        assert!(parse_text_array("not an array").is_empty());
        assert_eq!(parse_text_array("{one}"), vec!["one"]);
        assert_eq!(parse_text_array(r#"{"quoted, comma",plain}"#), vec!["quoted, comma", "plain"]);
        assert_eq!(parse_text_array(r#"{"esc \" quote"}"#), vec!["esc \" quote"]);
    }

    #[test]
    fn test_size_bytes_counts_cells() {
        let rows = sample_rows();
        assert!(rows.size_bytes() > 0);
        assert!(Rows::affected(3).size_bytes() == 0);
        assert_eq!(Rows::affected(3).rows_affected(), 3);
    }
}
