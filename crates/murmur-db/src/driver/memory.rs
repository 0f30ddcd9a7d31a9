//! In-memory storage backend.
//!
//! Executes the statement subset the Murmur repositories use against a
//! process-local table store: multi-row `INSERT` with `ON CONFLICT`,
//! `SELECT` with `=`/`<>`/`<`/`>` conjunctions, `COUNT(*)`, `ORDER BY` /
//! `LIMIT`, `UPDATE` (including `col = col + n` increments) and `DELETE`.
//! Tables are created on first insert, so test setups need no migrations.
//!
//! Values are stored in their textual form, exactly as they travel through
//! [`Rows`](super::Rows). Ordering comparisons are numeric when both sides
//! parse as numbers and lexicographic otherwise, which is also correct for
//! the fixed-width RFC 3339 timestamps the repositories write.
//!
//! Limitations (acceptable for a dev/test backend): transactions snapshot
//! the whole store, so concurrent writers are not isolated from an open
//! transaction; schemas are fixed by the first insert into a table.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use murmur_error::StoreError;
use parking_lot::Mutex;
use regex::Regex;

use super::{Rows, StorageConnection, StorageDriver};
use crate::conninfo::ConnectionInfo;

/// Process-local table store shared by every connection of one driver.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, Table>>,
}

#[derive(Debug, Clone, Default)]
struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows currently in `table` (0 if absent). Test helper.
    #[must_use]
    pub fn row_count(&self, table: &str) -> usize {
        self.tables.lock().get(table).map_or(0, |t| t.rows.len())
    }
}

/// Driver producing connections onto a shared [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryDriver {
    store: Arc<MemoryStore>,
    fail_connects: bool,
}

impl MemoryDriver {
    /// Driver with a fresh private store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            fail_connects: false,
        }
    }

    /// Driver over an existing store (lets several pools share data).
    #[must_use]
    pub fn with_store(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            fail_connects: false,
        }
    }

    /// Driver whose `connect` always fails. Exercises pool degradation
    /// paths in tests.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            fail_connects: true,
        }
    }

    /// Shared handle to the underlying store.
    #[must_use]
    pub fn store(&self) -> Arc<MemoryStore> {
        Arc::clone(&self.store)
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageDriver for MemoryDriver {
    async fn connect(&self, _info: &ConnectionInfo) -> Result<Box<dyn StorageConnection>, StoreError> {
        if self.fail_connects {
            return Err(StoreError::storage("memory backend configured to refuse connections"));
        }
        Ok(Box::new(MemoryConnection {
            store: Arc::clone(&self.store),
            prepared: HashMap::new(),
            snapshot: None,
            alive: true,
        }))
    }
}

struct MemoryConnection {
    store: Arc<MemoryStore>,
    prepared: HashMap<String, String>,
    snapshot: Option<HashMap<String, Table>>,
    alive: bool,
}

#[async_trait]
impl StorageConnection for MemoryConnection {
    async fn execute(&mut self, sql: &str, params: &[String]) -> Result<Rows, StoreError> {
        if !self.alive {
            return Err(StoreError::storage("connection closed"));
        }
        run_statement(&self.store, sql, params)
    }

    async fn prepare(&mut self, name: &str, sql: &str) -> Result<(), StoreError> {
        self.prepared.insert(name.to_string(), sql.to_string());
        Ok(())
    }

    async fn execute_prepared(&mut self, name: &str, params: &[String]) -> Result<Rows, StoreError> {
        let sql = self
            .prepared
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::storage(format!("unknown prepared statement: {name}")))?;
        self.execute(&sql, params).await
    }

    async fn begin(&mut self) -> Result<(), StoreError> {
        if self.snapshot.is_some() {
            return Err(StoreError::storage("transaction already open"));
        }
        self.snapshot = Some(self.store.tables.lock().clone());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        if self.snapshot.take().is_none() {
            return Err(StoreError::storage("no open transaction"));
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        match self.snapshot.take() {
            Some(snapshot) => {
                *self.store.tables.lock() = snapshot;
                Ok(())
            },
            None => Err(StoreError::storage("no open transaction")),
        }
    }

    fn in_transaction(&self) -> bool {
        self.snapshot.is_some()
    }

    async fn is_alive(&self) -> bool {
        self.alive
    }

    async fn close(&mut self) {
        self.alive = false;
    }
}

// ── Statement model ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Arg {
    /// `$n` positional parameter (0-based here).
    Param(usize),
    /// Quoted or numeric literal; `None` is SQL NULL.
    Literal(Option<String>),
}

impl Arg {
    fn eval(&self, params: &[String]) -> Result<Option<String>, StoreError> {
        match self {
            Self::Param(idx) => params
                .get(*idx)
                .cloned()
                .map(Some)
                .ok_or_else(|| StoreError::storage(format!("missing parameter ${}", idx + 1))),
            Self::Literal(value) => Ok(value.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Gt,
}

#[derive(Debug)]
struct Cond {
    column: String,
    op: CmpOp,
    value: Arg,
}

#[derive(Debug)]
enum SetItem {
    Assign(String, Arg),
    /// `col = EXCLUDED.src` inside ON CONFLICT DO UPDATE.
    AssignExcluded(String, String),
    /// `col = col + n`.
    Increment(String, i64),
}

enum ConflictAction {
    Nothing,
    Update(Vec<SetItem>),
}

// ── Parsing ──────────────────────────────────────────────────────────────────

fn parse_arg(token: &str) -> Result<Arg, StoreError> {
    let token = token.trim();
    if let Some(num) = token.strip_prefix('$') {
        let n: usize = num
            .parse()
            .map_err(|_| StoreError::storage(format!("bad parameter reference: {token}")))?;
        if n == 0 {
            return Err(StoreError::storage("parameter references are 1-based"));
        }
        return Ok(Arg::Param(n - 1));
    }
    if token.eq_ignore_ascii_case("null") {
        return Ok(Arg::Literal(None));
    }
    if let Some(inner) = token.strip_prefix('\'').and_then(|t| t.strip_suffix('\'')) {
        return Ok(Arg::Literal(Some(inner.replace("''", "'"))));
    }
    if token.parse::<f64>().is_ok() {
        return Ok(Arg::Literal(Some(token.to_string())));
    }
    Err(StoreError::storage(format!("unsupported value token: {token}")))
}

/// Split on a separator at quote depth zero.
fn split_top_level(input: &str, sep: char) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in input.chars() {
        match c {
            '\'' => {
                in_quotes = !in_quotes;
                current.push(c);
            },
            _ if c == sep && !in_quotes => out.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn parse_where(clause: &str) -> Result<Vec<Cond>, StoreError> {
    clause
        .split(" AND ")
        .map(|cond| {
            let cond = cond.trim();
            // Probe two-char operator first so `<>` is not read as `<`.
            let (op, split_at) = if let Some(pos) = cond.find("<>") {
                (CmpOp::Ne, (pos, pos + 2))
            } else if let Some(pos) = cond.find('=') {
                (CmpOp::Eq, (pos, pos + 1))
            } else if let Some(pos) = cond.find('<') {
                (CmpOp::Lt, (pos, pos + 1))
            } else if let Some(pos) = cond.find('>') {
                (CmpOp::Gt, (pos, pos + 1))
            } else {
                return Err(StoreError::storage(format!("unsupported condition: {cond}")));
            };
            let column = cond[..split_at.0].trim().to_string();
            let value = parse_arg(&cond[split_at.1..])?;
            Ok(Cond { column, op, value })
        })
        .collect()
}

fn parse_set_items(clause: &str) -> Result<Vec<SetItem>, StoreError> {
    split_top_level(clause, ',')
        .iter()
        .map(|item| {
            let item = item.trim();
            let (column, rhs) = item
                .split_once('=')
                .ok_or_else(|| StoreError::storage(format!("unsupported SET item: {item}")))?;
            let column = column.trim().to_string();
            let rhs = rhs.trim();

            if let Some(src) = rhs.strip_prefix("EXCLUDED.") {
                return Ok(SetItem::AssignExcluded(column, src.trim().to_string()));
            }
            if let Some(rest) = rhs.strip_prefix(column.as_str()) {
                let rest = rest.trim();
                if let Some(amount) = rest.strip_prefix('+') {
                    let n: i64 = amount
                        .trim()
                        .parse()
                        .map_err(|_| StoreError::storage(format!("bad increment: {item}")))?;
                    return Ok(SetItem::Increment(column, n));
                }
            }
            Ok(SetItem::Assign(column, parse_arg(rhs)?))
        })
        .collect()
}

// ── Execution ────────────────────────────────────────────────────────────────

fn run_statement(store: &MemoryStore, sql: &str, params: &[String]) -> Result<Rows, StoreError> {
    let sql = sql.trim().trim_end_matches(';').trim();
    let upper = sql.to_ascii_uppercase();
    if upper.starts_with("INSERT INTO ") {
        run_insert(store, sql, params)
    } else if upper.starts_with("SELECT ") {
        run_select(store, sql, params)
    } else if upper.starts_with("UPDATE ") {
        run_update(store, sql, params)
    } else if upper.starts_with("DELETE FROM ") {
        run_delete(store, sql, params)
    } else {
        Err(StoreError::storage(format!("unsupported statement: {sql}")))
    }
}

fn run_insert(store: &MemoryStore, sql: &str, params: &[String]) -> Result<Rows, StoreError> {
    let body = &sql["INSERT INTO ".len()..];
    let (table_name, rest) = body
        .split_once('(')
        .ok_or_else(|| StoreError::storage("INSERT: missing column list"))?;
    let table_name = table_name.trim().to_string();
    let (columns_raw, rest) = rest
        .split_once(')')
        .ok_or_else(|| StoreError::storage("INSERT: unterminated column list"))?;
    let columns: Vec<String> = columns_raw.split(',').map(|c| c.trim().to_string()).collect();

    let rest = rest.trim();
    let rest = rest
        .strip_prefix("VALUES")
        .ok_or_else(|| StoreError::storage("INSERT: missing VALUES"))?
        .trim();

    // Split the VALUES groups from an optional ON CONFLICT clause.
    let (values_part, conflict_part) = match rest.find(" ON CONFLICT ") {
        Some(pos) => (&rest[..pos], Some(rest[pos + " ON CONFLICT ".len()..].trim())),
        None => (rest, None),
    };

    let mut groups: Vec<Vec<Arg>> = Vec::new();
    for group in extract_paren_groups(values_part)? {
        let args = split_top_level(&group, ',')
            .iter()
            .map(|token| parse_arg(token))
            .collect::<Result<Vec<_>, _>>()?;
        if args.len() != columns.len() {
            return Err(StoreError::storage("INSERT: row width does not match column list"));
        }
        groups.push(args);
    }

    let conflict = match conflict_part {
        None => None,
        Some(part) => {
            let (key_raw, action_raw) = part
                .strip_prefix('(')
                .and_then(|p| p.split_once(')'))
                .ok_or_else(|| StoreError::storage("ON CONFLICT: missing key columns"))?;
            let key_columns: Vec<String> = key_raw.split(',').map(|c| c.trim().to_string()).collect();
            let action_raw = action_raw.trim();
            let action = if action_raw.eq_ignore_ascii_case("DO NOTHING") {
                ConflictAction::Nothing
            } else if let Some(set_clause) = action_raw.strip_prefix("DO UPDATE SET ") {
                ConflictAction::Update(parse_set_items(set_clause)?)
            } else {
                return Err(StoreError::storage("ON CONFLICT: unsupported action"));
            };
            Some((key_columns, action))
        },
    };

    let mut tables = store.tables.lock();
    let table = tables.entry(table_name).or_default();
    if table.columns.is_empty() {
        table.columns = columns.clone();
    } else if table.columns != columns {
        return Err(StoreError::storage("INSERT: column list does not match table schema"));
    }

    let mut affected = 0u64;
    for group in groups {
        let incoming: Vec<Option<String>> = group
            .iter()
            .map(|arg| arg.eval(params))
            .collect::<Result<Vec<_>, _>>()?;

        let existing = conflict.as_ref().and_then(|(keys, _)| {
            let key_idx: Vec<usize> = keys
                .iter()
                .filter_map(|k| table.columns.iter().position(|c| c == k))
                .collect();
            table.rows.iter().position(|row| {
                key_idx
                    .iter()
                    .all(|&i| row.get(i) == incoming.get(i))
            })
        });

        match (existing, &conflict) {
            (Some(_), Some((_, ConflictAction::Nothing))) => {},
            (Some(row_idx), Some((_, ConflictAction::Update(set_items)))) => {
                apply_set_items(table, row_idx, set_items, params, Some(&incoming))?;
                affected += 1;
            },
            _ => {
                table.rows.push(incoming);
                affected += 1;
            },
        }
    }

    Ok(Rows::affected(affected))
}

/// Extract the top-level parenthesized groups of a VALUES body.
fn extract_paren_groups(input: &str) -> Result<Vec<String>, StoreError> {
    let mut groups = Vec::new();
    let mut current = String::new();
    let mut depth = 0u32;
    let mut in_quotes = false;
    for c in input.chars() {
        match c {
            '\'' => {
                in_quotes = !in_quotes;
                if depth > 0 {
                    current.push(c);
                }
            },
            '(' if !in_quotes => {
                depth += 1;
                if depth > 1 {
                    current.push(c);
                }
            },
            ')' if !in_quotes => {
                if depth == 0 {
                    return Err(StoreError::storage("VALUES: unbalanced parentheses"));
                }
                depth -= 1;
                if depth == 0 {
                    groups.push(std::mem::take(&mut current));
                } else {
                    current.push(c);
                }
            },
            _ if depth > 0 => current.push(c),
            _ => {},
        }
    }
    if depth != 0 || groups.is_empty() {
        return Err(StoreError::storage("VALUES: malformed group list"));
    }
    Ok(groups)
}

fn apply_set_items(
    table: &mut Table,
    row_idx: usize,
    items: &[SetItem],
    params: &[String],
    excluded: Option<&[Option<String>]>,
) -> Result<(), StoreError> {
    // Resolve column positions first so a bad statement fails atomically.
    let mut updates: Vec<(usize, Option<String>)> = Vec::with_capacity(items.len());
    for item in items {
        let (column, value) = match item {
            SetItem::Assign(column, arg) => (column, arg.eval(params)?),
            SetItem::AssignExcluded(column, src) => {
                let src_idx = table
                    .columns
                    .iter()
                    .position(|c| c == src)
                    .ok_or_else(|| StoreError::storage(format!("EXCLUDED.{src}: unknown column")))?;
                let excluded = excluded
                    .ok_or_else(|| StoreError::storage("EXCLUDED outside ON CONFLICT"))?;
                (column, excluded.get(src_idx).cloned().flatten())
            },
            SetItem::Increment(column, amount) => {
                let idx = table
                    .columns
                    .iter()
                    .position(|c| c == column)
                    .ok_or_else(|| StoreError::storage(format!("{column}: unknown column")))?;
                let current: i64 = table.rows[row_idx]
                    .get(idx)
                    .and_then(|v| v.as_deref())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                (column, Some((current + amount).to_string()))
            },
        };
        let idx = table
            .columns
            .iter()
            .position(|c| c == column)
            .ok_or_else(|| StoreError::storage(format!("{column}: unknown column")))?;
        updates.push((idx, value));
    }
    for (idx, value) in updates {
        table.rows[row_idx][idx] = value;
    }
    Ok(())
}

fn matches_conditions(row: &[Option<String>], conds: &[(usize, CmpOp, Option<String>)]) -> bool {
    conds.iter().all(|(idx, op, expected)| {
        let actual = row.get(*idx).and_then(|v| v.as_deref());
        let expected = expected.as_deref();
        match op {
            CmpOp::Eq => actual == expected,
            CmpOp::Ne => actual.is_some() && expected.is_some() && actual != expected,
            CmpOp::Lt | CmpOp::Gt => {
                let (Some(a), Some(b)) = (actual, expected) else {
                    return false;
                };
                let ordering = match (a.parse::<f64>(), b.parse::<f64>()) {
                    (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
                    _ => a.cmp(b),
                };
                match op {
                    CmpOp::Lt => ordering == std::cmp::Ordering::Less,
                    _ => ordering == std::cmp::Ordering::Greater,
                }
            },
        }
    })
}

fn resolve_conditions(
    table: &Table,
    conds: &[Cond],
    params: &[String],
) -> Result<Vec<(usize, CmpOp, Option<String>)>, StoreError> {
    conds
        .iter()
        .map(|cond| {
            let idx = table
                .columns
                .iter()
                .position(|c| *c == cond.column)
                .ok_or_else(|| StoreError::storage(format!("{}: unknown column", cond.column)))?;
            Ok((idx, cond.op, cond.value.eval(params)?))
        })
        .collect()
}

fn select_regex() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::expect_used)]
        Regex::new(
            r"(?s)^SELECT (?P<proj>.+?) FROM (?P<table>\w+)(?: WHERE (?P<where>.+?))?(?: ORDER BY (?P<order>\w+)(?P<dir> DESC| ASC)?)?(?: LIMIT (?P<limit>\S+))?$",
        )
        .expect("select regex is valid")
    })
}

fn run_select(store: &MemoryStore, sql: &str, params: &[String]) -> Result<Rows, StoreError> {
    let captures = select_regex()
        .captures(sql)
        .ok_or_else(|| StoreError::storage(format!("unsupported SELECT shape: {sql}")))?;

    let projection = captures
        .name("proj")
        .map(|m| m.as_str().trim())
        .unwrap_or("*");
    let table_name = captures.name("table").map(|m| m.as_str()).unwrap_or_default();
    let tables = store.tables.lock();
    let Some(table) = tables.get(table_name) else {
        // Missing table reads as empty; keeps bootstrap-free test setups.
        if projection.eq_ignore_ascii_case("COUNT(*)") {
            return Ok(Rows::new(vec!["count".into()], vec![vec![Some("0".into())]], 0));
        }
        return Ok(Rows::new(Vec::new(), Vec::new(), 0));
    };

    let conds = match captures.name("where") {
        Some(m) => resolve_conditions(table, &parse_where(m.as_str())?, params)?,
        None => Vec::new(),
    };

    let mut selected: Vec<&Vec<Option<String>>> = table
        .rows
        .iter()
        .filter(|row| matches_conditions(row, &conds))
        .collect();

    if let Some(order_col) = captures.name("order") {
        let idx = table
            .columns
            .iter()
            .position(|c| c == order_col.as_str())
            .ok_or_else(|| StoreError::storage(format!("{}: unknown column", order_col.as_str())))?;
        let descending = captures
            .name("dir")
            .is_some_and(|d| d.as_str().trim() == "DESC");
        selected.sort_by(|a, b| {
            let av = a.get(idx).and_then(|v| v.as_deref()).unwrap_or("");
            let bv = b.get(idx).and_then(|v| v.as_deref()).unwrap_or("");
            let ordering = match (av.parse::<f64>(), bv.parse::<f64>()) {
                (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
                _ => av.cmp(bv),
            };
            if descending { ordering.reverse() } else { ordering }
        });
    }

    if let Some(limit) = captures.name("limit") {
        let limit: usize = match parse_arg(limit.as_str())?.eval(params)? {
            Some(v) => v
                .parse()
                .map_err(|_| StoreError::storage("LIMIT: not a number"))?,
            None => 0,
        };
        selected.truncate(limit);
    }

    if projection.eq_ignore_ascii_case("COUNT(*)") {
        return Ok(Rows::new(
            vec!["count".into()],
            vec![vec![Some(selected.len().to_string())]],
            0,
        ));
    }

    let (columns, indices): (Vec<String>, Vec<usize>) = if projection == "*" {
        (table.columns.clone(), (0..table.columns.len()).collect())
    } else {
        let names: Vec<String> = projection.split(',').map(|c| c.trim().to_string()).collect();
        let indices = names
            .iter()
            .map(|name| {
                table
                    .columns
                    .iter()
                    .position(|c| c == name)
                    .ok_or_else(|| StoreError::storage(format!("{name}: unknown column")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        (names, indices)
    };

    let rows = selected
        .iter()
        .map(|row| indices.iter().map(|&i| row.get(i).cloned().flatten()).collect())
        .collect();

    Ok(Rows::new(columns, rows, 0))
}

fn run_update(store: &MemoryStore, sql: &str, params: &[String]) -> Result<Rows, StoreError> {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    #[allow(clippy::expect_used)]
    let re = RE.get_or_init(|| {
        Regex::new(r"(?s)^UPDATE (?P<table>\w+) SET (?P<set>.+?)(?: WHERE (?P<where>.+))?$")
            .expect("update regex is valid")
    });
    let captures = re
        .captures(sql)
        .ok_or_else(|| StoreError::storage(format!("unsupported UPDATE shape: {sql}")))?;

    let table_name = captures.name("table").map(|m| m.as_str()).unwrap_or_default();
    let set_items = parse_set_items(captures.name("set").map(|m| m.as_str()).unwrap_or_default())?;

    let mut tables = store.tables.lock();
    let Some(table) = tables.get_mut(table_name) else {
        return Ok(Rows::affected(0));
    };

    let conds = match captures.name("where") {
        Some(m) => resolve_conditions(table, &parse_where(m.as_str())?, params)?,
        None => Vec::new(),
    };

    let matching: Vec<usize> = table
        .rows
        .iter()
        .enumerate()
        .filter(|(_, row)| matches_conditions(row, &conds))
        .map(|(i, _)| i)
        .collect();

    for &row_idx in &matching {
        apply_set_items(table, row_idx, &set_items, params, None)?;
    }

    Ok(Rows::affected(matching.len() as u64))
}

fn run_delete(store: &MemoryStore, sql: &str, params: &[String]) -> Result<Rows, StoreError> {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    #[allow(clippy::expect_used)]
    let re = RE.get_or_init(|| {
        Regex::new(r"(?s)^DELETE FROM (?P<table>\w+)(?: WHERE (?P<where>.+))?$")
            .expect("delete regex is valid")
    });
    let captures = re
        .captures(sql)
        .ok_or_else(|| StoreError::storage(format!("unsupported DELETE shape: {sql}")))?;

    let table_name = captures.name("table").map(|m| m.as_str()).unwrap_or_default();
    let mut tables = store.tables.lock();
    let Some(table) = tables.get_mut(table_name) else {
        return Ok(Rows::affected(0));
    };

    let conds = match captures.name("where") {
        Some(m) => resolve_conditions(table, &parse_where(m.as_str())?, params)?,
        None => Vec::new(),
    };

    let before = table.rows.len();
    table.rows.retain(|row| !matches_conditions(row, &conds));

    Ok(Rows::affected((before - table.rows.len()) as u64))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn connect() -> Box<dyn StorageConnection> {
        let driver = MemoryDriver::new();
        let info = ConnectionInfo::parse("memory://local/test").unwrap();
        driver.connect(&info).await.unwrap()
    }

    fn p(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| (*v).to_string()).collect()
    }

    // ========================================================================
    // Insert / select
    // ========================================================================

    #[tokio::test]
    async fn test_insert_and_select() {
        let mut conn = connect().await;
        let affected = conn
            .execute(
                "INSERT INTO users (id, name, active) VALUES ($1, $2, 't')",
                &p(&["u1", "ada"]),
            )
            .await
            .unwrap();
        assert_eq!(affected.rows_affected(), 1);

        let rows = conn
            .execute("SELECT id, name FROM users WHERE id = $1", &p(&["u1"]))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows.row(0).unwrap().get_string("name"), "ada");
    }

    #[tokio::test]
    async fn test_multi_row_insert() {
        let mut conn = connect().await;
        let affected = conn
            .execute(
                "INSERT INTO t (a, b) VALUES ($1, $2), ($3, $4), ($5, $6)",
                &p(&["1", "x", "2", "y", "3", "z"]),
            )
            .await
            .unwrap();
        assert_eq!(affected.rows_affected(), 3);

        let rows = conn.execute("SELECT COUNT(*) FROM t", &[]).await.unwrap();
        assert_eq!(rows.row(0).unwrap().get_int("count"), 3);
    }

    #[tokio::test]
    async fn test_on_conflict_do_update() {
        let mut conn = connect().await;
        conn.execute(
            "INSERT INTO f (a, b, active) VALUES ($1, $2, $3)",
            &p(&["u1", "u2", "f"]),
        )
        .await
        .unwrap();
        conn.execute(
            "INSERT INTO f (a, b, active) VALUES ($1, $2, $3) ON CONFLICT (a, b) DO UPDATE SET active = EXCLUDED.active",
            &p(&["u1", "u2", "t"]),
        )
        .await
        .unwrap();

        let rows = conn.execute("SELECT * FROM f", &[]).await.unwrap();
        assert_eq!(rows.len(), 1, "conflict must not duplicate");
        assert!(rows.row(0).unwrap().get_bool("active"));
    }

    #[tokio::test]
    async fn test_on_conflict_do_nothing() {
        let mut conn = connect().await;
        conn.execute("INSERT INTO b (x, y) VALUES ($1, $2)", &p(&["1", "2"]))
            .await
            .unwrap();
        let affected = conn
            .execute(
                "INSERT INTO b (x, y) VALUES ($1, $2) ON CONFLICT (x, y) DO NOTHING",
                &p(&["1", "2"]),
            )
            .await
            .unwrap();
        assert_eq!(affected.rows_affected(), 0);
    }

    // ========================================================================
    // Filtering, ordering, limits
    // ========================================================================

    #[tokio::test]
    async fn test_order_by_desc_and_limit() {
        let mut conn = connect().await;
        for (id, at) in [("a", "2024-01-01T00:00:00.000Z"), ("b", "2024-03-01T00:00:00.000Z"), ("c", "2024-02-01T00:00:00.000Z")] {
            conn.execute("INSERT INTO ev (id, at) VALUES ($1, $2)", &p(&[id, at]))
                .await
                .unwrap();
        }
        let rows = conn
            .execute("SELECT id FROM ev ORDER BY at DESC LIMIT 2", &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.row(0).unwrap().get_string("id"), "b");
        assert_eq!(rows.row(1).unwrap().get_string("id"), "c");
    }

    #[tokio::test]
    async fn test_where_range_on_timestamps() {
        let mut conn = connect().await;
        for at in ["2024-01-01T00:00:00.000Z", "2024-06-01T00:00:00.000Z"] {
            conn.execute("INSERT INTO ev (at) VALUES ($1)", &p(&[at])).await.unwrap();
        }
        let rows = conn
            .execute(
                "SELECT at FROM ev WHERE at < $1",
                &p(&["2024-03-01T00:00:00.000Z"]),
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_select_missing_table_is_empty() {
        let mut conn = connect().await;
        let rows = conn.execute("SELECT * FROM nothing", &[]).await.unwrap();
        assert!(rows.is_empty());
        let count = conn.execute("SELECT COUNT(*) FROM nothing", &[]).await.unwrap();
        assert_eq!(count.row(0).unwrap().get_int("count"), 0);
    }

    // ========================================================================
    // Update / delete
    // ========================================================================

    #[tokio::test]
    async fn test_update_with_increment() {
        let mut conn = connect().await;
        conn.execute("INSERT INTO s (id, n) VALUES ($1, $2)", &p(&["u1", "5"]))
            .await
            .unwrap();
        let affected = conn
            .execute("UPDATE s SET n = n + 3 WHERE id = $1", &p(&["u1"]))
            .await
            .unwrap();
        assert_eq!(affected.rows_affected(), 1);
        let rows = conn.execute("SELECT n FROM s", &[]).await.unwrap();
        assert_eq!(rows.row(0).unwrap().get_int("n"), 8);
    }

    #[tokio::test]
    async fn test_delete() {
        let mut conn = connect().await;
        conn.execute("INSERT INTO d (id) VALUES ($1), ($2)", &p(&["1", "2"]))
            .await
            .unwrap();
        let affected = conn
            .execute("DELETE FROM d WHERE id = $1", &p(&["1"]))
            .await
            .unwrap();
        assert_eq!(affected.rows_affected(), 1);
        let rows = conn.execute("SELECT * FROM d", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    #[tokio::test]
    async fn test_rollback_restores_state() {
        let mut conn = connect().await;
        conn.execute("INSERT INTO t (id) VALUES ($1)", &p(&["keep"])).await.unwrap();

        conn.begin().await.unwrap();
        conn.execute("INSERT INTO t (id) VALUES ($1)", &p(&["discard"]))
            .await
            .unwrap();
        conn.rollback().await.unwrap();

        let rows = conn.execute("SELECT * FROM t", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows.row(0).unwrap().get_string("id"), "keep");
    }

    #[tokio::test]
    async fn test_nested_begin_fails() {
        let mut conn = connect().await;
        conn.begin().await.unwrap();
        assert!(conn.begin().await.is_err());
        conn.commit().await.unwrap();
        assert!(!conn.in_transaction());
    }

    #[tokio::test]
    async fn test_failing_driver_refuses_connections() {
        let driver = MemoryDriver::failing();
        let info = ConnectionInfo::parse("memory://local/test").unwrap();
        assert!(driver.connect(&info).await.is_err());
    }

    #[tokio::test]
    async fn test_shared_store_across_connections() {
        let driver = MemoryDriver::new();
        let info = ConnectionInfo::parse("memory://local/test").unwrap();
        let mut a = driver.connect(&info).await.unwrap();
        let mut b = driver.connect(&info).await.unwrap();

        a.execute("INSERT INTO shared (id) VALUES ($1)", &p(&["x"]))
            .await
            .unwrap();
        let rows = b.execute("SELECT * FROM shared", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
    }
}
