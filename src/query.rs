//! # Query Layer
//!
//! Turns logical table operations into SQL text and runs them against a
//! `rusqlite` connection.
//!
//! ## Two Rules
//!
//! 1. **Identifiers are validated, then quoted.** Table and column names must
//!    look like `[A-Za-z_][A-Za-z0-9_]*`, must not start with `sqlite_` or
//!    `qdb_`, and must not be a reserved SQL keyword. Only then are they
//!    wrapped in double quotes and spliced into the statement.
//! 2. **Values are always bound.** Row data and route keys travel as `?N`
//!    parameters, never as text.
//!
//! The one place SQL cannot take a parameter is a column `DEFAULT` in DDL.
//! Those literals are rendered by [`default_literal`], which only accepts
//! scalars and doubles single quotes in strings.
//!
//! ## Connection vs Transaction
//!
//! Most functions take `&Connection`. A `rusqlite::Transaction` derefs to a
//! `Connection`, so the same function runs standalone or inside a larger
//! transaction (create table + seed rows is one such case).

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, Statement};
use serde_json::Value;

use crate::types::{ColumnConstraint, ColumnDef, ColumnType, ConflictPolicy, ForeignKey, IdentifierKind, Row, TableDescriptor};
use crate::{Error, Result};

// =============================================================================
// Identifiers
// =============================================================================

/// Prefixes reserved for SQLite and for the internal tables.
const RESERVED_PREFIXES: &[&str] = &["sqlite_", "qdb_"];

/// Keywords rejected as table or column names, compared case-insensitively.
const RESERVED_WORDS: &[&str] = &[
    "abort", "alter", "and", "as", "begin", "between", "by", "case", "check", "column", "commit",
    "constraint", "create", "cross", "default", "delete", "distinct", "drop", "else", "end",
    "exists", "foreign", "from", "group", "having", "in", "index", "inner", "insert", "into",
    "is", "join", "key", "left", "like", "limit", "not", "null", "offset", "on", "or", "order",
    "pragma", "primary", "references", "replace", "rollback", "select", "set", "table", "then",
    "transaction", "trigger", "union", "unique", "update", "values", "view", "when", "where",
];

/// Checks a table or column name.
///
/// ```rust
/// use qdb::query::validate_identifier;
/// use qdb::types::IdentifierKind;
///
/// assert!(validate_identifier("orders", IdentifierKind::Table).is_ok());
/// assert!(validate_identifier("qdb_queue", IdentifierKind::Table).is_err());
/// assert!(validate_identifier("Select", IdentifierKind::Column).is_err());
/// assert!(validate_identifier("a-b", IdentifierKind::Column).is_err());
/// ```
pub fn validate_identifier(name: &str, kind: IdentifierKind) -> Result<()> {
    let reject = || Error::NameNotAllowed {
        kind,
        name: name.to_string(),
    };

    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return Err(reject()),
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(reject());
    }

    let lower = name.to_ascii_lowercase();
    if RESERVED_PREFIXES.iter().any(|p| lower.starts_with(p)) || RESERVED_WORDS.contains(&lower.as_str()) {
        return Err(reject());
    }
    Ok(())
}

/// Wraps an already validated identifier in double quotes.
fn quote(name: &str) -> String {
    format!("\"{name}\"")
}

fn validate_columns<'a>(names: impl IntoIterator<Item = &'a String>) -> Result<()> {
    for name in names {
        validate_identifier(name, IdentifierKind::Column)?;
    }
    Ok(())
}

// =============================================================================
// Value Mapping
// =============================================================================

/// JSON to SQLite. Arrays and objects are stored as their JSON text.
pub fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => SqlValue::Integer(i),
            (None, Some(f)) => SqlValue::Real(f),
            (None, None) => SqlValue::Text(n.to_string()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

/// SQLite to JSON. Blobs come back as arrays of bytes; non-finite reals as
/// null.
pub fn from_sql_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Array(b.iter().map(|&x| Value::from(x)).collect()),
    }
}

/// Renders a column default for DDL.
pub fn default_literal(value: &Value) -> Result<String> {
    match value {
        Value::Null => Ok("NULL".to_string()),
        Value::Bool(b) => Ok(String::from(if *b { "1" } else { "0" })),
        Value::Number(n) => Ok(n.to_string()),
        Value::String(s) => Ok(format!("'{}'", s.replace('\'', "''"))),
        other => Err(Error::MalformedMessage(format!(
            "column default must be a scalar, got {other}"
        ))),
    }
}

fn bind_all<'a>(values: impl IntoIterator<Item = &'a Value>) -> Vec<SqlValue> {
    values.into_iter().map(to_sql_value).collect()
}

fn collect_rows(stmt: &mut Statement<'_>, params: &[SqlValue]) -> Result<Vec<Row>> {
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query(params_from_iter(params.iter()))?;

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut obj = Row::new();
        for (i, name) in names.iter().enumerate() {
            obj.insert(name.clone(), from_sql_value(row.get_ref(i)?));
        }
        out.push(obj);
    }
    Ok(out)
}

// =============================================================================
// Raw Execution
// =============================================================================

/// Result of running an arbitrary statement.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    /// The statement produced a result set.
    Rows(Vec<Row>),
    /// The statement wrote; this many rows changed.
    Affected(usize),
}

impl QueryOutput {
    /// The rows, or nothing for a write.
    pub fn into_rows(self) -> Vec<Row> {
        match self {
            QueryOutput::Rows(rows) => rows,
            QueryOutput::Affected(_) => Vec::new(),
        }
    }
}

/// Runs one statement with positional parameters.
///
/// A statement that yields columns (a SELECT, or a write with RETURNING)
/// comes back as [`QueryOutput::Rows`]; anything else reports the change
/// count.
pub fn execute(conn: &Connection, sql: &str, params: &[Value]) -> Result<QueryOutput> {
    let mut stmt = conn.prepare(sql)?;
    let bound = bind_all(params);

    if stmt.column_count() > 0 {
        Ok(QueryOutput::Rows(collect_rows(&mut stmt, &bound)?))
    } else {
        Ok(QueryOutput::Affected(stmt.execute(params_from_iter(bound.iter()))?))
    }
}

// =============================================================================
// DDL
// =============================================================================

/// Builds the `CREATE TABLE` statement for a descriptor.
pub fn create_table_sql(table: &TableDescriptor) -> Result<String> {
    validate_identifier(&table.name, IdentifierKind::Table)?;
    if table.columns.is_empty() {
        return Err(Error::MalformedMessage(format!(
            "table '{}' needs at least one column",
            table.name
        )));
    }

    let mut defs = Vec::with_capacity(table.columns.len());
    let mut foreign = Vec::new();

    for col in &table.columns {
        validate_identifier(&col.name, IdentifierKind::Column)?;

        let mut parts = vec![quote(&col.name), col.column_type.as_sql().to_string()];
        parts.extend(col.constraints.iter().map(|c| c.as_sql().to_string()));
        if let Some(default) = &col.default {
            parts.push(format!("DEFAULT {}", default_literal(default)?));
        }
        defs.push(parts.join(" "));

        if let Some(fk) = &col.foreign_key {
            validate_identifier(&fk.table, IdentifierKind::Table)?;
            validate_identifier(&fk.column, IdentifierKind::Column)?;
            foreign.push(format!(
                "FOREIGN KEY ({}) REFERENCES {}({})",
                quote(&col.name),
                quote(&fk.table),
                quote(&fk.column)
            ));
        }
    }
    defs.extend(foreign);

    Ok(format!("CREATE TABLE {} ({})", quote(&table.name), defs.join(", ")))
}

/// Creates a table. Fails if it already exists.
pub fn create_table(conn: &Connection, table: &TableDescriptor) -> Result<()> {
    conn.execute_batch(&create_table_sql(table)?)?;
    Ok(())
}

pub fn drop_table(conn: &Connection, table: &str) -> Result<()> {
    validate_identifier(table, IdentifierKind::Table)?;
    conn.execute_batch(&format!("DROP TABLE {}", quote(table)))?;
    Ok(())
}

// =============================================================================
// Catalog
// =============================================================================

/// Lists user tables, i.e. everything except `sqlite_*` and `qdb_*`.
pub fn list_tables(conn: &Connection) -> Result<Vec<TableDescriptor>> {
    let names: Vec<String> = {
        let mut stmt = conn.prepare(
            r"SELECT name FROM sqlite_master
              WHERE type = 'table'
                AND name NOT LIKE 'sqlite\_%' ESCAPE '\'
                AND name NOT LIKE 'qdb\_%' ESCAPE '\'
              ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<std::result::Result<_, _>>()?
    };

    let mut tables = Vec::with_capacity(names.len());
    for name in names {
        if let Some(table) = describe_table(conn, &name)? {
            tables.push(table);
        }
    }
    Ok(tables)
}

/// Reads one table's columns back from the catalog. `None` if it does not
/// exist.
pub fn describe_table(conn: &Connection, table: &str) -> Result<Option<TableDescriptor>> {
    let mut foreign: Vec<(String, ForeignKey)> = {
        let mut stmt = conn.prepare(
            r#"SELECT "from", "table", "to" FROM pragma_foreign_key_list(?1)"#,
        )?;
        let rows = stmt.query_map([table], |row| {
            Ok((
                row.get::<_, String>(0)?,
                ForeignKey {
                    table: row.get(1)?,
                    column: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                },
            ))
        })?;
        rows.collect::<std::result::Result<_, _>>()?
    };

    let mut stmt = conn.prepare(
        r#"SELECT name, type, "notnull", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid"#,
    )?;
    let mut rows = stmt.query([table])?;

    let mut columns = Vec::new();
    while let Some(row) = rows.next()? {
        let name: String = row.get(0)?;
        let declared: String = row.get(1)?;
        let not_null: bool = row.get(2)?;
        let default: Option<String> = row.get(3)?;
        let pk: i64 = row.get(4)?;

        let mut col = ColumnDef::new(name, ColumnType::from_declared(&declared));
        if pk > 0 {
            col.constraints.push(ColumnConstraint::PrimaryKey);
        }
        if not_null {
            col.constraints.push(ColumnConstraint::NotNull);
        }
        match default.as_deref() {
            None => {}
            Some(d) if d.eq_ignore_ascii_case("CURRENT_TIMESTAMP") => {
                col.constraints.push(ColumnConstraint::Default);
                col.constraints.push(ColumnConstraint::CurrentTimestamp);
            }
            Some(d) => col.default = Some(parse_default(d)),
        }
        if let Some(pos) = foreign.iter().position(|(from, _)| *from == col.name) {
            col.foreign_key = Some(foreign.swap_remove(pos).1);
        }
        columns.push(col);
    }

    if columns.is_empty() {
        return Ok(None);
    }
    Ok(Some(TableDescriptor::new(table, columns)))
}

/// Inverse of [`default_literal`] for what `pragma_table_info` reports.
fn parse_default(raw: &str) -> Value {
    if raw.eq_ignore_ascii_case("NULL") {
        return Value::Null;
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return Value::from(f);
    }
    match raw.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')) {
        Some(inner) => Value::String(inner.replace("''", "'")),
        None => Value::String(raw.to_string()),
    }
}

/// SQL returning the primary key column of the table bound to `?1`.
pub const PRIMARY_KEY_SQL: &str =
    "SELECT name FROM pragma_table_info(?1) WHERE pk > 0 ORDER BY pk LIMIT 1";

// =============================================================================
// DML
// =============================================================================

/// `SELECT *` for a validated table name.
pub fn select_sql(table: &str) -> Result<String> {
    validate_identifier(table, IdentifierKind::Table)?;
    Ok(format!("SELECT * FROM {}", quote(table)))
}

pub fn select_all(conn: &Connection, table: &str) -> Result<Vec<Row>> {
    let mut stmt = conn.prepare(&select_sql(table)?)?;
    collect_rows(&mut stmt, &[])
}

/// Inserts rows one statement at a time and returns them as stored.
///
/// Each row may carry a different set of columns. Runs on whatever
/// transaction `conn` is in; see [`insert_many`] for the standalone form.
pub fn insert_rows(conn: &Connection, table: &str, rows: &[Row], policy: ConflictPolicy) -> Result<Vec<Row>> {
    validate_identifier(table, IdentifierKind::Table)?;

    let mut stored = Vec::with_capacity(rows.len());
    for row in rows {
        let sql = if row.is_empty() {
            format!("INSERT {} INTO {} DEFAULT VALUES RETURNING *", policy.as_sql(), quote(table))
        } else {
            validate_columns(row.keys())?;
            let columns: Vec<String> = row.keys().map(|k| quote(k)).collect();
            let placeholders: Vec<String> = (1..=row.len()).map(|i| format!("?{i}")).collect();
            format!(
                "INSERT {} INTO {} ({}) VALUES ({}) RETURNING *",
                policy.as_sql(),
                quote(table),
                columns.join(", "),
                placeholders.join(", ")
            )
        };

        let mut stmt = conn.prepare_cached(&sql)?;
        stored.extend(collect_rows(&mut stmt, &bind_all(row.values()))?);
    }
    Ok(stored)
}

/// Inserts rows in a single transaction: all of them or none.
pub fn insert_many(conn: &mut Connection, table: &str, rows: &[Row], policy: ConflictPolicy) -> Result<Vec<Row>> {
    if rows.is_empty() {
        return Err(Error::EmptyPayload);
    }
    let tx = conn.transaction()?;
    let stored = insert_rows(&tx, table, rows, policy)?;
    tx.commit()?;
    Ok(stored)
}

fn where_clause(filter: &Row, first_param: usize) -> Result<String> {
    if filter.is_empty() {
        return Ok(String::new());
    }
    validate_columns(filter.keys())?;
    let terms: Vec<String> = filter
        .keys()
        .enumerate()
        .map(|(i, k)| format!("{} = ?{}", quote(k), first_param + i))
        .collect();
    Ok(format!(" WHERE {}", terms.join(" AND ")))
}

/// `UPDATE ... SET changes WHERE filter`, returning the updated rows.
///
/// Filter terms are equality tests joined with AND. An empty filter updates
/// every row.
pub fn update_where(conn: &Connection, table: &str, changes: &Row, filter: &Row) -> Result<Vec<Row>> {
    validate_identifier(table, IdentifierKind::Table)?;
    if changes.is_empty() {
        return Err(Error::EmptyPayload);
    }
    validate_columns(changes.keys())?;

    let sets: Vec<String> = changes
        .keys()
        .enumerate()
        .map(|(i, k)| format!("{} = ?{}", quote(k), i + 1))
        .collect();
    let sql = format!(
        "UPDATE {} SET {}{} RETURNING *",
        quote(table),
        sets.join(", "),
        where_clause(filter, changes.len() + 1)?
    );

    let mut stmt = conn.prepare(&sql)?;
    collect_rows(&mut stmt, &bind_all(changes.values().chain(filter.values())))
}

/// `DELETE ... WHERE filter`, returning the deleted rows.
pub fn delete_where(conn: &Connection, table: &str, filter: &Row) -> Result<Vec<Row>> {
    validate_identifier(table, IdentifierKind::Table)?;
    let sql = format!(
        "DELETE FROM {}{} RETURNING *",
        quote(table),
        where_clause(filter, 1)?
    );

    let mut stmt = conn.prepare(&sql)?;
    collect_rows(&mut stmt, &bind_all(filter.values()))
}

/// A one-column equality filter, e.g. `{"id": "42"}` from a route key.
///
/// The key stays text. Column affinity makes `'42'` equal to `42` in an
/// INTEGER column.
pub fn key_filter(column: &str, key: &str) -> Row {
    let mut filter = Row::new();
    filter.insert(column.to_string(), Value::String(key.to_string()));
    filter
}

/// Text form of a key value, as it appears in a route segment.
///
/// Strings are taken as-is, numbers and booleans are formatted, anything
/// else has no key form.
pub fn key_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// =============================================================================
// Tests
// =============================================================================
