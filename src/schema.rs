//! Column metadata and the identifier allow-list.
//!
//! Table and column names reach SQL text only as [`Ident`] values, and an
//! `Ident` can only be obtained from a [`SchemaCatalog`] built out of live
//! table metadata. A name that the database does not report is rejected
//! before any statement is rendered.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Column types the engine needs to distinguish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    /// Boolean
    Boolean,
    /// Any integer width
    Integer,
    /// Floating point or numeric/decimal
    Numeric,
    /// Text of any kind
    Text,
    /// Date
    Date,
    /// Timestamp with or without timezone
    Timestamp,
    /// UUID
    Uuid,
    /// JSON / JSONB
    Json,
    /// Anything else
    Other,
}

impl ColumnType {
    /// Parse from a PostgreSQL `information_schema` data type name.
    pub fn from_postgres(pg_type: &str) -> Self {
        let normalized = pg_type.to_lowercase();
        match normalized.as_str() {
            "boolean" | "bool" => ColumnType::Boolean,
            "smallint" | "int2" | "integer" | "int" | "int4" | "bigint" | "int8" => {
                ColumnType::Integer
            }
            "real" | "float4" | "double precision" | "float8" => ColumnType::Numeric,
            "date" => ColumnType::Date,
            "uuid" => ColumnType::Uuid,
            "json" | "jsonb" => ColumnType::Json,
            "text" => ColumnType::Text,
            s if s.starts_with("timestamp") => ColumnType::Timestamp,
            s if s.starts_with("character") || s.starts_with("varchar") => ColumnType::Text,
            s if s.starts_with("numeric") || s.starts_with("decimal") => ColumnType::Numeric,
            _ => ColumnType::Other,
        }
    }

    /// Whether values can be compared as numbers without a cast.
    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::Numeric)
    }
}

/// Schema introspection result, in physical column order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntrospectedColumn {
    /// Column name
    pub name: String,
    /// PostgreSQL type
    pub pg_type: String,
    /// Is nullable
    pub nullable: bool,
    /// 1-based physical position
    pub ordinal_position: i32,
}

impl IntrospectedColumn {
    /// Build a column entry; handy for fixtures.
    pub fn new(name: impl Into<String>, pg_type: impl Into<String>, ordinal_position: i32) -> Self {
        Self {
            name: name.into(),
            pg_type: pg_type.into(),
            nullable: true,
            ordinal_position,
        }
    }

    /// Parsed column type.
    pub fn column_type(&self) -> ColumnType {
        ColumnType::from_postgres(&self.pg_type)
    }
}

/// A quoted SQL identifier known to exist in the live schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ident {
    raw: String,
    quoted: String,
}

impl Ident {
    fn new(raw: &str) -> Self {
        Self {
            raw: raw.to_string(),
            quoted: quote_ident(raw),
        }
    }

    /// Identifier for a column the database reported.
    pub(crate) fn from_metadata(column: &IntrospectedColumn) -> Self {
        Self::new(&column.name)
    }

    /// Unquoted name as reported by the database.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Quoted form safe for interpolation.
    pub fn quoted(&self) -> &str {
        &self.quoted
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.quoted)
    }
}

/// A table and its columns, as introspected.
#[derive(Debug, Clone)]
pub struct TableSchema {
    ident: Ident,
    columns: Vec<IntrospectedColumn>,
}

impl TableSchema {
    /// Table identifier.
    pub fn ident(&self) -> &Ident {
        &self.ident
    }

    /// Columns in physical order.
    pub fn columns(&self) -> &[IntrospectedColumn] {
        &self.columns
    }

    /// Look up a column.
    pub fn column(&self, name: &str) -> Option<&IntrospectedColumn> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Allow-list of tables and columns derived from schema metadata.
#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
    tables: BTreeMap<String, TableSchema>,
}

impl SchemaCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table from its introspected columns.
    ///
    /// An empty column list means the table does not exist.
    pub fn add_table(&mut self, name: &str, mut columns: Vec<IntrospectedColumn>) -> Result<()> {
        if columns.is_empty() {
            return Err(Error::config(format!(
                "Table {} has no columns or doesn't exist",
                name
            )));
        }
        validate_table_name(name)?;
        columns.sort_by_key(|c| c.ordinal_position);
        self.tables.insert(
            name.to_string(),
            TableSchema {
                ident: table_ident(name),
                columns,
            },
        );
        Ok(())
    }

    /// Table schema by name.
    pub fn table(&self, name: &str) -> Result<&TableSchema> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::config(format!("Table {} is not in the schema catalog", name)))
    }

    /// Identifier for a known table.
    pub fn table_ident(&self, name: &str) -> Result<Ident> {
        Ok(self.table(name)?.ident.clone())
    }

    /// Identifier for a known column of a known table.
    pub fn column(&self, table: &str, column: &str) -> Result<Ident> {
        let schema = self.table(table)?;
        schema
            .column(column)
            .map(|c| Ident::new(&c.name))
            .ok_or_else(|| {
                Error::config(format!("Column '{}' does not exist on {}", column, table))
            })
    }

    /// Identifiers for several columns of one table, preserving the given order.
    pub fn columns<S: AsRef<str>>(&self, table: &str, names: &[S]) -> Result<Vec<Ident>> {
        names.iter().map(|n| self.column(table, n.as_ref())).collect()
    }

    /// Whether a column exists.
    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.tables
            .get(table)
            .is_some_and(|t| t.column(column).is_some())
    }
}

/// Quote an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal, doubling embedded single quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Table names may be schema-qualified (`schema.table`); each part is quoted.
fn table_ident(name: &str) -> Ident {
    let quoted = name
        .split('.')
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(".");
    Ident {
        raw: name.to_string(),
        quoted,
    }
}

fn validate_table_name(name: &str) -> Result<()> {
    let parts: Vec<&str> = name.split('.').collect();
    let valid = parts.len() <= 2
        && parts.iter().all(|p| {
            !p.is_empty() && p.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if valid {
        Ok(())
    } else {
        Err(Error::config(format!("Invalid table name '{}'", name)))
    }
}

/// Split a possibly schema-qualified table name into (schema, table).
pub fn split_table_name(name: &str) -> (&str, &str) {
    match name.split_once('.') {
        Some((schema, table)) => (schema, table),
        None => ("public", name),
    }
}
