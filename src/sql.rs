//! Typed SQL fragments built from schema-checked identifiers.
//!
//! A [`SqlFragment`] can only be produced by the builders in this module,
//! which interpolate [`Ident`] values and escaped literals and nothing else.

use crate::model::columns;
use crate::resolver::SizeColumn;
use crate::schema::{Ident, IntrospectedColumn, quote_literal};
use std::fmt;

/// A piece of SQL text assembled from identifiers and escaped literals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlFragment(String);

impl SqlFragment {
    fn new(sql: String) -> Self {
        Self(sql)
    }

    /// Fragment text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the fragment renders to nothing.
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for SqlFragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Escaped string literal.
pub fn literal(value: &str) -> SqlFragment {
    SqlFragment::new(quote_literal(value))
}

/// `alias."a", alias."b"`
pub fn qualified_list(alias: &str, cols: &[Ident]) -> SqlFragment {
    SqlFragment::new(
        cols.iter()
            .map(|c| format!("{}.{}", alias, c))
            .collect::<Vec<_>>()
            .join(", "),
    )
}

/// `"a" = EXCLUDED."a", ...`
pub fn excluded_assignments(cols: &[Ident]) -> SqlFragment {
    SqlFragment::new(
        cols.iter()
            .map(|c| format!("{} = EXCLUDED.{}", c, c))
            .collect::<Vec<_>>()
            .join(",\n    "),
    )
}

/// Null-safe equality of the same key columns on two aliases.
pub fn key_match(left: &str, right: &str, keys: &[Ident]) -> SqlFragment {
    SqlFragment::new(
        keys.iter()
            .map(|k| format!("{}.{} IS NOT DISTINCT FROM {}.{}", left, k, right, k))
            .collect::<Vec<_>>()
            .join("\n       AND "),
    )
}

/// Content hash over business columns.
///
/// A row constructor keeps NULL and empty string distinct in the text form
/// and has no argument-count limit, unlike `concat_ws`.
pub fn hash_expression(alias: &str, cols: &[Ident]) -> SqlFragment {
    SqlFragment::new(format!("md5(ROW({})::text)", qualified_list(alias, cols)))
}

/// Text a size cell must match to be read as a quantity.
pub const QUANTITY_PATTERN: &str = r"^-?[0-9]+(\.[0-9]+)?$";

/// `VALUES` rows for the unpivot: one `('code', qty)` pair per size column.
///
/// Text-typed size columns are trimmed and only cast when they look like a
/// number; anything else ("N/A", "-", blanks) becomes NULL.
pub fn size_values(alias: &str, sizes: &[SizeColumn]) -> SqlFragment {
    SqlFragment::new(
        sizes
            .iter()
            .map(|s| {
                let qty = if s.column_type.is_numeric() {
                    format!("{}.{}::numeric", alias, s.ident)
                } else {
                    let trimmed = format!("btrim({}.{}::text)", alias, s.ident);
                    format!(
                        "CASE WHEN {} ~ {} THEN {}::numeric END",
                        trimmed,
                        quote_literal(QUANTITY_PATTERN),
                        trimmed
                    )
                };
                format!("({}, {})", quote_literal(s.code()), qty)
            })
            .collect::<Vec<_>>()
            .join(",\n           "),
    )
}

/// `VALUES` rows of raw, non-blank text for the text-typed size columns.
///
/// Numeric columns cannot hold a bad quantity and are left out, so the
/// fragment is empty when every size column is numeric.
pub fn raw_size_values(alias: &str, sizes: &[SizeColumn]) -> SqlFragment {
    SqlFragment::new(
        sizes
            .iter()
            .filter(|s| !s.column_type.is_numeric())
            .map(|s| {
                format!(
                    "({}, NULLIF(btrim({}.{}::text), ''))",
                    quote_literal(s.code()),
                    alias,
                    s.ident
                )
            })
            .collect::<Vec<_>>()
            .join(",\n           "),
    )
}

/// Columns that carry business content: everything except sync-tracking
/// metadata and explicit exclusions, in physical order.
pub fn business_columns<'a>(
    table_columns: &'a [IntrospectedColumn],
    exclude: &[String],
) -> Vec<&'a IntrospectedColumn> {
    table_columns
        .iter()
        .filter(|c| !columns::is_tracking(&c.name))
        .filter(|c| !exclude.iter().any(|e| e == &c.name))
        .collect()
}
