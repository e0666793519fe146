//! SQL template engine.
//!
//! Templates are SQL files with `{{ key }}` placeholders. Every placeholder
//! must be bound in a [`TemplateContext`] to a schema-checked identifier, an
//! identifier list, or a [`SqlFragment`]; raw strings cannot be bound.
//! [`TemplateEngine::render`] validates before substituting, so a missing key
//! is a hard failure rather than a silent default.

use crate::error::{Error, Result};
use crate::schema::Ident;
use crate::sql::SqlFragment;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Built-in templates, by name.
const BUILTIN: &[(&str, &str)] = &[
    ("detect_new_orders", include_str!("../templates/detect_new_orders.sql")),
    ("merge_headers", include_str!("../templates/merge_headers.sql")),
    ("mirror_header_state", include_str!("../templates/mirror_header_state.sql")),
    ("unpivot_lines", include_str!("../templates/unpivot_lines.sql")),
    ("find_invalid_sizes", include_str!("../templates/find_invalid_sizes.sql")),
    ("select_headers", include_str!("../templates/select_headers.sql")),
    ("claim_headers", include_str!("../templates/claim_headers.sql")),
    ("release_headers", include_str!("../templates/release_headers.sql")),
    ("select_lines", include_str!("../templates/select_lines.sql")),
    ("mark_grouped", include_str!("../templates/mark_grouped.sql")),
    ("update_header_outcome", include_str!("../templates/update_header_outcome.sql")),
    ("cascade_header_outcome", include_str!("../templates/cascade_header_outcome.sql")),
    ("update_line_outcome", include_str!("../templates/update_line_outcome.sql")),
    ("cascade_line_outcome", include_str!("../templates/cascade_line_outcome.sql")),
    ("promote_lines_synced", include_str!("../templates/promote_lines_synced.sql")),
    ("status_counts", include_str!("../templates/status_counts.sql")),
];

/// A value bound to a placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateValue {
    /// Single identifier
    Ident(Ident),
    /// Comma-separated identifiers
    IdentList(Vec<Ident>),
    /// Pre-built fragment
    Fragment(SqlFragment),
}

impl TemplateValue {
    fn render(&self) -> String {
        match self {
            TemplateValue::Ident(i) => i.quoted().to_string(),
            TemplateValue::IdentList(list) => list
                .iter()
                .map(|i| i.quoted())
                .collect::<Vec<_>>()
                .join(", "),
            TemplateValue::Fragment(f) => f.as_str().to_string(),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            TemplateValue::Ident(_) => false,
            TemplateValue::IdentList(list) => list.is_empty(),
            TemplateValue::Fragment(f) => f.is_empty(),
        }
    }
}

/// Placeholder bindings for one render.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    values: BTreeMap<String, TemplateValue>,
}

impl TemplateContext {
    /// Empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an identifier.
    pub fn ident(mut self, key: &str, ident: Ident) -> Self {
        self.values.insert(key.to_string(), TemplateValue::Ident(ident));
        self
    }

    /// Bind an identifier list.
    pub fn idents(mut self, key: &str, idents: Vec<Ident>) -> Self {
        self.values
            .insert(key.to_string(), TemplateValue::IdentList(idents));
        self
    }

    /// Bind a fragment.
    pub fn fragment(mut self, key: &str, fragment: SqlFragment) -> Self {
        self.values
            .insert(key.to_string(), TemplateValue::Fragment(fragment));
        self
    }

    /// Bound value.
    pub fn get(&self, key: &str) -> Option<&TemplateValue> {
        self.values.get(key)
    }

    /// Bound keys.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|k| k.as_str())
    }
}

/// Issue severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Rendering is refused
    Error,
    /// Reported only
    Warning,
}

/// A validation finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    /// Severity
    pub severity: Severity,
    /// Placeholder concerned, if any
    pub key: Option<String>,
    /// Message
    pub message: String,
}

impl Issue {
    fn error(key: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            key: key.map(str::to_string),
            message: message.into(),
        }
    }

    fn warning(key: &str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            key: Some(key.to_string()),
            message: message.into(),
        }
    }

    /// Whether this issue blocks rendering.
    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(k) => write!(f, "{}: {}", k, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// One parsed piece of a template.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment<'a> {
    Text(&'a str),
    Placeholder(&'a str),
}

/// Split template text into literal text and placeholders.
fn parse(text: &str) -> std::result::Result<Vec<Segment<'_>>, String> {
    let mut segments = Vec::new();
    let mut rest = text;

    while let Some(open) = rest.find("{{") {
        segments.push(Segment::Text(&rest[..open]));
        let after = &rest[open + 2..];
        let close = after
            .find("}}")
            .ok_or_else(|| "unterminated placeholder".to_string())?;
        let key = after[..close].trim();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_lowercase() || c == '_') {
            return Err(format!("invalid placeholder name '{}'", key));
        }
        segments.push(Segment::Placeholder(key));
        rest = &after[close + 2..];
    }
    segments.push(Segment::Text(rest));
    Ok(segments)
}

/// Named SQL templates.
#[derive(Debug, Clone)]
pub struct TemplateEngine {
    templates: BTreeMap<String, String>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    /// Engine loaded with the built-in templates.
    pub fn new() -> Self {
        Self {
            templates: BUILTIN
                .iter()
                .map(|(name, text)| (name.to_string(), text.to_string()))
                .collect(),
        }
    }

    /// Add or replace a template.
    pub fn with_template(mut self, name: impl Into<String>, text: impl Into<String>) -> Self {
        self.templates.insert(name.into(), text.into());
        self
    }

    /// Template names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(|k| k.as_str())
    }

    /// Placeholders a template requires.
    pub fn placeholders(&self, name: &str) -> Result<BTreeSet<String>> {
        let text = self.text(name)?;
        let segments = parse(text).map_err(|m| Error::template(name, m))?;
        Ok(segments
            .into_iter()
            .filter_map(|s| match s {
                Segment::Placeholder(k) => Some(k.to_string()),
                Segment::Text(_) => None,
            })
            .collect())
    }

    /// Check a context against a template.
    pub fn validate(&self, name: &str, context: &TemplateContext) -> Vec<Issue> {
        let Some(text) = self.templates.get(name) else {
            return vec![Issue::error(None, format!("unknown template '{}'", name))];
        };
        let segments = match parse(text) {
            Ok(s) => s,
            Err(m) => return vec![Issue::error(None, m)],
        };

        let mut issues = Vec::new();
        let mut required = BTreeSet::new();
        for segment in &segments {
            if let Segment::Placeholder(key) = segment {
                if !required.insert(*key) {
                    continue;
                }
                match context.get(key) {
                    None => issues.push(Issue::error(Some(key), "missing from context")),
                    Some(v) if v.is_empty() => {
                        issues.push(Issue::error(Some(key), "bound to an empty value"))
                    }
                    Some(_) => {}
                }
            }
        }
        for key in context.keys() {
            if !required.contains(key) {
                issues.push(Issue::warning(key, "bound but not used by the template"));
            }
        }
        issues
    }

    /// Validate, then substitute every placeholder.
    pub fn render(&self, name: &str, context: &TemplateContext) -> Result<String> {
        let issues = self.validate(name, context);
        let errors: Vec<String> = issues
            .iter()
            .filter(|i| i.is_error())
            .map(|i| i.to_string())
            .collect();
        if !errors.is_empty() {
            return Err(Error::template(name, errors.join("; ")));
        }
        for warning in issues.iter().filter(|i| !i.is_error()) {
            tracing::debug!("Template {}: {}", name, warning);
        }

        let text = self.text(name)?;
        let segments = parse(text).map_err(|m| Error::template(name, m))?;
        let mut sql = String::with_capacity(text.len());
        for segment in segments {
            match segment {
                Segment::Text(t) => sql.push_str(t),
                Segment::Placeholder(key) => {
                    let value = context
                        .get(key)
                        .ok_or_else(|| Error::template(name, format!("{}: missing", key)))?;
                    sql.push_str(&value.render());
                }
            }
        }
        Ok(sql)
    }

    fn text(&self, name: &str) -> Result<&str> {
        self.templates
            .get(name)
            .map(|s| s.as_str())
            .ok_or_else(|| Error::template(name, "unknown template"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{IntrospectedColumn, SchemaCatalog};
    use crate::sql;

    fn catalog() -> SchemaCatalog {
        let mut catalog = SchemaCatalog::new();
        catalog
            .add_table(
                "orders",
                vec![
                    IntrospectedColumn::new("record_uuid", "uuid", 1),
                    IntrospectedColumn::new("CUSTOMER NAME", "text", 2),
                ],
            )
            .unwrap();
        catalog
    }

    fn engine() -> TemplateEngine {
        TemplateEngine::new().with_template(
            "pick",
            "SELECT {{ cols }} FROM {{table}} WHERE {{ cols }} IS NOT NULL",
        )
    }

    #[test]
    fn test_parse_placeholders() {
        let placeholders = engine().placeholders("pick").unwrap();
        let keys: Vec<&str> = placeholders.iter().map(|s| s.as_str()).collect();
        assert_eq!(keys, vec!["cols", "table"]);
    }

    #[test]
    fn test_render_substitutes_quoted_idents() {
        let catalog = catalog();
        let ctx = TemplateContext::new()
            .ident("table", catalog.table_ident("orders").unwrap())
            .idents("cols", catalog.columns("orders", &["CUSTOMER NAME"]).unwrap());
        let sql = engine().render("pick", &ctx).unwrap();
        assert_eq!(
            sql,
            "SELECT \"CUSTOMER NAME\" FROM \"orders\" WHERE \"CUSTOMER NAME\" IS NOT NULL"
        );
    }

    #[test]
    fn test_missing_key_is_hard_failure() {
        let catalog = catalog();
        let ctx = TemplateContext::new().ident("table", catalog.table_ident("orders").unwrap());
        let issues = engine().validate("pick", &ctx);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].key.as_deref(), Some("cols"));
        assert!(issues[0].is_error());

        let err = engine().render("pick", &ctx).unwrap_err();
        assert_eq!(err.code(), "TEMPLATE_ERROR");
    }

    #[test]
    fn test_empty_value_rejected() {
        let catalog = catalog();
        let ctx = TemplateContext::new()
            .ident("table", catalog.table_ident("orders").unwrap())
            .idents("cols", vec![]);
        assert!(engine().render("pick", &ctx).is_err());
    }

    #[test]
    fn test_unused_key_is_warning() {
        let catalog = catalog();
        let ctx = TemplateContext::new()
            .ident("table", catalog.table_ident("orders").unwrap())
            .idents("cols", catalog.columns("orders", &["record_uuid"]).unwrap())
            .fragment("extra", sql::literal("x"));
        let issues = engine().validate("pick", &ctx);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, Severity::Warning);
        assert!(engine().render("pick", &ctx).is_ok());
    }

    #[test]
    fn test_unknown_template() {
        let issues = engine().validate("nope", &TemplateContext::new());
        assert!(issues[0].is_error());
        assert!(engine().render("nope", &TemplateContext::new()).is_err());
    }

    #[test]
    fn test_unterminated_placeholder() {
        let engine = TemplateEngine::new().with_template("broken", "SELECT {{ cols FROM t");
        assert!(engine.render("broken", &TemplateContext::new()).is_err());
    }

    #[test]
    fn test_builtin_templates_parse() {
        let engine = TemplateEngine::new();
        for name in engine.names() {
            assert!(engine.placeholders(name).is_ok(), "{} failed to parse", name);
        }
        let merge = engine.placeholders("merge_headers").unwrap();
        for key in ["header_table", "header_delta_table", "hash_expr", "copy_columns"] {
            assert!(merge.contains(key), "merge_headers lacks {}", key);
        }
        let unpivot = engine.placeholders("unpivot_lines").unwrap();
        assert!(unpivot.contains("size_values"));
    }
}
