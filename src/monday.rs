//! monday.com GraphQL implementation of [`RemoteBoard`].
//!
//! A batch becomes one mutation document with one aliased field per record
//! (`r0`, `r1`, ...). Every value travels as a GraphQL variable. Errors that
//! carry an alias in their `path` fail only that record; errors without one
//! fail the whole call and are classified as transient or permanent.

use crate::api::{RemoteBoard, RemoteError};
use crate::config::MondayConfig;
use crate::error::Result;
use crate::model::{RecordPayload, RecordResult, json_to_text};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue, json};
use std::collections::HashMap;
use tokio::sync::OnceCell;
use tracing::{debug, instrument};

/// Error fragments that mark a GraphQL error as worth retrying.
const TRANSIENT_MARKERS: &[&str] = &[
    "complexity",
    "rate limit",
    "ratelimit",
    "too many requests",
    "timeout",
    "timed out",
    "internal server error",
    "try again",
];

#[derive(Debug, Deserialize)]
struct GraphqlResponse {
    #[serde(default)]
    data: Option<Map<String, JsonValue>>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Debug, Clone, Deserialize)]
struct GraphqlError {
    message: String,
    #[serde(default)]
    path: Vec<JsonValue>,
    #[serde(default)]
    extensions: Option<JsonValue>,
}

impl GraphqlError {
    fn alias(&self) -> Option<&str> {
        self.path.first().and_then(|p| p.as_str())
    }

    fn is_transient(&self) -> bool {
        let mut text = self.message.to_lowercase();
        if let Some(ext) = &self.extensions {
            text.push(' ');
            text.push_str(&ext.to_string().to_lowercase());
        }
        TRANSIENT_MARKERS.iter().any(|m| text.contains(m))
    }
}

fn classify(errors: &[GraphqlError]) -> RemoteError {
    let message = errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ");
    if errors.iter().any(GraphqlError::is_transient) {
        RemoteError::Transient(message)
    } else {
        RemoteError::Permanent(message)
    }
}

/// Aliased mutation document under construction.
#[derive(Debug, Default)]
struct Document {
    declarations: Vec<String>,
    fields: Vec<String>,
    variables: Map<String, JsonValue>,
}

impl Document {
    fn var(&mut self, name: String, ty: &str, value: JsonValue) -> String {
        self.declarations.push(format!("${}: {}", name, ty));
        self.variables.insert(name.clone(), value);
        format!("${}", name)
    }

    fn field(&mut self, alias: &str, call: String) {
        self.fields.push(format!("  {}: {} {{ id }}", alias, call));
    }

    fn finish(self) -> (String, JsonValue) {
        let query = format!(
            "mutation ({}) {{\n{}\n}}",
            self.declarations.join(", "),
            self.fields.join("\n")
        );
        (query, JsonValue::Object(self.variables))
    }
}

/// Client for one monday.com board.
pub struct MondayClient {
    http: Client,
    api_url: String,
    api_token: String,
    api_version: String,
    board_id: String,
    subitem_board_id: OnceCell<String>,
}

impl MondayClient {
    /// Create a client for `board_id`.
    pub fn new(config: &MondayConfig, board_id: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("order-delta-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            api_url: config.api_url.clone(),
            api_token: config.api_token.clone(),
            api_version: config.api_version.clone(),
            board_id: board_id.into(),
            subitem_board_id: OnceCell::new(),
        })
    }

    async fn graphql(
        &self,
        query: &str,
        variables: JsonValue,
    ) -> std::result::Result<GraphqlResponse, RemoteError> {
        let response = self
            .http
            .post(&self.api_url)
            .header("Authorization", &self.api_token)
            .header("API-Version", &self.api_version)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(|e| RemoteError::Transient(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(RemoteError::Transient(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Permanent(format!("HTTP {}: {}", status, body)));
        }

        response
            .json::<GraphqlResponse>()
            .await
            .map_err(|e| RemoteError::Transient(format!("Malformed response: {}", e)))
    }

    /// Run an aliased mutation and map each alias back to its record.
    async fn run_batch(
        &self,
        records: &[RecordPayload],
        document: Document,
        rejected: HashMap<usize, String>,
    ) -> std::result::Result<Vec<RecordResult>, RemoteError> {
        if document.fields.is_empty() {
            return Ok(records
                .iter()
                .enumerate()
                .map(|(i, r)| {
                    let reason = rejected.get(&i).map(String::as_str).unwrap_or("not sent");
                    RecordResult::failure(&r.record_id, reason)
                })
                .collect());
        }

        let (query, variables) = document.finish();
        debug!("Sending mutation with {} field(s)", records.len() - rejected.len());
        let response = self.graphql(&query, variables).await?;
        let data = response.data.unwrap_or_default();

        let mut per_alias: HashMap<String, String> = HashMap::new();
        let mut global = Vec::new();
        for error in response.errors {
            match error.alias() {
                Some(alias) => {
                    per_alias.insert(alias.to_string(), error.message);
                }
                None => global.push(error),
            }
        }
        let answered = data.values().any(|v| !v.is_null());
        if !global.is_empty() && !answered {
            return Err(classify(&global));
        }
        let fallback = if global.is_empty() {
            "no id returned".to_string()
        } else {
            global
                .iter()
                .map(|e| e.message.as_str())
                .collect::<Vec<_>>()
                .join("; ")
        };

        Ok(records
            .iter()
            .enumerate()
            .map(|(i, record)| {
                if let Some(reason) = rejected.get(&i) {
                    return RecordResult::failure(&record.record_id, reason);
                }
                let alias = format!("r{}", i);
                match data.get(&alias).and_then(|v| v.get("id")).and_then(json_to_text) {
                    Some(id) => RecordResult::success(&record.record_id, id, record.is_update()),
                    None => {
                        let reason = per_alias.get(&alias).unwrap_or(&fallback);
                        RecordResult::failure(&record.record_id, reason.as_str())
                    }
                }
            })
            .collect())
    }

    /// Board that holds the sub-items of this board's items.
    async fn subitem_board_id(&self, subitem_id: &str) -> std::result::Result<String, RemoteError> {
        self.subitem_board_id
            .get_or_try_init(|| async {
                let response = self
                    .graphql(
                        "query ($ids: [ID!]) { items(ids: $ids) { board { id } } }",
                        json!({ "ids": [subitem_id] }),
                    )
                    .await?;
                if !response.errors.is_empty() {
                    return Err(classify(&response.errors));
                }
                response
                    .data
                    .as_ref()
                    .and_then(|d| d.get("items"))
                    .and_then(|items| items.get(0))
                    .and_then(|item| item.pointer("/board/id"))
                    .and_then(json_to_text)
                    .ok_or_else(|| {
                        RemoteError::Permanent(format!("No board found for sub-item {}", subitem_id))
                    })
            })
            .await
            .cloned()
    }
}

fn column_values_json(values: &Map<String, JsonValue>) -> JsonValue {
    JsonValue::String(JsonValue::Object(values.clone()).to_string())
}

fn update_values(record: &RecordPayload) -> JsonValue {
    let mut values = record.column_values.clone();
    values.insert("name".into(), JsonValue::String(record.name.clone()));
    column_values_json(&values)
}

#[async_trait]
impl RemoteBoard for MondayClient {
    #[instrument(skip(self))]
    async fn create_or_update_group(&self, name: &str) -> std::result::Result<String, RemoteError> {
        let response = self
            .graphql(
                "query ($board: [ID!]) { boards(ids: $board) { groups { id title } } }",
                json!({ "board": [self.board_id] }),
            )
            .await?;
        if !response.errors.is_empty() {
            return Err(classify(&response.errors));
        }
        let existing = response
            .data
            .as_ref()
            .and_then(|d| d.get("boards"))
            .and_then(|b| b.pointer("/0/groups"))
            .and_then(|g| g.as_array())
            .and_then(|groups| {
                groups
                    .iter()
                    .find(|g| g.get("title").and_then(|t| t.as_str()) == Some(name))
            })
            .and_then(|g| g.get("id"))
            .and_then(json_to_text);
        if let Some(id) = existing {
            debug!("Group '{}' already exists as {}", name, id);
            return Ok(id);
        }

        let response = self
            .graphql(
                "mutation ($board: ID!, $name: String!) { create_group(board_id: $board, group_name: $name) { id } }",
                json!({ "board": self.board_id, "name": name }),
            )
            .await?;
        if !response.errors.is_empty() {
            return Err(classify(&response.errors));
        }
        response
            .data
            .as_ref()
            .and_then(|d| d.get("create_group"))
            .and_then(|g| g.get("id"))
            .and_then(json_to_text)
            .ok_or_else(|| RemoteError::Permanent(format!("create_group returned no id for '{}'", name)))
    }

    #[instrument(skip(self, records), fields(count = records.len()))]
    async fn create_or_update_items(
        &self,
        records: &[RecordPayload],
    ) -> std::result::Result<Vec<RecordResult>, RemoteError> {
        let mut doc = Document::default();
        let board = doc.var("board".into(), "ID!", json!(self.board_id));

        for (i, record) in records.iter().enumerate() {
            let alias = format!("r{}", i);
            match &record.external_id {
                Some(item_id) => {
                    let item = doc.var(format!("item{}", i), "ID!", json!(item_id));
                    let cols = doc.var(format!("cols{}", i), "JSON!", update_values(record));
                    doc.field(
                        &alias,
                        format!(
                            "change_multiple_column_values(board_id: {}, item_id: {}, column_values: {}, create_labels_if_missing: true)",
                            board, item, cols
                        ),
                    );
                }
                None => {
                    let name = doc.var(format!("name{}", i), "String!", json!(record.name));
                    let group = doc.var(format!("group{}", i), "String", json!(record.group_id));
                    let cols = doc.var(
                        format!("cols{}", i),
                        "JSON",
                        column_values_json(&record.column_values),
                    );
                    doc.field(
                        &alias,
                        format!(
                            "create_item(board_id: {}, group_id: {}, item_name: {}, column_values: {}, create_labels_if_missing: true)",
                            board, group, name, cols
                        ),
                    );
                }
            }
        }

        self.run_batch(records, doc, HashMap::new()).await
    }

    #[instrument(skip(self, records), fields(count = records.len()))]
    async fn create_or_update_subitems(
        &self,
        records: &[RecordPayload],
    ) -> std::result::Result<Vec<RecordResult>, RemoteError> {
        let mut doc = Document::default();
        let mut rejected = HashMap::new();
        let mut sub_board = None;

        for (i, record) in records.iter().enumerate() {
            let alias = format!("r{}", i);
            match (&record.external_id, &record.parent_external_item_id) {
                (Some(subitem_id), _) => {
                    let board = match &sub_board {
                        Some(b) => String::clone(b),
                        None => {
                            let id = self.subitem_board_id(subitem_id).await?;
                            let var = doc.var("subboard".into(), "ID!", json!(id));
                            sub_board = Some(var.clone());
                            var
                        }
                    };
                    let item = doc.var(format!("item{}", i), "ID!", json!(subitem_id));
                    let cols = doc.var(format!("cols{}", i), "JSON!", update_values(record));
                    doc.field(
                        &alias,
                        format!(
                            "change_multiple_column_values(board_id: {}, item_id: {}, column_values: {}, create_labels_if_missing: true)",
                            board, item, cols
                        ),
                    );
                }
                (None, Some(parent)) => {
                    let parent = doc.var(format!("parent{}", i), "ID!", json!(parent));
                    let name = doc.var(format!("name{}", i), "String!", json!(record.name));
                    let cols = doc.var(
                        format!("cols{}", i),
                        "JSON",
                        column_values_json(&record.column_values),
                    );
                    doc.field(
                        &alias,
                        format!(
                            "create_subitem(parent_item_id: {}, item_name: {}, column_values: {}, create_labels_if_missing: true)",
                            parent, name, cols
                        ),
                    );
                }
                (None, None) => {
                    rejected.insert(i, "sub-item has no parent item id".to_string());
                }
            }
        }

        self.run_batch(records, doc, rejected).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_uses_variables() {
        let mut doc = Document::default();
        let board = doc.var("board".into(), "ID!", json!("42"));
        let name = doc.var("name0".into(), "String!", json!("ORD-1\" }"));
        doc.field("r0", format!("create_item(board_id: {}, item_name: {})", board, name));
        let (query, vars) = doc.finish();
        assert!(query.starts_with("mutation ($board: ID!, $name0: String!)"));
        assert!(query.contains("r0: create_item(board_id: $board, item_name: $name0) { id }"));
        assert!(!query.contains("ORD-1"));
        assert_eq!(vars["name0"], json!("ORD-1\" }"));
    }

    #[test]
    fn test_error_classification() {
        let complexity: GraphqlError = serde_json::from_value(json!({
            "message": "Complexity budget exhausted",
            "extensions": { "code": "ComplexityException" }
        }))
        .unwrap();
        let invalid: GraphqlError = serde_json::from_value(json!({
            "message": "invalid value for column numbers_total",
            "path": ["r3"]
        }))
        .unwrap();
        assert!(matches!(classify(&[complexity]), RemoteError::Transient(_)));
        assert!(matches!(classify(&[invalid.clone()]), RemoteError::Permanent(_)));
        assert_eq!(invalid.alias(), Some("r3"));
    }

    #[test]
    fn test_update_values_carry_name() {
        let mut column_values = Map::new();
        column_values.insert("numbers_qty".into(), json!("4"));
        let record = RecordPayload {
            record_id: "a:XL".into(),
            name: "XL".into(),
            group_id: None,
            parent_external_item_id: Some("9".into()),
            external_id: Some("77".into()),
            column_values,
        };
        let JsonValue::String(encoded) = update_values(&record) else {
            panic!("column values must be a JSON string");
        };
        let decoded: JsonValue = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded["name"], json!("XL"));
        assert_eq!(decoded["numbers_qty"], json!("4"));
    }
}
