//! Storage seams used by the resolver, the merge orchestrator and the sync engine.
//!
//! [`crate::postgres::PostgresClient`] implements all three traits; tests use
//! in-memory implementations.

use crate::error::{Error, Result};
use crate::model::{HeaderRecord, ItemOutcome, LineOutcome, LineRecord, SyncState, columns};
use crate::resolver::TableNames;
use crate::schema::{IntrospectedColumn, SchemaCatalog};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// A row as column name -> value.
pub type RowMap = BTreeMap<String, JsonValue>;

/// Reads table metadata.
#[async_trait]
pub trait SchemaSource: Send + Sync {
    /// Columns of a table in physical order; empty when the table does not exist.
    async fn table_columns(&self, table: &str) -> Result<Vec<IntrospectedColumn>>;
}

/// Executes rendered SQL.
#[async_trait]
pub trait SqlRunner: Send + Sync {
    /// Run a read-only query and return its rows.
    async fn query_rows(&self, sql: &str) -> Result<Vec<RowMap>>;

    /// Run a statement set in one transaction, returning affected rows per statement.
    ///
    /// Either every statement commits or none does.
    async fn execute_atomic(&self, label: &str, statements: &[String]) -> Result<Vec<u64>>;
}

/// Selection of header delta rows for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderQuery {
    /// States that need pass one
    pub states: Vec<SyncState>,
    /// Also select headers whose item synced but whose lines did not
    pub include_resumable: bool,
    /// Only this customer
    pub customer: Option<String>,
    /// Row cap
    pub limit: Option<usize>,
}

impl HeaderQuery {
    /// Default selection: NEW and PENDING, plus ERROR when retrying failures.
    pub fn pending(retry_failed: bool) -> Self {
        let mut states = vec![SyncState::New, SyncState::Pending];
        if retry_failed {
            states.push(SyncState::Error);
        }
        Self {
            states,
            include_resumable: true,
            customer: None,
            limit: None,
        }
    }

    /// Restrict to one customer.
    pub fn customer(mut self, customer: Option<String>) -> Self {
        self.customer = customer;
        self
    }

    /// Cap the number of rows.
    pub fn limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }
}

/// Row counts per table and sync state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    /// table -> state -> count
    pub tables: BTreeMap<String, BTreeMap<String, i64>>,
}

impl StatusReport {
    /// Rows in a state across all tables.
    pub fn count(&self, state: SyncState) -> i64 {
        self.tables
            .values()
            .filter_map(|states| states.get(state.as_str()))
            .sum()
    }

    /// Rows still waiting (NEW, PENDING or ERROR).
    pub fn outstanding(&self) -> i64 {
        self.count(SyncState::New) + self.count(SyncState::Pending) + self.count(SyncState::Error)
    }
}

/// Read/write access to the delta and main tables for the sync engine.
#[async_trait]
pub trait SyncStore: Send + Sync {
    /// Header delta rows selected by `query`, ordered by customer then record.
    async fn fetch_headers(&self, query: &HeaderQuery) -> Result<Vec<HeaderRecord>>;

    /// Lease headers for `run_id`; returns the ones actually claimed.
    ///
    /// Rows leased by another run whose lease has not expired are skipped.
    async fn claim(&self, run_id: &str, record_uuids: &[Uuid], lease: Duration)
    -> Result<Vec<Uuid>>;

    /// Drop every lease held by `run_id`.
    async fn release(&self, run_id: &str) -> Result<u64>;

    /// Unsynced line delta rows (NEW, PENDING, ERROR) of the given headers.
    async fn fetch_lines(&self, record_uuids: &[Uuid]) -> Result<Vec<LineRecord>>;

    /// Advance headers to the GROUPED stage.
    async fn mark_grouped(&self, record_uuids: &[Uuid]) -> Result<()>;

    /// Persist pass-one results to the header delta and cascade them to the main header table.
    async fn record_item_outcomes(&self, outcomes: &[ItemOutcome]) -> Result<()>;

    /// Persist pass-two results to the line delta, cascade them to the main line
    /// table, and promote headers whose lines are all synced to LINES_SYNCED.
    async fn record_line_outcomes(&self, outcomes: &[LineOutcome]) -> Result<()>;

    /// Row counts per table and state.
    async fn status(&self) -> Result<StatusReport>;
}

/// Sync-tracking columns each table must carry.
pub fn required_tracking_columns(tables: &TableNames) -> [(&str, &'static [&'static str]); 4] {
    use columns::*;
    [
        (
            tables.header.as_str(),
            &[SYNC_STATE, ACTION_TYPE, ROW_HASH, EXTERNAL_ITEM_ID, UPDATED_AT],
        ),
        (
            tables.header_delta.as_str(),
            &[
                SYNC_STATE,
                SYNC_STAGE,
                ACTION_TYPE,
                ROW_HASH,
                SYNC_ERROR,
                EXTERNAL_ITEM_ID,
                LEASE_OWNER,
                LEASE_EXPIRES_AT,
                UPDATED_AT,
                SYNCED_AT,
            ],
        ),
        (
            tables.line.as_str(),
            &[
                SIZE_CODE,
                QTY,
                ROW_HASH,
                SYNC_STATE,
                EXTERNAL_SUBITEM_ID,
                PARENT_EXTERNAL_ITEM_ID,
                UPDATED_AT,
            ],
        ),
        (
            tables.line_delta.as_str(),
            &[
                SIZE_CODE,
                QTY,
                ROW_HASH,
                SYNC_STATE,
                ACTION_TYPE,
                SYNC_ERROR,
                EXTERNAL_SUBITEM_ID,
                PARENT_EXTERNAL_ITEM_ID,
                UPDATED_AT,
            ],
        ),
    ]
}

/// Fail when any table lacks a sync-tracking column the statements rely on.
pub fn check_tracking_columns(catalog: &SchemaCatalog, tables: &TableNames) -> Result<()> {
    let missing: Vec<String> = required_tracking_columns(tables)
        .iter()
        .flat_map(|(table, cols)| {
            cols.iter()
                .filter(|c| !catalog.has_column(table, c))
                .map(move |c| format!("{}.{}", table, c))
        })
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::config(format!(
            "Missing sync-tracking columns: {}",
            missing.join(", ")
        )))
    }
}
