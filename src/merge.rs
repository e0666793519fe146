//! Change detection and merge into the delta tables.
//!
//! A run walks four phases, each gated on the previous one:
//!
//! 1. detect new vs existing orders per customer (business-key diff)
//! 2. resolve a remote group for every customer with new orders; a customer
//!    whose group cannot be resolved is reported and left to the sync pass
//! 3. merge changed headers into the header delta, in one transaction with
//!    mirroring the staged state onto the main header table
//! 4. unpivot the size columns of freshly staged headers into the line delta;
//!    text cells that are not a number are skipped and reported
//!
//! Phases 3 and 4 are idempotent: re-running them on unchanged data stages
//! nothing.

use crate::api::ApiClient;
use crate::error::{Error, Result};
use crate::resolver::ResolvedConfig;
use crate::schema::Ident;
use crate::sql;
use crate::store::{SqlRunner, check_tracking_columns};
use crate::templates::{TemplateContext, TemplateEngine};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// New/existing order counts for one customer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CustomerDetection {
    /// Orders whose business key was never staged
    pub new_orders: i64,
    /// Orders already staged
    pub existing_orders: i64,
}

/// Outcome of a merge run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MergeReport {
    /// Per-customer detection counts
    pub detection: BTreeMap<String, CustomerDetection>,
    /// Customer -> remote group id for customers with new orders
    pub groups: BTreeMap<String, String>,
    /// Customer -> reason, for customers whose group could not be resolved
    pub group_errors: BTreeMap<String, String>,
    /// Header rows inserted or changed in the header delta
    pub headers_staged: u64,
    /// Main header rows whose state was mirrored
    pub headers_mirrored: u64,
    /// Line rows inserted or changed in the line delta
    pub lines_staged: u64,
    /// Filled-in text size cells that were not a number and got no line
    pub invalid_size_cells: u64,
    /// Whether the unpivot phase was skipped for lack of size columns
    pub unpivot_skipped: bool,
}

impl MergeReport {
    /// Customers that have at least one new order.
    pub fn customers_with_new_orders(&self) -> Vec<&str> {
        self.detection
            .iter()
            .filter(|(_, d)| d.new_orders > 0)
            .map(|(c, _)| c.as_str())
            .collect()
    }
}

/// Rendered statements for the four phases.
#[derive(Debug, Clone)]
pub struct MergePlan {
    detect: String,
    merge_headers: String,
    mirror_state: String,
    unpivot_lines: Option<String>,
    invalid_sizes: Option<String>,
}

impl MergePlan {
    /// Render and validate every merge statement for a resolved configuration.
    pub fn render(engine: &TemplateEngine, resolved: &ResolvedConfig) -> Result<Self> {
        let catalog = &resolved.catalog;
        let tables = &resolved.tables;
        let keys = &resolved.keys;
        check_tracking_columns(catalog, tables)?;

        let header = catalog.table_ident(&tables.header)?;
        let header_delta = catalog.table_ident(&tables.header_delta)?;
        let line_delta = catalog.table_ident(&tables.line_delta)?;
        let header_rid = catalog.column(&tables.header, &keys.record_id)?;
        let delta_rid = catalog.column(&tables.header_delta, &keys.record_id)?;
        let line_rid = catalog.column(&tables.line_delta, &keys.record_id)?;
        let header_schema = catalog.table(&tables.header)?;

        // Business columns present on both header tables are copied.
        let mut copy_names = Vec::new();
        for column in sql::business_columns(header_schema.columns(), &[]) {
            if catalog.has_column(&tables.header_delta, &column.name) {
                copy_names.push(column.name.clone());
            } else {
                debug!("{} is not on {}; not staged", column.name, tables.header_delta);
            }
        }
        if !copy_names.contains(&keys.record_id) {
            return Err(Error::config(format!(
                "{} must carry the record id column '{}'",
                tables.header_delta, keys.record_id
            )));
        }
        let copy_columns = catalog.columns(&tables.header_delta, &copy_names)?;
        let source_columns = catalog.columns(&tables.header, &copy_names)?;
        let assignments: Vec<Ident> = copy_columns
            .iter()
            .filter(|c| c.raw() != keys.record_id)
            .cloned()
            .collect();

        let hash_names: Vec<String> =
            sql::business_columns(header_schema.columns(), &resolved.hash_exclude)
                .into_iter()
                .map(|c| c.name.clone())
                .collect();
        let hash_columns = catalog.columns(&tables.header, &hash_names)?;

        let business_key = catalog.columns(&tables.header, &keys.business_key)?;
        catalog.columns(&tables.header_delta, &keys.business_key)?;

        let detect = engine.render(
            "detect_new_orders",
            &TemplateContext::new()
                .ident("customer", catalog.column(&tables.header, &keys.customer)?)
                .ident("record_id", delta_rid.clone())
                .ident("header_table", header.clone())
                .ident("header_delta_table", header_delta.clone())
                .fragment("business_key_match", sql::key_match("h", "d", &business_key)),
        )?;

        let merge_headers = engine.render(
            "merge_headers",
            &TemplateContext::new()
                .ident("header_delta_table", header_delta.clone())
                .idents("copy_columns", copy_columns)
                .fragment("source_columns", sql::qualified_list("src", &source_columns))
                .fragment("hash_expr", sql::hash_expression("h", &hash_columns))
                .ident("header_table", header.clone())
                .ident("record_id", delta_rid.clone())
                .fragment("update_assignments", sql::excluded_assignments(&assignments)),
        )?;

        let mirror_state = engine.render(
            "mirror_header_state",
            &TemplateContext::new()
                .ident("header_table", header.clone())
                .ident("header_delta_table", header_delta.clone())
                .ident("record_id", header_rid),
        )?;

        let unpivot_lines = if resolved.size_columns.is_empty() {
            None
        } else {
            for size in &resolved.size_columns {
                if !catalog.has_column(&tables.header_delta, size.code()) {
                    return Err(Error::config(format!(
                        "Size column '{}' is missing from {}",
                        size.code(),
                        tables.header_delta
                    )));
                }
            }
            Some(engine.render(
                "unpivot_lines",
                &TemplateContext::new()
                    .ident("line_delta_table", line_delta)
                    .ident("line_record_id", line_rid)
                    .ident("record_id", delta_rid.clone())
                    .ident("header_delta_table", header_delta.clone())
                    .fragment("size_values", sql::size_values("h", &resolved.size_columns)),
            )?)
        };

        let raw_sizes = sql::raw_size_values("h", &resolved.size_columns);
        let invalid_sizes = if raw_sizes.is_empty() {
            None
        } else {
            Some(engine.render(
                "find_invalid_sizes",
                &TemplateContext::new()
                    .ident("record_id", delta_rid)
                    .ident("header_delta_table", header_delta)
                    .fragment("raw_size_values", raw_sizes)
                    .fragment("quantity_pattern", sql::literal(sql::QUANTITY_PATTERN)),
            )?)
        };

        Ok(Self {
            detect,
            merge_headers,
            mirror_state,
            unpivot_lines,
            invalid_sizes,
        })
    }

    /// Every rendered statement, labelled, for inspection.
    pub fn statements(&self) -> Vec<(&'static str, &str)> {
        let mut out = vec![
            ("detect_new_orders", self.detect.as_str()),
            ("merge_headers", self.merge_headers.as_str()),
            ("mirror_header_state", self.mirror_state.as_str()),
        ];
        if let Some(unpivot) = &self.unpivot_lines {
            out.push(("unpivot_lines", unpivot.as_str()));
        }
        if let Some(invalid) = &self.invalid_sizes {
            out.push(("find_invalid_sizes", invalid.as_str()));
        }
        out
    }
}

/// Rejected size cells logged individually before only a total is given.
const INVALID_SIZE_LOG_LIMIT: usize = 20;

/// Runs the four merge phases against a SQL runner and the remote board.
pub struct MergeOrchestrator {
    runner: Arc<dyn SqlRunner>,
    api: Arc<ApiClient>,
    plan: MergePlan,
}

impl MergeOrchestrator {
    /// Create an orchestrator with a pre-rendered plan.
    pub fn new(runner: Arc<dyn SqlRunner>, api: Arc<ApiClient>, plan: MergePlan) -> Self {
        Self { runner, api, plan }
    }

    /// Run all phases.
    ///
    /// Detection, merge and unpivot failures abort before later phases
    /// start. A group failure only affects its own customer.
    #[instrument(skip(self))]
    pub async fn run(&self, dry_run: bool) -> Result<MergeReport> {
        let mut report = MergeReport {
            detection: self.detect().await?,
            ..Default::default()
        };
        info!(
            "Detected {} customers, {} with new orders",
            report.detection.len(),
            report.customers_with_new_orders().len()
        );

        let customers: Vec<String> = report
            .customers_with_new_orders()
            .into_iter()
            .map(str::to_string)
            .collect();
        for customer in customers {
            match self.api.ensure_group(&customer, dry_run).await {
                Ok(group) => {
                    report.groups.insert(customer, group);
                }
                Err(e) => {
                    warn!("Group for '{}' could not be resolved: {}", customer, e);
                    report.group_errors.insert(customer, e.to_string());
                }
            }
        }

        let merged = self
            .runner
            .execute_atomic(
                "merge_headers",
                &[self.plan.merge_headers.clone(), self.plan.mirror_state.clone()],
            )
            .await
            .map_err(|e| Error::sync("header merge", e.to_string()))?;
        report.headers_staged = merged.first().copied().unwrap_or(0);
        report.headers_mirrored = merged.get(1).copied().unwrap_or(0);
        info!(
            "Staged {} header rows ({} mirrored)",
            report.headers_staged, report.headers_mirrored
        );

        match &self.plan.unpivot_lines {
            Some(unpivot) => {
                let staged = self
                    .runner
                    .execute_atomic("unpivot_lines", std::slice::from_ref(unpivot))
                    .await
                    .map_err(|e| Error::sync("line unpivot", e.to_string()))?;
                report.lines_staged = staged.first().copied().unwrap_or(0);
                info!("Staged {} line rows", report.lines_staged);
                report.invalid_size_cells = self.report_invalid_sizes().await;
            }
            None => {
                warn!("No size columns discovered; line unpivot skipped");
                report.unpivot_skipped = true;
            }
        }

        Ok(report)
    }

    /// Count and log size cells the unpivot skipped as non-numeric.
    async fn report_invalid_sizes(&self) -> u64 {
        let Some(sql) = &self.plan.invalid_sizes else {
            return 0;
        };
        let rows = match self.runner.query_rows(sql).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Could not check size cells for non-numeric values: {}", e);
                return 0;
            }
        };
        for row in rows.iter().take(INVALID_SIZE_LOG_LIMIT) {
            let text = |key: &str| row.get(key).and_then(|v| v.as_str()).unwrap_or("?").to_string();
            warn!(
                "Order {} size {}: '{}' is not a quantity; no line staged",
                text("record_id"),
                text("size_code"),
                text("raw_value")
            );
        }
        if rows.len() > INVALID_SIZE_LOG_LIMIT {
            warn!(
                "{} more non-numeric size cells not shown",
                rows.len() - INVALID_SIZE_LOG_LIMIT
            );
        }
        rows.len() as u64
    }

    async fn detect(&self) -> Result<BTreeMap<String, CustomerDetection>> {
        let rows = self
            .runner
            .query_rows(&self.plan.detect)
            .await
            .map_err(|e| Error::sync("detect new orders", e.to_string()))?;

        let mut detection: BTreeMap<String, CustomerDetection> = BTreeMap::new();
        for row in rows {
            let Some(customer) = row.get("customer").and_then(|v| v.as_str()) else {
                warn!("Skipping orders without a customer");
                continue;
            };
            let count = row.get("orders").and_then(|v| v.as_i64()).unwrap_or(0);
            let entry = detection.entry(customer.to_string()).or_default();
            match row.get("order_status").and_then(|v| v.as_str()) {
                Some("NEW") => entry.new_orders += count,
                _ => entry.existing_orders += count,
            }
        }
        Ok(detection)
    }
}
