//! Two-pass sync of staged headers and lines to the remote board.
//!
//! Pass one creates or updates one remote item per header; pass two creates
//! or updates the sub-items of every header whose item is known, with the
//! parent item id injected into each payload. Pass two for a customer only
//! starts after the pass-one outcomes of that customer are persisted.

use crate::api::{ApiClient, Operation};
use crate::error::Result;
use crate::metrics::{MetricsSnapshot, Timer};
use crate::model::{
    CascadeUnit, HeaderRecord, ItemOutcome, LineOutcome, LineRecord, RecordPayload, RecordResult,
    RecordStatus, SyncStage, SyncState,
};
use crate::resolver::{ColumnMapping, ResolvedConfig};
use crate::store::{HeaderQuery, SyncStore};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Sync result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResult {
    /// Whether every selected record synced
    pub success: bool,
    /// Whether remote calls were simulated
    pub dry_run: bool,
    /// Run identifier used for leasing
    pub run_id: String,
    /// Headers selected but leased by another run
    pub skipped_leased: usize,
    /// Per-customer results
    pub customers: BTreeMap<String, CustomerSyncResult>,
    /// Total duration in milliseconds
    pub duration_ms: u64,
    /// Timestamp when sync completed
    pub completed_at: String,
    /// Remote call counters for the run
    pub metrics: MetricsSnapshot,
}

impl SyncResult {
    /// Items created or updated.
    pub fn total_items(&self) -> usize {
        self.customers.values().map(|c| c.created + c.updated).sum()
    }

    /// Sub-items created or updated.
    pub fn total_lines(&self) -> usize {
        self.customers
            .values()
            .map(|c| c.lines_created + c.lines_updated)
            .sum()
    }

    /// Headers and lines that ended in ERROR.
    pub fn total_failed(&self) -> usize {
        self.customers
            .values()
            .map(|c| c.failed + c.lines_failed)
            .sum()
    }
}

/// Per-customer sync result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerSyncResult {
    /// Remote group id
    pub group_id: Option<String>,
    /// Items created
    pub created: usize,
    /// Items updated
    pub updated: usize,
    /// Headers failed
    pub failed: usize,
    /// Sub-items created
    pub lines_created: usize,
    /// Sub-items updated
    pub lines_updated: usize,
    /// Lines failed
    pub lines_failed: usize,
    /// Remote item/sub-item calls issued
    pub batches: u64,
    /// Duration in milliseconds
    pub duration_ms: u64,
    /// Customer-level errors (group resolution, persistence)
    pub errors: Vec<String>,
}

impl CustomerSyncResult {
    /// Whether nothing failed for this customer.
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.lines_failed == 0 && self.errors.is_empty()
    }
}

/// Sync progress callback.
pub type ProgressCallback = Box<dyn Fn(SyncProgress) + Send + Sync>;

/// Sync progress update.
#[derive(Debug, Clone)]
pub struct SyncProgress {
    /// Customer being synced
    pub customer: String,
    /// Current phase
    pub phase: SyncPhase,
    /// Customers finished so far
    pub customers_done: usize,
    /// Customers in this run
    pub customers_total: usize,
}

/// Sync phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Resolving the customer group
    Grouping,
    /// Pass one
    Items,
    /// Pass two
    Lines,
    /// Customer finished
    Completed,
    /// Customer failed before pass two
    Failed,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncPhase::Grouping => write!(f, "grouping"),
            SyncPhase::Items => write!(f, "items"),
            SyncPhase::Lines => write!(f, "lines"),
            SyncPhase::Completed => write!(f, "completed"),
            SyncPhase::Failed => write!(f, "failed"),
        }
    }
}

/// The sync engine.
pub struct SyncEngine {
    store: Arc<dyn SyncStore>,
    api: Arc<ApiClient>,
    header_mapping: ColumnMapping,
    line_mapping: ColumnMapping,
    lease: Duration,
    retry_failed: bool,
    max_records: usize,
    run_id: String,
    progress_callback: Option<Arc<ProgressCallback>>,
}

impl SyncEngine {
    /// Create an engine for a resolved environment.
    pub fn new(store: Arc<dyn SyncStore>, api: Arc<ApiClient>, resolved: &ResolvedConfig) -> Self {
        Self {
            store,
            api,
            header_mapping: resolved.header_mapping.clone(),
            line_mapping: resolved.line_mapping.clone(),
            lease: resolved.lease,
            retry_failed: resolved.retry_failed,
            max_records: resolved.max_records,
            run_id: Uuid::new_v4().to_string(),
            progress_callback: None,
        }
    }

    /// Set progress callback.
    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(SyncProgress) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Arc::new(Box::new(callback)));
        self
    }

    /// Identifier this engine leases rows under.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Run one sync pass.
    ///
    /// Per-record and per-customer failures are reported in the result;
    /// only storage failures while selecting or leasing rows are returned
    /// as `Err`. Leases taken by this run are always released.
    #[instrument(skip(self), fields(run_id = %self.run_id))]
    pub async fn run(
        &self,
        limit: Option<usize>,
        customer_filter: Option<&str>,
        dry_run: bool,
    ) -> Result<SyncResult> {
        let timer = Timer::start("sync run");
        let limit = limit.or((self.max_records > 0).then_some(self.max_records));
        let query = HeaderQuery::pending(self.retry_failed)
            .customer(customer_filter.map(str::to_string))
            .limit(limit);

        let headers = self.store.fetch_headers(&query).await?;
        info!("Selected {} header rows", headers.len());

        let mut result = SyncResult {
            success: true,
            dry_run,
            run_id: self.run_id.clone(),
            skipped_leased: 0,
            customers: BTreeMap::new(),
            duration_ms: 0,
            completed_at: String::new(),
            metrics: MetricsSnapshot::default(),
        };

        if !headers.is_empty() {
            let ids: Vec<Uuid> = headers.iter().map(|h| h.record_uuid).collect();
            let claimed: HashSet<Uuid> = self
                .store
                .claim(&self.run_id, &ids, self.lease)
                .await?
                .into_iter()
                .collect();
            result.skipped_leased = headers.len() - claimed.len();
            if result.skipped_leased > 0 {
                warn!(
                    "{} header rows are leased by another run and were skipped",
                    result.skipped_leased
                );
            }
            let headers: Vec<HeaderRecord> = headers
                .into_iter()
                .filter(|h| claimed.contains(&h.record_uuid))
                .collect();

            let processed = self.process(headers, dry_run).await;
            if let Err(e) = self.store.release(&self.run_id).await {
                warn!("Failed to release leases of run {}: {}", self.run_id, e);
            }
            result.customers = processed?;
        }

        result.success = result.customers.values().all(|c| c.is_success());
        result.metrics = self.api.metrics();
        result.duration_ms = timer.stop();
        result.completed_at = chrono::Utc::now().to_rfc3339();

        if result.success {
            info!(
                "Sync completed in {}ms: {} items, {} sub-items",
                result.duration_ms,
                result.total_items(),
                result.total_lines()
            );
        } else {
            warn!(
                "Sync completed with errors in {}ms: {} items, {} sub-items, {} failed",
                result.duration_ms,
                result.total_items(),
                result.total_lines(),
                result.total_failed()
            );
        }
        Ok(result)
    }

    async fn process(
        &self,
        headers: Vec<HeaderRecord>,
        dry_run: bool,
    ) -> Result<BTreeMap<String, CustomerSyncResult>> {
        let ids: Vec<Uuid> = headers.iter().map(|h| h.record_uuid).collect();
        let lines = if ids.is_empty() {
            Vec::new()
        } else {
            self.store.fetch_lines(&ids).await?
        };
        let by_customer = group_units(headers, lines);

        let total = by_customer.len();
        let mut results = BTreeMap::new();
        for (done, (customer, units)) in by_customer.into_iter().enumerate() {
            let timer = Timer::start(format!("customer {}", customer));
            let before = self.api.metrics();
            let mut outcome = self
                .sync_customer(&customer, units, dry_run, done, total)
                .await;
            let after = self.api.metrics();
            outcome.batches = (after.item_calls + after.subitem_calls)
                - (before.item_calls + before.subitem_calls);
            outcome.duration_ms = timer.stop();
            results.insert(customer, outcome);
        }
        Ok(results)
    }

    #[instrument(skip(self, units, done, total), fields(headers = units.len()))]
    async fn sync_customer(
        &self,
        customer: &str,
        units: Vec<CascadeUnit>,
        dry_run: bool,
        done: usize,
        total: usize,
    ) -> CustomerSyncResult {
        let mut result = CustomerSyncResult::default();
        let progress = |phase| {
            self.report_progress(SyncProgress {
                customer: customer.to_string(),
                phase,
                customers_done: done,
                customers_total: total,
            })
        };

        progress(SyncPhase::Grouping);
        let group_id = match self.api.ensure_group(customer, dry_run).await {
            Ok(id) => id,
            Err(e) => {
                error!("Group for '{}' could not be resolved: {}", customer, e);
                self.fail_customer(
                    &units,
                    format!("group resolution failed: {}", e),
                    dry_run,
                    &mut result,
                )
                .await;
                progress(SyncPhase::Failed);
                return result;
            }
        };
        result.group_id = Some(group_id.clone());

        if !dry_run {
            let grouped: Vec<Uuid> = units
                .iter()
                .filter(|u| u.header.needs_item_sync())
                .map(|u| u.header.record_uuid)
                .collect();
            if !grouped.is_empty() {
                if let Err(e) = self.store.mark_grouped(&grouped).await {
                    error!("Could not record GROUPED stage for '{}': {}", customer, e);
                    self.fail_customer(
                        &units,
                        format!("recording GROUPED stage failed: {}", e),
                        dry_run,
                        &mut result,
                    )
                    .await;
                    progress(SyncPhase::Failed);
                    return result;
                }
            }
        }

        // Pass one
        progress(SyncPhase::Items);
        let (payloads, mut item_outcomes) = item_payloads(&units, &self.header_mapping, &group_id);
        let item_results = self
            .api
            .execute(Operation::CreateOrUpdateItems, payloads, dry_run)
            .await;
        let counts = Tally::of(&item_results);
        result.created += counts.created;
        result.updated += counts.updated;
        result.failed += counts.failed + item_outcomes.len();
        let parents = resolve_parents(&units, &item_results, &mut item_outcomes);

        if !self.persist_items(&item_outcomes, dry_run, &mut result).await {
            progress(SyncPhase::Failed);
            return result;
        }

        // Pass two
        progress(SyncPhase::Lines);
        let (line_payloads, mut line_outcomes, index) =
            line_payloads(&units, &parents, &self.line_mapping);
        let line_results = self
            .api
            .execute(Operation::CreateOrUpdateSubitems, line_payloads, dry_run)
            .await;
        let counts = Tally::of(&line_results);
        result.lines_created += counts.created;
        result.lines_updated += counts.updated;
        result.lines_failed += counts.failed + line_outcomes.len();
        line_outcomes.extend(line_results.iter().filter_map(|r| line_outcome(r, &index)));

        if !dry_run && !line_outcomes.is_empty() {
            if let Err(e) = self.store.record_line_outcomes(&line_outcomes).await {
                error!("Failed to persist line outcomes for '{}': {}", customer, e);
                result.errors.push(format!("persisting line outcomes: {}", e));
            }
        }

        info!(
            "'{}': {} created, {} updated, {} failed; lines {} created, {} updated, {} failed",
            customer,
            result.created,
            result.updated,
            result.failed,
            result.lines_created,
            result.lines_updated,
            result.lines_failed
        );
        progress(SyncPhase::Completed);
        result
    }

    /// Put every header of the customer that still needs its item into ERROR.
    async fn fail_customer(
        &self,
        units: &[CascadeUnit],
        message: String,
        dry_run: bool,
        result: &mut CustomerSyncResult,
    ) {
        let outcomes: Vec<ItemOutcome> = units
            .iter()
            .filter(|u| u.header.needs_item_sync())
            .map(|u| failed_item(u.header.record_uuid, &message))
            .collect();
        result.failed = outcomes.len();
        result.errors.push(message);
        self.persist_items(&outcomes, dry_run, result).await;
    }

    /// Persist pass-one outcomes; false when pass two must not run.
    async fn persist_items(
        &self,
        outcomes: &[ItemOutcome],
        dry_run: bool,
        result: &mut CustomerSyncResult,
    ) -> bool {
        if dry_run || outcomes.is_empty() {
            return true;
        }
        match self.store.record_item_outcomes(outcomes).await {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to persist item outcomes: {}", e);
                result.errors.push(format!("persisting item outcomes: {}", e));
                false
            }
        }
    }

    /// Report progress via callback.
    fn report_progress(&self, progress: SyncProgress) {
        if let Some(ref callback) = self.progress_callback {
            callback(progress);
        }
    }
}

/// Created/updated/failed counts of one pass.
///
/// A result only counts as synced when it carries the remote id; anything
/// else is persisted as ERROR and counted as failed here too.
#[derive(Debug, Default, PartialEq, Eq)]
struct Tally {
    created: usize,
    updated: usize,
    failed: usize,
}

impl Tally {
    fn of(results: &[RecordResult]) -> Self {
        let mut tally = Self::default();
        for r in results {
            match (r.status, r.external_id.is_some()) {
                (RecordStatus::Created, true) => tally.created += 1,
                (RecordStatus::Updated, true) => tally.updated += 1,
                _ => tally.failed += 1,
            }
        }
        tally
    }
}

/// Group headers by customer and attach each header's lines.
fn group_units(
    headers: Vec<HeaderRecord>,
    lines: Vec<LineRecord>,
) -> BTreeMap<String, Vec<CascadeUnit>> {
    let mut lines_by_header: HashMap<Uuid, Vec<LineRecord>> = HashMap::new();
    for line in lines {
        lines_by_header.entry(line.record_uuid).or_default().push(line);
    }

    let mut units: BTreeMap<String, Vec<CascadeUnit>> = BTreeMap::new();
    for header in headers {
        let lines = lines_by_header.remove(&header.record_uuid).unwrap_or_default();
        units
            .entry(header.customer.clone())
            .or_default()
            .push(CascadeUnit { header, lines });
    }
    for orphan in lines_by_header.keys() {
        debug!("Lines of {} have no selected header", orphan);
    }
    units
}

/// Pass-one payloads for headers that need their item synced.
///
/// Headers that fail mapping come back as ERROR outcomes instead.
fn item_payloads(
    units: &[CascadeUnit],
    mapping: &ColumnMapping,
    group_id: &str,
) -> (Vec<RecordPayload>, Vec<ItemOutcome>) {
    let mut payloads = Vec::new();
    let mut failed = Vec::new();
    for unit in units.iter().filter(|u| u.header.needs_item_sync()) {
        let header = &unit.header;
        match mapping.map_record(header.record_uuid.to_string(), &header.fields) {
            Ok(mut payload) => {
                payload.group_id = Some(group_id.to_string());
                payload.external_id = header.external_item_id.clone();
                payloads.push(payload);
            }
            Err(e) => {
                warn!("Header {} not sent: {}", header.record_uuid, e);
                failed.push(failed_item(header.record_uuid, e.to_string()));
            }
        }
    }
    (payloads, failed)
}

/// Turn pass-one results into outcomes and collect the parent item id of
/// every header whose lines may be sent.
///
/// Headers resumed from an earlier run keep their stored item id.
fn resolve_parents(
    units: &[CascadeUnit],
    results: &[RecordResult],
    outcomes: &mut Vec<ItemOutcome>,
) -> HashMap<Uuid, String> {
    let by_id: HashMap<&str, &RecordResult> =
        results.iter().map(|r| (r.record_id.as_str(), r)).collect();
    let mut parents = HashMap::new();

    for unit in units {
        let uuid = unit.header.record_uuid;
        let stage_after_item = if unit.lines.is_empty() {
            SyncStage::LinesSynced
        } else {
            SyncStage::ItemSynced
        };

        if !unit.header.needs_item_sync() {
            if let Some(id) = unit.header.external_item_id.clone() {
                if unit.lines.is_empty() {
                    outcomes.push(synced_item(uuid, id.clone(), SyncStage::LinesSynced));
                }
                parents.insert(uuid, id);
            }
            continue;
        }

        let Some(result) = by_id.get(uuid.to_string().as_str()) else {
            continue;
        };
        match (&result.external_id, result.is_success()) {
            (Some(id), true) => {
                outcomes.push(synced_item(uuid, id.clone(), stage_after_item));
                parents.insert(uuid, id.clone());
            }
            _ => outcomes.push(failed_item(
                uuid,
                result.error.clone().unwrap_or_else(|| "unknown error".into()),
            )),
        }
    }
    parents
}

/// Where a pass-two result belongs: header, size code, parent item id.
type LineIndex = HashMap<String, (Uuid, String, String)>;

/// Pass-two payloads for the lines of every header with a known parent item.
fn line_payloads(
    units: &[CascadeUnit],
    parents: &HashMap<Uuid, String>,
    mapping: &ColumnMapping,
) -> (Vec<RecordPayload>, Vec<LineOutcome>, LineIndex) {
    let mut payloads = Vec::new();
    let mut failed = Vec::new();
    let mut index = LineIndex::new();

    for unit in units {
        let Some(parent) = parents.get(&unit.header.record_uuid) else {
            continue;
        };
        for line in &unit.lines {
            let record_id = line.record_id();
            match mapping.map_record(record_id.clone(), &line.fields) {
                Ok(mut payload) => {
                    payload.parent_external_item_id = Some(parent.clone());
                    payload.external_id = line.external_subitem_id.clone();
                    index.insert(
                        record_id,
                        (line.record_uuid, line.size_code.clone(), parent.clone()),
                    );
                    payloads.push(payload);
                }
                Err(e) => {
                    warn!("Line {} not sent: {}", record_id, e);
                    failed.push(LineOutcome {
                        record_uuid: line.record_uuid,
                        size_code: line.size_code.clone(),
                        external_subitem_id: None,
                        parent_external_item_id: parent.clone(),
                        sync_state: SyncState::Error,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
    }
    (payloads, failed, index)
}

fn line_outcome(result: &RecordResult, index: &LineIndex) -> Option<LineOutcome> {
    let (record_uuid, size_code, parent) = index.get(&result.record_id)?;
    let synced = result.is_success() && result.external_id.is_some();
    Some(LineOutcome {
        record_uuid: *record_uuid,
        size_code: size_code.clone(),
        external_subitem_id: result.external_id.clone(),
        parent_external_item_id: parent.clone(),
        sync_state: if synced {
            SyncState::Synced
        } else {
            SyncState::Error
        },
        error: if synced {
            None
        } else {
            Some(result.error.clone().unwrap_or_else(|| "unknown error".into()))
        },
    })
}

fn synced_item(record_uuid: Uuid, external_item_id: String, stage: SyncStage) -> ItemOutcome {
    ItemOutcome {
        record_uuid,
        external_item_id: Some(external_item_id),
        sync_state: SyncState::Synced,
        sync_stage: stage,
        error: None,
    }
}

fn failed_item(record_uuid: Uuid, error: impl Into<String>) -> ItemOutcome {
    ItemOutcome {
        record_uuid,
        external_item_id: None,
        sync_state: SyncState::Error,
        sync_stage: SyncStage::Error,
        error: Some(error.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ActionType;
    use serde_json::json;

    fn mapping(pairs: &[(&str, &str)]) -> ColumnMapping {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ColumnMapping::new(&map).unwrap()
    }

    fn header(n: u128, stage: SyncStage, external: Option<&str>) -> HeaderRecord {
        let mut fields = BTreeMap::new();
        fields.insert("AAG ORDER NUMBER".to_string(), json!(format!("ORD-{}", n)));
        HeaderRecord {
            record_uuid: Uuid::from_u128(n),
            customer: "GREYSON".into(),
            sync_state: SyncState::Pending,
            sync_stage: stage,
            action_type: ActionType::Insert,
            row_hash: None,
            external_item_id: external.map(str::to_string),
            fields,
        }
    }

    fn line(n: u128, size: &str) -> LineRecord {
        let mut fields = BTreeMap::new();
        fields.insert("size_code".to_string(), json!(size));
        fields.insert("qty".to_string(), json!(4));
        LineRecord {
            record_uuid: Uuid::from_u128(n),
            size_code: size.into(),
            sync_state: SyncState::Pending,
            action_type: ActionType::Insert,
            row_hash: None,
            external_subitem_id: None,
            parent_external_item_id: None,
            fields,
        }
    }

    fn unit(header: HeaderRecord, lines: Vec<LineRecord>) -> CascadeUnit {
        CascadeUnit { header, lines }
    }

    #[test]
    fn test_group_units_by_customer() {
        let mut other = header(3, SyncStage::New, None);
        other.customer = "ACME".into();
        let grouped = group_units(
            vec![header(1, SyncStage::New, None), header(2, SyncStage::New, None), other],
            vec![line(1, "XS"), line(1, "S"), line(2, "M"), line(9, "L")],
        );
        assert_eq!(grouped.keys().collect::<Vec<_>>(), vec!["ACME", "GREYSON"]);
        let greyson = &grouped["GREYSON"];
        assert_eq!(greyson[0].lines.len(), 2);
        assert_eq!(greyson[1].lines.len(), 1);
        assert!(grouped["ACME"][0].lines.is_empty());
    }

    #[test]
    fn test_item_payloads_carry_group_and_existing_id() {
        let units = vec![
            unit(header(1, SyncStage::New, None), vec![]),
            unit(header(2, SyncStage::Error, Some("555")), vec![]),
            unit(header(3, SyncStage::ItemSynced, Some("777")), vec![line(3, "S")]),
        ];
        let (payloads, failed) =
            item_payloads(&units, &mapping(&[("AAG ORDER NUMBER", "name")]), "grp");
        assert!(failed.is_empty());
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0].group_id.as_deref(), Some("grp"));
        assert_eq!(payloads[0].name, "ORD-1");
        assert_eq!(payloads[1].external_id.as_deref(), Some("555"));
    }

    #[test]
    fn test_item_payload_mapping_failure_becomes_error() {
        let units = vec![unit(header(1, SyncStage::New, None), vec![])];
        let (payloads, failed) = item_payloads(
            &units,
            &mapping(&[("AAG ORDER NUMBER", "name"), ("MISSING", "text")]),
            "grp",
        );
        assert!(payloads.is_empty());
        assert_eq!(failed[0].sync_state, SyncState::Error);
        assert_eq!(failed[0].sync_stage, SyncStage::Error);
    }

    #[test]
    fn test_resolve_parents() {
        let units = vec![
            unit(header(1, SyncStage::New, None), vec![line(1, "S")]),
            unit(header(2, SyncStage::New, None), vec![]),
            unit(header(3, SyncStage::New, None), vec![line(3, "M")]),
            unit(header(4, SyncStage::ItemSynced, Some("400")), vec![line(4, "L")]),
        ];
        let results = vec![
            RecordResult::success(Uuid::from_u128(1).to_string(), "100", false),
            RecordResult::success(Uuid::from_u128(2).to_string(), "200", false),
            RecordResult::failure(Uuid::from_u128(3).to_string(), "bad column"),
        ];
        let mut outcomes = Vec::new();
        let parents = resolve_parents(&units, &results, &mut outcomes);

        assert_eq!(parents.len(), 3);
        assert_eq!(parents[&Uuid::from_u128(1)], "100");
        assert_eq!(parents[&Uuid::from_u128(4)], "400");
        assert!(!parents.contains_key(&Uuid::from_u128(3)));

        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].sync_stage, SyncStage::ItemSynced);
        assert_eq!(outcomes[1].sync_stage, SyncStage::LinesSynced);
        assert_eq!(outcomes[2].error.as_deref(), Some("bad column"));
    }

    #[test]
    fn test_line_payloads_inject_parent() {
        let units = vec![
            unit(header(1, SyncStage::New, None), vec![line(1, "XS"), line(1, "S")]),
            unit(header(2, SyncStage::New, None), vec![line(2, "M")]),
        ];
        let mut parents = HashMap::new();
        parents.insert(Uuid::from_u128(1), "100".to_string());

        let (payloads, failed, index) = line_payloads(
            &units,
            &parents,
            &mapping(&[("size_code", "name"), ("qty", "numbers_qty")]),
        );
        assert!(failed.is_empty());
        assert_eq!(payloads.len(), 2);
        assert!(payloads
            .iter()
            .all(|p| p.parent_external_item_id.as_deref() == Some("100")));
        assert_eq!(payloads[0].column_values["numbers_qty"], json!("4"));

        let result = RecordResult::success(payloads[1].record_id.clone(), "s-2", false);
        let outcome = line_outcome(&result, &index).unwrap();
        assert_eq!(outcome.size_code, "S");
        assert_eq!(outcome.parent_external_item_id, "100");
        assert_eq!(outcome.sync_state, SyncState::Synced);
    }

    #[test]
    fn test_success_without_remote_id_counts_as_failed() {
        let mut orphan = RecordResult::success(Uuid::from_u128(2).to_string(), "", false);
        orphan.external_id = None;
        let results = vec![
            RecordResult::success(Uuid::from_u128(1).to_string(), "100", false),
            orphan,
            RecordResult::success(Uuid::from_u128(3).to_string(), "300", true),
            RecordResult::failure(Uuid::from_u128(4).to_string(), "bad column"),
        ];
        assert_eq!(
            Tally::of(&results),
            Tally {
                created: 1,
                updated: 1,
                failed: 2
            }
        );

        let units: Vec<CascadeUnit> = (1..=4)
            .map(|n| unit(header(n, SyncStage::New, None), vec![]))
            .collect();
        let mut outcomes = Vec::new();
        resolve_parents(&units, &results, &mut outcomes);
        let errors = outcomes
            .iter()
            .filter(|o| o.sync_state == SyncState::Error)
            .count();
        assert_eq!(errors, 2);
    }

    #[test]
    fn test_sync_result_totals() {
        let mut customers = BTreeMap::new();
        customers.insert(
            "GREYSON".to_string(),
            CustomerSyncResult {
                created: 18,
                updated: 2,
                lines_created: 29,
                ..Default::default()
            },
        );
        customers.insert(
            "ACME".to_string(),
            CustomerSyncResult {
                failed: 1,
                lines_failed: 2,
                ..Default::default()
            },
        );
        let result = SyncResult {
            success: false,
            dry_run: false,
            run_id: "r".into(),
            skipped_leased: 0,
            customers,
            duration_ms: 10,
            completed_at: "2024-01-01T00:00:00Z".into(),
            metrics: MetricsSnapshot::default(),
        };
        assert_eq!(result.total_items(), 20);
        assert_eq!(result.total_lines(), 29);
        assert_eq!(result.total_failed(), 3);
        assert!(!result.customers["ACME"].is_success());
    }

    #[test]
    fn test_sync_phase_display() {
        assert_eq!(SyncPhase::Items.to_string(), "items");
        assert_eq!(SyncPhase::Lines.to_string(), "lines");
    }
}
