//! Shared test doubles: an in-memory four-table store and a scripted board.

#![allow(dead_code)]

use async_trait::async_trait;
use order_delta_sync::config::SAMPLE_CONFIG;
use order_delta_sync::model::{
    ActionType, HeaderRecord, ItemOutcome, LineOutcome, LineRecord, RecordPayload, RecordResult,
    SyncStage, SyncState,
};
use order_delta_sync::resolver::TableNames;
use order_delta_sync::schema::IntrospectedColumn;
use order_delta_sync::store::{
    HeaderQuery, SchemaSource, StatusReport, SyncStore, required_tracking_columns,
};
use order_delta_sync::{RemoteBoard, RemoteError, ResolvedConfig, Resolver, SyncConfig};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub const CUSTOMER: &str = "GREYSON";

/// Shared, ordered log of store writes and remote calls.
pub type EventLog = Arc<Mutex<Vec<String>>>;

// ---------------------------------------------------------------------------
// Schema fixture
// ---------------------------------------------------------------------------

const HEADER_COLUMNS: &[(&str, &str)] = &[
    ("record_uuid", "uuid"),
    ("AAG ORDER NUMBER", "text"),
    ("CUSTOMER NAME", "text"),
    ("CUSTOMER ALT PO", "text"),
    ("UNIT OF MEASURE", "text"),
    ("XS", "integer"),
    ("S", "integer"),
    ("M", "integer"),
    ("TOTAL QTY", "integer"),
];

pub struct FixtureSchema(HashMap<String, Vec<IntrospectedColumn>>);

#[async_trait]
impl SchemaSource for FixtureSchema {
    async fn table_columns(&self, table: &str) -> order_delta_sync::Result<Vec<IntrospectedColumn>> {
        Ok(self.0.get(table).cloned().unwrap_or_default())
    }
}

fn columns(business: &[(&str, &str)], tracking: &[&str]) -> Vec<IntrospectedColumn> {
    business
        .iter()
        .copied()
        .chain(tracking.iter().map(|c| (*c, "text")))
        .enumerate()
        .map(|(i, (name, ty))| IntrospectedColumn::new(name, ty, i as i32 + 1))
        .collect()
}

pub fn schema() -> FixtureSchema {
    let names = TableNames {
        header: "orders_unified".into(),
        line: "order_lines".into(),
        header_delta: "orders_unified_delta".into(),
        line_delta: "order_lines_delta".into(),
    };
    let tracking = required_tracking_columns(&names);
    let line = [("record_uuid", "uuid")];
    let mut tables = HashMap::new();
    tables.insert(names.header.clone(), columns(HEADER_COLUMNS, tracking[0].1));
    tables.insert(names.header_delta.clone(), columns(HEADER_COLUMNS, tracking[1].1));
    tables.insert(names.line.clone(), columns(&line, tracking[2].1));
    tables.insert(names.line_delta.clone(), columns(&line, tracking[3].1));
    FixtureSchema(tables)
}

/// The sample development environment, unpaced.
pub async fn resolved() -> ResolvedConfig {
    let config = SyncConfig::from_toml_str(SAMPLE_CONFIG).unwrap();
    let mut resolved = Resolver::new(&config)
        .resolve("development", &schema())
        .await
        .unwrap();
    resolved.batch.rate_limit_delay = Duration::ZERO;
    resolved.retry.initial_backoff_ms = 1;
    resolved.retry.max_backoff_ms = 20;
    resolved
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

pub fn header(n: u128, customer: &str) -> HeaderRecord {
    let mut fields = BTreeMap::new();
    fields.insert("record_uuid".to_string(), json!(Uuid::from_u128(n).to_string()));
    fields.insert("AAG ORDER NUMBER".to_string(), json!(format!("ORD-{:04}", n)));
    fields.insert("CUSTOMER NAME".to_string(), json!(customer));
    fields.insert("CUSTOMER ALT PO".to_string(), json!(format!("PO-{}", n)));
    fields.insert("TOTAL QTY".to_string(), json!(12));
    HeaderRecord {
        record_uuid: Uuid::from_u128(n),
        customer: customer.to_string(),
        sync_state: SyncState::Pending,
        sync_stage: SyncStage::New,
        action_type: ActionType::Insert,
        row_hash: Some(format!("hash-{}", n)),
        external_item_id: None,
        fields,
    }
}

pub fn line(n: u128, size: &str, qty: i64) -> LineRecord {
    let mut fields = BTreeMap::new();
    fields.insert("record_uuid".to_string(), json!(Uuid::from_u128(n).to_string()));
    fields.insert("size_code".to_string(), json!(size));
    fields.insert("qty".to_string(), json!(qty));
    LineRecord {
        record_uuid: Uuid::from_u128(n),
        size_code: size.to_string(),
        sync_state: SyncState::Pending,
        action_type: ActionType::Insert,
        row_hash: None,
        external_subitem_id: None,
        parent_external_item_id: None,
        fields,
    }
}

/// One customer, 20 headers, 29 lines: headers 1..=9 carry two sizes, 10..=20 one.
pub fn twenty_orders() -> (Vec<HeaderRecord>, Vec<LineRecord>) {
    let headers: Vec<HeaderRecord> = (1..=20).map(|n| header(n, CUSTOMER)).collect();
    let mut lines = Vec::new();
    for n in 1..=20u128 {
        lines.push(line(n, "S", 4));
        if n <= 9 {
            lines.push(line(n, "M", 2));
        }
    }
    (headers, lines)
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct MainHeader {
    pub sync_state: SyncState,
    pub external_item_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MainLine {
    pub sync_state: SyncState,
    pub external_subitem_id: Option<String>,
    pub parent_external_item_id: Option<String>,
}

/// [`SyncStore`] over vectors, with the main tables as maps.
pub struct MemoryStore {
    pub headers: Mutex<Vec<HeaderRecord>>,
    pub lines: Mutex<Vec<LineRecord>>,
    pub main_headers: Mutex<HashMap<Uuid, MainHeader>>,
    pub main_lines: Mutex<HashMap<(Uuid, String), MainLine>>,
    pub leases: Mutex<HashMap<Uuid, String>>,
    pub errors: Mutex<HashMap<Uuid, String>>,
    pub events: EventLog,
    /// Makes `mark_grouped` fail, as a lost connection would.
    pub fail_mark_grouped: AtomicBool,
}

impl MemoryStore {
    pub fn new(headers: Vec<HeaderRecord>, lines: Vec<LineRecord>, events: EventLog) -> Self {
        Self {
            headers: Mutex::new(headers),
            lines: Mutex::new(lines),
            main_headers: Mutex::new(HashMap::new()),
            main_lines: Mutex::new(HashMap::new()),
            leases: Mutex::new(HashMap::new()),
            errors: Mutex::new(HashMap::new()),
            events,
            fail_mark_grouped: AtomicBool::new(false),
        }
    }

    pub fn header(&self, n: u128) -> HeaderRecord {
        let uuid = Uuid::from_u128(n);
        self.headers
            .lock()
            .unwrap()
            .iter()
            .find(|h| h.record_uuid == uuid)
            .cloned()
            .unwrap()
    }

    pub fn lines_of(&self, n: u128) -> Vec<LineRecord> {
        let uuid = Uuid::from_u128(n);
        self.lines
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.record_uuid == uuid)
            .cloned()
            .collect()
    }

    pub fn count_headers(&self, state: SyncState) -> usize {
        self.headers
            .lock()
            .unwrap()
            .iter()
            .filter(|h| h.sync_state == state)
            .count()
    }

    pub fn count_lines(&self, state: SyncState) -> usize {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.sync_state == state)
            .count()
    }

    fn log(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }
}

fn tally<'a>(states: impl Iterator<Item = &'a SyncState>) -> BTreeMap<String, i64> {
    let mut counts = BTreeMap::new();
    for state in states {
        *counts.entry(state.as_str().to_string()).or_insert(0) += 1;
    }
    counts
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn fetch_headers(&self, query: &HeaderQuery) -> order_delta_sync::Result<Vec<HeaderRecord>> {
        let mut rows: Vec<HeaderRecord> = self
            .headers
            .lock()
            .unwrap()
            .iter()
            .filter(|h| {
                query.states.contains(&h.sync_state)
                    || (query.include_resumable && h.sync_stage == SyncStage::ItemSynced)
            })
            .filter(|h| query.customer.as_deref().is_none_or(|c| c == h.customer))
            .cloned()
            .collect();
        rows.sort_by(|a, b| (&a.customer, a.record_uuid).cmp(&(&b.customer, b.record_uuid)));
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn claim(
        &self,
        run_id: &str,
        record_uuids: &[Uuid],
        _lease: Duration,
    ) -> order_delta_sync::Result<Vec<Uuid>> {
        let mut leases = self.leases.lock().unwrap();
        let mut claimed = Vec::new();
        for id in record_uuids {
            let free = leases.get(id).is_none_or(|owner| owner == run_id);
            if free {
                leases.insert(*id, run_id.to_string());
                claimed.push(*id);
            }
        }
        Ok(claimed)
    }

    async fn release(&self, run_id: &str) -> order_delta_sync::Result<u64> {
        let mut leases = self.leases.lock().unwrap();
        let before = leases.len();
        leases.retain(|_, owner| owner != run_id);
        Ok((before - leases.len()) as u64)
    }

    async fn fetch_lines(&self, record_uuids: &[Uuid]) -> order_delta_sync::Result<Vec<LineRecord>> {
        let wanted: HashSet<&Uuid> = record_uuids.iter().collect();
        let mut rows: Vec<LineRecord> = self
            .lines
            .lock()
            .unwrap()
            .iter()
            .filter(|l| wanted.contains(&l.record_uuid) && l.sync_state != SyncState::Synced)
            .cloned()
            .collect();
        rows.sort_by(|a, b| (a.record_uuid, &a.size_code).cmp(&(b.record_uuid, &b.size_code)));
        Ok(rows)
    }

    async fn mark_grouped(&self, record_uuids: &[Uuid]) -> order_delta_sync::Result<()> {
        if self.fail_mark_grouped.load(Ordering::SeqCst) {
            return Err(order_delta_sync::Error::validation("connection reset"));
        }
        for h in self.headers.lock().unwrap().iter_mut() {
            if record_uuids.contains(&h.record_uuid)
                && matches!(h.sync_stage, SyncStage::New | SyncStage::Error)
            {
                h.sync_stage = SyncStage::Grouped;
            }
        }
        Ok(())
    }

    async fn record_item_outcomes(&self, outcomes: &[ItemOutcome]) -> order_delta_sync::Result<()> {
        self.log(format!("persist_items:{}", outcomes.len()));
        let mut headers = self.headers.lock().unwrap();
        let mut main = self.main_headers.lock().unwrap();
        let mut errors = self.errors.lock().unwrap();
        for outcome in outcomes {
            let Some(h) = headers.iter_mut().find(|h| h.record_uuid == outcome.record_uuid) else {
                continue;
            };
            if outcome.external_item_id.is_some() {
                h.external_item_id = outcome.external_item_id.clone();
            }
            h.sync_state = outcome.sync_state;
            h.sync_stage = outcome.sync_stage;
            match &outcome.error {
                Some(e) => errors.insert(h.record_uuid, e.clone()),
                None => errors.remove(&h.record_uuid),
            };
            main.insert(
                h.record_uuid,
                MainHeader {
                    sync_state: h.sync_state,
                    external_item_id: h.external_item_id.clone(),
                },
            );
        }
        Ok(())
    }

    async fn record_line_outcomes(&self, outcomes: &[LineOutcome]) -> order_delta_sync::Result<()> {
        self.log(format!("persist_lines:{}", outcomes.len()));
        let mut lines = self.lines.lock().unwrap();
        let mut main = self.main_lines.lock().unwrap();
        for outcome in outcomes {
            let Some(l) = lines.iter_mut().find(|l| {
                l.record_uuid == outcome.record_uuid && l.size_code == outcome.size_code
            }) else {
                continue;
            };
            if outcome.external_subitem_id.is_some() {
                l.external_subitem_id = outcome.external_subitem_id.clone();
            }
            l.parent_external_item_id = Some(outcome.parent_external_item_id.clone());
            l.sync_state = outcome.sync_state;
            main.insert(
                (l.record_uuid, l.size_code.clone()),
                MainLine {
                    sync_state: l.sync_state,
                    external_subitem_id: l.external_subitem_id.clone(),
                    parent_external_item_id: l.parent_external_item_id.clone(),
                },
            );
        }

        let touched: HashSet<Uuid> = outcomes.iter().map(|o| o.record_uuid).collect();
        let mut headers = self.headers.lock().unwrap();
        for h in headers.iter_mut() {
            if touched.contains(&h.record_uuid)
                && h.sync_state == SyncState::Synced
                && lines
                    .iter()
                    .filter(|l| l.record_uuid == h.record_uuid)
                    .all(|l| l.sync_state == SyncState::Synced)
            {
                h.sync_stage = SyncStage::LinesSynced;
            }
        }
        Ok(())
    }

    async fn status(&self) -> order_delta_sync::Result<StatusReport> {
        let mut report = StatusReport::default();
        let headers = self.headers.lock().unwrap();
        let lines = self.lines.lock().unwrap();
        report.tables.insert(
            "orders_unified_delta".into(),
            tally(headers.iter().map(|h| &h.sync_state)),
        );
        report.tables.insert(
            "order_lines_delta".into(),
            tally(lines.iter().map(|l| &l.sync_state)),
        );
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Scripted board
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Group,
    Items,
    Subitems,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub kind: CallKind,
    pub payloads: Vec<RecordPayload>,
}

/// Remote board that assigns sequential ids and records every call.
///
/// Batches larger than `max_ok_batch` time out; records in `rejected` fail
/// individually.
pub struct FakeBoard {
    pub calls: Mutex<Vec<Call>>,
    pub groups: Mutex<HashMap<String, String>>,
    pub rejected: Mutex<HashSet<String>>,
    pub rejected_groups: Mutex<HashSet<String>>,
    pub max_ok_batch: usize,
    pub events: EventLog,
    next_id: AtomicUsize,
}

impl FakeBoard {
    pub fn new(events: EventLog) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            groups: Mutex::new(HashMap::new()),
            rejected: Mutex::new(HashSet::new()),
            rejected_groups: Mutex::new(HashSet::new()),
            max_ok_batch: usize::MAX,
            events,
            next_id: AtomicUsize::new(1000),
        }
    }

    pub fn with_max_ok_batch(mut self, max: usize) -> Self {
        self.max_ok_batch = max;
        self
    }

    pub fn reject(&self, record_id: impl Into<String>) {
        self.rejected.lock().unwrap().insert(record_id.into());
    }

    pub fn reject_group(&self, name: impl Into<String>) {
        self.rejected_groups.lock().unwrap().insert(name.into());
    }

    pub fn calls_of(&self, kind: CallKind) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.kind == kind)
            .cloned()
            .collect()
    }

    pub fn batch_sizes(&self, kind: CallKind) -> Vec<usize> {
        self.calls_of(kind).iter().map(|c| c.payloads.len()).collect()
    }

    fn answer(
        &self,
        kind: CallKind,
        records: &[RecordPayload],
    ) -> Result<Vec<RecordResult>, RemoteError> {
        self.calls.lock().unwrap().push(Call {
            kind,
            payloads: records.to_vec(),
        });
        self.events
            .lock()
            .unwrap()
            .push(format!("{:?}:{}", kind, records.len()));
        if records.len() > self.max_ok_batch {
            return Err(RemoteError::Transient("request timed out".into()));
        }
        let rejected = self.rejected.lock().unwrap();
        Ok(records
            .iter()
            .map(|r| {
                if rejected.contains(&r.record_id) {
                    return RecordResult::failure(&r.record_id, "invalid column value");
                }
                if kind == CallKind::Subitems && r.parent_external_item_id.is_none() {
                    return RecordResult::failure(&r.record_id, "missing parent");
                }
                let id = r.external_id.clone().unwrap_or_else(|| {
                    self.next_id.fetch_add(1, Ordering::SeqCst).to_string()
                });
                RecordResult::success(&r.record_id, id, r.is_update())
            })
            .collect())
    }
}

#[async_trait]
impl RemoteBoard for FakeBoard {
    async fn create_or_update_group(&self, name: &str) -> Result<String, RemoteError> {
        self.calls.lock().unwrap().push(Call {
            kind: CallKind::Group,
            payloads: Vec::new(),
        });
        if self.rejected_groups.lock().unwrap().contains(name) {
            return Err(RemoteError::Permanent(format!("group name '{}' is not allowed", name)));
        }
        let mut groups = self.groups.lock().unwrap();
        let next = format!("group_{}", groups.len() + 1);
        Ok(groups.entry(name.to_string()).or_insert(next).clone())
    }

    async fn create_or_update_items(
        &self,
        records: &[RecordPayload],
    ) -> Result<Vec<RecordResult>, RemoteError> {
        self.answer(CallKind::Items, records)
    }

    async fn create_or_update_subitems(
        &self,
        records: &[RecordPayload],
    ) -> Result<Vec<RecordResult>, RemoteError> {
        self.answer(CallKind::Subitems, records)
    }
}
