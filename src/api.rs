//! External API client.
//!
//! [`ApiClient`] turns a list of mapped records into remote calls against a
//! [`RemoteBoard`]: one direct call for a single record, one batched call for
//! up to `max_batch_size` records, and concurrent batches beyond that. Every
//! call is paced and bounded by a timeout. A batch that fails transiently is
//! split along the fallback ladder (15 -> 5 -> 1 by default) until each
//! record ends with a definitive result.

use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::metrics::{CallKind, Metrics, MetricsSnapshot};
use crate::model::{RecordPayload, RecordResult};
use crate::resolver::BatchParams;
use async_trait::async_trait;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Failure of one remote call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// Timeout, rate limit, server overload; a smaller batch may succeed
    #[error("transient remote error: {0}")]
    Transient(String),
    /// The remote system rejected the request
    #[error("permanent remote error: {0}")]
    Permanent(String),
}

impl From<RemoteError> for Error {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::Transient(m) => Error::TransientApi(m),
            RemoteError::Permanent(m) => Error::PermanentApi(m),
        }
    }
}

/// The remote Customer-Group -> Item -> Sub-item hierarchy.
#[async_trait]
pub trait RemoteBoard: Send + Sync {
    /// Look a group up by name, creating it when absent. Returns the group id.
    async fn create_or_update_group(&self, name: &str) -> std::result::Result<String, RemoteError>;

    /// Create or update items. Results carry the input `record_id`.
    async fn create_or_update_items(
        &self,
        records: &[RecordPayload],
    ) -> std::result::Result<Vec<RecordResult>, RemoteError>;

    /// Create or update sub-items under `parent_external_item_id`.
    async fn create_or_update_subitems(
        &self,
        records: &[RecordPayload],
    ) -> std::result::Result<Vec<RecordResult>, RemoteError>;
}

/// Record-level remote operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Items under a group
    CreateOrUpdateItems,
    /// Sub-items under an item
    CreateOrUpdateSubitems,
}

impl Operation {
    fn kind(&self) -> CallKind {
        match self {
            Operation::CreateOrUpdateItems => CallKind::Item,
            Operation::CreateOrUpdateSubitems => CallKind::Subitem,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::CreateOrUpdateItems => write!(f, "create_or_update_items"),
            Operation::CreateOrUpdateSubitems => write!(f, "create_or_update_subitems"),
        }
    }
}

/// Enforces a minimum spacing between call starts, shared by concurrent batches.
#[derive(Debug)]
struct Pacer {
    delay: Duration,
    next_start: Mutex<Option<Instant>>,
}

impl Pacer {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            next_start: Mutex::new(None),
        }
    }

    async fn wait(&self) {
        if self.delay.is_zero() {
            return;
        }
        let mut next = self.next_start.lock().await;
        if let Some(at) = *next {
            if at > Instant::now() {
                tokio::time::sleep_until(at).await;
            }
        }
        *next = Some(Instant::now() + self.delay);
    }
}

/// Split records into consecutive batches of at most `size`.
pub fn partition<T>(records: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let size = size.max(1);
    let mut batches = Vec::with_capacity(records.len().div_ceil(size));
    let mut iter = records.into_iter().peekable();
    while iter.peek().is_some() {
        batches.push(iter.by_ref().take(size).collect());
    }
    batches
}

/// Create exponential backoff from config.
pub fn create_backoff(config: &RetryConfig) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(config.initial_backoff())
        .with_max_interval(config.max_backoff())
        .with_multiplier(config.multiplier)
        .with_max_elapsed_time(Some(config.max_elapsed()))
        .build()
}

/// Batching, pacing and fallback adapter over a [`RemoteBoard`].
pub struct ApiClient {
    board: Arc<dyn RemoteBoard>,
    params: BatchParams,
    retry: RetryConfig,
    pacer: Pacer,
    groups: Mutex<HashMap<String, String>>,
    metrics: Arc<Metrics>,
}

impl ApiClient {
    /// Create a client over a remote board.
    pub fn new(board: Arc<dyn RemoteBoard>, params: BatchParams, retry: RetryConfig) -> Self {
        Self {
            pacer: Pacer::new(params.rate_limit_delay),
            board,
            params,
            retry,
            groups: Mutex::new(HashMap::new()),
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// Batch parameters in use.
    pub fn params(&self) -> &BatchParams {
        &self.params
    }

    /// Current call counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Resolve the group for a customer, creating it remotely if needed.
    ///
    /// Results are cached for the lifetime of the client; transient failures
    /// are retried with exponential backoff.
    #[instrument(skip(self))]
    pub async fn ensure_group(&self, customer: &str, dry_run: bool) -> Result<String> {
        let mut groups = self.groups.lock().await;
        if let Some(id) = groups.get(customer) {
            return Ok(id.clone());
        }

        let id = if dry_run {
            self.metrics.record_call(CallKind::Group, 1);
            format!("dry-run-group:{}", customer)
        } else {
            let board = &self.board;
            let metrics = &self.metrics;
            let pacer = &self.pacer;
            let timeout = self.params.request_timeout;
            backoff::future::retry(create_backoff(&self.retry), || async move {
                pacer.wait().await;
                metrics.record_call(CallKind::Group, 1);
                let err = match tokio::time::timeout(timeout, board.create_or_update_group(customer))
                    .await
                {
                    Ok(Ok(id)) => return Ok(id),
                    Ok(Err(e)) => Error::from(e),
                    Err(_) => {
                        metrics.record_timeout();
                        Error::TransientApi(format!("group request timed out after {:?}", timeout))
                    }
                };
                if err.is_retryable() {
                    metrics.record_retry();
                    warn!("Group '{}' failed transiently, retrying: {}", customer, err);
                    Err(backoff::Error::transient(err))
                } else {
                    Err(backoff::Error::permanent(err))
                }
            })
            .await?
        };

        info!("Group for '{}' resolved to {}", customer, id);
        groups.insert(customer.to_string(), id.clone());
        Ok(id)
    }

    /// Send records to the remote board and return one result per record.
    ///
    /// Never fails as a whole: remote errors become failed [`RecordResult`]s.
    /// With `dry_run` every call is answered with a synthetic success.
    #[instrument(skip(self, records), fields(op = %op, count = records.len()))]
    pub async fn execute(
        &self,
        op: Operation,
        records: Vec<RecordPayload>,
        dry_run: bool,
    ) -> Vec<RecordResult> {
        if records.is_empty() {
            return Vec::new();
        }

        let max = self.params.max_batch_size.max(1);
        let results: Vec<RecordResult> = if records.len() <= max {
            debug!("Dispatching {} record(s) in one call", records.len());
            self.send_with_fallback(op, records, dry_run).await
        } else {
            let batches = partition(records, max);
            debug!(
                "Dispatching {} batches of up to {} ({} in flight)",
                batches.len(),
                max,
                self.params.max_concurrent_batches
            );
            stream::iter(batches)
                .map(|batch| self.send_with_fallback(op, batch, dry_run))
                .buffered(self.params.max_concurrent_batches.max(1))
                .collect::<Vec<_>>()
                .await
                .into_iter()
                .flatten()
                .collect()
        };

        let failed = results.iter().filter(|r| !r.is_success()).count();
        self.metrics.record_failures(failed);
        results
    }

    /// Send one batch, walking down the fallback ladder on transient failure.
    fn send_with_fallback(
        &self,
        op: Operation,
        batch: Vec<RecordPayload>,
        dry_run: bool,
    ) -> BoxFuture<'_, Vec<RecordResult>> {
        Box::pin(async move {
            match self.call(op, &batch, dry_run).await {
                Ok(results) => reconcile(&batch, results),
                Err(RemoteError::Permanent(message)) => {
                    warn!(
                        payload = %serde_json::to_string(&batch).unwrap_or_default(),
                        "{} rejected a batch of {}: {}",
                        op,
                        batch.len(),
                        message
                    );
                    fail_all(&batch, &message)
                }
                Err(RemoteError::Transient(message)) => {
                    match self.params.next_fallback_size(batch.len()) {
                        None => {
                            let id = batch.first().map(|r| r.record_id.as_str()).unwrap_or("");
                            warn!("{} failed for {}: {}", op, id, message);
                            fail_all(&batch, &message)
                        }
                        Some(size) => {
                            self.metrics.record_split();
                            info!(
                                "{} batch of {} failed ({}), retrying in batches of {}",
                                op,
                                batch.len(),
                                message,
                                size
                            );
                            let mut results = Vec::with_capacity(batch.len());
                            for sub in partition(batch, size) {
                                results.extend(self.send_with_fallback(op, sub, dry_run).await);
                            }
                            results
                        }
                    }
                }
            }
        })
    }

    /// One paced, time-bounded remote call.
    async fn call(
        &self,
        op: Operation,
        batch: &[RecordPayload],
        dry_run: bool,
    ) -> std::result::Result<Vec<RecordResult>, RemoteError> {
        self.metrics.record_call(op.kind(), batch.len());
        if dry_run {
            return Ok(batch.iter().map(synthetic_result).collect());
        }

        self.pacer.wait().await;
        let request = match op {
            Operation::CreateOrUpdateItems => self.board.create_or_update_items(batch),
            Operation::CreateOrUpdateSubitems => self.board.create_or_update_subitems(batch),
        };
        match tokio::time::timeout(self.params.request_timeout, request).await {
            Ok(result) => result,
            Err(_) => {
                self.metrics.record_timeout();
                Err(RemoteError::Transient(format!(
                    "request timed out after {:?}",
                    self.params.request_timeout
                )))
            }
        }
    }
}

fn synthetic_result(record: &RecordPayload) -> RecordResult {
    let id = record
        .external_id
        .clone()
        .unwrap_or_else(|| format!("dry-run:{}", record.record_id));
    RecordResult::success(&record.record_id, id, record.is_update())
}

fn fail_all(batch: &[RecordPayload], message: &str) -> Vec<RecordResult> {
    batch
        .iter()
        .map(|r| RecordResult::failure(&r.record_id, message))
        .collect()
}

/// Align remote results with the batch: exactly one result per input record.
fn reconcile(batch: &[RecordPayload], results: Vec<RecordResult>) -> Vec<RecordResult> {
    let mut by_id: HashMap<String, RecordResult> = HashMap::with_capacity(results.len());
    for result in results {
        by_id.entry(result.record_id.clone()).or_insert(result);
    }
    batch
        .iter()
        .map(|r| {
            by_id
                .remove(&r.record_id)
                .unwrap_or_else(|| RecordResult::failure(&r.record_id, "no result returned"))
        })
        .collect()
}
