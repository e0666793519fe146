//! Schema/config resolution.
//!
//! [`Resolver::resolve`] turns the configuration document plus live table
//! metadata into a [`ResolvedConfig`]: table names for one environment, the
//! header/line column mappings, the batch parameters, and the size columns
//! found between the two marker columns of the header table.

use crate::config::{RetryConfig, SyncConfig};
use crate::error::{Error, Result};
use crate::model::{RecordPayload, columns, json_to_text};
use crate::schema::{ColumnType, Ident, IntrospectedColumn, SchemaCatalog};
use crate::store::SchemaSource;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// External field that carries the item/sub-item name.
pub const NAME_FIELD: &str = "name";

/// Table names for one environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    /// Main header table
    pub header: String,
    /// Main line table
    pub line: String,
    /// Header delta table
    pub header_delta: String,
    /// Line delta table
    pub line_delta: String,
}

impl TableNames {
    /// All four tables.
    pub fn all(&self) -> [&str; 4] {
        [&self.header, &self.header_delta, &self.line, &self.line_delta]
    }
}

/// Bidirectional internal <-> external column-name map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnMapping {
    to_external: BTreeMap<String, String>,
    to_internal: BTreeMap<String, String>,
}

impl ColumnMapping {
    /// Build from an internal -> external map; external ids must be unique.
    pub fn new(map: &BTreeMap<String, String>) -> Result<Self> {
        let mut to_internal = BTreeMap::new();
        for (internal, external) in map {
            if let Some(previous) = to_internal.insert(external.clone(), internal.clone()) {
                return Err(Error::config(format!(
                    "External column '{}' is mapped from both '{}' and '{}'",
                    external, previous, internal
                )));
            }
        }
        Ok(Self {
            to_external: map.clone(),
            to_internal,
        })
    }

    /// External column for an internal one.
    pub fn external(&self, internal: &str) -> Option<&str> {
        self.to_external.get(internal).map(|s| s.as_str())
    }

    /// Internal column for an external one.
    pub fn internal(&self, external: &str) -> Option<&str> {
        self.to_internal.get(external).map(|s| s.as_str())
    }

    /// Internal column that feeds the record name.
    pub fn name_column(&self) -> Option<&str> {
        self.internal(NAME_FIELD)
    }

    /// Internal column names.
    pub fn internal_columns(&self) -> impl Iterator<Item = &str> {
        self.to_external.keys().map(|s| s.as_str())
    }

    /// Number of mapped columns.
    pub fn len(&self) -> usize {
        self.to_external.len()
    }

    /// Whether the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.to_external.is_empty()
    }

    /// Map a row into a remote payload.
    ///
    /// Fails with a validation error when a mapped column is absent from the
    /// row or the name column is empty. Null values are left out.
    pub fn map_record(
        &self,
        record_id: impl Into<String>,
        fields: &BTreeMap<String, JsonValue>,
    ) -> Result<RecordPayload> {
        let record_id = record_id.into();
        let mut name = None;
        let mut column_values = serde_json::Map::new();

        for (internal, external) in &self.to_external {
            let value = fields.get(internal).ok_or_else(|| {
                Error::validation(format!(
                    "Record {} is missing mapped field '{}'",
                    record_id, internal
                ))
            })?;
            let Some(text) = json_to_text(value) else {
                continue;
            };
            if external == NAME_FIELD {
                name = Some(text);
            } else {
                column_values.insert(external.clone(), JsonValue::String(text));
            }
        }

        let name = name.filter(|n| !n.trim().is_empty()).ok_or_else(|| {
            Error::validation(format!("Record {} has an empty name field", record_id))
        })?;

        Ok(RecordPayload {
            record_id,
            name,
            group_id: None,
            parent_external_item_id: None,
            external_id: None,
            column_values,
        })
    }
}

/// Batch sizing, concurrency and pacing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchParams {
    /// Largest records-per-call
    pub max_batch_size: usize,
    /// Simultaneous in-flight batches
    pub max_concurrent_batches: usize,
    /// Minimum spacing between call starts
    pub rate_limit_delay: Duration,
    /// Per-call timeout
    pub request_timeout: Duration,
    /// Fallback sizes tried after a transient batch failure
    pub fallback_sizes: Vec<usize>,
}

impl Default for BatchParams {
    fn default() -> Self {
        Self {
            max_batch_size: 15,
            max_concurrent_batches: 3,
            rate_limit_delay: Duration::from_millis(250),
            request_timeout: Duration::from_secs(25),
            fallback_sizes: vec![5, 1],
        }
    }
}

impl BatchParams {
    /// Next batch size after a batch of `current` records failed transiently.
    ///
    /// Returns `None` once single-record granularity has been reached.
    pub fn next_fallback_size(&self, current: usize) -> Option<usize> {
        if current <= 1 {
            return None;
        }
        self.fallback_sizes
            .iter()
            .copied()
            .filter(|&s| s >= 1 && s < current)
            .max()
            .or(Some(1))
    }
}

/// Key columns of the header table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyColumns {
    /// Stable record identifier
    pub record_id: String,
    /// Customer name
    pub customer: String,
    /// Business key
    pub business_key: Vec<String>,
}

/// A size column discovered between the markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeColumn {
    /// Column identifier
    pub ident: Ident,
    /// Column type
    pub column_type: ColumnType,
}

impl SizeColumn {
    /// Size code (the column name).
    pub fn code(&self) -> &str {
        self.ident.raw()
    }
}

/// Output of [`Resolver::resolve`].
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Environment name
    pub environment: String,
    /// Database URL for the environment
    pub database_url: String,
    /// Remote board id for the environment
    pub board_id: String,
    /// Table names
    pub tables: TableNames,
    /// Header mapping
    pub header_mapping: ColumnMapping,
    /// Line mapping
    pub line_mapping: ColumnMapping,
    /// Size columns in schema order
    pub size_columns: Vec<SizeColumn>,
    /// Batch parameters
    pub batch: BatchParams,
    /// Key columns
    pub keys: KeyColumns,
    /// Extra columns excluded from hashing
    pub hash_exclude: Vec<String>,
    /// Lease on claimed rows
    pub lease: Duration,
    /// Re-select ERROR rows
    pub retry_failed: bool,
    /// Max header rows per run (0 = unlimited)
    pub max_records: usize,
    /// Retry settings
    pub retry: RetryConfig,
    /// Identifier allow-list
    pub catalog: SchemaCatalog,
}

/// The part of an environment that can be resolved without I/O.
#[derive(Debug, Clone)]
pub struct StaticResolution {
    /// Environment name
    pub environment: String,
    /// PostgreSQL connection string; may be empty
    pub database_url: String,
    /// Board id
    pub board_id: String,
    /// Table names
    pub tables: TableNames,
    /// Header mapping
    pub header_mapping: ColumnMapping,
    /// Line mapping
    pub line_mapping: ColumnMapping,
    /// Batch parameters
    pub batch: BatchParams,
    /// Lease on claimed rows
    pub lease: Duration,
}

/// Resolves a configuration document for one environment.
pub struct Resolver<'a> {
    config: &'a SyncConfig,
}

impl<'a> Resolver<'a> {
    /// Create a resolver over a parsed document.
    pub fn new(config: &'a SyncConfig) -> Self {
        Self { config }
    }

    /// Resolve one environment against live schema metadata.
    ///
    /// Configuration problems are reported before any metadata is read.
    #[instrument(skip(self, source))]
    pub async fn resolve(
        &self,
        environment: &str,
        source: &dyn SchemaSource,
    ) -> Result<ResolvedConfig> {
        let resolved = self.resolve_static(environment)?;
        let schema = &self.config.schema;

        let mut catalog = SchemaCatalog::new();
        for table in resolved.tables.all() {
            let cols = source.table_columns(table).await?;
            debug!("Introspected {} columns of {}", cols.len(), table);
            catalog.add_table(table, cols)?;
        }

        let header = &resolved.tables.header;
        catalog.column(header, &schema.record_id_column)?;
        catalog.column(header, &schema.customer_column)?;
        catalog.columns(header, &schema.business_key)?;
        catalog.columns(&resolved.tables.header_delta, &schema.business_key)?;
        for internal in resolved.header_mapping.internal_columns() {
            catalog.column(header, internal)?;
        }
        for internal in resolved.line_mapping.internal_columns() {
            catalog.column(&resolved.tables.line_delta, internal)?;
        }
        for table in [&resolved.tables.line, &resolved.tables.line_delta] {
            catalog.column(table, &schema.record_id_column)?;
            catalog.column(table, columns::SIZE_CODE)?;
            catalog.column(table, columns::QTY)?;
        }

        let size_columns = discover_size_columns(
            catalog.table(header)?.columns(),
            &schema.size_start_marker,
            &schema.size_end_marker,
        )?;
        if size_columns.is_empty() {
            warn!(
                "No size columns between '{}' and '{}' on {}",
                schema.size_start_marker, schema.size_end_marker, header
            );
        }

        info!(
            "Resolved environment '{}': {} size columns, {} header fields, {} line fields",
            resolved.environment,
            size_columns.len(),
            resolved.header_mapping.len(),
            resolved.line_mapping.len()
        );

        Ok(ResolvedConfig {
            environment: resolved.environment,
            database_url: resolved.database_url,
            board_id: resolved.board_id,
            tables: resolved.tables,
            header_mapping: resolved.header_mapping,
            line_mapping: resolved.line_mapping,
            size_columns,
            batch: resolved.batch,
            keys: KeyColumns {
                record_id: schema.record_id_column.clone(),
                customer: schema.customer_column.clone(),
                business_key: schema.business_key.clone(),
            },
            hash_exclude: schema.hash_exclude.clone(),
            lease: resolved.lease,
            retry_failed: self.config.sync.retry_failed,
            max_records: self.config.sync.max_records,
            retry: self.config.retry.clone(),
            catalog,
        })
    }

    /// Check the environment section, mappings, batch and lease settings.
    ///
    /// Runs before any connection is opened so that a broken document fails
    /// without touching the database.
    pub fn resolve_static(&self, environment: &str) -> Result<StaticResolution> {
        let env = self.config.environment.get(environment).ok_or_else(|| {
            Error::config(format!(
                "No [environment.{}] section (known: {})",
                environment,
                self.config.environment_names().join(", ")
            ))
        })?;
        if env.header_table.trim().is_empty() || env.line_table.trim().is_empty() {
            return Err(Error::config(format!(
                "environment.{}.header_table and .line_table are required",
                environment
            )));
        }

        let mapping = self
            .config
            .monday
            .column_mapping
            .get(environment)
            .ok_or_else(|| {
                Error::config(format!(
                    "No [monday.column_mapping.{}] section",
                    environment
                ))
            })?;
        let header_mapping = ColumnMapping::new(&mapping.headers)?;
        let line_mapping = ColumnMapping::new(&mapping.lines)?;
        for (label, m) in [("headers", &header_mapping), ("lines", &line_mapping)] {
            if m.is_empty() {
                return Err(Error::config(format!(
                    "monday.column_mapping.{}.{} is empty",
                    environment, label
                )));
            }
            if m.name_column().is_none() {
                return Err(Error::config(format!(
                    "monday.column_mapping.{}.{} must map one column to '{}'",
                    environment, label, NAME_FIELD
                )));
            }
        }

        let batch = &self.config.batch;
        Ok(StaticResolution {
            environment: environment.to_string(),
            database_url: env.database_url.clone(),
            board_id: env.board_id.clone(),
            tables: TableNames {
                header: env.header_table.clone(),
                line: env.line_table.clone(),
                header_delta: env.header_delta_table(),
                line_delta: env.line_delta_table(),
            },
            header_mapping,
            line_mapping,
            batch: BatchParams {
                max_batch_size: batch.max_batch_size,
                max_concurrent_batches: batch.max_concurrent_batches,
                rate_limit_delay: batch.rate_limit_delay(),
                request_timeout: batch.request_timeout()?,
                fallback_sizes: batch.fallback_sizes.clone(),
            },
            lease: self.config.sync.lease()?,
        })
    }
}

/// Columns physically positioned strictly between two marker columns.
///
/// Columns are taken in ordinal order; sync-tracking columns that happen to
/// sit inside the region are skipped.
pub fn discover_size_columns(
    table_columns: &[IntrospectedColumn],
    start_marker: &str,
    end_marker: &str,
) -> Result<Vec<SizeColumn>> {
    let mut ordered: Vec<&IntrospectedColumn> = table_columns.iter().collect();
    ordered.sort_by_key(|c| c.ordinal_position);

    let position = |marker: &str| {
        ordered
            .iter()
            .position(|c| c.name == marker)
            .ok_or_else(|| Error::config(format!("Schema marker column '{}' not found", marker)))
    };
    let start = position(start_marker)?;
    let end = position(end_marker)?;
    if start >= end {
        return Err(Error::config(format!(
            "Schema marker '{}' must come before '{}'",
            start_marker, end_marker
        )));
    }

    Ok(ordered[start + 1..end]
        .iter()
        .filter(|c| !columns::is_tracking(&c.name))
        .map(|c| SizeColumn {
            ident: Ident::from_metadata(c),
            column_type: c.column_type(),
        })
        .collect())
}
