//! Records, sync states and remote payloads.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Sync-tracking columns shared by the header tables.
pub mod columns {
    /// Sync state column
    pub const SYNC_STATE: &str = "sync_state";
    /// Cascade stage column
    pub const SYNC_STAGE: &str = "sync_stage";
    /// Insert/update marker column
    pub const ACTION_TYPE: &str = "action_type";
    /// Content hash column
    pub const ROW_HASH: &str = "row_hash";
    /// Last error message column
    pub const SYNC_ERROR: &str = "sync_error";
    /// Remote item id column
    pub const EXTERNAL_ITEM_ID: &str = "external_item_id";
    /// Remote sub-item id column
    pub const EXTERNAL_SUBITEM_ID: &str = "external_subitem_id";
    /// Parent remote item id column on line rows
    pub const PARENT_EXTERNAL_ITEM_ID: &str = "parent_external_item_id";
    /// Lease owner column
    pub const LEASE_OWNER: &str = "lease_owner";
    /// Lease expiry column
    pub const LEASE_EXPIRES_AT: &str = "lease_expires_at";
    /// Row creation timestamp
    pub const CREATED_AT: &str = "created_at";
    /// Row update timestamp
    pub const UPDATED_AT: &str = "updated_at";
    /// Last successful sync timestamp
    pub const SYNCED_AT: &str = "synced_at";
    /// Size code column on line rows
    pub const SIZE_CODE: &str = "size_code";
    /// Quantity column on line rows
    pub const QTY: &str = "qty";

    /// Columns never included in content hashes or copied as business data.
    pub const TRACKING: &[&str] = &[
        SYNC_STATE,
        SYNC_STAGE,
        ACTION_TYPE,
        ROW_HASH,
        SYNC_ERROR,
        EXTERNAL_ITEM_ID,
        EXTERNAL_SUBITEM_ID,
        PARENT_EXTERNAL_ITEM_ID,
        LEASE_OWNER,
        LEASE_EXPIRES_AT,
        CREATED_AT,
        UPDATED_AT,
        SYNCED_AT,
    ];

    /// Whether a column is sync-tracking metadata.
    pub fn is_tracking(name: &str) -> bool {
        TRACKING.contains(&name)
    }
}

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($(#[$vmeta])* #[serde(rename = $text)] $variant),+
        }

        impl $name {
            /// Column value for this variant.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s.trim().to_ascii_uppercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    other => Err(Error::validation(format!(
                        "Unknown {} value '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

string_enum! {
    /// Row-level sync state shared by all four tables.
    SyncState {
        /// Never staged
        New => "NEW",
        /// Staged, waiting for the sync engine
        Pending => "PENDING",
        /// Remote record exists and matches
        Synced => "SYNCED",
        /// Last attempt failed; retried on the next run
        Error => "ERROR",
    }
}

string_enum! {
    /// Per-record cascade progress on header rows.
    ///
    /// `NEW -> GROUPED -> ITEM_SYNCED -> LINES_SYNCED`, or `ERROR` at any step.
    SyncStage {
        /// Nothing done yet
        New => "NEW",
        /// Customer group resolved
        Grouped => "GROUPED",
        /// Remote item created/updated, lines outstanding
        ItemSynced => "ITEM_SYNCED",
        /// Item and every line synced
        LinesSynced => "LINES_SYNCED",
        /// A step failed
        Error => "ERROR",
    }
}

string_enum! {
    /// Whether the remote record must be created or updated.
    ActionType {
        /// Create remotely
        Insert => "INSERT",
        /// Update remotely
        Update => "UPDATE",
    }
}

/// A header delta row.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderRecord {
    /// Stable record identifier
    pub record_uuid: Uuid,
    /// Customer name (group key)
    pub customer: String,
    /// Sync state
    pub sync_state: SyncState,
    /// Cascade stage
    pub sync_stage: SyncStage,
    /// Insert or update
    pub action_type: ActionType,
    /// Content hash
    pub row_hash: Option<String>,
    /// Remote item id once created
    pub external_item_id: Option<String>,
    /// Every column of the row, keyed by column name
    pub fields: BTreeMap<String, JsonValue>,
}

impl HeaderRecord {
    /// Build from a row map.
    pub fn from_row(
        fields: BTreeMap<String, JsonValue>,
        record_id_column: &str,
        customer_column: &str,
    ) -> Result<Self> {
        let record_uuid = parse_uuid(&fields, record_id_column)?;
        let customer = text(&fields, customer_column)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| {
                Error::validation(format!("Header {} has no customer", record_uuid))
            })?;

        Ok(Self {
            record_uuid,
            customer,
            sync_state: parse_or(&fields, columns::SYNC_STATE, SyncState::New)?,
            sync_stage: parse_or(&fields, columns::SYNC_STAGE, SyncStage::New)?,
            action_type: parse_or(&fields, columns::ACTION_TYPE, ActionType::Insert)?,
            row_hash: text(&fields, columns::ROW_HASH),
            external_item_id: text(&fields, columns::EXTERNAL_ITEM_ID),
            fields,
        })
    }

    /// Whether the remote item still has to be created or updated.
    pub fn needs_item_sync(&self) -> bool {
        !matches!(self.sync_stage, SyncStage::ItemSynced | SyncStage::LinesSynced)
            || self.external_item_id.is_none()
    }
}

/// A line delta row: one size of one header.
#[derive(Debug, Clone, PartialEq)]
pub struct LineRecord {
    /// Owning header
    pub record_uuid: Uuid,
    /// Size code (the source column name)
    pub size_code: String,
    /// Sync state
    pub sync_state: SyncState,
    /// Insert or update
    pub action_type: ActionType,
    /// Content hash
    pub row_hash: Option<String>,
    /// Remote sub-item id once created
    pub external_subitem_id: Option<String>,
    /// Remote parent item id
    pub parent_external_item_id: Option<String>,
    /// Every column of the row
    pub fields: BTreeMap<String, JsonValue>,
}

impl LineRecord {
    /// Build from a row map.
    pub fn from_row(fields: BTreeMap<String, JsonValue>, record_id_column: &str) -> Result<Self> {
        let record_uuid = parse_uuid(&fields, record_id_column)?;
        let size_code = text(&fields, columns::SIZE_CODE).ok_or_else(|| {
            Error::validation(format!("Line of {} has no size code", record_uuid))
        })?;

        Ok(Self {
            record_uuid,
            size_code,
            sync_state: parse_or(&fields, columns::SYNC_STATE, SyncState::New)?,
            action_type: parse_or(&fields, columns::ACTION_TYPE, ActionType::Insert)?,
            row_hash: text(&fields, columns::ROW_HASH),
            external_subitem_id: text(&fields, columns::EXTERNAL_SUBITEM_ID),
            parent_external_item_id: text(&fields, columns::PARENT_EXTERNAL_ITEM_ID),
            fields,
        })
    }

    /// Identifier used for this line in remote results.
    pub fn record_id(&self) -> String {
        line_record_id(&self.record_uuid, &self.size_code)
    }
}

/// Remote result identifier for a line.
pub fn line_record_id(record_uuid: &Uuid, size_code: &str) -> String {
    format!("{}:{}", record_uuid, size_code)
}

/// One header plus every line that must travel with it.
#[derive(Debug, Clone)]
pub struct CascadeUnit {
    /// The header
    pub header: HeaderRecord,
    /// Its lines
    pub lines: Vec<LineRecord>,
}

/// Mapped payload for one remote record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordPayload {
    /// Caller's identifier, echoed in results
    pub record_id: String,
    /// Item/sub-item name
    pub name: String,
    /// Remote group (items only)
    pub group_id: Option<String>,
    /// Remote parent item (sub-items only)
    pub parent_external_item_id: Option<String>,
    /// Existing remote id when updating
    pub external_id: Option<String>,
    /// External column id -> value
    pub column_values: serde_json::Map<String, JsonValue>,
}

impl RecordPayload {
    /// Whether this payload updates an existing remote record.
    pub fn is_update(&self) -> bool {
        self.external_id.is_some()
    }
}

/// Final status of one record after a remote operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    /// Remote record created
    Created,
    /// Remote record updated
    Updated,
    /// Remote call failed for this record
    Failed,
}

/// Per-record result returned by the API client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordResult {
    /// Caller's identifier
    pub record_id: String,
    /// Outcome
    pub status: RecordStatus,
    /// Assigned remote id on success
    pub external_id: Option<String>,
    /// Error message on failure
    pub error: Option<String>,
}

impl RecordResult {
    /// Successful result.
    pub fn success(record_id: impl Into<String>, external_id: impl Into<String>, updated: bool) -> Self {
        Self {
            record_id: record_id.into(),
            status: if updated {
                RecordStatus::Updated
            } else {
                RecordStatus::Created
            },
            external_id: Some(external_id.into()),
            error: None,
        }
    }

    /// Failed result.
    pub fn failure(record_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            status: RecordStatus::Failed,
            external_id: None,
            error: Some(error.into()),
        }
    }

    /// Whether the record succeeded.
    pub fn is_success(&self) -> bool {
        self.status != RecordStatus::Failed
    }
}

/// Final state of a header after pass one (or a validation failure).
#[derive(Debug, Clone, PartialEq)]
pub struct ItemOutcome {
    /// Header
    pub record_uuid: Uuid,
    /// Remote item id on success
    pub external_item_id: Option<String>,
    /// New sync state
    pub sync_state: SyncState,
    /// New cascade stage
    pub sync_stage: SyncStage,
    /// Error message on failure
    pub error: Option<String>,
}

/// Final state of a line after pass two.
#[derive(Debug, Clone, PartialEq)]
pub struct LineOutcome {
    /// Owning header
    pub record_uuid: Uuid,
    /// Size code
    pub size_code: String,
    /// Remote sub-item id on success
    pub external_subitem_id: Option<String>,
    /// Remote parent item id injected before the call
    pub parent_external_item_id: String,
    /// New sync state
    pub sync_state: SyncState,
    /// Error message on failure
    pub error: Option<String>,
}

/// Render a JSON value as the plain text the remote board expects.
pub fn json_to_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Array(_) | JsonValue::Object(_) => Some(value.to_string()),
    }
}

fn text(fields: &BTreeMap<String, JsonValue>, column: &str) -> Option<String> {
    fields.get(column).and_then(json_to_text)
}

fn parse_uuid(fields: &BTreeMap<String, JsonValue>, column: &str) -> Result<Uuid> {
    let raw = text(fields, column)
        .ok_or_else(|| Error::validation(format!("Row is missing '{}'", column)))?;
    Uuid::parse_str(raw.trim())
        .map_err(|e| Error::validation(format!("Invalid {} '{}': {}", column, raw, e)))
}

fn parse_or<T: FromStr<Err = Error>>(
    fields: &BTreeMap<String, JsonValue>,
    column: &str,
    default: T,
) -> Result<T> {
    match text(fields, column) {
        Some(v) if !v.trim().is_empty() => v.parse(),
        _ => Ok(default),
    }
}
