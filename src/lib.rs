//! # Order Delta Sync
//!
//! Delta-synchronization of a wide order table to a monday.com board,
//! modelled as Customer-Group → Item → Sub-item.
//!
//! ## Features
//!
//! - **Dynamic sizes**: size columns are discovered between two marker columns
//! - **Change detection**: content hashes stage only changed headers
//! - **Cascade**: items are created before their sub-items, with the parent id injected
//! - **Fallback batching**: failed batches are retried in smaller sizes (15 → 5 → 1)
//! - **Resumable**: per-record cascade stages and run leases make every run re-runnable
//! - **Dry run**: every step except the remote calls
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use order_delta_sync::{
//!     ApiClient, MergeOrchestrator, MergePlan, MondayClient, PgSyncStore, PostgresClient,
//!     Resolver, SyncConfig, SyncEngine, TemplateEngine,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SyncConfig::from_file("order-delta-sync.toml")?;
//!     let env = config.default_environment.clone();
//!     let database_url = &config.environment[&env].database_url;
//!
//!     let pg = Arc::new(PostgresClient::connect(database_url).await?);
//!     let resolved = Resolver::new(&config).resolve(&env, pg.as_ref()).await?;
//!
//!     let engine = TemplateEngine::new();
//!     let board = Arc::new(MondayClient::new(&config.monday, &resolved.board_id)?);
//!     let api = Arc::new(ApiClient::new(board, resolved.batch.clone(), resolved.retry.clone()));
//!
//!     let plan = MergePlan::render(&engine, &resolved)?;
//!     MergeOrchestrator::new(pg.clone(), api.clone(), plan).run(false).await?;
//!
//!     let store = Arc::new(PgSyncStore::new(pg, &engine, &resolved)?);
//!     let result = SyncEngine::new(store, api, &resolved).run(None, None, false).await?;
//!
//!     println!("Synced {} items", result.total_items());
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

pub mod api;
pub mod config;
pub mod error;
pub mod merge;
pub mod metrics;
pub mod model;
pub mod monday;
pub mod postgres;
pub mod resolver;
pub mod schema;
pub mod sql;
pub mod store;
pub mod sync;
pub mod templates;

// Re-exports for convenience
pub use api::{ApiClient, Operation, RemoteBoard, RemoteError};
pub use config::{SAMPLE_CONFIG, SyncConfig};
pub use error::{Error, Result};
pub use merge::{MergeOrchestrator, MergePlan, MergeReport};
pub use model::{RecordPayload, RecordResult, RecordStatus, SyncStage, SyncState};
pub use monday::MondayClient;
pub use postgres::{PgSyncStore, PostgresClient};
pub use resolver::{ResolvedConfig, Resolver};
pub use store::{SqlRunner, StatusReport, SyncStore};
pub use sync::{SyncEngine, SyncProgress, SyncResult};
pub use templates::TemplateEngine;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
