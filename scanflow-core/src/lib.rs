//! # Scanflow Core
//!
//! Durable orchestration of bulk content scans.
//!
//! ## Overview
//!
//! - **Durable substrate** ([`durable`]): per-workflow event logs replayed by
//!   sequence number, a checkpointed clock, a signal bus with replay-safe
//!   cursors, named queues with per-process and global ceilings, and an
//!   executor runtime with leases.
//! - **Content scans** ([`content_scan`]): the scatter-gather orchestrator, the
//!   batch worker, the scan-record lifecycle steps and the fail-soft dispatch
//!   helpers used by producers.
//!
//! ## Feature Flags
//!
//! - `postgres` (default): Postgres backends and [`MIGRATOR`]
//! - `http-scanner` (default): the reqwest-based scanning service client
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use scanflow_core::{
//!     content_scan::{
//!         self, CommunityServerId, ContentScanConfig, InMemoryScanRecordStore, ScanId,
//!         ScanType, ScanningService,
//!     },
//!     durable::{InMemoryStore, RuntimeConfig, WorkflowRegistry, WorkflowRuntime},
//! };
//!
//! async fn run(scanner: Arc<dyn ScanningService>) -> scanflow_core::error::Result<()> {
//!     let config = ContentScanConfig::default();
//!     let mut registry = WorkflowRegistry::new();
//!     content_scan::register_content_scan_workflows(
//!         &mut registry,
//!         Arc::new(InMemoryScanRecordStore::new()),
//!         scanner,
//!         config.clone(),
//!     );
//!
//!     let runtime = WorkflowRuntime::new(
//!         RuntimeConfig::default(),
//!         Arc::new(InMemoryStore::new()),
//!         registry,
//!     )
//!     .with_queue(config.queue.clone());
//!     runtime.start().await?;
//!
//!     let client = runtime.client();
//!     let scan_id = ScanId::new();
//!     let community = CommunityServerId(uuid::Uuid::new_v4());
//!     content_scan::dispatch_content_scan_workflow(&client, scan_id, community, &[ScanType::Similarity])
//!         .await;
//!     runtime.shutdown().await
//! }
//! ```

#![allow(missing_docs)]

pub mod content_scan;
pub mod durable;
pub mod error;

#[cfg(feature = "postgres")]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub use error::{Result, ScanflowError};
