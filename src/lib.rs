//! # KPI Fulfillment
//!
//! Evaluation, incremental merging and aggregation of KPI fulfillment for
//! fleets of IoT smart devices.
//!
//! ## Features
//!
//! - **KPI Expression Trees**: Flat persisted nodes rebuilt into validated
//!   trees of logical operations and typed atoms, with placeholder-based editing
//! - **Tri-state Evaluation**: Fulfilled, Unfulfilled and Unknown propagated
//!   through AND, OR and NOR
//! - **Applicability**: Definitions bound to device types and either all or
//!   selected instances
//! - **Fulfillment Store**: Per-instance KPI lists with versioning, idempotent
//!   batch merges and change subscriptions
//! - **Aggregation**: Instance, group and fleet statistics maintained
//!   incrementally
//! - **Update Stream**: JSON-lines batches fed through a bounded channel
//! - **Definition Storage**: SQLite persistence for authored definitions
//!
//! ## Architecture
//!
//! ```text
//! Bulk load → Catalog → FulfillmentStore → Aggregator
//!                            ↑
//!          stdin batches → stream reader → consumer
//!
//!          SQLite (KPI definitions)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use kpi_fulfillment::{AppState, BulkLoad, Config, Monitor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let bulk = BulkLoad::from_path("fleet.json").await?;
//!     let state = Arc::new(AppState::new(config, &bulk));
//!     Monitor::new(state).run_stdin().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

/// Instance, group and fleet statistics.
pub mod aggregation;
/// Bulk load contract and the indexed catalog built from it.
pub mod catalog;
/// Configuration management.
pub mod config;
/// Error types and result aliases for the application.
pub mod error;
/// Atom evaluation, tri-state combination and applicability.
pub mod evaluation;
/// Domain types and KPI expression trees.
pub mod model;
/// Application state and the monitoring loop.
pub mod server;
/// SQLite storage layer for KPI definitions.
pub mod storage;
/// Per-instance fulfillment state with change notification.
pub mod store;
/// Incremental update stream.
pub mod stream;

pub use aggregation::{Aggregator, KpiStats};
pub use catalog::{BulkLoad, Catalog};
pub use config::Config;
pub use error::{AppError, AppResult};
pub use model::{Fulfillment, KpiDefinition};
pub use server::{AppState, Monitor, SharedState};
pub use store::FulfillmentStore;
