//! Census reconciliation, building aggregation, persistence and the auto-sync scheduler.

pub mod aggregate;
pub mod config;
pub mod db;
pub mod error;
pub mod reconcile;
pub mod scheduler;
pub mod service;

pub use aggregate::compute_building_stats;
pub use config::{SyncConfig, AUTO_SYNC_CONFIG_FILE};
pub use db::{
    BuildingFilter, CombinedMetric, Store, SummaryStats, TableCounts, BUILDING_LOOKUP_LIMIT,
};
pub use error::{SyncError, SyncResult};
pub use reconcile::reconcile;
pub use scheduler::{format_time_until, AutoSyncManager, AutoSyncStatus, SyncOutcome};
pub use service::{InitSummary, SyncAllSummary, SyncService, SyncTarget};

pub const CRATE_NAME: &str = "nyc-sync";
