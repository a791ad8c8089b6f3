//! Fact-table persistence + upstream HTTP plumbing for the metrics sync core.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pulse_core::{
    DateRange, Integration, IntegrationStatus, KpiDefinition, Metric, MetricNaturalKey, MetricRow,
    SyncKind, SyncLog, SyncStatus,
};
use uuid::Uuid;

mod http;
mod memory;
mod postgres;

pub use http::{FetchError, HttpClientConfig, HttpFetcher};
pub use memory::{MemoryState, MemoryStore};
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "pulse-storage";

/// Upper bound on rows per INSERT statement when writing MetricRow facts.
pub const INSERT_BATCH_SIZE: usize = 500;

/// Rows owned by one integration that a resync replaces.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplaceScope {
    pub integration_id: Uuid,
    pub range: DateRange,
    /// Distinct metric keys present in the fresh fetch; only these are deleted.
    pub metric_keys: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaceOutcome {
    pub deleted: u64,
    pub inserted: u64,
}

/// Read/write seam between the sync core and whatever holds the fact tables.
#[async_trait]
pub trait MetricStore: Send + Sync {
    async fn integrations_with_status(
        &self,
        statuses: &[IntegrationStatus],
    ) -> Result<Vec<Integration>>;

    async fn start_sync_log(
        &self,
        integration_id: Uuid,
        kind: SyncKind,
        started_at: DateTime<Utc>,
    ) -> Result<SyncLog>;

    async fn finish_sync_log(
        &self,
        log_id: Uuid,
        status: SyncStatus,
        records_synced: i64,
        error_message: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Status `active`, error cleared, last-synced stamped.
    async fn mark_integration_synced(&self, integration_id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Status `error` with the message; last-synced is left untouched.
    async fn mark_integration_failed(&self, integration_id: Uuid, message: &str) -> Result<()>;

    /// Delete every row in `scope`, then insert `rows` in chunks of
    /// [`INSERT_BATCH_SIZE`].
    async fn replace_metric_rows(
        &self,
        scope: &ReplaceScope,
        rows: &[MetricRow],
    ) -> Result<ReplaceOutcome>;

    async fn metric_rows_for_client(
        &self,
        client_id: Uuid,
        range: DateRange,
    ) -> Result<Vec<MetricRow>>;

    async fn clients_with_metric_rows(&self, range: DateRange) -> Result<Vec<Uuid>>;

    async fn kpi_definitions(&self, client_id: Uuid) -> Result<Vec<KpiDefinition>>;

    async fn find_metric(&self, key: &MetricNaturalKey) -> Result<Option<Metric>>;

    async fn update_metric_value(&self, metric_id: Uuid, value: f64) -> Result<()>;

    async fn insert_metric(&self, metric: &Metric) -> Result<()>;
}
