use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pulse_core::{
    DateRange, Integration, IntegrationStatus, KpiDefinition, Metric, MetricNaturalKey, MetricRow,
    SyncKind, SyncLog, SyncStatus,
};
use pulse_storage::{MemoryStore, MetricStore, ReplaceOutcome, ReplaceScope};
use uuid::Uuid;

/// Delegates to a [`MemoryStore`], failing the calls it has been told to.
#[derive(Default)]
pub(crate) struct FaultyStore {
    pub inner: MemoryStore,
    pub broken_kpi_client: Option<Uuid>,
    pub fail_log_finish: bool,
}

#[async_trait]
impl MetricStore for FaultyStore {
    async fn integrations_with_status(
        &self,
        statuses: &[IntegrationStatus],
    ) -> Result<Vec<Integration>> {
        self.inner.integrations_with_status(statuses).await
    }

    async fn start_sync_log(
        &self,
        integration_id: Uuid,
        kind: SyncKind,
        started_at: DateTime<Utc>,
    ) -> Result<SyncLog> {
        self.inner.start_sync_log(integration_id, kind, started_at).await
    }

    async fn finish_sync_log(
        &self,
        log_id: Uuid,
        status: SyncStatus,
        records_synced: i64,
        error_message: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> Result<()> {
        if self.fail_log_finish {
            bail!("connection reset while updating sync_logs");
        }
        self.inner
            .finish_sync_log(log_id, status, records_synced, error_message, completed_at)
            .await
    }

    async fn mark_integration_synced(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.inner.mark_integration_synced(id, at).await
    }

    async fn mark_integration_failed(&self, id: Uuid, message: &str) -> Result<()> {
        self.inner.mark_integration_failed(id, message).await
    }

    async fn replace_metric_rows(
        &self,
        scope: &ReplaceScope,
        rows: &[MetricRow],
    ) -> Result<ReplaceOutcome> {
        self.inner.replace_metric_rows(scope, rows).await
    }

    async fn metric_rows_for_client(
        &self,
        client_id: Uuid,
        range: DateRange,
    ) -> Result<Vec<MetricRow>> {
        self.inner.metric_rows_for_client(client_id, range).await
    }

    async fn clients_with_metric_rows(&self, range: DateRange) -> Result<Vec<Uuid>> {
        self.inner.clients_with_metric_rows(range).await
    }

    async fn kpi_definitions(&self, client_id: Uuid) -> Result<Vec<KpiDefinition>> {
        if self.broken_kpi_client == Some(client_id) {
            bail!("connection reset while reading kpi_definitions");
        }
        self.inner.kpi_definitions(client_id).await
    }

    async fn find_metric(&self, key: &MetricNaturalKey) -> Result<Option<Metric>> {
        self.inner.find_metric(key).await
    }

    async fn update_metric_value(&self, metric_id: Uuid, value: f64) -> Result<()> {
        self.inner.update_metric_value(metric_id, value).await
    }

    async fn insert_metric(&self, metric: &Metric) -> Result<()> {
        self.inner.insert_metric(metric).await
    }
}
