use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use pulse_core::{
    DateRange, Integration, IntegrationStatus, KpiDefinition, Metric, MetricNaturalKey, MetricRow,
    SyncKind, SyncLog, SyncStatus,
};
use serde::Serialize;
use uuid::Uuid;

use crate::{MetricStore, ReplaceOutcome, ReplaceScope, INSERT_BATCH_SIZE};

/// Full contents of a [`MemoryStore`], comparable across snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryState {
    pub integrations: BTreeMap<Uuid, Integration>,
    pub sync_logs: Vec<SyncLog>,
    pub metric_rows: Vec<MetricRow>,
    pub kpi_definitions: Vec<KpiDefinition>,
    pub metrics: Vec<Metric>,
}

/// In-process store with the same natural-key rules as the Postgres schema.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    insert_batches: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_integration(&self, integration: Integration) {
        self.state().integrations.insert(integration.id, integration);
    }

    pub fn insert_kpi_definition(&self, definition: KpiDefinition) {
        self.state().kpi_definitions.push(definition);
    }

    pub fn integration(&self, id: Uuid) -> Option<Integration> {
        self.state().integrations.get(&id).cloned()
    }

    pub fn metric_rows(&self) -> Vec<MetricRow> {
        self.state().metric_rows.clone()
    }

    pub fn metrics(&self) -> Vec<Metric> {
        self.state().metrics.clone()
    }

    pub fn sync_logs(&self) -> Vec<SyncLog> {
        self.state().sync_logs.clone()
    }

    pub fn snapshot(&self) -> MemoryState {
        self.state().clone()
    }

    /// Number of INSERT chunks issued by `replace_metric_rows` so far.
    pub fn insert_batch_count(&self) -> usize {
        *self
            .insert_batches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn row_key(row: &MetricRow) -> (Uuid, NaiveDate, &str) {
    (row.integration_id, row.metric_date, row.metric_key.as_str())
}

#[async_trait]
impl MetricStore for MemoryStore {
    async fn integrations_with_status(
        &self,
        statuses: &[IntegrationStatus],
    ) -> Result<Vec<Integration>> {
        Ok(self
            .state()
            .integrations
            .values()
            .filter(|i| statuses.contains(&i.status))
            .cloned()
            .collect())
    }

    async fn start_sync_log(
        &self,
        integration_id: Uuid,
        kind: SyncKind,
        started_at: DateTime<Utc>,
    ) -> Result<SyncLog> {
        let log = SyncLog {
            id: Uuid::new_v4(),
            integration_id,
            sync_kind: kind,
            status: SyncStatus::Running,
            records_synced: 0,
            error_message: None,
            started_at,
            completed_at: None,
        };
        self.state().sync_logs.push(log.clone());
        Ok(log)
    }

    async fn finish_sync_log(
        &self,
        log_id: Uuid,
        status: SyncStatus,
        records_synced: i64,
        error_message: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state();
        let log = state
            .sync_logs
            .iter_mut()
            .find(|l| l.id == log_id)
            .ok_or_else(|| anyhow!("sync log {log_id} not found"))?;
        if log.status != SyncStatus::Running {
            bail!("sync log {log_id} already finalized as {}", log.status);
        }
        log.status = status;
        log.records_synced = records_synced;
        log.error_message = error_message.map(str::to_string);
        log.completed_at = Some(completed_at);
        Ok(())
    }

    async fn mark_integration_synced(&self, integration_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state();
        let integration = state
            .integrations
            .get_mut(&integration_id)
            .ok_or_else(|| anyhow!("integration {integration_id} not found"))?;
        integration.status = IntegrationStatus::Active;
        integration.last_error = None;
        integration.last_synced_at = Some(at);
        Ok(())
    }

    async fn mark_integration_failed(&self, integration_id: Uuid, message: &str) -> Result<()> {
        let mut state = self.state();
        let integration = state
            .integrations
            .get_mut(&integration_id)
            .ok_or_else(|| anyhow!("integration {integration_id} not found"))?;
        integration.status = IntegrationStatus::Error;
        integration.last_error = Some(message.to_string());
        Ok(())
    }

    async fn replace_metric_rows(
        &self,
        scope: &ReplaceScope,
        rows: &[MetricRow],
    ) -> Result<ReplaceOutcome> {
        let mut state = self.state();
        let keys: HashSet<&str> = scope.metric_keys.iter().map(String::as_str).collect();
        let doomed = |row: &MetricRow| {
            row.integration_id == scope.integration_id
                && keys.contains(row.metric_key.as_str())
                && scope.range.contains(row.metric_date)
        };

        // Validate against the post-delete table before touching anything,
        // the way a rolled-back transaction would leave it.
        let mut seen: HashSet<(Uuid, NaiveDate, &str)> = state
            .metric_rows
            .iter()
            .filter(|row| !doomed(row))
            .map(row_key)
            .collect();
        for row in rows {
            if !seen.insert(row_key(row)) {
                bail!(
                    "duplicate metric row for integration {} on {} key {}",
                    row.integration_id,
                    row.metric_date,
                    row.metric_key
                );
            }
        }
        drop(seen);

        let before = state.metric_rows.len();
        state.metric_rows.retain(|row| !doomed(row));
        let deleted = (before - state.metric_rows.len()) as u64;

        let mut batches = self
            .insert_batches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for chunk in rows.chunks(INSERT_BATCH_SIZE) {
            state.metric_rows.extend_from_slice(chunk);
            *batches += 1;
        }

        Ok(ReplaceOutcome {
            deleted,
            inserted: rows.len() as u64,
        })
    }

    async fn metric_rows_for_client(
        &self,
        client_id: Uuid,
        range: DateRange,
    ) -> Result<Vec<MetricRow>> {
        Ok(self
            .state()
            .metric_rows
            .iter()
            .filter(|row| row.client_id == client_id && range.contains(row.metric_date))
            .cloned()
            .collect())
    }

    async fn clients_with_metric_rows(&self, range: DateRange) -> Result<Vec<Uuid>> {
        let clients: BTreeSet<Uuid> = self
            .state()
            .metric_rows
            .iter()
            .filter(|row| range.contains(row.metric_date))
            .map(|row| row.client_id)
            .collect();
        Ok(clients.into_iter().collect())
    }

    async fn kpi_definitions(&self, client_id: Uuid) -> Result<Vec<KpiDefinition>> {
        Ok(self
            .state()
            .kpi_definitions
            .iter()
            .filter(|d| d.client_id == client_id)
            .cloned()
            .collect())
    }

    async fn find_metric(&self, key: &MetricNaturalKey) -> Result<Option<Metric>> {
        Ok(self
            .state()
            .metrics
            .iter()
            .find(|m| &m.natural_key() == key)
            .cloned())
    }

    async fn update_metric_value(&self, metric_id: Uuid, value: f64) -> Result<()> {
        let mut state = self.state();
        let metric = state
            .metrics
            .iter_mut()
            .find(|m| m.id == metric_id)
            .ok_or_else(|| anyhow!("metric {metric_id} not found"))?;
        metric.value = value;
        Ok(())
    }

    async fn insert_metric(&self, metric: &Metric) -> Result<()> {
        let mut state = self.state();
        let key = metric.natural_key();
        if state.metrics.iter().any(|m| m.natural_key() == key) {
            bail!(
                "metric {} for client {} {} {}..{} already exists",
                key.metric_key,
                key.client_id,
                key.period_type,
                key.period_start,
                key.period_end
            );
        }
        state.metrics.push(metric.clone());
        Ok(())
    }
}
