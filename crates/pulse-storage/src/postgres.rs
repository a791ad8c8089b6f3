use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pulse_core::{
    DateRange, Integration, IntegrationStatus, KpiDefinition, Metric, MetricNaturalKey, MetricRow,
    SyncKind, SyncLog, SyncStatus,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::debug;
use uuid::Uuid;

use crate::{MetricStore, ReplaceOutcome, ReplaceScope, INSERT_BATCH_SIZE};

/// Postgres-backed store. Schema lives in the workspace `migrations/` directory.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")
    }

    pub async fn integration(&self, id: Uuid) -> Result<Option<Integration>> {
        let row = sqlx::query(
            r#"
            SELECT id, client_id, platform, display_name, credentials, status, last_synced_at, last_error
            FROM integrations
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("loading integration")?;
        row.as_ref().map(integration_from_row).transpose()
    }
}

fn integration_from_row(row: &PgRow) -> Result<Integration> {
    Ok(Integration {
        id: row.try_get("id")?,
        client_id: row.try_get("client_id")?,
        platform: row.try_get::<String, _>("platform")?.parse()?,
        display_name: row.try_get("display_name")?,
        credentials: row.try_get("credentials")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        last_synced_at: row.try_get("last_synced_at")?,
        last_error: row.try_get("last_error")?,
    })
}

fn metric_row_from_row(row: &PgRow) -> Result<MetricRow> {
    Ok(MetricRow {
        id: row.try_get("id")?,
        client_id: row.try_get("client_id")?,
        integration_id: row.try_get("integration_id")?,
        platform: row.try_get::<String, _>("platform")?.parse()?,
        metric_date: row.try_get("metric_date")?,
        metric_key: row.try_get("metric_key")?,
        metric_value: row.try_get("metric_value")?,
        dimensions: row.try_get("dimensions")?,
        raw_row: row.try_get("raw_row")?,
    })
}

fn metric_from_row(row: &PgRow) -> Result<Metric> {
    Ok(Metric {
        id: row.try_get("id")?,
        client_id: row.try_get("client_id")?,
        period_type: row.try_get::<String, _>("period_type")?.parse()?,
        period_start: row.try_get("period_start")?,
        period_end: row.try_get("period_end")?,
        metric_key: row.try_get("metric_key")?,
        value: row.try_get("value")?,
        notes: row.try_get("notes")?,
        created_by: row.try_get("created_by")?,
    })
}

#[async_trait]
impl MetricStore for PgStore {
    async fn integrations_with_status(
        &self,
        statuses: &[IntegrationStatus],
    ) -> Result<Vec<Integration>> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query(
            r#"
            SELECT id, client_id, platform, display_name, credentials, status, last_synced_at, last_error
            FROM integrations
            WHERE status = ANY($1)
            ORDER BY created_at, id
            "#,
        )
        .bind(&statuses)
        .fetch_all(&self.pool)
        .await
        .context("listing integrations by status")?;
        rows.iter().map(integration_from_row).collect()
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
        sqlx::query(
            r#"
            INSERT INTO sync_logs (id, integration_id, sync_kind, status, records_synced, started_at)
            VALUES ($1, $2, $3, $4, 0, $5)
            "#,
        )
        .bind(log.id)
        .bind(integration_id)
        .bind(kind.as_str())
        .bind(SyncStatus::Running.as_str())
        .bind(started_at)
        .execute(&self.pool)
        .await
        .context("inserting sync log")?;
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
        let result = sqlx::query(
            r#"
            UPDATE sync_logs
            SET status = $2, records_synced = $3, error_message = $4, completed_at = $5
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(log_id)
        .bind(status.as_str())
        .bind(records_synced)
        .bind(error_message)
        .bind(completed_at)
        .execute(&self.pool)
        .await
        .context("finalizing sync log")?;
        if result.rows_affected() != 1 {
            bail!("sync log {log_id} missing or already finalized");
        }
        Ok(())
    }

    async fn mark_integration_synced(&self, integration_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE integrations
            SET status = 'active', last_error = NULL, last_synced_at = $2, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(integration_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .context("marking integration synced")?;
        Ok(())
    }

    async fn mark_integration_failed(&self, integration_id: Uuid, message: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE integrations
            SET status = 'error', last_error = $2, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(integration_id)
        .bind(message)
        .execute(&self.pool)
        .await
        .context("marking integration failed")?;
        Ok(())
    }

    async fn replace_metric_rows(
        &self,
        scope: &ReplaceScope,
        rows: &[MetricRow],
    ) -> Result<ReplaceOutcome> {
        let mut tx = self.pool.begin().await.context("opening replace transaction")?;
        let mut outcome = ReplaceOutcome::default();

        for key in &scope.metric_keys {
            let deleted = sqlx::query(
                r#"
                DELETE FROM metric_rows
                WHERE integration_id = $1 AND metric_key = $2 AND metric_date BETWEEN $3 AND $4
                "#,
            )
            .bind(scope.integration_id)
            .bind(key)
            .bind(scope.range.from())
            .bind(scope.range.to())
            .execute(&mut *tx)
            .await
            .with_context(|| format!("deleting metric rows for key {key}"))?;
            outcome.deleted += deleted.rows_affected();
        }

        for chunk in rows.chunks(INSERT_BATCH_SIZE) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO metric_rows (id, client_id, integration_id, platform, metric_date, metric_key, metric_value, dimensions, raw_row) ",
            );
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.id)
                    .push_bind(row.client_id)
                    .push_bind(row.integration_id)
                    .push_bind(row.platform.as_str())
                    .push_bind(row.metric_date)
                    .push_bind(row.metric_key.clone())
                    .push_bind(row.metric_value)
                    .push_bind(row.dimensions.clone())
                    .push_bind(row.raw_row.clone());
            });
            let inserted = qb
                .build()
                .execute(&mut *tx)
                .await
                .context("inserting metric row chunk")?;
            outcome.inserted += inserted.rows_affected();
            debug!(rows = chunk.len(), "inserted metric row chunk");
        }

        tx.commit().await.context("committing replace transaction")?;
        Ok(outcome)
    }

    async fn metric_rows_for_client(
        &self,
        client_id: Uuid,
        range: DateRange,
    ) -> Result<Vec<MetricRow>> {
        let rows = sqlx::query(
            r#"
            SELECT id, client_id, integration_id, platform, metric_date, metric_key, metric_value, dimensions, raw_row
            FROM metric_rows
            WHERE client_id = $1 AND metric_date BETWEEN $2 AND $3
            ORDER BY metric_date, metric_key
            "#,
        )
        .bind(client_id)
        .bind(range.from())
        .bind(range.to())
        .fetch_all(&self.pool)
        .await
        .context("loading metric rows for client")?;
        rows.iter().map(metric_row_from_row).collect()
    }

    async fn clients_with_metric_rows(&self, range: DateRange) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT client_id
            FROM metric_rows
            WHERE metric_date BETWEEN $1 AND $2
            ORDER BY client_id
            "#,
        )
        .bind(range.from())
        .bind(range.to())
        .fetch_all(&self.pool)
        .await
        .context("listing clients with metric rows")?;
        rows.iter()
            .map(|row| row.try_get::<Uuid, _>("client_id").map_err(Into::into))
            .collect()
    }

    async fn kpi_definitions(&self, client_id: Uuid) -> Result<Vec<KpiDefinition>> {
        let rows = sqlx::query(
            r#"
            SELECT id, client_id, metric_key, label, unit, is_visible, display_order
            FROM kpi_definitions
            WHERE client_id = $1
            ORDER BY display_order, metric_key
            "#,
        )
        .bind(client_id)
        .fetch_all(&self.pool)
        .await
        .context("loading kpi definitions")?;
        rows.iter()
            .map(|row| -> Result<KpiDefinition> {
                Ok(KpiDefinition {
                    id: row.try_get("id")?,
                    client_id: row.try_get("client_id")?,
                    metric_key: row.try_get("metric_key")?,
                    label: row.try_get("label")?,
                    unit: row.try_get("unit")?,
                    is_visible: row.try_get("is_visible")?,
                    display_order: row.try_get("display_order")?,
                })
            })
            .collect()
    }

    async fn find_metric(&self, key: &MetricNaturalKey) -> Result<Option<Metric>> {
        let row = sqlx::query(
            r#"
            SELECT id, client_id, period_type, period_start, period_end, metric_key, value, notes, created_by
            FROM metrics
            WHERE client_id = $1 AND period_type = $2 AND period_start = $3 AND period_end = $4 AND metric_key = $5
            "#,
        )
        .bind(key.client_id)
        .bind(key.period_type.as_str())
        .bind(key.period_start)
        .bind(key.period_end)
        .bind(&key.metric_key)
        .fetch_optional(&self.pool)
        .await
        .context("looking up metric by natural key")?;
        row.as_ref().map(metric_from_row).transpose()
    }

    async fn update_metric_value(&self, metric_id: Uuid, value: f64) -> Result<()> {
        sqlx::query("UPDATE metrics SET value = $2, updated_at = now() WHERE id = $1")
            .bind(metric_id)
            .bind(value)
            .execute(&self.pool)
            .await
            .context("updating metric value")?;
        Ok(())
    }

    async fn insert_metric(&self, metric: &Metric) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO metrics (id, client_id, period_type, period_start, period_end, metric_key, value, notes, created_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(metric.id)
        .bind(metric.client_id)
        .bind(metric.period_type.as_str())
        .bind(metric.period_start)
        .bind(metric.period_end)
        .bind(&metric.metric_key)
        .bind(metric.value)
        .bind(&metric.notes)
        .bind(metric.created_by)
        .execute(&self.pool)
        .await
        .context("inserting metric")?;
        Ok(())
    }
}
