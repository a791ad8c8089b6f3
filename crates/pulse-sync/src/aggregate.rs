use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use pulse_core::{
    round2, ClientScope, DateRange, Metric, MetricNaturalKey, MetricRow, Period, PeriodType,
    AUTO_AGGREGATED_NOTE,
};
use pulse_storage::MetricStore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::key_map::MetricKeyMap;
use crate::periods::periods_for_range;

#[derive(Debug, Error)]
pub enum AggregateError {
    /// Raised before any write: every aggregated Metric must name its author.
    #[error("an acting user is required to aggregate metrics")]
    MissingActor,
    #[error("{0:#}")]
    Store(anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRequest {
    pub scope: ClientScope,
    pub period_type: PeriodType,
    pub range: DateRange,
    pub actor_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateSummary {
    pub inserted: usize,
    pub updated: usize,
    /// (client, period, canonical key) sums dropped by the KPI allow-list.
    pub skipped: usize,
    pub errors: Vec<String>,
}

/// Sum MetricRow facts per canonical key. Keys are mapped before summing so
/// two platform keys that share a canonical key land in one total.
pub fn sum_by_canonical_key(rows: &[MetricRow], key_map: &MetricKeyMap) -> BTreeMap<String, f64> {
    let mut sums = BTreeMap::new();
    for row in rows {
        *sums
            .entry(key_map.canonical(&row.metric_key).to_string())
            .or_insert(0.0) += row.metric_value;
    }
    sums
}

/// Rolls daily facts up into per-period Metric rows, restricted to each
/// client's KPI allow-list.
pub struct MetricAggregator {
    store: Arc<dyn MetricStore>,
    key_map: MetricKeyMap,
}

impl MetricAggregator {
    pub fn new(store: Arc<dyn MetricStore>, key_map: MetricKeyMap) -> Self {
        Self { store, key_map }
    }

    pub fn key_map(&self) -> &MetricKeyMap {
        &self.key_map
    }

    pub async fn aggregate(
        &self,
        request: &AggregateRequest,
    ) -> Result<AggregateSummary, AggregateError> {
        let actor_id = request.actor_id.ok_or(AggregateError::MissingActor)?;
        let clients = match request.scope {
            ClientScope::Client(client_id) => vec![client_id],
            ClientScope::AllWithFacts => self
                .store
                .clients_with_metric_rows(request.range)
                .await
                .map_err(AggregateError::Store)?,
        };
        let periods = periods_for_range(request.period_type, request.range);

        let mut summary = AggregateSummary::default();
        for client_id in clients {
            let span = info_span!("aggregate_client", %client_id);
            self.aggregate_client(client_id, request.period_type, &periods, actor_id, &mut summary)
                .instrument(span)
                .await;
        }

        info!(
            period_type = %request.period_type,
            range = %request.range,
            inserted = summary.inserted,
            updated = summary.updated,
            skipped = summary.skipped,
            errors = summary.errors.len(),
            "aggregation finished"
        );
        Ok(summary)
    }

    async fn aggregate_client(
        &self,
        client_id: Uuid,
        period_type: PeriodType,
        periods: &[Period],
        actor_id: Uuid,
        summary: &mut AggregateSummary,
    ) {
        let allowed: HashSet<String> = match self.store.kpi_definitions(client_id).await {
            Ok(definitions) => definitions.into_iter().map(|d| d.metric_key).collect(),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "could not load KPI definitions");
                summary
                    .errors
                    .push(format!("client {client_id}: {err:#}"));
                return;
            }
        };

        for period in periods {
            if let Err(err) = self
                .aggregate_period(client_id, period_type, *period, &allowed, actor_id, summary)
                .await
            {
                warn!(period_start = %period.start, error = %format!("{err:#}"), "period aggregation failed");
                summary.errors.push(format!(
                    "client {client_id} {period_type} {}..{}: {err:#}",
                    period.start, period.end
                ));
            }
        }
    }

    async fn aggregate_period(
        &self,
        client_id: Uuid,
        period_type: PeriodType,
        period: Period,
        allowed: &HashSet<String>,
        actor_id: Uuid,
        summary: &mut AggregateSummary,
    ) -> Result<()> {
        let rows = self
            .store
            .metric_rows_for_client(client_id, period.as_range())
            .await?;

        for (metric_key, total) in sum_by_canonical_key(&rows, &self.key_map) {
            if !allowed.contains(&metric_key) {
                summary.skipped += 1;
                continue;
            }

            let value = round2(total);
            let natural_key = MetricNaturalKey {
                client_id,
                period_type,
                period_start: period.start,
                period_end: period.end,
                metric_key,
            };
            match self.store.find_metric(&natural_key).await? {
                Some(existing) => {
                    self.store.update_metric_value(existing.id, value).await?;
                    summary.updated += 1;
                }
                None => {
                    self.store
                        .insert_metric(&Metric {
                            id: Uuid::new_v4(),
                            client_id,
                            period_type,
                            period_start: natural_key.period_start,
                            period_end: natural_key.period_end,
                            metric_key: natural_key.metric_key,
                            value,
                            notes: Some(AUTO_AGGREGATED_NOTE.to_string()),
                            created_by: actor_id,
                        })
                        .await?;
                    summary.inserted += 1;
                }
            }
        }
        Ok(())
    }
}
