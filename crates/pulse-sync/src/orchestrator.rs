use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use pulse_adapters::{AdapterError, AdapterRegistry};
use pulse_core::{DateRange, Integration, IntegrationStatus, MetricRow, Platform, SyncStatus};
use pulse_storage::{MetricStore, ReplaceScope};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Why one integration's sync did not land. The Display text is what ends up
/// in `Integration.last_error` and `SyncLog.error_message`.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no adapter registered for platform {0}")]
    NoAdapter(Platform),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("{0:#}")]
    Store(anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncOutcome {
    pub integration_id: Uuid,
    pub platform: Platform,
    pub success: bool,
    pub records_synced: usize,
    pub error: Option<String>,
    pub sync_log_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntegrationSyncResult {
    pub integration_id: Uuid,
    pub platform: Platform,
    pub success: bool,
    pub records_synced: Option<usize>,
    pub error: Option<String>,
}

impl From<SyncOutcome> for IntegrationSyncResult {
    fn from(outcome: SyncOutcome) -> Self {
        Self {
            integration_id: outcome.integration_id,
            platform: outcome.platform,
            success: outcome.success,
            records_synced: outcome.success.then_some(outcome.records_synced),
            error: outcome.error,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchSyncSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<IntegrationSyncResult>,
}

/// Drives fetch → replace → bookkeeping for integrations, one at a time.
pub struct SyncOrchestrator {
    store: Arc<dyn MetricStore>,
    adapters: AdapterRegistry,
}

impl SyncOrchestrator {
    pub fn new(store: Arc<dyn MetricStore>, adapters: AdapterRegistry) -> Self {
        Self { store, adapters }
    }

    /// Sync one integration over `range`.
    ///
    /// Adapter and write failures come back as an unsuccessful [`SyncOutcome`]
    /// after the integration and its sync log have been marked. `Err` means
    /// the attempt could not even be recorded.
    pub async fn sync_integration(
        &self,
        integration: &Integration,
        range: DateRange,
    ) -> Result<SyncOutcome> {
        let span = info_span!(
            "integration_sync",
            integration_id = %integration.id,
            platform = %integration.platform,
        );
        self.sync_integration_inner(integration, range)
            .instrument(span)
            .await
    }

    async fn sync_integration_inner(
        &self,
        integration: &Integration,
        range: DateRange,
    ) -> Result<SyncOutcome> {
        let kind = integration.sync_kind();
        let log = self
            .store
            .start_sync_log(integration.id, kind, Utc::now())
            .await
            .with_context(|| format!("opening sync log for integration {}", integration.id))?;
        info!(sync_kind = %kind, %range, "sync started");

        let attempt = match self.fetch_and_replace(integration, range).await {
            Ok(count) => self
                .store
                .mark_integration_synced(integration.id, Utc::now())
                .await
                .map(|_| count)
                .map_err(SyncError::Store),
            Err(err) => Err(err),
        };

        match attempt {
            Ok(count) => {
                // Rows and integration state are already committed; a stuck log
                // must not turn them into a failed sync.
                if let Err(log_err) = self
                    .store
                    .finish_sync_log(log.id, SyncStatus::Success, count as i64, None, Utc::now())
                    .await
                {
                    warn!(error = %format!("{log_err:#}"), "could not close sync log");
                }
                info!(records_synced = count, "sync succeeded");
                Ok(SyncOutcome {
                    integration_id: integration.id,
                    platform: integration.platform,
                    success: true,
                    records_synced: count,
                    error: None,
                    sync_log_id: log.id,
                })
            }
            Err(err) => {
                let message = err.to_string();
                warn!(error = %message, "sync failed");
                if let Err(mark_err) = self
                    .store
                    .mark_integration_failed(integration.id, &message)
                    .await
                {
                    warn!(error = %format!("{mark_err:#}"), "could not mark integration as errored");
                }
                if let Err(log_err) = self
                    .store
                    .finish_sync_log(log.id, SyncStatus::Error, 0, Some(&message), Utc::now())
                    .await
                {
                    warn!(error = %format!("{log_err:#}"), "could not close sync log");
                }
                Ok(SyncOutcome {
                    integration_id: integration.id,
                    platform: integration.platform,
                    success: false,
                    records_synced: 0,
                    error: Some(message),
                    sync_log_id: log.id,
                })
            }
        }
    }

    /// Nothing is written unless the whole fetch succeeded.
    async fn fetch_and_replace(
        &self,
        integration: &Integration,
        range: DateRange,
    ) -> Result<usize, SyncError> {
        let adapter = self
            .adapters
            .get(integration.platform)
            .ok_or(SyncError::NoAdapter(integration.platform))?;
        let facts = adapter
            .fetch_metrics(&integration.credentials, range)
            .await?;

        let fetched = facts.len();
        let rows: Vec<MetricRow> = facts
            .into_iter()
            .filter(|fact| range.contains(fact.metric_date))
            .map(|fact| MetricRow::from_fact(integration, fact))
            .collect();
        if rows.len() < fetched {
            warn!(
                dropped = fetched - rows.len(),
                "discarding facts dated outside the requested range"
            );
        }

        let metric_keys: BTreeSet<&str> = rows.iter().map(|row| row.metric_key.as_str()).collect();
        let scope = ReplaceScope {
            integration_id: integration.id,
            range,
            metric_keys: metric_keys.into_iter().map(str::to_string).collect(),
        };
        let outcome = self
            .store
            .replace_metric_rows(&scope, &rows)
            .await
            .map_err(SyncError::Store)?;
        info!(
            deleted = outcome.deleted,
            inserted = outcome.inserted,
            keys = scope.metric_keys.len(),
            "metric rows replaced"
        );
        Ok(rows.len())
    }

    /// Sync every active or errored integration sequentially. One failure
    /// never stops the rest.
    pub async fn sync_all_active(&self, range: DateRange) -> Result<BatchSyncSummary> {
        let integrations = self
            .store
            .integrations_with_status(&IntegrationStatus::BATCH_ELIGIBLE)
            .await
            .context("listing integrations to sync")?;

        let mut summary = BatchSyncSummary {
            total: integrations.len(),
            ..Default::default()
        };
        for integration in &integrations {
            let result = match self.sync_integration(integration, range).await {
                Ok(outcome) => IntegrationSyncResult::from(outcome),
                Err(err) => {
                    warn!(integration_id = %integration.id, error = %format!("{err:#}"), "sync attempt not recorded");
                    IntegrationSyncResult {
                        integration_id: integration.id,
                        platform: integration.platform,
                        success: false,
                        records_synced: None,
                        error: Some(format!("{err:#}")),
                    }
                }
            };
            if result.success {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
            summary.results.push(result);
        }

        info!(
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "batch sync finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::NaiveDate;
    use pulse_adapters::PlatformAdapter;
    use pulse_core::{MetricFact, SyncKind};
    use pulse_storage::MemoryStore;
    use serde_json::{json, Value as JsonValue};

    use crate::test_support::FaultyStore;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn range(from: u32, to: u32) -> DateRange {
        DateRange::new(day(from), day(to)).unwrap()
    }

    /// Emits one fact per day per key. Credentials steer it:
    /// `{"fail_with": "..."}` fails, `{"value": n}` sets every value,
    /// `{"stray_day": d}` adds a fact outside the range.
    struct ScriptedAdapter {
        platform: Platform,
        keys: Vec<&'static str>,
        calls: Mutex<usize>,
    }

    impl ScriptedAdapter {
        fn new(platform: Platform, keys: &[&'static str]) -> Arc<Self> {
            Arc::new(Self {
                platform,
                keys: keys.to_vec(),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl PlatformAdapter for ScriptedAdapter {
        fn platform(&self) -> Platform {
            self.platform
        }

        async fn fetch_metrics(
            &self,
            credentials: &JsonValue,
            range: DateRange,
        ) -> Result<Vec<MetricFact>, AdapterError> {
            *self.calls.lock().unwrap() += 1;
            if let Some(message) = credentials["fail_with"].as_str() {
                return Err(AdapterError::Upstream {
                    status: Some(400),
                    message: message.to_string(),
                });
            }
            let value = credentials["value"].as_f64().unwrap_or(10.0);
            let mut days: Vec<NaiveDate> = range.from().iter_days().take(range.days() as usize).collect();
            if let Some(stray) = credentials["stray_day"].as_u64() {
                days.push(day(stray as u32));
            }
            Ok(days
                .into_iter()
                .flat_map(|date| {
                    self.keys.iter().map(move |key| MetricFact {
                        metric_date: date,
                        metric_key: key.to_string(),
                        metric_value: value,
                        dimensions: json!({}),
                        raw_row: json!({"date": date.to_string()}),
                    })
                })
                .collect())
        }
    }

    fn integration(platform: Platform, credentials: JsonValue) -> Integration {
        Integration {
            id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            platform,
            display_name: format!("{platform} account"),
            credentials,
            status: IntegrationStatus::Active,
            last_synced_at: None,
            last_error: None,
        }
    }

    fn orchestrator(store: &Arc<MemoryStore>, adapters: &[Arc<ScriptedAdapter>]) -> SyncOrchestrator {
        let mut registry = AdapterRegistry::empty();
        for adapter in adapters {
            registry.register(adapter.clone());
        }
        SyncOrchestrator::new(store.clone(), registry)
    }

    fn fact_set(store: &MemoryStore) -> Vec<(Uuid, NaiveDate, String, String)> {
        let mut facts: Vec<_> = store
            .metric_rows()
            .into_iter()
            .map(|row| {
                (
                    row.integration_id,
                    row.metric_date,
                    row.metric_key,
                    format!("{:.2}", row.metric_value),
                )
            })
            .collect();
        facts.sort();
        facts
    }

    #[tokio::test]
    async fn successful_sync_marks_integration_and_log() {
        let store = Arc::new(MemoryStore::new());
        let adapter = ScriptedAdapter::new(Platform::Meta, &["impressions", "clicks", "spend"]);
        let sync = orchestrator(&store, &[adapter]);
        let meta = integration(Platform::Meta, json!({"value": 5.0}));
        store.insert_integration(meta.clone());

        let outcome = sync.sync_integration(&meta, range(4, 10)).await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.records_synced, 21);
        assert_eq!(store.metric_rows().len(), 21);
        let saved = store.integration(meta.id).unwrap();
        assert_eq!(saved.status, IntegrationStatus::Active);
        assert!(saved.last_synced_at.is_some());
        let logs = store.sync_logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].id, outcome.sync_log_id);
        assert_eq!(logs[0].status, SyncStatus::Success);
        assert_eq!(logs[0].sync_kind, SyncKind::Full);
        assert_eq!(logs[0].records_synced, 21);
        assert!(logs[0].completed_at.is_some());
    }

    #[tokio::test]
    async fn resync_of_same_range_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let adapter = ScriptedAdapter::new(Platform::Naver, &["impressions", "clicks"]);
        let sync = orchestrator(&store, &[adapter]);
        let naver = integration(Platform::Naver, json!({}));
        store.insert_integration(naver.clone());

        sync.sync_integration(&naver, range(1, 7)).await.unwrap();
        let first = fact_set(&store);
        let refreshed = store.integration(naver.id).unwrap();
        sync.sync_integration(&refreshed, range(1, 7)).await.unwrap();

        assert_eq!(fact_set(&store), first);
        assert_eq!(store.metric_rows().len(), 14);
        let kinds: Vec<_> = store.sync_logs().iter().map(|l| l.sync_kind).collect();
        assert_eq!(kinds, vec![SyncKind::Full, SyncKind::Incremental]);
    }

    #[tokio::test]
    async fn failed_fetch_leaves_existing_facts_untouched() {
        let store = Arc::new(MemoryStore::new());
        let adapter = ScriptedAdapter::new(Platform::Ga4, &["sessions"]);
        let sync = orchestrator(&store, &[adapter]);
        let ga4 = integration(Platform::Ga4, json!({"value": 3.0}));
        store.insert_integration(ga4.clone());
        sync.sync_integration(&ga4, range(1, 7)).await.unwrap();

        let mut revoked = store.integration(ga4.id).unwrap();
        let synced_at = revoked.last_synced_at;
        revoked.credentials = json!({"fail_with": "Token has been expired or revoked."});
        store.insert_integration(revoked.clone());
        let before = store.metric_rows();

        let outcome = sync.sync_integration(&revoked, range(1, 7)).await.unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("Token has been expired or revoked."));
        assert_eq!(store.metric_rows(), before);
        let saved = store.integration(ga4.id).unwrap();
        assert_eq!(saved.status, IntegrationStatus::Error);
        assert_eq!(saved.last_error.as_deref(), Some("Token has been expired or revoked."));
        assert_eq!(saved.last_synced_at, synced_at);
        let failed_log = store.sync_logs().pop().unwrap();
        assert_eq!(failed_log.status, SyncStatus::Error);
        assert_eq!(failed_log.records_synced, 0);
        assert_eq!(
            failed_log.error_message.as_deref(),
            Some("Token has been expired or revoked.")
        );
    }

    #[tokio::test]
    async fn batch_continues_past_a_failing_integration() {
        let store = Arc::new(MemoryStore::new());
        let naver = ScriptedAdapter::new(Platform::Naver, &["clicks"]);
        let meta = ScriptedAdapter::new(Platform::Meta, &["clicks"]);
        let ga4 = ScriptedAdapter::new(Platform::Ga4, &["sessions"]);
        let sync = orchestrator(&store, &[naver.clone(), meta.clone(), ga4.clone()]);

        let first = integration(Platform::Naver, json!({}));
        let second = integration(Platform::Meta, json!({"fail_with": "(#190) Invalid OAuth access token"}));
        let mut third = integration(Platform::Ga4, json!({}));
        third.status = IntegrationStatus::Error;
        third.last_error = Some("previous failure".into());
        let mut parked = integration(Platform::Naver, json!({}));
        parked.status = IntegrationStatus::Inactive;
        for i in [&first, &second, &third, &parked] {
            store.insert_integration(i.clone());
        }

        let summary = sync.sync_all_active(range(1, 2)).await.unwrap();

        assert_eq!(summary.total, 3);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(naver.calls() + meta.calls() + ga4.calls(), 3);
        let failed = summary.results.iter().find(|r| !r.success).unwrap();
        assert_eq!(failed.integration_id, second.id);
        assert_eq!(failed.records_synced, None);
        assert_eq!(failed.error.as_deref(), Some("(#190) Invalid OAuth access token"));
        assert!(summary
            .results
            .iter()
            .all(|r| r.integration_id != parked.id));

        let recovered = store.integration(third.id).unwrap();
        assert_eq!(recovered.status, IntegrationStatus::Active);
        assert_eq!(recovered.last_error, None);
        assert_eq!(store.integration(parked.id).unwrap().last_synced_at, None);
    }

    #[tokio::test]
    async fn unregistered_platform_fails_like_an_adapter_error() {
        let store = Arc::new(MemoryStore::new());
        let sync = orchestrator(&store, &[]);
        let google = integration(Platform::GoogleAds, json!({}));
        store.insert_integration(google.clone());

        let outcome = sync.sync_integration(&google, range(1, 1)).await.unwrap();

        assert!(!outcome.success);
        assert_eq!(
            outcome.error.as_deref(),
            Some("no adapter registered for platform google_ads")
        );
        assert!(store.metric_rows().is_empty());
        assert_eq!(store.integration(google.id).unwrap().status, IntegrationStatus::Error);
    }

    #[tokio::test]
    async fn facts_outside_the_range_are_dropped() {
        let store = Arc::new(MemoryStore::new());
        let adapter = ScriptedAdapter::new(Platform::Meta, &["reach"]);
        let sync = orchestrator(&store, &[adapter]);
        let meta = integration(Platform::Meta, json!({"stray_day": 20}));
        store.insert_integration(meta.clone());

        let outcome = sync.sync_integration(&meta, range(1, 3)).await.unwrap();

        assert_eq!(outcome.records_synced, 3);
        assert!(store.metric_rows().iter().all(|row| row.metric_date <= day(3)));
    }

    #[tokio::test]
    async fn unclosable_log_does_not_fail_a_committed_sync() {
        let store = Arc::new(FaultyStore {
            fail_log_finish: true,
            ..Default::default()
        });
        let mut registry = AdapterRegistry::empty();
        registry.register(ScriptedAdapter::new(Platform::Meta, &["clicks"]));
        let sync = SyncOrchestrator::new(store.clone(), registry);
        let meta = integration(Platform::Meta, json!({}));
        store.inner.insert_integration(meta.clone());

        let summary = sync.sync_all_active(range(4, 10)).await.unwrap();

        assert_eq!((summary.succeeded, summary.failed), (1, 0));
        assert!(summary.results[0].success);
        assert_eq!(summary.results[0].records_synced, Some(7));
        assert_eq!(store.inner.metric_rows().len(), 7);
        let saved = store.inner.integration(meta.id).unwrap();
        assert_eq!(saved.status, IntegrationStatus::Active);
        assert!(saved.last_error.is_none());
    }
}
