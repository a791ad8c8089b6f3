use std::sync::Arc;

use async_trait::async_trait;
use pulse_core::{DateRange, MetricFact, Platform};
use pulse_storage::HttpFetcher;
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::credentials::{required_str, OAuthGrant};
use crate::{
    json_number, json_str, parse_upstream_date, rows_at, AdapterEndpoints, AdapterError,
    PlatformAdapter,
};

const INSIGHT_FIELDS: [&str; 6] = ["impressions", "clicks", "spend", "reach", "ctr", "actions"];

/// Plain numeric insight fields emitted one-to-one. `actions` becomes `conversions`.
const NUMERIC_FIELDS: [&str; 5] = ["impressions", "clicks", "spend", "reach", "ctr"];

const PURCHASE_ACTION_TYPES: [&str; 3] = [
    "purchase",
    "offsite_conversion.fb_pixel_purchase",
    "omni_purchase",
];

const PAGE_SIZE: &str = "500";
const MAX_PAGES: usize = 1_000;

/// Social-ads platform: paginated Graph API insights with a daily breakdown.
pub struct MetaAdapter {
    http: Arc<HttpFetcher>,
    base_url: String,
    api_version: String,
}

impl MetaAdapter {
    pub fn new(http: Arc<HttpFetcher>, endpoints: &AdapterEndpoints) -> Self {
        Self {
            http,
            base_url: endpoints.meta_base_url.trim_end_matches('/').to_string(),
            api_version: endpoints.meta_api_version.clone(),
        }
    }

    fn fan_out(row: &JsonValue, ad_account_id: &str) -> Result<Vec<MetricFact>, AdapterError> {
        let raw_date = json_str(row, &["date_start"])
            .ok_or_else(|| AdapterError::payload("insights row missing `date_start`"))?;
        let metric_date = parse_upstream_date(raw_date)?;
        let dimensions = json!({
            "ad_account_id": ad_account_id,
            "date_stop": json_str(row, &["date_stop"]),
        });

        let mut facts: Vec<MetricFact> = NUMERIC_FIELDS
            .iter()
            .map(|field| MetricFact {
                metric_date,
                metric_key: field.to_string(),
                metric_value: json_number(row, &[*field]),
                dimensions: dimensions.clone(),
                raw_row: row.clone(),
            })
            .collect();
        facts.push(MetricFact {
            metric_date,
            metric_key: "conversions".to_string(),
            metric_value: purchase_conversions(row),
            dimensions,
            raw_row: row.clone(),
        });
        Ok(facts)
    }
}

/// Value of the first purchase-type entry in `actions`, or 0.
pub fn purchase_conversions(row: &JsonValue) -> f64 {
    row.get("actions")
        .and_then(JsonValue::as_array)
        .and_then(|actions| {
            actions.iter().find(|action| {
                json_str(action, &["action_type"])
                    .is_some_and(|kind| PURCHASE_ACTION_TYPES.contains(&kind))
            })
        })
        .map(|action| json_number(action, &["value"]))
        .unwrap_or(0.0)
}

fn normalize_account_id(raw: &str) -> String {
    raw.trim_start_matches("act_").to_string()
}

#[async_trait]
impl PlatformAdapter for MetaAdapter {
    fn platform(&self) -> Platform {
        Platform::Meta
    }

    async fn fetch_metrics(
        &self,
        credentials: &JsonValue,
        range: DateRange,
    ) -> Result<Vec<MetricFact>, AdapterError> {
        // Meta tokens are long-lived; there is no refresh exchange to run.
        let token = match OAuthGrant::from_blob(credentials)? {
            OAuthGrant::AccessToken(token) => token,
            OAuthGrant::RefreshToken { .. } => {
                return Err(AdapterError::Credential(
                    "meta integrations require an access_token".into(),
                ))
            }
        };
        let ad_account_id = normalize_account_id(&required_str(credentials, "ad_account_id")?);
        let account_key = format!("meta:{ad_account_id}");

        let time_range = json!({
            "since": range.from().to_string(),
            "until": range.to().to_string(),
        })
        .to_string();
        let fields = INSIGHT_FIELDS.join(",");
        let mut request = self
            .http
            .client()
            .get(format!(
                "{}/{}/act_{}/insights",
                self.base_url, self.api_version, ad_account_id
            ))
            .query(&[
                ("level", "account"),
                ("fields", fields.as_str()),
                ("time_range", time_range.as_str()),
                ("time_increment", "1"),
                ("limit", PAGE_SIZE),
            ])
            .bearer_auth(&token);

        let mut facts = Vec::new();
        for page in 1..=MAX_PAGES {
            let body = self.http.send_json(&account_key, request).await?;
            if let Some(message) = json_str(&body, &["error", "message"]) {
                return Err(AdapterError::payload(message));
            }
            for row in rows_at(&body, "data")? {
                facts.extend(Self::fan_out(row, &ad_account_id)?);
            }

            let Some(next) = json_str(&body, &["paging", "next"]) else {
                debug!(pages = page, facts = facts.len(), "meta insights fetched");
                return Ok(facts);
            };
            request = self.http.client().get(next).bearer_auth(&token);
        }

        Err(AdapterError::payload(format!(
            "insights pagination exceeded {MAX_PAGES} pages"
        )))
    }
}
