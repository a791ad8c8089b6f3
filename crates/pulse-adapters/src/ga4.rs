use std::sync::Arc;

use async_trait::async_trait;
use pulse_core::{DateRange, MetricFact, Platform};
use pulse_storage::HttpFetcher;
use serde_json::{json, Value as JsonValue};

use crate::credentials::{bearer_token, required_str, OAuthGrant};
use crate::{
    json_number, json_str, parse_upstream_date, rows_at, AdapterEndpoints, AdapterError,
    PlatformAdapter,
};

/// Requested in this order; `metricValues` come back positionally.
/// The flag marks 0..1 ratios reported on the 0..100 scale.
const REPORT_METRICS: [(&str, bool); 6] = [
    ("sessions", false),
    ("totalUsers", false),
    ("screenPageViews", false),
    ("bounceRate", true),
    ("averageSessionDuration", false),
    ("conversions", false),
];

pub fn report_request(range: DateRange) -> JsonValue {
    json!({
        "dateRanges": [{
            "startDate": range.from().to_string(),
            "endDate": range.to().to_string(),
        }],
        "dimensions": [{ "name": "date" }],
        "metrics": REPORT_METRICS
            .iter()
            .map(|(name, _)| json!({ "name": name }))
            .collect::<Vec<_>>(),
        "orderBys": [{ "dimension": { "dimensionName": "date" } }],
        "keepEmptyRows": true,
    })
}

/// Web-analytics platform: reporting RPC with a `date` dimension.
pub struct Ga4Adapter {
    http: Arc<HttpFetcher>,
    base_url: String,
    token_url: String,
}

impl Ga4Adapter {
    pub fn new(http: Arc<HttpFetcher>, endpoints: &AdapterEndpoints) -> Self {
        Self {
            http,
            base_url: endpoints.ga4_base_url.trim_end_matches('/').to_string(),
            token_url: endpoints.oauth_token_url.clone(),
        }
    }

    fn fan_out(row: &JsonValue, property_id: &str) -> Result<Vec<MetricFact>, AdapterError> {
        let raw_date = row
            .get("dimensionValues")
            .and_then(|values| values.get(0))
            .and_then(|value| json_str(value, &["value"]))
            .ok_or_else(|| AdapterError::payload("report row missing date dimension"))?;
        let metric_date = parse_upstream_date(raw_date)?;

        let values = match row.get("metricValues") {
            Some(JsonValue::Array(values)) if values.len() == REPORT_METRICS.len() => values,
            _ => {
                return Err(AdapterError::payload(format!(
                    "report row for {raw_date} does not carry {} metric values",
                    REPORT_METRICS.len()
                )))
            }
        };

        Ok(REPORT_METRICS
            .iter()
            .zip(values)
            .map(|((name, is_ratio), value)| {
                let number = json_number(value, &["value"]);
                MetricFact {
                    metric_date,
                    metric_key: name.to_string(),
                    metric_value: if *is_ratio { number * 100.0 } else { number },
                    dimensions: json!({ "property_id": property_id }),
                    raw_row: row.clone(),
                }
            })
            .collect())
    }
}

#[async_trait]
impl PlatformAdapter for Ga4Adapter {
    fn platform(&self) -> Platform {
        Platform::Ga4
    }

    async fn fetch_metrics(
        &self,
        credentials: &JsonValue,
        range: DateRange,
    ) -> Result<Vec<MetricFact>, AdapterError> {
        let grant = OAuthGrant::from_blob(credentials)?;
        let property_id = required_str(credentials, "property_id")?
            .trim_start_matches("properties/")
            .to_string();
        let account_key = format!("ga4:{property_id}");
        let token = bearer_token(&self.http, &self.token_url, &account_key, &grant).await?;

        let request = self
            .http
            .client()
            .post(format!(
                "{}/v1beta/properties/{}:runReport",
                self.base_url, property_id
            ))
            .bearer_auth(token.as_str())
            .json(&report_request(range));

        let body = self.http.send_json(&account_key, request).await?;
        let mut facts = Vec::new();
        for row in rows_at(&body, "rows")? {
            facts.extend(Self::fan_out(row, &property_id)?);
        }
        Ok(facts)
    }
}
