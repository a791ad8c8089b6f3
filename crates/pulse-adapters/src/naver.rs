use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use pulse_core::{DateRange, MetricFact, Platform};
use pulse_storage::HttpFetcher;
use serde_json::{json, Value as JsonValue};

use crate::credentials::SignedKeyCredentials;
use crate::{
    json_number, json_str, parse_upstream_date, rows_at, AdapterEndpoints, AdapterError,
    PlatformAdapter,
};

const STATS_PATH: &str = "/stats";

/// Upstream stat field → emitted metric key.
const STAT_FIELDS: [(&str, &str); 6] = [
    ("impCnt", "impressions"),
    ("clkCnt", "clicks"),
    ("salesAmt", "cost"),
    ("ccnt", "conversions"),
    ("ctr", "ctr"),
    ("cpc", "cpc"),
];

/// Keyword-ads platform: signed REST, one daily stats call per fetch.
pub struct NaverAdapter {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl NaverAdapter {
    pub fn new(http: Arc<HttpFetcher>, endpoints: &AdapterEndpoints) -> Self {
        Self {
            http,
            base_url: endpoints.naver_base_url.trim_end_matches('/').to_string(),
        }
    }

    fn fan_out(row: &JsonValue, customer_id: &str) -> Result<Vec<MetricFact>, AdapterError> {
        let raw_date = json_str(row, &["dateStart"])
            .or_else(|| json_str(row, &["date"]))
            .ok_or_else(|| AdapterError::payload("stats row missing `dateStart`"))?;
        let metric_date = parse_upstream_date(raw_date)?;
        Ok(STAT_FIELDS
            .iter()
            .map(|(field, key)| MetricFact {
                metric_date,
                metric_key: key.to_string(),
                metric_value: json_number(row, &[*field]),
                dimensions: json!({ "customer_id": customer_id }),
                raw_row: row.clone(),
            })
            .collect())
    }
}

#[async_trait]
impl PlatformAdapter for NaverAdapter {
    fn platform(&self) -> Platform {
        Platform::Naver
    }

    async fn fetch_metrics(
        &self,
        credentials: &JsonValue,
        range: DateRange,
    ) -> Result<Vec<MetricFact>, AdapterError> {
        let creds = SignedKeyCredentials::from_blob(credentials)?;
        let timestamp = Utc::now().timestamp_millis();
        let signature = creds.sign(timestamp, "GET", STATS_PATH)?;

        let fields = json!(STAT_FIELDS.map(|(field, _)| field)).to_string();
        let time_range = json!({
            "since": range.from().to_string(),
            "until": range.to().to_string(),
        })
        .to_string();

        let request = self
            .http
            .client()
            .get(format!("{}{}", self.base_url, STATS_PATH))
            .query(&[
                ("id", creds.customer_id.as_str()),
                ("fields", fields.as_str()),
                ("timeRange", time_range.as_str()),
                ("breakdown", "date"),
            ])
            .header("X-Timestamp", timestamp.to_string())
            .header("X-API-KEY", &creds.api_key)
            .header("X-Customer", &creds.customer_id)
            .header("X-Signature", signature);

        let account_key = format!("naver:{}", creds.customer_id);
        let body = self.http.send_json(&account_key, request).await?;

        let mut facts = Vec::new();
        for row in rows_at(&body, "data")? {
            facts.extend(Self::fan_out(row, &creds.customer_id)?);
        }
        Ok(facts)
    }
}
