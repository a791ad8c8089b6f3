use std::sync::Arc;

use async_trait::async_trait;
use pulse_core::{DateRange, MetricFact, Platform};
use pulse_storage::HttpFetcher;
use serde_json::{json, Value as JsonValue};

use crate::credentials::{bearer_token, optional_str, required_str, OAuthGrant};
use crate::{
    json_number, json_str, parse_upstream_date, rows_at, AdapterEndpoints, AdapterError,
    PlatformAdapter,
};

const MICROS_PER_UNIT: f64 = 1_000_000.0;

#[derive(Debug, Clone, Copy)]
enum Scale {
    Unit,
    Micros,
    Ratio,
}

/// (JSON field under `metrics`, emitted key, normalization).
const METRIC_FIELDS: [(&str, &str, Scale); 6] = [
    ("impressions", "impressions", Scale::Unit),
    ("clicks", "clicks", Scale::Unit),
    ("costMicros", "cost", Scale::Micros),
    ("conversions", "conversions", Scale::Unit),
    ("ctr", "ctr", Scale::Ratio),
    ("averageCpc", "average_cpc", Scale::Micros),
];

impl Scale {
    fn apply(self, value: f64) -> f64 {
        match self {
            Scale::Unit => value,
            Scale::Micros => value / MICROS_PER_UNIT,
            Scale::Ratio => value * 100.0,
        }
    }
}

pub fn build_query(range: DateRange) -> String {
    format!(
        "SELECT segments.date, metrics.impressions, metrics.clicks, metrics.cost_micros, \
         metrics.conversions, metrics.ctr, metrics.average_cpc \
         FROM customer \
         WHERE segments.date BETWEEN '{}' AND '{}' \
         ORDER BY segments.date",
        range.from(),
        range.to()
    )
}

/// Search-ads network: query language over the streamed search RPC.
pub struct GoogleAdsAdapter {
    http: Arc<HttpFetcher>,
    base_url: String,
    api_version: String,
    token_url: String,
}

impl GoogleAdsAdapter {
    pub fn new(http: Arc<HttpFetcher>, endpoints: &AdapterEndpoints) -> Self {
        Self {
            http,
            base_url: endpoints.google_ads_base_url.trim_end_matches('/').to_string(),
            api_version: endpoints.google_ads_api_version.clone(),
            token_url: endpoints.oauth_token_url.clone(),
        }
    }

    fn fan_out(result: &JsonValue, customer_id: &str) -> Result<Vec<MetricFact>, AdapterError> {
        let raw_date = json_str(result, &["segments", "date"])
            .ok_or_else(|| AdapterError::payload("search result missing `segments.date`"))?;
        let metric_date = parse_upstream_date(raw_date)?;
        Ok(METRIC_FIELDS
            .iter()
            .map(|(field, key, scale)| MetricFact {
                metric_date,
                metric_key: key.to_string(),
                metric_value: scale.apply(json_number(result, &["metrics", *field])),
                dimensions: json!({ "customer_id": customer_id }),
                raw_row: result.clone(),
            })
            .collect())
    }
}

/// searchStream answers with an array of batches; plain search with one object.
fn result_batches(body: &JsonValue) -> Vec<&JsonValue> {
    match body {
        JsonValue::Array(batches) => batches.iter().collect(),
        other => vec![other],
    }
}

#[async_trait]
impl PlatformAdapter for GoogleAdsAdapter {
    fn platform(&self) -> Platform {
        Platform::GoogleAds
    }

    async fn fetch_metrics(
        &self,
        credentials: &JsonValue,
        range: DateRange,
    ) -> Result<Vec<MetricFact>, AdapterError> {
        let grant = OAuthGrant::from_blob(credentials)?;
        let customer_id = required_str(credentials, "customer_id")?.replace('-', "");
        let developer_token = required_str(credentials, "developer_token")?;
        let login_customer_id =
            optional_str(credentials, "login_customer_id").map(|id| id.replace('-', ""));
        let account_key = format!("google_ads:{customer_id}");
        let token = bearer_token(&self.http, &self.token_url, &account_key, &grant).await?;

        let mut request = self
            .http
            .client()
            .post(format!(
                "{}/{}/customers/{}/googleAds:searchStream",
                self.base_url, self.api_version, customer_id
            ))
            .bearer_auth(token.as_str())
            .header("developer-token", developer_token)
            .json(&json!({ "query": build_query(range) }));
        if let Some(login_customer_id) = login_customer_id {
            request = request.header("login-customer-id", login_customer_id);
        }

        let body = self.http.send_json(&account_key, request).await?;
        let mut facts = Vec::new();
        for batch in result_batches(&body) {
            for result in rows_at(batch, "results")? {
                facts.extend(Self::fan_out(result, &customer_id)?);
            }
        }
        Ok(facts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use httpmock::{Method::POST, MockServer};
    use pulse_storage::HttpClientConfig;

    fn adapter(server: &MockServer) -> GoogleAdsAdapter {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        GoogleAdsAdapter::new(http, &AdapterEndpoints::single_host(&server.base_url()))
    }

    fn range() -> DateRange {
        DateRange::new(
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 7).unwrap(),
        )
        .unwrap()
    }

    fn creds() -> JsonValue {
        json!({
            "client_id": "cid",
            "client_secret": "csecret",
            "refresh_token": "rtok",
            "developer_token": "dev-123",
            "customer_id": "123-456-7890"
        })
    }

    #[test]
    fn query_is_bounded_to_the_requested_window() {
        let query = build_query(range());
        assert!(query.contains("BETWEEN '2024-03-01' AND '2024-03-07'"));
        assert!(query.contains("metrics.cost_micros"));
    }

    #[tokio::test]
    async fn stream_batches_are_normalized() {
        let server = MockServer::start_async().await;
        let token = server
            .mock_async(|when, then| {
                when.method(POST).path("/token").body_contains("refresh_token=rtok");
                then.status(200).json_body(json!({"access_token": "bearer-1", "expires_in": 3599}));
            })
            .await;
        let search = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v17/customers/1234567890/googleAds:searchStream")
                    .header("Authorization", "Bearer bearer-1")
                    .header("developer-token", "dev-123")
                    .body_contains("segments.date BETWEEN '2024-03-01' AND '2024-03-07'");
                then.status(200).json_body(json!([
                    {"results": [{
                        "segments": {"date": "2024-03-01"},
                        "metrics": {"impressions": "900", "clicks": "30", "costMicros": "2500000",
                                    "conversions": 1.5, "ctr": 0.0333, "averageCpc": 83333}
                    }]},
                    {"results": [{
                        "segments": {"date": "20240302"},
                        "metrics": {"impressions": "100", "costMicros": "0"}
                    }]}
                ]));
            })
            .await;

        let facts = adapter(&server).fetch_metrics(&creds(), range()).await.unwrap();

        token.assert_async().await;
        search.assert_async().await;
        assert_eq!(facts.len(), 12);
        let cost = facts
            .iter()
            .find(|f| f.metric_key == "cost" && f.metric_date == NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
            .unwrap();
        assert_eq!(cost.metric_value, 2.5);
        let ctr = facts.iter().find(|f| f.metric_key == "ctr").unwrap();
        assert!((ctr.metric_value - 3.33).abs() < 1e-9);
        assert!(facts
            .iter()
            .any(|f| f.metric_date == NaiveDate::from_ymd_opt(2024, 3, 2).unwrap()));
    }

    #[tokio::test]
    async fn missing_developer_token_skips_token_exchange() {
        let server = MockServer::start_async().await;
        let token = server
            .mock_async(|when, then| {
                when.method(POST).path("/token");
                then.status(200).json_body(json!({"access_token": "x"}));
            })
            .await;

        let mut blob = creds();
        blob.as_object_mut().unwrap().remove("developer_token");
        let err = adapter(&server).fetch_metrics(&blob, range()).await.unwrap_err();

        assert!(matches!(err, AdapterError::Credential(ref m) if m.contains("developer_token")));
        assert_eq!(token.hits_async().await, 0);
    }

    #[tokio::test]
    async fn rpc_error_message_is_verbatim() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/token");
                then.status(200).json_body(json!({"access_token": "bearer-1"}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v17/customers/1234567890/googleAds:searchStream");
                then.status(401).json_body(json!({"error": {
                    "code": 401,
                    "message": "Request is missing required authentication credential.",
                    "status": "UNAUTHENTICATED"
                }}));
            })
            .await;

        let err = adapter(&server).fetch_metrics(&creds(), range()).await.unwrap_err();
        assert!(matches!(err, AdapterError::Upstream { status: Some(401), .. }));
        assert_eq!(
            err.to_string(),
            "Request is missing required authentication credential."
        );
    }

    #[tokio::test]
    async fn streamed_error_array_yields_its_message() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/token");
                then.status(200).json_body(json!({"access_token": "bearer-1"}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v17/customers/1234567890/googleAds:searchStream");
                then.status(400).json_body(json!([{"error": {
                    "code": 400,
                    "message": "Invalid customer ID '123'.",
                    "status": "INVALID_ARGUMENT"
                }}]));
            })
            .await;

        let err = adapter(&server).fetch_metrics(&creds(), range()).await.unwrap_err();
        assert!(matches!(err, AdapterError::Upstream { status: Some(400), .. }));
        assert_eq!(err.to_string(), "Invalid customer ID '123'.");
    }
}
