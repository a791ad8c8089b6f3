//! Platform adapter contract, credential resolution and the four upstream adapters.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use pulse_core::{DateRange, MetricFact, Platform};
use pulse_storage::{FetchError, HttpFetcher};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod credentials;
mod ga4;
mod google_ads;
mod meta;
mod naver;

pub use ga4::Ga4Adapter;
pub use google_ads::GoogleAdsAdapter;
pub use meta::MetaAdapter;
pub use naver::NaverAdapter;

pub const CRATE_NAME: &str = "pulse-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    /// Missing or malformed secret material; raised before any network call.
    #[error("credential error: {0}")]
    Credential(String),
    /// Non-success response or unparseable payload. `message` is the
    /// upstream's own text wherever it supplied one.
    #[error("{message}")]
    Upstream { status: Option<u16>, message: String },
    #[error("transport error: {0}")]
    Transport(String),
}

impl AdapterError {
    pub(crate) fn payload(message: impl Into<String>) -> Self {
        Self::Upstream {
            status: None,
            message: message.into(),
        }
    }
}

impl From<FetchError> for AdapterError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Request(err) => Self::Transport(err.to_string()),
            FetchError::Closed => Self::Transport(FetchError::Closed.to_string()),
            FetchError::HttpStatus { status, body, .. } => Self::Upstream {
                status: Some(status),
                message: upstream_message(&body).unwrap_or_else(|| format!("HTTP {status}")),
            },
            FetchError::Decode { path, message } => {
                Self::payload(format!("unparseable response from {path}: {message}"))
            }
        }
    }
}

/// Pull the human-readable message out of an upstream error body.
pub fn upstream_message(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    let Ok(value) = serde_json::from_str::<JsonValue>(trimmed) else {
        return Some(trimmed.to_string());
    };
    // Streaming RPCs wrap the error object in a one-element array.
    let value = match &value {
        JsonValue::Array(items) => items.first().unwrap_or(&value),
        _ => &value,
    };
    [
        "/error/message",
        "/error_description",
        "/message",
        "/detail",
        "/title",
        "/error",
    ]
    .iter()
    .find_map(|pointer| value.pointer(pointer).and_then(JsonValue::as_str))
    .map(str::to_string)
    .or_else(|| Some(trimmed.to_string()))
}

/// One capability, one implementation per platform.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    /// Fetch the inclusive `range` and fan each upstream row out into one
    /// fact per metric. Any failure aborts the whole fetch.
    async fn fetch_metrics(
        &self,
        credentials: &JsonValue,
        range: DateRange,
    ) -> Result<Vec<MetricFact>, AdapterError>;
}

/// Upstream endpoints, overridable so adapters can be pointed at a mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterEndpoints {
    pub naver_base_url: String,
    pub meta_base_url: String,
    pub meta_api_version: String,
    pub google_ads_base_url: String,
    pub google_ads_api_version: String,
    pub ga4_base_url: String,
    pub oauth_token_url: String,
}

impl Default for AdapterEndpoints {
    fn default() -> Self {
        Self {
            naver_base_url: "https://api.searchad.naver.com".to_string(),
            meta_base_url: "https://graph.facebook.com".to_string(),
            meta_api_version: "v19.0".to_string(),
            google_ads_base_url: "https://googleads.googleapis.com".to_string(),
            google_ads_api_version: "v17".to_string(),
            ga4_base_url: "https://analyticsdata.googleapis.com".to_string(),
            oauth_token_url: "https://oauth2.googleapis.com/token".to_string(),
        }
    }
}

impl AdapterEndpoints {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let var = |name: &str, default: String| std::env::var(name).unwrap_or(default);
        Self {
            naver_base_url: var("PULSE_NAVER_BASE_URL", defaults.naver_base_url),
            meta_base_url: var("PULSE_META_BASE_URL", defaults.meta_base_url),
            meta_api_version: var("PULSE_META_API_VERSION", defaults.meta_api_version),
            google_ads_base_url: var("PULSE_GOOGLE_ADS_BASE_URL", defaults.google_ads_base_url),
            google_ads_api_version: var(
                "PULSE_GOOGLE_ADS_API_VERSION",
                defaults.google_ads_api_version,
            ),
            ga4_base_url: var("PULSE_GA4_BASE_URL", defaults.ga4_base_url),
            oauth_token_url: var("PULSE_OAUTH_TOKEN_URL", defaults.oauth_token_url),
        }
    }

    /// Every platform served from one base URL; the token endpoint is `{base}/token`.
    pub fn single_host(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/').to_string();
        Self {
            naver_base_url: base.clone(),
            meta_base_url: base.clone(),
            google_ads_base_url: base.clone(),
            ga4_base_url: base.clone(),
            oauth_token_url: format!("{base}/token"),
            ..Self::default()
        }
    }
}

pub fn adapter_for_platform(
    platform: Platform,
    http: Arc<HttpFetcher>,
    endpoints: &AdapterEndpoints,
) -> Arc<dyn PlatformAdapter> {
    match platform {
        Platform::Naver => Arc::new(NaverAdapter::new(http, endpoints)),
        Platform::Meta => Arc::new(MetaAdapter::new(http, endpoints)),
        Platform::GoogleAds => Arc::new(GoogleAdsAdapter::new(http, endpoints)),
        Platform::Ga4 => Arc::new(Ga4Adapter::new(http, endpoints)),
    }
}

/// Platform → adapter lookup table consulted by the orchestrator.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Platform, Arc<dyn PlatformAdapter>>,
}

impl AdapterRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn standard(http: Arc<HttpFetcher>, endpoints: &AdapterEndpoints) -> Self {
        let mut registry = Self::empty();
        for platform in Platform::ALL {
            registry.register(adapter_for_platform(platform, http.clone(), endpoints));
        }
        registry
    }

    /// Register (or replace) the adapter for `adapter.platform()`.
    pub fn register(&mut self, adapter: Arc<dyn PlatformAdapter>) {
        self.adapters.insert(adapter.platform(), adapter);
    }

    pub fn get(&self, platform: Platform) -> Option<Arc<dyn PlatformAdapter>> {
        self.adapters.get(&platform).cloned()
    }

    pub fn platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<_> = self.adapters.keys().copied().collect();
        platforms.sort();
        platforms
    }
}

/// Accepts `YYYY-MM-DD` and the compact `YYYYMMDD` form.
pub fn parse_upstream_date(raw: &str) -> Result<NaiveDate, AdapterError> {
    let raw = raw.trim();
    let parsed = if raw.len() == 8 && raw.bytes().all(|b| b.is_ascii_digit()) {
        NaiveDate::parse_from_str(raw, "%Y%m%d")
    } else {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d")
    };
    parsed.map_err(|_| AdapterError::payload(format!("unparseable upstream date `{raw}`")))
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut current = value;
    for key in path {
        current = current.get(*key)?;
    }
    Some(current)
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_at(value, path).and_then(JsonValue::as_str)
}

/// Numbers arrive as JSON numbers or numeric strings (int64 fields are
/// strings on most Google and Meta APIs). Absent or unparseable is 0.
fn json_number(value: &JsonValue, path: &[&str]) -> f64 {
    match json_at(value, path) {
        Some(JsonValue::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(JsonValue::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .unwrap_or(0.0),
        _ => 0.0,
    }
}

fn rows_at<'a>(body: &'a JsonValue, key: &str) -> Result<&'a [JsonValue], AdapterError> {
    match body.get(key) {
        Some(JsonValue::Array(rows)) => Ok(rows),
        // Upstreams omit empty result arrays entirely.
        None | Some(JsonValue::Null) => Ok(&[]),
        Some(_) => Err(AdapterError::payload(format!(
            "response field `{key}` is not an array"
        ))),
    }
}
