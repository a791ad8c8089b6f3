use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            global_concurrency: 8,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {path}")]
    HttpStatus {
        status: u16,
        path: String,
        body: String,
    },
    #[error("unparseable response from {path}: {message}")]
    Decode { path: String, message: String },
    #[error("http fetcher is shut down")]
    Closed,
}

/// Shared upstream client. Calls against the same `account_key` are
/// serialized; calls against different accounts share a global cap.
/// Requests are sent exactly once; there is no retry.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_account: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_account: Mutex::new(HashMap::new()),
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    async fn account_semaphore(&self, account_key: &str) -> Arc<Semaphore> {
        let mut map = self.per_account.lock().await;
        map.entry(account_key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    /// Send `request` and decode a JSON body. Non-2xx responses keep the raw
    /// body so callers can surface the upstream's own message.
    pub async fn send_json(
        &self,
        account_key: &str,
        request: RequestBuilder,
    ) -> Result<JsonValue, FetchError> {
        // Account first, so callers queued behind one account don't sit on global permits.
        let per_account = self.account_semaphore(account_key).await;
        let _account = per_account.acquire().await.map_err(|_| FetchError::Closed)?;
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;

        let request = request.build()?;
        let method = request.method().clone();
        // Paths only: query strings may carry tokens.
        let path = request.url().path().to_string();
        let span = info_span!("upstream_call", account_key, %method, path = %path);

        async move {
            let resp = self.client.execute(request).await?;
            let status = resp.status();
            let body = resp.text().await?;
            debug!(status = status.as_u16(), bytes = body.len(), "upstream responded");

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    path,
                    body,
                });
            }
            decode_body(status, &path, &body)
        }
        .instrument(span)
        .await
    }
}

fn decode_body(status: StatusCode, path: &str, body: &str) -> Result<JsonValue, FetchError> {
    if body.trim().is_empty() {
        return Err(FetchError::Decode {
            path: path.to_string(),
            message: format!("empty body with status {}", status.as_u16()),
        });
    }
    serde_json::from_str(body).map_err(|err| FetchError::Decode {
        path: path.to_string(),
        message: err.to_string(),
    })
}
