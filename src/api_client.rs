use crate::history::HistorySink;
use crate::model::{ExecutionRecord, RecordId, StepExecutionLog};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Response returned after creating an execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRecordResponse {
    pub id: RecordId,
}

/// Client for a remote execution-history API.
///
/// Records go to `POST {api}/v1/executions`, updates to
/// `PUT {api}/v1/executions/{id}` and step logs to
/// `POST {api}/v1/executions/{id}/steps`.
pub struct HistoryApiClient {
    api_url: String,
    api_key: String,
    max_retries: u32,
    http: reqwest::Client,
}

impl HistoryApiClient {
    pub fn new(api_url: String, api_key: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            api_url,
            api_key,
            max_retries: 3,
            http,
        })
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/v1/{}", self.api_url.trim_end_matches('/'), path)
    }

    /// Send `body` as JSON. Server errors and network failures are
    /// retried with exponential backoff; other statuses fail at once.
    async fn send_json<T: Serialize + ?Sized>(
        &self,
        method: Method,
        url: &str,
        body: &T,
    ) -> Result<reqwest::Response> {
        let mut attempt = 0;
        loop {
            let failure = match self
                .http
                .request(method.clone(), url)
                .bearer_auth(&self.api_key)
                .json(body)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) if resp.status().is_server_error() => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    anyhow!("{method} {url} returned {status}: {text}")
                }
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    bail!("{method} {url} rejected with {status}: {text}");
                }
                Err(e) => anyhow::Error::new(e).context(format!("{method} {url} failed")),
            };

            if attempt >= self.max_retries {
                let attempts = attempt + 1;
                return Err(failure.context(format!("giving up after {attempts} attempt(s)")));
            }
            let delay = backoff(attempt);
            warn!(
                attempt = attempt + 1,
                "history API call failed, retrying in {:?}: {:#}",
                delay,
                failure
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(500 * 2u64.pow(attempt))
}

#[async_trait]
impl HistorySink for HistoryApiClient {
    async fn create_record(&self, record: &ExecutionRecord) -> Result<RecordId> {
        let url = self.endpoint("executions");
        let resp = self.send_json(Method::POST, &url, record).await?;
        let created = resp
            .json::<CreateRecordResponse>()
            .await
            .context("failed to parse create-record response")?;
        debug!("Created remote execution record {}", created.id);
        Ok(created.id)
    }

    async fn update_record(&self, record: &ExecutionRecord) -> Result<()> {
        let id = record.id.context("Execution record has no id")?;
        let url = self.endpoint(&format!("executions/{id}"));
        self.send_json(Method::PUT, &url, record).await?;
        Ok(())
    }

    async fn append_step_log(&self, log: &StepExecutionLog) -> Result<()> {
        let url = self.endpoint(&format!("executions/{}/steps", log.record_id));
        self.send_json(Method::POST, &url, log).await?;
        Ok(())
    }
}
