//! HTTP execution of test cases.

use crate::config::EngineConfig;
use crate::expression::{self, CelScriptEvaluator, ScriptEvaluator};
use crate::model::{StepId, StepResult, StepStatus, TestCase};
use crate::resolver::expand_variables;
use crate::scope::Variables;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

/// Runs one effective test case.
///
/// Implementations may change `vars` (e.g. from a setup script); the
/// caller writes those changes back into the current scope.
#[async_trait]
pub trait CaseExecutor: Send + Sync {
    async fn execute_case(
        &self,
        case: &TestCase,
        vars: &mut Variables,
        history: &HashMap<StepId, StepResult>,
    ) -> Result<StepResult>;
}

/// Sends the case over HTTP with reqwest and checks the response with
/// the case's assertion script.
pub struct HttpCaseExecutor {
    client: Client,
    base_url: Option<String>,
    headers: HashMap<String, String>,
    timeout: Duration,
    evaluator: Arc<dyn ScriptEvaluator>,
}

impl Default for HttpCaseExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpCaseExecutor {
    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            base_url: None,
            headers: HashMap::new(),
            timeout: Duration::from_secs(30),
            evaluator: Arc::new(CelScriptEvaluator),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        let mut executor = Self::new()
            .with_timeout(config.http_timeout())
            .with_headers(config.headers.clone());
        executor.base_url = config.base_url.clone();
        executor
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn ScriptEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    fn build_url(&self, raw: &str) -> Result<String> {
        if raw.contains("://") {
            return Ok(raw.to_string());
        }
        let Some(base_url) = &self.base_url else {
            return Ok(raw.to_string());
        };
        let base = reqwest::Url::parse(base_url)
            .context(format!("Invalid base_url: {base_url}"))?;
        if raw.is_empty() {
            return Ok(base.to_string());
        }
        let joined = base.join(raw.trim_start_matches('/')).context(format!(
            "Failed to join base_url '{base_url}' with path '{raw}'"
        ))?;
        Ok(joined.to_string())
    }

    #[instrument(skip(self, case, vars, result), fields(case = %case.name, method = %case.method))]
    async fn send(
        &self,
        case: &TestCase,
        vars: &Variables,
        result: &mut StepResult,
    ) -> Result<()> {
        let url = self.build_url(&expand_variables(&case.url, vars))?;
        let method = Method::from_bytes(case.method.trim().to_uppercase().as_bytes())
            .context(format!("Invalid HTTP method: {}", case.method))?;

        let mut headers = case.headers.clone();
        for (key, value) in &self.headers {
            if !headers.keys().any(|k| k.eq_ignore_ascii_case(key)) {
                headers.insert(key.clone(), value.clone());
            }
        }

        let mut req_builder = self
            .client
            .request(method.clone(), &url)
            .timeout(self.timeout);
        for (name, value) in &headers {
            req_builder = req_builder.header(name, expand_variables(value, vars));
        }

        let body = case
            .body
            .as_deref()
            .map(|b| expand_variables(b, vars))
            .filter(|b| !b.trim().is_empty());
        if let Some(body) = &body {
            let has_content_type = headers
                .keys()
                .any(|k| k.eq_ignore_ascii_case("content-type"));
            if !has_content_type && serde_json::from_str::<Value>(body).is_ok() {
                req_builder = req_builder.header("Content-Type", "application/json");
            }
            req_builder = req_builder.body(body.clone());
        }

        result.request_url = Some(url.clone());
        result.request_method = Some(method.as_str().to_string());
        result.request_body = body;

        debug!("Sending request to {}", url);
        let response = req_builder.send().await.context("Failed to send request")?;
        let status = response.status();
        debug!("Received response with status: {}", status);

        result.http_status_code = Some(status.as_u16());
        result.response_headers = response
            .headers()
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_str().unwrap_or("").to_string()))
            .collect();
        let text = response.text().await.context("Failed to read response body")?;
        result.response_body = Some(text);
        Ok(())
    }

    /// Judge the response. Without an assertion script any 2xx/3xx
    /// status passes.
    fn assert_response(&self, case: &TestCase, vars: &mut Variables, result: &mut StepResult) {
        let status = result.http_status_code.unwrap_or_default();
        let script = case
            .assertion_script
            .as_deref()
            .filter(|s| !s.trim().is_empty());

        let Some(script) = script else {
            if (200..400).contains(&status) {
                result.status = StepStatus::Pass;
                result.message = Some(format!("HTTP {status}"));
            } else {
                result.status = StepStatus::Fail;
                result.message = Some(format!("Unexpected status {status}"));
            }
            return;
        };

        let body = result.response_body.as_deref().unwrap_or_default();
        let response = json!({
            "status": status,
            "headers": result.response_headers,
            "body": serde_json::from_str::<Value>(body)
                .unwrap_or_else(|_| Value::String(body.to_string())),
        });
        let mut scope = vars.clone();
        scope.insert("response".to_string(), response);

        match expression::check_assertions(script, &mut scope) {
            Ok(None) => {
                result.status = StepStatus::Pass;
                result.message = Some("Assertions passed".to_string());
            }
            Ok(Some(statement)) => {
                result.status = StepStatus::Fail;
                result.message = Some("Assertion failed".to_string());
                result.detail = Some(format!("Assertion failed: {statement}"));
            }
            Err(e) => {
                result.status = StepStatus::Fail;
                result.message = Some("Assertion script error".to_string());
                result.detail = Some(format!("Assertion script error: {e:#}"));
            }
        }

        scope.remove("response");
        for (key, value) in scope {
            if vars.get(&key) != Some(&value) {
                vars.insert(key, value);
            }
        }
    }
}

#[async_trait]
impl CaseExecutor for HttpCaseExecutor {
    async fn execute_case(
        &self,
        case: &TestCase,
        vars: &mut Variables,
        _history: &HashMap<StepId, StepResult>,
    ) -> Result<StepResult> {
        let start = Instant::now();
        let mut result = StepResult::new(case.id, case.name.clone(), StepStatus::Fail);

        if let Some(setup) = case.setup_script.as_deref().filter(|s| !s.trim().is_empty()) {
            if let Err(e) = self.evaluator.eval(setup, vars) {
                result.message = Some("Setup script error".to_string());
                result.detail = Some(format!("Setup script error: {e:#}"));
                result.duration_ms = start.elapsed().as_millis() as u64;
                return Ok(result);
            }
        }

        match self.send(case, vars, &mut result).await {
            Ok(()) => self.assert_response(case, vars, &mut result),
            Err(e) => {
                result.status = StepStatus::Fail;
                result.message = Some("Request failed".to_string());
                result.detail = Some(format!("{e:#}"));
            }
        }

        result.duration_ms = start.elapsed().as_millis() as u64;
        Ok(result)
    }
}
