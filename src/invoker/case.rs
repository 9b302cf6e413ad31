use super::{Invocation, StepInvoker};
use crate::assertion::apply_visual_assertions;
use crate::context::ExecutionContext;
use crate::jsonpath;
use crate::model::{
    DataOverrides, ExtractKind, ExtractRule, StepKind, StepNode, StepResult, StepStatus, TestCase,
};
use crate::resolver;
use crate::scope::{value_to_text, Variables};
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Runs a referenced [`TestCase`] through the engine's case executor.
///
/// The step's `dataOverrides` are applied on top of the case, every
/// text field is resolved against the run, and after execution the
/// inline visual assertions and `extract` rules are applied.
pub struct CaseInvoker;

#[async_trait]
impl StepInvoker for CaseInvoker {
    fn kind(&self) -> StepKind {
        StepKind::Case
    }

    async fn execute(
        &self,
        step: &StepNode,
        inv: Invocation<'_>,
        ctx: &mut ExecutionContext,
        results: &mut Vec<StepResult>,
    ) {
        let Some(case_id) = step.reference_case_id else {
            warn!("Case step {} has no reference case ID", step.id);
            let name = step.name_or("Case").to_string();
            let result = StepResult::fail(step.id, name, "No referenced test case configured");
            inv.record(step, ctx, results, result);
            return;
        };

        let case = match inv.engine.cases().find_case(case_id).await {
            Ok(Some(case)) => case,
            Ok(None) => {
                error!("Case not found: {}", case_id);
                let name = step.name_or("Case").to_string();
                let result = StepResult::fail(step.id, name, format!("Test case not found: {case_id}"));
                inv.record(step, ctx, results, result);
                return;
            }
            Err(e) => {
                error!("Failed to load case {}: {:#}", case_id, e);
                let name = step.name_or("Case").to_string();
                let result = StepResult::fail(step.id, name, format!("Execution Error: {e:#}"));
                inv.record(step, ctx, results, result);
                return;
            }
        };

        let name = step.name_or(&case.name).to_string();
        info!(">>> Start Executing Case Step: {}", name);
        ctx.register_step(step.id, &name);

        let overrides = step.overrides();
        let mut step_vars = ctx.scopes.flatten();
        let effective = apply_overrides(&case, &overrides, &mut step_vars);
        for (key, value) in &step_vars {
            if !ctx.scopes.contains(key) {
                ctx.scopes.set_local(key.clone(), value.clone());
            }
        }
        let effective = resolve_case(effective, ctx);
        let before = step_vars.clone();

        let start = Instant::now();
        let executor = inv.engine.executor();
        let outcome = tokio::select! {
            outcome = executor.execute_case(&effective, &mut step_vars, ctx.history()) => Some(outcome),
            _ = ctx.cancelled() => None,
        };

        let mut result = match outcome {
            Some(Ok(result)) => result,
            Some(Err(e)) => {
                error!("Exception executing case step: {:#}", e);
                let mut result = StepResult::fail(step.id, &name, format!("Execution Error: {e:#}"));
                result.duration_ms = start.elapsed().as_millis() as u64;
                result
            }
            None => StepResult::skipped(step.id, &name, "Cancelled"),
        };
        result.step_id = step.id;
        result.name = name;

        if result.status != StepStatus::Skipped {
            apply_visual_assertions(&mut result, &overrides.visual_assertions, |text| {
                resolver::resolve(text, ctx)
            });
        }

        info!("<<< Finished Case Step. Status: {}", result.status);
        if result.is_fail() {
            error!(
                "    Error: {}",
                result
                    .detail
                    .as_deref()
                    .or(result.message.as_deref())
                    .unwrap_or_default()
            );
        }

        inv.record(step, ctx, results, result.clone());

        // Export what the executor changed before extraction runs.
        for (key, value) in step_vars {
            if before.get(&key) != Some(&value) || !ctx.scopes.contains(&key) {
                ctx.scopes.set_local(key, value);
            }
        }

        for rule in &overrides.extract {
            match extract(rule, &result) {
                Ok(Some(value)) => {
                    info!(
                        "  Extracted variable [{:?}]: {} = {}",
                        rule.kind,
                        rule.var_name,
                        value_to_text(&value)
                    );
                    ctx.scopes.set_local(rule.var_name.clone(), value);
                }
                Ok(None) => debug!("  Nothing extracted for {}", rule.var_name),
                Err(e) => warn!("  Failed to extract {} ({:?}): {}", rule.var_name, rule.kind, e),
            }
        }
    }
}

/// Effective case after `dataOverrides`. `params` land in `vars`.
fn apply_overrides(case: &TestCase, overrides: &DataOverrides, vars: &mut Variables) -> TestCase {
    let mut effective = case.clone();

    if let Some(url) = &overrides.url {
        effective.url = url.clone();
    }
    if let Some(method) = &overrides.method {
        effective.method = method.clone();
    }
    match &overrides.headers {
        Some(Value::Object(map)) => {
            for (key, value) in map {
                effective.headers.insert(key.clone(), value_to_text(value));
            }
        }
        Some(Value::String(text)) => {
            match serde_json::from_str::<HashMap<String, Value>>(text) {
                Ok(headers) => {
                    effective.headers = headers
                        .into_iter()
                        .map(|(key, value)| (key, value_to_text(&value)))
                        .collect();
                }
                Err(e) => warn!("Failed to parse header overrides: {}", e),
            }
        }
        Some(Value::Null) | None => {}
        Some(other) => warn!("Ignoring header overrides of unexpected shape: {}", other),
    }
    match &overrides.body {
        Some(Value::Null) | None => {}
        Some(Value::String(body)) => effective.body = Some(body.clone()),
        Some(body) => effective.body = Some(body.to_string()),
    }
    if let Some(params) = &overrides.params {
        for (key, value) in params {
            vars.insert(key.clone(), value.clone());
        }
    }
    if let Some(script) = &overrides.setup_script {
        effective.setup_script = Some(script.clone());
    }
    if let Some(script) = &overrides.assertion_script {
        effective.assertion_script = Some(script.clone());
    }

    effective
}

/// Resolve `{{Step.path}}` references against the run. `${name}`
/// references are left for the executor, which expands them after the
/// setup script has run.
fn resolve_case(mut case: TestCase, ctx: &ExecutionContext) -> TestCase {
    let resolve = |text: &str| resolver::resolve_step_refs(text, ctx);
    case.url = resolve(&case.url);
    case.headers = case
        .headers
        .iter()
        .map(|(key, value)| (key.clone(), resolve(value)))
        .collect();
    case.body = case.body.as_deref().map(resolve);
    case
}

fn extract(rule: &ExtractRule, result: &StepResult) -> anyhow::Result<Option<Value>> {
    let expression = rule.expression();
    match rule.kind {
        ExtractKind::Json => {
            let Some(body) = result.response_body.as_deref() else {
                return Ok(None);
            };
            match jsonpath::select_str(body, expression) {
                Ok(Value::Null) | Err(jsonpath::JsonPathError::NotFound(_)) => Ok(None),
                Ok(value) => Ok(Some(value)),
                Err(e) => Err(e.into()),
            }
        }
        ExtractKind::Regex => {
            let Some(body) = result.response_body.as_deref() else {
                return Ok(None);
            };
            let pattern = Regex::new(expression)?;
            Ok(pattern
                .captures(body)
                .and_then(|caps| caps.get(rule.group.unwrap_or(0)))
                .map(|m| Value::String(m.as_str().to_string())))
        }
        ExtractKind::Header => Ok(result
            .header(expression)
            .map(|value| Value::String(value.to_string()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn login_case() -> TestCase {
        TestCase {
            id: 10,
            module_id: None,
            name: "Login".into(),
            method: "POST".into(),
            url: "/login".into(),
            headers: HashMap::from([("Accept".to_string(), "application/json".to_string())]),
            body: Some(r#"{"user":"${user}"}"#.into()),
            setup_script: None,
            assertion_script: None,
        }
    }

    fn overrides(value: Value) -> DataOverrides {
        serde_json::from_value(value).unwrap()
    }

    fn response(body: &str) -> StepResult {
        let mut r = StepResult::pass(1, "Login", "ok");
        r.response_body = Some(body.into());
        r.response_headers.insert("X-Trace".into(), "abc".into());
        r
    }

    #[test]
    fn test_overrides_replace_and_merge() {
        let mut vars = Variables::new();
        let effective = apply_overrides(
            &login_case(),
            &overrides(json!({
                "url": "/v2/login",
                "method": "PUT",
                "headers": {"X-Tenant": "t1", "Retry": 2},
                "body": {"user": "admin"},
                "params": {"user": "carol"},
                "assertionScript": "response.status == 200"
            })),
            &mut vars,
        );
        assert_eq!(effective.url, "/v2/login");
        assert_eq!(effective.method, "PUT");
        assert_eq!(effective.headers["Accept"], "application/json");
        assert_eq!(effective.headers["X-Tenant"], "t1");
        assert_eq!(effective.headers["Retry"], "2");
        assert_eq!(effective.body.as_deref(), Some(r#"{"user":"admin"}"#));
        assert_eq!(effective.assertion_script.as_deref(), Some("response.status == 200"));
        assert_eq!(vars["user"], json!("carol"));
    }

    #[test]
    fn test_header_string_replaces_all_headers() {
        let mut vars = Variables::new();
        let effective = apply_overrides(
            &login_case(),
            &overrides(json!({"headers": "{\"Authorization\":\"Bearer x\"}"})),
            &mut vars,
        );
        assert_eq!(effective.headers.len(), 1);
        assert_eq!(effective.headers["Authorization"], "Bearer x");
    }

    #[test]
    fn test_resolve_case_only_fills_step_references() {
        let mut ctx = ExecutionContext::new("dev");
        ctx.scopes.set_local("user", json!("alice"));
        ctx.register_step(3, "Auth");
        let mut auth = StepResult::pass(3, "Auth", "ok");
        auth.response_body = Some(r#"{"token":"t-9"}"#.into());
        ctx.record_result(3, auth);

        let mut case = login_case();
        case.headers
            .insert("Authorization".into(), "Bearer {{Auth.response.body.token}}".into());
        let resolved = resolve_case(case, &ctx);
        assert_eq!(resolved.headers["Authorization"], "Bearer t-9");
        assert_eq!(resolved.body.as_deref(), Some(r#"{"user":"${user}"}"#));
    }

    #[test]
    fn test_extract_rules() {
        let result = response(r#"{"data":{"token":"t-1","items":[1,2]},"empty":null}"#);
        let rule = |value: Value| -> ExtractRule { serde_json::from_value(value).unwrap() };

        let json_rule = rule(json!({"varName": "token", "type": "JSON", "expression": "$.data.token"}));
        assert_eq!(extract(&json_rule, &result).unwrap(), Some(json!("t-1")));

        let list_rule = rule(json!({"varName": "items", "jsonPath": "$.data.items"}));
        assert_eq!(extract(&list_rule, &result).unwrap(), Some(json!([1, 2])));

        let missing = rule(json!({"varName": "x", "expression": "$.data.nope"}));
        assert_eq!(extract(&missing, &result).unwrap(), None);

        let null_rule = rule(json!({"varName": "x", "expression": "$.empty"}));
        assert_eq!(extract(&null_rule, &result).unwrap(), None);

        let regex_rule = rule(json!({"varName": "t", "type": "REGEX", "expression": "\"token\":\"([^\"]+)\"", "group": 1}));
        assert_eq!(extract(&regex_rule, &result).unwrap(), Some(json!("t-1")));

        let header_rule = rule(json!({"varName": "trace", "type": "HEADER", "expression": "x-trace"}));
        assert_eq!(extract(&header_rule, &result).unwrap(), Some(json!("abc")));

        let bad_regex = rule(json!({"varName": "t", "type": "REGEX", "expression": "("}));
        assert!(extract(&bad_regex, &result).is_err());
    }
}
