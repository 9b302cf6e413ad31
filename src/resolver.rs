//! Reference substitution.
//!
//! Two passes, always in this order:
//!
//! 1. `{{StepName.path}}` reads a recorded step result, where `path` is
//!    `response.code`, `response.headers.<Name>` or
//!    `response.body.<json.path>`.
//! 2. `${name}` reads a variable from the scope stack.
//!
//! References that cannot be resolved are left in the text untouched.

use crate::context::ExecutionContext;
use crate::jsonpath;
use crate::model::StepResult;
use crate::scope::{value_to_text, ScopeStack, Variables};
use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::LazyLock;
use tracing::debug;

static STEP_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{([^}]+)\}\}").expect("failed to compile step reference regex")
});

static VAR_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([^}]+)\}").expect("failed to compile variable regex")
});

/// Resolve both reference kinds in `text`.
pub fn resolve(text: &str, ctx: &ExecutionContext) -> String {
    let text = resolve_step_refs(text, ctx);
    resolve_vars(&text, &ctx.scopes)
}

/// Resolve every string inside a JSON value.
pub fn resolve_value(value: &Value, ctx: &ExecutionContext) -> Value {
    match value {
        Value::String(s) => Value::String(resolve(s, ctx)),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| resolve_value(v, ctx)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

pub fn resolve_step_refs(text: &str, ctx: &ExecutionContext) -> String {
    if !text.contains("{{") {
        return text.to_string();
    }
    STEP_REF_RE
        .replace_all(text, |caps: &Captures| {
            let reference = caps[1].trim();
            match lookup_step_ref(reference, ctx) {
                Some(value) => value,
                None => {
                    debug!("Unresolved step reference: {}", &caps[0]);
                    caps[0].to_string()
                }
            }
        })
        .into_owned()
}

pub fn resolve_vars(text: &str, scopes: &ScopeStack) -> String {
    expand_with(text, |name| scopes.get(name))
}

/// `${name}` substitution against a flat table.
pub fn expand_variables(text: &str, vars: &Variables) -> String {
    expand_with(text, |name| vars.get(name))
}

fn expand_with<'a, F>(text: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<&'a Value>,
{
    if !text.contains("${") {
        return text.to_string();
    }
    VAR_REF_RE
        .replace_all(text, |caps: &Captures| match lookup(caps[1].trim()) {
            Some(value) => value_to_text(value),
            None => {
                debug!("Unresolved variable: {}", &caps[0]);
                caps[0].to_string()
            }
        })
        .into_owned()
}

fn lookup_step_ref(reference: &str, ctx: &ExecutionContext) -> Option<String> {
    let (step_name, path) = reference.split_once('.')?;
    let result = ctx.result_by_name(step_name.trim())?;
    read_result_path(result, path)
}

/// Read `path` (the part after `StepName.`) from a recorded result.
pub fn read_result_path(result: &StepResult, path: &str) -> Option<String> {
    if path == "response.code" {
        return result.http_status_code.map(|code| code.to_string());
    }
    if let Some(header) = path.strip_prefix("response.headers.") {
        return Some(result.header(header).unwrap_or_default().to_string());
    }
    if path == "response.body" {
        return result.response_body.clone();
    }
    if let Some(body_path) = path.strip_prefix("response.body.") {
        let body = result.response_body.as_deref()?;
        return match jsonpath::select_str(body, &format!("$.{body_path}")) {
            Ok(value) => Some(value_to_text(&value)),
            Err(e) => {
                debug!("Step reference extraction failed: {}", e);
                None
            }
        };
    }
    None
}
