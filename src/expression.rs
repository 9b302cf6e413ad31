//! CEL-based evaluation of conditions, scripts and assertions.
//!
//! Conditions (IF steps, `while` loops) and SCRIPT steps go through the
//! [`ScriptEvaluator`] trait; [`CelScriptEvaluator`] is the stock
//! implementation. A script is a list of statements separated by
//! newlines or `;`. `name = expr` assigns into the variable table, any
//! other statement is just evaluated, and the value of the last one is
//! returned.

use crate::scope::{value_to_text, Variables};
use anyhow::{anyhow, Result};
use cel::{Context, Program};
use regex::Regex;
use serde_json::Value;
use std::sync::{Arc, LazyLock};
use tracing::debug;

static ASSIGN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^(?:let\s+|var\s+)?([A-Za-z_][A-Za-z0-9_]*)\s*=([^=].*)$")
        .expect("failed to compile assignment regex")
});

/// Evaluates conditions and scripts against a flat variable table.
pub trait ScriptEvaluator: Send + Sync {
    /// Run `script`; assignments are written back into `vars`.
    fn eval(&self, script: &str, vars: &mut Variables) -> Result<Value>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CelScriptEvaluator;

impl CelScriptEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl ScriptEvaluator for CelScriptEvaluator {
    fn eval(&self, script: &str, vars: &mut Variables) -> Result<Value> {
        let mut last = Value::Null;
        for statement in split_statements(script) {
            last = match ASSIGN_RE.captures(&statement) {
                Some(caps) => {
                    let name = caps[1].to_string();
                    let value = resolve_value(caps[2].trim(), vars)?;
                    debug!("Script assigned {} = {}", name, value);
                    vars.insert(name, value.clone());
                    value
                }
                None => resolve_value(&statement, vars)?,
            };
        }
        Ok(last)
    }
}

/// Evaluate an assertion script: every non-assignment statement must
/// be truthy. Returns the first statement that is not.
pub fn check_assertions(script: &str, vars: &mut Variables) -> Result<Option<String>> {
    for statement in split_statements(script) {
        if let Some(caps) = ASSIGN_RE.captures(&statement) {
            let value = resolve_value(caps[2].trim(), vars)?;
            vars.insert(caps[1].to_string(), value);
            continue;
        }
        if !evaluate_test(&statement, vars)? {
            return Ok(Some(statement));
        }
    }
    Ok(None)
}

/// Truthiness used for IF conditions and `while` loops: booleans as-is,
/// anything else only when it reads as `true`.
pub fn condition_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        other => value_to_text(other).eq_ignore_ascii_case("true"),
    }
}

/// Split on newlines and `;` outside string literals and brackets.
/// A line starting with a binary operator continues the previous
/// statement. Blank lines and `//` comments are dropped.
pub fn split_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut depth = 0usize;

    for ch in script.chars() {
        if let Some(q) = quote {
            current.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' => {
                quote = Some(ch);
                current.push(ch);
            }
            '(' | '[' | '{' => {
                depth += 1;
                current.push(ch);
            }
            ')' | ']' | '}' => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            '\n' if depth > 0 => current.push(' '),
            '\n' | ';' => {
                push_statement(&mut statements, &current);
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    push_statement(&mut statements, &current);
    statements
}

const CONTINUATION_PREFIXES: [&str; 5] = ["&&", "||", "?", ":", "."];

fn push_statement(statements: &mut Vec<String>, raw: &str) {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with("//") {
        return;
    }
    let continues = CONTINUATION_PREFIXES
        .iter()
        .any(|prefix| trimmed.starts_with(prefix));
    match statements.last_mut() {
        Some(previous) if continues => {
            previous.push(' ');
            previous.push_str(trimmed);
        }
        _ => statements.push(trimmed.to_string()),
    }
}

static ALIAS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(len|type)\(").expect("failed to compile alias regex"));

/// `true` when `expr` evaluates to a truthy value. Non-boolean results
/// count when non-zero or non-empty.
fn evaluate_test(expr: &str, vars: &Variables) -> Result<bool> {
    Ok(is_truthy(&execute(expr, vars)?))
}

/// Evaluate `expr` and convert the result back to JSON.
fn resolve_value(expr: &str, vars: &Variables) -> Result<Value> {
    execute(expr, vars)?
        .json()
        .map_err(|e| anyhow!("Failed to convert CEL value to JSON: {e}"))
}

fn execute(expr: &str, vars: &Variables) -> Result<cel::Value> {
    // `len(x)` and `type(x)` are accepted as aliases of `size(x)` and `type_of(x)`.
    let source = ALIAS_RE.replace_all(expr, |caps: &regex::Captures<'_>| match &caps[1] {
        "len" => "size(",
        _ => "type_of(",
    });
    debug!("Evaluating CEL expression: {source}");

    let program =
        Program::compile(&source).map_err(|e| anyhow!("CEL compile error for '{source}': {e}"))?;

    let mut context = Context::default();
    for (key, value) in vars {
        context
            .add_variable(key.as_str(), value.clone())
            .map_err(|e| anyhow!("Failed to bind variable '{key}': {e}"))?;
    }
    context.add_function("compare", |a: cel::Value, b: cel::Value| a == b);
    context.add_function("diff", describe_difference);
    context.add_function("type_of", type_name);
    context.add_function("urlencode", urlencode);

    program
        .execute(&context)
        .map_err(|e| anyhow!("CEL execution error: {e}"))
}

/// Empty when equal, otherwise what was expected and what was found.
fn describe_difference(actual: cel::Value, expected: cel::Value) -> Arc<String> {
    if actual == expected {
        return Arc::new(String::new());
    }
    Arc::new(format!("expected {expected:?}, got {actual:?}"))
}

fn type_name(value: cel::Value) -> Arc<String> {
    let name = match value {
        cel::Value::Int(_) => "int",
        cel::Value::UInt(_) => "uint",
        cel::Value::Float(_) => "double",
        cel::Value::String(_) => "string",
        cel::Value::Bool(_) => "bool",
        cel::Value::List(_) => "list",
        cel::Value::Map(_) => "map",
        cel::Value::Null => "null",
        cel::Value::Bytes(_) => "bytes",
        _ => "unknown",
    };
    Arc::new(name.to_string())
}

fn urlencode(text: Arc<String>) -> Arc<String> {
    Arc::new(url::form_urlencoded::byte_serialize(text.as_bytes()).collect())
}

fn is_truthy(value: &cel::Value) -> bool {
    match value {
        cel::Value::Bool(b) => *b,
        cel::Value::Int(i) => *i != 0,
        cel::Value::UInt(u) => *u != 0,
        cel::Value::Float(f) => *f != 0.0,
        cel::Value::String(s) => !s.is_empty(),
        cel::Value::List(items) => !items.is_empty(),
        cel::Value::Map(map) => !map.map.is_empty(),
        cel::Value::Null => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_vars(pairs: Vec<(&str, Value)>) -> Variables {
        pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    #[test]
    fn test_simple_comparison() {
        let vars = make_vars(vec![("x", json!(10))]);
        assert!(evaluate_test("x == 10", &vars).unwrap());
        assert!(evaluate_test("x > 5", &vars).unwrap());
        assert!(!evaluate_test("x < 5", &vars).unwrap());
    }

    #[test]
    fn test_nested_object_access() {
        let vars = make_vars(vec![(
            "response",
            json!({
                "status": 200,
                "body": {"name": "alice", "items": [1, 2, 3]}
            }),
        )]);
        assert!(evaluate_test("response.status == 200", &vars).unwrap());
        assert!(
            evaluate_test("response.body.name == \"alice\"", &vars).unwrap()
        );
        assert!(evaluate_test("len(response.body.items) == 3", &vars).unwrap());
    }

    #[test]
    fn test_custom_functions() {
        let vars = make_vars(vec![
            ("a", json!({"x": 1})),
            ("b", json!({"x": 1})),
            ("s", json!("hello")),
            ("q", json!("hello world&foo=bar")),
        ]);
        assert!(evaluate_test("compare(a, b)", &vars).unwrap());
        assert_eq!(resolve_value("diff(a, b)", &vars).unwrap(), json!(""));
        assert!(evaluate_test("diff(s, \"bye\") != \"\"", &vars).unwrap());
        assert!(evaluate_test("type(s) == \"string\"", &vars).unwrap());
        assert_eq!(
            resolve_value("urlencode(q)", &vars).unwrap(),
            json!("hello+world%26foo%3Dbar")
        );
    }

    #[test]
    fn test_compile_error() {
        let vars = Variables::new();
        assert!(evaluate_test("invalid %%% expr", &vars).is_err());
    }

    #[test]
    fn test_split_statements() {
        let script = "a = 1; b = \"x;y\"\n\n// note\nc = size([1,\n 2])\nc > 1\n  && b == \"x;y\"";
        assert_eq!(
            split_statements(script),
            vec![
                "a = 1",
                "b = \"x;y\"",
                "c = size([1,  2])",
                "c > 1 && b == \"x;y\"",
            ]
        );
    }

    #[test]
    fn test_script_assignments_land_in_vars() {
        let mut vars = make_vars(vec![("name", json!("bob")), ("ids", json!([1, 2]))]);
        let out = CelScriptEvaluator
            .eval("greeting = \"hi \" + name\ncount = size(ids)", &mut vars)
            .unwrap();
        assert_eq!(vars["greeting"], json!("hi bob"));
        assert_eq!(vars["count"], json!(2));
        assert_eq!(out, json!(2));
    }

    #[test]
    fn test_script_returns_last_value() {
        let mut vars = make_vars(vec![("name", json!("bob"))]);
        let out = CelScriptEvaluator
            .eval("greeting = \"hi \" + name; greeting == \"hi bob\"", &mut vars)
            .unwrap();
        assert_eq!(out, json!(true));
    }

    #[test]
    fn test_empty_script_is_null() {
        let mut vars = Variables::new();
        assert_eq!(CelScriptEvaluator.eval("  \n ", &mut vars).unwrap(), Value::Null);
    }

    #[test]
    fn test_script_error_propagates() {
        let mut vars = Variables::new();
        assert!(CelScriptEvaluator.eval("missing_var + 1", &mut vars).is_err());
    }

    #[test]
    fn test_equality_is_not_assignment() {
        let mut vars = make_vars(vec![("x", json!(1))]);
        let out = CelScriptEvaluator.eval("x == 1", &mut vars).unwrap();
        assert_eq!(out, json!(true));
        assert_eq!(vars.len(), 1);
    }

    #[test]
    fn test_condition_truthy() {
        assert!(condition_truthy(&json!(true)));
        assert!(!condition_truthy(&json!(false)));
        assert!(condition_truthy(&json!("TRUE")));
        assert!(!condition_truthy(&json!("yes")));
        assert!(!condition_truthy(&json!(1)));
        assert!(!condition_truthy(&Value::Null));
    }

    #[test]
    fn test_check_assertions_reports_first_failure() {
        let mut vars = make_vars(vec![(
            "response",
            json!({"status": 201, "body": {"id": "us_01"}}),
        )]);
        let script = "id = response.body.id\nresponse.status == 201\nid.startsWith(\"admin_\")";
        let failed = check_assertions(script, &mut vars).unwrap();
        assert_eq!(failed.as_deref(), Some("id.startsWith(\"admin_\")"));
        assert_eq!(vars["id"], json!("us_01"));

        assert_eq!(
            check_assertions("response.status >= 200 && response.status < 300", &mut vars)
                .unwrap(),
            None
        );
    }
}
