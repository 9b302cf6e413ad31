//! Inline assertions configured on CASE steps.

use crate::jsonpath;
use crate::model::{AssertionOperator, AssertionSource, StepResult, StepStatus, VisualAssertion};
use crate::scope::value_to_text;
use serde_json::Value;
use std::fmt;

const PROPERTY_NOT_FOUND: &str = "PROPERTY_NOT_FOUND";

/// Value an assertion reads from a step result.
#[derive(Debug, Clone, PartialEq)]
pub enum Actual {
    /// Nothing to read (no body, no such header, JSON null).
    Missing,
    /// The JSON path did not match.
    NotFound,
    Text(String),
}

impl Actual {
    fn text(&self) -> &str {
        match self {
            Actual::Missing => "null",
            Actual::NotFound => PROPERTY_NOT_FOUND,
            Actual::Text(s) => s,
        }
    }

    fn exists(&self) -> bool {
        matches!(self, Actual::Text(_))
    }
}

impl fmt::Display for Actual {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text())
    }
}

pub fn read_actual(result: &StepResult, source: AssertionSource, property: &str) -> Actual {
    match source {
        AssertionSource::StatusCode => result
            .http_status_code
            .map(|code| Actual::Text(code.to_string()))
            .unwrap_or(Actual::Missing),
        AssertionSource::ResponseHeader => result
            .header(property)
            .map(|v| Actual::Text(v.to_string()))
            .unwrap_or(Actual::Missing),
        AssertionSource::JsonBody => {
            let Some(body) = result.response_body.as_deref() else {
                return Actual::Missing;
            };
            match jsonpath::select_str(body, property) {
                Ok(Value::Null) => Actual::Missing,
                Ok(value) => Actual::Text(value_to_text(&value)),
                Err(_) => Actual::NotFound,
            }
        }
    }
}

pub fn compare(actual: &Actual, expected: &str, operator: AssertionOperator) -> bool {
    let text = actual.text();
    match operator {
        AssertionOperator::Equals => text == expected,
        AssertionOperator::NotEquals => text != expected,
        AssertionOperator::Contains => text.contains(expected),
        AssertionOperator::NotContains => !text.contains(expected),
        AssertionOperator::Exists => actual.exists(),
        AssertionOperator::NotExists => !actual.exists(),
        AssertionOperator::GreaterThan => numeric(text, expected).is_some_and(|(a, e)| a > e),
        AssertionOperator::LessThan => numeric(text, expected).is_some_and(|(a, e)| a < e),
        AssertionOperator::Unknown => false,
    }
}

fn numeric(actual: &str, expected: &str) -> Option<(f64, f64)> {
    let a = actual.trim().parse::<f64>().ok()?;
    let e = expected.trim().parse::<f64>().ok()?;
    Some((a, e))
}

/// Evaluate `assertions` against `result`. Any failure turns the result
/// into a FAIL and appends one line per failed rule to its detail.
///
/// `resolve` expands references in each expected value.
pub fn apply_visual_assertions<F>(result: &mut StepResult, assertions: &[VisualAssertion], resolve: F)
where
    F: Fn(&str) -> String,
{
    let mut failures = String::new();
    for rule in assertions {
        let expected = resolve(&rule.expected_text());
        let actual = read_actual(result, rule.source, &rule.property);
        if !compare(&actual, &expected, rule.operator) {
            failures.push_str(&format!(
                "- [{}] {} {} {} (Actual: {})\n",
                rule.source, rule.property, rule.operator, expected, actual
            ));
        }
    }

    if failures.is_empty() {
        return;
    }
    result.status = StepStatus::Fail;
    let detail = match result.detail.take() {
        Some(existing) => format!("{existing}\nVisual Assertion Failures:\n{failures}"),
        None => format!("Visual Assertion Failures:\n{failures}"),
    };
    result.detail = Some(detail);
}
