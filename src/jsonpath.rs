//! Small JSONPath evaluator for extraction rules, step references and
//! body assertions.
//!
//! Supported: `$`, `.name`, `['name']`, `[n]` (negative counts from the
//! end), `[*]`, `.*` and `..name`. A path with no wildcard or recursive
//! descent is *definite* and yields a single value; anything else
//! yields an array of every match.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum JsonPathError {
    #[error("Invalid JSONPath '{path}': {reason}")]
    Syntax { path: String, reason: String },

    #[error("No results for path: {0}")]
    NotFound(String),

    #[error("Response body is not valid JSON: {0}")]
    InvalidDocument(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Child(String),
    Index(i64),
    Wildcard,
    Descendant(Box<Segment>),
}

#[derive(Debug, Clone)]
pub struct JsonPath {
    raw: String,
    segments: Vec<Segment>,
}

impl JsonPath {
    pub fn parse(path: &str) -> Result<Self, JsonPathError> {
        let raw = path.trim();
        let syntax = |reason: &str| JsonPathError::Syntax {
            path: raw.to_string(),
            reason: reason.to_string(),
        };

        let mut rest = raw.strip_prefix('$').unwrap_or(raw);
        let mut segments = Vec::new();

        // `data.token` is accepted as shorthand for `$.data.token`.
        if !raw.starts_with('$') && !rest.is_empty() && !rest.starts_with(['.', '[']) {
            let (name, tail) = split_name(rest);
            segments.push(name_segment(name));
            rest = tail;
        }

        while !rest.is_empty() {
            if let Some(tail) = rest.strip_prefix("..") {
                let (inner, tail) = if tail.starts_with('[') {
                    parse_bracket(tail).map_err(|r| syntax(&r))?
                } else {
                    let (name, tail) = split_name(tail);
                    if name.is_empty() {
                        return Err(syntax("empty name after '..'"));
                    }
                    (name_segment(name), tail)
                };
                segments.push(Segment::Descendant(Box::new(inner)));
                rest = tail;
            } else if let Some(tail) = rest.strip_prefix('.') {
                let (name, tail) = split_name(tail);
                if name.is_empty() {
                    return Err(syntax("empty name after '.'"));
                }
                segments.push(name_segment(name));
                rest = tail;
            } else if rest.starts_with('[') {
                let (segment, tail) = parse_bracket(rest).map_err(|r| syntax(&r))?;
                segments.push(segment);
                rest = tail;
            } else {
                return Err(syntax("expected '.' or '['"));
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn is_definite(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Child(_) | Segment::Index(_)))
    }

    pub fn select(&self, root: &Value) -> Result<Value, JsonPathError> {
        let mut current = vec![root];
        for segment in &self.segments {
            let mut next = Vec::new();
            for node in current {
                apply(segment, node, &mut next);
            }
            current = next;
        }

        if self.is_definite() {
            current
                .first()
                .map(|v| (*v).clone())
                .ok_or_else(|| JsonPathError::NotFound(self.raw.clone()))
        } else {
            Ok(Value::Array(current.into_iter().cloned().collect()))
        }
    }
}

/// Evaluate `path` against a parsed document.
pub fn select(root: &Value, path: &str) -> Result<Value, JsonPathError> {
    JsonPath::parse(path)?.select(root)
}

/// Evaluate `path` against raw JSON text.
pub fn select_str(document: &str, path: &str) -> Result<Value, JsonPathError> {
    let root: Value = serde_json::from_str(document)
        .map_err(|e| JsonPathError::InvalidDocument(e.to_string()))?;
    select(&root, path)
}

fn name_segment(name: &str) -> Segment {
    if name == "*" {
        Segment::Wildcard
    } else {
        Segment::Child(name.to_string())
    }
}

fn split_name(input: &str) -> (&str, &str) {
    let end = input.find(['.', '[']).unwrap_or(input.len());
    input.split_at(end)
}

fn parse_bracket(input: &str) -> Result<(Segment, &str), String> {
    let body = &input[1..];
    if body.starts_with(['\'', '"']) {
        let quote = &body[..1];
        let end = body[1..]
            .find(quote)
            .ok_or_else(|| "unterminated quoted name".to_string())?;
        if !body[end + 2..].starts_with(']') {
            return Err("expected ']' after quoted name".to_string());
        }
        let name = &body[1..end + 1];
        return Ok((Segment::Child(name.to_string()), &body[end + 3..]));
    }

    let close = body.find(']').ok_or_else(|| "missing ']'".to_string())?;
    let inner = body[..close].trim();
    let tail = &body[close + 1..];
    if inner == "*" {
        return Ok((Segment::Wildcard, tail));
    }
    inner
        .parse::<i64>()
        .map(|index| (Segment::Index(index), tail))
        .map_err(|_| format!("unsupported selector '[{inner}]'"))
}

fn apply<'a>(segment: &Segment, node: &'a Value, out: &mut Vec<&'a Value>) {
    match segment {
        Segment::Child(name) => {
            if let Some(v) = node.as_object().and_then(|o| o.get(name)) {
                out.push(v);
            }
        }
        Segment::Index(index) => {
            if let Some(items) = node.as_array() {
                let len = items.len() as i64;
                let pos = if *index < 0 { len + index } else { *index };
                if (0..len).contains(&pos) {
                    out.push(&items[pos as usize]);
                }
            }
        }
        Segment::Wildcard => match node {
            Value::Array(items) => out.extend(items.iter()),
            Value::Object(map) => out.extend(map.values()),
            _ => {}
        },
        Segment::Descendant(inner) => descend(inner, node, out),
    }
}

fn descend<'a>(inner: &Segment, node: &'a Value, out: &mut Vec<&'a Value>) {
    apply(inner, node, out);
    match node {
        Value::Array(items) => items.iter().for_each(|v| descend(inner, v, out)),
        Value::Object(map) => map.values().for_each(|v| descend(inner, v, out)),
        _ => {}
    }
}
