//! Stack of variable scopes.
//!
//! Index 0 is the global scope and is never popped. Lookups search from
//! the innermost scope outwards; `merge_up` exports new keys from a
//! child scope without touching keys the parent already has.

use crate::error::{EngineError, EngineResult};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

pub type Variables = HashMap<String, Value>;

#[derive(Debug, Clone)]
pub struct ScopeStack {
    scopes: Vec<Variables>,
}

impl Default for ScopeStack {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeStack {
    pub fn new() -> Self {
        Self {
            scopes: vec![Variables::new()],
        }
    }

    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    pub fn push(&mut self) {
        self.scopes.push(Variables::new());
    }

    pub fn pop(&mut self) -> EngineResult<Variables> {
        if self.scopes.len() <= 1 {
            return Err(EngineError::InvalidScopeOperation(
                "cannot pop the global scope",
            ));
        }
        Ok(self.scopes.pop().unwrap_or_default())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn set_local(&mut self, name: impl Into<String>, value: Value) {
        if let Some(top) = self.scopes.last_mut() {
            top.insert(name.into(), value);
        }
    }

    pub fn set_global(&mut self, name: impl Into<String>, value: Value) {
        self.scopes[0].insert(name.into(), value);
    }

    /// Copy keys of the top scope into its parent when the parent does
    /// not have them yet. With `preserve`, only those keys are
    /// considered. A no-op at depth 1.
    pub fn merge_up(&mut self, preserve: Option<&HashSet<String>>) {
        let depth = self.scopes.len();
        if depth < 2 {
            return;
        }
        let (lower, upper) = self.scopes.split_at_mut(depth - 1);
        let parent = &mut lower[depth - 2];
        for (key, value) in &upper[0] {
            if preserve.is_some_and(|keys| !keys.contains(key)) {
                continue;
            }
            if !parent.contains_key(key) {
                parent.insert(key.clone(), value.clone());
            }
        }
    }

    /// All scopes merged into one table, inner scopes winning.
    pub fn flatten(&self) -> Variables {
        let mut flat = Variables::new();
        for scope in &self.scopes {
            for (key, value) in scope {
                flat.insert(key.clone(), value.clone());
            }
        }
        flat
    }

    pub fn current(&self) -> &Variables {
        &self.scopes[self.scopes.len() - 1]
    }

    pub fn global(&self) -> &Variables {
        &self.scopes[0]
    }
}

/// String form used when a variable is spliced into text: strings
/// verbatim, everything else as JSON.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
