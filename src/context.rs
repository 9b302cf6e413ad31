//! Run-scoped mutable state threaded through step execution.

use crate::model::{RecordId, ScenarioId, StepId, StepResult};
use crate::scope::ScopeStack;
use std::collections::HashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// State of one top-level run.
///
/// Nested SCENARIO steps receive the same context through `&mut`, so
/// scopes, history and the cycle guard are shared with the caller for
/// the duration of the nested run and handed back when it returns.
#[derive(Debug)]
pub struct ExecutionContext {
    pub scopes: ScopeStack,
    step_names: HashMap<String, StepId>,
    step_ids: HashMap<StepId, String>,
    history: HashMap<StepId, StepResult>,
    executing: Vec<ScenarioId>,
    env_key: String,
    record_id: Option<RecordId>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new("")
    }
}

impl ExecutionContext {
    pub fn new(env_key: impl Into<String>) -> Self {
        Self {
            scopes: ScopeStack::new(),
            step_names: HashMap::new(),
            step_ids: HashMap::new(),
            history: HashMap::new(),
            executing: Vec::new(),
            env_key: env_key.into(),
            record_id: None,
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn env_key(&self) -> &str {
        &self.env_key
    }

    pub fn set_env_key(&mut self, env_key: impl Into<String>) {
        self.env_key = env_key.into();
    }

    pub fn record_id(&self) -> Option<RecordId> {
        self.record_id
    }

    pub fn set_record_id(&mut self, record_id: Option<RecordId>) {
        self.record_id = record_id;
    }

    // ── Step index ──────────────────────────────────────────────

    /// Make `name` resolvable through `{{name.…}}`. A later step with
    /// the same name takes over the name.
    pub fn register_step(&mut self, step_id: StepId, name: &str) {
        if name.is_empty() {
            return;
        }
        if let Some(previous) = self.step_names.insert(name.to_string(), step_id) {
            if previous != step_id {
                self.step_ids.remove(&previous);
            }
        }
        if let Some(old_name) = self.step_ids.insert(step_id, name.to_string()) {
            if old_name != name && self.step_names.get(&old_name) == Some(&step_id) {
                self.step_names.remove(&old_name);
            }
        }
    }

    pub fn step_id_for(&self, name: &str) -> Option<StepId> {
        self.step_names.get(name).copied()
    }

    pub fn step_name_for(&self, step_id: StepId) -> Option<&str> {
        self.step_ids.get(&step_id).map(String::as_str)
    }

    // ── Result history ──────────────────────────────────────────

    pub fn record_result(&mut self, step_id: StepId, result: StepResult) {
        self.history.insert(step_id, result);
    }

    pub fn result_for(&self, step_id: StepId) -> Option<&StepResult> {
        self.history.get(&step_id)
    }

    pub fn result_by_name(&self, name: &str) -> Option<&StepResult> {
        self.step_id_for(name).and_then(|id| self.result_for(id))
    }

    pub fn history(&self) -> &HashMap<StepId, StepResult> {
        &self.history
    }

    // ── Cycle guard ─────────────────────────────────────────────

    pub fn is_executing(&self, scenario_id: ScenarioId) -> bool {
        self.executing.contains(&scenario_id)
    }

    /// Returns `false` when the scenario is already on the call stack.
    pub fn enter_scenario(&mut self, scenario_id: ScenarioId) -> bool {
        if self.is_executing(scenario_id) {
            return false;
        }
        self.executing.push(scenario_id);
        true
    }

    pub fn exit_scenario(&mut self, scenario_id: ScenarioId) {
        if let Some(pos) = self.executing.iter().rposition(|id| *id == scenario_id) {
            self.executing.remove(pos);
        }
    }

    /// Number of scenarios currently on the call stack.
    pub fn nesting_depth(&self) -> usize {
        self.executing.len()
    }

    pub fn executing_scenarios(&self) -> &[ScenarioId] {
        &self.executing
    }

    // ── Cancellation ────────────────────────────────────────────

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
            || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Completes once the run is cancelled or its deadline passes.
    pub async fn cancelled(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
    }
}
