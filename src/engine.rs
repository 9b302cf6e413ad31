//! Scenario execution engine.
//!
//! [`ScenarioEngine`] loads a scenario's step tree and walks it
//! depth-first, handing each step to the invoker registered for its
//! kind. A top-level run owns a fresh [`ExecutionContext`]; SCENARIO
//! steps lend that same context to the nested run through
//! [`ScenarioEngine::execute_nested`].

use crate::config::EngineConfig;
use crate::context::ExecutionContext;
use crate::error::{EngineError, EngineResult};
use crate::events::{EventType, ExecutionEvent, ProgressObserver};
use crate::expression::{CelScriptEvaluator, ScriptEvaluator};
use crate::history::HistorySink;
use crate::http::{CaseExecutor, HttpCaseExecutor};
use crate::invoker::{Invocation, InvokerRegistry};
use crate::model::{
    ExecutionRecord, RunStatus, ScenarioDefinition, ScenarioId, StepExecutionLog, StepKind,
    StepNode, StepResult,
};
use crate::store::{CaseStore, ScenarioStore, VariableProvider};
use anyhow::Context;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub struct ScenarioEngine {
    scenarios: Arc<dyn ScenarioStore>,
    cases: Arc<dyn CaseStore>,
    variables: Option<Arc<dyn VariableProvider>>,
    executor: Arc<dyn CaseExecutor>,
    evaluator: Arc<dyn ScriptEvaluator>,
    history: Option<Arc<dyn HistorySink>>,
    registry: InvokerRegistry,
    config: EngineConfig,
}

impl ScenarioEngine {
    pub fn builder() -> ScenarioEngineBuilder {
        ScenarioEngineBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cases(&self) -> &dyn CaseStore {
        self.cases.as_ref()
    }

    pub fn executor(&self) -> &dyn CaseExecutor {
        self.executor.as_ref()
    }

    pub fn evaluator(&self) -> &dyn ScriptEvaluator {
        self.evaluator.as_ref()
    }

    pub fn registry(&self) -> &InvokerRegistry {
        &self.registry
    }

    /// Run a scenario to completion and return its results in execution
    /// order.
    pub async fn execute_scenario(
        &self,
        scenario_id: ScenarioId,
        env_key: &str,
        observer: Option<&dyn ProgressObserver>,
    ) -> EngineResult<Vec<StepResult>> {
        self.execute_with_cancel(scenario_id, env_key, observer, CancellationToken::new())
            .await
    }

    /// Like [`execute_scenario`](Self::execute_scenario), stopping early
    /// once `token` is cancelled or the configured run timeout passes.
    #[instrument(skip(self, observer, token), fields(env = %env_key))]
    pub async fn execute_with_cancel(
        &self,
        scenario_id: ScenarioId,
        env_key: &str,
        observer: Option<&dyn ProgressObserver>,
        token: CancellationToken,
    ) -> EngineResult<Vec<StepResult>> {
        let mut ctx = ExecutionContext::new(env_key).with_cancellation(token);
        if let Some(timeout) = self.config.run_timeout() {
            ctx = ctx.with_deadline(tokio::time::Instant::now() + timeout);
        }

        let mut results = Vec::new();
        self.run(scenario_id, observer, &mut ctx, &mut results, true)
            .await?;
        debug_assert_eq!(ctx.scopes.depth(), 1);
        Ok(results)
    }

    /// Run a scenario inside an existing run, sharing `ctx` with the
    /// caller. No execution record is created for it.
    pub async fn execute_nested(
        &self,
        scenario_id: ScenarioId,
        env_key: &str,
        observer: Option<&dyn ProgressObserver>,
        ctx: &mut ExecutionContext,
    ) -> EngineResult<Vec<StepResult>> {
        if ctx.env_key() != env_key {
            ctx.set_env_key(env_key);
        }
        let mut results = Vec::new();
        self.run(scenario_id, observer, ctx, &mut results, false)
            .await?;
        Ok(results)
    }

    /// Run a scenario on its own tokio task.
    pub fn spawn_scenario(
        self: &Arc<Self>,
        scenario_id: ScenarioId,
        env_key: impl Into<String>,
        observer: Option<Arc<dyn ProgressObserver>>,
        token: CancellationToken,
    ) -> JoinHandle<EngineResult<Vec<StepResult>>> {
        let engine = Arc::clone(self);
        let env_key = env_key.into();
        tokio::spawn(async move {
            engine
                .execute_with_cancel(scenario_id, &env_key, observer.as_deref(), token)
                .await
        })
    }

    async fn run(
        &self,
        scenario_id: ScenarioId,
        observer: Option<&dyn ProgressObserver>,
        ctx: &mut ExecutionContext,
        results: &mut Vec<StepResult>,
        top_level: bool,
    ) -> EngineResult<()> {
        if ctx.is_executing(scenario_id) {
            return Err(EngineError::CircularReference(scenario_id));
        }
        let max = self.config.max_nesting_depth;
        if ctx.nesting_depth() >= max {
            return Err(EngineError::NestingTooDeep { scenario_id, max });
        }

        let scenario = match self.scenarios.load_scenario(scenario_id).await {
            Ok(Some(scenario)) => scenario,
            Ok(None) => return Err(EngineError::ScenarioNotFound(scenario_id)),
            Err(source) => return Err(EngineError::Store { scenario_id, source }),
        };

        ctx.enter_scenario(scenario_id);
        let outcome = self
            .run_entered(&scenario, observer, ctx, results, top_level)
            .await;
        ctx.exit_scenario(scenario_id);
        outcome
    }

    async fn run_entered(
        &self,
        scenario: &ScenarioDefinition,
        observer: Option<&dyn ProgressObserver>,
        ctx: &mut ExecutionContext,
        results: &mut Vec<StepResult>,
        top_level: bool,
    ) -> EngineResult<()> {
        let inv = Invocation::new(self, observer);
        let scenario_id = scenario.id;

        if top_level {
            self.load_variables(scenario, ctx).await?;
        }

        let mut start_event = ExecutionEvent::new(EventType::ScenarioStart, ctx.scopes.flatten())
            .scenario(scenario_id);
        start_event.step_name = Some(scenario.name.clone());
        inv.emit(start_event);
        info!("Executing scenario {} ({})", scenario.name, scenario_id);

        let mut record = if top_level {
            Some(self.create_record(scenario, ctx).await)
        } else {
            None
        };

        let tree = match self.scenarios.load_step_tree(scenario_id).await {
            Ok(tree) => tree,
            Err(source) => {
                if let Some(record) = record.as_mut() {
                    record.abort();
                    self.update_record(record).await;
                }
                return Err(EngineError::Store { scenario_id, source });
            }
        };

        let start = Instant::now();
        let first = results.len();
        for step in &tree {
            self.dispatch(step, inv, ctx, results).await;
        }
        let duration_ms = start.elapsed().as_millis() as u64;

        let cancelled = ctx.is_cancelled();
        let status = match record.as_mut() {
            Some(record) => {
                record.finish(&results[first..], duration_ms, cancelled);
                self.update_record(record).await;
                record.status
            }
            None if cancelled || results[first..].iter().any(StepResult::is_fail) => {
                RunStatus::Fail
            }
            None => RunStatus::Pass,
        };
        if cancelled {
            warn!("Scenario {} was cancelled", scenario_id);
        }
        info!(
            "Scenario {} finished with {} in {} ms",
            scenario.name, status, duration_ms
        );

        inv.emit(
            ExecutionEvent::new(EventType::ScenarioComplete, ctx.scopes.flatten())
                .scenario(scenario_id)
                .status(status),
        );
        Ok(())
    }

    async fn load_variables(
        &self,
        scenario: &ScenarioDefinition,
        ctx: &mut ExecutionContext,
    ) -> EngineResult<()> {
        let Some(provider) = &self.variables else {
            return Ok(());
        };
        let variables = provider
            .resolve_variables(scenario.project_id, scenario.module_id, ctx.env_key())
            .await
            .map_err(|source| EngineError::Variables {
                scenario_id: scenario.id,
                source,
            })?;
        debug!("Loaded {} inherited variables", variables.len());
        for (name, value) in variables {
            ctx.scopes.set_global(name, value);
        }
        Ok(())
    }

    async fn create_record(
        &self,
        scenario: &ScenarioDefinition,
        ctx: &mut ExecutionContext,
    ) -> ExecutionRecord {
        let mut record = ExecutionRecord::start(scenario, ctx.env_key());
        if let Some(history) = &self.history {
            match history.create_record(&record).await {
                Ok(id) => {
                    record.id = Some(id);
                    ctx.set_record_id(Some(id));
                }
                Err(e) => warn!("Failed to create execution record: {:#}", e),
            }
        }
        record
    }

    async fn update_record(&self, record: &ExecutionRecord) {
        let (Some(history), Some(_)) = (&self.history, record.id) else {
            return;
        };
        if let Err(e) = history.update_record(record).await {
            warn!("Failed to update execution record: {:#}", e);
        }
    }

    async fn append_step_logs(&self, step: &StepNode, ctx: &ExecutionContext, new: &[StepResult]) {
        let (Some(history), Some(record_id)) = (&self.history, ctx.record_id()) else {
            return;
        };
        for result in new.iter().filter(|r| r.step_id == step.id) {
            let log = StepExecutionLog::from_result(record_id, step, result);
            if let Err(e) = history
                .append_step_log(&log)
                .await
                .context(format!("step {}", step.id))
            {
                warn!("Failed to save step log: {:#}", e);
            }
        }
    }

    /// Run one step and, through its invoker, its subtree.
    pub(crate) fn dispatch<'a>(
        &'a self,
        step: &'a StepNode,
        inv: Invocation<'a>,
        ctx: &'a mut ExecutionContext,
        results: &'a mut Vec<StepResult>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if step.is_disabled() {
                debug!("Step {} is disabled, skipping", step.id);
                return;
            }

            inv.emit(
                ExecutionEvent::new(EventType::StepStart, ctx.scopes.flatten())
                    .step(step.id, step.name.clone())
                    .status(RunStatus::Running),
            );

            let first = results.len();
            // Once cancelled, leaves are recorded as skipped and groups
            // still walk their children so those get recorded too.
            if ctx.is_cancelled() {
                if step.kind.is_leaf() {
                    let name = step.name_or(step.kind.as_str()).to_string();
                    let skipped = StepResult::skipped(step.id, name, "Cancelled");
                    inv.record(step, ctx, results, skipped);
                    self.append_step_logs(step, ctx, &results[first..]).await;
                    return;
                }
                if step.kind != StepKind::Group {
                    return;
                }
            }

            let Some(invoker) = self.registry.get(step.kind) else {
                warn!("No invoker found for step type: {}", step.kind);
                return;
            };
            invoker.execute(step, inv, ctx, results).await;
            self.append_step_logs(step, ctx, &results[first..]).await;
        })
    }
}

/// Wires the collaborators of a [`ScenarioEngine`].
#[derive(Default)]
pub struct ScenarioEngineBuilder {
    scenarios: Option<Arc<dyn ScenarioStore>>,
    cases: Option<Arc<dyn CaseStore>>,
    variables: Option<Arc<dyn VariableProvider>>,
    executor: Option<Arc<dyn CaseExecutor>>,
    evaluator: Option<Arc<dyn ScriptEvaluator>>,
    history: Option<Arc<dyn HistorySink>>,
    registry: Option<InvokerRegistry>,
    config: EngineConfig,
}

impl ScenarioEngineBuilder {
    /// Use one store for scenarios, cases and variables.
    pub fn store<S>(mut self, store: Arc<S>) -> Self
    where
        S: ScenarioStore + CaseStore + VariableProvider + 'static,
    {
        self.scenarios = Some(store.clone());
        self.cases = Some(store.clone());
        self.variables = Some(store);
        self
    }

    pub fn scenario_store(mut self, store: Arc<dyn ScenarioStore>) -> Self {
        self.scenarios = Some(store);
        self
    }

    pub fn case_store(mut self, store: Arc<dyn CaseStore>) -> Self {
        self.cases = Some(store);
        self
    }

    pub fn variable_provider(mut self, provider: Arc<dyn VariableProvider>) -> Self {
        self.variables = Some(provider);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn CaseExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn evaluator(mut self, evaluator: Arc<dyn ScriptEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn history(mut self, history: Arc<dyn HistorySink>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn registry(mut self, registry: InvokerRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> anyhow::Result<ScenarioEngine> {
        let scenarios = self.scenarios.context("A scenario store is required")?;
        let cases = self.cases.context("A case store is required")?;
        let evaluator = self
            .evaluator
            .unwrap_or_else(|| Arc::new(CelScriptEvaluator::new()));
        let executor = match self.executor {
            Some(executor) => executor,
            None => Arc::new(
                HttpCaseExecutor::from_config(&self.config).with_evaluator(evaluator.clone()),
            ),
        };
        Ok(ScenarioEngine {
            scenarios,
            cases,
            variables: self.variables,
            executor,
            evaluator,
            history: self.history,
            registry: self.registry.unwrap_or_default(),
            config: self.config,
        })
    }
}
