//! Step invokers, one per [`StepKind`].
//!
//! The engine looks an invoker up by kind in an [`InvokerRegistry`] and
//! hands it the step, the run's [`ExecutionContext`] and the result list.
//! Invokers never return errors: anything that goes wrong while running
//! a step is recorded as a FAIL result and the run moves on.

mod case;
mod conditional;
mod group;
mod loops;
mod scenario;
mod script;
mod wait;

pub use case::CaseInvoker;
pub use conditional::ConditionalInvoker;
pub use group::GroupInvoker;
pub use loops::LoopInvoker;
pub use scenario::ScenarioInvoker;
pub use script::ScriptInvoker;
pub use wait::WaitInvoker;

use crate::context::ExecutionContext;
use crate::engine::ScenarioEngine;
use crate::events::{EventType, ExecutionEvent, ProgressObserver};
use crate::model::{StepKind, StepNode, StepResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::error;

#[async_trait]
pub trait StepInvoker: Send + Sync {
    fn kind(&self) -> StepKind;

    async fn execute(
        &self,
        step: &StepNode,
        inv: Invocation<'_>,
        ctx: &mut ExecutionContext,
        results: &mut Vec<StepResult>,
    );
}

/// What an invoker needs from the run besides the context: the engine
/// (for children and nested scenarios) and the optional observer.
#[derive(Clone, Copy)]
pub struct Invocation<'a> {
    pub engine: &'a ScenarioEngine,
    pub observer: Option<&'a dyn ProgressObserver>,
}

impl<'a> Invocation<'a> {
    pub fn new(engine: &'a ScenarioEngine, observer: Option<&'a dyn ProgressObserver>) -> Self {
        Self { engine, observer }
    }

    pub fn emit(&self, event: ExecutionEvent) {
        if let Some(observer) = self.observer {
            observer.on_event(event);
        }
    }

    /// Store `result` in the history, notify the observer and append it
    /// to the run's result list.
    pub fn record(
        &self,
        step: &StepNode,
        ctx: &mut ExecutionContext,
        results: &mut Vec<StepResult>,
        result: StepResult,
    ) {
        ctx.record_result(step.id, result.clone());
        self.emit(
            ExecutionEvent::new(EventType::StepComplete, ctx.scopes.flatten())
                .step(step.id, result.name.clone())
                .status(result.status)
                .result(result.clone()),
        );
        results.push(result);
    }

    /// Run `step`'s children in order in the current scope.
    pub async fn run_children(
        &self,
        step: &StepNode,
        ctx: &mut ExecutionContext,
        results: &mut Vec<StepResult>,
    ) {
        for child in &step.children {
            self.engine.dispatch(child, *self, ctx, results).await;
        }
    }

    /// Run `step`'s children in a fresh scope holding `bindings`. New
    /// variables are merged into the enclosing scope afterwards.
    pub async fn run_children_in_scope(
        &self,
        step: &StepNode,
        bindings: Vec<(String, Value)>,
        ctx: &mut ExecutionContext,
        results: &mut Vec<StepResult>,
    ) {
        ctx.scopes.push();
        for (name, value) in bindings {
            ctx.scopes.set_local(name, value);
        }
        self.run_children(step, ctx, results).await;
        ctx.scopes.merge_up(None);
        if let Err(e) = ctx.scopes.pop() {
            error!("Scope stack out of balance after step {}: {}", step.id, e);
        }
    }
}

/// Fixed mapping from step kind to invoker.
#[derive(Clone)]
pub struct InvokerRegistry {
    invokers: HashMap<StepKind, Arc<dyn StepInvoker>>,
}

impl Default for InvokerRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl InvokerRegistry {
    pub fn empty() -> Self {
        Self {
            invokers: HashMap::new(),
        }
    }

    /// One invoker for every kind.
    pub fn standard() -> Self {
        Self::empty()
            .with_invoker(Arc::new(CaseInvoker))
            .with_invoker(Arc::new(GroupInvoker))
            .with_invoker(Arc::new(ConditionalInvoker))
            .with_invoker(Arc::new(LoopInvoker))
            .with_invoker(Arc::new(WaitInvoker))
            .with_invoker(Arc::new(ScriptInvoker))
            .with_invoker(Arc::new(ScenarioInvoker))
    }

    /// Register `invoker`, replacing any invoker of the same kind.
    pub fn with_invoker(mut self, invoker: Arc<dyn StepInvoker>) -> Self {
        self.invokers.insert(invoker.kind(), invoker);
        self
    }

    pub fn get(&self, kind: StepKind) -> Option<&Arc<dyn StepInvoker>> {
        self.invokers.get(&kind)
    }

    pub fn kinds(&self) -> Vec<StepKind> {
        StepKind::ALL
            .into_iter()
            .filter(|kind| self.invokers.contains_key(kind))
            .collect()
    }
}
