use super::conditional::evaluate_condition;
use super::{Invocation, StepInvoker};
use crate::context::ExecutionContext;
use crate::model::{LoopLogic, LoopMode, StepKind, StepNode, StepResult};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

/// Repeats its children, one scope per iteration.
///
/// * `count`: `count` times (default 1), binding `loopIndex` (from 0)
///   and `loopIteration` (from 1).
/// * `foreach`: once per element of the array variable `iterableVar`,
///   binding `itemVar` and `indexVar`.
/// * `while`: while `condition` holds, at most `maxIterations` times.
pub struct LoopInvoker;

#[async_trait]
impl StepInvoker for LoopInvoker {
    fn kind(&self) -> StepKind {
        StepKind::Loop
    }

    async fn execute(
        &self,
        step: &StepNode,
        inv: Invocation<'_>,
        ctx: &mut ExecutionContext,
        results: &mut Vec<StepResult>,
    ) {
        let logic = step.loop_logic();
        match logic.mode() {
            LoopMode::Count => run_count(step, &logic, inv, ctx, results).await,
            LoopMode::Foreach => run_foreach(step, &logic, inv, ctx, results).await,
            LoopMode::While => run_while(step, &logic, inv, ctx, results).await,
        }
    }
}

fn counters(index: u64) -> Vec<(String, Value)> {
    vec![
        ("loopIndex".to_string(), json!(index)),
        ("loopIteration".to_string(), json!(index + 1)),
    ]
}

async fn run_count(
    step: &StepNode,
    logic: &LoopLogic,
    inv: Invocation<'_>,
    ctx: &mut ExecutionContext,
    results: &mut Vec<StepResult>,
) {
    let count = logic.count.unwrap_or(1);
    debug!("Executing count loop: {} iterations", count);
    for index in 0..count {
        if ctx.is_cancelled() {
            debug!("Loop {} cancelled after {} iterations", step.id, index);
            break;
        }
        inv.run_children_in_scope(step, counters(index), ctx, results)
            .await;
    }
}

async fn run_foreach(
    step: &StepNode,
    logic: &LoopLogic,
    inv: Invocation<'_>,
    ctx: &mut ExecutionContext,
    results: &mut Vec<StepResult>,
) {
    let iterable_var = logic.iterable_var.as_deref().unwrap_or_default();
    let item_var = logic.item_var.as_deref().unwrap_or("item");
    let index_var = logic.index_var.as_deref().unwrap_or("index");

    let items = match ctx.scopes.get(iterable_var) {
        Some(Value::Array(items)) => items.clone(),
        // Extracted arrays may have been stored as JSON text.
        Some(Value::String(text)) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Array(items)) => items,
            _ => {
                warn!("ForEach target '{}' is not a collection: {}", iterable_var, text);
                return;
            }
        },
        other => {
            warn!(
                "ForEach target '{}' is not a collection: {}",
                iterable_var,
                other.map(|v| v.to_string()).unwrap_or_else(|| "null".to_string())
            );
            return;
        }
    };

    debug!("Executing foreach loop over '{}': {} items", iterable_var, items.len());
    for (index, item) in items.into_iter().enumerate() {
        if ctx.is_cancelled() {
            debug!("Loop {} cancelled after {} iterations", step.id, index);
            break;
        }
        let bindings = vec![
            (item_var.to_string(), item),
            (index_var.to_string(), json!(index)),
        ];
        inv.run_children_in_scope(step, bindings, ctx, results).await;
    }
}

async fn run_while(
    step: &StepNode,
    logic: &LoopLogic,
    inv: Invocation<'_>,
    ctx: &mut ExecutionContext,
    results: &mut Vec<StepResult>,
) {
    let condition = logic.condition.as_deref().unwrap_or("true");
    let max_iterations = logic
        .max_iterations
        .unwrap_or(inv.engine.config().default_max_iterations);
    debug!(
        "Executing while loop: condition={}, maxIterations={}",
        condition, max_iterations
    );

    let mut iteration = 0;
    while iteration < max_iterations {
        if ctx.is_cancelled() {
            debug!("Loop {} cancelled after {} iterations", step.id, iteration);
            return;
        }
        if !evaluate_condition(condition, inv, ctx) {
            debug!("While loop condition not met, exiting at iteration {}", iteration);
            return;
        }
        inv.run_children_in_scope(step, counters(iteration), ctx, results)
            .await;
        iteration += 1;
    }
    warn!("While loop reached max iterations ({})", max_iterations);
}
