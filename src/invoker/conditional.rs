use super::{Invocation, StepInvoker};
use crate::context::ExecutionContext;
use crate::expression::condition_truthy;
use crate::model::{StepKind, StepNode, StepResult};
use crate::resolver;
use async_trait::async_trait;
use tracing::{debug, warn};

/// Runs its children in a new scope when `controlLogic.condition`
/// holds. An empty condition holds; one that fails to evaluate does not.
pub struct ConditionalInvoker;

#[async_trait]
impl StepInvoker for ConditionalInvoker {
    fn kind(&self) -> StepKind {
        StepKind::If
    }

    async fn execute(
        &self,
        step: &StepNode,
        inv: Invocation<'_>,
        ctx: &mut ExecutionContext,
        results: &mut Vec<StepResult>,
    ) {
        let condition = step.condition_logic().condition.unwrap_or_default();
        if !evaluate_condition(&condition, inv, ctx) {
            debug!("Condition of step {} is false, skipping children", step.id);
            return;
        }
        inv.run_children_in_scope(step, Vec::new(), ctx, results).await;
    }
}

/// Shared by IF steps and `while` loops.
pub(crate) fn evaluate_condition(
    condition: &str,
    inv: Invocation<'_>,
    ctx: &ExecutionContext,
) -> bool {
    if condition.trim().is_empty() {
        return true;
    }
    let resolved = resolver::resolve(condition, ctx);
    let mut vars = ctx.scopes.flatten();
    match inv.engine.evaluator().eval(&resolved, &mut vars) {
        Ok(value) => {
            let truthy = condition_truthy(&value);
            debug!("Condition '{}' evaluated to {}", resolved, truthy);
            truthy
        }
        Err(e) => {
            warn!("Failed to evaluate condition '{}': {:#}", resolved, e);
            false
        }
    }
}
