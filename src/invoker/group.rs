use super::{Invocation, StepInvoker};
use crate::context::ExecutionContext;
use crate::model::{StepKind, StepNode, StepResult};
use async_trait::async_trait;

/// Runs its children in order without opening a scope.
pub struct GroupInvoker;

#[async_trait]
impl StepInvoker for GroupInvoker {
    fn kind(&self) -> StepKind {
        StepKind::Group
    }

    async fn execute(
        &self,
        step: &StepNode,
        inv: Invocation<'_>,
        ctx: &mut ExecutionContext,
        results: &mut Vec<StepResult>,
    ) {
        inv.run_children(step, ctx, results).await;
    }
}
