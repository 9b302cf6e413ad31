use super::{Invocation, StepInvoker};
use crate::context::ExecutionContext;
use crate::events::{EventType, ExecutionEvent};
use crate::model::{StepKind, StepNode, StepResult, StepStatus};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

/// Sleeps for `waitMs`, waking early when the run is cancelled.
pub struct WaitInvoker;

#[async_trait]
impl StepInvoker for WaitInvoker {
    fn kind(&self) -> StepKind {
        StepKind::Wait
    }

    async fn execute(
        &self,
        step: &StepNode,
        inv: Invocation<'_>,
        ctx: &mut ExecutionContext,
        _results: &mut Vec<StepResult>,
    ) {
        let wait_ms = step
            .wait_logic()
            .wait_ms
            .unwrap_or(inv.engine.config().default_wait_ms);
        debug!("Waiting {} ms", wait_ms);

        let completed = tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(wait_ms)) => true,
            _ = ctx.cancelled() => false,
        };
        if !completed {
            warn!("Wait step {} interrupted", step.id);
            return;
        }

        inv.emit(
            ExecutionEvent::new(EventType::StepComplete, ctx.scopes.flatten())
                .step(step.id, step.name.clone())
                .status(StepStatus::Pass),
        );
    }
}
