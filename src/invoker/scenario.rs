use super::{Invocation, StepInvoker};
use crate::context::ExecutionContext;
use crate::error::CIRCULAR_REFERENCE_MESSAGE;
use crate::model::{StepKind, StepNode, StepResult};
use async_trait::async_trait;
use tracing::{error, info, warn};

/// Runs another scenario inside the current run, sharing its context.
///
/// The nested scenario gets its own scope; variables it creates are
/// merged into the caller's scope when it finishes.
pub struct ScenarioInvoker;

#[async_trait]
impl StepInvoker for ScenarioInvoker {
    fn kind(&self) -> StepKind {
        StepKind::Scenario
    }

    async fn execute(
        &self,
        step: &StepNode,
        inv: Invocation<'_>,
        ctx: &mut ExecutionContext,
        results: &mut Vec<StepResult>,
    ) {
        let name = step.name_or("Nested Scenario").to_string();
        let Some(scenario_id) = step.reference_scenario_id else {
            warn!("Scenario step {} has no reference scenario ID", step.id);
            let result = StepResult::fail(step.id, name, "No referenced scenario configured");
            inv.record(step, ctx, results, result);
            return;
        };

        if ctx.is_executing(scenario_id) {
            error!("Circular reference detected for scenario {}", scenario_id);
            let result = StepResult::fail(step.id, name, CIRCULAR_REFERENCE_MESSAGE);
            inv.record(step, ctx, results, result);
            return;
        }

        info!(
            ">>> Start Executing Nested Scenario Step: {} (scenario ID: {})",
            name, scenario_id
        );
        ctx.register_step(step.id, &name);
        ctx.scopes.push();

        let env_key = ctx.env_key().to_string();
        match inv
            .engine
            .execute_nested(scenario_id, &env_key, inv.observer, ctx)
            .await
        {
            Ok(nested) => {
                info!(
                    "<<< Finished Nested Scenario Step. Executed {} steps",
                    nested.len()
                );
                results.extend(nested);
                ctx.scopes.merge_up(None);
            }
            Err(e) => {
                error!("Nested scenario {} failed: {}", scenario_id, e);
                let result = StepResult::fail(step.id, name, format!("Execution Error: {e}"));
                inv.record(step, ctx, results, result);
            }
        }

        if let Err(e) = ctx.scopes.pop() {
            error!("Scope stack out of balance after step {}: {}", step.id, e);
        }
    }
}
