use super::{Invocation, StepInvoker};
use crate::context::ExecutionContext;
use crate::model::{StepKind, StepNode, StepResult};
use async_trait::async_trait;
use tracing::{error, warn};

/// Evaluates `controlLogic.script` against the flattened variables and
/// writes what it assigned back into the current scope.
pub struct ScriptInvoker;

#[async_trait]
impl StepInvoker for ScriptInvoker {
    fn kind(&self) -> StepKind {
        StepKind::Script
    }

    async fn execute(
        &self,
        step: &StepNode,
        inv: Invocation<'_>,
        ctx: &mut ExecutionContext,
        results: &mut Vec<StepResult>,
    ) {
        let name = step.name_or("Script").to_string();
        ctx.register_step(step.id, &name);
        let Some(script) = step.script_logic().script.filter(|s| !s.trim().is_empty()) else {
            warn!("Script step {} has no script", step.id);
            inv.record(step, ctx, results, StepResult::skipped(step.id, name, "Empty script"));
            return;
        };

        let before = ctx.scopes.flatten();
        let mut vars = before.clone();
        let result = match inv.engine.evaluator().eval(&script, &mut vars) {
            Ok(_) => StepResult::pass(step.id, name, "Script executed successfully"),
            Err(e) => {
                error!("Script step {} failed: {:#}", step.id, e);
                StepResult::fail(step.id, name, format!("Script execution error: {e:#}"))
            }
        };

        for (key, value) in vars {
            if before.get(&key) != Some(&value) {
                ctx.scopes.set_local(key, value);
            }
        }
        inv.record(step, ctx, results, result);
    }
}
