//! Errors that escape a scenario run.
//!
//! Step-level failures never show up here; they are recorded as FAIL
//! [`StepResult`](crate::model::StepResult)s and the run continues.

use crate::model::ScenarioId;
use thiserror::Error;

pub const CIRCULAR_REFERENCE_MESSAGE: &str =
    "Circular reference detected: scenario references itself directly or indirectly";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Circular reference detected: scenario {0} references itself directly or indirectly")]
    CircularReference(ScenarioId),

    #[error("Invalid scope operation: {0}")]
    InvalidScopeOperation(&'static str),

    #[error("Scenario not found: {0}")]
    ScenarioNotFound(ScenarioId),

    #[error("Scenario nesting exceeds the maximum depth of {max} (scenario {scenario_id})")]
    NestingTooDeep { scenario_id: ScenarioId, max: usize },

    #[error("Failed to load steps for scenario {scenario_id}: {source}")]
    Store {
        scenario_id: ScenarioId,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to resolve variables for scenario {scenario_id}: {source}")]
    Variables {
        scenario_id: ScenarioId,
        #[source]
        source: anyhow::Error,
    },
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
