//! Progress events emitted while a scenario runs.

use crate::model::{ScenarioId, StepId, StepResult};
use crate::scope::Variables;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ScenarioStart,
    StepStart,
    StepComplete,
    ScenarioComplete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub scenario_id: Option<ScenarioId>,
    pub step_id: Option<StepId>,
    pub step_name: Option<String>,
    pub status: Option<String>,
    pub result: Option<StepResult>,
    /// Flattened variables at the time of the event.
    pub variables: Variables,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl ExecutionEvent {
    pub fn new(event_type: EventType, variables: Variables) -> Self {
        Self {
            event_type,
            scenario_id: None,
            step_id: None,
            step_name: None,
            status: None,
            result: None,
            variables,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn scenario(mut self, scenario_id: ScenarioId) -> Self {
        self.scenario_id = Some(scenario_id);
        self
    }

    pub fn step(mut self, step_id: StepId, name: impl Into<String>) -> Self {
        self.step_id = Some(step_id);
        self.step_name = Some(name.into());
        self
    }

    pub fn status(mut self, status: impl ToString) -> Self {
        self.status = Some(status.to_string());
        self
    }

    pub fn result(mut self, result: StepResult) -> Self {
        self.result = Some(result);
        self
    }
}

/// Receives lifecycle events in execution order. Delivery is
/// best-effort and must not block the run.
pub trait ProgressObserver: Send + Sync {
    fn on_event(&self, event: ExecutionEvent);
}

impl ProgressObserver for UnboundedSender<ExecutionEvent> {
    fn on_event(&self, event: ExecutionEvent) {
        if self.send(event).is_err() {
            debug!("Progress receiver dropped, event discarded");
        }
    }
}

/// Writes events to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogObserver;

impl ProgressObserver for LogObserver {
    fn on_event(&self, event: ExecutionEvent) {
        let name = event.step_name.as_deref().unwrap_or("-");
        let status = event.status.as_deref().unwrap_or("");
        match event.event_type {
            EventType::ScenarioStart => {
                info!("[event] scenario_start {}", event.scenario_id.unwrap_or_default())
            }
            EventType::StepStart => info!("[event] step_start {}", name),
            EventType::StepComplete => info!("[event] step_complete {} {}", name, status),
            EventType::ScenarioComplete => info!(
                "[event] scenario_complete {} {}",
                event.scenario_id.unwrap_or_default(),
                status
            ),
        }
    }
}
