//! Collaborators that supply scenarios, cases and inherited variables,
//! plus an in-memory catalog implementing all of them.

use crate::model::{
    build_step_tree, CaseId, ScenarioDefinition, ScenarioId, StepNode, TestCase,
};
use crate::scope::Variables;
use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

#[async_trait]
pub trait ScenarioStore: Send + Sync {
    async fn load_scenario(&self, id: ScenarioId) -> Result<Option<ScenarioDefinition>>;

    /// Ordered, nested step tree of a scenario.
    async fn load_step_tree(&self, id: ScenarioId) -> Result<Vec<StepNode>>;
}

#[async_trait]
pub trait CaseStore: Send + Sync {
    async fn find_case(&self, id: CaseId) -> Result<Option<TestCase>>;
}

#[async_trait]
pub trait VariableProvider: Send + Sync {
    /// Variables visible to a run, later levels overriding earlier ones:
    /// global, project, module, environment.
    async fn resolve_variables(
        &self,
        project_id: Option<i64>,
        module_id: Option<i64>,
        env_key: &str,
    ) -> Result<Variables>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub id: i64,
    pub name: String,
}

/// One inheritable variable. Which of `project_id`, `module_id` and
/// `environment_id` are set decides its level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableEntry {
    pub key: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub project_id: Option<i64>,
    #[serde(default)]
    pub module_id: Option<i64>,
    #[serde(default)]
    pub environment_id: Option<i64>,
}

/// Everything one run needs, as loaded from a catalog file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub scenarios: Vec<ScenarioDefinition>,
    #[serde(default)]
    pub cases: Vec<TestCase>,
    #[serde(default)]
    pub variables: Vec<VariableEntry>,
    #[serde(default)]
    pub environments: Vec<Environment>,
}

impl Catalog {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let catalog: Catalog = serde_yaml::from_str(yaml)?;
        Ok(catalog)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Append another catalog. Ids must stay unique across both.
    pub fn merge(&mut self, other: Catalog) -> Result<()> {
        for scenario in &other.scenarios {
            if self.scenarios.iter().any(|s| s.id == scenario.id) {
                bail!("Duplicate scenario id {}", scenario.id);
            }
        }
        for case in &other.cases {
            if self.cases.iter().any(|c| c.id == case.id) {
                bail!("Duplicate case id {}", case.id);
            }
        }
        self.scenarios.extend(other.scenarios);
        self.cases.extend(other.cases);
        self.variables.extend(other.variables);
        self.environments.extend(other.environments);
        Ok(())
    }

    fn environment_matches(&self, entry_env: i64, env_key: &str) -> bool {
        if env_key.parse::<i64>().ok() == Some(entry_env) {
            return true;
        }
        self.environments
            .iter()
            .any(|env| env.id == entry_env && env.name.eq_ignore_ascii_case(env_key))
    }

    /// Flatten inherited variables for a project/module/environment.
    pub fn inherited_variables(
        &self,
        project_id: Option<i64>,
        module_id: Option<i64>,
        env_key: &str,
    ) -> Variables {
        let is_global = |e: &VariableEntry| {
            e.project_id.is_none() && e.module_id.is_none() && e.environment_id.is_none()
        };
        let is_project = |e: &VariableEntry| {
            project_id.is_some()
                && e.project_id == project_id
                && e.module_id.is_none()
                && e.environment_id.is_none()
        };
        let is_module = |e: &VariableEntry| {
            module_id.is_some() && e.module_id == module_id && e.environment_id.is_none()
        };
        let is_environment = |e: &VariableEntry| {
            e.environment_id
                .is_some_and(|env| self.environment_matches(env, env_key))
        };
        let levels: [&dyn Fn(&VariableEntry) -> bool; 4] =
            [&is_global, &is_project, &is_module, &is_environment];

        let mut vars = Variables::new();
        for level in levels {
            for entry in self.variables.iter().filter(|e| level(e)) {
                vars.insert(entry.key.clone(), entry.value.clone());
            }
        }
        vars
    }
}

/// Catalog-backed store for scenarios, cases and variables.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    catalog: Catalog,
    scenarios: HashMap<ScenarioId, usize>,
    cases: HashMap<CaseId, usize>,
}

impl InMemoryStore {
    pub fn new(catalog: Catalog) -> Self {
        let scenarios = catalog
            .scenarios
            .iter()
            .enumerate()
            .map(|(pos, s)| (s.id, pos))
            .collect();
        let cases = catalog
            .cases
            .iter()
            .enumerate()
            .map(|(pos, c)| (c.id, pos))
            .collect();
        Self {
            catalog,
            scenarios,
            cases,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn scenario_ids(&self) -> Vec<ScenarioId> {
        self.catalog.scenarios.iter().map(|s| s.id).collect()
    }

    fn scenario(&self, id: ScenarioId) -> Option<&ScenarioDefinition> {
        self.scenarios.get(&id).map(|&pos| &self.catalog.scenarios[pos])
    }
}

impl From<Catalog> for InMemoryStore {
    fn from(catalog: Catalog) -> Self {
        Self::new(catalog)
    }
}

#[async_trait]
impl ScenarioStore for InMemoryStore {
    async fn load_scenario(&self, id: ScenarioId) -> Result<Option<ScenarioDefinition>> {
        Ok(self.scenario(id).cloned())
    }

    async fn load_step_tree(&self, id: ScenarioId) -> Result<Vec<StepNode>> {
        let Some(scenario) = self.scenario(id) else {
            bail!("Scenario not found: {id}");
        };
        let tree = build_step_tree(&scenario.steps);
        debug!("Loaded {} root step(s) for scenario {}", tree.len(), id);
        Ok(tree)
    }
}

#[async_trait]
impl CaseStore for InMemoryStore {
    async fn find_case(&self, id: CaseId) -> Result<Option<TestCase>> {
        Ok(self.cases.get(&id).map(|&pos| self.catalog.cases[pos].clone()))
    }
}

#[async_trait]
impl VariableProvider for InMemoryStore {
    async fn resolve_variables(
        &self,
        project_id: Option<i64>,
        module_id: Option<i64>,
        env_key: &str,
    ) -> Result<Variables> {
        Ok(self.catalog.inherited_variables(project_id, module_id, env_key))
    }
}
