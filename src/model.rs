//! Scenario, step, case and result types shared by the engine and its
//! collaborators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tracing::warn;

pub type StepId = i64;
pub type ScenarioId = i64;
pub type CaseId = i64;
pub type RecordId = i64;

/// Kind of a scenario step; selects the invoker that runs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StepKind {
    Case,
    Group,
    If,
    Loop,
    Wait,
    Script,
    Scenario,
}

impl StepKind {
    pub const ALL: [StepKind; 7] = [
        StepKind::Case,
        StepKind::Group,
        StepKind::If,
        StepKind::Loop,
        StepKind::Wait,
        StepKind::Script,
        StepKind::Scenario,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Case => "CASE",
            StepKind::Group => "GROUP",
            StepKind::If => "IF",
            StepKind::Loop => "LOOP",
            StepKind::Wait => "WAIT",
            StepKind::Script => "SCRIPT",
            StepKind::Scenario => "SCENARIO",
        }
    }

    /// Leaf kinds produce a [`StepResult`] of their own.
    pub fn is_leaf(&self) -> bool {
        matches!(self, StepKind::Case | StepKind::Script)
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scenario as stored in a catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioDefinition {
    pub id: ScenarioId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub project_id: Option<i64>,
    #[serde(default)]
    pub module_id: Option<i64>,
    /// Flat step rows; the tree is rebuilt from `parent_id`.
    #[serde(default)]
    pub steps: Vec<StepRecord>,
}

/// Persisted shape of a step: one row per step, linked to its parent
/// by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: StepId,
    #[serde(default)]
    pub parent_id: Option<StepId>,
    #[serde(rename = "type", alias = "kind")]
    pub kind: StepKind,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub order_index: Option<i32>,
    #[serde(default)]
    pub reference_case_id: Option<CaseId>,
    #[serde(default)]
    pub reference_scenario_id: Option<ScenarioId>,
    #[serde(default)]
    pub control_logic: Option<Value>,
    #[serde(default)]
    pub data_overrides: Option<Value>,
}

/// A step in an executable scenario tree. Nodes own their children.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepNode {
    pub id: StepId,
    #[serde(default)]
    pub parent_id: Option<StepId>,
    #[serde(rename = "type", alias = "kind")]
    pub kind: StepKind,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub order_index: Option<i32>,
    #[serde(default)]
    pub reference_case_id: Option<CaseId>,
    #[serde(default)]
    pub reference_scenario_id: Option<ScenarioId>,
    #[serde(default)]
    pub control_logic: Option<Value>,
    #[serde(default)]
    pub data_overrides: Option<Value>,
    #[serde(default)]
    pub children: Vec<StepNode>,
}

impl StepNode {
    pub fn new(id: StepId, kind: StepKind, name: impl Into<String>) -> Self {
        Self {
            id,
            parent_id: None,
            kind,
            name: name.into(),
            order_index: None,
            reference_case_id: None,
            reference_scenario_id: None,
            control_logic: None,
            data_overrides: None,
            children: Vec::new(),
        }
    }

    fn from_record(record: &StepRecord) -> Self {
        Self {
            id: record.id,
            parent_id: record.parent_id,
            kind: record.kind,
            name: record.name.clone(),
            order_index: record.order_index,
            reference_case_id: record.reference_case_id,
            reference_scenario_id: record.reference_scenario_id,
            control_logic: record.control_logic.clone(),
            data_overrides: record.data_overrides.clone(),
            children: Vec::new(),
        }
    }

    /// Step name, or `fallback` when the step is unnamed.
    pub fn name_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        if self.name.trim().is_empty() {
            fallback
        } else {
            &self.name
        }
    }

    /// A step is off when `dataOverrides.enabled` reads as false:
    /// `false`, `0`, any string but `true`, or an object/array.
    pub fn is_disabled(&self) -> bool {
        match self.overrides().enabled {
            None | Some(Value::Null) => false,
            Some(Value::Bool(enabled)) => !enabled,
            Some(Value::Number(n)) => n.as_f64() == Some(0.0),
            Some(Value::String(s)) => !s.trim().eq_ignore_ascii_case("true"),
            Some(Value::Array(_)) | Some(Value::Object(_)) => true,
        }
    }

    pub fn condition_logic(&self) -> ConditionLogic {
        self.parse_control_logic()
    }

    pub fn loop_logic(&self) -> LoopLogic {
        self.parse_control_logic()
    }

    pub fn wait_logic(&self) -> WaitLogic {
        self.parse_control_logic()
    }

    pub fn script_logic(&self) -> ScriptLogic {
        self.parse_control_logic()
    }

    pub fn overrides(&self) -> DataOverrides {
        parse_or_default(self.id, "dataOverrides", self.data_overrides.as_ref())
    }

    fn parse_control_logic<T>(&self) -> T
    where
        T: Default + for<'de> Deserialize<'de>,
    {
        parse_or_default(self.id, "controlLogic", self.control_logic.as_ref())
    }
}

fn parse_or_default<T>(step_id: StepId, field: &str, raw: Option<&Value>) -> T
where
    T: Default + for<'de> Deserialize<'de>,
{
    match raw {
        None | Some(Value::Null) => T::default(),
        // Stored configs are sometimes JSON encoded twice.
        Some(Value::String(text)) => serde_json::from_str(text).unwrap_or_else(|e| {
            warn!("Failed to parse {} for step {}: {}", field, step_id, e);
            T::default()
        }),
        Some(value) => T::deserialize(value).unwrap_or_else(|e| {
            warn!("Failed to parse {} for step {}: {}", field, step_id, e);
            T::default()
        }),
    }
}

/// Rebuild the owned step tree from flat rows.
///
/// Steps whose parent is missing become roots. Siblings are ordered by
/// `order_index` (unset last); ties keep their input order.
pub fn build_step_tree(records: &[StepRecord]) -> Vec<StepNode> {
    let mut index: HashMap<StepId, usize> = HashMap::new();
    for (pos, record) in records.iter().enumerate() {
        if index.insert(record.id, pos).is_some() {
            warn!("Duplicate step id {}, keeping the last row", record.id);
        }
    }

    let mut roots = Vec::new();
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); records.len()];
    for (pos, record) in records.iter().enumerate() {
        if index.get(&record.id) != Some(&pos) {
            continue;
        }
        match record.parent_id {
            None => roots.push(pos),
            Some(parent) if parent == record.id => {
                warn!("Step {} is its own parent, treating as root", record.id);
                roots.push(pos);
            }
            Some(parent) => match index.get(&parent) {
                Some(&parent_pos) => children[parent_pos].push(pos),
                None => {
                    warn!(
                        "Step {} has parent {} which doesn't exist, treating as root",
                        record.id, parent
                    );
                    roots.push(pos);
                }
            },
        }
    }

    let sibling_order = |pos: &usize| {
        let order = records[*pos].order_index;
        (order.is_none(), order.unwrap_or_default())
    };
    roots.sort_by_key(sibling_order);
    for list in &mut children {
        list.sort_by_key(sibling_order);
    }

    let mut visited = 0usize;
    let tree: Vec<StepNode> = roots
        .iter()
        .map(|&pos| assemble(records, &children, pos, &mut visited))
        .collect();

    if visited < index.len() {
        warn!(
            "{} step(s) are unreachable from any root (cyclic parent links)",
            index.len() - visited
        );
    }
    tree
}

fn assemble(
    records: &[StepRecord],
    children: &[Vec<usize>],
    pos: usize,
    visited: &mut usize,
) -> StepNode {
    *visited += 1;
    let mut node = StepNode::from_record(&records[pos]);
    node.children = children[pos]
        .iter()
        .map(|&child| assemble(records, children, child, visited))
        .collect();
    node
}

/// `controlLogic` of IF steps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionLogic {
    #[serde(default)]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopMode {
    #[default]
    Count,
    Foreach,
    While,
}

impl LoopMode {
    /// Unknown modes fall back to a counted loop.
    pub fn parse(mode: &str) -> Self {
        match mode.trim().to_ascii_lowercase().as_str() {
            "foreach" => LoopMode::Foreach,
            "while" => LoopMode::While,
            _ => LoopMode::Count,
        }
    }
}

/// `controlLogic` of LOOP steps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopLogic {
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub count: Option<u64>,
    #[serde(default)]
    pub iterable_var: Option<String>,
    #[serde(default)]
    pub item_var: Option<String>,
    #[serde(default)]
    pub index_var: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub max_iterations: Option<u64>,
}

impl LoopLogic {
    pub fn mode(&self) -> LoopMode {
        self.mode.as_deref().map(LoopMode::parse).unwrap_or_default()
    }
}

/// `controlLogic` of WAIT steps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitLogic {
    #[serde(default, deserialize_with = "lenient_u64")]
    pub wait_ms: Option<u64>,
}

/// `controlLogic` of SCRIPT steps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptLogic {
    #[serde(default)]
    pub script: Option<String>,
}

/// Numbers stored by editors arrive as either JSON numbers or strings.
fn lenient_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        _ => None,
    })
}

/// Step-level overrides applied on top of a referenced test case.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataOverrides {
    #[serde(default)]
    pub enabled: Option<Value>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    /// Either an object merged over the case headers or a JSON string
    /// replacing them.
    #[serde(default)]
    pub headers: Option<Value>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub params: Option<serde_json::Map<String, Value>>,
    #[serde(default)]
    pub setup_script: Option<String>,
    #[serde(default)]
    pub assertion_script: Option<String>,
    #[serde(default)]
    pub extract: Vec<ExtractRule>,
    #[serde(default)]
    pub visual_assertions: Vec<VisualAssertion>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExtractKind {
    #[default]
    #[serde(rename = "JSON", alias = "JSON_PATH", alias = "json", alias = "jsonPath")]
    Json,
    #[serde(rename = "REGEX", alias = "regex")]
    Regex,
    #[serde(rename = "HEADER", alias = "header")]
    Header,
}

/// Variable extraction rule evaluated against a case result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractRule {
    pub var_name: String,
    #[serde(rename = "type", default)]
    pub kind: ExtractKind,
    #[serde(default)]
    pub expression: Option<String>,
    #[serde(default)]
    pub json_path: Option<String>,
    /// Capture group for REGEX rules.
    #[serde(default)]
    pub group: Option<usize>,
}

impl ExtractRule {
    pub fn expression(&self) -> &str {
        self.expression
            .as_deref()
            .or(self.json_path.as_deref())
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssertionSource {
    StatusCode,
    ResponseHeader,
    #[default]
    JsonBody,
}

impl fmt::Display for AssertionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AssertionSource::StatusCode => "STATUS_CODE",
            AssertionSource::ResponseHeader => "RESPONSE_HEADER",
            AssertionSource::JsonBody => "JSON_BODY",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssertionOperator {
    #[default]
    Equals,
    NotEquals,
    Contains,
    NotContains,
    Exists,
    NotExists,
    GreaterThan,
    LessThan,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for AssertionOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AssertionOperator::Equals => "EQUALS",
            AssertionOperator::NotEquals => "NOT_EQUALS",
            AssertionOperator::Contains => "CONTAINS",
            AssertionOperator::NotContains => "NOT_CONTAINS",
            AssertionOperator::Exists => "EXISTS",
            AssertionOperator::NotExists => "NOT_EXISTS",
            AssertionOperator::GreaterThan => "GREATER_THAN",
            AssertionOperator::LessThan => "LESS_THAN",
            AssertionOperator::Unknown => "UNKNOWN",
        })
    }
}

/// Inline assertion configured on a CASE step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisualAssertion {
    #[serde(default)]
    pub source: AssertionSource,
    #[serde(default)]
    pub property: String,
    #[serde(default)]
    pub operator: AssertionOperator,
    #[serde(default)]
    pub expected: Value,
}

impl VisualAssertion {
    pub fn expected_text(&self) -> String {
        match &self.expected {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// HTTP test case referenced by CASE steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: CaseId,
    #[serde(default)]
    pub module_id: Option<i64>,
    pub name: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub setup_script: Option<String>,
    #[serde(default)]
    pub assertion_script: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StepStatus {
    Pass,
    Fail,
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StepStatus::Pass => "PASS",
            StepStatus::Fail => "FAIL",
            StepStatus::Skipped => "SKIPPED",
        })
    }
}

/// Outcome of one executed CASE or SCRIPT step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Step id once recorded by an invoker; the case id when produced
    /// directly by a case executor.
    pub step_id: i64,
    pub name: String,
    pub status: StepStatus,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub http_status_code: Option<u16>,
    #[serde(default)]
    pub response_body: Option<String>,
    #[serde(default)]
    pub response_headers: HashMap<String, String>,
    #[serde(default)]
    pub request_url: Option<String>,
    #[serde(default)]
    pub request_method: Option<String>,
    #[serde(default)]
    pub request_body: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl StepResult {
    pub fn new(step_id: i64, name: impl Into<String>, status: StepStatus) -> Self {
        Self {
            step_id,
            name: name.into(),
            status,
            message: None,
            detail: None,
            http_status_code: None,
            response_body: None,
            response_headers: HashMap::new(),
            request_url: None,
            request_method: None,
            request_body: None,
            duration_ms: 0,
        }
    }

    pub fn pass(step_id: i64, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(step_id, name, StepStatus::Pass).with_message(message)
    }

    pub fn fail(step_id: i64, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(step_id, name, StepStatus::Fail).with_message(message)
    }

    pub fn skipped(step_id: i64, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(step_id, name, StepStatus::Skipped).with_message(message)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn is_pass(&self) -> bool {
        self.status == StepStatus::Pass
    }

    pub fn is_fail(&self) -> bool {
        self.status == StepStatus::Fail
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.response_headers
            .get(name)
            .or_else(|| {
                self.response_headers
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(name))
                    .map(|(_, v)| v)
            })
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Running,
    Pass,
    Fail,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Pass => "PASS",
            RunStatus::Fail => "FAIL",
        })
    }
}

/// Summary of one top-level scenario run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    #[serde(default)]
    pub id: Option<RecordId>,
    pub scenario_id: ScenarioId,
    pub scenario_name: String,
    pub env_key: String,
    pub status: RunStatus,
    pub total_steps: usize,
    pub passed_steps: usize,
    pub failed_steps: usize,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    pub fn start(scenario: &ScenarioDefinition, env_key: &str) -> Self {
        Self {
            id: None,
            scenario_id: scenario.id,
            scenario_name: scenario.name.clone(),
            env_key: env_key.to_string(),
            status: RunStatus::Running,
            total_steps: 0,
            passed_steps: 0,
            failed_steps: 0,
            duration_ms: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Fill in counts and the final status from the run's results.
    pub fn finish(&mut self, results: &[StepResult], duration_ms: u64, force_fail: bool) {
        self.total_steps = results.len();
        self.passed_steps = results.iter().filter(|r| r.is_pass()).count();
        self.failed_steps = results.iter().filter(|r| r.is_fail()).count();
        self.duration_ms = Some(duration_ms);
        self.completed_at = Some(Utc::now());
        self.status = if force_fail || self.failed_steps > 0 {
            RunStatus::Fail
        } else {
            RunStatus::Pass
        };
    }

    pub fn abort(&mut self) {
        self.status = RunStatus::Fail;
        self.completed_at = Some(Utc::now());
    }
}

/// Per-step row persisted alongside an [`ExecutionRecord`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecutionLog {
    pub record_id: RecordId,
    pub step_id: StepId,
    pub step_name: String,
    pub step_kind: StepKind,
    pub status: StepStatus,
    pub request_url: Option<String>,
    pub request_method: Option<String>,
    pub request_body: Option<String>,
    pub response_code: Option<u16>,
    pub response_headers: Option<String>,
    pub response_body: Option<String>,
    pub duration_ms: u64,
    pub error_message: Option<String>,
    pub executed_at: DateTime<Utc>,
}

impl StepExecutionLog {
    pub fn from_result(record_id: RecordId, step: &StepNode, result: &StepResult) -> Self {
        let response_headers = if result.response_headers.is_empty() {
            None
        } else {
            serde_json::to_string(&result.response_headers).ok()
        };
        Self {
            record_id,
            step_id: step.id,
            step_name: result.name.clone(),
            step_kind: step.kind,
            status: result.status,
            request_url: result.request_url.clone(),
            request_method: result.request_method.clone(),
            request_body: result.request_body.clone(),
            response_code: result.http_status_code,
            response_headers,
            response_body: result.response_body.clone(),
            duration_ms: result.duration_ms,
            error_message: result.detail.clone().or_else(|| {
                if result.is_fail() {
                    result.message.clone()
                } else {
                    None
                }
            }),
            executed_at: Utc::now(),
        }
    }
}
