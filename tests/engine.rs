use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use scenario_engine::error::CIRCULAR_REFERENCE_MESSAGE;
use scenario_engine::resolver::expand_variables;
use scenario_engine::{
    CaseExecutor, CaseId, Catalog, CelScriptEvaluator, EngineConfig, EngineError, EventType,
    ExecutionContext, ExecutionEvent, HttpCaseExecutor, InMemoryStore, MemoryHistory,
    ProgressObserver, RunStatus, ScenarioEngine, ScenarioId, ScriptEvaluator, StepId, StepResult,
    StepStatus, TestCase, Variables,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// Case executor that answers from canned bodies and remembers every
/// request it would have sent. Like the HTTP executor it runs the setup
/// script first and then expands `${name}` references.
#[derive(Default)]
struct MockExecutor {
    calls: Mutex<Vec<TestCase>>,
    bodies: HashMap<CaseId, String>,
}

impl MockExecutor {
    fn respond(mut self, case_id: CaseId, body: &str) -> Self {
        self.bodies.insert(case_id, body.to_string());
        self
    }

    fn calls(&self) -> Vec<TestCase> {
        self.calls.lock().unwrap().clone()
    }

    fn urls(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.url).collect()
    }
}

#[async_trait]
impl CaseExecutor for MockExecutor {
    async fn execute_case(
        &self,
        case: &TestCase,
        vars: &mut Variables,
        _history: &HashMap<StepId, StepResult>,
    ) -> anyhow::Result<StepResult> {
        if let Some(setup) = case.setup_script.as_deref() {
            CelScriptEvaluator.eval(setup, vars)?;
        }
        let mut case = case.clone();
        case.url = expand_variables(&case.url, vars);
        for value in case.headers.values_mut() {
            *value = expand_variables(value, vars);
        }
        case.body = case.body.as_deref().map(|b| expand_variables(b, vars));
        self.calls.lock().unwrap().push(case.clone());
        if case.name == "Explode" {
            return Err(anyhow!("boom"));
        }
        let mut result = if case.name == "Broken" {
            let mut r = StepResult::fail(case.id, &case.name, "Unexpected status 500");
            r.http_status_code = Some(500);
            r
        } else {
            let mut r = StepResult::pass(case.id, &case.name, "HTTP 200");
            r.http_status_code = Some(200);
            r
        };
        result.request_url = Some(case.url.clone());
        result.request_method = Some(case.method.clone());
        result.response_body = Some(
            self.bodies
                .get(&case.id)
                .cloned()
                .unwrap_or_else(|| "{}".to_string()),
        );
        Ok(result)
    }
}

const CASES: &str = r#"
cases:
  - id: 1
    name: Login
    method: POST
    url: /login
  - id: 2
    name: GetProfile
    url: /profile
    headers:
      Authorization: "Bearer {{Login.response.body.data.token}}"
  - id: 3
    name: Broken
    url: /broken
  - id: 4
    name: Explode
    url: /explode
  - id: 5
    name: Item
    url: "/items/${loopIndex}"
  - id: 6
    name: User
    url: "/users/${user}"
  - id: 7
    name: Page
    url: "/pages/${page}"
"#;

struct Harness {
    engine: Arc<ScenarioEngine>,
    executor: Arc<MockExecutor>,
    history: Arc<MemoryHistory>,
}

impl Harness {
    fn new(scenarios: &str) -> Self {
        Self::build(scenarios, MockExecutor::default(), EngineConfig::default())
    }

    fn build(scenarios: &str, executor: MockExecutor, config: EngineConfig) -> Self {
        let catalog = Catalog::from_yaml(&format!("{CASES}\n{scenarios}"))
            .unwrap_or_else(|e| panic!("invalid catalog: {e:#}"));
        let executor = Arc::new(executor);
        let history = Arc::new(MemoryHistory::new());
        let engine = ScenarioEngine::builder()
            .store(Arc::new(InMemoryStore::new(catalog)))
            .executor(executor.clone())
            .history(history.clone())
            .config(config)
            .build()
            .expect("engine should build");
        Self {
            engine: Arc::new(engine),
            executor,
            history,
        }
    }

    async fn run(&self, scenario_id: ScenarioId) -> (Vec<StepResult>, Vec<ExecutionEvent>) {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let observer: &dyn ProgressObserver = &tx;
        let results = self
            .engine
            .execute_scenario(scenario_id, "dev", Some(observer))
            .await
            .unwrap_or_else(|e| panic!("run failed: {e}"));
        drop(tx);
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        (results, events)
    }
}

fn names(results: &[StepResult]) -> Vec<&str> {
    results.iter().map(|r| r.name.as_str()).collect()
}

fn final_vars(events: &[ExecutionEvent]) -> &Variables {
    let last = events.last().expect("no events");
    assert_eq!(last.event_type, EventType::ScenarioComplete);
    &last.variables
}

#[tokio::test]
async fn test_only_visited_leaves_produce_results() {
    let h = Harness::new(
        r#"
scenarios:
  - id: 1
    name: branches
    steps:
      - {id: 10, type: GROUP, name: group, order_index: 1}
      - {id: 11, parent_id: 10, type: CASE, name: login, order_index: 1, reference_case_id: 1}
      - {id: 12, parent_id: 10, type: IF, name: never, order_index: 2, control_logic: {condition: "1 == 2"}}
      - {id: 13, parent_id: 12, type: CASE, name: hidden, reference_case_id: 2}
      - {id: 14, parent_id: 10, type: SCRIPT, name: script, order_index: 3, control_logic: {script: "x = 1"}}
      - {id: 15, type: IF, name: always, order_index: 2, control_logic: {condition: "true"}}
      - {id: 16, parent_id: 15, type: CASE, name: profile, reference_case_id: 2}
"#,
    );

    let (results, _) = h.run(1).await;
    assert_eq!(names(&results), vec!["login", "script", "profile"]);
    assert!(results.iter().all(StepResult::is_pass));
    assert_eq!(h.executor.urls(), vec!["/login", "/profile"]);
}

#[tokio::test]
async fn test_conditional_scope_keeps_parent_values() {
    let h = Harness::new(
        r#"
variables:
  - key: a
    value: 1
scenarios:
  - id: 1
    name: merge
    steps:
      - {id: 1, type: IF, name: branch, control_logic: {condition: ""}}
      - {id: 2, parent_id: 1, type: SCRIPT, name: assign, control_logic: {script: "a = 2; b = 3"}}
"#,
    );

    let (results, events) = h.run(1).await;
    assert_eq!(results.len(), 1);
    let vars = final_vars(&events);
    assert_eq!(vars["a"], json!(1));
    assert_eq!(vars["b"], json!(3));
}

#[tokio::test]
async fn test_count_loop_runs_children_per_iteration() {
    let h = Harness::new(
        r#"
scenarios:
  - id: 1
    name: counted
    steps:
      - {id: 1, type: LOOP, name: loop, control_logic: {mode: count, count: 3}}
      - {id: 2, parent_id: 1, type: CASE, name: item, order_index: 1, reference_case_id: 5}
      - {id: 3, parent_id: 1, type: SCRIPT, name: remember, order_index: 2, control_logic: {script: "first = loopIndex"}}
"#,
    );

    let (results, events) = h.run(1).await;
    assert_eq!(results.len(), 6);
    assert_eq!(h.executor.urls(), vec!["/items/0", "/items/1", "/items/2"]);
    // only the first iteration's value reaches the outer scope
    assert_eq!(final_vars(&events)["first"].as_u64(), Some(0));
}

#[tokio::test]
async fn test_while_loop_stops_at_max_iterations() {
    let h = Harness::new(
        r#"
scenarios:
  - id: 1
    name: spinning
    steps:
      - {id: 1, type: LOOP, name: spin, control_logic: {mode: while, condition: "true", maxIterations: 5}}
      - {id: 2, parent_id: 1, type: SCRIPT, name: tick, control_logic: {script: "ticks = loopIteration"}}
      - {id: 3, type: LOOP, name: idle, control_logic: {mode: WHILE, condition: "1 == 2"}}
      - {id: 4, parent_id: 3, type: SCRIPT, name: never, control_logic: {script: "x = 1"}}
"#,
    );

    let (results, _) = h.run(1).await;
    assert_eq!(results.len(), 5);
    assert!(results.iter().all(|r| r.name == "tick"));
}

#[tokio::test]
async fn test_foreach_binds_each_item() {
    let h = Harness::new(
        r#"
variables:
  - key: users
    value: ["u1", "u2"]
  - key: host
    value: example.com
  - key: retries
    value: 3
scenarios:
  - id: 1
    name: each
    steps:
      - {id: 1, type: LOOP, name: each, control_logic: {mode: foreach, iterableVar: users, itemVar: user}}
      - {id: 2, parent_id: 1, type: CASE, name: fetch, reference_case_id: 6}
      - {id: 3, type: LOOP, name: not-a-list, control_logic: {mode: foreach, iterableVar: host}}
      - {id: 4, parent_id: 3, type: CASE, name: never, reference_case_id: 6}
      - {id: 5, type: LOOP, name: a-number, control_logic: {mode: foreach, iterableVar: retries}}
      - {id: 6, parent_id: 5, type: CASE, name: never, reference_case_id: 6}
      - {id: 7, type: LOOP, name: missing, control_logic: {mode: foreach, iterableVar: nowhere}}
      - {id: 8, parent_id: 7, type: CASE, name: never, reference_case_id: 6}
      - {id: 9, type: SCRIPT, name: after, control_logic: {script: "done = true"}}
"#,
    );

    let (results, _) = h.run(1).await;
    assert_eq!(names(&results), vec!["fetch", "fetch", "after"]);
    assert_eq!(h.executor.urls(), vec!["/users/u1", "/users/u2"]);
}

#[tokio::test]
async fn test_extracted_token_flows_into_later_headers() {
    let executor = MockExecutor::default().respond(1, r#"{"data":{"token":"t-1"}}"#);
    let h = Harness::build(
        r#"
scenarios:
  - id: 1
    name: login-flow
    steps:
      - id: 1
        type: CASE
        name: Login
        order_index: 1
        reference_case_id: 1
        data_overrides:
          extract:
            - {varName: token, type: JSON, expression: "$.data.token"}
      - id: 2
        type: CASE
        name: Profile
        order_index: 2
        reference_case_id: 2
        data_overrides:
          headers: {X-Token: "${token}"}
"#,
        executor,
        EngineConfig::default(),
    );

    let (results, events) = h.run(1).await;
    assert_eq!(names(&results), vec!["Login", "Profile"]);
    let calls = h.executor.calls();
    assert_eq!(calls[1].headers["Authorization"], "Bearer t-1");
    assert_eq!(calls[1].headers["X-Token"], "t-1");
    assert_eq!(final_vars(&events)["token"], json!("t-1"));
}

#[tokio::test]
async fn test_params_are_exported_to_scope() {
    let h = Harness::new(
        r#"
scenarios:
  - id: 1
    name: paging
    steps:
      - {id: 1, type: CASE, name: page, reference_case_id: 7, data_overrides: {params: {page: 7}}}
"#,
    );

    let (_, events) = h.run(1).await;
    assert_eq!(h.executor.urls(), vec!["/pages/7"]);
    assert_eq!(final_vars(&events)["page"], json!(7));
}

#[tokio::test]
async fn test_self_reference_fails_once() {
    let h = Harness::new(
        r#"
scenarios:
  - id: 1
    name: self
    steps:
      - {id: 1, type: SCENARIO, name: again, reference_scenario_id: 1}
"#,
    );

    let (results, _) = h.run(1).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, StepStatus::Fail);
    assert_eq!(results[0].message.as_deref(), Some(CIRCULAR_REFERENCE_MESSAGE));
}

#[tokio::test]
async fn test_indirect_cycle_is_caught_in_nested_scenario() {
    let h = Harness::new(
        r#"
scenarios:
  - id: 2
    name: a
    steps:
      - {id: 20, type: SCENARIO, name: to-b, reference_scenario_id: 3}
  - id: 3
    name: b
    steps:
      - {id: 30, type: SCRIPT, name: in-b, order_index: 1, control_logic: {script: "x = 1"}}
      - {id: 31, type: SCENARIO, name: back-to-a, order_index: 2, reference_scenario_id: 2}
"#,
    );

    let (results, _) = h.run(2).await;
    assert_eq!(names(&results), vec!["in-b", "back-to-a"]);
    assert!(results[0].is_pass());
    assert_eq!(results[1].message.as_deref(), Some(CIRCULAR_REFERENCE_MESSAGE));
}

#[tokio::test]
async fn test_nested_scenario_shares_history_and_variables() {
    let executor = MockExecutor::default().respond(1, r#"{"data":{"token":"t-9"}}"#);
    let h = Harness::build(
        r#"
scenarios:
  - id: 1
    name: outer
    steps:
      - {id: 1, type: SCENARIO, name: auth, order_index: 1, reference_scenario_id: 2}
      - {id: 2, type: CASE, name: Profile, order_index: 2, reference_case_id: 2, data_overrides: {headers: {X-Token: "${token}"}}}
  - id: 2
    name: login
    steps:
      - id: 10
        type: CASE
        name: Login
        reference_case_id: 1
        data_overrides:
          extract:
            - {varName: token, expression: "$.data.token"}
"#,
        executor,
        EngineConfig::default(),
    );

    let (results, _) = h.run(1).await;
    assert_eq!(names(&results), vec!["Login", "Profile"]);
    let calls = h.executor.calls();
    assert_eq!(calls[1].headers["Authorization"], "Bearer t-9");
    assert_eq!(calls[1].headers["X-Token"], "t-9");

    // nested steps are logged against the top-level record
    let logged: Vec<StepId> = h.history.logs().iter().map(|l| l.step_id).collect();
    assert_eq!(logged, vec![10, 2]);
    assert_eq!(h.history.records().len(), 1);
}

#[tokio::test]
async fn test_nesting_depth_is_bounded() {
    let config = EngineConfig {
        max_nesting_depth: 2,
        ..EngineConfig::default()
    };
    let h = Harness::build(
        r#"
scenarios:
  - id: 1
    name: one
    steps:
      - {id: 1, type: SCENARIO, name: to-two, reference_scenario_id: 2}
  - id: 2
    name: two
    steps:
      - {id: 2, type: SCENARIO, name: to-three, reference_scenario_id: 3}
  - id: 3
    name: three
    steps:
      - {id: 3, type: SCRIPT, name: deep, control_logic: {script: "x = 1"}}
"#,
        MockExecutor::default(),
        config,
    );

    let (results, _) = h.run(1).await;
    assert_eq!(names(&results), vec!["to-three"]);
    assert!(results[0]
        .message
        .as_deref()
        .unwrap_or_default()
        .starts_with("Execution Error: Scenario nesting exceeds the maximum depth of 2"));
}

#[tokio::test]
async fn test_scope_depth_restored_after_nested_run() {
    let h = Harness::new(
        r#"
scenarios:
  - id: 1
    name: mixed
    steps:
      - {id: 1, type: LOOP, name: loop, order_index: 1, control_logic: {count: 2}}
      - {id: 2, parent_id: 1, type: IF, name: inner, control_logic: {condition: "true"}}
      - {id: 3, parent_id: 2, type: SCENARIO, name: nested, reference_scenario_id: 2}
      - {id: 4, type: SCENARIO, name: cycle, order_index: 2, reference_scenario_id: 1}
  - id: 2
    name: leaf
    steps:
      - {id: 20, type: SCRIPT, name: leaf-script, control_logic: {script: "y = 2"}}
"#,
    );

    let mut ctx = ExecutionContext::new("dev");
    let results = h
        .engine
        .execute_nested(1, "dev", None, &mut ctx)
        .await
        .unwrap();
    assert_eq!(names(&results), vec!["leaf-script", "leaf-script", "cycle"]);
    assert_eq!(ctx.scopes.depth(), 1);
    assert!(ctx.executing_scenarios().is_empty());
    assert_eq!(ctx.scopes.get("y"), Some(&json!(2)));
}

#[tokio::test]
async fn test_disabled_steps_are_invisible() {
    let h = Harness::new(
        r#"
scenarios:
  - id: 1
    name: toggles
    steps:
      - {id: 1, type: GROUP, name: off, order_index: 1, data_overrides: {enabled: false}}
      - {id: 2, parent_id: 1, type: CASE, name: hidden, reference_case_id: 1}
      - {id: 3, type: CASE, name: on, order_index: 2, reference_case_id: 1, data_overrides: {enabled: true}}
"#,
    );

    let (results, events) = h.run(1).await;
    assert_eq!(names(&results), vec!["on"]);
    assert!(events
        .iter()
        .all(|e| !matches!(e.step_id, Some(1) | Some(2))));
}

#[tokio::test]
async fn test_events_arrive_in_execution_order() {
    let h = Harness::new(
        r#"
scenarios:
  - id: 1
    name: ordered
    steps:
      - {id: 1, type: CASE, name: login, order_index: 1, reference_case_id: 1}
      - {id: 2, type: WAIT, name: pause, order_index: 2, control_logic: {waitMs: 1}}
      - {id: 3, type: GROUP, name: empty, order_index: 3}
"#,
    );

    let (_, events) = h.run(1).await;
    let seen: Vec<(EventType, Option<StepId>)> =
        events.iter().map(|e| (e.event_type, e.step_id)).collect();
    assert_eq!(
        seen,
        vec![
            (EventType::ScenarioStart, None),
            (EventType::StepStart, Some(1)),
            (EventType::StepComplete, Some(1)),
            (EventType::StepStart, Some(2)),
            (EventType::StepComplete, Some(2)),
            (EventType::StepStart, Some(3)),
            (EventType::ScenarioComplete, None),
        ]
    );
    assert_eq!(events[0].step_name.as_deref(), Some("ordered"));
    assert!(events[2].result.is_some());
    assert_eq!(events[6].status.as_deref(), Some("PASS"));
}

#[tokio::test]
async fn test_step_failures_do_not_stop_the_run() {
    let h = Harness::new(
        r#"
scenarios:
  - id: 1
    name: failing
    steps:
      - {id: 1, type: CASE, name: broken, order_index: 1, reference_case_id: 3}
      - {id: 2, type: CASE, name: explode, order_index: 2, reference_case_id: 4}
      - {id: 3, type: CASE, name: missing, order_index: 3, reference_case_id: 99}
      - {id: 4, type: SCRIPT, name: bad-script, order_index: 4, control_logic: {script: "no_such_fn(1)"}}
      - {id: 5, type: CASE, name: checked, order_index: 5, reference_case_id: 1, data_overrides: {visualAssertions: [{source: STATUS_CODE, operator: EQUALS, expected: 201}]}}
      - {id: 6, type: SCRIPT, name: ok, order_index: 6, control_logic: {script: "done = true"}}
"#,
    );

    let (results, _) = h.run(1).await;
    let statuses: Vec<StepStatus> = results.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![
            StepStatus::Fail,
            StepStatus::Fail,
            StepStatus::Fail,
            StepStatus::Fail,
            StepStatus::Fail,
            StepStatus::Pass
        ]
    );
    assert_eq!(results[1].message.as_deref(), Some("Execution Error: boom"));
    assert_eq!(results[2].message.as_deref(), Some("Test case not found: 99"));
    assert!(results[3]
        .message
        .as_deref()
        .unwrap_or_default()
        .starts_with("Script execution error:"));
    assert!(results[4]
        .detail
        .as_deref()
        .unwrap_or_default()
        .contains("Visual Assertion Failures:\n- [STATUS_CODE] "));

    let records = h.history.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, RunStatus::Fail);
    assert_eq!(records[0].total_steps, 6);
    assert_eq!(records[0].passed_steps, 1);
    assert_eq!(records[0].failed_steps, 5);
    assert_eq!(h.history.logs_for(records[0].id.unwrap()).len(), 6);
}

#[tokio::test]
async fn test_passing_run_is_recorded_as_pass() {
    let h = Harness::new(
        r#"
scenarios:
  - id: 1
    name: green
    steps:
      - {id: 1, type: CASE, name: login, reference_case_id: 1}
"#,
    );

    h.run(1).await;
    let records = h.history.records();
    assert_eq!(records[0].status, RunStatus::Pass);
    assert_eq!(records[0].scenario_name, "green");
    assert_eq!(records[0].env_key, "dev");
    assert!(records[0].completed_at.is_some());
}

#[tokio::test]
async fn test_unknown_scenario_is_an_error() {
    let h = Harness::new("scenarios: []");
    let err = h.engine.execute_scenario(42, "dev", None).await.unwrap_err();
    assert!(matches!(err, EngineError::ScenarioNotFound(42)));
    assert!(h.history.records().is_empty());
}

#[tokio::test]
async fn test_cancelled_run_skips_remaining_leaves() {
    let h = Harness::new(
        r#"
scenarios:
  - id: 1
    name: cancelled
    steps:
      - {id: 1, type: CASE, name: login, order_index: 1, reference_case_id: 1}
      - {id: 2, type: GROUP, name: group, order_index: 2}
      - {id: 3, parent_id: 2, type: SCRIPT, name: script, control_logic: {script: "x = 1"}}
      - {id: 4, type: IF, name: branch, order_index: 3}
      - {id: 5, parent_id: 4, type: CASE, name: unreached, reference_case_id: 1}
"#,
    );

    let token = CancellationToken::new();
    token.cancel();
    let results = h
        .engine
        .execute_with_cancel(1, "dev", None, token)
        .await
        .unwrap();

    assert_eq!(names(&results), vec!["login", "script"]);
    assert!(results.iter().all(|r| r.status == StepStatus::Skipped));
    assert!(h.executor.calls().is_empty());
    assert_eq!(h.history.records()[0].status, RunStatus::Fail);
}

#[tokio::test]
async fn test_cancel_wakes_a_waiting_run() {
    let h = Harness::new(
        r#"
scenarios:
  - id: 1
    name: sleepy
    steps:
      - {id: 1, type: WAIT, name: long, order_index: 1, control_logic: {waitMs: 60000}}
      - {id: 2, type: CASE, name: after, order_index: 2, reference_case_id: 1}
"#,
    );

    let token = CancellationToken::new();
    let handle = h.engine.spawn_scenario(1, "dev", None, token.clone());
    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    let results = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("run should stop after cancellation")
        .expect("task should not panic")
        .expect("run should succeed");
    assert_eq!(names(&results), vec!["after"]);
    assert_eq!(results[0].status, StepStatus::Skipped);
}

#[tokio::test]
async fn test_run_timeout_stops_the_run() {
    let config = EngineConfig {
        run_timeout_secs: Some(1),
        ..EngineConfig::default()
    };
    let h = Harness::build(
        r#"
scenarios:
  - id: 1
    name: slow
    steps:
      - {id: 1, type: WAIT, name: long, order_index: 1, control_logic: {waitMs: 60000}}
      - {id: 2, type: SCRIPT, name: after, order_index: 2, control_logic: {script: "x = 1"}}
"#,
        MockExecutor::default(),
        config,
    );

    let results = tokio::time::timeout(Duration::from_secs(10), h.engine.execute_scenario(1, "dev", None))
        .await
        .expect("deadline should end the run")
        .unwrap();
    assert_eq!(results[0].status, StepStatus::Skipped);
    assert_eq!(h.history.records()[0].status, RunStatus::Fail);
}

#[tokio::test]
async fn test_setup_script_reassignment_reaches_the_request() {
    let catalog = Catalog::from_yaml(
        r#"
variables:
  - key: sig
    value: old
cases:
  - id: 1
    name: Signed
    url: "/x?sig=${sig}"
    setup_script: 'sig = "new"'
scenarios:
  - id: 1
    name: signed
    steps:
      - {id: 1, type: CASE, name: signed, reference_case_id: 1}
"#,
    )
    .unwrap();
    // Nothing listens on port 1, so the request fails after the URL is built.
    let engine = ScenarioEngine::builder()
        .store(Arc::new(InMemoryStore::new(catalog)))
        .executor(Arc::new(
            HttpCaseExecutor::new().with_base_url("http://127.0.0.1:1"),
        ))
        .build()
        .unwrap();

    let results = engine.execute_scenario(1, "dev", None).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(
        results[0].request_url.as_deref(),
        Some("http://127.0.0.1:1/x?sig=new")
    );
}

#[tokio::test]
async fn test_string_encoded_overrides_can_disable_a_step() {
    let h = Harness::new(
        r#"
scenarios:
  - id: 1
    name: encoded
    steps:
      - {id: 1, type: CASE, name: off, order_index: 1, reference_case_id: 1, data_overrides: '{"enabled": false, "url": "/overridden"}'}
      - {id: 2, type: CASE, name: numeric-on, order_index: 2, reference_case_id: 1, data_overrides: {enabled: 1}}
      - {id: 3, type: CASE, name: numeric-off, order_index: 3, reference_case_id: 1, data_overrides: {enabled: 0}}
"#,
    );

    let (results, _) = h.run(1).await;
    assert_eq!(names(&results), vec!["numeric-on"]);
    assert_eq!(h.executor.urls(), vec!["/login"]);
}

#[tokio::test]
async fn test_failing_conditions_count_as_false() {
    let h = Harness::new(
        r#"
scenarios:
  - id: 1
    name: fail-safe
    steps:
      - {id: 1, type: IF, name: broken-if, order_index: 1, control_logic: {condition: "undefined_var > 1"}}
      - {id: 2, parent_id: 1, type: CASE, name: hidden, reference_case_id: 1}
      - {id: 3, type: LOOP, name: broken-while, order_index: 2, control_logic: {mode: while, condition: "undefined_var > 1"}}
      - {id: 4, parent_id: 3, type: SCRIPT, name: never, control_logic: {script: "x = 1"}}
      - {id: 5, type: SCRIPT, name: after, order_index: 3, control_logic: {script: "done = true"}}
"#,
    );

    let (results, events) = h.run(1).await;
    assert_eq!(names(&results), vec!["after"]);
    assert!(h.executor.calls().is_empty());
    assert_eq!(final_vars(&events)["done"], json!(true));
}

#[tokio::test]
async fn test_script_steps_are_indexed_by_name() {
    let h = Harness::new(
        r#"
scenarios:
  - id: 1
    name: indexed
    steps:
      - {id: 7, type: SCRIPT, name: prepare, control_logic: {script: "x = 1"}}
"#,
    );

    let mut ctx = ExecutionContext::new("dev");
    h.engine
        .execute_nested(1, "dev", None, &mut ctx)
        .await
        .unwrap();
    assert_eq!(ctx.step_id_for("prepare"), Some(7));
    assert_eq!(
        ctx.result_by_name("prepare").map(|r| r.status),
        Some(StepStatus::Pass)
    );
}
