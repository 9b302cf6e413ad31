//! Hierarchical API test scenario execution engine.
//!
//! A scenario is a tree of steps (CASE, GROUP, IF, LOOP, WAIT, SCRIPT,
//! SCENARIO). [`ScenarioEngine`] walks the tree, runs HTTP test cases,
//! threads variables through nested scopes and records one
//! [`StepResult`] per executed case or script.

pub mod api_client;
pub mod assertion;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod expression;
pub mod history;
pub mod http;
pub mod invoker;
pub mod jsonpath;
pub mod model;
pub mod resolver;
pub mod scope;
pub mod store;

pub use config::*;
pub use context::ExecutionContext;
pub use engine::{ScenarioEngine, ScenarioEngineBuilder};
pub use error::{EngineError, EngineResult};
pub use events::{EventType, ExecutionEvent, LogObserver, ProgressObserver};
pub use expression::{CelScriptEvaluator, ScriptEvaluator};
pub use history::{FanoutHistory, HistorySink, MemoryHistory, ReportDirHistory, ReportFormat};
pub use http::{CaseExecutor, HttpCaseExecutor};
pub use invoker::{InvokerRegistry, StepInvoker};
pub use model::*;
pub use scope::{ScopeStack, Variables};
pub use store::{CaseStore, Catalog, InMemoryStore, ScenarioStore, VariableProvider};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
