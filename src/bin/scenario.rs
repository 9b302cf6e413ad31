//! Scenario runner CLI - executes scenario trees from YAML catalogs.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use scenario_engine::{
    api_client::HistoryApiClient, CatalogLoader, EngineConfig, FanoutHistory, HistorySink,
    InMemoryStore, LogObserver, ProgressObserver, ReportDirHistory, ReportFormat, ScenarioEngine,
    ScenarioId, StepResult, StepStatus,
};
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// Runs hierarchical API test scenarios.
#[derive(Parser, Debug)]
#[command(name = "scenario", version, about)]
struct Cli {
    /// Catalog file or directory.
    #[arg(short = 'c', long = "catalog")]
    catalog: PathBuf,

    /// Scenario id to run; repeatable. Runs every scenario when omitted.
    #[arg(short = 's', long = "scenario")]
    scenarios: Vec<ScenarioId>,

    /// Environment key used for variable inheritance.
    #[arg(short = 'e', long = "env", default_value = "dev")]
    env: String,

    /// Engine settings file (YAML).
    #[arg(long = "config")]
    config: Option<PathBuf>,

    /// Base URL joined with relative case URLs.
    #[arg(short = 'b', long = "base-url")]
    base_url: Option<String>,

    /// HTTP timeout in seconds per request.
    #[arg(short = 't', long = "timeout")]
    timeout: Option<u64>,

    /// Wall-clock limit in seconds for each scenario run.
    #[arg(long = "run-timeout")]
    run_timeout: Option<u64>,

    /// Directory to save run reports.
    #[arg(short = 'r', long = "report-dir")]
    report_dir: Option<PathBuf>,

    /// Report output format.
    #[arg(long = "report-format", value_enum, default_value = "json")]
    report_format: ReportFormat,

    /// Log progress events as they happen.
    #[arg(long = "events")]
    events: bool,

    /// Enable verbose logging.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Execution history API for submitting run records.
    #[arg(long = "history-api-url", env = "SCENARIO_HISTORY_API_URL")]
    history_api_url: Option<String>,

    /// API key for the execution history API.
    #[arg(long = "history-api-key", env = "SCENARIO_HISTORY_API_KEY")]
    history_api_key: Option<String>,
}

fn init_tracing(verbose: bool) {
    if std::env::var_os("RUST_LOG").is_none() {
        let level = if verbose { "debug" } else { "info" };
        std::env::set_var("RUST_LOG", level);
    }

    if tracing::dispatcher::has_been_set() {
        return;
    }

    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .try_init();
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...(truncated)", &text[..idx]),
        None => text.to_string(),
    }
}

fn print_results(name: &str, results: &[StepResult], duration_ms: u128, verbose: bool) -> bool {
    // Cancelled runs leave skipped steps behind and count as failed.
    let success = !results.iter().any(|r| {
        r.is_fail() || (r.status == StepStatus::Skipped && r.message.as_deref() == Some("Cancelled"))
    });
    let status = if success {
        "\x1b[32mPASS\x1b[0m"
    } else {
        "\x1b[31mFAIL\x1b[0m"
    };
    info!("{} scenario: {} ({} ms)", status, name, duration_ms);

    for (i, result) in results.iter().enumerate() {
        let mark = match result.status {
            StepStatus::Pass => "\x1b[32m✓\x1b[0m",
            StepStatus::Fail => "\x1b[31m✗\x1b[0m",
            StepStatus::Skipped => "\x1b[33m-\x1b[0m",
        };
        info!(
            "  {}. {} {} ({} ms)",
            i + 1,
            mark,
            result.name,
            result.duration_ms
        );
        if result.is_fail() {
            let reason = result
                .detail
                .as_deref()
                .or(result.message.as_deref())
                .unwrap_or_default();
            error!("     \x1b[31mError: {}\x1b[0m", reason);
        }

        if verbose {
            if let (Some(method), Some(url)) = (&result.request_method, &result.request_url) {
                debug!("     Request: {} {}", method, url);
            }
            if let Some(body) = &result.request_body {
                debug!("     Request body: {}", truncate(body, 500));
            }
            if let Some(code) = result.http_status_code {
                debug!("     Response: Status {}", code);
            }
            if let Some(body) = &result.response_body {
                debug!("     Response body: {}", truncate(body, 500));
            }
        }
    }
    success
}

fn load_config(args: &Cli) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(base_url) = &args.base_url {
        config.base_url = Some(base_url.clone());
    }
    if let Some(timeout) = args.timeout {
        config.http_timeout_secs = timeout;
    }
    if let Some(run_timeout) = args.run_timeout {
        config.run_timeout_secs = Some(run_timeout);
    }
    Ok(config)
}

fn build_history(args: &Cli) -> Result<Option<Arc<dyn HistorySink>>> {
    let mut sinks: Vec<Arc<dyn HistorySink>> = Vec::new();
    if let Some(dir) = &args.report_dir {
        sinks.push(Arc::new(ReportDirHistory::new(dir, args.report_format)));
    }
    if let (Some(url), Some(key)) = (&args.history_api_url, &args.history_api_key) {
        sinks.push(Arc::new(HistoryApiClient::new(url.clone(), key.clone())?));
    }
    Ok(match sinks.len() {
        0 => None,
        1 => sinks.pop(),
        _ => Some(Arc::new(FanoutHistory::new(sinks))),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.verbose);

    if !args.catalog.exists() {
        return Err(anyhow!("Path does not exist: {}", args.catalog.display()));
    }
    let mut loader = CatalogLoader::new();
    loader.add_path(&args.catalog);
    let catalog = loader
        .load_all()
        .context(format!("Failed to load catalog: {}", args.catalog.display()))?;

    let store = Arc::new(InMemoryStore::new(catalog));
    let ids = if args.scenarios.is_empty() {
        store.scenario_ids()
    } else {
        args.scenarios.clone()
    };
    if ids.is_empty() {
        return Err(anyhow!("No scenarios found"));
    }

    let config = load_config(&args)?;
    let mut builder = ScenarioEngine::builder()
        .store(store.clone())
        .config(config);
    if let Some(history) = build_history(&args)? {
        builder = builder.history(history);
    }
    let engine = builder.build()?;

    let log_observer = LogObserver;
    let observer: Option<&dyn ProgressObserver> = if args.events {
        Some(&log_observer)
    } else {
        None
    };

    let total_start = Instant::now();
    let mut passed = 0;
    let mut failed = 0;
    info!("Running {} scenario(s)...", ids.len());

    for (idx, id) in ids.iter().enumerate() {
        let name = store
            .catalog()
            .scenarios
            .iter()
            .find(|s| s.id == *id)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| format!("#{id}"));
        info!("Scenario {}/{}: {}", idx + 1, ids.len(), name);

        let start = Instant::now();
        match engine.execute_scenario(*id, &args.env, observer).await {
            Ok(results) => {
                if print_results(&name, &results, start.elapsed().as_millis(), args.verbose) {
                    passed += 1;
                } else {
                    failed += 1;
                }
            }
            Err(e) => {
                error!("\x1b[31mScenario execution error: {} - {}\x1b[0m", name, e);
                failed += 1;
            }
        }
    }

    info!(
        "Summary:\n  Total: {}\n  \x1b[32mPassed: {}\x1b[0m\n  \x1b[31mFailed: {}\x1b[0m\n  Duration: {} ms",
        passed + failed,
        passed,
        failed,
        total_start.elapsed().as_millis()
    );

    if failed > 0 {
        exit(1);
    }

    Ok(())
}
