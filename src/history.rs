//! Sinks that persist execution records and per-step logs.

use crate::model::{ExecutionRecord, RecordId, RunStatus, StepExecutionLog};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Persists run records. The engine logs and ignores every error a
/// sink returns.
#[async_trait]
pub trait HistorySink: Send + Sync {
    /// Store a new RUNNING record and return its id.
    async fn create_record(&self, record: &ExecutionRecord) -> Result<RecordId>;

    async fn update_record(&self, record: &ExecutionRecord) -> Result<()>;

    async fn append_step_log(&self, log: &StepExecutionLog) -> Result<()>;
}

/// A finished run as written by [`ReportDirHistory`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub record: ExecutionRecord,
    pub steps: Vec<StepExecutionLog>,
}

#[derive(Debug, Default)]
struct MemoryState {
    records: Vec<ExecutionRecord>,
    logs: Vec<StepExecutionLog>,
}

/// Keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryHistory {
    state: Mutex<MemoryState>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.lock().records.clone()
    }

    pub fn logs(&self) -> Vec<StepExecutionLog> {
        self.lock().logs.clone()
    }

    pub fn logs_for(&self, record_id: RecordId) -> Vec<StepExecutionLog> {
        self.lock()
            .logs
            .iter()
            .filter(|log| log.record_id == record_id)
            .cloned()
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl HistorySink for MemoryHistory {
    async fn create_record(&self, record: &ExecutionRecord) -> Result<RecordId> {
        let mut state = self.lock();
        let id = state.records.len() as RecordId + 1;
        let mut stored = record.clone();
        stored.id = Some(id);
        state.records.push(stored);
        Ok(id)
    }

    async fn update_record(&self, record: &ExecutionRecord) -> Result<()> {
        let mut state = self.lock();
        let slot = state
            .records
            .iter_mut()
            .find(|r| r.id.is_some() && r.id == record.id)
            .with_context(|| format!("Unknown execution record {:?}", record.id))?;
        *slot = record.clone();
        Ok(())
    }

    async fn append_step_log(&self, log: &StepExecutionLog) -> Result<()> {
        self.lock().logs.push(log.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Json,
    Yaml,
}

/// Writes one report file per finished run into a directory.
pub struct ReportDirHistory {
    dir: PathBuf,
    format: ReportFormat,
    next_id: AtomicI64,
    pending: Mutex<HashMap<RecordId, Vec<StepExecutionLog>>>,
}

impl ReportDirHistory {
    pub fn new<P: AsRef<Path>>(dir: P, format: ReportFormat) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            format,
            next_id: AtomicI64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_report(&self, report: &RunReport) -> Result<PathBuf> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir)?;
        }

        let timestamp = Utc::now().timestamp();
        let sanitized_name = report.record.scenario_name.replace([' ', '/'], "_");
        let record_id = report.record.id.unwrap_or_default();

        let (filename, content) = match self.format {
            ReportFormat::Json => (
                format!("{sanitized_name}-{record_id}-{timestamp}.json"),
                serde_json::to_string_pretty(report)?,
            ),
            ReportFormat::Yaml => (
                format!("{sanitized_name}-{record_id}-{timestamp}.yaml"),
                serde_yaml::to_string(report)?,
            ),
        };

        let file_path = self.dir.join(filename);
        fs::write(&file_path, content)
            .with_context(|| format!("Failed to write report {}", file_path.display()))?;
        Ok(file_path)
    }
}

#[async_trait]
impl HistorySink for ReportDirHistory {
    async fn create_record(&self, _record: &ExecutionRecord) -> Result<RecordId> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, Vec::new());
        Ok(id)
    }

    async fn update_record(&self, record: &ExecutionRecord) -> Result<()> {
        if record.status == RunStatus::Running {
            return Ok(());
        }
        let record_id = record.id.context("Execution record has no id")?;
        let steps = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&record_id)
            .unwrap_or_default();
        let path = self.write_report(&RunReport {
            record: record.clone(),
            steps,
        })?;
        info!("Report saved: {}", path.display());
        Ok(())
    }

    async fn append_step_log(&self, log: &StepExecutionLog) -> Result<()> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(log.record_id)
            .or_default()
            .push(log.clone());
        Ok(())
    }
}

/// Forwards to several sinks. The first sink that accepts a record
/// assigns the id callers see; each sink keeps its own id internally.
/// A failing sink does not stop the others.
pub struct FanoutHistory {
    sinks: Vec<Arc<dyn HistorySink>>,
    ids: Mutex<HashMap<RecordId, Vec<Option<RecordId>>>>,
}

impl FanoutHistory {
    pub fn new(sinks: Vec<Arc<dyn HistorySink>>) -> Self {
        Self {
            sinks,
            ids: Mutex::new(HashMap::new()),
        }
    }

    fn sink_ids(&self, record_id: RecordId) -> Vec<Option<RecordId>> {
        self.ids
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&record_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl HistorySink for FanoutHistory {
    async fn create_record(&self, record: &ExecutionRecord) -> Result<RecordId> {
        let mut per_sink = Vec::with_capacity(self.sinks.len());
        for sink in &self.sinks {
            match sink.create_record(record).await {
                Ok(id) => per_sink.push(Some(id)),
                Err(e) => {
                    warn!("History sink failed to create record: {:#}", e);
                    per_sink.push(None);
                }
            }
        }
        let id = per_sink
            .iter()
            .flatten()
            .copied()
            .next()
            .context("No history sink accepted the record")?;
        self.ids
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, per_sink);
        Ok(id)
    }

    async fn update_record(&self, record: &ExecutionRecord) -> Result<()> {
        let record_id = record.id.context("Execution record has no id")?;
        let ids = self.sink_ids(record_id);
        for (sink, sink_id) in self.sinks.iter().zip(ids) {
            let Some(sink_id) = sink_id else { continue };
            let mut local = record.clone();
            local.id = Some(sink_id);
            if let Err(e) = sink.update_record(&local).await {
                warn!("History sink failed to update record: {:#}", e);
            }
        }
        Ok(())
    }

    async fn append_step_log(&self, log: &StepExecutionLog) -> Result<()> {
        let ids = self.sink_ids(log.record_id);
        for (sink, sink_id) in self.sinks.iter().zip(ids) {
            let Some(sink_id) = sink_id else { continue };
            let mut local = log.clone();
            local.record_id = sink_id;
            if let Err(e) = sink.append_step_log(&local).await {
                warn!("History sink failed to append step log: {:#}", e);
            }
        }
        Ok(())
    }
}
