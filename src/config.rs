//! Engine settings and catalog file loading.

use crate::store::Catalog;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Tunables for a [`ScenarioEngine`](crate::engine::ScenarioEngine).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Deepest allowed chain of nested SCENARIO steps, the top-level
    /// scenario included.
    pub max_nesting_depth: usize,
    /// WAIT duration when `waitMs` is unset.
    pub default_wait_ms: u64,
    /// Bound for `while` loops without `maxIterations`.
    pub default_max_iterations: u64,
    /// Wall-clock limit for a whole run.
    pub run_timeout_secs: Option<u64>,
    pub http_timeout_secs: u64,
    /// Joined with relative case URLs.
    pub base_url: Option<String>,
    /// Sent with every case request unless the case overrides them.
    pub headers: HashMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_nesting_depth: 16,
            default_wait_ms: 1000,
            default_max_iterations: 100,
            run_timeout_secs: None,
            http_timeout_secs: 30,
            base_url: None,
            headers: HashMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).context(format!(
            "Failed to read engine config: {}",
            path.display()
        ))?;
        Self::from_yaml(&content).context(format!(
            "Failed to parse engine config from {}",
            path.display()
        ))
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

/// Loads catalogs from files and directories and merges them.
#[derive(Debug, Default)]
pub struct CatalogLoader {
    pub paths: Vec<PathBuf>,
}

impl CatalogLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_path<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Load a single catalog file.
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<Catalog> {
        let path = path.as_ref();
        info!("Loading catalog from {}", path.display());

        let content = fs::read_to_string(path).context(format!(
            "Failed to read catalog file: {}",
            path.display()
        ))?;
        let catalog = Catalog::from_yaml(&content).context(format!(
            "Failed to parse YAML from {}",
            path.display()
        ))?;

        debug!(
            "Loaded {} scenario(s) and {} case(s) from {}",
            catalog.scenarios.len(),
            catalog.cases.len(),
            path.display()
        );
        Ok(catalog)
    }

    /// Load and merge every catalog file in `dir`, in file-name order.
    /// Unparseable files are skipped with a warning.
    pub fn load_dir<P: AsRef<Path>>(&self, dir: P) -> Result<Catalog> {
        let dir = dir.as_ref();
        info!("Loading catalogs from directory: {}", dir.display());

        let mut files = Vec::new();
        for entry in fs::read_dir(dir).context(format!(
            "Failed to read directory: {}",
            dir.display()
        ))? {
            let path = entry?.path();
            if path.is_file() && is_catalog_file(&path) {
                files.push(path);
            }
        }
        files.sort();

        let mut merged = Catalog::default();
        for path in files {
            match self.load_file(&path) {
                Ok(catalog) => merged
                    .merge(catalog)
                    .context(format!("Failed to merge {}", path.display()))?,
                Err(err) => {
                    warn!("Skipping {}: {:#}", path.display(), err);
                }
            }
        }

        info!(
            "Loaded {} scenario(s) from {}",
            merged.scenarios.len(),
            dir.display()
        );
        Ok(merged)
    }

    /// Load every configured path, file or directory.
    pub fn load_all(&self) -> Result<Catalog> {
        let mut merged = Catalog::default();
        for path in &self.paths {
            let catalog = if path.is_dir() {
                self.load_dir(path)?
            } else {
                self.load_file(path)?
            };
            merged.merge(catalog)?;
        }
        Ok(merged)
    }
}

/// `true` for `.yaml` / `.yml` files.
fn is_catalog_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext == "yaml" || ext == "yml")
}
