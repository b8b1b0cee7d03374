//! Configuration system for cubeflow.
//!
//! Supports TOML-based configuration with global defaults and per-datasource overrides.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CubeflowError, Result};

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CubeflowConfig {
    /// Global defaults applied to all datasources unless overridden.
    pub defaults: GlobalDefaults,

    /// Per-datasource configuration overrides (keyed by datasource name).
    #[serde(default)]
    pub datasources: HashMap<String, DatasourceConfig>,
}

/// Global default settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GlobalDefaults {
    pub compiler: CompilerConfig,
    pub orchestrator: OrchestratorConfig,
    pub refresh_keys: RefreshKeyCacheConfig,
}

/// Query compilation defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Timezone used when a query does not carry one (default: UTC).
    pub default_timezone: String,
    /// Row limit applied when the request has none (0 = no implicit limit).
    pub default_limit: u64,
}

/// Pre-aggregation build settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Concurrent builds per data source. `None` uses the driver's own budget.
    pub concurrency: Option<usize>,
    /// Attempts per partition build, including the first (default: 3).
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds (default: 200).
    pub initial_backoff_ms: u64,
    /// Upper bound on any single retry delay in milliseconds (default: 10000).
    pub max_backoff_ms: u64,
    /// Growth factor between retries (default: 2.0).
    pub backoff_multiplier: f64,
    /// Largest number of partitions a single request may expand into.
    pub max_partitions: usize,
    /// Schema that holds rollup tables.
    pub schema: String,
    /// When true, `serve` waits for a stale partition to rebuild instead of
    /// returning the previous table.
    pub wait_for_renew: bool,
}

/// Refresh-key SQL result cache.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RefreshKeyCacheConfig {
    /// How long an evaluated SQL refresh key is reused, in seconds (default: 10).
    pub ttl_secs: u64,
    /// Maximum cached keys (default: 1000).
    pub max_size: usize,
}

/// Per-datasource configuration (can override globals).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DatasourceConfig {
    pub orchestrator: Option<OrchestratorConfig>,
    pub refresh_keys: Option<RefreshKeyCacheConfig>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            default_timezone: "UTC".to_string(),
            default_limit: 10_000,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency: None,
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
            max_partitions: 10_000,
            schema: "cubeflow_pre_aggregations".to_string(),
            wait_for_renew: false,
        }
    }
}

impl Default for RefreshKeyCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 10,
            max_size: 1000,
        }
    }
}

impl OrchestratorConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl CubeflowConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| CubeflowError::Config(format!("failed to read config file: {e}")))?;
        Self::from_toml(&contents)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(toml_str)
            .map_err(|e| CubeflowError::Config(format!("failed to parse config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from default locations (env var, cwd, user config dir, or defaults).
    ///
    /// Search order:
    /// 1. `CUBEFLOW_CONFIG` environment variable
    /// 2. `./cubeflow.toml` (current directory)
    /// 3. `~/.config/cubeflow/config.toml` (user config dir)
    /// 4. Built-in defaults
    pub fn load_default() -> Self {
        if let Ok(path) = std::env::var("CUBEFLOW_CONFIG") {
            match Self::from_file(&path) {
                Ok(cfg) => {
                    tracing::info!(path = %path, "loaded config from CUBEFLOW_CONFIG");
                    return cfg;
                }
                Err(err) => {
                    tracing::warn!(path = %path, error = %err, "ignoring unreadable CUBEFLOW_CONFIG");
                }
            }
        }

        if let Ok(cfg) = Self::from_file("cubeflow.toml") {
            tracing::info!("loaded config from ./cubeflow.toml");
            return cfg;
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("cubeflow").join("config.toml");
            if let Ok(cfg) = Self::from_file(&user_config) {
                tracing::info!(path = %user_config.display(), "loaded config from user config dir");
                return cfg;
            }
        }

        tracing::debug!("no config file found, using defaults");
        Self::default()
    }

    /// Get resolved config for a specific datasource (merges global defaults).
    pub fn for_datasource(&self, name: &str) -> ResolvedDatasourceConfig {
        ResolvedDatasourceConfig::merge(&self.defaults, self.datasources.get(name))
    }

    fn validate(&self) -> Result<()> {
        let sections = std::iter::once(("defaults", Some(&self.defaults.orchestrator))).chain(
            self.datasources
                .iter()
                .map(|(name, ds)| (name.as_str(), ds.orchestrator.as_ref())),
        );
        for (name, orchestrator) in sections {
            let Some(orchestrator) = orchestrator else {
                continue;
            };
            if orchestrator.max_attempts == 0 {
                return Err(CubeflowError::Config(format!(
                    "{name}: orchestrator.max_attempts must be at least 1"
                )));
            }
            if orchestrator.concurrency == Some(0) {
                return Err(CubeflowError::Config(format!(
                    "{name}: orchestrator.concurrency must be at least 1"
                )));
            }
            if orchestrator.backoff_multiplier < 1.0 {
                return Err(CubeflowError::Config(format!(
                    "{name}: orchestrator.backoff_multiplier must be >= 1.0"
                )));
            }
        }
        Ok(())
    }
}

/// Fully resolved configuration for a datasource (no Option fields).
#[derive(Debug, Clone)]
pub struct ResolvedDatasourceConfig {
    pub orchestrator: OrchestratorConfig,
    pub refresh_keys: RefreshKeyCacheConfig,
}

impl ResolvedDatasourceConfig {
    fn merge(defaults: &GlobalDefaults, override_cfg: Option<&DatasourceConfig>) -> Self {
        match override_cfg {
            Some(ds) => Self {
                orchestrator: ds
                    .orchestrator
                    .clone()
                    .unwrap_or_else(|| defaults.orchestrator.clone()),
                refresh_keys: ds
                    .refresh_keys
                    .clone()
                    .unwrap_or_else(|| defaults.refresh_keys.clone()),
            },
            None => Self {
                orchestrator: defaults.orchestrator.clone(),
                refresh_keys: defaults.refresh_keys.clone(),
            },
        }
    }
}
