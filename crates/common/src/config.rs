//! Configuration structures for SliceLoop
//!
//! This module defines the configuration used by the worker and the coordinator.
//! Configurations are loaded from YAML files and can be overridden by environment
//! variables prefixed with `SLICELOOP__`.

use crate::error::{Result, SliceLoopError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration for SliceLoop components
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SliceLoopConfig {
    /// Worker-specific configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Coordinator-specific configuration
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Execution provider preference for the inference session
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderPreference {
    /// Plain CPU execution
    #[default]
    Cpu,

    /// GPU-backed provider when available, CPU otherwise
    Accelerated,
}

impl ProviderPreference {
    /// Preference derived from the `accelerated` label of a job
    pub fn from_flag(accelerated: bool) -> Self {
        if accelerated {
            ProviderPreference::Accelerated
        } else {
            ProviderPreference::Cpu
        }
    }
}

/// Worker-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Execution provider used when a job does not ask for acceleration
    #[serde(default)]
    pub default_provider: ProviderPreference,

    /// Enable all graph optimizations when building the session
    #[serde(default = "default_graph_optimization")]
    pub graph_optimization: bool,

    /// Number of intra-op threads (0 = engine default)
    #[serde(default)]
    pub intra_threads: usize,

    /// Directory where user processing modules are written.
    /// A private temporary directory is used when unset.
    pub module_dir: Option<PathBuf>,

    /// Packages loaded into the interpreter for every slice
    #[serde(default)]
    pub base_packages: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            default_provider: ProviderPreference::Cpu,
            graph_optimization: default_graph_optimization(),
            intra_threads: 0,
            module_dir: None,
            base_packages: Vec::new(),
        }
    }
}

/// Coordinator-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Number of input files per slice
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Where collected results are written (JSON)
    pub output: Option<PathBuf>,

    /// Compute group as `joinKey,joinSecret`
    pub compute_group: Option<String>,

    /// Directory holding model artifacts served to workers
    pub artifact_dir: Option<PathBuf>,

    /// Prefix of the public job name
    #[serde(default = "default_job_name_prefix")]
    pub job_name_prefix: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            output: None,
            compute_group: None,
            artifact_dir: None,
            job_name_prefix: default_job_name_prefix(),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable Prometheus metrics
    #[serde(default = "default_metrics")]
    pub enable_metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            enable_metrics: default_metrics(),
        }
    }
}

/// Default value functions
fn default_graph_optimization() -> bool {
    true
}

fn default_batch_size() -> usize {
    1
}

fn default_job_name_prefix() -> String {
    "SliceLoop Inferencing".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics() -> bool {
    true
}

impl SliceLoopConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| SliceLoopError::Config(format!("Failed to read config file {}: {}", path.display(), e)))?;

        let config: SliceLoopConfig = serde_yaml::from_str(&content)
            .map_err(|e| SliceLoopError::Config(format!("Failed to parse config file {}: {}", path.display(), e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional YAML file layered under environment
    /// variables (`SLICELOOP__COORDINATOR__BATCH_SIZE=4`, ...)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(false),
            );
        }

        let config: SliceLoopConfig = builder
            .add_source(
                config::Environment::with_prefix("SLICELOOP")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load using the `SLICELOOP_CONFIG` path if set
    pub fn from_env() -> Result<Self> {
        match std::env::var("SLICELOOP_CONFIG") {
            Ok(path) => Self::load(Some(Path::new(&path))),
            Err(_) => Self::load(None),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.coordinator.batch_size == 0 {
            return Err(SliceLoopError::config("Batch size must be at least 1"));
        }

        if let Some(group) = &self.coordinator.compute_group {
            if !group.contains(',') {
                return Err(SliceLoopError::config(format!(
                    "Compute group must be `joinKey,joinSecret`, got {}",
                    group
                )));
            }
        }

        match self.observability.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
            other => Err(SliceLoopError::config(format!("Invalid log level: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_defaults() {
        let config = SliceLoopConfig::default();

        assert!(config.validate().is_ok());
        assert_eq!(config.coordinator.batch_size, 1);
        assert_eq!(config.worker.default_provider, ProviderPreference::Cpu);
        assert!(config.worker.graph_optimization);
    }

    #[test]
    fn test_config_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "worker:\n  default_provider: accelerated\n  base_packages: [numpy]\ncoordinator:\n  batch_size: 4\n"
        )
        .unwrap();

        let config = SliceLoopConfig::from_file(file.path()).unwrap();

        assert_eq!(config.worker.default_provider, ProviderPreference::Accelerated);
        assert_eq!(config.worker.base_packages, vec!["numpy".to_string()]);
        assert_eq!(config.coordinator.batch_size, 4);
        assert_eq!(config.observability.log_level, "info");
    }

    #[test]
    fn test_config_validation_zero_batch() {
        let mut config = SliceLoopConfig::default();
        config.coordinator.batch_size = 0;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_bad_compute_group() {
        let mut config = SliceLoopConfig::default();
        config.coordinator.compute_group = Some("only-a-key".to_string());

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_provider_from_flag() {
        assert_eq!(ProviderPreference::from_flag(true), ProviderPreference::Accelerated);
        assert_eq!(ProviderPreference::from_flag(false), ProviderPreference::Cpu);
    }
}
